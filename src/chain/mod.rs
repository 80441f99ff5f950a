mod address;
mod boc;
mod signer;
mod toncenter;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use address::{Address, AddressError};
pub use signer::RemoteSigner;
pub use toncenter::TonCenterClient;

/// Op code of the collection's batch-mint message
pub const BATCH_MINT_OP: u32 = 2;

/// Key of a shard inside the cursor map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub workchain: i32,
    pub shard: i64,
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.workchain, self.shard)
    }
}

/// Identifies a single block of a given shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub workchain: i32,
    pub shard: i64,
    pub seqno: u32,
}

impl BlockId {
    pub fn key(&self) -> ShardKey {
        ShardKey {
            workchain: self.workchain,
            shard: self.shard,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}:{:x}:{})", self.workchain, self.shard as u64, self.seqno)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub source: Option<Address>,
    pub destination: Option<Address>,
}

impl Message {
    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.source.iter().chain(self.destination.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub account: Address,
    pub lt: u64,
    pub hash: String,
    pub in_msg: Option<Message>,
    pub out_msgs: Vec<Message>,
}

impl Transaction {
    /// Every message endpoint this transaction touches
    pub fn addresses(&self) -> impl Iterator<Item = &Address> {
        self.in_msg
            .iter()
            .chain(self.out_msgs.iter())
            .flat_map(Message::addresses)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionPage {
    pub transactions: Vec<Transaction>,
    pub more: bool,
}

/// Token or collection content, as declared on-chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    Onchain {
        name: Option<String>,
        description: Option<String>,
        image: Option<String>,
    },
    Offchain {
        uri: String,
    },
    Semichain {
        uri: String,
    },
}

impl Content {
    /// Location of the metadata document (the image for on-chain content)
    pub fn uri(&self) -> Option<&str> {
        match self {
            Self::Onchain { image, .. } => image.as_deref(),
            Self::Offchain { uri } | Self::Semichain { uri } => Some(uri),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectionData {
    pub owner: Option<Address>,
    pub next_item_index: u64,
    pub content: Option<Content>,
}

#[derive(Debug, Clone)]
pub struct ItemData {
    pub initialized: bool,
    pub index: u64,
    pub collection: Address,
    pub owner: Option<Address>,
    /// Individual content, already merged with the collection's common prefix
    pub content: Option<Content>,
}

/// One entry of a batch mint, keyed by the item index it will occupy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MintEntry {
    pub index: u64,
    pub owner: Address,
    pub content_uri: String,
    /// nanotons forwarded to the freshly deployed item
    pub forward_amount: u64,
    pub editor: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchMint {
    pub collection: Address,
    pub op: u32,
    pub query_id: u64,
    /// nanotons attached to the message sent to the collection
    pub value: u64,
    pub entries: Vec<MintEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitReceipt {
    pub message_hash: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ChainError {
    #[error(transparent)]
    Request(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("get method {method} exited with code {code}")]
    ExitCode { method: String, code: i64 },
}

/// Read-only view over the chain
///
/// Every call is eventually consistent: callers must tolerate a lagging
/// view, and must never treat an error as permanent.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn masterchain_head(&self) -> Result<BlockId, ChainError>;

    /// Blocks until a masterchain block newer than `seqno` is available
    async fn wait_for_head(&self, seqno: u32) -> Result<BlockId, ChainError>;

    /// Shard tops declared by the given masterchain block
    async fn shards(&self, master: &BlockId) -> Result<Vec<BlockId>, ChainError>;

    /// Parent pointers of a shard block. One normally, two after a merge
    async fn block_parents(&self, block: &BlockId) -> Result<Vec<BlockId>, ChainError>;

    async fn block_transactions(
        &self,
        block: &BlockId,
        limit: u32,
        offset: u32,
    ) -> Result<TransactionPage, ChainError>;

    async fn collection_data(&self, collection: &Address) -> Result<CollectionData, ChainError>;

    /// Deterministic address of the item at `index` of a collection
    async fn item_address(&self, collection: &Address, index: u64) -> Result<Address, ChainError>;

    /// `None` when nothing is deployed at `item` yet
    async fn item_data(&self, item: &Address) -> Result<Option<ItemData>, ChainError>;
}

/// Signs and broadcasts mint messages. Key material never enters this process
#[async_trait]
pub trait MintWallet: Send + Sync {
    /// Returns once the message was accepted for inclusion
    async fn submit(&self, mint: &BatchMint) -> Result<SubmitReceipt, ChainError>;
}
