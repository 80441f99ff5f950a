use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::chain::{
    Address, BatchMint, BlockId, ChainClient, ChainError, CollectionData, Content, ItemData,
    MintWallet, SubmitReceipt, Transaction, TransactionPage,
};
use crate::config::{self, Config};
use crate::db::memory::MemStore;
use crate::handlers::Handlers;
use crate::metadata::MetadataFetcher;
use crate::queue::memory::MemQueue;

pub fn addr(b: u8) -> Address {
    Address::new(0, [b; 32])
}

/// Items live at an address derived from their collection and index
pub fn item_addr(collection: &Address, index: u64) -> Address {
    let mut hash = *collection.hash();
    hash[..8].copy_from_slice(&index.to_be_bytes());
    hash[31] ^= 0xff;
    Address::new(collection.workchain(), hash)
}

pub fn block(shard: i64, seqno: u32) -> BlockId {
    BlockId {
        workchain: 0,
        shard,
        seqno,
    }
}

#[derive(Default)]
pub struct ChainState {
    pub head: Option<BlockId>,
    pub shards: Vec<BlockId>,
    pub parents: HashMap<BlockId, Vec<BlockId>>,
    pub transactions: HashMap<BlockId, Vec<Transaction>>,
    pub collections: HashMap<Address, CollectionData>,
    pub items: HashMap<Address, ItemData>,
}

/// Scripted chain view
#[derive(Default)]
pub struct FakeChain {
    state: Mutex<ChainState>,
    pub parent_calls: AtomicUsize,
    pub fail_transactions: AtomicBool,
}

impl FakeChain {
    pub fn modify<T>(&self, f: impl FnOnce(&mut ChainState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_head(&self, head: BlockId, shards: Vec<BlockId>) {
        self.modify(|s| {
            s.head = Some(head);
            s.shards = shards;
        })
    }

    /// Links `child` to its single parent
    pub fn link(&self, child: BlockId, parent: BlockId) {
        self.modify(|s| s.parents.entry(child).or_default().push(parent));
    }

    pub fn add_transaction(&self, block: BlockId, tx: Transaction) {
        self.modify(|s| s.transactions.entry(block).or_default().push(tx));
    }

    pub fn add_collection(&self, address: Address, next_item_index: u64, content: Option<Content>) {
        self.modify(|s| {
            s.collections.insert(
                address,
                CollectionData {
                    owner: Some(addr(0xee)),
                    next_item_index,
                    content,
                },
            )
        });
    }

    pub fn add_item(&self, collection: Address, index: u64, owner: Address, uri: &str) -> Address {
        let address = item_addr(&collection, index);
        self.modify(|s| {
            s.items.insert(
                address,
                ItemData {
                    initialized: true,
                    index,
                    collection,
                    owner: Some(owner),
                    content: Some(Content::Offchain {
                        uri: uri.to_owned(),
                    }),
                },
            )
        });
        address
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn masterchain_head(&self) -> Result<BlockId, ChainError> {
        self.modify(|s| s.head)
            .ok_or_else(|| ChainError::NotFound("masterchain head".into()))
    }

    async fn wait_for_head(&self, seqno: u32) -> Result<BlockId, ChainError> {
        loop {
            let head = self.masterchain_head().await?;
            if head.seqno > seqno {
                return Ok(head);
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }

    async fn shards(&self, _master: &BlockId) -> Result<Vec<BlockId>, ChainError> {
        Ok(self.modify(|s| s.shards.clone()))
    }

    async fn block_parents(&self, block: &BlockId) -> Result<Vec<BlockId>, ChainError> {
        self.parent_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.modify(|s| s.parents.get(block).cloned().unwrap_or_default()))
    }

    async fn block_transactions(
        &self,
        block: &BlockId,
        limit: u32,
        offset: u32,
    ) -> Result<TransactionPage, ChainError> {
        if self.fail_transactions.load(Ordering::SeqCst) {
            return Err(ChainError::Decode("scripted failure".into()));
        }

        let all = self.modify(|s| s.transactions.get(block).cloned().unwrap_or_default());
        let transactions: Vec<_> = all
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();

        Ok(TransactionPage {
            more: offset as usize + transactions.len() < all.len(),
            transactions,
        })
    }

    async fn collection_data(&self, collection: &Address) -> Result<CollectionData, ChainError> {
        self.modify(|s| s.collections.get(collection).cloned())
            .ok_or_else(|| ChainError::NotFound(collection.to_string()))
    }

    async fn item_address(&self, collection: &Address, index: u64) -> Result<Address, ChainError> {
        Ok(item_addr(collection, index))
    }

    async fn item_data(&self, item: &Address) -> Result<Option<ItemData>, ChainError> {
        Ok(self.modify(|s| s.items.get(item).cloned()))
    }
}

/// Records every submitted mint, or fails them all
#[derive(Default)]
pub struct FakeWallet {
    pub submitted: Mutex<Vec<BatchMint>>,
    pub fail: AtomicBool,
}

impl FakeWallet {
    pub fn submitted(&self) -> Vec<BatchMint> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl MintWallet for FakeWallet {
    async fn submit(&self, mint: &BatchMint) -> Result<SubmitReceipt, ChainError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChainError::Decode("wallet unavailable".into()));
        }

        self.submitted.lock().unwrap().push(mint.clone());
        Ok(SubmitReceipt {
            message_hash: Some(format!("hash{}", mint.query_id)),
        })
    }
}

/// Handlers wired to in-memory fakes
pub struct Harness {
    pub config: Config,
    pub store: Arc<MemStore>,
    pub queue: Arc<MemQueue>,
    pub chain: Arc<FakeChain>,
    pub wallet: Arc<FakeWallet>,
    pub handlers: Handlers,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config::tests::minimal())
    }

    pub fn with_config(config: Config) -> Self {
        let store = Arc::new(MemStore::default());
        let queue = Arc::new(MemQueue::default());
        let chain = Arc::new(FakeChain::default());
        let wallet = Arc::new(FakeWallet::default());
        let metadata =
            MetadataFetcher::with_timeout(std::time::Duration::from_millis(200)).unwrap();

        let handlers = Handlers::new(
            store.clone(),
            chain.clone(),
            wallet.clone(),
            queue.clone(),
            metadata,
            &config,
        );

        Self {
            config,
            store,
            queue,
            chain,
            wallet,
            handlers,
        }
    }

    /// The rewards collection configured for the handlers
    pub fn collection(&self) -> Address {
        self.config.rewards.collection
    }
}
