use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre::Result;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::trace;
use url::Url;

use super::{
    boc, Address, BlockId, ChainClient, ChainError, CollectionData, Content, ItemData, Message,
    Transaction, TransactionPage,
};
use crate::config::ChainConfig;

/// Chain client backed by an indexed HTTP API (toncenter v3 layout)
///
/// Every request carries its own timeout, so a single slow endpoint can
/// not hold a handler past its budget.
#[derive(Debug, Clone)]
pub struct TonCenterClient {
    http: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    poll_interval: Duration,
}

impl TonCenterClient {
    pub fn new(config: &ChainConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key(),
            poll_interval: config.poll_interval(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, ChainError> {
        self.endpoint
            .join(path)
            .map_err(|e| ChainError::Decode(e.to_string()))
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("X-API-Key", key),
            None => req,
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ChainError> {
        let req = self.http.get(self.url(path)?).query(query);
        let resp = self.authorize(req).send().await?;
        decode(resp).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ChainError> {
        let req = self.http.post(self.url(path)?).json(body);
        let resp = self.authorize(req).send().await?;
        decode(resp).await
    }

    async fn block(&self, block: &BlockId) -> Result<RawBlock, ChainError> {
        let blocks: Blocks = self
            .get(
                "api/v3/blocks",
                &[
                    ("workchain", block.workchain.to_string()),
                    ("shard", format!("{:x}", block.shard as u64)),
                    ("seqno", block.seqno.to_string()),
                    ("limit", "1".to_owned()),
                ],
            )
            .await?;

        blocks
            .blocks
            .into_iter()
            .next()
            .ok_or_else(|| ChainError::NotFound(format!("block {block}")))
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ChainError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ChainError::Status { status, body });
    }

    Ok(resp.json().await?)
}

#[async_trait]
impl ChainClient for TonCenterClient {
    async fn masterchain_head(&self) -> Result<BlockId, ChainError> {
        let info: MasterchainInfo = self.get("api/v3/masterchainInfo", &[]).await?;
        Ok(info.last.id())
    }

    async fn wait_for_head(&self, seqno: u32) -> Result<BlockId, ChainError> {
        loop {
            let head = self.masterchain_head().await?;
            if head.seqno > seqno {
                return Ok(head);
            }

            trace!(event = "wait", seqno);
            sleep(self.poll_interval).await;
        }
    }

    async fn shards(&self, master: &BlockId) -> Result<Vec<BlockId>, ChainError> {
        let state: ShardState = self
            .get(
                "api/v3/masterchainBlockShardState",
                &[("seqno", master.seqno.to_string())],
            )
            .await?;

        Ok(state
            .shards
            .iter()
            .filter(|b| b.workchain != master.workchain)
            .map(RawBlock::id)
            .collect())
    }

    async fn block_parents(&self, block: &BlockId) -> Result<Vec<BlockId>, ChainError> {
        let raw = self.block(block).await?;
        Ok(raw.prev_blocks.iter().map(RawBlockRef::id).collect())
    }

    async fn block_transactions(
        &self,
        block: &BlockId,
        limit: u32,
        offset: u32,
    ) -> Result<TransactionPage, ChainError> {
        let page: Transactions = self
            .get(
                "api/v3/transactions",
                &[
                    ("workchain", block.workchain.to_string()),
                    ("shard", format!("{:x}", block.shard as u64)),
                    ("seqno", block.seqno.to_string()),
                    ("limit", limit.to_string()),
                    ("offset", offset.to_string()),
                    ("sort", "asc".to_owned()),
                ],
            )
            .await?;

        let more = page.transactions.len() as u32 >= limit;
        let transactions = page
            .transactions
            .into_iter()
            .map(RawTransaction::try_into_transaction)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TransactionPage { transactions, more })
    }

    async fn collection_data(&self, collection: &Address) -> Result<CollectionData, ChainError> {
        let resp: NftCollections = self
            .get(
                "api/v3/nft/collections",
                &[
                    ("collection_address", collection.to_string()),
                    ("limit", "1".to_owned()),
                ],
            )
            .await?;

        let raw = resp
            .nft_collections
            .into_iter()
            .next()
            .ok_or_else(|| ChainError::NotFound(format!("collection {collection}")))?;

        Ok(CollectionData {
            owner: raw.owner_address.as_deref().and_then(parse_opt),
            next_item_index: raw.next_item_index,
            content: raw.collection_content.as_ref().and_then(content_from_json),
        })
    }

    async fn item_address(&self, collection: &Address, index: u64) -> Result<Address, ChainError> {
        const METHOD: &str = "get_nft_address_by_index";

        let body = json!({
            "address": collection.to_string(),
            "method": METHOD,
            "stack": [{ "type": "num", "value": format!("{index:#x}") }],
        });
        let resp: RunGetMethod = self.post("api/v3/runGetMethod", &body).await?;

        if resp.exit_code != 0 {
            return Err(ChainError::ExitCode {
                method: METHOD.to_owned(),
                code: resp.exit_code,
            });
        }

        let boc = resp
            .stack
            .first()
            .and_then(|entry| entry.value.as_str())
            .ok_or_else(|| ChainError::Decode(format!("{METHOD}: empty stack")))?;

        boc::parse_address(boc)?
            .ok_or_else(|| ChainError::NotFound(format!("item {index} of {collection}")))
    }

    async fn item_data(&self, item: &Address) -> Result<Option<ItemData>, ChainError> {
        let resp: NftItems = self
            .get(
                "api/v3/nft/items",
                &[("address", item.to_string()), ("limit", "1".to_owned())],
            )
            .await?;

        let Some(raw) = resp.nft_items.into_iter().next() else {
            return Ok(None);
        };

        let collection = raw
            .collection_address
            .as_deref()
            .and_then(parse_opt)
            .ok_or_else(|| ChainError::Decode(format!("item {item} has no collection")))?;

        Ok(Some(ItemData {
            initialized: raw.init,
            index: raw.index,
            collection,
            owner: raw.owner_address.as_deref().and_then(parse_opt),
            content: raw.content.as_ref().and_then(content_from_json),
        }))
    }
}

/// Unparseable addresses (external messages, `addr_none`) are simply absent
fn parse_opt(s: &str) -> Option<Address> {
    s.parse().ok()
}

fn content_from_json(value: &Value) -> Option<Content> {
    let obj = value.as_object()?;
    let field = |k: &str| obj.get(k).and_then(Value::as_str).map(str::to_owned);

    match field("uri") {
        Some(uri) if obj.contains_key("name") || obj.contains_key("image") => {
            Some(Content::Semichain { uri })
        }
        Some(uri) => Some(Content::Offchain { uri }),
        None if obj.is_empty() => None,
        None => Some(Content::Onchain {
            name: field("name"),
            description: field("description"),
            image: field("image"),
        }),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrStr {
    Num(i64),
    Str(String),
}

fn de_u64<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    match NumOrStr::deserialize(d)? {
        NumOrStr::Num(n) => u64::try_from(n).map_err(serde::de::Error::custom),
        NumOrStr::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Shard ids show up either as signed decimals or as unsigned hex strings
fn de_shard<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match NumOrStr::deserialize(d)? {
        NumOrStr::Num(n) => Ok(n),
        NumOrStr::Str(s) if s.starts_with('-') => s.parse().map_err(serde::de::Error::custom),
        NumOrStr::Str(s) => u64::from_str_radix(s.trim_start_matches("0x"), 16)
            .map(|v| v as i64)
            .map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
struct MasterchainInfo {
    last: RawBlock,
}

#[derive(Deserialize)]
struct RawBlockRef {
    workchain: i32,
    #[serde(deserialize_with = "de_shard")]
    shard: i64,
    seqno: u32,
}

impl RawBlockRef {
    fn id(&self) -> BlockId {
        BlockId {
            workchain: self.workchain,
            shard: self.shard,
            seqno: self.seqno,
        }
    }
}

#[derive(Deserialize)]
struct RawBlock {
    workchain: i32,
    #[serde(deserialize_with = "de_shard")]
    shard: i64,
    seqno: u32,
    #[serde(default)]
    prev_blocks: Vec<RawBlockRef>,
}

impl RawBlock {
    fn id(&self) -> BlockId {
        BlockId {
            workchain: self.workchain,
            shard: self.shard,
            seqno: self.seqno,
        }
    }
}

#[derive(Deserialize)]
struct Blocks {
    blocks: Vec<RawBlock>,
}

#[derive(Deserialize)]
struct ShardState {
    shards: Vec<RawBlock>,
}

#[derive(Deserialize)]
struct RawMessage {
    source: Option<String>,
    destination: Option<String>,
}

impl From<RawMessage> for Message {
    fn from(raw: RawMessage) -> Self {
        Self {
            source: raw.source.as_deref().and_then(parse_opt),
            destination: raw.destination.as_deref().and_then(parse_opt),
        }
    }
}

#[derive(Deserialize)]
struct RawTransaction {
    account: String,
    hash: String,
    #[serde(deserialize_with = "de_u64")]
    lt: u64,
    in_msg: Option<RawMessage>,
    #[serde(default)]
    out_msgs: Vec<RawMessage>,
}

impl RawTransaction {
    fn try_into_transaction(self) -> Result<Transaction, ChainError> {
        let account = self
            .account
            .parse()
            .map_err(|e: super::AddressError| ChainError::Decode(e.to_string()))?;

        Ok(Transaction {
            account,
            lt: self.lt,
            hash: self.hash,
            in_msg: self.in_msg.map(Into::into),
            out_msgs: self.out_msgs.into_iter().map(Into::into).collect(),
        })
    }
}

#[derive(Deserialize)]
struct Transactions {
    transactions: Vec<RawTransaction>,
}

#[derive(Deserialize)]
struct RawCollection {
    owner_address: Option<String>,
    #[serde(deserialize_with = "de_u64")]
    next_item_index: u64,
    collection_content: Option<Value>,
}

#[derive(Deserialize)]
struct NftCollections {
    nft_collections: Vec<RawCollection>,
}

#[derive(Deserialize)]
struct RawItem {
    #[serde(default)]
    init: bool,
    #[serde(deserialize_with = "de_u64")]
    index: u64,
    collection_address: Option<String>,
    owner_address: Option<String>,
    content: Option<Value>,
}

#[derive(Deserialize)]
struct NftItems {
    nft_items: Vec<RawItem>,
}

#[derive(Deserialize)]
struct StackEntry {
    value: Value,
}

#[derive(Deserialize)]
struct RunGetMethod {
    exit_code: i64,
    stack: Vec<StackEntry>,
}
