use std::collections::BTreeMap;

use serde::Serialize;

use crate::chain::{BlockId, ShardKey};

/// Highest processed sequence number of every shard
///
/// Passed into each scan cycle and handed back advanced once the cycle
/// fully succeeds. Never persisted: a restart starts again at the head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardCursor {
    seen: BTreeMap<ShardKey, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardState {
    pub workchain: i32,
    pub shard: String,
    pub seqno: u32,
}

impl ShardCursor {
    /// Starts at the given shard tops, treating them as processed
    pub fn from_shards(shards: &[BlockId]) -> Self {
        let mut cursor = Self::default();
        for block in shards {
            cursor.advance(block);
        }
        cursor
    }

    pub fn is_seen(&self, block: &BlockId) -> bool {
        self.seen
            .get(&block.key())
            .is_some_and(|seqno| block.seqno <= *seqno)
    }

    pub fn advance(&mut self, block: &BlockId) {
        let seqno = self.seen.entry(block.key()).or_insert(block.seqno);
        *seqno = (*seqno).max(block.seqno);
    }

    pub fn get(&self, key: &ShardKey) -> Option<u32> {
        self.seen.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn snapshot(&self) -> Vec<ShardState> {
        self.seen
            .iter()
            .map(|(key, seqno)| ShardState {
                workchain: key.workchain,
                shard: format!("{:x}", key.shard as u64),
                seqno: *seqno,
            })
            .collect()
    }
}
