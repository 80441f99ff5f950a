//! Follows the chain head and turns every transaction touching a tracked
//! collection into a `sync_collection` task.
//!
//! Each masterchain block names the current top block of every shard. The
//! scanner walks shard parents back to the [`ShardCursor`], so no block is
//! skipped even when several arrive between two polls.

mod cursor;
mod filter;
mod traversal;
mod watchdog;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use color_eyre::eyre::Result;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::chain::{BlockId, ChainClient, ChainError};
use crate::config::ScannerConfig;
use crate::db::{Store, StoreError};
use crate::queue::{QueueError, Task, TaskQueue};

pub use cursor::{ShardCursor, ShardState};
pub use filter::CollectionFilter;
pub use traversal::CatchUp;
pub use watchdog::{Heartbeat, Watchdog};

#[derive(thiserror::Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("gap behind {top} deeper than {depth} blocks")]
    TraversalTooDeep { top: BlockId, depth: usize },
}

/// What one cycle went through
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub blocks: usize,
    pub transactions: usize,
    pub matched: usize,
}

/// Progress exposed over the API
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanStatus {
    pub head: Option<u32>,
    pub cycles: u64,
    pub blocks: u64,
    pub matched: u64,
    pub shards: Vec<ShardState>,
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct Scanner {
    chain: Arc<dyn ChainClient>,
    store: Arc<dyn Store>,
    queue: Arc<dyn TaskQueue>,
    config: ScannerConfig,
    heartbeat: Heartbeat,
    status: Arc<RwLock<ScanStatus>>,
}

impl Scanner {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<dyn Store>,
        queue: Arc<dyn TaskQueue>,
        config: ScannerConfig,
        heartbeat: Heartbeat,
        status: Arc<RwLock<ScanStatus>>,
    ) -> Self {
        Self {
            chain,
            store,
            queue,
            config,
            heartbeat,
            status,
        }
    }

    /// Scans until cancelled. The cursor starts at the current head
    #[instrument(name = "scanner", skip_all)]
    pub async fn run(self, cancellation_token: CancellationToken) -> Result<()> {
        let head = self.chain.masterchain_head().await?;
        let mut cursor = ShardCursor::from_shards(&self.chain.shards(&head).await?);
        let mut seqno = head.seqno;
        info!(head = seqno, shards = cursor.len(), "starting");

        loop {
            self.heartbeat.beat();

            let head = tokio::select! {
                _ = cancellation_token.cancelled() => break,
                head = self.chain.wait_for_head(seqno) => head,
            };

            let result = match head {
                Ok(head) => self.cycle(&cursor, head).await.map(|r| (head, r)),
                Err(e) => Err(e.into()),
            };

            match result {
                Ok((head, (report, next))) => {
                    cursor = next;
                    seqno = head.seqno;
                    self.record(head, &cursor, report).await;
                }
                Err(e) => {
                    warn!(error = %e, "cycle failed, cursor kept");
                    self.record_error(&e).await;
                    tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        _ = sleep(self.config.retry_delay()) => {}
                    }
                }
            }
        }

        info!("closing");
        Ok(())
    }

    /// Processes everything between `cursor` and `head`
    ///
    /// Returns the advanced cursor only when every block was handled and
    /// every match enqueued, so a failed cycle is replayed in full.
    #[instrument(skip(self, cursor), fields(head = head.seqno))]
    pub async fn cycle(
        &self,
        cursor: &ShardCursor,
        head: BlockId,
    ) -> Result<(CycleReport, ShardCursor), ScanError> {
        let shards = self.chain.shards(&head).await?;
        let catch_up = CatchUp::new(self.chain.as_ref(), self.config.max_traversal_depth);

        let mut visited = HashSet::new();
        let mut blocks = Vec::new();
        for top in &shards {
            blocks.extend(catch_up.discover(*top, cursor, &mut visited).await?);
        }

        let filter = CollectionFilter::new(
            self.store
                .tracked_collections()
                .await?
                .into_iter()
                .map(Into::into),
        );

        let mut report = CycleReport {
            blocks: blocks.len(),
            ..Default::default()
        };
        let mut matched = BTreeSet::new();
        for block in &blocks {
            let mut offset = 0;
            loop {
                let page = self
                    .chain
                    .block_transactions(block, self.config.page_size, offset)
                    .await?;
                report.transactions += page.transactions.len();
                matched.extend(filter.matches(&page.transactions));

                if !page.more || page.transactions.is_empty() {
                    break;
                }
                offset += page.transactions.len() as u32;
            }
        }

        for address in &matched {
            self.queue
                .push(&Task::SyncCollection { address: *address })
                .await?;
        }
        report.matched = matched.len();

        let mut next = cursor.clone();
        for block in blocks.iter().chain(&shards) {
            next.advance(block);
        }

        debug!(?report);
        Ok((report, next))
    }

    async fn record(&self, head: BlockId, cursor: &ShardCursor, report: CycleReport) {
        let mut status = self.status.write().await;
        status.head = Some(head.seqno);
        status.cycles += 1;
        status.blocks += report.blocks as u64;
        status.matched += report.matched as u64;
        status.shards = cursor.snapshot();
        status.last_error = None;
    }

    async fn record_error(&self, error: &ScanError) {
        self.status.write().await.last_error = Some(error.to_string());
    }
}
