//! Task handlers: collection and item sync, reward accrual, batch
//! settlement and settlement confirmation.

mod accrual;
mod confirm;
mod settlement;
mod sync;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::chain::{ChainClient, ChainError, MintWallet};
use crate::config::{Config, RewardsConfig, SettlementConfig};
use crate::db::{Store, StoreError};
use crate::metadata::{MetadataError, MetadataFetcher};
use crate::queue::{HandlerError, HandlerResult, QueueError, Task, TaskHandler, TaskQueue};

pub use accrual::should_trigger;

/// Runs every [`Task`] kind against the store, the chain and the wallet
pub struct Handlers {
    store: Arc<dyn Store>,
    chain: Arc<dyn ChainClient>,
    wallet: Arc<dyn MintWallet>,
    queue: Arc<dyn TaskQueue>,
    metadata: MetadataFetcher,
    rewards: RewardsConfig,
    settlement: SettlementConfig,
}

impl Handlers {
    pub fn new(
        store: Arc<dyn Store>,
        chain: Arc<dyn ChainClient>,
        wallet: Arc<dyn MintWallet>,
        queue: Arc<dyn TaskQueue>,
        metadata: MetadataFetcher,
        config: &Config,
    ) -> Self {
        Self {
            store,
            chain,
            wallet,
            queue,
            metadata,
            rewards: config.rewards.clone(),
            settlement: config.settlement.clone(),
        }
    }
}

#[async_trait]
impl TaskHandler for Handlers {
    #[instrument(skip_all, fields(kind = task.kind()))]
    async fn handle(&self, task: Task) -> HandlerResult {
        match task {
            Task::AddCollection {
                address,
                default_weight,
            } => self.sync_collection(address, Some(default_weight)).await,
            Task::SyncCollection { address } => self.sync_collection(address, None).await,
            Task::SyncItem { collection, index } => self.sync_item(collection, index).await,
            Task::RecordMessage {
                telegram_user_id,
                chat_id,
                message_id,
            } => {
                self.record_message(telegram_user_id, chat_id, message_id)
                    .await
            }
            Task::EvaluateUser { user_id } => self.evaluate_user(user_id).await,
            Task::LinkedAccountReward { user_id } => self.linked_account_reward(user_id).await,
            Task::MintPendingRewards => self.mint_pending_rewards().await,
            Task::ConfirmSettlement {
                user_address,
                item_address,
            } => self.confirm_settlement(user_address, item_address).await,
        }
    }
}

// collaborators failing is never final: the queue retries with backoff

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        Self::transient(err)
    }
}

impl From<ChainError> for HandlerError {
    fn from(err: ChainError) -> Self {
        Self::transient(err)
    }
}

impl From<QueueError> for HandlerError {
    fn from(err: QueueError) -> Self {
        Self::transient(err)
    }
}

impl From<MetadataError> for HandlerError {
    fn from(err: MetadataError) -> Self {
        Self::transient(err)
    }
}
