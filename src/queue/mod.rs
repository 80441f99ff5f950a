//! Durable, priority-ordered, at-least-once task queue.
//!
//! Producers only see [`TaskQueue`]. The [`WorkerPool`] drives a [`Broker`]
//! and hands decoded tasks to a [`TaskHandler`], retrying transient failures
//! with exponential backoff.

#[cfg(test)]
pub mod memory;
mod pg;
mod worker;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chain::Address;
use crate::db::StoreError;

pub use pg::PgQueue;
pub use worker::{weighted_order, WorkerPool};

/// Dedupe key shared by every mint trigger
pub const MINT_DEDUPE_ID: &str = "MINT_STORED_REWARDS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    Urgent,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::Urgent,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn as_i16(self) -> i16 {
        match self {
            Self::Critical => 0,
            Self::Urgent => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_i16() == value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::Urgent => "urgent",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

/// Every unit of work the workers know how to run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Task {
    AddCollection {
        address: Address,
        default_weight: i32,
    },
    SyncCollection {
        address: Address,
    },
    SyncItem {
        collection: Address,
        index: u64,
    },
    RecordMessage {
        telegram_user_id: i64,
        chat_id: i64,
        message_id: i64,
    },
    EvaluateUser {
        user_id: i64,
    },
    LinkedAccountReward {
        user_id: i64,
    },
    MintPendingRewards,
    ConfirmSettlement {
        user_address: Address,
        item_address: Address,
    },
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddCollection { .. } => "add_collection",
            Self::SyncCollection { .. } => "sync_collection",
            Self::SyncItem { .. } => "sync_item",
            Self::RecordMessage { .. } => "record_message",
            Self::EvaluateUser { .. } => "evaluate_user",
            Self::LinkedAccountReward { .. } => "linked_account_reward",
            Self::MintPendingRewards => "mint_pending_rewards",
            Self::ConfirmSettlement { .. } => "confirm_settlement",
        }
    }

    /// Queue parameters each kind is normally enqueued with
    pub fn options(&self) -> EnqueueOptions {
        const MINUTE: Duration = Duration::from_secs(60);

        let base = EnqueueOptions {
            priority: Priority::Urgent,
            delay: Duration::from_secs(5),
            max_retry: 5,
            retention: 10 * MINUTE,
            dedupe_id: None,
        };

        match self {
            Self::AddCollection { address, .. } => base.dedupe(format!("add:{address}")),
            Self::SyncCollection { address } => EnqueueOptions {
                retention: MINUTE,
                ..base.dedupe(address.to_string())
            },
            Self::SyncItem { collection, index } => base.dedupe(format!("item:{collection}:{index}")),
            Self::RecordMessage {
                chat_id,
                message_id,
                ..
            } => EnqueueOptions {
                priority: Priority::Normal,
                ..base.dedupe(format!("msg:{chat_id}:{message_id}"))
            },
            Self::EvaluateUser { .. } => EnqueueOptions {
                priority: Priority::Normal,
                ..base
            },
            Self::LinkedAccountReward { user_id } => base.dedupe(format!("reward_auth:{user_id}")),
            Self::MintPendingRewards => EnqueueOptions {
                max_retry: 10,
                retention: Duration::from_secs(30),
                ..base.dedupe(MINT_DEDUPE_ID.to_owned())
            },
            Self::ConfirmSettlement {
                user_address,
                item_address,
            } => EnqueueOptions {
                delay: Duration::from_secs(20),
                max_retry: 10,
                retention: 24 * 60 * MINUTE,
                ..base.dedupe(format!("{item_address}:{user_address}"))
            },
        }
    }

    /// Splits the task into its stored kind and payload
    pub fn encode(&self) -> Result<(String, Option<Value>), serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        let payload = value.as_object_mut().and_then(|o| o.remove("payload"));
        Ok((self.kind().to_owned(), payload))
    }

    pub fn decode(kind: &str, payload: Option<Value>) -> Result<Self, serde_json::Error> {
        let mut object = serde_json::Map::new();
        object.insert("kind".to_owned(), Value::String(kind.to_owned()));
        if let Some(payload) = payload.filter(|p| !p.is_null()) {
            object.insert("payload".to_owned(), payload);
        }
        serde_json::from_value(Value::Object(object))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub priority: Priority,

    /// Earliest execution, relative to now
    pub delay: Duration,
    pub max_retry: u32,

    /// How long the finished task (and its dedupe key) is kept
    pub retention: Duration,
    pub dedupe_id: Option<String>,
}

impl EnqueueOptions {
    pub fn dedupe(self, id: String) -> Self {
        Self {
            dedupe_id: Some(id),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(i64),

    /// A task with the same dedupe key is queued, running or retained
    Duplicate,
}

#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("could not encode task: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<diesel::result::Error> for QueueError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Store(err.into())
    }
}

/// Producer side of the queue
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: &Task, opts: EnqueueOptions)
        -> Result<EnqueueOutcome, QueueError>;

    /// Enqueues with the kind's default options
    async fn push(&self, task: &Task) -> Result<EnqueueOutcome, QueueError> {
        self.enqueue(task, task.options()).await
    }
}

/// A task leased to a worker
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: i64,
    pub kind: String,
    pub payload: Option<Value>,
    pub retried: u32,
    pub max_retry: u32,
}

/// Runtime side of the queue
#[async_trait]
pub trait Broker: Send + Sync {
    /// Leases the next due task, trying priority classes in the given order
    async fn claim(&self, order: &[Priority]) -> Result<Option<ClaimedTask>, QueueError>;

    async fn complete(&self, id: i64) -> Result<(), QueueError>;

    /// Puts the task back, due after `delay`
    async fn retry(&self, id: i64, delay: Duration, error: &str) -> Result<(), QueueError>;

    /// Gives up on the task for good
    async fn archive(&self, id: i64, error: &str) -> Result<(), QueueError>;

    /// Returns leases older than `older_than` to the pending set
    async fn recover_stale(&self, older_than: Duration) -> Result<usize, QueueError>;

    /// Drops finished tasks whose retention elapsed
    async fn purge_expired(&self) -> Result<usize, QueueError>;

    /// Pending tasks per priority class
    async fn depth(&self) -> Result<Vec<(Priority, i64)>, QueueError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Done,

    /// Nothing to do. Duplicate deliveries end up here
    Skipped(String),
}

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    /// Will never succeed. The task is archived without retrying
    #[error("permanent: {0}")]
    Permanent(color_eyre::Report),

    /// Worth another attempt after backoff
    #[error("transient: {0}")]
    Transient(color_eyre::Report),
}

impl HandlerError {
    pub fn permanent(err: impl Into<color_eyre::Report>) -> Self {
        Self::Permanent(err.into())
    }

    pub fn transient(err: impl Into<color_eyre::Report>) -> Self {
        Self::Transient(err.into())
    }
}

pub type HandlerResult = std::result::Result<HandlerOutcome, HandlerError>;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> HandlerResult;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn addr(b: u8) -> Address {
        Address::new(0, [b; 32])
    }

    #[test]
    fn unit_task_has_no_payload() {
        let (kind, payload) = Task::MintPendingRewards.encode().unwrap();
        assert_eq!(kind, "mint_pending_rewards");
        assert_eq!(payload, None);

        assert_eq!(
            Task::decode(&kind, Some(Value::Null)).unwrap(),
            Task::MintPendingRewards
        );
    }

    #[test]
    fn struct_task_payload() {
        let task = Task::SyncItem {
            collection: addr(1),
            index: 7,
        };
        let (kind, payload) = task.encode().unwrap();

        assert_eq!(kind, "sync_item");
        assert_eq!(
            payload,
            Some(json!({"collection": addr(1).to_string(), "index": 7}))
        );
        assert_eq!(Task::decode(&kind, payload).unwrap(), task);
    }

    #[test]
    fn malformed_payload_is_rejected() {
        assert!(Task::decode("sync_item", Some(json!({"index": "x"}))).is_err());
        assert!(Task::decode("no_such_kind", None).is_err());
    }

    #[test]
    fn default_options() {
        let sync = Task::SyncCollection { address: addr(2) }.options();
        assert_eq!(sync.priority, Priority::Urgent);
        assert_eq!(sync.retention, Duration::from_secs(60));
        assert_eq!(sync.dedupe_id, Some(addr(2).to_string()));

        let mint = Task::MintPendingRewards.options();
        assert_eq!(mint.max_retry, 10);
        assert_eq!(mint.dedupe_id.as_deref(), Some(MINT_DEDUPE_ID));

        let confirm = Task::ConfirmSettlement {
            user_address: addr(3),
            item_address: addr(4),
        }
        .options();
        assert_eq!(confirm.delay, Duration::from_secs(20));
        assert_eq!(confirm.retention, Duration::from_secs(24 * 3600));
        assert_eq!(
            confirm.dedupe_id,
            Some(format!("{}:{}", addr(4), addr(3)))
        );

        let evaluate = Task::EvaluateUser { user_id: 1 }.options();
        assert_eq!(evaluate.priority, Priority::Normal);
        assert_eq!(evaluate.dedupe_id, None);
    }

    #[test]
    fn priority_storage_values() {
        for p in Priority::ALL {
            assert_eq!(Priority::from_i16(p.as_i16()), Some(p));
        }
        assert_eq!(Priority::from_i16(9), None);
    }
}
