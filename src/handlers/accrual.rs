use std::time::Duration;

use chrono::{NaiveDateTime, Utc};
use color_eyre::eyre::Result;
use tracing::{debug, info, instrument};

use super::Handlers;
use crate::db::models::{Backlog, NewActivityMessage, NewPendingReward, PendingReward, User};
use crate::db::StoreError;
use crate::queue::{EnqueueOutcome, HandlerError, HandlerOutcome, HandlerResult, Task};

/// Whether the pending backlog is worth a mint now
///
/// Either enough rewards piled up, or the oldest one waited long enough.
pub fn should_trigger(
    backlog: &Backlog,
    threshold: i64,
    max_age: Duration,
    now: NaiveDateTime,
) -> bool {
    if backlog.count == 0 {
        return false;
    }

    let aged = backlog.oldest.is_some_and(|oldest| {
        (now - oldest)
            .to_std()
            .is_ok_and(|waited| waited >= max_age)
    });

    backlog.count >= threshold || aged
}

impl Handlers {
    /// Creates the pending rewards a user's rating now qualifies for
    #[instrument(skip(self))]
    pub async fn evaluate_user(&self, user_id: i64) -> HandlerResult {
        let Some(user) = self.store.user(user_id).await? else {
            return Ok(HandlerOutcome::Skipped("unknown user".into()));
        };

        self.accrue(&user).await
    }

    /// Records a chat message once, then re-evaluates its author
    ///
    /// A redelivered message still triggers the evaluation, since accrual
    /// itself is idempotent.
    #[instrument(skip(self))]
    pub async fn record_message(
        &self,
        telegram_user_id: i64,
        chat_id: i64,
        message_id: i64,
    ) -> HandlerResult {
        let message = NewActivityMessage {
            telegram_user_id,
            chat_id,
            message_id,
        };
        match self.store.record_message(&message).await {
            Ok(()) => {}
            Err(StoreError::DuplicateKey { .. }) => debug!("message already recorded"),
            Err(e) => return Err(e.into()),
        }

        let Some(user) = self.store.user_by_telegram_id(telegram_user_id).await? else {
            return Ok(HandlerOutcome::Skipped("no user linked to this account".into()));
        };

        self.accrue(&user).await
    }

    /// Grants the one-off reward for linking an external account
    #[instrument(skip(self))]
    pub async fn linked_account_reward(&self, user_id: i64) -> HandlerResult {
        let Some(user) = self.store.user(user_id).await? else {
            return Ok(HandlerOutcome::Skipped("unknown user".into()));
        };

        let reward = NewPendingReward {
            user_address: user.address,
            collection_address: self.rewards.collection.into(),
            content_ref: self.rewards.linked_account_content_ref.clone(),
        };
        match self.store.insert_pending_reward(&reward).await {
            Ok(id) => info!(id, "linked account reward created"),
            Err(StoreError::DuplicateKey { .. }) => debug!("linked account reward exists"),
            Err(e) => return Err(e.into()),
        }

        self.maybe_trigger_settlement().await?;
        Ok(HandlerOutcome::Done)
    }

    /// Marks a pending reward as accepted by its user
    #[instrument(skip(self))]
    pub async fn approve_reward(&self, id: i64) -> Result<PendingReward> {
        let reward = self.store.approve_pending_reward(id).await?;
        self.maybe_trigger_settlement().await?;
        Ok(reward)
    }

    /// Queues a re-evaluation of a user whose rating changed
    pub async fn request_evaluation(&self, user_id: i64) -> Result<EnqueueOutcome> {
        Ok(self.queue.push(&Task::EvaluateUser { user_id }).await?)
    }

    /// Queues a mint when the backlog warrants it
    pub(super) async fn maybe_trigger_settlement(&self) -> Result<bool, HandlerError> {
        let backlog = self.store.settlement_backlog().await?;
        let now = Utc::now().naive_utc();

        if !should_trigger(
            &backlog,
            self.settlement.batch_threshold,
            self.settlement.max_age(),
            now,
        ) {
            debug!(pending = backlog.count, "backlog below trigger");
            return Ok(false);
        }

        if let EnqueueOutcome::Enqueued(id) = self.queue.push(&Task::MintPendingRewards).await? {
            info!(id, pending = backlog.count, "mint requested");
        }
        Ok(true)
    }

    async fn accrue(&self, user: &User) -> HandlerResult {
        let collection = self.rewards.collection.into();
        let qualifying = self
            .store
            .qualifying_achievements(user, &collection)
            .await?;

        let mut created = 0;
        for achievement in qualifying {
            let reward = NewPendingReward {
                user_address: user.address,
                collection_address: collection,
                content_ref: achievement.content_ref,
            };
            match self.store.insert_pending_reward(&reward).await {
                Ok(id) => {
                    created += 1;
                    info!(id, user = user.id, content_ref = %reward.content_ref, "reward accrued");
                }
                Err(StoreError::DuplicateKey { .. }) => {
                    debug!(content_ref = %reward.content_ref, "reward exists")
                }
                Err(e) => return Err(e.into()),
            }
        }

        // activity is the only clock the age trigger gets
        self.maybe_trigger_settlement().await?;

        if created == 0 {
            return Ok(HandlerOutcome::Skipped("nothing new qualifies".into()));
        }
        Ok(HandlerOutcome::Done)
    }
}
