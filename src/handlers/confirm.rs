use color_eyre::eyre::eyre;
use tracing::{info, instrument};

use super::Handlers;
use crate::chain::Address;
use crate::db::models::{SettleOutcome, Settlement, SettlementItem};
use crate::queue::{HandlerError, HandlerOutcome, HandlerResult};

impl Handlers {
    /// Credits a minted item to its owner, exactly once
    ///
    /// The item is read from the chain when it was not synced yet. Until it
    /// is deployed there is nothing to confirm, so the task is retried.
    #[instrument(skip(self), fields(user = %user_address, item = %item_address))]
    pub async fn confirm_settlement(
        &self,
        user_address: Address,
        item_address: Address,
    ) -> HandlerResult {
        let item = match self.store.item(&item_address.into()).await? {
            Some(item) => {
                if item.owner_address.is_some_and(|o| o.0 != user_address) {
                    return Ok(HandlerOutcome::Skipped("item owned by someone else".into()));
                }
                SettlementItem::Stored(item.id)
            }
            None => {
                let Some(data) = self.chain.item_data(&item_address).await? else {
                    return Err(HandlerError::transient(eyre!("item not deployed yet")));
                };
                if !data.initialized {
                    return Err(HandlerError::transient(eyre!("item not initialized yet")));
                }
                if data.owner != Some(user_address) {
                    return Ok(HandlerOutcome::Skipped("item owned by someone else".into()));
                }

                let Some(collection) = self.store.collection(&data.collection.into()).await? else {
                    return Ok(HandlerOutcome::Skipped("collection not tracked".into()));
                };
                SettlementItem::New(self.new_item(&collection, item_address, &data).await?)
            }
        };

        let settlement = Settlement {
            user_address: user_address.into(),
            item,
        };
        match self.store.settle_reward(&settlement).await? {
            SettleOutcome::Settled {
                reward_id,
                user_id,
                rating,
            } => {
                info!(reward_id, rating, "settled");
                self.request_evaluation(user_id)
                    .await
                    .map_err(HandlerError::transient)?;
                Ok(HandlerOutcome::Done)
            }
            SettleOutcome::AlreadySettled => Ok(HandlerOutcome::Skipped("already settled".into())),
            SettleOutcome::UnknownUser => Ok(HandlerOutcome::Skipped("unknown user".into())),
        }
    }
}
