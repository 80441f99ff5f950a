use std::collections::BTreeSet;

use chrono::Utc;
use color_eyre::eyre::eyre;
use tracing::{error, info, instrument, warn};

use super::Handlers;
use crate::chain::{Address, BatchMint, MintEntry, BATCH_MINT_OP};
use crate::queue::{HandlerError, HandlerOutcome, HandlerResult, Task};

enum Partition {
    Minted(usize),
    Empty,

    /// Another worker holds the collection's mint lease
    Busy,
}

/// A batch built under the lease, not yet submitted
struct Batch {
    mint: BatchMint,
    start: i64,
    next_index: i64,
    reward_ids: Vec<i64>,
    confirmations: Vec<Task>,
}

impl Handlers {
    /// Mints every approved reward, one batch per collection
    #[instrument(skip(self))]
    pub async fn mint_pending_rewards(&self) -> HandlerResult {
        let rewards = self.store.approved_pending_rewards(None).await?;
        if rewards.is_empty() {
            return Ok(HandlerOutcome::Skipped("no approved rewards".into()));
        }

        let collections: BTreeSet<Address> = rewards
            .iter()
            .map(|r| r.collection_address.into())
            .collect();

        let mut minted = 0;
        let mut busy = 0;
        let mut failed = 0;
        for collection in &collections {
            match self.mint_collection(*collection).await {
                Ok(Partition::Minted(n)) => minted += n,
                Ok(Partition::Empty) => {}
                Ok(Partition::Busy) => busy += 1,
                Err(e) => {
                    warn!(%collection, error = %e, "partition failed");
                    failed += 1;
                }
            }
        }

        info!(minted, busy, failed, "mint round finished");

        // leftovers are picked up by the retry
        if failed > 0 || busy > 0 {
            return Err(HandlerError::transient(eyre!(
                "{failed} failed and {busy} busy out of {} collections",
                collections.len()
            )));
        }

        Ok(HandlerOutcome::Done)
    }

    /// Mints one collection's rewards under its lease
    ///
    /// Once a batch is submitted the lease is only dropped together with the
    /// bookkeeping, so a failed write cannot hand the same rewards to another
    /// round while the lease lives.
    #[instrument(skip(self))]
    async fn mint_collection(&self, collection: Address) -> Result<Partition, HandlerError> {
        if self.store.collection(&collection.into()).await?.is_none() {
            self.queue.push(&Task::SyncCollection { address: collection }).await?;
            return Err(HandlerError::transient(eyre!("collection not tracked yet")));
        }

        let data = self.chain.collection_data(&collection).await?;
        let chain_next = i64::try_from(data.next_item_index)
            .map_err(|_| HandlerError::permanent(eyre!("next item index out of range")))?;
        let ttl = chrono::Duration::from_std(self.settlement.lease_ttl())
            .map_err(|e| HandlerError::permanent(eyre!("bad lease ttl: {e}")))?;
        let until = Utc::now().naive_utc() + ttl;

        let Some(start) = self
            .store
            .acquire_mint_lease(&collection.into(), chain_next, until)
            .await?
        else {
            return Ok(Partition::Busy);
        };

        let submitted = match self.build_batch(collection, start).await {
            Ok(Some(batch)) => self.wallet.submit(&batch.mint).await.map(|_| Some(batch)),
            Ok(None) => Ok(None),
            Err(e) => {
                self.release_quietly(collection).await;
                return Err(e);
            }
        };

        let batch = match submitted {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                self.store.release_mint_lease(&collection.into()).await?;
                return Ok(Partition::Empty);
            }
            Err(e) => {
                self.release_quietly(collection).await;
                return Err(e.into());
            }
        };

        info!(
            query_id = batch.mint.query_id,
            entries = batch.mint.entries.len(),
            start = batch.start,
            "batch mint submitted"
        );

        let marked = self
            .store
            .finish_batch(&collection.into(), &batch.reward_ids, batch.next_index)
            .await
            .map_err(|e| {
                error!(
                    error = %e,
                    rewards = ?batch.reward_ids,
                    "batch submitted but not recorded, lease kept until it expires"
                );
                e
            })?;

        for task in &batch.confirmations {
            self.queue.push(task).await?;
        }

        Ok(Partition::Minted(marked))
    }

    async fn release_quietly(&self, collection: Address) {
        if let Err(e) = self.store.release_mint_lease(&collection.into()).await {
            error!(%collection, error = %e, "could not release mint lease");
        }
    }

    /// Builds the batch for a collection's approved rewards, numbering
    /// entries from `start`
    async fn build_batch(
        &self,
        collection: Address,
        start: i64,
    ) -> Result<Option<Batch>, HandlerError> {
        // read again under the lease: another round may have minted some
        let rewards = self
            .store
            .approved_pending_rewards(Some(&collection.into()))
            .await?;
        if rewards.is_empty() {
            return Ok(None);
        }

        let first = u64::try_from(start)
            .map_err(|_| HandlerError::permanent(eyre!("negative item index {start}")))?;

        let mut entries = Vec::with_capacity(rewards.len());
        let mut confirmations = Vec::with_capacity(rewards.len());
        for (index, reward) in (first..).zip(&rewards) {
            let owner = reward.user_address.into();
            let item_address = self.chain.item_address(&collection, index).await?;

            entries.push(MintEntry {
                index,
                owner,
                content_uri: format!("{}/meta.json", reward.content_ref),
                forward_amount: self.settlement.forward_amount,
                editor: collection,
            });
            confirmations.push(Task::ConfirmSettlement {
                user_address: owner,
                item_address,
            });
        }

        let mint = BatchMint {
            collection,
            op: BATCH_MINT_OP,
            query_id: rand::random(),
            value: self.settlement.attach_amount * entries.len() as u64,
            entries,
        };

        Ok(Some(Batch {
            mint,
            start,
            next_index: start + rewards.len() as i64,
            reward_ids: rewards.iter().map(|r| r.id).collect(),
            confirmations,
        }))
    }
}
