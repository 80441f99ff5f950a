use color_eyre::eyre::eyre;
use tracing::{debug, info, instrument};

use super::Handlers;
use crate::chain::{Address, Content, ItemData};
use crate::db::models::{Collection, NewCollection, NewItem};
use crate::db::StoreError;
use crate::metadata::{content_ref, Metadata};
use crate::queue::{EnqueueOutcome, HandlerError, HandlerOutcome, HandlerResult, Task};

impl Handlers {
    /// Refreshes a collection from the chain and fans out one sync per item
    ///
    /// `default_weight` is only given when the collection is first
    /// registered. Re-syncs keep whatever weight is stored.
    #[instrument(skip(self), fields(%address))]
    pub async fn sync_collection(
        &self,
        address: Address,
        default_weight: Option<i32>,
    ) -> HandlerResult {
        let data = self.chain.collection_data(&address).await?;
        let meta = self.resolve(data.content.as_ref()).await?;
        let next_item_index = i64::try_from(data.next_item_index)
            .map_err(|_| HandlerError::permanent(eyre!("next item index out of range")))?;

        self.store
            .upsert_collection(&NewCollection {
                address: address.into(),
                owner_address: data.owner.map(Into::into),
                next_item_index,
                content_uri: data.content.as_ref().and_then(Content::uri).map(str::to_owned),
                name: meta.name,
                description: meta.description,
                image: meta.image,
                content_json: meta.body,
                default_weight,
            })
            .await?;

        let mut enqueued = 0;
        for index in 0..data.next_item_index {
            let task = Task::SyncItem {
                collection: address,
                index,
            };
            if let EnqueueOutcome::Enqueued(_) = self.queue.push(&task).await? {
                enqueued += 1;
            }
        }

        info!(items = data.next_item_index, enqueued, "collection synced");
        Ok(HandlerOutcome::Done)
    }

    /// Stores a single item and asks for its owner's settlement to be confirmed
    #[instrument(skip(self), fields(%collection))]
    pub async fn sync_item(&self, collection: Address, index: u64) -> HandlerResult {
        let address = self.chain.item_address(&collection, index).await?;

        let Some(data) = self.chain.item_data(&address).await? else {
            return Ok(HandlerOutcome::Skipped("item not deployed".into()));
        };
        if !data.initialized {
            return Ok(HandlerOutcome::Skipped("item not initialized".into()));
        }

        if self.store.item(&address.into()).await?.is_some() {
            debug!(%address, "already synced");
        } else {
            let Some(stored) = self.store.collection(&collection.into()).await? else {
                return Ok(HandlerOutcome::Skipped("collection not tracked".into()));
            };

            let new = self.new_item(&stored, address, &data).await?;
            match self.store.insert_item(&new).await {
                Ok(item) => info!(id = item.id, %address, weight = item.weight, "item stored"),
                Err(StoreError::DuplicateKey { .. }) => debug!(%address, "already synced"),
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(owner) = data.owner {
            self.queue
                .push(&Task::ConfirmSettlement {
                    user_address: owner,
                    item_address: address,
                })
                .await?;
        }

        Ok(HandlerOutcome::Done)
    }

    /// Item row as it would be stored, with metadata and weight resolved
    pub(super) async fn new_item(
        &self,
        collection: &Collection,
        address: Address,
        data: &ItemData,
    ) -> Result<NewItem, HandlerError> {
        let meta = self.resolve(data.content.as_ref()).await?;
        let content_uri = data.content.as_ref().and_then(Content::uri).map(str::to_owned);
        let key = content_uri
            .as_deref()
            .and_then(|uri| content_ref(uri, &self.rewards.platform_domain));

        let weight = match &key {
            Some(key) => self
                .store
                .achievement_weight(key)
                .await?
                .filter(|w| *w != 0)
                .unwrap_or(collection.default_weight),
            None => collection.default_weight,
        };

        Ok(NewItem {
            address: address.into(),
            collection_id: collection.id,
            index: i64::try_from(data.index)
                .map_err(|_| HandlerError::permanent(eyre!("item index out of range")))?,
            owner_address: data.owner.map(Into::into),
            content_uri,
            content_ref: key,
            name: meta.name,
            description: meta.description,
            image: meta.image,
            content_json: meta.body,
            weight,
        })
    }

    async fn resolve(&self, content: Option<&Content>) -> Result<Metadata, HandlerError> {
        match content {
            Some(Content::Onchain {
                name,
                description,
                image,
            }) => Ok(Metadata {
                name: name.clone(),
                description: description.clone(),
                image: image.clone(),
                body: None,
            }),
            Some(Content::Offchain { uri } | Content::Semichain { uri }) => {
                Ok(self.metadata.fetch(uri).await?)
            }
            None => Ok(Metadata::default()),
        }
    }
}
