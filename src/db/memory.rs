use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};

use super::models::{
    Achievement, Backlog, Collection, Item, NewActivityMessage, NewCollection, NewItem,
    NewPendingReward, PendingReward, SettleOutcome, Settlement, SettlementItem, User,
};
use super::types::Address;
use super::{Store, StoreError, StoreResult};

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn duplicate(constraint: &str) -> StoreError {
    StoreError::DuplicateKey {
        constraint: constraint.to_owned(),
    }
}

#[derive(Default)]
pub struct MemState {
    pub users: Vec<User>,
    pub collections: Vec<Collection>,
    pub items: Vec<Item>,
    pub achievements: Vec<Achievement>,
    pub pending: Vec<PendingReward>,
    pub settled: Vec<(i64, i64)>,
    pub messages: Vec<(i64, i64)>,
}

/// Store backed by plain vectors, with the same uniqueness rules as the schema
#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemState>,

    /// Fails the next [`Store::finish_batch`]
    pub fail_finish: AtomicBool,
}

impl MemStore {
    pub fn inspect<T>(&self, f: impl FnOnce(&MemState) -> T) -> T {
        f(&self.state.lock().unwrap())
    }

    pub fn modify<T>(&self, f: impl FnOnce(&mut MemState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_user(&self, address: Address, telegram_user_id: Option<i64>, rating: i64) -> User {
        self.modify(|s| {
            let user = User {
                id: s.users.len() as i64 + 1,
                address,
                telegram_user_id,
                rating,
                awards_count: 0,
                last_award_at: None,
            };
            s.users.push(user.clone());
            user
        })
    }

    pub fn set_rating(&self, user_id: i64, rating: i64) {
        self.modify(|s| {
            if let Some(user) = s.users.iter_mut().find(|u| u.id == user_id) {
                user.rating = rating;
            }
        })
    }

    pub fn add_achievement(&self, content_ref: &str, threshold: i64, weight: i32) {
        self.modify(|s| {
            let id = s.achievements.len() as i64 + 1;
            s.achievements.push(Achievement {
                id,
                content_ref: content_ref.to_owned(),
                threshold,
                weight,
            })
        })
    }

    pub fn add_collection(&self, address: Address, next_item_index: i64) -> Collection {
        self.modify(|s| {
            let collection = Collection {
                id: s.collections.len() as i64 + 1,
                address,
                owner_address: None,
                next_item_index,
                content_uri: None,
                name: None,
                description: None,
                image: None,
                default_weight: 1,
                minting_until: None,
            };
            s.collections.push(collection.clone());
            collection
        })
    }

    /// Inserts an approved pending reward
    pub fn add_approved_reward(&self, user: Address, collection: Address, content_ref: &str) {
        self.modify(|s| {
            let id = s.pending.len() as i64 + 1;
            s.pending.push(PendingReward {
                id,
                user_address: user,
                collection_address: collection,
                content_ref: content_ref.to_owned(),
                approved_by_user: true,
                processed: false,
                created_at: now(),
            })
        })
    }

    pub fn user_rating(&self, user_id: i64) -> Option<i64> {
        self.inspect(|s| s.users.iter().find(|u| u.id == user_id).map(|u| u.rating))
    }

    fn insert_item_locked(state: &mut MemState, new: &NewItem) -> Item {
        let item = Item {
            id: state.items.len() as i64 + 1,
            address: new.address,
            collection_id: new.collection_id,
            index: new.index,
            owner_address: new.owner_address,
            content_uri: new.content_uri.clone(),
            content_ref: new.content_ref.clone(),
            name: new.name.clone(),
            description: new.description.clone(),
            image: new.image.clone(),
            weight: new.weight,
            created_at: now(),
        };
        state.items.push(item.clone());
        item
    }
}

#[async_trait]
impl Store for MemStore {
    async fn tracked_collections(&self) -> StoreResult<Vec<Address>> {
        Ok(self.inspect(|s| s.collections.iter().map(|c| c.address).collect()))
    }

    async fn collection(&self, address: &Address) -> StoreResult<Option<Collection>> {
        Ok(self.inspect(|s| s.collections.iter().find(|c| c.address == *address).cloned()))
    }

    async fn upsert_collection(&self, new: &NewCollection) -> StoreResult<Collection> {
        Ok(self.modify(|s| {
            let idx = match s.collections.iter().position(|c| c.address == new.address) {
                Some(idx) => idx,
                None => {
                    s.collections.push(Collection {
                        id: s.collections.len() as i64 + 1,
                        address: new.address,
                        owner_address: None,
                        next_item_index: 0,
                        content_uri: None,
                        name: None,
                        description: None,
                        image: None,
                        default_weight: 1,
                        minting_until: None,
                    });
                    s.collections.len() - 1
                }
            };

            let c = &mut s.collections[idx];
            c.owner_address = new.owner_address;
            c.next_item_index = c.next_item_index.max(new.next_item_index);
            c.content_uri = new.content_uri.clone();
            c.name = new.name.clone();
            c.description = new.description.clone();
            c.image = new.image.clone();
            if let Some(weight) = new.default_weight {
                c.default_weight = weight;
            }
            c.clone()
        }))
    }

    async fn item(&self, address: &Address) -> StoreResult<Option<Item>> {
        Ok(self.inspect(|s| s.items.iter().find(|i| i.address == *address).cloned()))
    }

    async fn insert_item(&self, new: &NewItem) -> StoreResult<Item> {
        self.modify(|s| {
            if s.items.iter().any(|i| i.address == new.address) {
                return Err(duplicate("items_address_key"));
            }
            if s
                .items
                .iter()
                .any(|i| i.collection_id == new.collection_id && i.index == new.index)
            {
                return Err(duplicate("items_collection_id_index_key"));
            }
            Ok(Self::insert_item_locked(s, new))
        })
    }

    async fn achievement_weight(&self, content_ref: &str) -> StoreResult<Option<i32>> {
        Ok(self.inspect(|s| {
            s.achievements
                .iter()
                .find(|a| a.content_ref == content_ref)
                .map(|a| a.weight)
        }))
    }

    async fn user(&self, id: i64) -> StoreResult<Option<User>> {
        Ok(self.inspect(|s| s.users.iter().find(|u| u.id == id).cloned()))
    }

    async fn user_by_telegram_id(&self, telegram_user_id: i64) -> StoreResult<Option<User>> {
        Ok(self.inspect(|s| {
            s.users
                .iter()
                .find(|u| u.telegram_user_id == Some(telegram_user_id))
                .cloned()
        }))
    }

    async fn record_message(&self, message: &NewActivityMessage) -> StoreResult<()> {
        self.modify(|s| {
            let key = (message.chat_id, message.message_id);
            if s.messages.contains(&key) {
                return Err(duplicate("activity_messages_chat_message_key"));
            }
            s.messages.push(key);
            Ok(())
        })
    }

    async fn qualifying_achievements(
        &self,
        user: &User,
        collection: &Address,
    ) -> StoreResult<Vec<Achievement>> {
        Ok(self.inspect(|s| {
            let mut found: Vec<_> = s
                .achievements
                .iter()
                .filter(|a| a.threshold <= user.rating)
                .filter(|a| {
                    !s.items.iter().any(|i| {
                        i.owner_address == Some(user.address)
                            && i.content_ref.as_deref() == Some(a.content_ref.as_str())
                    })
                })
                .filter(|a| {
                    !s.pending.iter().any(|p| {
                        p.user_address == user.address
                            && p.collection_address == *collection
                            && p.content_ref == a.content_ref
                    })
                })
                .cloned()
                .collect();
            found.sort_by_key(|a| a.threshold);
            found
        }))
    }

    async fn insert_pending_reward(&self, new: &NewPendingReward) -> StoreResult<i64> {
        self.modify(|s| {
            let exists = s.pending.iter().any(|p| {
                p.user_address == new.user_address
                    && p.collection_address == new.collection_address
                    && p.content_ref == new.content_ref
            });
            if exists {
                return Err(duplicate("pending_rewards_intent_key"));
            }

            let id = s.pending.len() as i64 + 1;
            s.pending.push(PendingReward {
                id,
                user_address: new.user_address,
                collection_address: new.collection_address,
                content_ref: new.content_ref.clone(),
                approved_by_user: false,
                processed: false,
                created_at: now(),
            });
            Ok(id)
        })
    }

    async fn approve_pending_reward(&self, id: i64) -> StoreResult<PendingReward> {
        self.modify(|s| {
            let reward = s
                .pending
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or(StoreError::NotFound)?;
            reward.approved_by_user = true;
            Ok(reward.clone())
        })
    }

    async fn settlement_backlog(&self) -> StoreResult<Backlog> {
        Ok(self.inspect(|s| {
            let waiting = s
                .pending
                .iter()
                .filter(|p| p.approved_by_user && !p.processed);
            Backlog {
                count: waiting.clone().count() as i64,
                oldest: waiting.map(|p| p.created_at).min(),
            }
        }))
    }

    async fn approved_pending_rewards(
        &self,
        collection: Option<&Address>,
    ) -> StoreResult<Vec<PendingReward>> {
        Ok(self.inspect(|s| {
            s.pending
                .iter()
                .filter(|p| p.approved_by_user && !p.processed)
                .filter(|p| collection.map_or(true, |c| p.collection_address == *c))
                .cloned()
                .collect()
        }))
    }

    async fn acquire_mint_lease(
        &self,
        collection: &Address,
        chain_next_index: i64,
        until: NaiveDateTime,
    ) -> StoreResult<Option<i64>> {
        Ok(self.modify(|s| {
            let c = s.collections.iter_mut().find(|c| c.address == *collection)?;
            if c.minting_until.is_some_and(|t| t >= now()) {
                return None;
            }
            c.minting_until = Some(until);
            c.next_item_index = c.next_item_index.max(chain_next_index);
            Some(c.next_item_index)
        }))
    }

    async fn finish_batch(
        &self,
        collection: &Address,
        reward_ids: &[i64],
        next_index: i64,
    ) -> StoreResult<usize> {
        if self.fail_finish.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database(
                diesel::result::Error::BrokenTransactionManager,
            ));
        }

        Ok(self.modify(|s| {
            let marked = s
                .pending
                .iter_mut()
                .filter(|p| reward_ids.contains(&p.id) && !p.processed)
                .map(|p| p.processed = true)
                .count();
            if let Some(c) = s.collections.iter_mut().find(|c| c.address == *collection) {
                c.next_item_index = c.next_item_index.max(next_index);
                c.minting_until = None;
            }
            marked
        }))
    }

    async fn release_mint_lease(&self, collection: &Address) -> StoreResult<()> {
        self.modify(|s| {
            if let Some(c) = s.collections.iter_mut().find(|c| c.address == *collection) {
                c.minting_until = None;
            }
        });
        Ok(())
    }

    async fn settle_reward(&self, settlement: &Settlement) -> StoreResult<SettleOutcome> {
        self.modify(|s| {
            let Some(user_idx) = s
                .users
                .iter()
                .position(|u| u.address == settlement.user_address)
            else {
                return Ok(SettleOutcome::UnknownUser);
            };

            let item = match &settlement.item {
                SettlementItem::Stored(id) => s
                    .items
                    .iter()
                    .find(|i| i.id == *id)
                    .cloned()
                    .ok_or(StoreError::NotFound)?,
                SettlementItem::New(new) => {
                    match s.items.iter().find(|i| i.address == new.address).cloned() {
                        Some(item) => item,
                        None => Self::insert_item_locked(s, new),
                    }
                }
            };

            let user_id = s.users[user_idx].id;
            if s.settled.contains(&(user_id, item.id)) {
                return Ok(SettleOutcome::AlreadySettled);
            }
            s.settled.push((user_id, item.id));

            let user = &mut s.users[user_idx];
            user.rating += item.weight as i64;
            user.awards_count += 1;
            user.last_award_at = Some(item.created_at);

            Ok(SettleOutcome::Settled {
                reward_id: s.settled.len() as i64,
                user_id,
                rating: user.rating,
            })
        })
    }
}
