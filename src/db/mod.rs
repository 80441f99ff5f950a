#[cfg(test)]
pub mod memory;
pub mod models;
pub mod schema;
pub mod types;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use color_eyre::eyre::{eyre, Result};
use diesel::dsl::{count_star, now};
use diesel::prelude::*;
use diesel::result::DatabaseErrorKind;
use diesel::sql_types::BigInt;
use diesel::upsert::excluded;
use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::deadpool::{Object, Pool, PoolError};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use tracing::{info, instrument};

use self::models::{
    Achievement, Backlog, Collection, Item, NewActivityMessage, NewCollection, NewItem,
    NewPendingReward, NewSettledReward, PendingReward, SettleOutcome, Settlement, SettlementItem,
    User,
};
use self::schema::{
    achievements, activity_messages, collections, items, pending_rewards, settled_rewards, users,
};
use self::types::Address;
use crate::config::DbConfig;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

diesel::define_sql_function!(fn greatest(a: BigInt, b: BigInt) -> BigInt);

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write. Callers use this as the
    /// idempotency signal for repeated deliveries
    #[error("duplicate key violates {constraint}")]
    DuplicateKey { constraint: String },

    #[error("record not found")]
    NotFound,

    #[error(transparent)]
    Database(diesel::result::Error),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                Self::DuplicateKey {
                    constraint: info.constraint_name().unwrap_or("unknown").to_owned(),
                }
            }
            diesel::result::Error::NotFound => Self::NotFound,
            other => Self::Database(other),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable ledger of users, collections, items and rewards
#[async_trait]
pub trait Store: Send + Sync {
    /// Addresses the scanner watches
    async fn tracked_collections(&self) -> StoreResult<Vec<Address>>;

    async fn collection(&self, address: &Address) -> StoreResult<Option<Collection>>;

    /// Inserts or refreshes a collection. The stored next item index never goes backwards
    async fn upsert_collection(&self, new: &NewCollection) -> StoreResult<Collection>;

    async fn item(&self, address: &Address) -> StoreResult<Option<Item>>;

    /// Fails with [`StoreError::DuplicateKey`] when the item is already stored
    async fn insert_item(&self, new: &NewItem) -> StoreResult<Item>;

    async fn achievement_weight(&self, content_ref: &str) -> StoreResult<Option<i32>>;

    async fn user(&self, id: i64) -> StoreResult<Option<User>>;

    async fn user_by_telegram_id(&self, telegram_user_id: i64) -> StoreResult<Option<User>>;

    /// Fails with [`StoreError::DuplicateKey`] when the message was already recorded
    async fn record_message(&self, message: &NewActivityMessage) -> StoreResult<()>;

    /// Achievements the user's rating satisfies that are neither held as an
    /// item nor already pending for `collection`
    async fn qualifying_achievements(
        &self,
        user: &User,
        collection: &Address,
    ) -> StoreResult<Vec<Achievement>>;

    /// Fails with [`StoreError::DuplicateKey`] when the same intent is already recorded
    async fn insert_pending_reward(&self, new: &NewPendingReward) -> StoreResult<i64>;

    async fn approve_pending_reward(&self, id: i64) -> StoreResult<PendingReward>;

    async fn settlement_backlog(&self) -> StoreResult<Backlog>;

    /// Approved, unprocessed rewards, oldest first
    async fn approved_pending_rewards(
        &self,
        collection: Option<&Address>,
    ) -> StoreResult<Vec<PendingReward>>;

    /// Takes the collection's mint lease until `until`, unless someone else holds a live one.
    /// Returns the first index the caller may mint at
    async fn acquire_mint_lease(
        &self,
        collection: &Address,
        chain_next_index: i64,
        until: NaiveDateTime,
    ) -> StoreResult<Option<i64>>;

    /// Records a submitted batch in one transaction: marks `reward_ids`
    /// processed, moves the stored next index up to `next_index` and drops
    /// the lease
    async fn finish_batch(
        &self,
        collection: &Address,
        reward_ids: &[i64],
        next_index: i64,
    ) -> StoreResult<usize>;

    async fn release_mint_lease(&self, collection: &Address) -> StoreResult<()>;

    /// Records a settled reward and credits the user, atomically
    async fn settle_reward(&self, settlement: &Settlement) -> StoreResult<SettleOutcome>;
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<AsyncPgConnection>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").finish()
    }
}

impl Db {
    #[instrument(name = "db", skip_all)]
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        Self::migrate(config.url.clone()).await?;

        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.url);
        let pool = Pool::builder(manager).max_size(config.pool_size).build()?;

        info!(pool_size = config.pool_size, "connected");
        Ok(Self { pool })
    }

    async fn migrate(url: String) -> Result<()> {
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn =
                <AsyncConnectionWrapper<AsyncPgConnection> as diesel::Connection>::establish(&url)?;
            let applied = conn
                .run_pending_migrations(MIGRATIONS)
                .map_err(|e| eyre!("migrations failed: {e}"))?;
            info!(applied = applied.len(), "migrations");
            Ok(())
        })
        .await?
    }

    pub(crate) async fn conn(&self) -> StoreResult<Object<AsyncPgConnection>> {
        Ok(self.pool.get().await?)
    }

    /// Connects to `DATABASE_URL` with every table emptied.
    /// `None` when no test database is configured
    #[cfg(test)]
    pub async fn connect_test() -> Result<Option<Self>> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            return Ok(None);
        };

        let db = Self::connect(&DbConfig { url, pool_size: 4 }).await?;
        let mut conn = db.conn().await?;
        diesel::sql_query(
            "TRUNCATE users, collections, items, achievements, pending_rewards, \
             settled_rewards, activity_messages, tasks RESTART IDENTITY CASCADE",
        )
        .execute(&mut conn)
        .await?;

        Ok(Some(db))
    }
}

#[async_trait]
impl Store for Db {
    async fn tracked_collections(&self) -> StoreResult<Vec<Address>> {
        let mut conn = self.conn().await?;

        Ok(collections::table
            .select(collections::address)
            .order(collections::id)
            .load(&mut conn)
            .await?)
    }

    async fn collection(&self, address: &Address) -> StoreResult<Option<Collection>> {
        let mut conn = self.conn().await?;

        Ok(collections::table
            .filter(collections::address.eq(address))
            .select(Collection::as_select())
            .first(&mut conn)
            .await
            .optional()?)
    }

    async fn upsert_collection(&self, new: &NewCollection) -> StoreResult<Collection> {
        let mut conn = self.conn().await?;

        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                let collection = diesel::insert_into(collections::table)
                    .values(new)
                    .on_conflict(collections::address)
                    .do_update()
                    .set((
                        collections::owner_address.eq(excluded(collections::owner_address)),
                        collections::next_item_index.eq(greatest(
                            collections::next_item_index,
                            excluded(collections::next_item_index),
                        )),
                        collections::content_uri.eq(excluded(collections::content_uri)),
                        collections::name.eq(excluded(collections::name)),
                        collections::description.eq(excluded(collections::description)),
                        collections::image.eq(excluded(collections::image)),
                        collections::content_json.eq(excluded(collections::content_json)),
                        collections::updated_at.eq(now),
                    ))
                    .returning(Collection::as_returning())
                    .get_result(conn)
                    .await?;

                match new.default_weight {
                    Some(weight) if weight != collection.default_weight => {
                        Ok(diesel::update(collections::table.find(collection.id))
                            .set(collections::default_weight.eq(weight))
                            .returning(Collection::as_returning())
                            .get_result(conn)
                            .await?)
                    }
                    _ => Ok(collection),
                }
            }
            .scope_boxed()
        })
        .await
    }

    async fn item(&self, address: &Address) -> StoreResult<Option<Item>> {
        let mut conn = self.conn().await?;

        Ok(items::table
            .filter(items::address.eq(address))
            .select(Item::as_select())
            .first(&mut conn)
            .await
            .optional()?)
    }

    async fn insert_item(&self, new: &NewItem) -> StoreResult<Item> {
        let mut conn = self.conn().await?;

        Ok(diesel::insert_into(items::table)
            .values(new)
            .returning(Item::as_returning())
            .get_result(&mut conn)
            .await?)
    }

    async fn achievement_weight(&self, content_ref: &str) -> StoreResult<Option<i32>> {
        let mut conn = self.conn().await?;

        Ok(achievements::table
            .filter(achievements::content_ref.eq(content_ref))
            .select(achievements::weight)
            .first(&mut conn)
            .await
            .optional()?)
    }

    async fn user(&self, id: i64) -> StoreResult<Option<User>> {
        let mut conn = self.conn().await?;

        Ok(users::table
            .find(id)
            .select(User::as_select())
            .first(&mut conn)
            .await
            .optional()?)
    }

    async fn user_by_telegram_id(&self, telegram_user_id: i64) -> StoreResult<Option<User>> {
        let mut conn = self.conn().await?;

        Ok(users::table
            .filter(users::telegram_user_id.eq(telegram_user_id))
            .select(User::as_select())
            .first(&mut conn)
            .await
            .optional()?)
    }

    async fn record_message(&self, message: &NewActivityMessage) -> StoreResult<()> {
        let mut conn = self.conn().await?;

        diesel::insert_into(activity_messages::table)
            .values(message)
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    async fn qualifying_achievements(
        &self,
        user: &User,
        collection: &Address,
    ) -> StoreResult<Vec<Achievement>> {
        let mut conn = self.conn().await?;

        let held: Vec<Option<String>> = items::table
            .filter(items::owner_address.eq(user.address))
            .filter(items::content_ref.is_not_null())
            .select(items::content_ref)
            .load(&mut conn)
            .await?;

        let pending: Vec<String> = pending_rewards::table
            .filter(pending_rewards::user_address.eq(user.address))
            .filter(pending_rewards::collection_address.eq(collection))
            .select(pending_rewards::content_ref)
            .load(&mut conn)
            .await?;

        let taken: HashSet<String> = held.into_iter().flatten().chain(pending).collect();

        let eligible: Vec<Achievement> = achievements::table
            .filter(achievements::threshold.le(user.rating))
            .order(achievements::threshold.asc())
            .select(Achievement::as_select())
            .load(&mut conn)
            .await?;

        Ok(eligible
            .into_iter()
            .filter(|a| !taken.contains(&a.content_ref))
            .collect())
    }

    async fn insert_pending_reward(&self, new: &NewPendingReward) -> StoreResult<i64> {
        let mut conn = self.conn().await?;

        Ok(diesel::insert_into(pending_rewards::table)
            .values(new)
            .returning(pending_rewards::id)
            .get_result(&mut conn)
            .await?)
    }

    async fn approve_pending_reward(&self, id: i64) -> StoreResult<PendingReward> {
        let mut conn = self.conn().await?;

        Ok(diesel::update(pending_rewards::table.find(id))
            .set((
                pending_rewards::approved_by_user.eq(true),
                pending_rewards::updated_at.eq(now),
            ))
            .returning(PendingReward::as_returning())
            .get_result(&mut conn)
            .await?)
    }

    async fn settlement_backlog(&self) -> StoreResult<Backlog> {
        let mut conn = self.conn().await?;

        let (count, oldest) = pending_rewards::table
            .filter(pending_rewards::approved_by_user.eq(true))
            .filter(pending_rewards::processed.eq(false))
            .select((count_star(), diesel::dsl::min(pending_rewards::created_at)))
            .first::<(i64, Option<NaiveDateTime>)>(&mut conn)
            .await?;

        Ok(Backlog { count, oldest })
    }

    async fn approved_pending_rewards(
        &self,
        collection: Option<&Address>,
    ) -> StoreResult<Vec<PendingReward>> {
        let mut conn = self.conn().await?;

        let mut query = pending_rewards::table
            .filter(pending_rewards::approved_by_user.eq(true))
            .filter(pending_rewards::processed.eq(false))
            .select(PendingReward::as_select())
            .order(pending_rewards::id.asc())
            .into_boxed();

        if let Some(collection) = collection {
            query = query.filter(pending_rewards::collection_address.eq(*collection));
        }

        Ok(query.load(&mut conn).await?)
    }

    async fn acquire_mint_lease(
        &self,
        collection: &Address,
        chain_next_index: i64,
        until: NaiveDateTime,
    ) -> StoreResult<Option<i64>> {
        let mut conn = self.conn().await?;

        Ok(diesel::update(collections::table)
            .filter(collections::address.eq(collection))
            .filter(
                collections::minting_until
                    .is_null()
                    .or(collections::minting_until.lt(now.nullable())),
            )
            .set((
                collections::minting_until.eq(Some(until)),
                collections::next_item_index
                    .eq(greatest(collections::next_item_index, chain_next_index)),
                collections::updated_at.eq(now),
            ))
            .returning(collections::next_item_index)
            .get_result(&mut conn)
            .await
            .optional()?)
    }

    async fn finish_batch(
        &self,
        collection: &Address,
        reward_ids: &[i64],
        next_index: i64,
    ) -> StoreResult<usize> {
        let mut conn = self.conn().await?;

        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                let marked = diesel::update(pending_rewards::table)
                    .filter(pending_rewards::id.eq_any(reward_ids))
                    .filter(pending_rewards::processed.eq(false))
                    .set((
                        pending_rewards::processed.eq(true),
                        pending_rewards::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                diesel::update(collections::table)
                    .filter(collections::address.eq(collection))
                    .set((
                        collections::next_item_index
                            .eq(greatest(collections::next_item_index, next_index)),
                        collections::minting_until.eq(None::<NaiveDateTime>),
                        collections::updated_at.eq(now),
                    ))
                    .execute(conn)
                    .await?;

                Ok(marked)
            }
            .scope_boxed()
        })
        .await
    }

    async fn release_mint_lease(&self, collection: &Address) -> StoreResult<()> {
        let mut conn = self.conn().await?;

        diesel::update(collections::table)
            .filter(collections::address.eq(collection))
            .set((
                collections::minting_until.eq(None::<NaiveDateTime>),
                collections::updated_at.eq(now),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    async fn settle_reward(&self, settlement: &Settlement) -> StoreResult<SettleOutcome> {
        let mut conn = self.conn().await?;

        conn.transaction::<_, StoreError, _>(|conn| {
            async move {
                let user = users::table
                    .filter(users::address.eq(settlement.user_address))
                    .select(User::as_select())
                    .for_update()
                    .first(conn)
                    .await
                    .optional()?;

                let Some(user) = user else {
                    return Ok(SettleOutcome::UnknownUser);
                };

                let item = match &settlement.item {
                    SettlementItem::Stored(id) => {
                        items::table
                            .find(*id)
                            .select(Item::as_select())
                            .first(conn)
                            .await?
                    }
                    SettlementItem::New(new) => {
                        diesel::insert_into(items::table)
                            .values(new)
                            .on_conflict_do_nothing()
                            .execute(conn)
                            .await?;

                        items::table
                            .filter(items::address.eq(new.address))
                            .select(Item::as_select())
                            .first(conn)
                            .await?
                    }
                };

                let reward_id = diesel::insert_into(settled_rewards::table)
                    .values(NewSettledReward {
                        user_id: user.id,
                        item_id: item.id,
                    })
                    .on_conflict_do_nothing()
                    .returning(settled_rewards::id)
                    .get_result::<i64>(conn)
                    .await
                    .optional()?;

                let Some(reward_id) = reward_id else {
                    return Ok(SettleOutcome::AlreadySettled);
                };

                let rating = diesel::update(users::table.find(user.id))
                    .set((
                        users::rating.eq(users::rating + item.weight as i64),
                        users::awards_count.eq(users::awards_count + 1),
                        users::last_award_at.eq(Some(item.created_at)),
                        users::updated_at.eq(now),
                    ))
                    .returning(users::rating)
                    .get_result(conn)
                    .await?;

                Ok(SettleOutcome::Settled {
                    reward_id,
                    user_id: user.id,
                    rating,
                })
            }
            .scope_boxed()
        })
        .await
    }
}
