use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Int4, Jsonb, Nullable, SmallInt, Text, Timestamp};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde_json::Value;
use tracing::{debug, instrument};

use super::{
    Broker, ClaimedTask, EnqueueOptions, EnqueueOutcome, Priority, QueueError, Task, TaskQueue,
};
use crate::db::schema::tasks;
use crate::db::Db;

const PENDING: &str = "pending";
const ACTIVE: &str = "active";
const COMPLETED: &str = "completed";
const ARCHIVED: &str = "archived";

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn span(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

fn after(delay: Duration) -> NaiveDateTime {
    now() + span(delay)
}

#[derive(Debug, Insertable)]
#[diesel(table_name = tasks)]
struct NewTask {
    kind: String,
    payload: Option<Value>,
    priority: i16,
    state: &'static str,
    run_at: NaiveDateTime,
    max_retry: i32,
    dedupe_id: Option<String>,
    retention_secs: i64,
}

#[derive(Debug, QueryableByName)]
struct ClaimRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Text)]
    kind: String,
    #[diesel(sql_type = Nullable<Jsonb>)]
    payload: Option<Value>,
    #[diesel(sql_type = Int4)]
    retried: i32,
    #[diesel(sql_type = Int4)]
    max_retry: i32,
}

impl From<ClaimRow> for ClaimedTask {
    fn from(row: ClaimRow) -> Self {
        Self {
            id: row.id,
            kind: row.kind,
            payload: row.payload,
            retried: row.retried.max(0) as u32,
            max_retry: row.max_retry.max(0) as u32,
        }
    }
}

const CLAIM: &str = "
    UPDATE tasks SET state = 'active', updated_at = $2
    WHERE id = (
        SELECT id FROM tasks
        WHERE state = 'pending' AND priority = $1 AND run_at <= $2
        ORDER BY run_at, id
        FOR UPDATE SKIP LOCKED
        LIMIT 1
    )
    RETURNING id, kind, payload, retried, max_retry";

const FINISH: &str = "
    UPDATE tasks SET
        state = $2,
        last_error = $3,
        retain_until = $4 + retention_secs * INTERVAL '1 second',
        updated_at = $4
    WHERE id = $1";

/// Task queue over the `tasks` table
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of workers (and
/// processes) can share the table.
#[derive(Debug, Clone)]
pub struct PgQueue {
    db: Db,
}

impl PgQueue {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn finish(&self, id: i64, state: &str, error: Option<&str>) -> Result<(), QueueError> {
        let mut conn = self.db.conn().await?;

        diesel::sql_query(FINISH)
            .bind::<BigInt, _>(id)
            .bind::<Text, _>(state)
            .bind::<Nullable<Text>, _>(error)
            .bind::<Timestamp, _>(now())
            .execute(&mut conn)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl TaskQueue for PgQueue {
    #[instrument(skip_all, fields(kind = task.kind(), dedupe = ?opts.dedupe_id))]
    async fn enqueue(
        &self,
        task: &Task,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let (kind, payload) = task.encode()?;
        let new = NewTask {
            kind,
            payload,
            priority: opts.priority.as_i16(),
            state: PENDING,
            run_at: after(opts.delay),
            max_retry: opts.max_retry as i32,
            dedupe_id: opts.dedupe_id,
            retention_secs: opts.retention.as_secs() as i64,
        };

        let mut conn = self.db.conn().await?;
        let outcome = conn
            .transaction::<_, QueueError, _>(|conn| {
                async move {
                    // a finished task only holds on to its dedupe key until retention ends
                    if let Some(dedupe_id) = &new.dedupe_id {
                        diesel::delete(tasks::table)
                            .filter(tasks::dedupe_id.eq(dedupe_id))
                            .filter(tasks::state.eq_any([COMPLETED, ARCHIVED]))
                            .filter(tasks::retain_until.lt(now()))
                            .execute(conn)
                            .await?;
                    }

                    let id = diesel::insert_into(tasks::table)
                        .values(&new)
                        .on_conflict_do_nothing()
                        .returning(tasks::id)
                        .get_result::<i64>(conn)
                        .await
                        .optional()?;

                    Ok(match id {
                        Some(id) => EnqueueOutcome::Enqueued(id),
                        None => EnqueueOutcome::Duplicate,
                    })
                }
                .scope_boxed()
            })
            .await?;

        debug!(?outcome);
        Ok(outcome)
    }
}

#[async_trait]
impl Broker for PgQueue {
    async fn claim(&self, order: &[Priority]) -> Result<Option<ClaimedTask>, QueueError> {
        let mut conn = self.db.conn().await?;

        for priority in order {
            let row = diesel::sql_query(CLAIM)
                .bind::<SmallInt, _>(priority.as_i16())
                .bind::<Timestamp, _>(now())
                .get_result::<ClaimRow>(&mut conn)
                .await
                .optional()?;

            if let Some(row) = row {
                return Ok(Some(row.into()));
            }
        }

        Ok(None)
    }

    async fn complete(&self, id: i64) -> Result<(), QueueError> {
        self.finish(id, COMPLETED, None).await
    }

    async fn retry(&self, id: i64, delay: Duration, error: &str) -> Result<(), QueueError> {
        let mut conn = self.db.conn().await?;

        diesel::update(tasks::table.find(id))
            .set((
                tasks::state.eq(PENDING),
                tasks::retried.eq(tasks::retried + 1),
                tasks::run_at.eq(after(delay)),
                tasks::last_error.eq(error),
                tasks::updated_at.eq(now()),
            ))
            .execute(&mut conn)
            .await?;

        Ok(())
    }

    async fn archive(&self, id: i64, error: &str) -> Result<(), QueueError> {
        self.finish(id, ARCHIVED, Some(error)).await
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<usize, QueueError> {
        let mut conn = self.db.conn().await?;
        let cutoff = now() - span(older_than);

        Ok(diesel::update(tasks::table)
            .filter(tasks::state.eq(ACTIVE))
            .filter(tasks::updated_at.lt(cutoff))
            .set((tasks::state.eq(PENDING), tasks::updated_at.eq(now())))
            .execute(&mut conn)
            .await?)
    }

    async fn purge_expired(&self) -> Result<usize, QueueError> {
        let mut conn = self.db.conn().await?;

        Ok(diesel::delete(tasks::table)
            .filter(tasks::state.eq_any([COMPLETED, ARCHIVED]))
            .filter(tasks::retain_until.lt(now()))
            .execute(&mut conn)
            .await?)
    }

    async fn depth(&self) -> Result<Vec<(Priority, i64)>, QueueError> {
        let mut conn = self.db.conn().await?;

        let rows: Vec<(i16, i64)> = tasks::table
            .filter(tasks::state.eq(PENDING))
            .group_by(tasks::priority)
            .select((tasks::priority, count_star()))
            .load(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(p, n)| Priority::from_i16(p).map(|p| (p, n)))
            .collect())
    }
}
