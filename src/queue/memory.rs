use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{
    Broker, ClaimedTask, EnqueueOptions, EnqueueOutcome, Priority, QueueError, Task, TaskQueue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemState {
    Pending,
    Active,
    Completed,
    Archived,
}

#[derive(Debug, Clone)]
pub struct MemTask {
    pub id: i64,
    pub task: Task,
    pub opts: EnqueueOptions,
    pub state: MemState,
    pub run_at: Instant,
    pub retried: u32,
    pub last_error: Option<String>,
}

/// Queue kept in memory. Enqueued tasks are due right away while retries
/// honor their backoff, and finished tasks keep their dedupe key until
/// [`MemQueue::forget_finished`]
#[derive(Default)]
pub struct MemQueue {
    tasks: Mutex<Vec<MemTask>>,
}

impl MemQueue {
    pub fn all(&self) -> Vec<MemTask> {
        self.tasks.lock().unwrap().clone()
    }

    /// Tasks that were accepted, in enqueue order
    pub fn enqueued(&self) -> Vec<Task> {
        self.all().into_iter().map(|t| t.task).collect()
    }

    pub fn enqueued_of(&self, kind: &str) -> Vec<Task> {
        self.enqueued()
            .into_iter()
            .filter(|t| t.kind() == kind)
            .collect()
    }

    pub fn state_of(&self, id: i64) -> Option<MemState> {
        self.all().into_iter().find(|t| t.id == id).map(|t| t.state)
    }

    pub fn forget_finished(&self) {
        self.tasks
            .lock()
            .unwrap()
            .retain(|t| matches!(t.state, MemState::Pending | MemState::Active));
    }

    fn update(&self, id: i64, f: impl FnOnce(&mut MemTask)) {
        if let Some(task) = self.tasks.lock().unwrap().iter_mut().find(|t| t.id == id) {
            f(task)
        }
    }
}

#[async_trait]
impl TaskQueue for MemQueue {
    async fn enqueue(
        &self,
        task: &Task,
        opts: EnqueueOptions,
    ) -> Result<EnqueueOutcome, QueueError> {
        let mut tasks = self.tasks.lock().unwrap();

        if let Some(dedupe_id) = &opts.dedupe_id {
            if tasks
                .iter()
                .any(|t| t.opts.dedupe_id.as_ref() == Some(dedupe_id))
            {
                return Ok(EnqueueOutcome::Duplicate);
            }
        }

        let id = tasks.len() as i64 + 1;
        tasks.push(MemTask {
            id,
            task: task.clone(),
            run_at: Instant::now(),
            opts,
            state: MemState::Pending,
            retried: 0,
            last_error: None,
        });

        Ok(EnqueueOutcome::Enqueued(id))
    }
}

#[async_trait]
impl Broker for MemQueue {
    async fn claim(&self, order: &[Priority]) -> Result<Option<ClaimedTask>, QueueError> {
        let mut tasks = self.tasks.lock().unwrap();

        let now = Instant::now();
        for priority in order {
            let next = tasks.iter_mut().find(|t| {
                t.state == MemState::Pending && t.opts.priority == *priority && t.run_at <= now
            });

            if let Some(task) = next {
                task.state = MemState::Active;
                let (kind, payload) = task.task.encode()?;
                return Ok(Some(ClaimedTask {
                    id: task.id,
                    kind,
                    payload,
                    retried: task.retried,
                    max_retry: task.opts.max_retry,
                }));
            }
        }

        Ok(None)
    }

    async fn complete(&self, id: i64) -> Result<(), QueueError> {
        self.update(id, |t| t.state = MemState::Completed);
        Ok(())
    }

    async fn retry(&self, id: i64, delay: Duration, error: &str) -> Result<(), QueueError> {
        self.update(id, |t| {
            t.state = MemState::Pending;
            t.retried += 1;
            t.run_at = Instant::now() + delay;
            t.last_error = Some(error.to_owned());
        });
        Ok(())
    }

    async fn archive(&self, id: i64, error: &str) -> Result<(), QueueError> {
        self.update(id, |t| {
            t.state = MemState::Archived;
            t.last_error = Some(error.to_owned());
        });
        Ok(())
    }

    async fn recover_stale(&self, _older_than: Duration) -> Result<usize, QueueError> {
        Ok(0)
    }

    async fn purge_expired(&self) -> Result<usize, QueueError> {
        Ok(0)
    }

    async fn depth(&self) -> Result<Vec<(Priority, i64)>, QueueError> {
        let tasks = self.tasks.lock().unwrap();

        Ok(Priority::ALL
            .into_iter()
            .map(|p| {
                let n = tasks
                    .iter()
                    .filter(|t| t.state == MemState::Pending && t.opts.priority == p)
                    .count();
                (p, n as i64)
            })
            .filter(|(_, n)| *n > 0)
            .collect())
    }
}
