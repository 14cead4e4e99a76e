use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use fira_models::{Task, TaskId};
use moka::future::Cache;
use tokio_util::sync::CancellationToken;

/// One task's mutable state plus the token its worker watches.
///
/// Only the worker mutates status and events. Other callers read snapshots
/// or request cancellation.
#[derive(Debug)]
pub struct TaskSlot {
    task: RwLock<Task>,
    cancel: CancellationToken,
}

impl TaskSlot {
    fn new(task: Task) -> Self {
        Self {
            task: RwLock::new(task),
            cancel: CancellationToken::new(),
        }
    }

    /// A consistent copy of the task.
    pub fn snapshot(&self) -> Task {
        self.task
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Task) -> R) -> R {
        f(&self.task.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut Task) -> R) -> R {
        f(&mut self.task.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// In-memory task store.
///
/// Tasks that are still running live in a plain map and are never evicted.
/// Once retired they move into a moka cache, where entries idle for longer
/// than the TTL are dropped, as are the least valuable ones once capacity
/// is reached.
#[derive(Clone)]
pub struct TaskStore {
    active: Arc<RwLock<HashMap<TaskId, Arc<TaskSlot>>>>,
    finished: Cache<TaskId, Arc<TaskSlot>>,
}

impl TaskStore {
    pub fn new(max_tasks: u64, ttl: Duration) -> Self {
        Self {
            active: Arc::default(),
            finished: Cache::builder()
                .max_capacity(max_tasks)
                .time_to_idle(ttl)
                .build(),
        }
    }

    pub async fn insert(&self, task: Task) -> Arc<TaskSlot> {
        let id = task.id;
        let slot = Arc::new(TaskSlot::new(task));
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, slot.clone());
        slot
    }

    /// Hand a task over to the expiring cache. Called once its worker is done.
    pub async fn retire(&self, id: &TaskId) {
        let slot = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        let Some(slot) = slot else {
            return;
        };
        // Cached before it leaves the active map so readers never miss it.
        self.finished.insert(*id, slot).await;
        self.active
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub async fn get(&self, id: &TaskId) -> Option<Arc<TaskSlot>> {
        let active = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        match active {
            Some(slot) => Some(slot),
            None => self.finished.get(id).await,
        }
    }

    pub async fn snapshot(&self, id: &TaskId) -> Option<Task> {
        self.get(id).await.map(|slot| slot.snapshot())
    }

    /// Running tasks plus an approximate count of retired ones; moka applies
    /// pending maintenance lazily.
    pub fn len(&self) -> u64 {
        let active = self
            .active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len() as u64;
        active + self.finished.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
