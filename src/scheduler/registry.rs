//! Process-wide task registry keyed by owner identity.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Timestamp;
use crate::error::{Result, TaskError};
use crate::signals::Collaborators;
use crate::store::TaskStore;
use crate::task::{IntroduceIdentityTask, OwnerId, PersistentTask, TaskId, TaskKind};

#[derive(Default)]
struct RegistryInner {
    /// Tasks per owner, in registration order.
    by_owner: BTreeMap<OwnerId, Vec<Arc<dyn PersistentTask>>>,
    by_id: HashMap<TaskId, Arc<dyn PersistentTask>>,
    introductions: HashMap<OwnerId, Arc<IntroduceIdentityTask>>,
}

/// Maps each owner identity to its ordered collection of tasks.
///
/// The registry lock only guards membership. Task state is read through each
/// task's own lock after the registry lock has been released.
pub struct TaskRegistry {
    store: Arc<dyn TaskStore>,
    collaborators: Collaborators,
    processing_interval: Duration,
    inner: RwLock<RegistryInner>,
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("processing_interval", &self.processing_interval)
            .finish_non_exhaustive()
    }
}

impl TaskRegistry {
    pub fn new(
        store: Arc<dyn TaskStore>,
        collaborators: Collaborators,
        processing_interval: Duration,
    ) -> Self {
        Self {
            store,
            collaborators,
            processing_interval,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Rebuild every persisted task. Returns how many were loaded.
    ///
    /// Tasks already registered are kept as they are. An owner keeps at most
    /// one introduction task; further stored ones are skipped.
    pub fn restore(&self) -> Result<usize> {
        let records = self.store.load_all()?;
        let mut loaded = 0usize;
        for record in records {
            match record.kind {
                TaskKind::IntroduceIdentity => {
                    let task = IntroduceIdentityTask::restore(
                        record,
                        Arc::clone(&self.store),
                        self.collaborators.clone(),
                        self.processing_interval,
                    )?;
                    if self.insert_introduction(Arc::new(task))? {
                        loaded += 1;
                    }
                }
            }
        }
        info!("restored {loaded} tasks from store");
        Ok(loaded)
    }

    /// The owner's introduction task.
    ///
    /// Looks in the registry, then in the store. Only when neither has one is
    /// a new task created and committed.
    pub fn ensure_introduction_task(&self, owner: &OwnerId) -> Result<Arc<IntroduceIdentityTask>> {
        if let Some(existing) = self.introduction_task(owner)? {
            return Ok(existing);
        }

        let mut inner = self.write()?;
        // Re-check under the write lock; another caller may have won.
        if let Some(existing) = inner.introductions.get(owner) {
            return Ok(Arc::clone(existing));
        }

        let stored = self
            .store
            .load_owner(owner)?
            .into_iter()
            .find(|record| record.kind == TaskKind::IntroduceIdentity);
        let task = match stored {
            Some(record) => {
                debug!(owner = %owner, task_id = %record.id, "picked up stored introduction task");
                IntroduceIdentityTask::restore(
                    record,
                    Arc::clone(&self.store),
                    self.collaborators.clone(),
                    self.processing_interval,
                )?
            }
            None => IntroduceIdentityTask::new(
                owner.clone(),
                Arc::clone(&self.store),
                self.collaborators.clone(),
                self.processing_interval,
            )?,
        };
        let task = Arc::new(task);
        register(&mut inner, Arc::clone(&task) as Arc<dyn PersistentTask>);
        inner.introductions.insert(owner.clone(), Arc::clone(&task));
        debug!(owner = %owner, task_id = %task.id(), "registered introduction task");
        Ok(task)
    }

    /// Register an already-constructed task.
    pub fn insert(&self, task: Arc<dyn PersistentTask>) -> Result<()> {
        let mut inner = self.write()?;
        register(&mut inner, task);
        Ok(())
    }

    /// Register a restored introduction task unless its id or its owner is
    /// already taken. Returns whether it was added.
    fn insert_introduction(&self, task: Arc<IntroduceIdentityTask>) -> Result<bool> {
        let mut inner = self.write()?;
        if inner.by_id.contains_key(&task.id()) {
            return Ok(false);
        }
        if let Some(existing) = inner.introductions.get(task.owner()) {
            warn!(
                owner = %task.owner(),
                kept = %existing.id(),
                skipped = %task.id(),
                "owner already has an introduction task"
            );
            return Ok(false);
        }
        inner
            .introductions
            .insert(task.owner().clone(), Arc::clone(&task));
        register(&mut inner, task);
        Ok(true)
    }

    pub fn get(&self, id: &TaskId) -> Result<Option<Arc<dyn PersistentTask>>> {
        Ok(self.read()?.by_id.get(id).cloned())
    }

    /// The introduction task of `owner`, if one is registered.
    pub fn introduction_task(&self, owner: &OwnerId) -> Result<Option<Arc<IntroduceIdentityTask>>> {
        Ok(self.read()?.introductions.get(owner).cloned())
    }

    /// All tasks of `owner`, in registration order.
    pub fn tasks_for(&self, owner: &OwnerId) -> Result<Vec<Arc<dyn PersistentTask>>> {
        Ok(self
            .read()?
            .by_owner
            .get(owner)
            .cloned()
            .unwrap_or_default())
    }

    /// Tasks whose processing time has come, ordered by owner.
    pub fn due_tasks(&self, now: Timestamp) -> Result<Vec<Arc<dyn PersistentTask>>> {
        let mut due = Vec::new();
        for task in self.all()? {
            if task.next_processing_time()? <= now {
                due.push(task);
            }
        }
        Ok(due)
    }

    /// Tasks of `owner` that should be shown at `now`.
    pub fn visible_tasks(
        &self,
        owner: &OwnerId,
        now: Timestamp,
    ) -> Result<Vec<Arc<dyn PersistentTask>>> {
        let mut visible = Vec::new();
        for task in self.tasks_for(owner)? {
            if task.next_display_time()? <= now {
                visible.push(task);
            }
        }
        Ok(visible)
    }

    /// Forget an owner identity: drop its tasks here and in the store.
    ///
    /// Returns how many stored tasks were deleted.
    pub fn remove_owner(&self, owner: &OwnerId) -> Result<usize> {
        let removed = {
            let mut inner = self.write()?;
            let removed = inner.by_owner.remove(owner).unwrap_or_default();
            for task in &removed {
                inner.by_id.remove(&task.id());
            }
            inner.introductions.remove(owner);
            removed.len()
        };

        let deleted = self.store.delete_owner(owner)?;
        if deleted != removed {
            warn!(owner = %owner, registered = removed, stored = deleted, "owner task counts disagree");
        }
        info!(owner = %owner, "removed {deleted} tasks");
        Ok(deleted)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.by_id.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn all(&self) -> Result<Vec<Arc<dyn PersistentTask>>> {
        Ok(self
            .read()?
            .by_owner
            .values()
            .flat_map(|tasks| tasks.iter().cloned())
            .collect())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RegistryInner>> {
        self.inner
            .read()
            .map_err(|_| TaskError::LockPoisoned("task registry"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RegistryInner>> {
        self.inner
            .write()
            .map_err(|_| TaskError::LockPoisoned("task registry"))
    }
}

fn register(inner: &mut RegistryInner, task: Arc<dyn PersistentTask>) {
    if inner.by_id.insert(task.id(), Arc::clone(&task)).is_some() {
        if let Some(tasks) = inner.by_owner.get_mut(task.owner()) {
            tasks.retain(|existing| existing.id() != task.id());
        }
    }
    inner
        .by_owner
        .entry(task.owner().clone())
        .or_default()
        .push(task);
}
