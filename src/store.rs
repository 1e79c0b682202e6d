// SPDX-License-Identifier: MIT
//! Versioned, concurrency-safe cache of the task instances assigned to this
//! node, with a content hash the heartbeat exchanges for cheap change
//! detection. Updates are wholesale replacements: readers see either the old
//! generation or the new one, never a mix.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use md5::{Digest, Md5};

use crate::model::TaskInstance;

/// Hash reported while the store holds no valid tasks. A fixed sentinel keeps
/// the empty state distinguishable from a real digest of empty input.
pub const EMPTY_TASKS_HASH: &str = "empty";

struct Inner {
    tasks: HashMap<String, TaskInstance>,
    hash: String,
}

pub struct TaskInstanceStore {
    inner: RwLock<Inner>,
}

impl TaskInstanceStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                tasks: HashMap::new(),
                hash: EMPTY_TASKS_HASH.to_string(),
            }),
        }
    }

    /// Replaces the whole store with `tasks`. Entries without a task id are
    /// dropped; the content hash is recomputed from what was retained. Holds
    /// the write lock for the full clear-refill-rehash so concurrent readers
    /// never observe a partial generation.
    pub fn replace(&self, tasks: Vec<TaskInstance>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.tasks.clear();
        for task in tasks {
            if task.task_id.is_empty() {
                continue;
            }
            inner.tasks.insert(task.task_id.clone(), task);
        }
        inner.hash = content_hash(inner.tasks.values());
    }

    /// Valid (non-invalid) instances assigned to `node_id`. An empty node id
    /// matches nothing rather than everything.
    pub fn by_node(&self, node_id: &str) -> Vec<TaskInstance> {
        if node_id.is_empty() {
            return Vec::new();
        }
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .tasks
            .values()
            .filter(|t| t.assigned_node == node_id && !t.invalid)
            .cloned()
            .collect()
    }

    /// Full snapshot, invalid entries included, for embedding into dispatched
    /// events.
    pub fn all(&self) -> Vec<TaskInstance> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.tasks.values().cloned().collect()
    }

    /// Tasks and hash under a single lock acquisition, so an injected payload
    /// can never pair one generation's tasks with another's hash.
    pub fn snapshot(&self) -> (Vec<TaskInstance>, String) {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        (inner.tasks.values().cloned().collect(), inner.hash.clone())
    }

    pub fn current_hash(&self) -> String {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.hash.clone()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskInstanceStore {
    fn default() -> Self {
        Self::new()
    }
}

/// MD5 over the sorted, comma-joined valid task ids; the authority computes
/// the same digest over its side of the assignment to decide whether a
/// heartbeat response needs to carry the full list.
fn content_hash<'a>(tasks: impl Iterator<Item = &'a TaskInstance>) -> String {
    let mut ids: Vec<&str> = tasks
        .filter(|t| !t.invalid)
        .map(|t| t.task_id.as_str())
        .collect();
    if ids.is_empty() {
        return EMPTY_TASKS_HASH.to_string();
    }
    ids.sort_unstable();
    let mut hasher = Md5::new();
    hasher.update(ids.join(",").as_bytes());
    hex::encode(hasher.finalize())
}
