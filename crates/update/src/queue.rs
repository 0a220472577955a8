//! Pending update jobs.

use lark_db::SimpleDatabase;
use lark_storage::BackendHandle;
use std::collections::VecDeque;
use std::sync::Arc;

/// Identifies an update job. Never zero.
pub type JobId = u32;

/// How many jobs may wait behind the running one.
pub const MAX_UPDATE_QUEUE_SIZE: usize = 32;

/// One requested update: which database to update, from which storage,
/// and which path below its root.
#[derive(Clone)]
pub struct UpdateQueueItem {
    pub db: Arc<SimpleDatabase>,
    pub storage: BackendHandle,
    pub path: String,
    pub discard: bool,
    pub id: JobId,
}

impl std::fmt::Debug for UpdateQueueItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateQueueItem")
            .field("db", &self.db.path())
            .field("storage", &self.storage.name())
            .field("path", &self.path)
            .field("discard", &self.discard)
            .field("id", &self.id)
            .finish()
    }
}

/// FIFO of pending jobs with a fixed capacity.
#[derive(Debug, Default)]
pub struct UpdateQueue {
    items: VecDeque<UpdateQueueItem>,
}

impl UpdateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job. Returns `false` (and drops the job) if the queue is full.
    pub fn push(&mut self, item: UpdateQueueItem) -> bool {
        if self.items.len() >= MAX_UPDATE_QUEUE_SIZE {
            return false;
        }
        self.items.push_back(item);
        true
    }

    pub fn pop(&mut self) -> Option<UpdateQueueItem> {
        self.items.pop_front()
    }

    /// Drop every job updating `db`.
    pub fn erase_db(&mut self, db: &Arc<SimpleDatabase>) {
        self.items.retain(|item| !Arc::ptr_eq(&item.db, db));
    }

    /// Drop every job scanning `storage`.
    pub fn erase_storage(&mut self, storage: &BackendHandle) {
        self.items.retain(|item| !same_storage(&item.storage, storage));
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpdateQueueItem> {
        self.items.iter()
    }
}

/// Compare storages by identity, ignoring vtables.
pub(crate) fn same_storage(a: &BackendHandle, b: &BackendHandle) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
