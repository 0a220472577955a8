//! Tree mutations made by the walk, and the deferred notifications they
//! produce.

use crate::service::UpdateEvent;
use lark_db::{DirectoryId, DirectoryTree};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::UnboundedSender;

/// URIs of removed songs waiting to be reported to the listener.
///
/// The walk pushes from its own thread; the service drains on the thread
/// that owns the listener. The consumer is woken once for each batch that
/// finds the queue empty, so a single [`take`](Self::take) always collects
/// everything signalled so far.
#[derive(Debug, Clone)]
pub struct RemoveQueue {
    uris: Arc<Mutex<Vec<String>>>,
    wake: UnboundedSender<UpdateEvent>,
}

impl RemoveQueue {
    pub(crate) fn new(wake: UnboundedSender<UpdateEvent>) -> Self {
        Self {
            uris: Arc::default(),
            wake,
        }
    }

    pub fn push(&self, uris: Vec<String>) {
        if uris.is_empty() {
            return;
        }
        let was_empty = {
            let mut queue = self.uris.lock().unwrap_or_else(PoisonError::into_inner);
            let was_empty = queue.is_empty();
            queue.extend(uris);
            was_empty
        };
        if was_empty {
            // The receiver only goes away with the service, which cancels
            // the walk first.
            let _ = self.wake.send(UpdateEvent::SongsRemoved);
        }
    }

    /// Swap out everything queued so far.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.uris.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn is_empty(&self) -> bool {
        self.uris.lock().unwrap_or_else(PoisonError::into_inner).is_empty()
    }
}

/// Deletes from a locked tree and queues the removed song URIs.
///
/// Every method returns whether the tree changed.
#[derive(Debug, Clone)]
pub struct Editor {
    removed: RemoveQueue,
}

impl Editor {
    pub fn new(removed: RemoveQueue) -> Self {
        Self { removed }
    }

    pub fn delete_directory(&self, tree: &mut DirectoryTree, directory: DirectoryId) -> bool {
        tracing::trace!(uri = %tree.uri_of(directory), "Deleting directory");
        self.removed.push(tree.delete_directory(directory));
        true
    }

    pub fn delete_song(&self, tree: &mut DirectoryTree, directory: DirectoryId, name: &str) -> bool {
        match tree.delete_song(directory, name) {
            Some(uri) => {
                tracing::trace!(uri = %uri, "Deleting song");
                self.removed.push(vec![uri]);
                true
            },
            None => false,
        }
    }

    /// Delete whatever is called `name` in `directory`.
    pub fn delete_name_in(&self, tree: &mut DirectoryTree, directory: DirectoryId, name: &str) -> bool {
        let (removed, modified) = tree.delete_name_in(directory, name);
        self.removed.push(removed);
        modified
    }

    /// Queue songs that were already taken out of the tree.
    pub fn songs_removed(&self, uris: Vec<String>) {
        self.removed.push(uris);
    }
}
