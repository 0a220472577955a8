//! Runs update jobs one at a time on a dedicated thread.
//!
//! The service itself is driven from one control task: it enqueues jobs,
//! receives [`UpdateEvent`]s from the worker and forwards them to the
//! [`DatabaseListener`]. Listener callbacks therefore never run on the walk
//! thread.

use crate::editor::RemoveQueue;
use crate::error::{ErrorKind, Result};
use crate::queue::{JobId, UpdateQueue, UpdateQueueItem, same_storage};
use crate::registry::Registry;
use crate::walk::UpdateWalk;
use exn::ResultExt;
use lark_config::UpdateConfig;
use lark_db::{DatabaseListener, MountedDatabase, SimpleDatabase};
use lark_storage::{BackendHandle, CompositeStorage};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

/// Job ids count up from 1 to this, then start over at 1.
pub const MAX_JOB_ID: JobId = 32767;

/// Sent from the worker thread to the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    JobFinished { id: JobId, modified: bool },
    /// Songs were removed; see [`RemoveQueue`].
    SongsRemoved,
}

struct Job {
    id: JobId,
    db: Arc<SimpleDatabase>,
    storage: BackendHandle,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Job {
    /// Wait for the worker thread. Safe to call more than once.
    fn join(&mut self) {
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!(id = self.id, "Update thread panicked");
        }
    }

    fn cancel(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        self.join();
    }
}

pub struct UpdateService {
    config: UpdateConfig,
    registry: Arc<Registry>,
    db: Arc<SimpleDatabase>,
    storage: Arc<CompositeStorage>,
    listener: Arc<dyn DatabaseListener>,
    queue: UpdateQueue,
    last_id: JobId,
    current: Option<Job>,
    removed: RemoveQueue,
    sender: UnboundedSender<UpdateEvent>,
    events: UnboundedReceiver<UpdateEvent>,
}

impl UpdateService {
    pub fn new(
        config: UpdateConfig,
        registry: Arc<Registry>,
        db: Arc<SimpleDatabase>,
        storage: Arc<CompositeStorage>,
        listener: Arc<dyn DatabaseListener>,
    ) -> Self {
        let (sender, events) = unbounded_channel();
        Self {
            config,
            registry,
            db,
            storage,
            listener,
            queue: UpdateQueue::new(),
            last_id: 0,
            current: None,
            removed: RemoveQueue::new(sender.clone()),
            sender,
            events,
        }
    }

    /// The id of the running job, if any.
    pub fn current_job(&self) -> Option<JobId> {
        self.current.as_ref().map(|job| job.id)
    }

    /// Ids of the jobs waiting behind the running one, in order.
    pub fn queued_jobs(&self) -> Vec<JobId> {
        self.queue.iter().map(|item| item.id).collect()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    /// Request an update of `path` (empty for everything). Starts it right
    /// away if nothing else is running, otherwise queues it.
    pub fn enqueue(&mut self, path: &str, discard: bool) -> Result<JobId> {
        let (db, storage, path) = self.resolve(path)?;
        let id = next_id(self.last_id);
        let item = UpdateQueueItem {
            db,
            storage,
            path,
            discard,
            id,
        };

        if self.current.is_some() {
            if !self.queue.push(item) {
                exn::bail!(ErrorKind::QueueFull);
            }
            tracing::debug!(id, "Update queued");
        } else {
            self.start(item)?;
        }
        self.last_id = id;
        Ok(id)
    }

    /// Find the database and storage that hold `path`, and the path within
    /// them. Looks through one mount point.
    fn resolve(&self, path: &str) -> Result<(Arc<SimpleDatabase>, BackendHandle, String)> {
        let (mount, rest) = {
            let tree = self.db.lock();
            let lookup = tree.lookup_directory(path);
            if !lookup.is_mount {
                (None, None)
            } else {
                let uri = tree.uri_of(lookup.directory);
                let mounted = tree[lookup.directory].mounted.clone();
                (Some((uri, mounted)), lookup.rest)
            }
        };

        let Some((uri, mounted)) = mount else {
            let Some(storage) = self.storage.root() else {
                exn::bail!(ErrorKind::NoStorage(String::new()));
            };
            return Ok((Arc::clone(&self.db), storage, path.to_string()));
        };
        let Some(MountedDatabase::Simple(db)) = mounted else {
            exn::bail!(ErrorKind::UnsupportedDatabase(uri));
        };
        let Some(storage) = self.storage.get_mount(&uri) else {
            exn::bail!(ErrorKind::NoStorage(uri));
        };
        Ok((db, storage, rest.unwrap_or_default()))
    }

    fn start(&mut self, item: UpdateQueueItem) -> Result<()> {
        let UpdateQueueItem {
            db,
            storage,
            path,
            discard,
            id,
        } = item;
        let mut walk = UpdateWalk::new(
            self.config.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&storage),
            Arc::clone(&db),
            self.removed.clone(),
        );
        let cancel = walk.cancel_flag();
        let sender = self.sender.clone();
        let job_db = Arc::clone(&db);

        tracing::info!(id, path = %path, target = storage.name(), discard, "Starting update");
        let thread = std::thread::Builder::new()
            .name("update".to_string())
            .spawn(move || {
                let modified = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime.block_on(walk.walk(&path, discard)),
                    Err(err) => {
                        tracing::error!(id, error = %err, "Failed to build update runtime");
                        false
                    },
                };
                if (modified || !job_db.file_exists())
                    && let Err(err) = job_db.save()
                {
                    tracing::error!(id, error = ?err, "Failed to save database");
                }
                tracing::info!(id, modified, "Update finished");
                // Only fails once the service is gone, and it joins us first.
                let _ = sender.send(UpdateEvent::JobFinished { id, modified });
            })
            .or_raise(|| ErrorKind::Thread)?;

        self.current = Some(Job {
            id,
            db,
            storage,
            cancel,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Wait for the next event from the worker.
    pub async fn next_event(&mut self) -> Option<UpdateEvent> {
        self.events.recv().await
    }

    /// React to an event from the worker: notify the listener and, when a
    /// job finished, start the next one.
    pub fn handle(&mut self, event: UpdateEvent) {
        match event {
            UpdateEvent::SongsRemoved => {
                for uri in self.removed.take() {
                    self.listener.on_database_song_removed(&uri);
                }
            },
            UpdateEvent::JobFinished { id, modified } => {
                match self.current.take() {
                    Some(mut job) if job.id == id => job.join(),
                    other => {
                        tracing::warn!(id, "Finished job is not the running one");
                        self.current = other;
                        return;
                    },
                }
                self.listener.on_idle_update();
                if modified {
                    self.listener.on_database_modified();
                }
                while let Some(item) = self.queue.pop() {
                    let id = item.id;
                    match self.start(item) {
                        Ok(()) => break,
                        Err(err) => tracing::error!(id, error = ?err, "Failed to start queued update"),
                    }
                }
            },
        }
    }

    /// Handle events until no job is running or queued.
    pub async fn run_until_idle(&mut self) {
        while self.current.is_some() {
            let Some(event) = self.events.recv().await else {
                break;
            };
            self.handle(event);
        }
        while let Ok(event) = self.events.try_recv() {
            self.handle(event);
        }
    }

    /// Drop every job for the database and storage mounted at `uri`. If the
    /// running job is one of them, cancel it and block until its thread has
    /// exited.
    ///
    /// Call this before unmounting, so no job keeps using what is unmounted.
    pub fn cancel_mount(&mut self, uri: &str) {
        let mut cancel_current = false;

        let mounted = {
            let tree = self.db.lock();
            let lookup = tree.lookup_directory(uri);
            (lookup.is_mount && lookup.rest.is_none())
                .then(|| tree[lookup.directory].mounted.clone())
                .flatten()
        };
        if let Some(MountedDatabase::Simple(db)) = mounted {
            self.queue.erase_db(&db);
            cancel_current |= self.current.as_ref().is_some_and(|job| Arc::ptr_eq(&job.db, &db));
        }
        if let Some(storage) = self.storage.get_mount(uri) {
            self.queue.erase_storage(&storage);
            cancel_current |= self
                .current
                .as_ref()
                .is_some_and(|job| same_storage(&job.storage, &storage));
        }

        if cancel_current && let Some(job) = &mut self.current {
            tracing::info!(id = job.id, uri, "Cancelling update");
            // The finished event is still on its way and will retire the job.
            job.cancel();
        }
    }

    /// Drop all queued jobs and cancel the running one.
    pub fn cancel_all(&mut self) {
        self.queue.clear();
        if let Some(job) = &mut self.current {
            job.cancel();
        }
    }
}

impl Drop for UpdateService {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

fn next_id(last: JobId) -> JobId {
    if last >= MAX_JOB_ID { 1 } else { last + 1 }
}
