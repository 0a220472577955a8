//! Automatic updates for a music directory on the local filesystem.
//!
//! An [`UpdateWatcher`] subscribes to change notifications below the root,
//! maps each change to the directory it happened in and holds those
//! directories back until the filesystem has been quiet for a while. The
//! caller then hands the batch to [`UpdateWatcher::enqueue`].

use crate::error::{ErrorKind, Result};
use crate::queue::JobId;
use crate::service::UpdateService;
use exn::ResultExt;
use lark_config::WatchConfig;
use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

/// Directories waiting to be updated.
///
/// A directory already covered by a queued ancestor is not queued again, and
/// queueing an ancestor drops the descendants it covers.
#[derive(Debug, Default)]
pub struct WatchQueue {
    paths: Vec<String>,
    last_change: Option<Instant>,
}

impl WatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, uri: String, now: Instant) {
        self.last_change = Some(now);
        if self.paths.iter().any(|queued| covers(queued, &uri)) {
            return;
        }
        self.paths.retain(|queued| !covers(&uri, queued));
        self.paths.push(uri);
    }

    /// When the queued paths become ready, if there are any.
    pub fn deadline(&self, delay: Duration) -> Option<Instant> {
        self.last_change.filter(|_| !self.paths.is_empty()).map(|last| last + delay)
    }

    /// Take every queued path once nothing changed for `delay`.
    pub fn take_ready(&mut self, now: Instant, delay: Duration) -> Vec<String> {
        match self.deadline(delay) {
            Some(deadline) if now >= deadline => {
                self.last_change = None;
                std::mem::take(&mut self.paths)
            },
            _ => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

/// Whether updating `parent` also updates `child`.
fn covers(parent: &str, child: &str) -> bool {
    parent.is_empty()
        || child
            .strip_prefix(parent)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

pub struct UpdateWatcher {
    root: PathBuf,
    depth: usize,
    delay: Duration,
    queue: WatchQueue,
    events: UnboundedReceiver<notify::Result<Event>>,
    // Dropping the watcher ends the event stream.
    _watcher: RecommendedWatcher,
}

impl UpdateWatcher {
    /// Watch everything below `root`.
    pub fn new(root: impl AsRef<Path>, config: &WatchConfig) -> Result<Self> {
        let root = root.as_ref();
        let failed = || ErrorKind::Watch(root.display().to_string());
        let root = std::fs::canonicalize(root).or_raise(failed)?;
        let (sender, events) = unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            // Only fails once the watcher is being dropped.
            let _ = sender.send(event);
        })
        .or_raise(failed)?;
        watcher.watch(&root, RecursiveMode::Recursive).or_raise(failed)?;
        tracing::info!(root = %root.display(), depth = config.depth, "Watching music directory");
        Ok(Self {
            root,
            depth: config.depth,
            delay: Duration::from_millis(config.delay_ms),
            queue: WatchQueue::new(),
            events,
            _watcher: watcher,
        })
    }

    /// Wait for the next batch of changed directories. Returns `None` once
    /// the watcher stopped delivering events.
    pub async fn next_batch(&mut self) -> Option<Vec<String>> {
        loop {
            let ready = self.queue.take_ready(Instant::now(), self.delay);
            if !ready.is_empty() {
                tracing::debug!(paths = ?ready, "Filesystem settled");
                return Some(ready);
            }
            let event = match self.queue.deadline(self.delay) {
                Some(deadline) => {
                    let deadline = tokio::time::Instant::from_std(deadline);
                    match tokio::time::timeout_at(deadline, self.events.recv()).await {
                        Ok(event) => event,
                        Err(_) => continue,
                    }
                },
                None => self.events.recv().await,
            };
            match event? {
                Ok(event) => {
                    let now = Instant::now();
                    for uri in changed_directories(&self.root, self.depth, &event) {
                        tracing::trace!(uri = %uri, kind = ?event.kind, "Change queued");
                        self.queue.push(uri, now);
                    }
                },
                Err(err) => tracing::warn!(error = %err, "Watch error"),
            }
        }
    }

    /// Request an update for each path. Paths the service has no room for
    /// go back on the queue and come out in a later batch.
    pub fn enqueue(&mut self, service: &mut UpdateService, paths: Vec<String>) -> Vec<JobId> {
        let mut ids = Vec::with_capacity(paths.len());
        let mut paths = paths.into_iter();
        while let Some(path) = paths.next() {
            match service.enqueue(&path, false) {
                Ok(id) => ids.push(id),
                Err(err) if err.is_retryable() => {
                    tracing::debug!(path = %path, "Update queue full, retrying later");
                    let now = Instant::now();
                    self.queue.push(path, now);
                    for path in paths.by_ref() {
                        self.queue.push(path, now);
                    }
                },
                Err(err) => tracing::warn!(path = %path, error = ?err, "Failed to queue automatic update"),
            }
        }
        ids
    }
}

/// The directories, relative to `root`, that `event` changed something in.
fn changed_directories(root: &Path, depth: usize, event: &Event) -> Vec<String> {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Remove(_)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    );
    if !relevant {
        return Vec::new();
    }
    event
        .paths
        .iter()
        .filter_map(|path| {
            let relative = path.strip_prefix(root).ok()?;
            let Some(parent) = relative.parent() else {
                tracing::warn!(root = %root.display(), "Music directory changed itself");
                return None;
            };
            let mut parts = Vec::new();
            for component in parent.components() {
                let Component::Normal(name) = component else {
                    return None;
                };
                let name = name.to_str()?;
                if name.contains('\n') {
                    return None;
                }
                parts.push(name);
            }
            if relative.file_name()?.to_str()?.contains('\n') {
                return None;
            }
            parts.truncate(depth);
            Some(parts.join("/"))
        })
        .collect()
}
