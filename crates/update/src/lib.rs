//! Keeps a music database in line with the storage it describes.
//!
//! An [`UpdateService`] accepts update requests, queues them, and runs them
//! one at a time as [`UpdateWalk`]s on a worker thread. An [`UpdateWatcher`]
//! can feed it automatically from filesystem change notifications.

mod editor;
pub mod error;
mod exclude;
mod queue;
mod registry;
mod service;
mod walk;
mod watch;

pub use crate::editor::{Editor, RemoveQueue};
pub use crate::exclude::{ExcludeList, IGNORE_FILE};
pub use crate::queue::{JobId, MAX_UPDATE_QUEUE_SIZE, UpdateQueue, UpdateQueueItem};
pub use crate::registry::{
    ArchivePlugin, Capability, DecoderPlugin, M3uPlaylist, PlaylistPlugin, Registry, SuffixDecoder, Track,
};
pub use crate::service::{MAX_JOB_ID, UpdateEvent, UpdateService};
pub use crate::walk::UpdateWalk;
pub use crate::watch::{UpdateWatcher, WatchQueue};
