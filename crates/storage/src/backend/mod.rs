//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait: the read-only view of a
//! music directory that the database update walks. Backends must be safe to
//! call from any thread, since walks run on a dedicated worker.

mod composite;
mod local;
#[cfg(any(test, feature = "mock"))]
mod mock;

pub use self::composite::CompositeStorage;
pub use self::local::LocalBackend;
#[cfg(any(test, feature = "mock"))]
pub use self::mock::MockBackend;
use crate::error::Result;
use crate::models::{DirEntry, FileInfo};
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;

pub type DirEntryStream<'a> = Pin<Box<dyn Stream<Item = Result<DirEntry>> + Send + 'a>>;

/// Unified interface for storage backends.
///
/// # Path Handling
/// All paths are relative to the storage root and validated with
/// [`validate_path`](crate::validate_path) before use. The empty path is
/// the root itself.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use lark_storage::{backend::StorageBackend, error::Result};
///
/// async fn count_flac(backend: &dyn StorageBackend) -> Result<usize> {
///     let entries = backend.read_dir(Path::new("")).await?;
///     Ok(entries.iter().filter(|entry| entry.name.ends_with(".flac")).count())
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend, used for logging only.
    fn name(&self) -> &str;

    /// Get metadata for a path, following symlinks.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if nothing
    /// exists at the path (including dangling symlinks).
    async fn stat(&self, path: &Path) -> Result<FileInfo>;

    /// Stream the entries of a directory.
    ///
    /// Opening the directory fails up front (as the stream's first item)
    /// if it doesn't exist or can't be read. Entries whose metadata can't
    /// be read are still yielded, with no info.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use futures::TryStreamExt;
    /// use std::path::Path;
    /// # use lark_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let mut entries = backend.read_dir_stream(Path::new("Artist"));
    /// while let Some(entry) = entries.try_next().await? {
    ///     println!("{}: {:?}", entry.name, entry.info.map(|info| info.kind));
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn read_dir_stream<'a>(&'a self, path: &'a Path) -> DirEntryStream<'a>;

    /// Collect [`read_dir_stream()`](Self::read_dir_stream) into a [`Vec`].
    async fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        self.read_dir_stream(path).try_collect().await
    }

    /// Read file contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Check if anything exists at a path.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Target of the symlink at `path`, or `None` if it isn't a symlink.
    ///
    /// Storages that have no notion of symlinks always return `None`.
    async fn read_link(&self, _path: &Path) -> Result<Option<PathBuf>> {
        Ok(None)
    }

    /// Map an absolute filesystem path back into this storage, if it lies
    /// inside it.
    fn map_to_relative(&self, _absolute: &Path) -> Option<PathBuf> {
        None
    }
}
