//! Storage models.
//!
//! Metadata returned by storage backends when statting paths and listing
//! directories.

use time::OffsetDateTime;

/// What a path refers to, after following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    /// Devices, sockets, FIFOs and the like.
    Other,
}

/// File metadata returned by storage backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub kind: FileKind,
    /// File size in bytes
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
    /// Device number, zero when the backend doesn't know it
    pub device: u64,
    /// Inode number, zero when the backend doesn't know it
    pub inode: u64,
}
impl FileInfo {
    pub fn new(kind: FileKind, size: u64, modified: OffsetDateTime) -> Self {
        Self {
            kind,
            size,
            modified,
            device: 0,
            inode: 0,
        }
    }

    pub fn with_identity(mut self, device: u64, inode: u64) -> Self {
        self.device = device;
        self.inode = inode;
        self
    }

    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular
    }

    pub fn is_directory(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Name of the entry within its directory (no separators).
    pub name: String,
    /// Metadata with symlinks followed, `None` if it couldn't be read
    /// (e.g. a dangling symlink).
    pub info: Option<FileInfo>,
}
