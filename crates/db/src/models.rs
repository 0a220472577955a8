//! Database models.

use crate::SimpleDatabase;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;

/// Handle to a [`Directory`] inside a [`DirectoryTree`](crate::DirectoryTree).
///
/// Only valid for the tree that issued it, and only until that directory
/// is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectoryId(pub(crate) usize);

/// What a directory node stands for on storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceClass {
    /// A real directory.
    #[default]
    Regular,
    /// Virtual directory holding the tracks of a container file (a cue
    /// sheet, a multi-track image).
    Container,
    /// Virtual directory mirroring the contents of an archive file.
    Archive,
    /// Virtual directory holding the entries of a playlist file.
    Playlist,
    /// Another database is mounted here.
    Mount,
}

/// Tag metadata read from a song file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tag {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub track: Option<u32>,
    pub duration_ms: Option<u64>,
}

/// A song inside a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Song {
    /// File name, relative to the owning directory.
    pub name: String,
    pub mtime: OffsetDateTime,
    pub tag: Tag,
    /// Seen during the current walk.
    pub mark: bool,
    /// Some playlist in the database refers to this song.
    pub in_playlist: bool,
    /// For playlist entries: the URI of the song this entry points at,
    /// relative to the directory holding the playlist file.
    pub target: Option<String>,
}
impl Song {
    pub fn new(name: impl Into<String>, mtime: OffsetDateTime) -> Self {
        Self {
            name: name.into(),
            mtime,
            tag: Tag::default(),
            mark: false,
            in_playlist: false,
            target: None,
        }
    }

    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tag = tag;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

/// A playlist file stored in a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistInfo {
    pub name: String,
    pub mtime: OffsetDateTime,
    pub mark: bool,
}
impl PlaylistInfo {
    pub fn new(name: impl Into<String>, mtime: OffsetDateTime) -> Self {
        Self {
            name: name.into(),
            mtime,
            mark: false,
        }
    }
}

/// A database mounted into a directory of another one.
#[derive(Clone)]
pub enum MountedDatabase {
    /// A local database that can be updated from its own storage.
    Simple(Arc<SimpleDatabase>),
    /// A database served by something else (another server); it can't be
    /// updated from here.
    Proxy { name: String },
}
impl std::fmt::Debug for MountedDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simple(db) => f.debug_tuple("Simple").field(&db.path()).finish(),
            Self::Proxy { name } => f.debug_struct("Proxy").field("name", name).finish(),
        }
    }
}

/// A node of the directory tree.
#[derive(Debug, Clone)]
pub struct Directory {
    /// Name within the parent, empty for the root.
    pub name: String,
    pub parent: Option<DirectoryId>,
    pub children: BTreeMap<String, DirectoryId>,
    pub songs: BTreeMap<String, Song>,
    pub playlists: BTreeMap<String, PlaylistInfo>,
    /// Modification time when last scanned; the epoch if never scanned.
    pub mtime: OffsetDateTime,
    pub inode: u64,
    pub device: u64,
    pub device_class: DeviceClass,
    /// Seen during the current walk.
    pub mark: bool,
    pub mounted: Option<MountedDatabase>,
}
impl Directory {
    pub(crate) fn new(name: impl Into<String>, parent: Option<DirectoryId>) -> Self {
        Self {
            name: name.into(),
            parent,
            children: BTreeMap::new(),
            songs: BTreeMap::new(),
            playlists: BTreeMap::new(),
            mtime: OffsetDateTime::UNIX_EPOCH,
            inode: 0,
            device: 0,
            device_class: DeviceClass::Regular,
            mark: false,
            mounted: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_mount(&self) -> bool {
        self.device_class == DeviceClass::Mount
    }

    pub fn is_virtual(&self) -> bool {
        matches!(
            self.device_class,
            DeviceClass::Container | DeviceClass::Archive | DeviceClass::Playlist
        )
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.songs.is_empty() && self.playlists.is_empty()
    }
}
