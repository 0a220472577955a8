//! The music database: a tree of directories, songs and playlists.

pub mod error;
mod listener;
mod models;
mod proxy;
mod simple;
mod tree;

pub use crate::listener::{DatabaseListener, NullListener};
pub use crate::models::{DeviceClass, Directory, DirectoryId, MountedDatabase, PlaylistInfo, Song, Tag};
pub use crate::simple::SimpleDatabase;
pub use crate::tree::{DirectoryTree, LookupResult};
