//! A database kept in memory and persisted to a single JSON file.

use crate::error::{ErrorKind, Result};
use crate::models::MountedDatabase;
use crate::proxy::{
    DatabaseFile, DeviceClassProxy, DirectoryRecord, FORMAT_VERSION, PlaylistProxy, SongProxy, split_timestamp, timestamp,
};
use crate::tree::DirectoryTree;
use exn::ResultExt;
use facet_json::{from_str as from_json, to_string as to_json};
use lark_config::DatabaseConfig;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub struct SimpleDatabase {
    tree: Mutex<DirectoryTree>,
    path: PathBuf,
}

impl SimpleDatabase {
    /// An empty database that will be saved to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            tree: Mutex::new(DirectoryTree::new()),
            path: path.into(),
        }
    }

    /// Open the database at `path`, loading it if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let database = Self::new(path);
        if database.file_exists() {
            database.load()?;
        }
        Ok(database)
    }

    /// Open the database file named by `config`.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self> {
        Self::open(&config.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock the tree. Never hold the guard across an `.await`.
    pub fn lock(&self) -> MutexGuard<'_, DirectoryTree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn file_exists(&self) -> bool {
        self.path.is_file()
    }

    /// Mount `database` at `uri`.
    pub fn mount(&self, uri: &str, database: MountedDatabase) {
        self.lock().mount(uri, database);
        tracing::info!(uri = %uri, "Mounted database");
    }

    /// Remove the database mounted at `uri`.
    pub fn unmount(&self, uri: &str) -> bool {
        self.lock().unmount(uri)
    }

    /// Replace the in-memory tree with the contents of the database file.
    pub fn load(&self) -> Result<()> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                exn::bail!(ErrorKind::NotFound(self.path.clone()));
            },
            Err(err) => return Err(err).or_raise(|| ErrorKind::Io(self.path.clone())),
        };
        let file = from_json::<DatabaseFile>(&contents).or_raise(|| ErrorKind::Serialization("database file".into()))?;
        if file.version != FORMAT_VERSION {
            exn::bail!(ErrorKind::Serialization(format!("unsupported version {}", file.version)));
        }
        let tree = build_tree(file.directories)?;
        tracing::debug!(
            path = %self.path.display(),
            directories = tree.directory_count(),
            songs = tree.song_count(),
            "Loaded database",
        );
        *self.lock() = tree;
        Ok(())
    }

    /// Write the tree to the database file, replacing it atomically.
    /// Mounted databases are not included.
    pub fn save(&self) -> Result<()> {
        let file = DatabaseFile {
            version: FORMAT_VERSION,
            directories: records(&self.lock()),
        };
        let json = to_json(&file).or_raise(|| ErrorKind::Serialization("database file".into()))?;
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).or_raise(|| ErrorKind::Io(parent.to_path_buf()))?;
        }
        let temporary = self.path.with_extension("tmp");
        std::fs::write(&temporary, json).or_raise(|| ErrorKind::Io(temporary.clone()))?;
        std::fs::rename(&temporary, &self.path).or_raise(|| ErrorKind::Io(self.path.clone()))?;
        tracing::debug!(path = %self.path.display(), "Saved database");
        Ok(())
    }
}

fn records(tree: &DirectoryTree) -> Vec<DirectoryRecord> {
    let mut records = Vec::new();
    let mut stack = vec![tree.root()];
    while let Some(id) = stack.pop() {
        let directory = &tree[id];
        let Some(class) = DeviceClassProxy::from_class(directory.device_class) else {
            continue;
        };
        let (mtime, mtime_nanos) = split_timestamp(directory.mtime);
        records.push(DirectoryRecord {
            uri: tree.uri_of(id),
            mtime,
            mtime_nanos,
            inode: directory.inode,
            device: directory.device,
            class,
            songs: directory.songs.values().map(SongProxy::from).collect(),
            playlists: directory.playlists.values().map(PlaylistProxy::from).collect(),
        });
        stack.extend(directory.children.values().copied());
    }
    records.sort_by(|a, b| a.uri.cmp(&b.uri));
    records
}

fn build_tree(records: Vec<DirectoryRecord>) -> Result<DirectoryTree> {
    let invalid = |uri: &str| exn::Exn::from(ErrorKind::Serialization(format!("invalid timestamp in {uri:?}")));
    let mut tree = DirectoryTree::new();
    for record in records {
        let mut id = tree.root();
        for name in record.uri.split('/').filter(|name| !name.is_empty()) {
            id = tree.make_child(id, name);
        }
        let mtime = timestamp(record.mtime, record.mtime_nanos).ok_or_else(|| invalid(&record.uri))?;
        for song in record.songs {
            let song = song.into_song().ok_or_else(|| invalid(&record.uri))?;
            tree.add_song(id, song);
        }
        for playlist in record.playlists {
            let playlist = playlist.into_playlist().ok_or_else(|| invalid(&record.uri))?;
            tree[id].playlists.insert(playlist.name.clone(), playlist);
        }
        let directory = &mut tree[id];
        directory.mtime = mtime;
        directory.inode = record.inode;
        directory.device = record.device;
        directory.device_class = record.class.into();
    }
    Ok(tree)
}
