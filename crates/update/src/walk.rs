//! One update job: bring a database tree in line with its storage.
//!
//! The walk lists every directory below the requested path, adds what is
//! new, re-reads what changed and deletes what is gone. The database lock is
//! taken for each tree mutation and released before any storage I/O.

use crate::editor::{Editor, RemoveQueue};
use crate::exclude::ExcludeList;
use crate::registry::{Capability, DecoderPlugin, Registry, suffix_of};
use futures::future::BoxFuture;
use lark_config::UpdateConfig;
use lark_db::{DeviceClass, Directory, DirectoryId, DirectoryTree, PlaylistInfo, SimpleDatabase, Song, Tag};
use lark_storage::{BackendHandle, FileInfo, FileKind, StorageBackend};
use std::path::{Component, Path};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use tracing::instrument;

pub struct UpdateWalk {
    config: UpdateConfig,
    registry: Arc<Registry>,
    storage: BackendHandle,
    db: Arc<SimpleDatabase>,
    editor: Editor,
    cancel: Arc<AtomicBool>,
    discard: bool,
    modified: bool,
}

impl UpdateWalk {
    pub fn new(
        config: UpdateConfig,
        registry: Arc<Registry>,
        storage: BackendHandle,
        db: Arc<SimpleDatabase>,
        removed: RemoveQueue,
    ) -> Self {
        Self {
            config,
            registry,
            storage,
            db,
            editor: Editor::new(removed),
            cancel: Arc::new(AtomicBool::new(false)),
            discard: false,
            modified: false,
        }
    }

    /// The flag that stops the walk. It is polled between directory entries.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Update `path` (empty for everything). With `discard`, songs and
    /// virtual directories are re-read even if they look unchanged.
    ///
    /// Returns whether the database was modified. A cancelled walk returns
    /// early, leaving the part it didn't reach as it was.
    #[instrument(skip(self), fields(target = self.storage.name()))]
    pub async fn walk(&mut self, path: &str, discard: bool) -> bool {
        self.discard = discard;
        self.modified = false;

        let Some(path) = normalize(path) else {
            tracing::error!(path, "Refusing to update a path outside the music directory");
            return false;
        };
        if path.is_empty() {
            let info = match self.storage.stat(Path::new("")).await {
                Ok(info) => info,
                Err(err) => {
                    tracing::error!(error = ?err, "Failed to stat storage root");
                    return false;
                },
            };
            if !info.is_directory() {
                tracing::error!("Storage root is not a directory");
                return false;
            }
            let root = self.db.lock().root();
            self.update_directory(root, &ExcludeList::new(), info).await;
        } else {
            self.update_uri(&path).await;
        }

        let removed = {
            let mut tree = self.db.lock();
            tree.clear_in_playlist();
            tree.purge_dangling_from_playlists()
        };
        if !removed.is_empty() {
            self.modified = true;
            self.editor.songs_removed(removed);
        }
        self.modified
    }

    async fn update_uri(&mut self, uri: &str) {
        let Some(parent) = self.make_uri_parent_checked(uri).await else {
            return;
        };
        let (parent_uri, name) = uri.rsplit_once('/').unwrap_or(("", uri));

        if self.skip_symlink(parent, parent_uri, name).await {
            self.delete_name_in(parent, name);
            return;
        }
        let info = match self.storage.stat(Path::new(uri)).await {
            Ok(info) => info,
            Err(err) => {
                tracing::debug!(uri, error = ?err, "Failed to stat");
                self.delete_name_in(parent, name);
                return;
            },
        };
        let exclude = self.load_exclude_lists(parent).await;
        self.update_child(parent, parent_uri, &exclude, name, info).await;
    }

    /// Find or create every directory above `uri`. Gives up at mount points
    /// and at anything that isn't a directory on storage.
    async fn make_uri_parent_checked(&mut self, uri: &str) -> Option<DirectoryId> {
        let mut directory = self.db.lock().root();
        let Some((parents, _)) = uri.rsplit_once('/') else {
            return Some(directory);
        };
        let mut parent_uri = String::new();
        for name in parents.split('/') {
            directory = self.make_child_checked(directory, &parent_uri, name).await?;
            parent_uri = join(&parent_uri, name);
        }
        Some(directory)
    }

    async fn make_child_checked(&mut self, parent: DirectoryId, parent_uri: &str, name: &str) -> Option<DirectoryId> {
        let existing = {
            let tree = self.db.lock();
            tree.find_child(parent, name).map(|child| (child, tree[child].is_mount()))
        };
        if let Some((child, is_mount)) = existing {
            return (!is_mount).then_some(child);
        }

        let info = self.storage.stat(Path::new(&join(parent_uri, name))).await.ok()?;
        if !info.is_directory()
            || self.find_ancestor_loop(parent, &info).await
            || self.skip_symlink(parent, parent_uri, name).await
        {
            return None;
        }

        let mut tree = self.db.lock();
        // A song by the same name is in the way.
        self.modified |= self.editor.delete_song(&mut tree, parent, name);
        let child = tree.create_child(parent, name);
        set_stat(&mut tree[child], &info);
        self.modified = true;
        Some(child)
    }

    /// The exclude list in effect for the entries of `directory`.
    async fn load_exclude_lists(&self, directory: DirectoryId) -> ExcludeList {
        let uris = {
            let tree = self.db.lock();
            let mut uris = Vec::new();
            let mut current = Some(directory);
            while let Some(id) = current {
                uris.push(tree.uri_of(id));
                current = tree[id].parent;
            }
            uris
        };
        let mut list = ExcludeList::new();
        for uri in uris.iter().rev() {
            list.load(self.storage.as_ref(), Path::new(uri)).await;
        }
        list
    }

    /// List a directory and update everything in it. Returns `false` if the
    /// directory couldn't be listed; the caller deletes it.
    fn update_directory<'a>(
        &'a mut self,
        directory: DirectoryId,
        parent_exclude: &'a ExcludeList,
        info: FileInfo,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let uri = {
                let mut tree = self.db.lock();
                set_stat(&mut tree[directory], &info);
                tree.uri_of(directory)
            };
            let entries = match self.storage.read_dir(Path::new(&uri)).await {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::error!(uri = %uri, error = ?err, "Failed to open directory");
                    return false;
                },
            };

            let mut exclude = parent_exclude.clone();
            exclude.load(self.storage.as_ref(), Path::new(&uri)).await;
            {
                let mut tree = self.db.lock();
                if !exclude.is_empty() {
                    self.modified |= remove_excluded(&self.editor, &mut tree, directory, &exclude);
                }
                unmark_all_in(&mut tree, directory);
            }

            for entry in entries {
                if self.is_cancelled() {
                    break;
                }
                let name = entry.name;
                if name.contains('\n') {
                    tracing::debug!(uri = %uri, "Skipping entry with a newline in its name");
                    continue;
                }
                if exclude.matches(&name) {
                    tracing::trace!(uri = %join(&uri, &name), "Excluded");
                    continue;
                }
                if self.skip_symlink(directory, &uri, &name).await {
                    tracing::debug!(uri = %join(&uri, &name), "Skipping symlink");
                    self.delete_name_in(directory, &name);
                    continue;
                }
                let Some(info) = entry.info else {
                    tracing::debug!(uri = %join(&uri, &name), "Failed to stat entry");
                    self.delete_name_in(directory, &name);
                    continue;
                };
                self.update_child(directory, &uri, &exclude, &name, info).await;
            }

            if self.is_cancelled() {
                tracing::debug!(uri = %uri, "Walk cancelled");
                return true;
            }

            self.purge_deleted(directory);
            let mut tree = self.db.lock();
            tree[directory].mtime = info.modified;
            tree[directory].mark = true;
            true
        })
    }

    async fn update_child(&mut self, directory: DirectoryId, uri: &str, exclude: &ExcludeList, name: &str, info: FileInfo) {
        match info.kind {
            FileKind::Regular => {
                self.update_regular_file(directory, uri, name, &info).await;
            },
            FileKind::Directory => {
                if self.find_ancestor_loop(directory, &info).await {
                    tracing::debug!(uri = %join(uri, name), "Recursive directory found");
                    return;
                }
                let Some(child) = self.make_subdirectory(directory, name, &info) else {
                    return;
                };
                if !self.update_directory(child, exclude, info).await {
                    let mut tree = self.db.lock();
                    self.modified |= self.editor.delete_directory(&mut tree, child);
                }
            },
            FileKind::Other => {
                tracing::debug!(uri = %join(uri, name), "Not a directory, archive or music");
            },
        }
    }

    /// The tree node for a subdirectory found on storage, or `None` if it is
    /// a mount point.
    fn make_subdirectory(&mut self, directory: DirectoryId, name: &str, info: &FileInfo) -> Option<DirectoryId> {
        let mut tree = self.db.lock();
        match tree.find_child(directory, name) {
            Some(child) if tree[child].is_mount() => None,
            Some(child) if replaced(&tree[child], info) => {
                tracing::debug!(uri = %tree.uri_of(child), "Directory was replaced");
                self.editor.delete_directory(&mut tree, child);
                self.modified = true;
                Some(tree.create_child(directory, name))
            },
            Some(child) => Some(child),
            None => {
                self.modified = true;
                Some(tree.create_child(directory, name))
            },
        }
    }

    /// Whether `info` identifies `directory` or one of its ancestors.
    /// Ancestors that can't be identified count as a loop.
    async fn find_ancestor_loop(&self, directory: DirectoryId, info: &FileInfo) -> bool {
        if info.inode == 0 && info.device == 0 {
            return false;
        }
        let mut current = Some(directory);
        while let Some(id) = current {
            let (identity, parent) = {
                let tree = self.db.lock();
                ((tree[id].inode, tree[id].device), tree[id].parent)
            };
            let identity = if identity == (0, 0) {
                let uri = self.db.lock().uri_of(id);
                match self.storage.stat(Path::new(&uri)).await {
                    Ok(stat) => {
                        set_stat(&mut self.db.lock()[id], &stat);
                        (stat.inode, stat.device)
                    },
                    Err(_) => return true,
                }
            } else {
                identity
            };
            if identity == (info.inode, info.device) {
                return true;
            }
            current = parent;
        }
        false
    }

    async fn update_regular_file(&mut self, directory: DirectoryId, uri: &str, name: &str, info: &FileInfo) -> bool {
        let Some(suffix) = suffix_of(name) else {
            return false;
        };
        let path = join(uri, name);
        self.update_song_file(directory, &path, name, suffix, info).await
            || self.update_archive_file(directory, &path, name, suffix, info).await
            || self.update_playlist_file(directory, &path, name, suffix, info).await
    }

    async fn update_song_file(
        &mut self,
        directory: DirectoryId,
        path: &str,
        name: &str,
        suffix: &str,
        info: &FileInfo,
    ) -> bool {
        let plugins = self.registry.decoders_for(suffix);
        if plugins.is_empty() {
            return false;
        }
        if self.update_container_file(directory, path, name, &plugins, info).await {
            return true;
        }

        let existing = self.db.lock().find_song(directory, name).map(|song| song.mtime);
        if existing == Some(info.modified) && !self.discard {
            if let Some(song) = self.db.lock().find_song_mut(directory, name) {
                song.mark = true;
            }
            return true;
        }

        match scan_tag(&plugins, self.storage.as_ref(), Path::new(path)).await {
            Ok(tag) => {
                tracing::debug!(uri = path, new = existing.is_none(), "Scanned song");
                let mut song = Song::new(name, info.modified).with_tag(tag);
                song.mark = true;
                self.db.lock().add_song(directory, song);
                self.modified = true;
            },
            Err(err) => {
                tracing::warn!(uri = path, error = ?err, "Failed to scan song");
                let mut tree = self.db.lock();
                self.modified |= self.editor.delete_song(&mut tree, directory, name);
            },
        }
        true
    }

    /// Files holding several tracks become a virtual directory of songs.
    async fn update_container_file(
        &mut self,
        directory: DirectoryId,
        path: &str,
        name: &str,
        plugins: &[Arc<dyn DecoderPlugin>],
        info: &FileInfo,
    ) -> bool {
        if self.mark_unchanged_virtual(directory, name, DeviceClass::Container, info) {
            return true;
        }

        let mut tracks = None;
        for plugin in plugins {
            match plugin.container_tracks(self.storage.as_ref(), Path::new(path)).await {
                Ok(Capability::Supported(list)) if !list.is_empty() => {
                    tracks = Some(list);
                    break;
                },
                Ok(_) => {},
                Err(err) => tracing::warn!(uri = path, plugin = plugin.name(), error = ?err, "Failed to read container"),
            }
        }

        let mut tree = self.db.lock();
        if let Some(old) = tree.find_child(directory, name) {
            self.modified |= self.editor.delete_directory(&mut tree, old);
        }
        let Some(tracks) = tracks else {
            return false;
        };
        let container = create_virtual(&mut tree, directory, name, DeviceClass::Container, info.modified);
        for track in tracks {
            tree.add_song(container, Song::new(track.name, info.modified).with_tag(track.tag));
        }
        self.modified = true;
        true
    }

    /// Archives become a virtual directory tree of the songs inside them.
    async fn update_archive_file(
        &mut self,
        directory: DirectoryId,
        path: &str,
        name: &str,
        suffix: &str,
        info: &FileInfo,
    ) -> bool {
        let Some(plugin) = self.registry.archive_for(suffix) else {
            return false;
        };
        if self.mark_unchanged_virtual(directory, name, DeviceClass::Archive, info) {
            return true;
        }

        let entries = match plugin.list_entries(self.storage.as_ref(), Path::new(path)).await {
            Ok(entries) => entries,
            Err(err) => {
                // Left unmarked, so an old listing is purged.
                tracing::warn!(uri = path, plugin = plugin.name(), error = ?err, "Failed to open archive");
                return true;
            },
        };

        let mut tree = self.db.lock();
        if let Some(old) = tree.find_child(directory, name) {
            self.modified |= self.editor.delete_directory(&mut tree, old);
        }
        let archive = create_virtual(&mut tree, directory, name, DeviceClass::Archive, info.modified);
        for entry in entries {
            if !self.registry.is_song(&entry.name) {
                continue;
            }
            let (parents, file) = entry.name.rsplit_once('/').unwrap_or(("", entry.name.as_str()));
            let mut parent = archive;
            for part in parents.split('/').filter(|part| !part.is_empty()) {
                parent = match tree.find_child(parent, part) {
                    Some(child) => child,
                    None => create_virtual(&mut tree, parent, part, DeviceClass::Archive, info.modified),
                };
            }
            tree.add_song(parent, Song::new(file, info.modified).with_tag(entry.tag));
        }
        self.modified = true;
        true
    }

    /// Playlists are recorded in their directory, and if the plugin can read
    /// them, their entries become a virtual directory of references.
    async fn update_playlist_file(
        &mut self,
        directory: DirectoryId,
        path: &str,
        name: &str,
        suffix: &str,
        info: &FileInfo,
    ) -> bool {
        let Some(plugin) = self.registry.playlist_for(suffix) else {
            return false;
        };
        {
            let mut tree = self.db.lock();
            let playlists = &mut tree[directory].playlists;
            if !playlists.get(name).is_some_and(|playlist| playlist.mtime == info.modified) {
                playlists.insert(name.to_string(), PlaylistInfo::new(name, info.modified));
                self.modified = true;
            }
            if let Some(playlist) = playlists.get_mut(name) {
                playlist.mark = true;
            }
        }
        if self.mark_unchanged_virtual(directory, name, DeviceClass::Playlist, info) {
            return true;
        }

        match plugin.read_entries(self.storage.as_ref(), Path::new(path)).await {
            Ok(Capability::Supported(entries)) => {
                let mut tree = self.db.lock();
                if let Some(old) = tree.find_child(directory, name) {
                    self.editor.delete_directory(&mut tree, old);
                }
                let playlist = create_virtual(&mut tree, directory, name, DeviceClass::Playlist, info.modified);
                for (n, target) in entries.into_iter().enumerate() {
                    tree.add_song(playlist, Song::new((n + 1).to_string(), info.modified).with_target(target));
                }
                self.modified = true;
            },
            Ok(Capability::Unsupported) => {},
            Err(err) => tracing::warn!(uri = path, plugin = plugin.name(), error = ?err, "Failed to read playlist"),
        }
        true
    }

    /// Mark an existing virtual directory that doesn't need rebuilding.
    fn mark_unchanged_virtual(&self, directory: DirectoryId, name: &str, class: DeviceClass, info: &FileInfo) -> bool {
        if self.discard {
            return false;
        }
        let mut tree = self.db.lock();
        let Some(child) = tree.find_child(directory, name) else {
            return false;
        };
        let node = &mut tree[child];
        if node.device_class != class || node.mtime != info.modified {
            return false;
        }
        node.mark = true;
        true
    }

    /// Whether the entry `name` of `directory` is a symlink the
    /// configuration says not to follow.
    async fn skip_symlink(&self, directory: DirectoryId, uri: &str, name: &str) -> bool {
        let target = match self.storage.read_link(Path::new(&join(uri, name))).await {
            Ok(Some(target)) => target,
            Ok(None) => return false,
            Err(err) => {
                tracing::debug!(uri = %join(uri, name), error = ?err, "Failed to read link");
                return true;
            },
        };
        let inside = self.config.follow_inside_symlinks;
        let outside = self.config.follow_outside_symlinks;
        if !inside && !outside {
            return true;
        }
        if inside && outside {
            return false;
        }

        if target.is_absolute() {
            return match self.storage.map_to_relative(&target) {
                Some(_) => !inside,
                None => !outside,
            };
        }

        // Follow leading `..` up the tree to see whether the target leaves it.
        let tree = self.db.lock();
        let mut current = directory;
        for component in target.components() {
            match component {
                Component::CurDir => {},
                Component::ParentDir => match tree[current].parent {
                    Some(parent) => current = parent,
                    None => return !outside,
                },
                _ => break,
            }
        }
        !inside
    }

    fn delete_name_in(&mut self, directory: DirectoryId, name: &str) {
        let mut tree = self.db.lock();
        self.modified |= self.editor.delete_name_in(&mut tree, directory, name);
    }

    /// Delete everything in `directory` not seen by this walk. Mount points
    /// are kept.
    fn purge_deleted(&mut self, directory: DirectoryId) {
        let mut tree = self.db.lock();
        let children: Vec<DirectoryId> = tree[directory]
            .children
            .values()
            .copied()
            .filter(|&child| !tree[child].is_mount() && !tree[child].mark)
            .collect();
        for child in children {
            self.modified |= self.editor.delete_directory(&mut tree, child);
        }

        let songs: Vec<String> = tree[directory]
            .songs
            .values()
            .filter(|song| !song.mark)
            .map(|song| song.name.clone())
            .collect();
        for name in songs {
            self.modified |= self.editor.delete_song(&mut tree, directory, &name);
        }

        let playlists = &mut tree[directory].playlists;
        let count = playlists.len();
        playlists.retain(|_, playlist| playlist.mark);
        self.modified |= playlists.len() != count;
    }
}

async fn scan_tag(plugins: &[Arc<dyn DecoderPlugin>], storage: &dyn StorageBackend, path: &Path) -> lark_storage::error::Result<Tag> {
    for plugin in plugins {
        if let Capability::Supported(tag) = plugin.scan_file(storage, path).await? {
            return Ok(tag);
        }
    }
    Ok(Tag::default())
}

fn remove_excluded(editor: &Editor, tree: &mut DirectoryTree, directory: DirectoryId, exclude: &ExcludeList) -> bool {
    let children: Vec<DirectoryId> = tree[directory]
        .children
        .iter()
        .filter(|(name, _)| exclude.matches(name))
        .map(|(_, &child)| child)
        .collect();
    let songs: Vec<String> = tree[directory].songs.keys().filter(|name| exclude.matches(name)).cloned().collect();
    let mut modified = false;
    for child in children {
        modified |= editor.delete_directory(tree, child);
    }
    for name in songs {
        modified |= editor.delete_song(tree, directory, &name);
    }
    modified
}

fn unmark_all_in(tree: &mut DirectoryTree, directory: DirectoryId) {
    let children: Vec<DirectoryId> = tree[directory].children.values().copied().collect();
    for child in children {
        tree[child].mark = false;
    }
    let node = &mut tree[directory];
    for song in node.songs.values_mut() {
        song.mark = false;
    }
    for playlist in node.playlists.values_mut() {
        playlist.mark = false;
    }
}

fn create_virtual(
    tree: &mut DirectoryTree,
    parent: DirectoryId,
    name: &str,
    class: DeviceClass,
    mtime: OffsetDateTime,
) -> DirectoryId {
    let child = tree.create_child(parent, name);
    let node = &mut tree[child];
    node.device_class = class;
    node.mtime = mtime;
    node.mark = true;
    child
}

fn set_stat(directory: &mut Directory, info: &FileInfo) {
    directory.inode = info.inode;
    directory.device = info.device;
}

/// A virtual directory where storage now has a real one, or a directory
/// that is no longer the one recorded.
fn replaced(directory: &Directory, info: &FileInfo) -> bool {
    let known = (directory.inode, directory.device);
    directory.is_virtual() || (known != (0, 0) && known != (info.inode, info.device))
}

fn join(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        name.to_string()
    } else {
        format!("{directory}/{name}")
    }
}

/// Strip empty and `.` segments. `None` if the path climbs with `..`.
fn normalize(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {},
            ".." => return None,
            _ => parts.push(part),
        }
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ArchivePlugin, M3uPlaylist, Track};
    use crate::service::UpdateEvent;
    use async_trait::async_trait;
    use lark_db::MountedDatabase;
    use lark_storage::backend::MockBackend;
    use lark_storage::error::{ErrorKind as StorageErrorKind, Result as StorageResult};
    use lark_storage::DirEntry;
    use lark_storage::backend::{DirEntryStream, LocalBackend};
    use rstest::rstest;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, SystemTime};
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

    /// Uses the file contents as the title. Files reading `corrupt` fail.
    #[derive(Default, Clone)]
    struct TitleDecoder {
        scans: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DecoderPlugin for TitleDecoder {
        fn name(&self) -> &str {
            "title"
        }

        fn suffixes(&self) -> &[&str] {
            &["flac", "ogg"]
        }

        async fn scan_file(&self, storage: &dyn StorageBackend, path: &Path) -> StorageResult<Capability<Tag>> {
            self.scans.fetch_add(1, Ordering::Relaxed);
            let data = String::from_utf8_lossy(&storage.read(path).await?).into_owned();
            if data == "corrupt" {
                exn::bail!(StorageErrorKind::BackendError("corrupt".into()));
            }
            Ok(Capability::Supported(Tag {
                title: Some(data),
                ..Tag::default()
            }))
        }
    }

    /// Cue sheets: one track per non-empty line.
    struct CueDecoder;

    #[async_trait]
    impl DecoderPlugin for CueDecoder {
        fn name(&self) -> &str {
            "cue"
        }

        fn suffixes(&self) -> &[&str] {
            &["cue"]
        }

        async fn container_tracks(&self, storage: &dyn StorageBackend, path: &Path) -> StorageResult<Capability<Vec<Track>>> {
            let data = String::from_utf8_lossy(&storage.read(path).await?).into_owned();
            let tracks = data
                .lines()
                .filter(|line| !line.is_empty())
                .enumerate()
                .map(|(n, title)| Track {
                    name: format!("track{:03}", n + 1),
                    tag: Tag {
                        title: Some(title.to_string()),
                        ..Tag::default()
                    },
                })
                .collect();
            Ok(Capability::Supported(tracks))
        }
    }

    /// Archives whose contents are a list of entry paths.
    struct ListArchive;

    #[async_trait]
    impl ArchivePlugin for ListArchive {
        fn name(&self) -> &str {
            "list"
        }

        fn suffixes(&self) -> &[&str] {
            &["zip"]
        }

        async fn list_entries(&self, storage: &dyn StorageBackend, path: &Path) -> StorageResult<Vec<Track>> {
            let data = String::from_utf8_lossy(&storage.read(path).await?).into_owned();
            Ok(data.lines().map(Track::new).collect())
        }
    }

    fn registry(decoder: &TitleDecoder) -> Arc<Registry> {
        let registry = Registry::new()
            .with_decoder(decoder.clone())
            .with_decoder(CueDecoder)
            .with_archive(ListArchive)
            .with_playlist(M3uPlaylist);
        Arc::new(registry)
    }

    /// Raises a walk's cancel flag while listing one directory.
    struct CancellingBackend {
        inner: Arc<MockBackend>,
        at: PathBuf,
        cancel: OnceLock<Arc<AtomicBool>>,
    }

    #[async_trait]
    impl StorageBackend for CancellingBackend {
        fn name(&self) -> &str {
            "cancelling"
        }

        async fn stat(&self, path: &Path) -> StorageResult<FileInfo> {
            self.inner.stat(path).await
        }

        fn read_dir_stream<'a>(&'a self, path: &'a Path) -> DirEntryStream<'a> {
            self.inner.read_dir_stream(path)
        }

        async fn read_dir(&self, path: &Path) -> StorageResult<Vec<DirEntry>> {
            if path == self.at
                && let Some(cancel) = self.cancel.get()
            {
                cancel.store(true, Ordering::Relaxed);
            }
            self.inner.read_dir(path).await
        }

        async fn read(&self, path: &Path) -> StorageResult<Vec<u8>> {
            self.inner.read(path).await
        }

        async fn exists(&self, path: &Path) -> StorageResult<bool> {
            self.inner.exists(path).await
        }

        async fn read_link(&self, path: &Path) -> StorageResult<Option<PathBuf>> {
            self.inner.read_link(path).await
        }
    }

    struct Fixture {
        storage: Arc<MockBackend>,
        db: Arc<SimpleDatabase>,
        removed: RemoveQueue,
        decoder: TitleDecoder,
        _events: UnboundedReceiver<UpdateEvent>,
    }

    impl Fixture {
        fn new(files: &[(&str, &str)]) -> Self {
            let (tx, rx) = unbounded_channel();
            Self {
                storage: Arc::new(MockBackend::with_files(files.iter().copied())),
                db: Arc::new(SimpleDatabase::new("unused.json")),
                removed: RemoveQueue::new(tx),
                decoder: TitleDecoder::default(),
                _events: rx,
            }
        }

        fn walker(&self, config: UpdateConfig) -> UpdateWalk {
            let storage: BackendHandle = self.storage.clone();
            UpdateWalk::new(config, registry(&self.decoder), storage, self.db.clone(), self.removed.clone())
        }

        async fn walk(&self, path: &str, discard: bool) -> bool {
            self.walker(UpdateConfig::default()).walk(path, discard).await
        }

        fn paths(&self) -> Vec<String> {
            self.db.lock().walk_paths()
        }

        fn title(&self, uri: &str) -> Option<String> {
            let tree = self.db.lock();
            let (directory, name) = uri.rsplit_once('/').unwrap_or(("", uri));
            let lookup = tree.lookup_directory(directory);
            assert!(lookup.rest.is_none(), "no directory {directory}");
            tree.find_song(lookup.directory, name)?.tag.title.clone()
        }

        fn scans(&self) -> usize {
            self.decoder.scans.load(Ordering::Relaxed)
        }
    }

    const LIBRARY: &[(&str, &str)] = &[
        ("Artist/Album/01.flac", "One"),
        ("Artist/Album/02.flac", "Two"),
        ("Artist/Album/cover.jpg", ""),
        ("loose.ogg", "Loose"),
    ];

    #[tokio::test]
    async fn test_initial_walk() {
        let fixture = Fixture::new(LIBRARY);
        assert!(fixture.walk("", false).await);
        assert_eq!(
            fixture.paths(),
            ["Artist/", "Artist/Album/", "Artist/Album/01.flac", "Artist/Album/02.flac", "loose.ogg"]
        );
        assert_eq!(fixture.title("Artist/Album/02.flac").as_deref(), Some("Two"));
        assert!(fixture.removed.take().is_empty());
    }

    #[tokio::test]
    async fn test_walk_is_idempotent() {
        let fixture = Fixture::new(LIBRARY);
        assert!(fixture.walk("", false).await);
        let before = fixture.paths();
        let scans = fixture.scans();

        assert!(!fixture.walk("", false).await);
        assert_eq!(fixture.paths(), before);
        assert_eq!(fixture.scans(), scans);
        assert!(fixture.removed.is_empty());
    }

    #[tokio::test]
    async fn test_discard_rescans() {
        let fixture = Fixture::new(LIBRARY);
        fixture.walk("", false).await;
        assert_eq!(fixture.scans(), 3);
        assert!(fixture.walk("", true).await);
        assert_eq!(fixture.scans(), 6);
        assert!(fixture.removed.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_file_is_reported_once() {
        let fixture = Fixture::new(&[("a.flac", "A"), ("b.flac", "B"), ("c.flac", "C")]);
        fixture.walk("", false).await;
        fixture.storage.remove("b.flac").await;

        assert!(fixture.walk("", false).await);
        assert_eq!(fixture.removed.take(), ["b.flac"]);
        assert_eq!(fixture.paths(), ["a.flac", "c.flac"]);
    }

    #[tokio::test]
    async fn test_deleted_directory() {
        let fixture = Fixture::new(LIBRARY);
        fixture.walk("", false).await;
        fixture.storage.remove("Artist").await;

        assert!(fixture.walk("", false).await);
        assert_eq!(fixture.removed.take(), ["Artist/Album/01.flac", "Artist/Album/02.flac"]);
        assert_eq!(fixture.paths(), ["loose.ogg"]);
    }

    #[tokio::test]
    async fn test_changed_song_is_rescanned() {
        let fixture = Fixture::new(LIBRARY);
        fixture.walk("", false).await;
        fixture.storage.insert_file("loose.ogg", "Retitled").await;

        assert!(fixture.walk("", false).await);
        assert_eq!(fixture.scans(), 4);
        assert_eq!(fixture.title("loose.ogg").as_deref(), Some("Retitled"));
        assert!(fixture.removed.is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_song() {
        let fixture = Fixture::new(&[("good.flac", "Good"), ("bad.flac", "corrupt")]);
        fixture.walk("", false).await;
        assert_eq!(fixture.paths(), ["good.flac"]);

        fixture.storage.insert_file("good.flac", "corrupt").await;
        assert!(fixture.walk("", false).await);
        assert_eq!(fixture.removed.take(), ["good.flac"]);
        assert!(fixture.paths().is_empty());
    }

    #[tokio::test]
    async fn test_replaced_directory_is_rebuilt() {
        let fixture = Fixture::new(LIBRARY);
        fixture.walk("", false).await;
        fixture.storage.remove("Artist").await;
        fixture.storage.insert_file("Artist/Album/01.flac", "One").await;

        assert!(fixture.walk("", false).await);
        assert_eq!(fixture.removed.take(), ["Artist/Album/01.flac", "Artist/Album/02.flac"]);
        assert_eq!(fixture.paths(), ["Artist/", "Artist/Album/", "Artist/Album/01.flac", "loose.ogg"]);
    }

    #[tokio::test]
    async fn test_exclude_list() {
        let fixture = Fixture::new(LIBRARY);
        fixture.walk("", false).await;
        fixture.storage.insert_file("Artist/.mpdignore", "# no live albums\n0?.flac\n").await;

        assert!(fixture.walk("", false).await);
        assert_eq!(fixture.removed.take(), ["Artist/Album/01.flac", "Artist/Album/02.flac"]);
        assert_eq!(fixture.paths(), ["Artist/", "Artist/Album/", "loose.ogg"]);
    }

    #[tokio::test]
    async fn test_excluded_directory() {
        let fixture = Fixture::new(LIBRARY);
        fixture.walk("", false).await;
        fixture.storage.insert_file(".mpdignore", "Artist\n").await;

        assert!(fixture.walk("", false).await);
        assert_eq!(fixture.paths(), ["loose.ogg"]);
    }

    #[rstest]
    #[case(true, true, true)]
    #[case(true, false, true)]
    #[case(false, true, false)]
    #[case(false, false, false)]
    #[tokio::test]
    async fn test_inside_symlinks(#[case] inside: bool, #[case] outside: bool, #[case] followed: bool) {
        let fixture = Fixture::new(LIBRARY);
        fixture.storage.insert_symlink("Relative", "Artist/Album").await;
        fixture.storage.insert_symlink("Absolute", "/mock/Artist/Album").await;
        fixture.storage.insert_symlink("Artist/Up.ogg", "../loose.ogg").await;
        let config = UpdateConfig {
            follow_inside_symlinks: inside,
            follow_outside_symlinks: outside,
        };
        fixture.walker(config).walk("", false).await;

        let paths = fixture.paths();
        for linked in ["Relative/01.flac", "Absolute/01.flac", "Artist/Up.ogg"] {
            assert_eq!(paths.contains(&linked.to_string()), followed, "{linked}");
        }
        assert!(paths.contains(&"Artist/Album/01.flac".to_string()));
    }

    #[tokio::test]
    async fn test_outside_symlink_skipped_removes_entry() {
        let fixture = Fixture::new(LIBRARY);
        fixture.walk("", false).await;
        fixture.storage.remove("loose.ogg").await;
        fixture.storage.insert_symlink("loose.ogg", "../../elsewhere/loose.ogg").await;
        let config = UpdateConfig {
            follow_inside_symlinks: true,
            follow_outside_symlinks: false,
        };

        assert!(fixture.walker(config).walk("", false).await);
        assert_eq!(fixture.removed.take(), ["loose.ogg"]);
    }

    #[tokio::test]
    async fn test_symlink_loop() {
        let fixture = Fixture::new(LIBRARY);
        fixture.storage.insert_symlink("Artist/Album/Again", "../..").await;
        fixture.walk("", false).await;
        assert!(!fixture.paths().iter().any(|path| path.contains("Again")));
    }

    #[tokio::test]
    async fn test_container() {
        let fixture = Fixture::new(&[("Album/album.cue", "Intro\nOutro\n")]);
        assert!(fixture.walk("", false).await);
        assert_eq!(
            fixture.paths(),
            ["Album/", "Album/album.cue/", "Album/album.cue/track001", "Album/album.cue/track002"]
        );
        assert_eq!(fixture.title("Album/album.cue/track002").as_deref(), Some("Outro"));
        assert!(!fixture.walk("", false).await);

        fixture.storage.insert_file("Album/album.cue", "Intro\n").await;
        assert!(fixture.walk("", false).await);
        assert_eq!(fixture.paths(), ["Album/", "Album/album.cue/", "Album/album.cue/track001"]);
        assert_eq!(
            fixture.removed.take(),
            ["Album/album.cue/track001", "Album/album.cue/track002"]
        );
    }

    #[tokio::test]
    async fn test_archive() {
        let fixture = Fixture::new(&[("music.zip", "Disc 1/01.flac\nDisc 1/notes.txt\n02.ogg\n")]);
        assert!(fixture.walk("", false).await);
        assert_eq!(
            fixture.paths(),
            ["music.zip/", "music.zip/02.ogg", "music.zip/Disc 1/", "music.zip/Disc 1/01.flac"]
        );
        assert!(!fixture.walk("", false).await);
        assert_eq!(fixture.scans(), 0);

        fixture.storage.remove("music.zip").await;
        assert!(fixture.walk("", false).await);
        assert!(fixture.paths().is_empty());
    }

    #[tokio::test]
    async fn test_playlist() {
        let fixture = Fixture::new(&[
            ("Album/01.flac", "One"),
            ("Album/02.flac", "Two"),
            ("mix.m3u", "#EXTM3U\nAlbum/01.flac\nAlbum/03.flac\n"),
        ]);
        assert!(fixture.walk("", false).await);
        assert_eq!(
            fixture.paths(),
            ["Album/", "Album/01.flac", "Album/02.flac", "mix.m3u", "mix.m3u/", "mix.m3u/1"]
        );
        assert_eq!(fixture.removed.take(), ["mix.m3u/2"]);
        let tree = fixture.db.lock();
        let album = tree.find_child(tree.root(), "Album").unwrap();
        assert!(tree.find_song(album, "01.flac").unwrap().in_playlist);
        assert!(!tree.find_song(album, "02.flac").unwrap().in_playlist);
    }

    #[tokio::test]
    async fn test_partial_update() {
        let fixture = Fixture::new(LIBRARY);
        fixture.walk("", false).await;
        fixture.storage.insert_file("New/Album/01.flac", "New").await;
        fixture.storage.remove("loose.ogg").await;

        assert!(fixture.walk("New/Album/01.flac", false).await);
        assert!(fixture.paths().contains(&"New/Album/01.flac".to_string()));
        assert!(fixture.paths().contains(&"loose.ogg".to_string()));

        assert!(fixture.walk("/loose.ogg/", false).await);
        assert_eq!(fixture.removed.take(), ["loose.ogg"]);

        assert!(!fixture.walk("Missing/song.flac", false).await);
        assert!(!fixture.walk("../escape", false).await);
    }

    #[tokio::test]
    async fn test_partial_update_replaces_song_with_directory() {
        let fixture = Fixture::new(&[("Thing/01.flac", "One")]);
        {
            let mut tree = fixture.db.lock();
            let root = tree.root();
            tree.add_song(root, Song::new("Thing", OffsetDateTime::UNIX_EPOCH));
        }

        assert!(fixture.walk("Thing/01.flac", false).await);
        assert_eq!(fixture.removed.take(), ["Thing"]);
        assert_eq!(fixture.paths(), ["Thing/", "Thing/01.flac"]);
    }

    #[tokio::test]
    async fn test_cancelled_walk_keeps_tree() {
        let fixture = Fixture::new(LIBRARY);
        fixture.walk("", false).await;
        fixture.storage.remove("loose.ogg").await;

        let mut walk = fixture.walker(UpdateConfig::default());
        walk.cancel();
        assert!(!walk.walk("", false).await);
        assert!(fixture.paths().contains(&"loose.ogg".to_string()));
        assert!(fixture.removed.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_during_walk() {
        let fixture = Fixture::new(&[("A/1.flac", "1"), ("B/2.flac", "2"), ("z.flac", "Z")]);
        assert!(fixture.walk("", false).await);
        fixture.storage.insert_file("A/new.flac", "New").await;
        fixture.storage.remove("B/2.flac").await;
        fixture.storage.remove("z.flac").await;

        let storage = Arc::new(CancellingBackend {
            inner: Arc::clone(&fixture.storage),
            at: PathBuf::from("A"),
            cancel: OnceLock::new(),
        });
        let mut walk = UpdateWalk::new(
            UpdateConfig::default(),
            registry(&fixture.decoder),
            storage.clone(),
            fixture.db.clone(),
            fixture.removed.clone(),
        );
        storage.cancel.set(walk.cancel_flag()).unwrap();

        // Stops inside "A": nothing after it is visited and nothing is purged.
        assert!(!walk.walk("", false).await);
        let paths = fixture.paths();
        assert!(!paths.contains(&"A/new.flac".to_string()));
        assert!(paths.contains(&"B/2.flac".to_string()));
        assert!(paths.contains(&"z.flac".to_string()));
        assert!(fixture.removed.is_empty());

        assert!(fixture.walk("", false).await);
        let mut removed = fixture.removed.take();
        removed.sort();
        assert_eq!(removed, ["B/2.flac", "z.flac"]);
        assert!(fixture.paths().contains(&"A/new.flac".to_string()));
    }

    #[tokio::test]
    async fn test_reloaded_database_is_unchanged() {
        let temp = tempfile::tempdir().unwrap();
        let music = temp.path().join("music");
        let mtime = SystemTime::UNIX_EPOCH + Duration::new(1_700_000_000, 123_456_789);
        for (path, contents) in [
            ("Artist/01.flac", "One"),
            ("Artist/album.cue", "Intro\nOutro"),
            ("mix.m3u", "Artist/01.flac\n"),
        ] {
            let path = music.join(path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, contents).unwrap();
            let file = std::fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(mtime).unwrap();
        }
        let storage: BackendHandle = Arc::new(LocalBackend::new("music", &music).unwrap());
        let path = temp.path().join("db.json");
        let (tx, _rx) = unbounded_channel();
        let removed = RemoveQueue::new(tx);
        let decoder = TitleDecoder::default();
        let walker = |db: &Arc<SimpleDatabase>| {
            UpdateWalk::new(
                UpdateConfig::default(),
                registry(&decoder),
                Arc::clone(&storage),
                Arc::clone(db),
                removed.clone(),
            )
        };

        let db = Arc::new(SimpleDatabase::new(&path));
        assert!(walker(&db).walk("", false).await);
        db.save().unwrap();
        let scans = decoder.scans.load(Ordering::Relaxed);
        assert!(removed.is_empty());

        let reloaded = Arc::new(SimpleDatabase::open(&path).unwrap());
        assert_eq!(reloaded.lock().walk_paths(), db.lock().walk_paths());
        assert!(!walker(&reloaded).walk("", false).await);
        assert_eq!(decoder.scans.load(Ordering::Relaxed), scans);
        assert!(removed.is_empty());
        assert_eq!(reloaded.lock().walk_paths(), db.lock().walk_paths());
    }

    #[tokio::test]
    async fn test_mounts_are_left_alone() {
        let fixture = Fixture::new(LIBRARY);
        fixture.storage.insert_file("usb/ignored.flac", "Ignored").await;
        fixture.db.mount("usb", MountedDatabase::Proxy { name: "usb".to_string() });
        fixture.db.mount("nas", MountedDatabase::Proxy { name: "nas".to_string() });

        fixture.walk("", false).await;
        let paths = fixture.paths();
        assert!(paths.contains(&"usb/".to_string()));
        assert!(paths.contains(&"nas/".to_string()));
        assert!(!paths.contains(&"usb/ignored.flac".to_string()));
        assert!(!fixture.walk("usb/ignored.flac", false).await);
    }

    #[rstest]
    #[case("", Some(""))]
    #[case("/Artist//Album/", Some("Artist/Album"))]
    #[case("./Artist", Some("Artist"))]
    #[case("Artist/../..", None)]
    fn test_normalize(#[case] path: &str, #[case] expected: Option<&str>) {
        assert_eq!(normalize(path).as_deref(), expected);
    }
}
