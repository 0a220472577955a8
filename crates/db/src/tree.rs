//! The directory tree.
//!
//! Directories live in an arena and refer to each other by [`DirectoryId`],
//! so parents can be reached from children without reference cycles.

use crate::models::{DeviceClass, Directory, DirectoryId, MountedDatabase, Song};
use std::ops::{Index, IndexMut};

/// Result of [`DirectoryTree::lookup_directory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    /// Deepest directory found along the URI.
    pub directory: DirectoryId,
    /// The lookup stopped because `directory` is a mount point.
    pub is_mount: bool,
    /// Remainder of the URI below `directory`, if any.
    pub rest: Option<String>,
}

/// A tree of directories, songs and playlists rooted at one directory.
#[derive(Debug, Clone)]
pub struct DirectoryTree {
    nodes: Vec<Option<Directory>>,
    free: Vec<usize>,
    root: DirectoryId,
}

impl Default for DirectoryTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<DirectoryId> for DirectoryTree {
    type Output = Directory;

    fn index(&self, id: DirectoryId) -> &Directory {
        match self.nodes.get(id.0) {
            Some(Some(directory)) => directory,
            _ => panic!("stale directory id {}", id.0),
        }
    }
}

impl IndexMut<DirectoryId> for DirectoryTree {
    fn index_mut(&mut self, id: DirectoryId) -> &mut Directory {
        match self.nodes.get_mut(id.0) {
            Some(Some(directory)) => directory,
            _ => panic!("stale directory id {}", id.0),
        }
    }
}

impl DirectoryTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(Directory::new("", None))],
            free: Vec::new(),
            root: DirectoryId(0),
        }
    }

    pub fn root(&self) -> DirectoryId {
        self.root
    }

    /// Whether `id` still refers to a live directory.
    pub fn contains(&self, id: DirectoryId) -> bool {
        matches!(self.nodes.get(id.0), Some(Some(_)))
    }

    pub fn find_child(&self, parent: DirectoryId, name: &str) -> Option<DirectoryId> {
        self[parent].children.get(name).copied()
    }

    /// Create a child directory. Replaces nothing: callers check
    /// [`find_child`](Self::find_child) first.
    pub fn create_child(&mut self, parent: DirectoryId, name: &str) -> DirectoryId {
        let directory = Directory::new(name, Some(parent));
        let id = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(directory);
                DirectoryId(slot)
            },
            None => {
                self.nodes.push(Some(directory));
                DirectoryId(self.nodes.len() - 1)
            },
        };
        self[parent].children.insert(name.to_string(), id);
        id
    }

    /// Find or create a child directory.
    pub fn make_child(&mut self, parent: DirectoryId, name: &str) -> DirectoryId {
        match self.find_child(parent, name) {
            Some(id) => id,
            None => self.create_child(parent, name),
        }
    }

    pub fn find_song(&self, directory: DirectoryId, name: &str) -> Option<&Song> {
        self[directory].songs.get(name)
    }

    pub fn find_song_mut(&mut self, directory: DirectoryId, name: &str) -> Option<&mut Song> {
        self[directory].songs.get_mut(name)
    }

    /// Add or replace a song.
    pub fn add_song(&mut self, directory: DirectoryId, song: Song) {
        self[directory].songs.insert(song.name.clone(), song);
    }

    /// Remove a song, returning its URI.
    pub fn delete_song(&mut self, directory: DirectoryId, name: &str) -> Option<String> {
        self[directory].songs.remove(name)?;
        Some(self.song_uri(directory, name))
    }

    /// Delete a directory and everything below it, deepest first, and
    /// detach it from its parent. Returns the URIs of all removed songs in
    /// removal order.
    ///
    /// The root can't be deleted; it is emptied instead.
    pub fn delete_directory(&mut self, id: DirectoryId) -> Vec<String> {
        let mut removed = Vec::new();
        self.delete_contents(id, &mut removed);
        match self[id].parent {
            Some(parent) => {
                let name = self[id].name.clone();
                self[parent].children.remove(&name);
                self.nodes[id.0] = None;
                self.free.push(id.0);
            },
            None => self[id].playlists.clear(),
        }
        removed
    }

    fn delete_contents(&mut self, id: DirectoryId, removed: &mut Vec<String>) {
        let children: Vec<DirectoryId> = self[id].children.values().copied().collect();
        for child in children {
            self.delete_contents(child, removed);
            self.nodes[child.0] = None;
            self.free.push(child.0);
        }
        self[id].children.clear();
        let uri = self.uri_of(id);
        let songs = std::mem::take(&mut self[id].songs);
        removed.extend(songs.into_keys().map(|name| join(&uri, &name)));
    }

    /// Remove whatever child directory, song or playlist is called `name`.
    /// Returns the removed song URIs and whether anything was removed.
    pub fn delete_name_in(&mut self, directory: DirectoryId, name: &str) -> (Vec<String>, bool) {
        let mut removed = Vec::new();
        let mut modified = false;
        if let Some(child) = self.find_child(directory, name) {
            removed.extend(self.delete_directory(child));
            modified = true;
        }
        if let Some(uri) = self.delete_song(directory, name) {
            removed.push(uri);
            modified = true;
        }
        modified |= self[directory].playlists.remove(name).is_some();
        (removed, modified)
    }

    /// URI of a directory relative to the root, empty for the root itself.
    pub fn uri_of(&self, id: DirectoryId) -> String {
        let mut names = Vec::new();
        let mut current = id;
        while let Some(parent) = self[current].parent {
            names.push(self[current].name.as_str());
            current = parent;
        }
        names.reverse();
        names.join("/")
    }

    pub fn song_uri(&self, directory: DirectoryId, name: &str) -> String {
        join(&self.uri_of(directory), name)
    }

    /// Walk down `uri` as far as the tree goes, stopping at mount points.
    pub fn lookup_directory(&self, uri: &str) -> LookupResult {
        let parts: Vec<&str> = uri.split('/').filter(|part| !part.is_empty()).collect();
        let mut current = self.root;
        for (n, name) in parts.iter().enumerate() {
            let Some(child) = self.find_child(current, name) else {
                return LookupResult {
                    directory: current,
                    is_mount: false,
                    rest: Some(parts[n..].join("/")),
                };
            };
            current = child;
            if self[child].is_mount() {
                let rest = parts[n + 1..].join("/");
                return LookupResult {
                    directory: child,
                    is_mount: true,
                    rest: (!rest.is_empty()).then_some(rest),
                };
            }
        }
        LookupResult {
            directory: current,
            is_mount: false,
            rest: None,
        }
    }

    /// Mount another database at `uri`, creating parents as needed.
    pub fn mount(&mut self, uri: &str, database: MountedDatabase) -> DirectoryId {
        let mut current = self.root;
        for name in uri.split('/').filter(|part| !part.is_empty()) {
            current = self.make_child(current, name);
        }
        let directory = &mut self[current];
        directory.device_class = DeviceClass::Mount;
        directory.mounted = Some(database);
        current
    }

    /// Remove the mount at `uri`. Returns `false` if nothing is mounted there.
    pub fn unmount(&mut self, uri: &str) -> bool {
        let lookup = self.lookup_directory(uri);
        if !lookup.is_mount || lookup.rest.is_some() {
            return false;
        }
        self.delete_directory(lookup.directory);
        true
    }

    /// Every directory, song and playlist URI in the tree, sorted.
    /// Directories carry a trailing `/`. Mounted databases are not entered.
    pub fn walk_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let directory = &self[id];
            let uri = self.uri_of(id);
            if !directory.is_root() {
                paths.push(format!("{uri}/"));
            }
            paths.extend(directory.songs.keys().map(|name| join(&uri, name)));
            paths.extend(directory.playlists.keys().map(|name| join(&uri, name)));
            stack.extend(directory.children.values().copied());
        }
        paths.sort();
        paths
    }

    pub fn song_count(&self) -> usize {
        self.nodes.iter().flatten().map(|directory| directory.songs.len()).sum()
    }

    pub fn directory_count(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    /// Reset the `in_playlist` flag of every song.
    pub fn clear_in_playlist(&mut self) {
        for directory in self.nodes.iter_mut().flatten() {
            for song in directory.songs.values_mut() {
                song.in_playlist = false;
            }
        }
    }

    /// Remove playlist entries whose target song no longer exists and flag
    /// the targets that do. Returns the URIs of removed entries.
    pub fn purge_dangling_from_playlists(&mut self) -> Vec<String> {
        let playlists: Vec<DirectoryId> = (0..self.nodes.len())
            .filter(|&n| matches!(&self.nodes[n], Some(d) if d.device_class == DeviceClass::Playlist))
            .map(DirectoryId)
            .collect();
        let mut removed = Vec::new();
        for playlist in playlists {
            // Targets are relative to the directory holding the playlist file.
            let Some(base) = self[playlist].parent else {
                continue;
            };
            let entries: Vec<(String, Option<String>)> = self[playlist]
                .songs
                .values()
                .map(|song| (song.name.clone(), song.target.clone()))
                .collect();
            for (name, target) in entries {
                let Some(target) = target else {
                    continue;
                };
                if target.contains("://") || target.starts_with('/') {
                    continue;
                }
                match self.resolve_song(base, &target) {
                    Some((directory, song)) => {
                        if let Some(song) = self.find_song_mut(directory, &song) {
                            song.in_playlist = true;
                        }
                    },
                    None => removed.extend(self.delete_song(playlist, &name)),
                }
            }
        }
        removed
    }

    /// Resolve a relative song URI (may contain `..`) from `base`.
    fn resolve_song(&self, base: DirectoryId, uri: &str) -> Option<(DirectoryId, String)> {
        let (path, name) = match uri.rsplit_once('/') {
            Some((path, name)) => (path, name),
            None => ("", uri),
        };
        let mut current = base;
        for part in path.split('/').filter(|part| !part.is_empty() && *part != ".") {
            current = match part {
                ".." => self[current].parent?,
                _ => self.find_child(current, part)?,
            };
        }
        self[current].songs.contains_key(name).then(|| (current, name.to_string()))
    }
}

fn join(directory: &str, name: &str) -> String {
    if directory.is_empty() {
        name.to_string()
    } else {
        format!("{directory}/{name}")
    }
}
