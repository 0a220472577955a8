//! Plugins the walk consults to decide what a file is.
//!
//! A [`Registry`] is built once and shared. Plugins are looked up by file
//! name suffix, case-insensitively, in registration order.

use async_trait::async_trait;
use exn::ResultExt;
use lark_db::Tag;
use lark_storage::StorageBackend;
use lark_storage::error::{ErrorKind, Result};
use std::path::Path;
use std::sync::Arc;

/// Result of an optional plugin operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability<T> {
    Supported(T),
    /// The plugin doesn't implement this operation.
    Unsupported,
}

/// A song inside a container or archive file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    /// Name of the virtual song. Archive entries may contain `/`.
    pub name: String,
    pub tag: Tag,
}
impl Track {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: Tag::default(),
        }
    }
}

/// Something that can play files with certain suffixes.
#[async_trait]
pub trait DecoderPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Lowercase suffixes, without the dot.
    fn suffixes(&self) -> &[&str];

    /// Read the tags of a song file.
    async fn scan_file(&self, _storage: &dyn StorageBackend, _path: &Path) -> Result<Capability<Tag>> {
        Ok(Capability::Unsupported)
    }

    /// List the tracks of a file holding several songs. An empty list means
    /// the file is a plain song after all.
    async fn container_tracks(&self, _storage: &dyn StorageBackend, _path: &Path) -> Result<Capability<Vec<Track>>> {
        Ok(Capability::Unsupported)
    }
}

/// Something that understands playlist files.
#[async_trait]
pub trait PlaylistPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn suffixes(&self) -> &[&str];

    /// URIs listed in the playlist, relative to the directory holding it.
    async fn read_entries(&self, _storage: &dyn StorageBackend, _path: &Path) -> Result<Capability<Vec<String>>> {
        Ok(Capability::Unsupported)
    }
}

/// Something that can list the contents of archive files.
#[async_trait]
pub trait ArchivePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn suffixes(&self) -> &[&str];

    async fn list_entries(&self, storage: &dyn StorageBackend, path: &Path) -> Result<Vec<Track>>;
}

/// A decoder known only by its suffixes. Songs it claims get empty tags.
#[derive(Debug, Clone)]
pub struct SuffixDecoder {
    name: String,
    suffixes: Vec<&'static str>,
}
impl SuffixDecoder {
    pub fn new(name: impl Into<String>, suffixes: &[&'static str]) -> Self {
        Self {
            name: name.into(),
            suffixes: suffixes.to_vec(),
        }
    }
}

#[async_trait]
impl DecoderPlugin for SuffixDecoder {
    fn name(&self) -> &str {
        &self.name
    }

    fn suffixes(&self) -> &[&str] {
        &self.suffixes
    }
}

/// Extended M3U playlists. Every line that isn't blank or a `#` directive
/// is an entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct M3uPlaylist;

#[async_trait]
impl PlaylistPlugin for M3uPlaylist {
    fn name(&self) -> &str {
        "m3u"
    }

    fn suffixes(&self) -> &[&str] {
        &["m3u", "m3u8"]
    }

    async fn read_entries(&self, storage: &dyn StorageBackend, path: &Path) -> Result<Capability<Vec<String>>> {
        let data = storage.read(path).await?;
        let text = String::from_utf8(data).or_raise(|| ErrorKind::BackendError("playlist is not UTF-8".into()))?;
        let entries = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.replace('\\', "/"))
            .collect();
        Ok(Capability::Supported(entries))
    }
}

#[derive(Default, Clone)]
pub struct Registry {
    decoders: Vec<Arc<dyn DecoderPlugin>>,
    playlists: Vec<Arc<dyn PlaylistPlugin>>,
    archives: Vec<Arc<dyn ArchivePlugin>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("decoders", &self.decoders.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("playlists", &self.playlists.iter().map(|p| p.name()).collect::<Vec<_>>())
            .field("archives", &self.archives.iter().map(|p| p.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_decoder(mut self, plugin: impl DecoderPlugin + 'static) -> Self {
        self.decoders.push(Arc::new(plugin));
        self
    }

    pub fn with_playlist(mut self, plugin: impl PlaylistPlugin + 'static) -> Self {
        self.playlists.push(Arc::new(plugin));
        self
    }

    pub fn with_archive(mut self, plugin: impl ArchivePlugin + 'static) -> Self {
        self.archives.push(Arc::new(plugin));
        self
    }

    /// Decoders claiming `suffix`, in registration order.
    pub fn decoders_for(&self, suffix: &str) -> Vec<Arc<dyn DecoderPlugin>> {
        self.decoders.iter().filter(|p| claims(p.suffixes(), suffix)).cloned().collect()
    }

    pub fn playlist_for(&self, suffix: &str) -> Option<Arc<dyn PlaylistPlugin>> {
        self.playlists.iter().find(|p| claims(p.suffixes(), suffix)).cloned()
    }

    pub fn archive_for(&self, suffix: &str) -> Option<Arc<dyn ArchivePlugin>> {
        self.archives.iter().find(|p| claims(p.suffixes(), suffix)).cloned()
    }

    /// Whether a file with this name would be added as a song.
    pub fn is_song(&self, name: &str) -> bool {
        suffix_of(name).is_some_and(|suffix| self.decoders.iter().any(|p| claims(p.suffixes(), suffix)))
    }
}

fn claims(suffixes: &[&str], suffix: &str) -> bool {
    suffixes.iter().any(|s| s.eq_ignore_ascii_case(suffix))
}

/// The part of a file name after the last dot, if there is one and the
/// name isn't just a dotfile.
pub(crate) fn suffix_of(name: &str) -> Option<&str> {
    match name.rsplit_once('.') {
        Some((stem, suffix)) if !stem.is_empty() && !suffix.is_empty() => Some(suffix),
        _ => None,
    }
}
