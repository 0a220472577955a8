//! In-memory storage backend for testing.

use super::DirEntryStream;
use crate::StorageBackend;
use crate::error::{ErrorKind, Result};
use crate::models::{DirEntry, FileInfo, FileKind};
use crate::path::validate as validate_path;
use async_stream::stream;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Absolute path the mock pretends to be mounted at, for symlink targets.
pub const MOCK_ROOT: &str = "/mock";
const DEVICE: u64 = 1;
const MAX_SYMLINK_DEPTH: usize = 8;

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, modified: i64, inode: u64 },
    Dir { modified: i64, inode: u64 },
    Symlink { target: PathBuf },
}

/// In-memory storage backend for testing.
///
/// A tree of files, directories and symlinks behind a [`RwLock`]. Every
/// mutation advances a logical clock by one second, and the new time becomes
/// the modification time of the entry and of its parent directory, the same
/// way adding or removing a file touches its directory on disk. Every entry
/// gets a unique inode.
///
/// # Examples
///
/// ```
/// use lark_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("Artist/01.flac", b"fLaC"),
/// ]);
/// assert!(backend.stat(Path::new("Artist")).await?.is_directory());
///
/// backend.insert_file("Artist/02.flac", b"fLaC").await;
/// assert_eq!(backend.read_dir(Path::new("Artist")).await?.len(), 2);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    clock: AtomicI64,
    inodes: AtomicU64,
    nodes: RwLock<BTreeMap<PathBuf, Node>>,
}

impl MockBackend {
    /// Create a mock backend pre-populated with files. Parent directories
    /// are created implicitly.
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut backend = Self {
            name: "mock".to_string(),
            clock: AtomicI64::new(1_700_000_000),
            inodes: AtomicU64::new(1),
            nodes: RwLock::new(BTreeMap::new()),
        };
        let mut nodes = BTreeMap::new();
        let now = backend.tick();
        nodes.insert(PathBuf::new(), Node::Dir { modified: now, inode: backend.next_inode() });
        for (path, data) in files {
            let path = Self::checked(path.into());
            backend.place(&mut nodes, path, |inode| Node::File { data: data.into(), modified: now, inode }, now);
        }
        *backend.nodes.get_mut() = nodes;
        backend
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn checked(path: PathBuf) -> PathBuf {
        let Ok(validated) = validate_path(&path) else {
            // The panic here is DELIBERATE. MockBackend is intended to be
            // used in tests; panics are expected. There is no error result.
            panic!("MockBackend: invalid path {}", path.display());
        };
        validated
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn next_inode(&self) -> u64 {
        self.inodes.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a node, creating missing parents and touching the direct parent.
    fn place(&self, nodes: &mut BTreeMap<PathBuf, Node>, path: PathBuf, node: impl FnOnce(u64) -> Node, now: i64) {
        let mut ancestor = PathBuf::new();
        if let Some(parent) = path.parent() {
            for component in parent.components() {
                ancestor.push(component);
                nodes
                    .entry(ancestor.clone())
                    .or_insert_with(|| Node::Dir { modified: now, inode: self.next_inode() });
            }
        }
        let inode = match nodes.get(&path) {
            Some(Node::File { inode, .. } | Node::Dir { inode, .. }) => *inode,
            _ => self.next_inode(),
        };
        nodes.insert(path.clone(), node(inode));
        Self::touch_parent(nodes, &path, now);
    }

    fn touch_parent(nodes: &mut BTreeMap<PathBuf, Node>, path: &Path, now: i64) {
        if let Some(Node::Dir { modified, .. }) = path.parent().and_then(|parent| nodes.get_mut(parent)) {
            *modified = now;
        }
    }

    /// Create or replace a file.
    pub async fn insert_file(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        let path = Self::checked(path.into());
        let now = self.tick();
        let data = data.into();
        let mut nodes = self.nodes.write().await;
        self.place(&mut nodes, path, |inode| Node::File { data, modified: now, inode }, now);
    }

    /// Create a directory (and its parents).
    pub async fn insert_dir(&self, path: impl Into<PathBuf>) {
        let path = Self::checked(path.into());
        let now = self.tick();
        let mut nodes = self.nodes.write().await;
        self.place(&mut nodes, path, |inode| Node::Dir { modified: now, inode }, now);
    }

    /// Create a symlink. Relative targets resolve against the link's
    /// directory; absolute ones against [`MOCK_ROOT`].
    pub async fn insert_symlink(&self, path: impl Into<PathBuf>, target: impl Into<PathBuf>) {
        let path = Self::checked(path.into());
        let target = target.into();
        let now = self.tick();
        let mut nodes = self.nodes.write().await;
        self.place(&mut nodes, path, |_| Node::Symlink { target }, now);
    }

    /// Remove an entry and everything below it.
    pub async fn remove(&self, path: impl Into<PathBuf>) {
        let path = Self::checked(path.into());
        let now = self.tick();
        let mut nodes = self.nodes.write().await;
        nodes.retain(|key, _| !key.starts_with(&path) || key.as_os_str().is_empty());
        Self::touch_parent(&mut nodes, &path, now);
    }

    /// Bump the modification time of an entry without changing it.
    pub async fn touch(&self, path: impl Into<PathBuf>) {
        let path = Self::checked(path.into());
        let now = self.tick();
        let mut nodes = self.nodes.write().await;
        if let Some(Node::File { modified, .. } | Node::Dir { modified, .. }) = nodes.get_mut(&path) {
            *modified = now;
        }
    }

    fn info(node: &Node) -> FileInfo {
        let (kind, size, modified, inode) = match node {
            Node::File { data, modified, inode } => (FileKind::Regular, data.len() as u64, *modified, *inode),
            Node::Dir { modified, inode } => (FileKind::Directory, 0, *modified, *inode),
            // Resolved before we get here.
            Node::Symlink { .. } => (FileKind::Other, 0, 0, 0),
        };
        let modified = OffsetDateTime::from_unix_timestamp(modified).unwrap_or(OffsetDateTime::UNIX_EPOCH);
        FileInfo::new(kind, size, modified).with_identity(DEVICE, inode)
    }

    /// Follow symlinks until reaching a file or directory.
    fn resolve<'n>(nodes: &'n BTreeMap<PathBuf, Node>, path: &Path) -> Option<(PathBuf, &'n Node)> {
        let mut path = path.to_path_buf();
        for _ in 0..MAX_SYMLINK_DEPTH {
            match nodes.get(&path)? {
                Node::Symlink { target } => {
                    path = Self::link_target(&path, target)?;
                },
                node => return Some((path, node)),
            }
        }
        None
    }

    fn link_target(link: &Path, target: &Path) -> Option<PathBuf> {
        if target.is_absolute() {
            let relative = target.strip_prefix(MOCK_ROOT).ok()?;
            return validate_path(relative).ok();
        }
        let mut resolved: Vec<Component<'_>> = link.parent().into_iter().flat_map(Path::components).collect();
        for component in target.components() {
            match component {
                Component::ParentDir => {
                    resolved.pop()?;
                },
                Component::Normal(_) => resolved.push(component),
                _ => {},
            }
        }
        Some(resolved.into_iter().collect())
    }

    fn not_found(path: &Path) -> exn::Exn<ErrorKind> {
        exn::Exn::from(ErrorKind::NotFound(path.to_path_buf()))
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let path = validate_path(path)?;
        let nodes = self.nodes.read().await;
        let (_, node) = Self::resolve(&nodes, &path).ok_or_else(|| Self::not_found(&path))?;
        Ok(Self::info(node))
    }

    fn read_dir_stream<'a>(&'a self, path: &'a Path) -> DirEntryStream<'a> {
        Box::pin(stream! {
            let path = match validate_path(path) {
                Ok(path) => path,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            // Snapshot the listing under the read lock, then drop it before
            // yielding to avoid holding the lock across yield points.
            let listing: Result<Vec<DirEntry>> = {
                let nodes = self.nodes.read().await;
                match Self::resolve(&nodes, &path) {
                    None => Err(Self::not_found(&path)),
                    Some((_, Node::File { .. })) => Err(exn::Exn::from(ErrorKind::NotADirectory(path.clone()))),
                    Some((dir, _)) => Ok(nodes
                        .keys()
                        .filter(|key| !key.as_os_str().is_empty() && key.parent() == Some(dir.as_path()))
                        .filter_map(|key| {
                            let name = key.file_name()?.to_str()?.to_string();
                            let info = Self::resolve(&nodes, key).map(|(_, node)| Self::info(node));
                            Some(DirEntry { name, info })
                        })
                        .collect()),
                }
            };
            match listing {
                Ok(entries) => {
                    for entry in entries {
                        yield Ok(entry);
                    }
                },
                Err(e) => yield Err(e),
            }
        })
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let path = validate_path(path)?;
        let nodes = self.nodes.read().await;
        match Self::resolve(&nodes, &path) {
            Some((_, Node::File { data, .. })) => Ok(data.clone()),
            Some(_) => exn::bail!(ErrorKind::BackendError(format!("{} is not a file", path.display()))),
            None => Err(Self::not_found(&path)),
        }
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = validate_path(path)?;
        Ok(self.nodes.read().await.contains_key(&path))
    }

    async fn read_link(&self, path: &Path) -> Result<Option<PathBuf>> {
        let path = validate_path(path)?;
        match self.nodes.read().await.get(&path) {
            Some(Node::Symlink { target }) => Ok(Some(target.clone())),
            Some(_) => Ok(None),
            None => Err(Self::not_found(&path)),
        }
    }

    fn map_to_relative(&self, absolute: &Path) -> Option<PathBuf> {
        let relative = absolute.strip_prefix(MOCK_ROOT).ok()?;
        validate_path(relative).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(entries: &[DirEntry]) -> Vec<&str> {
        entries.iter().map(|entry| entry.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_with_files_creates_parents() {
        let backend = MockBackend::with_files([
            ("Artist/Album/01.flac", Vec::from(*b"one")),
            ("Artist/Album/02.flac", Vec::from(*b"two")),
            ("03.mp3", Vec::from(*b"three")),
        ]);
        assert!(backend.stat(Path::new("")).await.unwrap().is_directory());
        assert!(backend.stat(Path::new("Artist")).await.unwrap().is_directory());
        assert_eq!(names(&backend.read_dir(Path::new("")).await.unwrap()), ["03.mp3", "Artist"]);
        assert_eq!(
            names(&backend.read_dir(Path::new("Artist/Album")).await.unwrap()),
            ["01.flac", "02.flac"]
        );
        assert_eq!(backend.read(Path::new("03.mp3")).await.unwrap(), b"three");
    }

    #[tokio::test]
    async fn test_inodes_are_unique_and_stable() {
        let backend = MockBackend::with_files([("a.flac", b"a"), ("b.flac", b"b")]);
        let a = backend.stat(Path::new("a.flac")).await.unwrap();
        let b = backend.stat(Path::new("b.flac")).await.unwrap();
        assert_ne!(a.inode, b.inode);
        assert_eq!(a.device, DEVICE);
        backend.insert_file("a.flac", b"changed").await;
        assert_eq!(backend.stat(Path::new("a.flac")).await.unwrap().inode, a.inode);
    }

    #[tokio::test]
    async fn test_mutations_advance_the_clock() {
        let backend = MockBackend::with_files([("Album/01.flac", b"a")]);
        let dir = backend.stat(Path::new("Album")).await.unwrap();
        let file = backend.stat(Path::new("Album/01.flac")).await.unwrap();

        backend.touch("Album/01.flac").await;
        let touched = backend.stat(Path::new("Album/01.flac")).await.unwrap();
        assert!(touched.modified > file.modified);
        assert_eq!(backend.stat(Path::new("Album")).await.unwrap().modified, dir.modified);

        backend.insert_file("Album/02.flac", b"b").await;
        assert!(backend.stat(Path::new("Album")).await.unwrap().modified > dir.modified);
    }

    #[tokio::test]
    async fn test_remove_subtree() {
        let backend = MockBackend::with_files([("Album/01.flac", b"a"), ("Album/CD1/02.flac", b"b"), ("x.flac", b"c")]);
        backend.remove("Album").await;
        assert!(!backend.exists(Path::new("Album/CD1/02.flac")).await.unwrap());
        assert_eq!(names(&backend.read_dir(Path::new("")).await.unwrap()), ["x.flac"]);
        let err = backend.stat(Path::new("Album")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_symlinks() {
        let backend = MockBackend::with_files([("Album/01.flac", b"a")]);
        backend.insert_symlink("Other/link.flac", "../Album/01.flac").await;
        backend.insert_symlink("abs.flac", "/mock/Album/01.flac").await;
        backend.insert_symlink("outside.flac", "/elsewhere/01.flac").await;
        backend.insert_symlink("Album/loop", ".").await;

        assert_eq!(
            backend.read_link(Path::new("Other/link.flac")).await.unwrap(),
            Some(PathBuf::from("../Album/01.flac"))
        );
        assert_eq!(backend.read_link(Path::new("Album/01.flac")).await.unwrap(), None);
        assert!(backend.stat(Path::new("Other/link.flac")).await.unwrap().is_regular());
        assert!(backend.stat(Path::new("abs.flac")).await.unwrap().is_regular());
        assert!(backend.stat(Path::new("outside.flac")).await.is_err());
        assert!(backend.stat(Path::new("Album/loop")).await.unwrap().is_directory());

        let entries = backend.read_dir(Path::new("")).await.unwrap();
        let outside = entries.iter().find(|entry| entry.name == "outside.flac").unwrap();
        assert!(outside.info.is_none());
    }

    #[test]
    fn test_map_to_relative() {
        let backend = MockBackend::default();
        assert_eq!(backend.map_to_relative(Path::new("/mock/a/b")), Some(PathBuf::from("a/b")));
        assert_eq!(backend.map_to_relative(Path::new("/elsewhere/a")), None);
    }

    #[tokio::test]
    async fn test_read_dir_errors() {
        let backend = MockBackend::with_files([("01.flac", b"a")]);
        let err = backend.read_dir(Path::new("missing")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
        let err = backend.read_dir(Path::new("01.flac")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotADirectory(_)));
    }

    #[test]
    #[should_panic(expected = "invalid path")]
    fn test_with_files_panics_on_bad_path() {
        MockBackend::with_files([("../escape", Vec::from(*b"bad"))]);
    }
}
