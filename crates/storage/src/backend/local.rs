//! Local filesystem storage backend.
//!
//! Files are read from a configured directory using `tokio::fs` for async
//! I/O.

use crate::backend::DirEntryStream;
use crate::error::ErrorKind;
use crate::models::{DirEntry, FileInfo, FileKind};
use crate::{StorageBackend, error::Result, path::validate as validate_path};
use async_stream::stream;
use async_trait::async_trait;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Local filesystem storage backend.
///
/// All paths are relative to the configured root directory.
///
/// # Examples
///
/// ```no_run
/// use lark_storage::backend::LocalBackend;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("music", "/srv/music")?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct LocalBackend {
    name: String,
    /// Root of the music directory
    root: PathBuf,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, does not exist or is
    /// not a directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        // Non-async here; it only happens once when the storage is configured.
        let metadata = std::fs::metadata(&root).map_err(|e| Self::map_io_error(e, &root))?;
        if !metadata.is_dir() {
            exn::bail!(ErrorKind::NotADirectory(root));
        }
        Ok(Self { name: name.into(), root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the absolute path for a relative storage path.
    ///
    /// Validates the path and joins it with the root directory.
    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    fn file_info(metadata: &Metadata) -> Result<FileInfo> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?.into();
        let kind = if metadata.is_dir() {
            FileKind::Directory
        } else if metadata.is_file() {
            FileKind::Regular
        } else {
            FileKind::Other
        };
        let info = FileInfo::new(kind, metadata.len(), modified);
        #[cfg(unix)]
        let info = {
            use std::os::unix::fs::MetadataExt;
            info.with_identity(metadata.dev(), metadata.ino())
        };
        Ok(info)
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            std::io::ErrorKind::NotADirectory => ErrorKind::NotADirectory(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    /// Inside the listing stream errors can't be `?`'d, so the per-entry
    /// work lives here.
    async fn process_entry(&self, entry: fs::DirEntry) -> Option<DirEntry> {
        let Ok(name) = entry.file_name().into_string() else {
            tracing::debug!(path = %entry.path().display(), "Skipping non UTF-8 file name");
            return None;
        };
        // fs::metadata follows symlinks, DirEntry::metadata doesn't.
        let info = match fs::metadata(entry.path()).await {
            Ok(metadata) => Self::file_info(&metadata).ok(),
            Err(err) => {
                tracing::debug!(path = %entry.path().display(), error = %err, "Failed to stat directory entry");
                None
            },
        };
        Some(DirEntry { name, info })
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let abs_path = self.absolute_path(path)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        Self::file_info(&metadata)
    }

    fn read_dir_stream<'a>(&'a self, path: &'a Path) -> DirEntryStream<'a> {
        let abs_path = match self.absolute_path(path) {
            Ok(abs_path) => abs_path,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            let mut entries = match fs::read_dir(&abs_path).await {
                Ok(entries) => entries,
                Err(err) => {
                    yield Err(exn::Exn::from(Self::map_io_error(err, path)));
                    return;
                }
            };
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        if let Some(entry) = self.process_entry(entry).await {
                            yield Ok(entry);
                        }
                    },
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, path)));
                        break;
                    },
                }
            }
        })
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read_link(&self, path: &Path) -> Result<Option<PathBuf>> {
        let abs_path = self.absolute_path(path)?;
        let metadata = fs::symlink_metadata(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        if !metadata.is_symlink() {
            return Ok(None);
        }
        let target = fs::read_link(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        Ok(Some(target))
    }

    fn map_to_relative(&self, absolute: &Path) -> Option<PathBuf> {
        let relative = absolute.strip_prefix(&self.root).ok()?;
        validate_path(relative).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("music", temp_dir.path()).unwrap();
        (temp_dir, backend)
    }

    #[test]
    fn test_new_requires_absolute_existing_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("music", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("music", "relative/path").is_err());

        let err = LocalBackend::new("music", temp_dir.path().join("missing")).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));

        let file = temp_dir.path().join("file.flac");
        std::fs::write(&file, b"fLaC").unwrap();
        let err = LocalBackend::new("music", &file).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotADirectory(_)));
    }

    #[test]
    fn test_absolute_path() {
        let (temp_dir, backend) = backend();
        let expected = temp_dir.path().join("Artist/01.flac");
        assert_eq!(backend.absolute_path(Path::new("Artist/01.flac")).unwrap(), expected);
        assert_eq!(backend.absolute_path(Path::new("")).unwrap(), temp_dir.path());
        // Path traversal is prevented
        assert!(backend.absolute_path(Path::new("../etc/passwd")).is_err());
    }

    #[tokio::test]
    async fn test_stat() {
        let (temp_dir, backend) = backend();
        std::fs::create_dir(temp_dir.path().join("Artist")).unwrap();
        std::fs::write(temp_dir.path().join("Artist/01.flac"), b"0123456789").unwrap();

        let info = backend.stat(Path::new("Artist/01.flac")).await.unwrap();
        assert_eq!(info.kind, FileKind::Regular);
        assert_eq!(info.size, 10);

        let root = backend.stat(Path::new("")).await.unwrap();
        assert!(root.is_directory());
        #[cfg(unix)]
        assert_ne!(root.inode, 0);

        let err = backend.stat(Path::new("missing.flac")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_read_dir() {
        let (temp_dir, backend) = backend();
        std::fs::create_dir(temp_dir.path().join("Album")).unwrap();
        std::fs::write(temp_dir.path().join("01.flac"), b"a").unwrap();
        std::fs::write(temp_dir.path().join("Album/02.flac"), b"b").unwrap();

        let mut entries = backend.read_dir(Path::new("")).await.unwrap();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<_> = entries.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, ["01.flac", "Album"]);
        assert_eq!(entries[0].info.as_ref().unwrap().kind, FileKind::Regular);
        assert_eq!(entries[1].info.as_ref().unwrap().kind, FileKind::Directory);
    }

    #[tokio::test]
    async fn test_read_dir_missing() {
        let (_temp_dir, backend) = backend();
        let err = backend.read_dir(Path::new("nope")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_read_and_exists() {
        let (temp_dir, backend) = backend();
        std::fs::write(temp_dir.path().join(".mpdignore"), b"*.tmp\n").unwrap();
        assert_eq!(backend.read(Path::new(".mpdignore")).await.unwrap(), b"*.tmp\n");
        assert!(backend.exists(Path::new(".mpdignore")).await.unwrap());
        assert!(!backend.exists(Path::new("nope")).await.unwrap());
        let err = backend.read(Path::new("nope")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinks() {
        let (temp_dir, backend) = backend();
        std::fs::write(temp_dir.path().join("01.flac"), b"a").unwrap();
        std::os::unix::fs::symlink("01.flac", temp_dir.path().join("link.flac")).unwrap();
        std::os::unix::fs::symlink("missing.flac", temp_dir.path().join("dangling.flac")).unwrap();

        assert_eq!(
            backend.read_link(Path::new("link.flac")).await.unwrap(),
            Some(PathBuf::from("01.flac"))
        );
        assert_eq!(backend.read_link(Path::new("01.flac")).await.unwrap(), None);
        assert!(backend.stat(Path::new("link.flac")).await.unwrap().is_regular());

        let entries = backend.read_dir(Path::new("")).await.unwrap();
        let dangling = entries.iter().find(|entry| entry.name == "dangling.flac").unwrap();
        assert!(dangling.info.is_none());
    }

    #[test]
    fn test_map_to_relative() {
        let (temp_dir, backend) = backend();
        assert_eq!(
            backend.map_to_relative(&temp_dir.path().join("Artist/01.flac")),
            Some(PathBuf::from("Artist/01.flac"))
        );
        assert_eq!(backend.map_to_relative(temp_dir.path()), Some(PathBuf::new()));
        assert_eq!(backend.map_to_relative(Path::new("/somewhere/else")), None);
    }

    #[tokio::test]
    async fn test_path_security() {
        let (_temp_dir, backend) = backend();
        assert!(backend.read(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.stat(Path::new("etc/../../passwd")).await.is_err());
        assert!(backend.read_dir(Path::new("../")).await.is_err());
    }
}
