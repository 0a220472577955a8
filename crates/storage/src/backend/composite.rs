//! Mount table mapping database URIs to storages.

use crate::BackendHandle;
use crate::error::{ErrorKind, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};

/// The storages making up the music directory: one at the root (`""`) and
/// any number mounted at URIs below it.
///
/// Lookups are exact: a storage mounted at `usb` serves `usb` itself, not
/// `usb/Artist`. Walks never descend from one storage into another.
#[derive(Default)]
pub struct CompositeStorage {
    mounts: RwLock<BTreeMap<String, BackendHandle>>,
}

impl CompositeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// A composite with `root` mounted at `""`.
    pub fn with_root(root: BackendHandle) -> Self {
        let storage = Self::default();
        storage.mounts.write().unwrap_or_else(PoisonError::into_inner).insert(String::new(), root);
        storage
    }

    /// Mount `storage` at `uri`. Fails if something is already mounted there.
    pub fn mount(&self, uri: &str, storage: BackendHandle) -> Result<()> {
        let uri = normalize(uri);
        let mut mounts = self.mounts.write().unwrap_or_else(PoisonError::into_inner);
        if mounts.contains_key(&uri) {
            exn::bail!(ErrorKind::AlreadyExists(PathBuf::from(uri)));
        }
        tracing::info!(uri = %uri, target = storage.name(), "Mounted storage");
        mounts.insert(uri, storage);
        Ok(())
    }

    /// Remove the storage mounted at `uri`, returning it.
    pub fn unmount(&self, uri: &str) -> Option<BackendHandle> {
        let uri = normalize(uri);
        let removed = self.mounts.write().unwrap_or_else(PoisonError::into_inner).remove(&uri);
        if let Some(storage) = &removed {
            tracing::info!(uri = %uri, target = storage.name(), "Unmounted storage");
        }
        removed
    }

    /// The storage mounted exactly at `uri`.
    pub fn get_mount(&self, uri: &str) -> Option<BackendHandle> {
        self.mounts.read().unwrap_or_else(PoisonError::into_inner).get(&normalize(uri)).cloned()
    }

    /// The storage mounted at the root.
    pub fn root(&self) -> Option<BackendHandle> {
        self.get_mount("")
    }

    /// URIs with something mounted, root first.
    pub fn mount_points(&self) -> Vec<String> {
        self.mounts.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }
}

fn normalize(uri: &str) -> String {
    uri.split('/').filter(|part| !part.is_empty() && *part != ".").collect::<Vec<_>>().join("/")
}
