//! Repository configuration.
//!
//! Mirrors the options spec §6 lists as recognized configuration, plus an
//! fsync level knob grounded on `pbs-api-types::DatastoreFSyncLevel`
//! (`chunk_store.rs` threads the same enum through every write path to
//! decide whether an atomic rename is additionally `fsync`'d).

use std::path::PathBuf;
use std::sync::Arc;

use crate::crypto::AesKey;
use crate::sync::transport::CloudTransport;

/// How aggressively durable writes are flushed to disk.
///
/// `None` trusts the filesystem's own ordering, `Filesystem` calls `sync_all`
/// on the containing directory after a rename, `File` additionally
/// `sync_all`s the file itself before the rename. Default is `Filesystem`,
/// matching the teacher's default for datastores that are not tmpfs-backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FsyncLevel {
    None,
    #[default]
    Filesystem,
    File,
}

/// Paths and collaborators a repository needs, per spec §6.
#[derive(Clone)]
pub struct RepoConfig {
    /// Absolute repository directory (objects/, indexes/, refs/ live here).
    pub path: PathBuf,
    /// Working directory the indexer walks and the checkout writes into.
    pub data_path: PathBuf,
    /// Scratch directory for conflict archives and atomic-rename staging.
    pub temp_path: PathBuf,
    /// 32-byte key used for file and chunk encryption.
    pub aes_key: AesKey,
    /// Stable identifier for this device, used in the cloud lock object.
    pub device_id: String,
    /// Cloud transport collaborator (§4.5). `None` if this repository never
    /// syncs.
    pub cloud: Option<Arc<dyn CloudTransport>>,
    /// Directories that must survive `remove_empty_dirs` even when empty.
    pub remove_empty_dir_excludes: Vec<PathBuf>,
    /// Durability level for object, index and ref writes.
    pub fsync: FsyncLevel,
}

impl RepoConfig {
    pub fn objects_dir(&self) -> PathBuf {
        self.path.join("objects")
    }

    pub fn indexes_dir(&self) -> PathBuf {
        self.path.join("indexes")
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.path.join("refs")
    }

    pub fn conflicts_dir(&self) -> PathBuf {
        self.temp_path.join("repo").join("sync").join("conflicts")
    }
}
