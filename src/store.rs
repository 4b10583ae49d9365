//! The content-addressed object store (spec §4.1): persists Chunk, File and
//! Index entities under `objects/`, `indexes/` and `refs/`, transparently
//! applying compression, encryption and read caching.
//!
//! The path fanout scheme, the immutability check before writing an object,
//! and the single coarse mutex guarding every individual read/write are all
//! grounded on `pbs-datastore/src/chunk_store.rs`'s `chunk_path`/
//! `insert_chunk` — generalized from its 256-way two-hex-char fanout and
//! its "already present with matching content -> no-op" policy, and on
//! `original_source/filelock/filelock.go`'s single process-wide
//! `fileReadWriteLock` guarding `ReadFile`/`WriteFile`/`Remove`.

use std::collections::HashSet;
use std::fs::File as FsFile;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cache::Cache;
use crate::config::{FsyncLevel, RepoConfig};
use crate::entity::{self, Chunk, Index};
use crate::error::Error;
use crate::{compress, crypto};

/// File cache budget: 32 MiB of encoded bytes.
const FILE_CACHE_COST: usize = 32 * 1024 * 1024;
/// Index cache budget: 128 MiB of encoded bytes.
const INDEX_CACHE_COST: usize = 128 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub size: u64,
    pub mtime_ms: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PurgeStat {
    pub indexes: u64,
    pub objects: u64,
    pub size_bytes: u64,
}

pub struct Store {
    config: RepoConfig,
    io_mutex: Mutex<()>,
    file_cache: Cache<entity::File>,
    index_cache: Cache<Index>,
}

impl Store {
    pub fn new(config: RepoConfig) -> Self {
        Self {
            config,
            io_mutex: Mutex::new(()),
            file_cache: Cache::new(FILE_CACHE_COST),
            index_cache: Cache::new(INDEX_CACHE_COST),
        }
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    fn object_path(&self, id: &str) -> PathBuf {
        self.config
            .objects_dir()
            .join(&id[0..2])
            .join(&id[2..])
    }

    fn index_path(&self, id: &str) -> PathBuf {
        self.config.indexes_dir().join(id)
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.config.refs_dir().join(name)
    }

    /// Write `bytes` to `path` via a temp file in the same directory plus a
    /// rename, so the file is either fully visible or absent (spec §3 "ref
    /// atomicity", applied here to every persisted file, not just refs).
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
        let dir = path.parent().expect("object paths always have a parent");
        std::fs::create_dir_all(dir)?;

        let _guard = self.io_mutex.lock().unwrap();

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        if self.config.fsync == FsyncLevel::File {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(path).map_err(|e| e.error)?;

        if self.config.fsync != FsyncLevel::None {
            if let Ok(dir_handle) = FsFile::open(dir) {
                let _ = dir_handle.sync_all();
            }
        }
        Ok(())
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, std::io::Error> {
        let _guard = self.io_mutex.lock().unwrap();
        std::fs::read(path)
    }

    fn object_exists(&self, path: &Path) -> bool {
        let _guard = self.io_mutex.lock().unwrap();
        path.exists()
    }

    /// Whether an object with `id` exists on disk, without touching the
    /// cache. Used by the sync engine to compute `missing_files`/
    /// `missing_chunks` (spec §4.3) without paying for a decode.
    pub fn has_object(&self, id: &str) -> bool {
        self.object_exists(&self.object_path(id))
    }

    /// Raw encoded bytes of a file or chunk object, exactly as persisted
    /// (compressed, then encrypted). Used by the sync engine to upload
    /// objects verbatim instead of decoding and re-encoding them.
    pub fn read_object_raw(&self, id: &str) -> Result<Vec<u8>, Error> {
        let path = self.object_path(id);
        if !self.object_exists(&path) {
            return Err(Error::NotFound(id.to_string()));
        }
        self.read_bytes(&path)
            .map_err(|source| Error::StoreRead { path, source })
    }

    /// Write a raw encoded object (file or chunk) downloaded from the cloud
    /// directly to its content-addressed path, after the caller has
    /// verified `sha1(decode(bytes)) == id`. Immutable like every other put.
    pub fn write_object_raw(&self, id: &str, encoded: &[u8]) -> Result<(), Error> {
        let path = self.object_path(id);
        if self.object_exists(&path) {
            return Ok(());
        }
        self.write_atomic(&path, encoded)
            .map_err(|source| Error::StorePut { path, source })
    }

    /// Raw encoded bytes of an index object (compressed canonical JSON,
    /// never encrypted per spec §3).
    pub fn read_index_raw(&self, id: &str) -> Result<Vec<u8>, Error> {
        let path = self.index_path(id);
        if !self.object_exists(&path) {
            return Err(Error::NotFound(id.to_string()));
        }
        self.read_bytes(&path)
            .map_err(|source| Error::StoreRead { path, source })
    }

    // --- indexes -----------------------------------------------------

    pub fn put_index(&self, index: &Index) -> Result<(), Error> {
        if index.id.is_empty() {
            return Err(Error::InvalidId(None));
        }

        let path = self.index_path(&index.id);
        let canonical = index.canonical_bytes();
        let compressed = compress::compress(&canonical).map_err(Error::Other)?;

        self.write_atomic(&path, &compressed)
            .map_err(|source| Error::StorePut { path: path.clone(), source })?;

        if let Ok(file) = FsFile::open(&path) {
            let mtime = UNIX_EPOCH + Duration::from_millis(index.created.max(0) as u64);
            let _ = file.set_modified(mtime);
        }

        self.index_cache.insert(&index.id, index.clone(), compressed.len());
        Ok(())
    }

    pub fn get_index(&self, id: &str) -> Result<Index, Error> {
        if let Some(cached) = self.index_cache.get(id) {
            return Ok(cached);
        }

        let path = self.index_path(id);
        if !self.object_exists(&path) {
            return Err(Error::NotFound(id.to_string()));
        }

        let compressed = self
            .read_bytes(&path)
            .map_err(|source| Error::StoreRead { path: path.clone(), source })?;
        let canonical = compress::decompress(&compressed).map_err(Error::Other)?;
        let index = Index::from_canonical_bytes(id.to_string(), &canonical).map_err(Error::Other)?;

        self.index_cache.insert(id, index.clone(), compressed.len());
        Ok(index)
    }

    // --- files ---------------------------------------------------------

    pub fn put_file(&self, file: &entity::File) -> Result<(), Error> {
        if file.id.is_empty() {
            return Err(Error::InvalidId(None));
        }

        let path = self.object_path(&file.id);
        if self.object_exists(&path) {
            // Immutable: an id that already exists on disk is never rewritten.
            self.file_cache.insert(&file.id, file.clone(), file.canonical_bytes().len());
            return Ok(());
        }

        let canonical = file.canonical_bytes();
        let compressed = compress::compress(&canonical).map_err(Error::Other)?;
        let encrypted = crypto::encrypt(&self.config.aes_key, &compressed).map_err(Error::Other)?;

        self.write_atomic(&path, &encrypted)
            .map_err(|source| Error::StorePut { path: path.clone(), source })?;

        self.file_cache.insert(&file.id, file.clone(), encrypted.len());
        Ok(())
    }

    pub fn get_file(&self, id: &str) -> Result<entity::File, Error> {
        if let Some(cached) = self.file_cache.get(id) {
            return Ok(cached);
        }

        let path = self.object_path(id);
        if !self.object_exists(&path) {
            return Err(Error::NotFound(id.to_string()));
        }

        let encrypted = self
            .read_bytes(&path)
            .map_err(|source| Error::StoreRead { path: path.clone(), source })?;
        let compressed = crypto::decrypt(&self.config.aes_key, &encrypted, id)?;
        let canonical = compress::decompress(&compressed).map_err(Error::Other)?;
        let file = entity::File::from_canonical_bytes(id.to_string(), &canonical).map_err(Error::Other)?;

        self.file_cache.insert(id, file.clone(), encrypted.len());
        Ok(file)
    }

    // --- chunks ----------------------------------------------------------

    pub fn put_chunk(&self, chunk: &Chunk) -> Result<(), Error> {
        if chunk.id.is_empty() {
            return Err(Error::InvalidId(None));
        }

        let path = self.object_path(&chunk.id);
        if self.object_exists(&path) {
            return Ok(());
        }

        let compressed = compress::compress(chunk.canonical_bytes()).map_err(Error::Other)?;
        let encrypted = crypto::encrypt(&self.config.aes_key, &compressed).map_err(Error::Other)?;

        self.write_atomic(&path, &encrypted)
            .map_err(|source| Error::StorePut { path: path.clone(), source })
    }

    pub fn get_chunk(&self, id: &str) -> Result<Chunk, Error> {
        let path = self.object_path(id);
        if !self.object_exists(&path) {
            return Err(Error::NotFound(id.to_string()));
        }

        let encrypted = self
            .read_bytes(&path)
            .map_err(|source| Error::StoreRead { path: path.clone(), source })?;
        let compressed = crypto::decrypt(&self.config.aes_key, &encrypted, id)?;
        let data = compress::decompress(&compressed).map_err(Error::Other)?;
        Ok(Chunk::from_parts(id.to_string(), data))
    }

    // --- generic object access -------------------------------------------

    pub fn remove(&self, id: &str) -> Result<(), Error> {
        let path = self.object_path(id);
        let _guard = self.io_mutex.lock().unwrap();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                self.file_cache.remove(id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::StoreRead { path, source }),
        }
    }

    fn remove_index(&self, id: &str) -> Result<(), Error> {
        let path = self.index_path(id);
        let _guard = self.io_mutex.lock().unwrap();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                self.index_cache.remove(id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::StoreRead { path, source }),
        }
    }

    pub fn stat(&self, id: &str) -> Result<Metadata, Error> {
        let path = self.object_path(id);
        let meta = std::fs::metadata(&path).map_err(|source| Error::StoreRead { path, source })?;
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Ok(Metadata {
            size: meta.len(),
            mtime_ms,
        })
    }

    // --- refs --------------------------------------------------------------

    pub fn read_ref(&self, name: &str) -> Result<Option<String>, Error> {
        let path = self.ref_path(name);
        if !self.object_exists(&path) {
            return Ok(None);
        }
        let bytes = self
            .read_bytes(&path)
            .map_err(|source| Error::StoreRead { path, source })?;
        if bytes.len() > 42 {
            log::warn!("ref {name} is longer than 42 bytes, ignoring");
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&bytes).trim().to_string();
        if text.len() != 40 {
            log::warn!("ref {name} has non-conforming content, ignoring");
            return Ok(None);
        }
        Ok(Some(text))
    }

    pub fn write_ref(&self, name: &str, index_id: &str) -> Result<(), Error> {
        let path = self.ref_path(name);
        let mut content = index_id.as_bytes().to_vec();
        content.push(b'\n');
        self.write_atomic(&path, &content)
            .map_err(|source| Error::StorePut { path, source })
    }

    /// Every ref name under `refs/`, recursing through subdirectories so
    /// nested tag refs (e.g. `tags/v1`) participate in reachability the same
    /// way `latest`/`latest-sync` do. Grounded on
    /// `original_source/dejavu/store.go`'s `readRefs`, which uses
    /// `filepath.Walk` rather than a single directory listing for exactly
    /// this reason.
    pub fn list_refs(&self) -> Result<Vec<String>, Error> {
        let dir = self.config.refs_dir();
        let _guard = self.io_mutex.lock().unwrap();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in walkdir::WalkDir::new(&dir) {
            let entry = entry.map_err(|e| Error::StoreRead {
                path: dir.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&dir)
                .expect("walkdir yields paths under refs_dir")
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            names.push(rel);
        }
        Ok(names)
    }

    // --- garbage collection -----------------------------------------------

    /// Reachability-based garbage collection, per spec §4.1's purge
    /// algorithm: enumerate objects and indexes, union the reachable set
    /// from every ref-reachable index, delete unreferenced objects, then
    /// unreferenced indexes (that order, matching `store.go`'s `Purge`).
    pub fn purge(&self) -> Result<PurgeStat, Error> {
        let object_ids = self.enumerate_objects()?;
        let index_ids = self.enumerate_indexes()?;

        let mut referenced_index_ids = HashSet::new();
        for ref_name in self.list_refs()? {
            if let Some(id) = self.read_ref(&ref_name)? {
                referenced_index_ids.insert(id);
            }
        }

        let mut referenced_objects: HashSet<String> = HashSet::new();
        for index_id in &referenced_index_ids {
            let index = self.get_index(index_id)?;
            for file_id in &index.files {
                let file = self.get_file(file_id)?;
                referenced_objects.insert(file_id.clone());
                for chunk_id in &file.chunks {
                    referenced_objects.insert(chunk_id.clone());
                }
            }
        }

        let mut stat = PurgeStat::default();

        for id in object_ids.difference(&referenced_objects) {
            let meta = self.stat(id)?;
            self.remove(id)?;
            stat.objects += 1;
            stat.size_bytes += meta.size;
        }

        for id in index_ids.difference(&referenced_index_ids) {
            self.remove_index(id)?;
            stat.indexes += 1;
        }

        Ok(stat)
    }

    fn enumerate_objects(&self) -> Result<HashSet<String>, Error> {
        let root = self.config.objects_dir();
        let mut ids = HashSet::new();
        if !root.exists() {
            return Ok(ids);
        }
        for prefix_entry in std::fs::read_dir(&root).map_err(|source| Error::StoreRead { path: root.clone(), source })? {
            let prefix_entry = prefix_entry.map_err(|source| Error::StoreRead { path: root.clone(), source })?;
            if !prefix_entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let prefix = prefix_entry.file_name();
            let prefix = prefix.to_string_lossy();
            for entry in std::fs::read_dir(prefix_entry.path()).map_err(|source| Error::StoreRead { path: root.clone(), source })? {
                let entry = entry.map_err(|source| Error::StoreRead { path: root.clone(), source })?;
                if let Some(name) = entry.file_name().to_str() {
                    ids.insert(format!("{prefix}{name}"));
                }
            }
        }
        Ok(ids)
    }

    fn enumerate_indexes(&self) -> Result<HashSet<String>, Error> {
        let root = self.config.indexes_dir();
        let mut ids = HashSet::new();
        if !root.exists() {
            return Ok(ids);
        }
        for entry in std::fs::read_dir(&root).map_err(|source| Error::StoreRead { path: root.clone(), source })? {
            let entry = entry.map_err(|source| Error::StoreRead { path: root.clone(), source })?;
            if let Some(name) = entry.file_name().to_str() {
                if name.len() == 40 {
                    ids.insert(name.to_string());
                }
            }
        }
        Ok(ids)
    }
}

#[allow(dead_code)]
fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
