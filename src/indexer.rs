//! The chunker + indexer (spec §4.2): walks a working directory into
//! Chunk/File/Index entities, and walks an Index back into a working
//! directory ("checkout").
//!
//! Grounded on the control flow of `original_source/dejavu/sync_manual.go`'s
//! `index`/`checkoutFile`/`checkoutFiles` calls (the Go implementations
//! themselves live in `store.go`/`repo.go`, which weren't retained in the
//! retrieval pack, so the walking and chunk-reuse logic below is written
//! from the spec's description of those operations, in the teacher's
//! `walkdir`-based style seen in `pbs-client`'s directory walkers).

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use walkdir::WalkDir;

use crate::chunker;
use crate::entity::{Chunk, File, Index};
use crate::error::Error;
use crate::event::{self, SharedEventBus};
use crate::store::Store;

fn to_slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn mtime_ms(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct Indexer<'a> {
    store: &'a Store,
    events: SharedEventBus,
}

impl<'a> Indexer<'a> {
    pub fn new(store: &'a Store, events: SharedEventBus) -> Self {
        Self { store, events }
    }

    /// Build a new Index from the working directory, reusing File entities
    /// from `parent` whose `(path, size, updated)` is unchanged (spec
    /// §4.2's mtime-based fast path).
    pub fn index(&self, data_path: &Path, parent: Option<&Index>, memo: String) -> Result<Index, Error> {
        self.events.publish(event::topic::INDEX_BEFORE_WALK_DATA, &event::ctx());

        let parent_files = self.load_parent_files(parent)?;

        let mut file_ids = Vec::new();
        let mut total_size: u64 = 0;
        let mut chunk_count: u64 = 0;
        let mut distinct_chunks = std::collections::HashSet::new();

        for entry in WalkDir::new(data_path).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let abs_path = entry.path();
            let rel_path = to_slash_path(
                abs_path
                    .strip_prefix(data_path)
                    .expect("walkdir yields paths under data_path"),
            );
            let metadata = entry.metadata().map_err(|e| Error::Other(e.into()))?;
            let size = metadata.len();
            let updated = mtime_ms(&metadata);

            let file = match parent_files.get(&rel_path) {
                Some(existing) if existing.size == size && existing.updated == updated => {
                    existing.clone()
                }
                _ => {
                    let bytes = std::fs::read(abs_path).map_err(|e| Error::Other(e.into()))?;
                    let mut chunks = Vec::new();
                    for piece in chunker::split(&bytes) {
                        let chunk = Chunk::new(piece.to_vec());
                        self.store.put_chunk(&chunk)?;
                        chunks.push(chunk.id);
                    }
                    let file = File::new(rel_path.clone(), size, updated, chunks);
                    self.store.put_file(&file)?;
                    file
                }
            };

            let mut ctx = event::ctx();
            ctx.insert("path".to_string(), rel_path.clone());
            self.events.publish(event::topic::INDEX_UPSERT_FILE, &ctx);

            total_size += file.size;
            chunk_count += file.chunks.len() as u64;
            distinct_chunks.extend(file.chunks.iter().cloned());
            file_ids.push(file.id);
        }

        let count = file_ids.len() as u64;
        let hash_count = distinct_chunks.len() as u64;
        let parent_id = parent.map(|p| p.id.clone()).unwrap_or_default();

        let index = Index::new(parent_id, memo, now_ms(), file_ids, total_size, count, chunk_count, hash_count);
        self.store.put_index(&index)?;
        Ok(index)
    }

    fn load_parent_files(&self, parent: Option<&Index>) -> Result<HashMap<String, File>, Error> {
        self.events
            .publish(event::topic::INDEX_BEFORE_GET_LATEST_FILES, &event::ctx());

        let mut map = HashMap::new();
        if let Some(parent) = parent {
            for file_id in &parent.files {
                let file = self.store.get_file(file_id)?;
                map.insert(file.path.clone(), file);
            }
        }
        Ok(map)
    }

    /// Materialize `files` into `data_path`, writing each to a staging path
    /// first and renaming into place, preserving `updated` as the mtime.
    pub fn checkout_files(&self, files: &[File], data_path: &Path) -> Result<(), Error> {
        self.events.publish(event::topic::CHECKOUT_BEFORE_WALK_DATA, &event::ctx());
        for file in files {
            self.checkout_file(file, data_path)?;
        }
        Ok(())
    }

    pub fn checkout_file(&self, file: &File, data_path: &Path) -> Result<(), Error> {
        let final_path = data_path.join(&file.path);
        let parent_dir = final_path.parent().expect("file path always has a parent");
        std::fs::create_dir_all(parent_dir).map_err(|e| Error::Other(e.into()))?;

        let mut staging = tempfile::NamedTempFile::new_in(parent_dir).map_err(|e| Error::Other(e.into()))?;
        for chunk_id in &file.chunks {
            let chunk = self.store.get_chunk(chunk_id)?;
            staging.write_all(&chunk.data).map_err(|e| Error::Other(e.into()))?;
        }
        staging
            .persist(&final_path)
            .map_err(|e| Error::Other(e.error.into()))?;

        if let Ok(f) = std::fs::File::open(&final_path) {
            let mtime = UNIX_EPOCH + std::time::Duration::from_millis(file.updated.max(0) as u64);
            let _ = f.set_modified(mtime);
        }

        let mut ctx = event::ctx();
        ctx.insert("path".to_string(), file.path.clone());
        self.events.publish(event::topic::CHECKOUT_UPSERT_FILE, &ctx);
        Ok(())
    }

    /// Delete the named working-directory paths (the "remove" half of a
    /// checkout, spec §4.2).
    pub fn remove_files(&self, paths: &[String], data_path: &Path) -> Result<(), Error> {
        for path in paths {
            let abs_path = data_path.join(path);
            match std::fs::remove_file(&abs_path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Other(e.into())),
            }
            let mut ctx = event::ctx();
            ctx.insert("path".to_string(), path.clone());
            self.events.publish(event::topic::CHECKOUT_REMOVE_FILE, &ctx);
        }
        Ok(())
    }

    /// Remove empty directories under `root`, excluding `excludes` and
    /// `root` itself.
    pub fn remove_empty_dirs(&self, root: &Path, excludes: &[PathBuf]) -> Result<(), Error> {
        if !root.exists() {
            return Ok(());
        }

        let mut dirs: Vec<PathBuf> = WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.into_path())
            .collect();

        // Deepest first, so a directory that becomes empty after its child
        // is removed is itself considered.
        dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

        for dir in dirs {
            if excludes.iter().any(|ex| &dir == ex) {
                continue;
            }
            if std::fs::read_dir(&dir).map(|mut it| it.next().is_none()).unwrap_or(false) {
                let _ = std::fs::remove_dir(&dir);
            }
        }
        Ok(())
    }
}
