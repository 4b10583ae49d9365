//! The sync engine (spec §4.3): reconciles local and cloud repositories
//! through `SyncDownload`/`SyncUpload`, each a single linearizable operation
//! serialized by [`SyncEngine`]'s own mutex.
//!
//! Control flow, ordering and traffic-counter bookkeeping are grounded
//! directly on `original_source/dejavu/sync_manual.go`; see SPEC_FULL.md for
//! which details (separate upload_chunks/upload_files counters, the
//! commented-out cloud missing-chunks check) are deliberate deviations from
//! that source, per spec §9's open questions.

pub mod conflict;
pub mod lock;
pub mod transport;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex as AsyncMutex;

use crate::chunker;
use crate::compress;
use crate::config::RepoConfig;
use crate::crypto;
use crate::diff;
use crate::entity::{self, Index, REF_LATEST, REF_LATEST_SYNC};
use crate::error::Error;
use crate::event::{self, SharedEventBus};
use crate::indexer::Indexer;
use crate::store::Store;

use conflict::{batch_dir, ConflictHistorySink, NullConflictHistorySink};
use lock::CloudLockManager;
use transport::{CloudTransport, TrafficDelta};

fn object_key(id: &str) -> String {
    format!("objects/{}/{}", &id[0..2], &id[2..])
}

fn index_key(id: &str) -> String {
    format!("indexes/{id}")
}

fn ref_key(name: &str) -> String {
    format!("refs/{name}")
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A cooperative cancellation signal observed at suspension points (spec
/// §5). Cancelling never interrupts in-flight I/O; the current operation
/// finishes its step, then returns `Error::Cancelled` on the next check.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Bytes transferred and API call counts for one sync operation (spec
/// §4.3/§9). `upload_chunk_count` and `upload_file_count` are kept as
/// separate counters — the source increments only `UploadChunkCount` for
/// both, which spec §9 calls out as a miscounting to resolve rather than
/// reproduce.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficStat {
    pub download_file_count: u64,
    pub download_chunk_count: u64,
    pub download_bytes: u64,
    pub upload_file_count: u64,
    pub upload_chunk_count: u64,
    pub upload_bytes: u64,
    pub api_get: u64,
    pub api_put: u64,
}

impl TrafficStat {
    fn to_delta(self) -> TrafficDelta {
        TrafficDelta {
            download_bytes: self.download_bytes,
            upload_bytes: self.upload_bytes,
            api_get: self.api_get,
            api_put: self.api_put,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    pub time_ms: i64,
    pub upserts: Vec<entity::File>,
    pub removes: Vec<entity::File>,
    pub conflicts: Vec<entity::File>,
}

pub struct SyncEngine {
    store: Arc<Store>,
    config: RepoConfig,
    cloud: Arc<dyn CloudTransport>,
    lock_manager: CloudLockManager,
    events: SharedEventBus,
    conflict_sink: Arc<dyn ConflictHistorySink>,
    /// Serializes `SyncDownload`/`SyncUpload`: at most one sync operation
    /// in flight at a time (spec §5). Scoped to this engine instance,
    /// i.e. one per open repository — the spec's "process-wide" framing
    /// assumes a process holds exactly one repository open at a time.
    sync_mutex: AsyncMutex<()>,
}

impl SyncEngine {
    pub fn new(store: Arc<Store>, config: RepoConfig, events: SharedEventBus) -> Result<Self, Error> {
        let cloud = config
            .cloud
            .clone()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("repository has no cloud transport configured")))?;
        let lock_manager = CloudLockManager::new(cloud.clone(), config.device_id.clone(), events.clone());
        Ok(Self {
            store,
            config,
            cloud,
            lock_manager,
            events,
            conflict_sink: Arc::new(NullConflictHistorySink),
            sync_mutex: AsyncMutex::new(()),
        })
    }

    pub fn with_conflict_sink(mut self, sink: Arc<dyn ConflictHistorySink>) -> Self {
        self.conflict_sink = sink;
        self
    }

    fn local_latest(&self) -> Result<Option<Index>, Error> {
        match self.store.read_ref(REF_LATEST)? {
            Some(id) => Ok(Some(self.store.get_index(&id)?)),
            None => Ok(None),
        }
    }

    fn local_latest_sync(&self) -> Result<Option<Index>, Error> {
        match self.store.read_ref(REF_LATEST_SYNC)? {
            Some(id) => Ok(Some(self.store.get_index(&id)?)),
            None => Ok(None),
        }
    }

    async fn download_cloud_latest(&self, stat: &mut TrafficStat) -> Result<Option<Index>, Error> {
        let id = match self.cloud.download_object(&ref_key(REF_LATEST)).await {
            Ok(bytes) => {
                stat.download_bytes += bytes.len() as u64;
                stat.api_get += 1;
                String::from_utf8_lossy(&bytes).trim().to_string()
            }
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if id.len() != 40 {
            return Ok(None);
        }

        let encoded = self.cloud.download_object(&index_key(&id)).await?;
        stat.download_bytes += encoded.len() as u64;
        stat.download_file_count += 1;
        stat.api_get += 1;

        let canonical = compress::decompress(&encoded).map_err(Error::Other)?;
        let index = Index::from_canonical_bytes(id, &canonical).map_err(Error::Other)?;
        Ok(Some(index))
    }

    fn files_of(&self, ids: &[String]) -> Result<Vec<entity::File>, Error> {
        ids.iter().map(|id| self.store.get_file(id)).collect()
    }

    async fn fetch_missing_files(&self, ids: &[String], stat: &mut TrafficStat) -> Result<(), Error> {
        for id in ids {
            if self.store.has_object(id) {
                continue;
            }
            let encoded = self.cloud.download_object(&object_key(id)).await?;
            stat.download_bytes += encoded.len() as u64;
            stat.download_file_count += 1;
            stat.api_get += 1;

            let canonical = crypto::decrypt(&self.config.aes_key, &encoded, id)
                .and_then(|compressed| compress::decompress(&compressed).map_err(Error::Other))?;
            let actual_id = entity::sha1_hex(&canonical);
            if &actual_id != id {
                return Err(Error::Other(anyhow::anyhow!(
                    "downloaded file {id} failed id verification (got {actual_id})"
                )));
            }
            self.store.write_object_raw(id, &encoded)?;
        }
        Ok(())
    }

    async fn fetch_missing_chunks(&self, ids: &[String], stat: &mut TrafficStat) -> Result<(), Error> {
        for id in ids {
            if self.store.has_object(id) {
                continue;
            }
            let encoded = self.cloud.download_object(&object_key(id)).await?;
            stat.download_bytes += encoded.len() as u64;
            stat.download_chunk_count += 1;
            stat.api_get += 1;

            let data = crypto::decrypt(&self.config.aes_key, &encoded, id)
                .and_then(|compressed| compress::decompress(&compressed).map_err(Error::Other))?;
            let actual_id = entity::sha1_hex(&data);
            if &actual_id != id {
                return Err(Error::Other(anyhow::anyhow!(
                    "downloaded chunk {id} failed id verification (got {actual_id})"
                )));
            }
            self.store.write_object_raw(id, &encoded)?;
        }
        Ok(())
    }

    /// `SyncDownload` (spec §4.3): lock, diff, fetch, three-way merge,
    /// snapshot, unlock.
    pub async fn sync_download(&self, cancel: &CancelToken) -> Result<(MergeResult, TrafficStat), Error> {
        let _guard = self.sync_mutex.lock().await;
        let mut stat = TrafficStat::default();

        self.lock_manager.try_lock().await?;
        let result = self.sync_download_locked(cancel, &mut stat).await;
        self.lock_manager.unlock().await;
        let result = result?;

        let delta = stat.to_delta();
        let cloud = self.cloud.clone();
        tokio::spawn(async move { cloud.add_traffic(delta).await });

        Ok((result, stat))
    }

    async fn sync_download_locked(
        &self,
        cancel: &CancelToken,
        stat: &mut TrafficStat,
    ) -> Result<MergeResult, Error> {
        cancel.check()?;

        let local_latest = self.local_latest()?;
        let cloud_latest = self.download_cloud_latest(stat).await?;

        let (local_id, cloud_id) = (
            local_latest.as_ref().map(|i| i.id.clone()).unwrap_or_default(),
            cloud_latest.as_ref().map(|i| i.id.clone()).unwrap_or_default(),
        );
        if cloud_id == local_id || cloud_id.is_empty() {
            return Ok(MergeResult {
                time_ms: now_ms(),
                ..Default::default()
            });
        }
        let cloud_latest = cloud_latest.expect("cloud_id non-empty implies Some");

        cancel.check()?;
        self.fetch_missing_files(&cloud_latest.files, stat).await?;
        let cloud_latest_files = self.files_of(&cloud_latest.files)?;

        let mut cloud_chunk_ids: Vec<String> = cloud_latest_files
            .iter()
            .flat_map(|f| f.chunks.iter().cloned())
            .collect();
        cloud_chunk_ids.sort();
        cloud_chunk_ids.dedup();

        cancel.check()?;
        self.fetch_missing_chunks(&cloud_chunk_ids, stat).await?;

        let latest_files = match &local_latest {
            Some(i) => self.files_of(&i.files)?,
            None => Vec::new(),
        };
        let latest_sync = self.local_latest_sync()?;
        let latest_sync_files = match &latest_sync {
            Some(i) => self.files_of(&i.files)?,
            None => Vec::new(),
        };

        let local_diff = diff::diff(&latest_files, &latest_sync_files);
        let merge_diff = diff::diff(&cloud_latest_files, &latest_files);

        let mut result = MergeResult {
            time_ms: now_ms(),
            upserts: merge_diff.upserts,
            removes: merge_diff.removes,
            conflicts: Vec::new(),
        };

        for local_upsert in &local_diff.upserts {
            if diff::contains_path(&result.upserts, local_upsert) || diff::contains_path(&result.removes, local_upsert) {
                result.conflicts.push(local_upsert.clone());
            }
        }

        if !result.conflicts.is_empty() {
            self.archive_conflicts(&result)?;
        }

        let indexer = Indexer::new(&self.store, self.events.clone());
        if !result.upserts.is_empty() {
            indexer.checkout_files(&result.upserts, &self.config.data_path)?;
        }
        if !result.removes.is_empty() {
            let paths: Vec<String> = result.removes.iter().map(|f| f.path.clone()).collect();
            indexer.remove_files(&paths, &self.config.data_path)?;
        }

        cancel.check()?;
        let merge_start = now_ms();
        let parent_id = local_latest.as_ref().map(|i| i.id.clone());
        let parent = match &parent_id {
            Some(id) => Some(self.store.get_index(id)?),
            None => None,
        };
        let mut merged = indexer.index(&self.config.data_path, parent.as_ref(), "[Sync] merge in progress".to_string())?;
        let elapsed_secs = (now_ms() - merge_start) as f64 / 1000.0;
        merged = Index::new(
            merged.parent,
            format!("[Sync] Cloud sync merge, completed in {elapsed_secs:.2}s"),
            merged.created,
            merged.files,
            merged.size,
            merged.count,
            merged.chunk_count,
            merged.hash_count,
        );
        self.store.put_index(&merged)?;

        self.store.write_ref(REF_LATEST, &merged.id)?;
        self.store.write_ref(REF_LATEST_SYNC, &merged.id)?;

        indexer.remove_empty_dirs(&self.config.data_path, &self.config.remove_empty_dir_excludes)?;

        Ok(result)
    }

    fn archive_conflicts(&self, result: &MergeResult) -> Result<(), Error> {
        let now = chrono::Utc::now();
        let timestamp = now.format("%Y-%m-%d-%H%M%S").to_string();
        let dir = batch_dir(&self.config.conflicts_dir(), &timestamp);

        let indexer = Indexer::new(&self.store, self.events.clone());
        for conflict in &result.conflicts {
            let file = self.store.get_file(&conflict.id)?;
            indexer.checkout_file(&file, &dir)?;
            let archived_path = dir.join(&file.path);
            self.conflict_sink
                .record(&file.path, &archived_path)
                .map_err(|_| Error::GenerateConflictHistory(file.path.clone()))?;
        }
        Ok(())
    }

    /// `SyncUpload` (spec §4.3): lock, quota check, upload chunks then
    /// files then the index, then the refs, then the index list, unlock.
    pub async fn sync_upload(&self, cancel: &CancelToken) -> Result<TrafficStat, Error> {
        let _guard = self.sync_mutex.lock().await;
        let mut stat = TrafficStat::default();

        self.lock_manager.try_lock().await?;
        let result = self.sync_upload_locked(cancel, &mut stat).await;
        self.lock_manager.unlock().await;
        result?;

        let delta = stat.to_delta();
        let cloud = self.cloud.clone();
        tokio::spawn(async move { cloud.add_traffic(delta).await });

        Ok(stat)
    }

    async fn sync_upload_locked(&self, cancel: &CancelToken, stat: &mut TrafficStat) -> Result<(), Error> {
        cancel.check()?;

        let local = self
            .local_latest()?
            .ok_or_else(|| Error::Other(anyhow::anyhow!("nothing to upload: no local snapshot yet")))?;
        let cloud_latest = self.download_cloud_latest(stat).await?;
        if cloud_latest.as_ref().map(|i| i.id.as_str()) == Some(local.id.as_str()) {
            return Ok(());
        }

        let available = self.cloud.get_available_size().await?;
        let cloud_size = cloud_latest.as_ref().map(|i| i.size).unwrap_or(0);
        if available <= cloud_size.max(local.size) {
            return Err(Error::StorageSizeExceeded);
        }

        let cloud_file_ids: HashSet<String> = cloud_latest
            .as_ref()
            .map(|i| i.files.iter().cloned().collect())
            .unwrap_or_default();

        let upload_files: Vec<entity::File> = local
            .files
            .iter()
            .filter(|id| !cloud_file_ids.contains(*id))
            .map(|id| self.store.get_file(id))
            .collect::<Result<_, _>>()?;

        let mut upload_chunk_ids: Vec<String> = upload_files
            .iter()
            .flat_map(|f| f.chunks.iter().cloned())
            .collect();
        upload_chunk_ids.sort();
        upload_chunk_ids.dedup();

        cancel.check()?;
        for chunk_id in &upload_chunk_ids {
            let encoded = self.store.read_object_raw(chunk_id)?;
            self.cloud.upload_object(&object_key(chunk_id), &encoded, false).await?;
            stat.upload_chunk_count += 1;
            stat.upload_bytes += encoded.len() as u64;
            stat.api_put += 1;
        }

        cancel.check()?;
        for file in &upload_files {
            let encoded = self.store.read_object_raw(&file.id)?;
            self.cloud.upload_object(&object_key(&file.id), &encoded, false).await?;
            stat.upload_file_count += 1;
            stat.upload_bytes += encoded.len() as u64;
            stat.api_put += 1;
        }

        cancel.check()?;
        let index_bytes = self.store.read_index_raw(&local.id)?;
        self.cloud
            .upload_object(&index_key(&local.id), &index_bytes, false)
            .await?;
        stat.upload_file_count += 1;
        stat.upload_bytes += index_bytes.len() as u64;
        stat.api_put += 1;

        let ref_bytes = format!("{}\n", local.id).into_bytes();
        self.cloud
            .upload_object(&ref_key(REF_LATEST), &ref_bytes, true)
            .await?;
        stat.upload_file_count += 1;
        stat.upload_bytes += ref_bytes.len() as u64;
        stat.api_put += 1;

        self.update_cloud_index_list(&local.id, stat).await?;

        Ok(())
    }

    async fn update_cloud_index_list(&self, index_id: &str, stat: &mut TrafficStat) -> Result<(), Error> {
        let key = "refs/index-list".to_string();
        let mut list = match self.cloud.download_object(&key).await {
            Ok(bytes) => {
                stat.download_bytes += bytes.len() as u64;
                stat.api_get += 1;
                String::from_utf8_lossy(&bytes)
                    .lines()
                    .map(|l| l.to_string())
                    .collect::<Vec<_>>()
            }
            Err(Error::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };

        if !list.iter().any(|id| id == index_id) {
            list.push(index_id.to_string());
        }
        let bytes = list.join("\n").into_bytes();
        self.cloud.upload_object(&key, &bytes, true).await?;
        stat.upload_bytes += bytes.len() as u64;
        stat.api_put += 1;
        Ok(())
    }
}

pub fn chunk_avg_size() -> usize {
    chunker::CHUNK_SIZE_AVG
}

pub(crate) fn conflicts_temp_dir(temp_path: &std::path::Path) -> PathBuf {
    temp_path.join("repo").join("sync").join("conflicts")
}
