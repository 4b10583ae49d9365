//! The cloud transport adapter (spec §4.5): an abstract capability set, not
//! a specific vendor SDK. Trait shape grounded on `CloudStorage` in
//! `hideselfview-bae/bae/src/cloud_storage.rs` (an `async_trait` over
//! upload/download), generalized to the full operation set spec §4.5 lists,
//! plus a `MockCloudTransport` test double grounded on that crate's
//! `MockCloudStorage` (in-memory, behind a `Mutex`, used only by tests).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::Error;

/// Traffic reported after an operation, summed into the caller's
/// `TrafficStat` (spec §4.3/§9).
#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficDelta {
    pub download_bytes: u64,
    pub upload_bytes: u64,
    pub api_get: u64,
    pub api_put: u64,
}

#[async_trait]
pub trait CloudTransport: Send + Sync {
    async fn download_object(&self, key: &str) -> Result<Vec<u8>, Error>;
    async fn upload_object(&self, key: &str, data: &[u8], overwrite: bool) -> Result<(), Error>;
    async fn remove_object(&self, key: &str) -> Result<(), Error>;
    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, Error>;
    async fn get_available_size(&self) -> Result<u64, Error>;
    /// Fire-and-forget traffic submission (spec §4.3 step 10 / `sync_manual.go`'s
    /// `go repo.cloud.AddTraffic(...)`). Implementations should not block the
    /// caller; failures are logged, not propagated.
    async fn add_traffic(&self, delta: TrafficDelta);
}

/// In-memory transport for tests. Not a production adapter: a real vendor
/// SDK is an external collaborator per spec §1.
pub struct MockCloudTransport {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    available_size: Mutex<u64>,
}

impl MockCloudTransport {
    pub fn new(available_size: u64) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            available_size: Mutex::new(available_size),
        }
    }

    pub fn set_available_size(&self, size: u64) {
        *self.available_size.lock().unwrap() = size;
    }

    /// Test hook: seed an object directly, bypassing `upload_object`'s
    /// overwrite policy.
    pub fn seed(&self, key: &str, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), data);
    }
}

#[async_trait]
impl CloudTransport for MockCloudTransport {
    async fn download_object(&self, key: &str) -> Result<Vec<u8>, Error> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    async fn upload_object(&self, key: &str, data: &[u8], overwrite: bool) -> Result<(), Error> {
        let mut objects = self.objects.lock().unwrap();
        if !overwrite && objects.contains_key(key) {
            return Ok(());
        }
        objects.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn remove_object(&self, key: &str) -> Result<(), Error> {
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<String>, Error> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get_available_size(&self) -> Result<u64, Error> {
        Ok(*self.available_size.lock().unwrap())
    }

    async fn add_traffic(&self, _delta: TrafficDelta) {}
}
