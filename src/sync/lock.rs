//! The cloud lock manager (spec §4.4): an advisory mutual-exclusion lock
//! shared by all devices of a user, grounded directly on
//! `original_source/dejavu/sync_lock.go` (`tryLockCloud`/`lockCloud`/
//! `unlockCloud`). The 3-retry/5s-backoff loop, the 65-second staleness
//! threshold and the background 30-second refresher are carried over
//! unchanged; only the refresher's stop signal is idiomatic Rust (a
//! `tokio::sync::oneshot` instead of a shared global channel, since a
//! global `chan bool` per process would alias across repositories opened
//! in the same process).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::event::{self, SharedEventBus};
use crate::sync::transport::CloudTransport;

const LOCK_KEY: &str = "lock-sync";
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF_SECS: u64 = 5;
const STALE_AFTER_SECS: i64 = 65;
const REFRESH_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Serialize, Deserialize)]
struct LockPayload {
    #[serde(rename = "deviceID")]
    device_id: String,
    time: i64,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct CloudLockManager {
    cloud: Arc<dyn CloudTransport>,
    device_id: String,
    events: SharedEventBus,
    refresher: tokio::sync::Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

impl CloudLockManager {
    pub fn new(cloud: Arc<dyn CloudTransport>, device_id: String, events: SharedEventBus) -> Self {
        Self {
            cloud,
            device_id,
            events,
            refresher: tokio::sync::Mutex::new(None),
        }
    }

    async fn write_fresh_lock(&self) -> Result<(), Error> {
        let payload = LockPayload {
            device_id: self.device_id.clone(),
            time: now_ms(),
        };
        let bytes = serde_json::to_vec(&payload).map_err(|e| Error::Other(e.into()))?;
        match self.cloud.upload_object(LOCK_KEY, &bytes, true).await {
            Ok(()) => Ok(()),
            Err(e @ Error::SystemTimeIncorrect) | Err(e @ Error::CloudAuthFailed) => Err(e),
            Err(e) => Err(Error::LockCloudFailed(e.to_string())),
        }
    }

    async fn try_lock_once(&self) -> Result<bool, Error> {
        let data = match self.cloud.download_object(LOCK_KEY).await {
            Ok(data) => data,
            Err(Error::NotFound(_)) => {
                self.write_fresh_lock().await?;
                return Ok(true);
            }
            Err(e) => return Err(e),
        };

        let payload: LockPayload = match serde_json::from_slice(&data) {
            Ok(p) => p,
            Err(e) => return Err(Error::LockCloudFailed(e.to_string())),
        };

        let stale = now_ms() - payload.time > STALE_AFTER_SECS * 1000;
        if payload.device_id == self.device_id || stale {
            self.write_fresh_lock().await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Acquire the lock, retrying up to [`MAX_ATTEMPTS`] times with a
    /// 5-second backoff while another device holds a non-stale lease.
    pub async fn try_lock(&self) -> Result<(), Error> {
        for attempt in 0..MAX_ATTEMPTS {
            self.events.publish(event::topic::CLOUD_LOCK, &event::ctx());

            match self.try_lock_once().await {
                Ok(true) => {
                    self.spawn_refresher();
                    return Ok(());
                }
                Ok(false) => {
                    if attempt + 1 < MAX_ATTEMPTS {
                        tokio::time::sleep(std::time::Duration::from_secs(RETRY_BACKOFF_SECS)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::CloudLocked)
    }

    fn spawn_refresher(&self) {
        let (tx, mut rx) = oneshot::channel();
        let cloud = self.cloud.clone();
        let device_id = self.device_id.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(REFRESH_INTERVAL_SECS));
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = &mut rx => return,
                    _ = interval.tick() => {
                        let payload = LockPayload { device_id: device_id.clone(), time: now_ms() };
                        if let Ok(bytes) = serde_json::to_vec(&payload) {
                            if let Err(e) = cloud.upload_object(LOCK_KEY, &bytes, true).await {
                                log::error!("refresh cloud repo lock failed: {e}");
                            }
                        }
                    }
                }
            }
        });

        // Blocking lock is fine here: try_lock/unlock never hold it across
        // an await while contended (this is the only writer at a time).
        if let Ok(mut guard) = self.refresher.try_lock() {
            *guard = Some((tx, handle));
        }
    }

    /// Stop the refresher and delete the lock object. Mirrors
    /// `unlockCloud`: an auth failure is not retried, and unlock never
    /// propagates an error (spec §4.4, §7 "no error path skips lock
    /// release" implies unlock itself must not be fallible from the
    /// caller's point of view).
    pub async fn unlock(&self) {
        if let Some((tx, handle)) = self.refresher.lock().await.take() {
            let _ = tx.send(());
            let _ = handle.await;
        }

        for _ in 0..MAX_ATTEMPTS {
            self.events.publish(event::topic::CLOUD_UNLOCK, &event::ctx());
            match self.cloud.remove_object(LOCK_KEY).await {
                Ok(()) => return,
                Err(Error::CloudAuthFailed) => return,
                Err(e) => log::error!("unlock cloud repo failed: {e}"),
            }
        }
    }
}
