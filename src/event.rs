//! Best-effort progress event publication (spec §6).
//!
//! Grounded on `original_source/eventbus/eventbus.go`: a flat set of topic
//! strings, each carrying a loosely-typed context. The original is a
//! process-global bus with `Publish`/`Subscribe`; per spec §9 ("there is no
//! process-global bus requirement"), this crate instead takes a
//! capability-style callback in configuration, and publishing never returns
//! an error — a subscriber panic or slow handler must never abort an
//! indexing or sync operation.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Topic strings, mirroring `eventbus.go`'s `Evt*` constants for the subset
/// this crate's core actually emits (the SQL/clipboard/UI topics stay with
/// their respective external collaborators).
pub mod topic {
    pub const INDEX_BEFORE_WALK_DATA: &str = "repo.index.beforeWalkData";
    pub const INDEX_UPSERT_FILE: &str = "repo.index.upsertFile";
    pub const INDEX_BEFORE_GET_LATEST_FILES: &str = "repo.index.beforeGetLatestFiles";
    pub const CHECKOUT_BEFORE_WALK_DATA: &str = "repo.checkout.beforeWalkData";
    pub const CHECKOUT_UPSERT_FILE: &str = "repo.checkout.upsertFile";
    pub const CHECKOUT_REMOVE_FILE: &str = "repo.checkout.removeFile";
    pub const CLOUD_LOCK: &str = "repo.cloudLock";
    pub const CLOUD_UNLOCK: &str = "repo.cloudUnlock";
    pub const CLOUD_BEFORE_UPLOAD_CHUNK: &str = "repo.cloudBeforeUploadChunk";
    pub const CLOUD_BEFORE_DOWNLOAD_CHUNK: &str = "repo.cloudBeforeDownloadChunk";
}

/// Map-like context accompanying an event, e.g. `{"path": "notes/a.md"}`.
pub type Context = BTreeMap<String, String>;

pub fn ctx() -> Context {
    BTreeMap::new()
}

/// A publish-only sink for progress events. Implementors must be
/// non-blocking or dispatch to their own scheduler (spec §9).
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, context: &Context);
}

/// Default event bus: drops every event. Used when no collaborator cares
/// about progress reporting.
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn publish(&self, _topic: &str, _context: &Context) {}
}

impl fmt::Debug for NullEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NullEventBus")
    }
}

pub type SharedEventBus = Arc<dyn EventBus>;

pub fn null_event_bus() -> SharedEventBus {
    Arc::new(NullEventBus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingBus {
        topics: Mutex<Vec<String>>,
    }

    impl EventBus for RecordingBus {
        fn publish(&self, topic: &str, _context: &Context) {
            self.topics.lock().unwrap().push(topic.to_string());
        }
    }

    #[test]
    fn null_bus_accepts_any_event_without_panicking() {
        let bus = null_event_bus();
        bus.publish(topic::INDEX_UPSERT_FILE, &ctx());
    }

    #[test]
    fn recording_bus_captures_published_topics() {
        let bus = RecordingBus { topics: Mutex::new(Vec::new()) };
        bus.publish(topic::CLOUD_LOCK, &ctx());
        bus.publish(topic::CLOUD_UNLOCK, &ctx());
        assert_eq!(bus.topics.into_inner().unwrap(), vec![topic::CLOUD_LOCK, topic::CLOUD_UNLOCK]);
    }
}
