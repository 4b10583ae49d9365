//! Content-addressed snapshot store and multi-device synchronization engine.
//!
//! # Data model
//!
//! Four persistent entity kinds live under a repository directory, all
//! identified by the SHA-1 of their canonical encoded content: [`Chunk`]s
//! (raw content ranges), [`File`]s (path/size/mtime plus an ordered chunk
//! list), [`Index`]es (a snapshot: a set of file ids plus bookkeeping) and
//! `Ref`s (small mutable pointers under `refs/`, e.g. `refs/latest`).
//!
//! ```text
//! objects/<id[0:2]>/<id[2:]>   chunks and files (compressed + encrypted)
//! indexes/<id>                 indexes (compressed only, never encrypted)
//! refs/<name>                  ref files (plaintext id + newline)
//! ```
//!
//! # Pipeline
//!
//! [`chunker`] splits file content into content-defined chunks; [`indexer`]
//! walks a working directory into [`entity::Chunk`]/[`entity::File`]/
//! [`entity::Index`] entities (and walks an index back into a working
//! directory on checkout); [`store`] persists and retrieves those entities,
//! applying [`compress`]ion, [`crypto`] and an in-memory [`cache`]; [`sync`]
//! orchestrates two-way reconciliation with a cloud-held twin of the same
//! store, through a cross-device lock ([`sync::lock`]) and an abstract
//! transport ([`sync::transport`]).
//!
//! # Concurrency
//!
//! The [`store::Store`]'s caches are safe for concurrent read/write; all
//! individual object I/O is additionally serialized through one coarse
//! mutex, mirroring the single process-wide file lock this crate's design
//! is grounded on (see `store.rs`). [`sync::SyncEngine`] holds its own
//! mutex so at most one `sync_download`/`sync_upload` runs at a time.

pub mod cache;
pub mod chunker;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod diff;
pub mod entity;
pub mod error;
pub mod event;
pub mod indexer;
pub mod store;
pub mod sync;

pub use config::{FsyncLevel, RepoConfig};
pub use entity::{Chunk, File, Index, REF_LATEST, REF_LATEST_SYNC};
pub use error::{Error, Result};
pub use indexer::Indexer;
pub use store::{PurgeStat, Store};
pub use sync::{CancelToken, MergeResult, SyncEngine, TrafficStat};
