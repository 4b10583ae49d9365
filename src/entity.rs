//! The four persistent entity kinds (spec §3): Chunk, File, Index and Ref.
//!
//! Every entity's `id` is the SHA-1 of its *canonical bytes*, which never
//! include the id itself — the same way a content-addressed blob store
//! never embeds its own hash in its payload. For `File` and `Index` the
//! canonical bytes are canonical JSON of every other field, in the field
//! order this module declares them (spec §6: "object keys in
//! source-declared order"). For `Chunk` the canonical bytes are simply the
//! chunk's raw content — there is no JSON wrapper for chunks.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// An opaque byte range carved from a source file. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: String,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn new(data: Vec<u8>) -> Self {
        let id = sha1_hex(&data);
        Self { id, data }
    }

    /// Bytes written to and read from `objects/<id[0:2]>/<id[2:]>` before
    /// compression/encryption are applied — for a chunk this is simply its
    /// content.
    pub fn canonical_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn from_parts(id: String, data: Vec<u8>) -> Self {
        Self { id, data }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileBody {
    path: String,
    size: u64,
    updated: i64,
    chunks: Vec<String>,
}

/// Logical file manifest: a path, its size/mtime, and the ordered chunk ids
/// that reconstruct its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub id: String,
    pub path: String,
    pub size: u64,
    /// mtime in milliseconds since epoch.
    pub updated: i64,
    pub chunks: Vec<String>,
}

impl File {
    pub fn new(path: String, size: u64, updated: i64, chunks: Vec<String>) -> Self {
        let body = FileBody {
            path: path.clone(),
            size,
            updated,
            chunks: chunks.clone(),
        };
        let bytes = serde_json::to_vec(&body).expect("FileBody serialization cannot fail");
        let id = sha1_hex(&bytes);
        Self {
            id,
            path,
            size,
            updated,
            chunks,
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let body = FileBody {
            path: self.path.clone(),
            size: self.size,
            updated: self.updated,
            chunks: self.chunks.clone(),
        };
        serde_json::to_vec(&body).expect("FileBody serialization cannot fail")
    }

    pub fn from_canonical_bytes(id: String, bytes: &[u8]) -> anyhow::Result<Self> {
        let body: FileBody = serde_json::from_slice(bytes)?;
        Ok(Self {
            id,
            path: body.path,
            size: body.size,
            updated: body.updated,
            chunks: body.chunks,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexBody {
    parent: String,
    memo: String,
    created: i64,
    files: Vec<String>,
    size: u64,
    count: u64,
    chunk_count: u64,
    hash_count: u64,
}

/// A snapshot: a set of file ids plus bookkeeping, and a link to its parent
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub id: String,
    /// Previous index id, or empty string for the first snapshot.
    pub parent: String,
    pub memo: String,
    /// Creation time in milliseconds since epoch.
    pub created: i64,
    /// File ids. Stored sorted so canonicalization is deterministic even
    /// though the set itself is logically unordered (spec §3).
    pub files: Vec<String>,
    pub size: u64,
    pub count: u64,
    /// Total chunk references across all files (duplicates counted).
    pub chunk_count: u64,
    /// Distinct chunk ids across all files.
    pub hash_count: u64,
}

impl Index {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        parent: String,
        memo: String,
        created: i64,
        mut files: Vec<String>,
        size: u64,
        count: u64,
        chunk_count: u64,
        hash_count: u64,
    ) -> Self {
        files.sort();
        let body = IndexBody {
            parent: parent.clone(),
            memo: memo.clone(),
            created,
            files: files.clone(),
            size,
            count,
            chunk_count,
            hash_count,
        };
        let bytes = serde_json::to_vec(&body).expect("IndexBody serialization cannot fail");
        let id = sha1_hex(&bytes);
        Self {
            id,
            parent,
            memo,
            created,
            files,
            size,
            count,
            chunk_count,
            hash_count,
        }
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let body = IndexBody {
            parent: self.parent.clone(),
            memo: self.memo.clone(),
            created: self.created,
            files: self.files.clone(),
            size: self.size,
            count: self.count,
            chunk_count: self.chunk_count,
            hash_count: self.hash_count,
        };
        serde_json::to_vec(&body).expect("IndexBody serialization cannot fail")
    }

    pub fn from_canonical_bytes(id: String, bytes: &[u8]) -> anyhow::Result<Self> {
        let body: IndexBody = serde_json::from_slice(bytes)?;
        Ok(Self {
            id,
            parent: body.parent,
            memo: body.memo,
            created: body.created,
            files: body.files,
            size: body.size,
            count: body.count,
            chunk_count: body.chunk_count,
            hash_count: body.hash_count,
        })
    }
}

pub const REF_LATEST: &str = "latest";
pub const REF_LATEST_SYNC: &str = "latest-sync";
