//! File-list diffing for the sync engine (spec §4.3), grounded on
//! `DiffUpsertRemove` as used throughout `original_source/dejavu/sync_manual.go`.
//!
//! `diff(a, b)` answers "what would you do to `b` to turn it into `a`":
//! `upserts` are files in `a` that are new or changed relative to `b` (same
//! path, different id, or no matching path at all); `removes` are files in
//! `b` whose path no longer appears in `a`.

use std::collections::HashMap;

use crate::entity::File;

pub struct Diff {
    pub upserts: Vec<File>,
    pub removes: Vec<File>,
}

pub fn diff(a: &[File], b: &[File]) -> Diff {
    let b_by_path: HashMap<&str, &File> = b.iter().map(|f| (f.path.as_str(), f)).collect();
    let a_paths: std::collections::HashSet<&str> = a.iter().map(|f| f.path.as_str()).collect();

    let upserts = a
        .iter()
        .filter(|f| match b_by_path.get(f.path.as_str()) {
            None => true,
            Some(existing) => existing.id != f.id,
        })
        .cloned()
        .collect();

    let removes = b
        .iter()
        .filter(|f| !a_paths.contains(f.path.as_str()))
        .cloned()
        .collect();

    Diff { upserts, removes }
}

/// `true` if `needle`'s path appears in `haystack` (used to test whether a
/// local upsert also appears in the cloud's upsert/remove set, per spec
/// §4.3 step 7's conflict detection).
pub fn contains_path(haystack: &[File], needle: &File) -> bool {
    haystack.iter().any(|f| f.path == needle.path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(path: &str, id: &str) -> File {
        File {
            id: id.to_string(),
            path: path.to_string(),
            size: 0,
            updated: 0,
            chunks: vec![],
        }
    }

    #[test]
    fn new_path_is_an_upsert() {
        let a = vec![f("x", "1")];
        let b = vec![];
        let d = diff(&a, &b);
        assert_eq!(d.upserts.len(), 1);
        assert!(d.removes.is_empty());
    }

    #[test]
    fn changed_content_same_path_is_an_upsert() {
        let a = vec![f("x", "2")];
        let b = vec![f("x", "1")];
        let d = diff(&a, &b);
        assert_eq!(d.upserts.len(), 1);
        assert!(d.removes.is_empty());
    }

    #[test]
    fn unchanged_path_and_id_is_neither() {
        let a = vec![f("x", "1")];
        let b = vec![f("x", "1")];
        let d = diff(&a, &b);
        assert!(d.upserts.is_empty());
        assert!(d.removes.is_empty());
    }

    #[test]
    fn missing_from_a_is_a_remove() {
        let a = vec![];
        let b = vec![f("x", "1")];
        let d = diff(&a, &b);
        assert!(d.upserts.is_empty());
        assert_eq!(d.removes.len(), 1);
    }
}
