//! The local change buffer.
//!
//! Storage is a collaborator of the core: entries are keyed by
//! `(lsn, index)` within a scope, scanned in key order across a set of
//! scopes, and purged by age. [`ChangeStore`] is the seam a real embedded
//! engine would plug into; [`MemoryStore`] is the in-process
//! implementation used by the server and the tests.

use std::collections::BTreeMap;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::error::Result;
use crate::sequence::Sequence;

/// One scan over the buffer. `first` and `last` are the lowest and highest
/// sequences present in the store across all scopes (zero when empty),
/// which the long-poll layer uses to decide where to start waiting.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    pub entries: Vec<Bytes>,
    pub first: Sequence,
    pub last: Sequence,
}

pub trait ChangeStore: Send + Sync {
    /// Insert one change payload for a scope.
    fn put(&self, scope: &str, lsn: u64, index: u32, data: Bytes) -> Result<()>;

    /// Scan entries with sequence >= `since`, in sequence order, keeping
    /// only those whose scope is in `scopes`, up to `limit`.
    fn scan(&self, scopes: &[String], since: Sequence, limit: usize) -> Result<ScanResult>;

    /// Delete entries written before `oldest`, returning how many went.
    fn purge_older_than(&self, oldest: SystemTime) -> Result<u64>;
}

struct StoredEntry {
    scope: String,
    data: Bytes,
    written_at: SystemTime,
}

/// An ordered in-memory store. Writes come from the replication relay,
/// reads from concurrent HTTP requests; a read-write lock covers both.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<BTreeMap<(u64, u32), StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl ChangeStore for MemoryStore {
    fn put(&self, scope: &str, lsn: u64, index: u32, data: Bytes) -> Result<()> {
        self.inner.write().insert(
            (lsn, index),
            StoredEntry {
                scope: scope.to_string(),
                data,
                written_at: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn scan(&self, scopes: &[String], since: Sequence, limit: usize) -> Result<ScanResult> {
        let map = self.inner.read();
        let mut result = ScanResult::default();
        if let Some((&(lsn, index), _)) = map.iter().next() {
            result.first = Sequence::new(lsn, index);
        }
        if let Some((&(lsn, index), _)) = map.iter().next_back() {
            result.last = Sequence::new(lsn, index);
        }
        for entry in map.range((since.lsn, since.index)..).map(|(_, e)| e) {
            if result.entries.len() >= limit {
                break;
            }
            if scopes.iter().any(|s| *s == entry.scope) {
                result.entries.push(entry.data.clone());
            }
        }
        Ok(result)
    }

    fn purge_older_than(&self, oldest: SystemTime) -> Result<u64> {
        let mut map = self.inner.write();
        let before = map.len();
        map.retain(|_, entry| entry.written_at >= oldest);
        Ok((before - map.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn put(store: &MemoryStore, scope: &str, lsn: u64, index: u32, data: &str) {
        store
            .put(scope, lsn, index, Bytes::copy_from_slice(data.as_bytes()))
            .unwrap();
    }

    fn scopes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn scan_is_ordered_and_scoped() {
        let store = MemoryStore::new();
        put(&store, "a", 2, 0, "second");
        put(&store, "b", 1, 0, "first");
        put(&store, "a", 2, 1, "third");
        put(&store, "c", 3, 0, "other scope");

        let result = store
            .scan(&scopes(&["a", "b"]), Sequence::default(), 100)
            .unwrap();
        let texts: Vec<_> = result
            .entries
            .iter()
            .map(|e| String::from_utf8_lossy(e).into_owned())
            .collect();
        assert_eq!(texts, ["first", "second", "third"]);
        assert_eq!(result.first, Sequence::new(1, 0));
        assert_eq!(result.last, Sequence::new(3, 0));
    }

    #[test]
    fn scan_since_is_inclusive() {
        let store = MemoryStore::new();
        put(&store, "", 1, 0, "one");
        put(&store, "", 2, 0, "two");

        let result = store.scan(&scopes(&[""]), Sequence::new(2, 0), 100).unwrap();
        assert_eq!(result.entries.len(), 1);
        assert_eq!(&result.entries[0][..], b"two");
    }

    #[test]
    fn scan_respects_limit() {
        let store = MemoryStore::new();
        for lsn in 1..=10 {
            put(&store, "", lsn, 0, "x");
        }
        let result = store.scan(&scopes(&[""]), Sequence::default(), 3).unwrap();
        assert_eq!(result.entries.len(), 3);
        assert_eq!(result.last, Sequence::new(10, 0));
    }

    #[test]
    fn empty_store_scans_to_zero_bounds() {
        let store = MemoryStore::new();
        let result = store.scan(&scopes(&[""]), Sequence::default(), 10).unwrap();
        assert!(result.entries.is_empty());
        assert!(result.first.is_zero());
        assert!(result.last.is_zero());
    }

    #[test]
    fn purge_by_age() {
        let store = MemoryStore::new();
        put(&store, "", 1, 0, "old");
        let cutoff = SystemTime::now() + Duration::from_secs(1);
        let purged = store.purge_older_than(cutoff).unwrap();
        assert_eq!(purged, 1);
        assert!(store.is_empty());
    }
}
