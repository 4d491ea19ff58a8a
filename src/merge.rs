//! Merging folds any number of caches into a destination cache.
//!
//! Everything is read into memory first, grouped by destination
//! bucket.  When a key appears in several caches, the destination's
//! own value wins; otherwise, the last constituent to hold the key
//! wins.  Each merged bucket is then published atomically (temporary
//! file and rename), so a crash mid-merge leaves every bucket either
//! as it was or fully merged.  Merging is not isolated from
//! concurrent writers to the same caches.
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::Cache;
use crate::cache::CacheKey;
use crate::cache::CacheValue;
use crate::error::Result;

type Merged<K, V> = BTreeMap<u64, HashMap<K, Arc<V>>>;

/// Reads every entry of `source` into `merged`, keyed by bucket in
/// `destination`.  Returns the number of entries read.
fn absorb<K: CacheKey, V: CacheValue>(
    merged: &mut Merged<K, V>,
    destination: &Cache<K, V>,
    source: &Cache<K, V>,
) -> Result<usize> {
    let mut count = 0;

    for entry in source {
        let (key, value) = entry?;

        merged
            .entry(destination.bucket_of(&key))
            .or_default()
            .insert(key, value);
        count += 1;
    }

    Ok(count)
}

/// Merges every entry in `constituents` into `destination`.
///
/// Constituents are left untouched on disk, but their in-memory
/// state is dropped.  Destination bucket files that end up with no
/// entry (e.g., leftovers from a different `max_buckets`) are
/// deleted.
pub fn merge<K: CacheKey, V: CacheValue>(
    destination: &Cache<K, V>,
    constituents: &[&Cache<K, V>],
) -> Result<()> {
    let mut merged: Merged<K, V> = BTreeMap::new();

    for constituent in constituents {
        let count = absorb(&mut merged, destination, constituent)?;
        tracing::info!(source = %constituent.path().display(), entries = count,
                       "read constituent cache for merge");
    }

    let count = absorb(&mut merged, destination, destination)?;
    tracing::info!(destination = %destination.path().display(), entries = count,
                   "read destination cache for merge");

    for constituent in constituents {
        constituent.clear();
    }
    destination.clear();

    for (bucket, entries) in &merged {
        let entries: Vec<(&K, &Arc<V>)> = entries.iter().collect();
        destination.store().write_fresh(*bucket, &entries)?;
    }

    let mut stale = 0;
    for bucket in destination.store().list()? {
        if !merged.contains_key(&bucket) && destination.store().delete(bucket)? {
            stale += 1;
        }
    }

    // Anything loaded while we were publishing may predate the merge.
    destination.clear();

    tracing::info!(destination = %destination.path().display(),
                   buckets = merged.len(),
                   entries = merged.values().map(HashMap::len).sum::<usize>(),
                   stale_buckets = stale,
                   "merged caches");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use test_dir::{DirBuilder, FileType, TestDir};

    fn open(temp: &TestDir, name: &str) -> Cache<u32, String> {
        Cache::with_max_buckets(temp.path(name), 8).expect("open must succeed")
    }

    #[test]
    fn test_destination_wins_then_last() {
        let temp = TestDir::temp();
        let destination = open(&temp, "dest");
        let first = open(&temp, "first");
        let second = open(&temp, "second");

        destination.put(1, "a".into()).expect("put must succeed");
        first.put(1, "z".into()).expect("put must succeed");
        first.put(2, "b".into()).expect("put must succeed");
        second.put(2, "c".into()).expect("put must succeed");

        merge(&destination, &[&first, &second]).expect("merge must succeed");

        let entries = destination.entries().expect("entries must succeed");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[&1].as_str(), "a");
        assert_eq!(entries[&2].as_str(), "c");

        // Constituents are unchanged on disk.
        assert_eq!(first.size().expect("size must succeed"), 2);
        assert_eq!(
            second.get(&2).expect("get must succeed").as_deref(),
            Some(&"c".to_string())
        );

        // And the result survives a reopen.
        drop(destination);
        let reopened = open(&temp, "dest");
        assert_eq!(
            reopened.get(&2).expect("get must succeed").as_deref(),
            Some(&"c".to_string())
        );
    }

    /// Bucket files that don't belong to the merged layout go away;
    /// foreign files stay.
    #[test]
    fn test_stale_buckets_deleted() {
        let temp = TestDir::temp()
            .create("dest", FileType::Dir)
            .create("dest/99.block.ser.gz", FileType::ZeroFile(0))
            .create("dest/notes.txt", FileType::ZeroFile(3));
        let destination = open(&temp, "dest");
        let source = open(&temp, "source");

        source.put(5, "five".into()).expect("put must succeed");
        merge(&destination, &[&source]).expect("merge must succeed");

        assert!(!temp.path("dest/99.block.ser.gz").exists());
        assert!(temp.path("dest/notes.txt").exists());
        assert_eq!(
            destination.store().list().expect("list must succeed"),
            vec![destination.bucket_of(&5)]
        );
        assert_eq!(
            destination.get(&5).expect("get must succeed").as_deref(),
            Some(&"five".to_string())
        );
    }

    /// Merging nothing into an empty cache is a no-op.
    #[test]
    fn test_empty() {
        let temp = TestDir::temp();
        let destination = open(&temp, "dest");

        merge(&destination, &[]).expect("merge must succeed");
        assert!(destination.is_empty().expect("is_empty must succeed"));
    }

    /// Entries from a constituent with another bucket layout land in
    /// the destination's buckets.
    #[test]
    fn test_rebucket() {
        let temp = TestDir::temp();
        let destination = open(&temp, "dest");
        let wide: Cache<u32, String> =
            Cache::with_max_buckets(temp.path("wide"), 0).expect("open must succeed");

        for i in 0..20 {
            wide.put(i, i.to_string()).expect("put must succeed");
        }

        merge(&destination, &[&wide]).expect("merge must succeed");
        assert!(destination.store().list().expect("list must succeed").len() <= 8);
        for i in 0..20 {
            assert_eq!(
                destination.get(&i).expect("get must succeed").as_deref(),
                Some(&i.to_string())
            );
        }
    }
}
