//! Full scans walk the bucket files one at a time, so a scan never
//! needs more than one bucket's worth of entries in flight (on top of
//! what it loads in the soft index).
use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::Cache;
use crate::cache::CacheKey;
use crate::cache::CacheValue;
use crate::error::Error;
use crate::error::Result;

/// Lazily yields every `(key, value)` on disk, one bucket at a time.
///
/// The bucket list is snapshotted when the iterator is created;
/// buckets created later are not visited, and buckets deleted in the
/// meantime read as empty.
pub struct Iter<'a, K, V> {
    cache: &'a Cache<K, V>,
    buckets: std::vec::IntoIter<u64>,
    current: std::vec::IntoIter<(K, Arc<V>)>,
    // Reported on the next call, after which we stop.
    pending: Option<Error>,
    done: bool,
}

/// Keeps the last entry for each key, in file order.
fn latest_per_key<K: CacheKey, V>(entries: Vec<(K, Arc<V>)>) -> Vec<(K, Arc<V>)> {
    let mut seen = HashSet::new();
    let mut latest: Vec<(K, Arc<V>)> = entries
        .into_iter()
        .rev()
        .filter(|(key, _)| seen.insert(key.clone()))
        .collect();

    latest.reverse();
    latest
}

impl<'a, K: CacheKey, V: CacheValue> Iter<'a, K, V> {
    pub(crate) fn new(cache: &'a Cache<K, V>) -> Self {
        let (buckets, pending) = match cache.store().list() {
            Ok(buckets) => (buckets, None),
            Err(e) => (Vec::new(), Some(e)),
        };

        Iter {
            cache,
            buckets: buckets.into_iter(),
            current: Vec::new().into_iter(),
            pending,
            done: false,
        }
    }
}

impl<'a, K: CacheKey, V: CacheValue> Iterator for Iter<'a, K, V> {
    type Item = Result<(K, Arc<V>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done {
                return None;
            }

            if let Some(e) = self.pending.take() {
                self.done = true;
                return Some(Err(e));
            }

            if let Some(entry) = self.current.next() {
                return Some(Ok(entry));
            }

            let bucket = match self.buckets.next() {
                Some(bucket) => bucket,
                None => {
                    self.done = true;
                    return None;
                }
            };

            match self.cache.load_bucket_for_scan(bucket) {
                Ok(entries) => self.current = latest_per_key(entries).into_iter(),
                Err(e) => self.pending = Some(e),
            }
        }
    }
}
