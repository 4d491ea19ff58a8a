//! The [`Cache`] facade: a map-like API over a directory of bucket
//! files, fronted by the soft index.
//!
//! Every operation that reads or writes a key's entries first enters
//! the process-wide monitor for that key's bucket, so that, within a
//! process, operations on one bucket happen in a total order and the
//! soft index never disagrees with the bucket file (except for
//! entries the reaper dropped, which reload from disk on demand).
use std::collections::HashMap;
use std::collections::HashSet;
use std::hash::Hash;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use derivative::Derivative;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::bucket::BucketStore;
use crate::error::Result;
use crate::file_lock::LockPolicy;
use crate::iter::Iter;
use crate::reaper::Reaper;
use crate::soft_index::SoftIndex;

/// By default, keep up to this many entries in memory.
pub const DEFAULT_MEMORY_CAPACITY: usize = 100_000;

/// By default, the reaper wakes up this often.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_millis(100);

/// By default, wait this long after running out of memory in a scan
/// before retrying.
pub const DEFAULT_PRESSURE_PAUSE: Duration = Duration::from_secs(1);

/// The reaper never wakes up more often than this.
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(1);

/// Cache keys are hashed through their serialised form, so their
/// serde representation must be deterministic: the same key must
/// serialise to the same bytes in every process, every run.  Plain
/// data (integers, strings, tuples, vectors, derived structs) is
/// fine; `HashMap`s and other types with unspecified iteration order
/// are not.
pub trait CacheKey: Serialize + DeserializeOwned + Eq + Hash + Clone + Send + Sync + 'static {
    /// Returns a hash of the key that is stable across processes.
    fn stable_hash(&self) -> u64 {
        stable_hash(self)
    }
}

impl<T> CacheKey for T where
    T: Serialize + DeserializeOwned + Eq + Hash + Clone + Send + Sync + 'static
{
}

/// Cached values are shared as immutable `Arc`s.  Equality lets
/// `put` skip rewriting a bucket with the value it already holds.
pub trait CacheValue: Serialize + DeserializeOwned + PartialEq + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + PartialEq + Send + Sync + 'static {}

/// Hashes the bincode serialisation of `key` with SHA-256, and
/// returns the first 8 bytes as a little-endian integer.
pub fn stable_hash<K: Serialize + ?Sized>(key: &K) -> u64 {
    use extendhash::sha256;

    // Serialising plain data to a Vec can't fail; if a key type
    // manages to, all such keys share a bucket.
    let bytes = bincode::serialize(key).unwrap_or_default();
    let hash = sha256::compute_hash(&bytes);

    u64::from_le_bytes([
        hash[0], hash[1], hash[2], hash[3], hash[4], hash[5], hash[6], hash[7],
    ])
}

/// Replaces the value for the first entry with `key`, and drops any
/// later duplicate.  Appends a fresh entry if there's none.  Returns
/// the value that was current for `key`, i.e., its last occurrence.
fn replace_first<K: Eq + Clone, V>(entries: &mut Vec<(K, V)>, key: &K, value: V) -> Option<V> {
    let first = match entries.iter().position(|(k, _)| k == key) {
        Some(first) => first,
        None => {
            entries.push((key.clone(), value));
            return None;
        }
    };

    let mut previous = Some(std::mem::replace(&mut entries[first].1, value));
    let mut kept = Vec::with_capacity(entries.len());
    for (idx, (k, v)) in entries.drain(..).enumerate() {
        if idx > first && &k == key {
            previous = Some(v);
        } else {
            kept.push((k, v));
        }
    }

    *entries = kept;
    previous
}

/// Configures and opens a [`Cache`].
///
/// ```no_run
/// # fn main() -> spillmap::Result<()> {
/// let cache = spillmap::CacheBuilder::new("/tmp/spillmap")
///     .max_buckets(1024)
///     .memory_capacity(10_000)
///     .open::<String, Vec<u8>>()?;
///
/// cache.put("key".to_string(), b"value".to_vec())?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct CacheBuilder {
    path: PathBuf,
    max_buckets: u64,
    memory_capacity: usize,
    reap_interval: Duration,
    pressure_pause: Duration,
    lock_policy: LockPolicy,
}

impl CacheBuilder {
    /// Returns a builder for a cache in directory `path`, with an
    /// unbounded number of buckets and the default tuning.
    pub fn new(path: impl AsRef<Path>) -> Self {
        CacheBuilder {
            path: path.as_ref().to_owned(),
            max_buckets: 0,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            reap_interval: DEFAULT_REAP_INTERVAL,
            pressure_pause: DEFAULT_PRESSURE_PAUSE,
            lock_policy: LockPolicy::default(),
        }
    }

    /// Spreads keys over at most `max_buckets` bucket files.  Zero
    /// means one bucket per distinct key hash.
    ///
    /// Changing this for an existing directory strands the entries
    /// stored under the old layout (they remain visible to scans, but
    /// not to lookups).
    pub fn max_buckets(mut self, max_buckets: u64) -> Self {
        self.max_buckets = max_buckets;
        self
    }

    /// Sets the number of entries the soft index aims to keep in
    /// memory.  The index may temporarily grow past that.
    pub fn memory_capacity(mut self, capacity: usize) -> Self {
        self.memory_capacity = capacity;
        self
    }

    /// Sets how often the reaper trims the soft index when nothing
    /// nudges it.  Intervals under a millisecond round up.
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval.max(MIN_REAP_INTERVAL);
        self
    }

    /// Sets how long scans wait after running out of memory before
    /// retrying.
    pub fn pressure_pause(mut self, pause: Duration) -> Self {
        self.pressure_pause = pause;
        self
    }

    pub fn lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    /// Sets how many times we try to take a bucket's file lock before
    /// proceeding without it.
    pub fn lock_attempts(mut self, attempts: u32) -> Self {
        self.lock_policy = LockPolicy::new(attempts, self.lock_policy.interval());
        self
    }

    pub fn lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_policy = LockPolicy::new(self.lock_policy.attempts(), interval);
        self
    }

    /// Opens the cache, creating its directory if necessary.  Entries
    /// already in the directory are picked up lazily.
    pub fn open<K: CacheKey, V: CacheValue>(&self) -> Result<Cache<K, V>> {
        let store = BucketStore::open(&self.path, self.max_buckets, self.lock_policy)?;
        let index: Arc<SoftIndex<K, V>> = Arc::new(SoftIndex::new(self.memory_capacity));

        let reaper = {
            let weak = Arc::downgrade(&index);
            Reaper::spawn("spillmap-reaper".into(), self.reap_interval, move || {
                let index = match weak.upgrade() {
                    Some(index) => index,
                    None => return false,
                };

                let reclaimed = index.reclaim();
                if reclaimed > 0 {
                    tracing::debug!(reclaimed, remaining = index.len(),
                                    "reclaimed soft index entries");
                }

                true
            })?
        };

        tracing::debug!(path = %store.base_dir().display(),
                        max_buckets = self.max_buckets,
                        memory_capacity = self.memory_capacity,
                        "opened cache");
        Ok(Cache {
            inner: Arc::new(Inner {
                store,
                index,
                reaper: Mutex::new(Some(reaper)),
                pressure_pause: self.pressure_pause,
            }),
        })
    }

    /// Opens the cache and stores every pair in `initial`.
    pub fn open_with<K: CacheKey, V: CacheValue>(
        &self,
        initial: impl IntoIterator<Item = (K, V)>,
    ) -> Result<Cache<K, V>> {
        let cache = self.open()?;

        cache.put_all(initial);
        Ok(cache)
    }
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
struct Inner<K, V> {
    store: BucketStore,

    #[derivative(Debug = "ignore")]
    index: Arc<SoftIndex<K, V>>,

    // `None` once closed.
    #[derivative(Debug = "ignore")]
    reaper: Mutex<Option<Reaper>>,

    pressure_pause: Duration,
}

/// A persistent map from `K` to `V`, sharded over bucket files in one
/// directory, with a bounded in-memory layer.
///
/// Clones share the same in-memory state and background reaper.
/// Independent `Cache`s on the same directory (in this process or
/// others) see each other's writes the next time they read the
/// affected bucket from disk.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Cache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Cache {
            inner: self.inner.clone(),
        }
    }
}

impl<K: CacheKey, V: CacheValue> Cache<K, V> {
    /// Opens a cache with an unbounded number of buckets in `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Cache<K, V>> {
        CacheBuilder::new(path).open()
    }

    /// Opens a cache in `path` with at most `max_buckets` bucket
    /// files (unbounded if zero).
    pub fn with_max_buckets(path: impl AsRef<Path>, max_buckets: u64) -> Result<Cache<K, V>> {
        CacheBuilder::new(path).max_buckets(max_buckets).open()
    }

    pub(crate) fn store(&self) -> &BucketStore {
        &self.inner.store
    }

    pub(crate) fn bucket_of(&self, key: &K) -> u64 {
        self.inner.store.bucket_for(key.stable_hash())
    }

    fn nudge_reaper(&self) {
        if let Some(reaper) = self.inner.reaper.lock().as_ref() {
            reaper.nudge();
        }
    }

    fn remember(&self, key: K, value: Arc<V>) {
        if self.inner.index.insert(key, value) {
            self.nudge_reaper();
        }
    }

    /// Reads `bucket` from disk and loads all its entries in the soft
    /// index.  Returns the bucket's entries, with duplicates.
    pub(crate) fn load_bucket(&self, bucket: u64) -> Result<Vec<(K, Arc<V>)>> {
        let monitor = self.inner.store.monitor(bucket)?;
        let _guard = monitor.synchronize();

        let entries: Vec<(K, Arc<V>)> = self.inner.store.read_all(bucket)?;
        let nudge = self.inner.index.populate(
            entries
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        if nudge {
            self.nudge_reaper();
        }

        Ok(entries)
    }

    /// Like [`Cache::load_bucket`], but recovers once from running
    /// out of memory by dropping the soft index.
    pub(crate) fn load_bucket_for_scan(&self, bucket: u64) -> Result<Vec<(K, Arc<V>)>> {
        match self.load_bucket(bucket) {
            Err(e) if e.is_memory_pressure() => {
                tracing::warn!(path = %self.inner.store.path_for(bucket).display(),
                               pause = ?self.inner.pressure_pause,
                               "out of memory while scanning; clearing soft index and retrying");
                self.inner.index.clear();
                std::thread::sleep(self.inner.pressure_pause);
                self.load_bucket(bucket)
            }
            ret => ret,
        }
    }

    /// Returns the value for `key`, from memory if possible, and
    /// otherwise from its bucket file.
    pub fn get(&self, key: &K) -> Result<Option<Arc<V>>> {
        if let Some(value) = self.inner.index.get(key) {
            return Ok(Some(value));
        }

        let bucket = self.bucket_of(key);
        if !self.inner.store.exists(bucket) {
            return Ok(None);
        }

        let monitor = self.inner.store.monitor(bucket)?;
        let _guard = monitor.synchronize();

        // Someone else may have loaded the bucket while we waited.
        if let Some(value) = self.inner.index.get(key) {
            return Ok(Some(value));
        }

        // Look in what we loaded rather than the index: the reaper may
        // already have dropped it again.
        let entries = self.load_bucket(bucket)?;
        Ok(entries
            .into_iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value))
    }

    /// Associates `value` with `key`, and returns the previous value,
    /// if any.
    ///
    /// Storing a value equal to the current one performs no I/O.
    /// A new key is appended to its bucket; a changed value rewrites
    /// the bucket.
    pub fn put(&self, key: K, value: V) -> Result<Option<Arc<V>>> {
        let bucket = self.bucket_of(&key);
        let monitor = self.inner.store.monitor(bucket)?;
        let _guard = monitor.synchronize();

        match self.get(&key)? {
            Some(current) if *current == value => Ok(Some(current)),
            Some(current) => {
                let value = Arc::new(value);
                self.inner
                    .store
                    .rewrite(bucket, |entries: &mut Vec<(K, Arc<V>)>| {
                        replace_first(entries, &key, value.clone())
                    })?;
                self.remember(key, value);
                Ok(Some(current))
            }
            None => {
                let value = Arc::new(value);
                self.inner.store.append(bucket, &key, &value)?;
                self.remember(key, value);
                Ok(None)
            }
        }
    }

    /// Puts every pair in `entries`.  Failures are logged and skipped.
    pub fn put_all(&self, entries: impl IntoIterator<Item = (K, V)>) {
        for (key, value) in entries {
            let bucket = self.bucket_of(&key);

            if let Err(e) = self.put(key, value) {
                tracing::warn!(path = %self.inner.store.path_for(bucket).display(),
                               error = %e, "failed to store entry; skipping");
            }
        }
    }

    /// Removes `key` from memory and from disk.  Returns the removed
    /// value, if any.
    pub fn remove(&self, key: &K) -> Result<Option<Arc<V>>> {
        let bucket = self.bucket_of(key);
        let monitor = self.inner.store.monitor(bucket)?;
        let _guard = monitor.synchronize();

        let cached = self.inner.index.remove(key);
        if !self.inner.store.exists(bucket) {
            return Ok(None);
        }

        let removed = self
            .inner
            .store
            .rewrite(bucket, |entries: &mut Vec<(K, Arc<V>)>| {
                let mut removed = None;

                entries.retain(|(k, v)| {
                    if k == key {
                        removed = Some(v.clone());
                        false
                    } else {
                        true
                    }
                });

                removed
            })?;

        Ok(removed.or(cached))
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        if self.inner.index.contains_key(key) {
            return Ok(true);
        }

        Ok(self.get(key)?.is_some())
    }

    /// Checks whether any key maps to `value`.  Scans the whole
    /// directory unless the value is in memory.
    pub fn contains_value(&self, value: &V) -> Result<bool> {
        if self.inner.index.contains_value(value) {
            return Ok(true);
        }

        for entry in self.iter() {
            let (_, candidate) = entry?;
            if *candidate == *value {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Returns the number of distinct keys on disk.  This scans the
    /// whole directory.
    pub fn size(&self) -> Result<usize> {
        Ok(self.keys()?.len())
    }

    /// Returns the number of entries currently in the soft index.
    pub fn size_in_memory(&self) -> usize {
        self.inner.index.len()
    }

    pub fn is_empty(&self) -> Result<bool> {
        match self.iter().next() {
            None => Ok(true),
            Some(Ok(_)) => Ok(false),
            Some(Err(e)) => Err(e),
        }
    }

    /// Drops every entry from memory.  The bucket files are untouched.
    pub fn clear(&self) {
        self.inner.index.clear();
    }

    /// Drops `key` from memory only.  Returns whether it was there.
    pub fn remove_from_memory(&self, key: &K) -> bool {
        self.inner.index.remove(key).is_some()
    }

    pub fn keys(&self) -> Result<HashSet<K>> {
        self.iter().map(|entry| entry.map(|(key, _)| key)).collect()
    }

    pub fn values(&self) -> Result<Vec<Arc<V>>> {
        Ok(self.entries()?.into_values().collect())
    }

    /// Returns a snapshot of every entry on disk.
    pub fn entries(&self) -> Result<HashMap<K, Arc<V>>> {
        self.iter().collect()
    }

    /// Returns an iterator over every entry on disk.  Buckets are read
    /// lazily, one at a time.
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter::new(self)
    }

    /// Returns the path of the bucket file that does or would hold
    /// `key`.
    pub fn bucket_path(&self, key: &K) -> PathBuf {
        self.inner.store.path_for(self.bucket_of(key))
    }

    /// Returns the canonical path of the cache directory.
    pub fn path(&self) -> &Path {
        self.inner.store.base_dir()
    }

    pub fn max_buckets(&self) -> u64 {
        self.inner.store.max_buckets()
    }

    /// Stops the background reaper and waits for it to exit.  Clones
    /// of this cache remain usable, but their soft index is no longer
    /// trimmed in the background.
    pub fn close(self) {
        let reaper = self.inner.reaper.lock().take();

        if let Some(mut reaper) = reaper {
            reaper.shutdown();
        }
    }
}

impl<'a, K: CacheKey, V: CacheValue> IntoIterator for &'a Cache<K, V> {
    type Item = Result<(K, Arc<V>)>;
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
