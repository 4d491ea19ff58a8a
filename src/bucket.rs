//! Bucket files live directly under the cache directory, one per
//! shard, named `<shard>.block.ser.gz`.  Each holds the concatenated
//! [`record`](crate::record)s for every key that hashes to that shard.
//!
//! Reads, appends and rewrites all run under the bucket's in-process
//! monitor and its reference-counted advisory lock.  Filesystem
//! trouble on the read side is absorbed here: a missing, corrupt, or
//! unreadable bucket simply reads as empty.
use std::io::BufReader;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::benign_error::is_absent_file_error;
use crate::benign_error::remove_if_present;
use crate::error::Error;
use crate::error::Result;
use crate::file_lock::LockHandle;
use crate::file_lock::LockPolicy;
use crate::file_lock::LockRegistry;
use crate::file_lock::PathMonitor;
use crate::record;
use crate::record::DecodeError;
use crate::record::Tail;

/// Bucket file names end with this suffix.
pub(crate) const BUCKET_SUFFIX: &str = ".block.ser.gz";

/// Temporary files for atomic bucket publication start with this
/// prefix.
pub(crate) const TEMP_PREFIX: &str = ".spillmap-";

/// Returns the bucket index for a file name, if it names a bucket.
fn parse_bucket_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(BUCKET_SUFFIX)?;
    let bucket: u64 = stem.parse().ok()?;

    // Reject "+1", "007", and other aliases of a canonical name.
    if bucket.to_string() == stem {
        Some(bucket)
    } else {
        None
    }
}

/// Writers still write when they time out on the file lock; leave a
/// trace when that happens.
fn note_unlocked_write(lock: &LockHandle) {
    if !lock.is_exclusive() {
        tracing::debug!(path = %lock.path().display(), "writing bucket without its file lock");
    }
}

fn encode_all<K: Serialize, V: Serialize>(entries: &[(K, V)]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();

    for (key, value) in entries {
        bytes.extend(record::encode(key, value)?);
    }

    Ok(bytes)
}

#[derive(Clone, Debug)]
pub(crate) struct BucketStore {
    base_dir: PathBuf,
    // Zero means one bucket per distinct hash.
    max_buckets: u64,
    lock_policy: LockPolicy,

    // Number of upcoming `read_all` calls that fail with memory
    // pressure.
    #[cfg(test)]
    pressure_faults: Arc<std::sync::atomic::AtomicUsize>,
}

impl BucketStore {
    /// Opens the bucket store rooted at `path`, creating the directory
    /// if needed.  Fails with `DirectoryUnavailable` if the directory
    /// can't be created or listed.
    pub fn open(path: &Path, max_buckets: u64, lock_policy: LockPolicy) -> Result<BucketStore> {
        std::fs::create_dir_all(path).map_err(|e| Error::directory_unavailable(path, e))?;
        let base_dir =
            std::fs::canonicalize(path).map_err(|e| Error::directory_unavailable(path, e))?;

        let metadata =
            std::fs::metadata(&base_dir).map_err(|e| Error::directory_unavailable(path, e))?;
        if !metadata.is_dir() {
            return Err(Error::directory_unavailable(
                path,
                std::io::Error::new(std::io::ErrorKind::Other, "not a directory"),
            ));
        }

        std::fs::read_dir(&base_dir).map_err(|e| Error::directory_unavailable(path, e))?;

        Ok(BucketStore {
            base_dir,
            max_buckets,
            lock_policy,
            #[cfg(test)]
            pressure_faults: Default::default(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn max_buckets(&self) -> u64 {
        self.max_buckets
    }

    pub fn bucket_for(&self, hash: u64) -> u64 {
        if self.max_buckets > 0 {
            hash % self.max_buckets
        } else {
            hash
        }
    }

    pub fn path_for(&self, bucket: u64) -> PathBuf {
        self.base_dir.join(format!("{}{}", bucket, BUCKET_SUFFIX))
    }

    /// Returns the process-wide monitor for `bucket`.  Hold its
    /// `synchronize()` guard to order compound operations on the
    /// bucket against every other thread in this process.
    pub fn monitor(&self, bucket: u64) -> Result<Arc<PathMonitor>> {
        Ok(LockRegistry::global().intern(&self.path_for(bucket))?)
    }

    /// Checks whether the bucket file exists, without any locking.
    pub fn exists(&self, bucket: u64) -> bool {
        self.path_for(bucket).is_file()
    }

    /// Lists the bucket indices with a regular file in the directory,
    /// in ascending order.
    pub fn list(&self) -> Result<Vec<u64>> {
        let mut buckets = Vec::new();

        for dirent in std::fs::read_dir(&self.base_dir)? {
            let dirent = match dirent {
                Ok(dirent) => dirent,
                Err(e) if is_absent_file_error(&e) => continue,
                Err(e) => return Err(e.into()),
            };

            let bucket = match dirent.file_name().to_str().and_then(parse_bucket_name) {
                Some(bucket) => bucket,
                None => continue,
            };

            match dirent.file_type() {
                Ok(file_type) if file_type.is_file() => buckets.push(bucket),
                Ok(_) => {}
                Err(e) if is_absent_file_error(&e) => {}
                Err(e) => {
                    tracing::warn!(path = %dirent.path().display(), error = %e,
                                   "failed to stat bucket; skipping");
                }
            }
        }

        buckets.sort_unstable();
        Ok(buckets)
    }

    /// Deletes the bucket file.  Returns whether there was a file to
    /// delete.
    pub fn delete(&self, bucket: u64) -> Result<bool> {
        let monitor = self.monitor(bucket)?;
        let _guard = monitor.synchronize();

        Ok(remove_if_present(monitor.path())?)
    }

    /// Reads every entry in the bucket, in file order.  Duplicate keys
    /// may appear, and the later one is the current value.
    pub fn read_all<K, V>(&self, bucket: u64) -> Result<Vec<(K, V)>>
    where
        K: DeserializeOwned,
        V: DeserializeOwned,
    {
        #[cfg(test)]
        self.inject_pressure(bucket)?;

        let monitor = self.monitor(bucket)?;
        let _guard = monitor.synchronize();

        // Acquiring the lock would create the file.
        if !monitor.path().exists() {
            return Ok(Vec::new());
        }

        let lock = match monitor.acquire(&self.lock_policy) {
            Ok(lock) => lock,
            Err(e) => {
                tracing::error!(path = %monitor.path().display(), error = %e,
                                "failed to lock bucket; treating as empty");
                return Ok(Vec::new());
            }
        };

        let ret = match self.read_locked(monitor.path()) {
            Err(Error::Io(e)) => {
                tracing::error!(path = %monitor.path().display(), error = %e,
                                "failed to read bucket; treating as empty");
                Ok(Vec::new())
            }
            ret => ret,
        };

        if let Err(e) = lock.release() {
            tracing::warn!(path = %monitor.path().display(), error = %e,
                           "failed to release bucket lock");
        }

        ret
    }

    /// Decodes the bucket file at `path`; the caller must hold its lock.
    ///
    /// A missing bucket, or one that is corrupt or truncated, yields
    /// whatever entries can be salvaged.  Any other I/O failure is an
    /// `Error::Io`, so that writers don't mistake an unreadable bucket
    /// for an empty one.
    fn read_locked<K, V>(&self, path: &Path) -> Result<Vec<(K, V)>>
    where
        K: DeserializeOwned,
        V: DeserializeOwned,
    {
        let file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if is_absent_file_error(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let (entries, err) = record::decode_all(BufReader::new(file));
        match err {
            None => Ok(entries),
            Some(DecodeError::Truncated { read, expected }) => {
                if entries.is_empty() {
                    tracing::warn!(path = %path.display(), read, expected,
                                   "bucket holds only a truncated record; deleting");
                    self.delete_bucket_file(path);
                } else {
                    tracing::warn!(path = %path.display(), read, expected,
                                   recovered = entries.len(),
                                   "bucket is truncated; keeping the complete records");
                }

                Ok(entries)
            }
            Some(DecodeError::Corrupt(reason)) => {
                tracing::warn!(path = %path.display(), %reason,
                               "bucket is corrupt; deleting");
                self.delete_bucket_file(path);
                Ok(Vec::new())
            }
            Some(DecodeError::MemoryPressure(size)) => {
                tracing::warn!(path = %path.display(), size, "out of memory reading bucket");
                Err(Error::MemoryPressure {
                    path: path.to_owned(),
                })
            }
            Some(DecodeError::Io(e)) if is_absent_file_error(&e) => Ok(Vec::new()),
            Some(DecodeError::Io(e)) => Err(e.into()),
        }
    }

    #[cfg(test)]
    pub fn fail_next_reads(&self, count: usize) {
        self.pressure_faults
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn inject_pressure(&self, bucket: u64) -> Result<()> {
        use std::sync::atomic::Ordering;

        let fault = self
            .pressure_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| count.checked_sub(1))
            .is_ok();
        if fault {
            Err(Error::MemoryPressure {
                path: self.path_for(bucket),
            })
        } else {
            Ok(())
        }
    }

    fn delete_bucket_file(&self, path: &Path) {
        if let Err(e) = remove_if_present(path) {
            tracing::error!(path = %path.display(), error = %e,
                            "failed to delete unusable bucket");
        }
    }

    /// Appends one record to the bucket, creating the file if needed.
    /// Only use this for keys that are not in the bucket yet.
    ///
    /// When we hold the file lock, a torn record at the end of the file
    /// was left by a dead writer: we cut it off first, so the new
    /// record lands on a frame boundary.
    pub fn append<K, V>(&self, bucket: u64, key: &K, value: &V) -> Result<()>
    where
        K: Serialize,
        V: Serialize,
    {
        let bytes = record::encode(key, value)?;
        let monitor = self.monitor(bucket)?;
        let _guard = monitor.synchronize();
        let lock = monitor.acquire(&self.lock_policy)?;
        note_unlocked_write(&lock);

        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(monitor.path())?;

        // Without the lock, a torn tail may be a live writer's.
        if lock.is_exclusive() {
            match record::scan_tail(&mut file)? {
                Tail::Clean => {}
                Tail::Torn { boundary } => {
                    tracing::warn!(path = %monitor.path().display(), boundary,
                                   "dropping torn record before appending");
                    file.set_len(boundary)?;
                }
                Tail::Corrupt { boundary } => {
                    tracing::warn!(path = %monitor.path().display(), boundary,
                                   "bucket is corrupt; starting it over");
                    file.set_len(0)?;
                }
            }
        }

        file.write_all(&bytes)?;
        file.flush()?;

        lock.release()?;
        Ok(())
    }

    /// Reads the bucket, lets `edit` update its entries, and writes
    /// them back, all under one lock acquisition.  Returns the result
    /// of `edit`.
    ///
    /// Everything is encoded before the file is truncated, so an
    /// encoding failure leaves the bucket as it was.
    pub fn rewrite<K, V, R>(&self, bucket: u64, edit: impl FnOnce(&mut Vec<(K, V)>) -> R) -> Result<R>
    where
        K: Serialize + DeserializeOwned,
        V: Serialize + DeserializeOwned,
    {
        let monitor = self.monitor(bucket)?;
        let _guard = monitor.synchronize();
        let lock = monitor.acquire(&self.lock_policy)?;
        note_unlocked_write(&lock);

        let mut entries = self.read_locked(monitor.path())?;
        let ret = edit(&mut entries);
        let bytes = encode_all(&entries)?;

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(monitor.path())?;
        file.write_all(&bytes)?;
        file.flush()?;

        lock.release()?;
        Ok(ret)
    }

    /// Replaces the bucket with exactly `entries`.  The new contents
    /// are written to a temporary file and renamed over the bucket, so
    /// readers see either the old or the new bucket, never a mix.
    pub fn write_fresh<K, V>(&self, bucket: u64, entries: &[(K, V)]) -> Result<()>
    where
        K: Serialize,
        V: Serialize,
    {
        let bytes = encode_all(entries)?;
        let monitor = self.monitor(bucket)?;
        let _guard = monitor.synchronize();
        let lock = monitor.acquire(&self.lock_policy)?;
        note_unlocked_write(&lock);

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.base_dir)?;
        temp.write_all(&bytes)?;
        temp.flush()?;
        temp.persist(monitor.path()).map_err(|e| e.error)?;

        lock.release()?;
        Ok(())
    }
}
