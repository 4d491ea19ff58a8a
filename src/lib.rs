//! Spillmap implements persistent key/value caches stored in
//! filesystem directories, with a bounded in-memory layer in front.
//! Entries are spread over a fixed (or unbounded) number of bucket
//! files by a stable hash of their key; each bucket file is a plain
//! concatenation of compressed, self-framed records, so new keys are
//! appended without rewriting anything, and a file that was cut
//! short by a crash still yields every complete record.
//!
//! A [`Cache`] is meant to sit in front of expensive computations
//! whose results should survive across runs, and that many threads
//! (or processes) may want at the same time.  It is **not** a
//! database: there is no write-ahead log, no multi-key atomicity, and
//! writers from different processes may lose each other's updates
//! when they race on the same bucket.[^best-effort-locks]  On the
//! other hand, a cache never refuses to work because its directory
//! is in a weird state: corrupt buckets are deleted, truncated ones
//! are salvaged, and missing ones are just misses.
//!
//! [^best-effort-locks]: Buckets are guarded by advisory `flock`s,
//! but a process that can't get a lock after the [`LockPolicy`]'s
//! retries logs a warning and carries on without it.  A cache that
//! hangs forever on a stuck NFS lock is worse than one that
//! occasionally drops an update.
//!
//! # Memory
//!
//! Values live in memory as shared, immutable `Arc<V>`s in a "soft
//! index."  The index targets a capacity (in entries), and a
//! background reaper thread brings it back under that capacity with
//! a batched [Second Chance](https://en.wikipedia.org/wiki/Page_replacement_algorithm#Second-chance)
//! policy: entries that were read since the last pass survive one
//! more round.  The bucket files are authoritative, so an entry the
//! reaper dropped simply reloads on the next lookup.  Between reaper
//! passes the index may temporarily exceed its capacity, although
//! inserting past twice the capacity always wakes the reaper up.
//!
//! Full scans ([`Cache::iter`], [`Cache::entries`], etc.) read one
//! bucket at a time.  When a scan fails to allocate memory for a
//! bucket, it drops the whole soft index, pauses, and tries that
//! bucket once more before reporting [`Error::MemoryPressure`].
//!
//! # Concurrency
//!
//! Every bucket path maps to one process-wide re-entrant monitor, and
//! all operations on a key run under its bucket's monitor: within a
//! process, a `get` never observes half a `put`, and concurrent
//! writers to disjoint keys never lose updates, even when the keys
//! share a bucket.  The same monitors are shared by every [`Cache`]
//! in the process, including independent caches that happen to open
//! the same directory.
//!
//! # Sample usage
//!
//! ```no_run
//! # fn main() -> spillmap::Result<()> {
//! use spillmap::Cache;
//!
//! let cache: Cache<String, Vec<u32>> = Cache::with_max_buckets("/tmp/parses", 1024)?;
//!
//! let key = "the quick brown fox".to_string();
//! let parse = match cache.get(&key)? {
//!     Some(parse) => parse,
//!     None => {
//!         cache.put(key.clone(), vec![1, 2, 3])?;
//!         cache.get(&key)?.expect("just stored")
//!     }
//! };
//! assert_eq!(parse.len(), 3);
//!
//! // Combine caches computed by separate jobs.
//! let other: Cache<String, Vec<u32>> = Cache::with_max_buckets("/tmp/parses-2", 1024)?;
//! spillmap::merge(&cache, &[&other])?;
//! # Ok(())
//! # }
//! ```
//!
//! # Cache directory structure
//!
//! A cache directory holds one file per non-empty bucket, named
//! `<bucket>.block.ser.gz`, where `<bucket>` is the decimal bucket
//! index.  Merges write temporary files that start with `.spillmap-`
//! before renaming them over buckets.  Scans ignore every other file,
//! so it is safe to keep unrelated data in a cache directory, and it
//! is always safe to delete bucket files: their entries are simply
//! gone.
//!
//! The [`record`] module documents the record format.
mod benign_error;
mod bucket;
mod cache;
mod error;
mod file_lock;
mod iter;
mod merge;
mod reaper;
pub mod record;
mod second_chance;
mod soft_index;
mod trigger;

use std::path::PathBuf;

pub use cache::stable_hash;
pub use cache::Cache;
pub use cache::CacheBuilder;
pub use cache::CacheKey;
pub use cache::CacheValue;
pub use cache::DEFAULT_MEMORY_CAPACITY;
pub use cache::DEFAULT_PRESSURE_PAUSE;
pub use cache::DEFAULT_REAP_INTERVAL;
pub use error::Error;
pub use error::Result;
pub use file_lock::LockPolicy;
pub use iter::Iter;
pub use merge::merge;

/// Returns the sorted canonical paths of every bucket file on which
/// this process currently holds a lock.
pub fn locks_held() -> Vec<PathBuf> {
    file_lock::LockRegistry::global().locks_held()
}
