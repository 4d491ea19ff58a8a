//! Process-wide registry of bucket locks.
//!
//! Every bucket path is canonicalised and interned into a single
//! [`PathMonitor`], so that all the threads in this process that
//! touch the "same" file (however they spelled its path) serialise on
//! the same re-entrant monitor.  The monitor also owns a
//! reference-counted advisory `flock` on the file, for cooperation
//! with other processes: nested holders in the same thread share the
//! one OS lock, which is only released when the last holder lets go.
//!
//! Cross-process exclusion is best effort.  When the OS lock stays
//! busy for longer than the [`LockPolicy`] allows, we log a warning
//! and carry on without it: a cache that hangs is worse than a cache
//! that occasionally loses an update.
use std::collections::HashMap;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Result;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::Weak;
use std::time::Duration;
use std::time::Instant;

use parking_lot::Mutex;
use parking_lot::ReentrantMutex;
use parking_lot::ReentrantMutexGuard;

use crate::benign_error::is_absent_file_error;
use crate::benign_error::is_lock_contention;

/// Drop dead weak entries from the table whenever it grows past this
/// many entries (and then past twice the live count).
const MIN_PRUNE_THRESHOLD: usize = 64;

/// Retry intervals are capped at an hour.
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(3600);

/// How hard we try to get the OS-level lock on a bucket before giving
/// up and proceeding without it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockPolicy {
    attempts: u32,
    interval: Duration,
}

impl Default for LockPolicy {
    /// Three minutes of one-second retries.
    fn default() -> LockPolicy {
        LockPolicy {
            attempts: 180,
            interval: Duration::from_secs(1),
        }
    }
}

impl LockPolicy {
    /// Returns a policy that tries to lock up to `attempts` times
    /// (at least once), sleeping roughly `interval` (at most an hour)
    /// in between.
    pub fn new(attempts: u32, interval: Duration) -> LockPolicy {
        LockPolicy {
            attempts: attempts.max(1),
            interval: interval.min(MAX_RETRY_INTERVAL),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleeps between 75% and 125% of the interval, so that processes
    /// that collided once don't keep retrying in lockstep.
    fn jittered_interval(&self) -> Duration {
        use rand::Rng;

        self.interval
            .mul_f64(rand::thread_rng().gen_range(0.75..1.25))
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock(file: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if ret == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> Result<()> {
    Err(Error::new(
        ErrorKind::Unsupported,
        "advisory file locks are not supported on this platform",
    ))
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> Result<()> {
    Ok(())
}

/// Tries to `flock` `file` according to `policy`.  Returns whether we
/// hold the OS lock; `false` means we gave up and must proceed
/// without it.
fn lock_with_retries(file: &File, path: &Path, policy: &LockPolicy) -> Result<bool> {
    let start = Instant::now();
    let mut minutes_warned = 0;

    for attempt in 0..policy.attempts {
        match try_lock_exclusive(file) {
            Ok(()) => return Ok(true),
            Err(e) if is_lock_contention(&e) => {}
            // NFS without a lock manager, exotic filesystems, etc.
            Err(e) if e.kind() == ErrorKind::Unsupported || e.raw_os_error() == Some(libc::ENOLCK) => {
                tracing::warn!(path = %path.display(), error = %e,
                               "advisory locks unavailable; continuing without lock");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        if attempt + 1 < policy.attempts {
            std::thread::sleep(policy.jittered_interval());
        }

        let minutes = start.elapsed().as_secs() / 60;
        if minutes > minutes_warned {
            minutes_warned = minutes;
            tracing::warn!(path = %path.display(), minutes, "file lock still busy");
        }
    }

    tracing::warn!(path = %path.display(), attempts = policy.attempts,
                   "could not acquire file lock; continuing without lock");
    Ok(false)
}

/// Returns the canonical version of `path`.  Bucket files may not
/// exist yet, in which case we canonicalise the parent directory and
/// tack the file name back on.
fn canonical_path(path: &Path) -> Result<PathBuf> {
    match std::fs::canonicalize(path) {
        Ok(canonical) => Ok(canonical),
        Err(e) if is_absent_file_error(&e) => {
            let name = path.file_name().ok_or_else(|| {
                Error::new(
                    ErrorKind::InvalidInput,
                    format!("{} does not name a file", path.display()),
                )
            })?;
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };

            let mut canonical = std::fs::canonicalize(parent)?;
            canonical.push(name);
            Ok(canonical)
        }
        Err(e) => Err(e),
    }
}

/// State behind the reference-counted OS lock.
#[derive(Debug, Default)]
struct Holders {
    file: Option<File>,
    // Whether `file` actually holds the flock, or we timed out.
    exclusive: bool,
}

/// The unique in-process representative of one canonical path.
#[derive(Debug)]
pub(crate) struct PathMonitor {
    path: PathBuf,
    monitor: ReentrantMutex<()>,
    holders: Mutex<Holders>,
    // Only written with `holders` locked; readable without it.
    count: AtomicUsize,
}

impl PathMonitor {
    fn new(path: PathBuf) -> PathMonitor {
        PathMonitor {
            path,
            monitor: ReentrantMutex::new(()),
            holders: Mutex::new(Holders::default()),
            count: AtomicUsize::new(0),
        }
    }

    /// Returns the canonical path for this monitor.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Enters the in-process monitor for this path.  The monitor is
    /// re-entrant, so compound operations may hold it while calling
    /// simpler ones that enter it again.
    pub fn synchronize(&self) -> ReentrantMutexGuard<'_, ()> {
        self.monitor.lock()
    }

    /// Returns the number of live [`LockHandle`]s.
    pub fn holders(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.holders() > 0
    }

    /// Takes a share of the OS lock on this path, acquiring the lock
    /// if nobody holds it yet.  Creates the file if it is missing.
    pub fn acquire(self: &Arc<Self>, policy: &LockPolicy) -> Result<LockHandle> {
        let mut holders = self.holders.lock();
        let count = self.count.load(Ordering::Acquire);

        if count == 0 {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&self.path)?;
            holders.exclusive = lock_with_retries(&file, &self.path, policy)?;
            holders.file = Some(file);
        }

        self.count.store(count + 1, Ordering::Release);
        Ok(LockHandle {
            monitor: self.clone(),
            released: false,
        })
    }

    fn release_one(&self) -> Result<()> {
        let mut holders = self.holders.lock();
        let count = self.count.load(Ordering::Acquire);

        debug_assert!(count > 0, "released an inactive file lock");
        if count == 0 {
            return Ok(());
        }

        self.count.store(count - 1, Ordering::Release);
        if count > 1 {
            return Ok(());
        }

        let exclusive = std::mem::take(&mut holders.exclusive);
        match holders.file.take() {
            // Closing the file would drop the flock too, but let's be
            // explicit about it.
            Some(file) if exclusive => unlock(&file),
            _ => Ok(()),
        }
    }
}

/// One share of the OS-level lock on a path.  Call
/// [`LockHandle::release`] when done; dropping the handle releases it
/// as well, but swallows errors.
#[derive(Debug)]
pub(crate) struct LockHandle {
    monitor: Arc<PathMonitor>,
    released: bool,
}

impl LockHandle {
    pub fn path(&self) -> &Path {
        self.monitor.path()
    }

    /// Returns whether the OS lock is actually held, i.e., we did not
    /// time out and proceed without it.
    pub fn is_exclusive(&self) -> bool {
        self.monitor.holders.lock().exclusive
    }

    /// Takes another share of the same lock.
    #[cfg(test)]
    pub fn take(&self) -> LockHandle {
        let _holders = self.monitor.holders.lock();

        self.monitor.count.fetch_add(1, Ordering::AcqRel);
        LockHandle {
            monitor: self.monitor.clone(),
            released: false,
        }
    }

    /// Gives up this share of the lock; the last share to go releases
    /// the OS lock and closes the file.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.monitor.release_one()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = self.monitor.release_one() {
                tracing::warn!(path = %self.monitor.path.display(), error = %e,
                               "failed to release file lock");
            }
        }
    }
}

#[derive(Debug, Default)]
struct Table {
    monitors: HashMap<PathBuf, Weak<PathMonitor>>,
    prune_at: usize,
}

/// The registry maps canonical paths to their (weakly held) monitors.
#[derive(Debug, Default)]
pub(crate) struct LockRegistry {
    table: Mutex<Table>,
}

impl LockRegistry {
    pub fn new() -> LockRegistry {
        LockRegistry::default()
    }

    /// Returns the registry shared by every cache in this process.
    pub fn global() -> &'static LockRegistry {
        static GLOBAL: OnceLock<LockRegistry> = OnceLock::new();

        GLOBAL.get_or_init(LockRegistry::new)
    }

    /// Returns the unique live monitor for `path`'s canonical form.
    pub fn intern(&self, path: &Path) -> Result<Arc<PathMonitor>> {
        let canonical = canonical_path(path)?;
        let mut table = self.table.lock();

        if let Some(monitor) = table.monitors.get(&canonical).and_then(Weak::upgrade) {
            return Ok(monitor);
        }

        if table.monitors.len() >= table.prune_at.max(MIN_PRUNE_THRESHOLD) {
            table.monitors.retain(|_, monitor| monitor.strong_count() > 0);
            table.prune_at = 2 * table.monitors.len();
        }

        let monitor = Arc::new(PathMonitor::new(canonical.clone()));
        table.monitors.insert(canonical, Arc::downgrade(&monitor));
        Ok(monitor)
    }

    /// Interns `path` and takes a share of its OS lock.
    #[cfg(test)]
    pub fn acquire(&self, path: &Path, policy: &LockPolicy) -> Result<LockHandle> {
        self.intern(path)?.acquire(policy)
    }

    /// Returns the sorted list of canonical paths on which this
    /// registry currently holds a lock.
    pub fn locks_held(&self) -> Vec<PathBuf> {
        let table = self.table.lock();
        let mut held: Vec<PathBuf> = table
            .monitors
            .values()
            .filter_map(Weak::upgrade)
            .filter(|monitor| monitor.is_active())
            .map(|monitor| monitor.path.clone())
            .collect();

        held.sort();
        held
    }
}
