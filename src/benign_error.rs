/// Bucket files come and go under our feet: other threads and
/// processes delete corrupt buckets, merges replace them, and users
/// may wipe the directory.  These helpers classify the errors that
/// simply mean "that bucket isn't there (or isn't ours) right now."
use std::io::Error;
use std::io::ErrorKind;
use std::io::Result;
use std::path::Path;

/// Checks whether the error is for a missing file: NotFound, or stale
/// handle.  A stale (NFS) handle means the inode we're trying to read
/// isn't available on the server anymore; for a cache, that's just
/// another miss.
pub(crate) fn is_absent_file_error(error: &Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        true
    } else if let Some(errno) = error.raw_os_error() {
        errno == libc::ESTALE
    } else {
        false
    }
}

/// Checks whether a non-blocking `flock` failed because someone else
/// holds the lock, as opposed to a real failure.
pub(crate) fn is_lock_contention(error: &Error) -> bool {
    if error.kind() == ErrorKind::WouldBlock {
        true
    } else if let Some(errno) = error.raw_os_error() {
        errno == libc::EWOULDBLOCK || errno == libc::EAGAIN || errno == libc::EACCES
    } else {
        false
    }
}

/// Removes the file at `path`.  Returns whether we deleted anything;
/// a file that is already gone is not an error.
pub(crate) fn remove_if_present(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if is_absent_file_error(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

// Mostly trivial, but let's at least make sure we didn't mess up raw_os_error
// and confirm that libc agrees with what we know to be true on Linux.
#[test]
fn test_absent_file() {
    assert!(is_absent_file_error(&Error::new(
        ErrorKind::NotFound,
        "not found"
    )));
    assert!(!is_absent_file_error(&Error::new(
        ErrorKind::PermissionDenied,
        "bad"
    )));

    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ENOENT)));
    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ESTALE)));
    assert!(!is_absent_file_error(&Error::from_raw_os_error(libc::EIO)));

    #[cfg(target_os = "linux")]
    assert!(is_absent_file_error(&Error::from_raw_os_error(116))); // ESTALE
}

#[test]
fn test_lock_contention() {
    assert!(is_lock_contention(&Error::from_raw_os_error(
        libc::EWOULDBLOCK
    )));
    assert!(is_lock_contention(&Error::new(ErrorKind::WouldBlock, "busy")));
    assert!(!is_lock_contention(&Error::from_raw_os_error(libc::EBADF)));
    assert!(!is_lock_contention(&Error::new(ErrorKind::NotFound, "gone")));
}

/// Removing a file twice is fine; the second call reports that
/// nothing was deleted.
#[test]
fn test_remove_if_present() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp().create("0.block.ser.gz", FileType::ZeroFile(10));
    let path = temp.path("0.block.ser.gz");

    assert!(remove_if_present(&path).expect("remove should succeed"));
    assert!(!path.exists());
    assert!(!remove_if_present(&path).expect("absent file is fine"));
}
