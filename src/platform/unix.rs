//! POSIX backend: `/dev/shm`-backed segments via `shm_open` + `mmap`, POSIX
//! named semaphores, and an advisory `flock` lock file.

use memmap2::MmapMut;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

fn last_err() -> io::Error {
    io::Error::last_os_error()
}

fn cname(name: &str) -> io::Result<CString> {
    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains a NUL byte"))
}

/// A shared-memory segment mapped read/write into this process.
pub struct Segment {
    mmap: MmapMut,
    data: *mut u8,
    len: usize,
    posix_name: String,
}

// SAFETY: the mapped memory is used exclusively through explicit atomics and
// raw-pointer arithmetic guarded by the channel protocol; `Segment` itself adds
// no additional aliasing beyond what the protocol already requires.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    fn from_fd(fd: RawFd, posix_name: String, len: usize) -> io::Result<Self> {
        // SAFETY: `fd` was just returned by shm_open/opened by us and is owned here.
        let file = unsafe { File::from_raw_fd(fd) };
        // SAFETY: `file` refers to a shared-memory object of at least `len` bytes,
        // sized by the caller before this mapping is created.
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        // `mmap()` does not need the descriptor kept open; `file` closes it here.
        drop(file);
        let data = mmap.as_mut_ptr();
        Ok(Self {
            mmap,
            data,
            len,
            posix_name,
        })
    }

    /// Create a brand-new segment, failing if one already exists under `name`.
    /// Zero-fills the segment (guaranteed by a freshly `ftruncate`d shm object).
    pub fn create_exclusive(name: &str, bytes: usize) -> io::Result<Self> {
        let posix_name = super::names::posix_segment_name(name);
        let c = cname(&posix_name)?;
        // SAFETY: FFI call with a valid NUL-terminated name; no pointers are
        // retained beyond the call.
        let fd = unsafe { libc::shm_open(c.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(last_err());
        }
        if unsafe { libc::ftruncate(fd, bytes as libc::off_t) } != 0 {
            let err = last_err();
            unsafe { libc::close(fd) };
            let _ = Self::unlink(name);
            return Err(err);
        }
        Self::from_fd(fd, posix_name, bytes)
    }

    /// Attach to an existing segment, mapping its full current size.
    pub fn attach(name: &str) -> io::Result<Self> {
        let posix_name = super::names::posix_segment_name(name);
        let c = cname(&posix_name)?;
        // SAFETY: FFI call with a valid NUL-terminated name.
        let fd = unsafe { libc::shm_open(c.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            return Err(last_err());
        }
        // SAFETY: `fd` is a valid, just-opened descriptor.
        let file = unsafe { File::from_raw_fd(fd) };
        let len = file.metadata()?.len() as usize;
        std::mem::forget(file);
        Self::from_fd(fd, posix_name, len)
    }

    /// Remove the name so no further `attach` can find this segment; existing
    /// mappings (including this process's own) remain valid until unmapped.
    pub fn unlink(name: &str) -> io::Result<()> {
        let posix_name = super::names::posix_segment_name(name);
        let c = cname(&posix_name)?;
        // SAFETY: FFI call with a valid NUL-terminated name.
        let rc = unsafe { libc::shm_unlink(c.as_ptr()) };
        if rc != 0 {
            let err = last_err();
            if err.kind() == io::ErrorKind::NotFound {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Base address of the mapped segment.
    pub fn as_ptr(&self) -> *mut u8 {
        self.data
    }

    /// Size in bytes of the mapping.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the mapping is empty (never the case for a real channel).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.posix_name)
            .field("len", &self.len)
            .finish()
    }
}

/// A POSIX named counting semaphore.
pub struct Semaphore {
    sem: *mut libc::sem_t,
    posix_name: String,
}

// SAFETY: POSIX named semaphores are designed for exactly this: concurrent
// sem_post/sem_wait from multiple threads/processes on the same `sem_t*`.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Create a new semaphore with `initial` permits, failing if one with this
    /// name already exists.
    pub fn create(name: &str, role: super::names::SemaphoreRole, initial: u32) -> io::Result<Self> {
        let posix_name = super::names::posix_semaphore_name(name, role);
        let c = cname(&posix_name)?;
        // SAFETY: FFI call with a valid NUL-terminated name; SEM_FAILED is
        // checked below before the pointer is used.
        let sem = unsafe {
            libc::sem_open(
                c.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600u32,
                initial,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(last_err());
        }
        Ok(Self { sem, posix_name })
    }

    /// Attach to an existing named semaphore.
    pub fn attach(name: &str, role: super::names::SemaphoreRole) -> io::Result<Self> {
        let posix_name = super::names::posix_semaphore_name(name, role);
        let c = cname(&posix_name)?;
        // SAFETY: FFI call with a valid NUL-terminated name.
        let sem = unsafe { libc::sem_open(c.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(last_err());
        }
        Ok(Self { sem, posix_name })
    }

    /// Increment the semaphore, waking one waiter if any.
    pub fn post(&self) -> io::Result<()> {
        // SAFETY: `self.sem` is a valid, open semaphore for the lifetime of `self`.
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(last_err());
        }
        Ok(())
    }

    /// Block until a permit is available or `timeout` elapses. Returns `true`
    /// if a permit was acquired, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid out-parameter.
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) } != 0 {
            return Err(last_err());
        }
        let secs = timeout.as_secs() as i64;
        let nanos = i64::from(timeout.subsec_nanos());
        ts.tv_sec += secs;
        ts.tv_nsec += nanos;
        if ts.tv_nsec >= 1_000_000_000 {
            ts.tv_nsec -= 1_000_000_000;
            ts.tv_sec += 1;
        }
        // SAFETY: `self.sem` is valid; `ts` is a valid absolute deadline.
        let rc = unsafe { libc::sem_timedwait(self.sem, &ts) };
        if rc == 0 {
            return Ok(true);
        }
        let err = last_err();
        match err.raw_os_error() {
            Some(libc::ETIMEDOUT) => Ok(false),
            _ => Err(err),
        }
    }

    /// Remove the name so no further `attach` can find this semaphore.
    pub fn unlink(name: &str, role: super::names::SemaphoreRole) -> io::Result<()> {
        let posix_name = super::names::posix_semaphore_name(name, role);
        let c = cname(&posix_name)?;
        // SAFETY: FFI call with a valid NUL-terminated name.
        let rc = unsafe { libc::sem_unlink(c.as_ptr()) };
        if rc != 0 {
            let err = last_err();
            if err.kind() == io::ErrorKind::NotFound {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: `self.sem` is a valid handle owned by this struct.
        unsafe {
            libc::sem_close(self.sem);
        }
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("name", &self.posix_name)
            .finish()
    }
}

/// An exclusive advisory lock on `<tmp>/<name>.lock`, enforcing single-reader
/// channel creation.
pub struct LockFile {
    file: File,
    path: PathBuf,
    locked: bool,
}

impl LockFile {
    /// Open (creating if necessary) and exclusively lock the file backing
    /// `name`'s channel identity. Blocks until the lock is available.
    pub fn acquire(name: &str) -> io::Result<Self> {
        let path = super::names::lock_file_path(name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        flock(&file, libc::LOCK_EX)?;
        Ok(Self {
            file,
            path,
            locked: true,
        })
    }

    /// Release the exclusive lock while keeping the underlying file handle
    /// open.
    pub fn unlock(&mut self) -> io::Result<()> {
        if self.locked {
            flock(&self.file, libc::LOCK_UN)?;
            self.locked = false;
        }
        Ok(())
    }

    /// Path to the backing lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}

fn flock(file: &File, op: i32) -> io::Result<()> {
    // SAFETY: `file` owns a valid, open file descriptor for the call's duration.
    if unsafe { libc::flock(file.as_raw_fd(), op) } != 0 {
        return Err(last_err());
    }
    Ok(())
}

/// Best-effort liveness probe for `pid`.
///
/// `kill(pid, 0)` sends no signal but still validates that the process exists
/// and is visible to us: `ESRCH` means gone, `EPERM` means it exists but is
/// owned by another user (still alive from our point of view).
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: signal 0 performs no action beyond existence/permission checks.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    matches!(io::Error::last_os_error().raw_os_error(), Some(libc::EPERM))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::names::SemaphoreRole;
    use serial_test::serial;

    fn unique_name(tag: &str) -> String {
        format!("zb-test-{}-{}-{}", tag, std::process::id(), unsafe {
            libc::clock()
        })
    }

    #[test]
    #[serial]
    fn segment_create_attach_roundtrip() {
        let name = unique_name("seg");
        let mut seg = Segment::create_exclusive(&name, 4096).unwrap();
        unsafe {
            *seg.as_ptr() = 0xAB;
        }
        let attached = Segment::attach(&name).unwrap();
        assert_eq!(attached.len(), 4096);
        unsafe {
            assert_eq!(*attached.as_ptr(), 0xAB);
        }
        drop(attached);
        drop(seg);
        Segment::unlink(&name).unwrap();
    }

    #[test]
    #[serial]
    fn segment_create_exclusive_fails_if_present() {
        let name = unique_name("dup");
        let _seg = Segment::create_exclusive(&name, 4096).unwrap();
        let err = Segment::create_exclusive(&name, 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        Segment::unlink(&name).unwrap();
    }

    #[test]
    #[serial]
    fn semaphore_post_and_wait() {
        let name = unique_name("sem");
        let sem = Semaphore::create(&name, SemaphoreRole::DataAvailable, 0).unwrap();
        assert!(!sem.wait_timeout(Duration::from_millis(20)).unwrap());
        sem.post().unwrap();
        assert!(sem.wait_timeout(Duration::from_millis(20)).unwrap());
        Semaphore::unlink(&name, SemaphoreRole::DataAvailable).unwrap();
    }

    #[test]
    #[serial]
    fn lock_file_acquire_and_unlock() {
        let name = unique_name("lock");
        let mut lock = LockFile::acquire(&name).unwrap();
        lock.unlock().unwrap();
        let _ = std::fs::remove_file(lock.path());
    }

    #[test]
    fn process_alive_true_for_self_false_for_pid_zero() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(0));
    }

    #[test]
    fn process_alive_false_for_unlikely_pid() {
        // Not airtight (PIDs can be reused), but a very large PID is
        // overwhelmingly likely to be unassigned on any real system.
        assert!(!process_alive(u32::MAX - 1));
    }
}
