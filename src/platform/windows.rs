//! Windows backend: file-mapping-backed segments and native semaphores.
//!
//! Grounded in the same `MapViewOfFile`/`HANDLE` RAII pattern used for the
//! kernel/user-mode shared ring in this codebase's Windows IPC precedent:
//! every OS handle is wrapped so it closes on every exit path, and the mapped
//! base address is cached once at construction since the mapping does not
//! move for the lifetime of the handle.

use std::io;
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, GetLastError, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, LockFileEx, UnlockFile, FILE_ATTRIBUTE_NORMAL, FILE_SHARE_READ, FILE_SHARE_WRITE,
    LOCKFILE_EXCLUSIVE_LOCK, OPEN_ALWAYS,
};
use windows_sys::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, VirtualQuery,
    FILE_MAP_READ, FILE_MAP_WRITE, MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS,
    PAGE_READWRITE,
};
use windows_sys::Win32::System::Threading::{
    CreateSemaphoreW, GetExitCodeProcess, OpenProcess, OpenSemaphoreW, ReleaseSemaphore,
    WaitForSingleObject, INFINITE, PROCESS_QUERY_LIMITED_INFORMATION, SEMAPHORE_ALL_ACCESS,
    STILL_ACTIVE,
};

const ERROR_ALREADY_EXISTS: u32 = 183;

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn last_err() -> io::Error {
    io::Error::last_os_error()
}

/// A file-mapping-backed segment mapped read/write into this process.
pub struct Segment {
    mapping: HANDLE,
    view: *mut u8,
    len: usize,
}

// SAFETY: see the corresponding impl in `platform::unix::Segment` — access to
// the mapped bytes is fully governed by the channel protocol, not by this
// type's own synchronization.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl Segment {
    /// Create a brand-new segment, failing if one already exists under `name`.
    pub fn create_exclusive(name: &str, bytes: usize) -> io::Result<Self> {
        let wname = wide(&super::names::win32_segment_name(name));
        let size = bytes as u64;
        // SAFETY: `wname` is a valid NUL-terminated UTF-16 string for the call's
        // duration; the returned handle is checked below before use.
        let mapping = unsafe {
            CreateFileMappingW(
                std::ptr::null_mut(),
                std::ptr::null(),
                PAGE_READWRITE,
                (size >> 32) as u32,
                (size & 0xFFFF_FFFF) as u32,
                wname.as_ptr(),
            )
        };
        if mapping.is_null() {
            return Err(last_err());
        }
        // SAFETY: `GetLastError` immediately follows the call it reports on.
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe { CloseHandle(mapping) };
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        Self::map(mapping)
    }

    /// Attach to an existing segment, mapping its full current size.
    pub fn attach(name: &str) -> io::Result<Self> {
        let wname = wide(&super::names::win32_segment_name(name));
        // SAFETY: `wname` is a valid NUL-terminated UTF-16 string for the call's
        // duration.
        let mapping = unsafe { OpenFileMappingW(FILE_MAP_READ | FILE_MAP_WRITE, 0, wname.as_ptr()) };
        if mapping.is_null() {
            return Err(last_err());
        }
        Self::map(mapping)
    }

    /// Map the whole of `mapping` and discover its length with `VirtualQuery`,
    /// since `OpenFileMappingW` does not itself return the mapped size.
    fn map(mapping: HANDLE) -> io::Result<Self> {
        // SAFETY: `mapping` is a valid file-mapping handle; a zero offset/size
        // requests a view covering the whole mapping.
        let addr: MEMORY_MAPPED_VIEW_ADDRESS =
            unsafe { MapViewOfFile(mapping, FILE_MAP_READ | FILE_MAP_WRITE, 0, 0, 0) };
        if addr.Value.is_null() {
            let err = last_err();
            unsafe { CloseHandle(mapping) };
            return Err(err);
        }
        let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { std::mem::zeroed() };
        // SAFETY: `addr.Value` is the base of the view just mapped above;
        // `mbi` is a valid out-parameter sized for this query.
        let queried = unsafe {
            VirtualQuery(
                addr.Value as *const _,
                &mut mbi,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if queried == 0 {
            let err = last_err();
            unsafe {
                UnmapViewOfFile(addr);
                CloseHandle(mapping);
            }
            return Err(err);
        }
        Ok(Self {
            mapping,
            view: addr.Value as *mut u8,
            len: mbi.RegionSize,
        })
    }

    /// There is no persistent name to remove on Windows; the mapping vanishes
    /// once every handle to it is closed. Provided for API symmetry with the
    /// POSIX backend.
    pub fn unlink(_name: &str) -> io::Result<()> {
        Ok(())
    }

    /// Base address of the mapped segment.
    pub fn as_ptr(&self) -> *mut u8 {
        self.view
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

impl Drop for Segment {
    fn drop(&mut self) {
        // SAFETY: `self.view`/`self.mapping` are valid handles owned by `self`.
        unsafe {
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.view as _,
            });
            CloseHandle(self.mapping);
        }
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment").field("len", &self.len).finish()
    }
}

/// A named Win32 semaphore.
pub struct Semaphore {
    handle: HANDLE,
}

// SAFETY: Win32 semaphore handles are explicitly documented as safe for
// concurrent use from multiple threads/processes.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Create a new semaphore with `initial` permits, failing if one with this
    /// name already exists.
    pub fn create(name: &str, role: super::names::SemaphoreRole, initial: u32) -> io::Result<Self> {
        let wname = wide(&super::names::win32_semaphore_name(name, role));
        // SAFETY: `wname` is a valid NUL-terminated UTF-16 string for the call's
        // duration.
        let handle = unsafe {
            CreateSemaphoreW(std::ptr::null(), initial as i32, i32::MAX, wname.as_ptr())
        };
        if handle.is_null() {
            return Err(last_err());
        }
        // SAFETY: `GetLastError` immediately follows the call it reports on.
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            unsafe { CloseHandle(handle) };
            return Err(io::Error::from(io::ErrorKind::AlreadyExists));
        }
        Ok(Self { handle })
    }

    /// Attach to an existing named semaphore.
    pub fn attach(name: &str, role: super::names::SemaphoreRole) -> io::Result<Self> {
        let wname = wide(&super::names::win32_semaphore_name(name, role));
        // SAFETY: `wname` is a valid NUL-terminated UTF-16 string for the call's
        // duration.
        let handle = unsafe { OpenSemaphoreW(SEMAPHORE_ALL_ACCESS, 0, wname.as_ptr()) };
        if handle.is_null() {
            return Err(last_err());
        }
        Ok(Self { handle })
    }

    /// Increment the semaphore, waking one waiter if any.
    pub fn post(&self) -> io::Result<()> {
        // SAFETY: `self.handle` is a valid semaphore handle owned by `self`.
        if unsafe { ReleaseSemaphore(self.handle, 1, std::ptr::null_mut()) } == 0 {
            return Err(last_err());
        }
        Ok(())
    }

    /// Block until a permit is available or `timeout` elapses. Returns `true`
    /// if a permit was acquired, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let millis = timeout.as_millis().min(u128::from(INFINITE - 1)) as u32;
        // SAFETY: `self.handle` is a valid, waitable handle owned by `self`.
        match unsafe { WaitForSingleObject(self.handle, millis) } {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(last_err()),
        }
    }

    /// No-op: Win32 named semaphores have no separate unlink step, they vanish
    /// once every handle closes. Provided for API symmetry with the POSIX
    /// backend.
    pub fn unlink(_name: &str, _role: super::names::SemaphoreRole) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: `self.handle` is a valid handle owned by `self`.
        unsafe {
            CloseHandle(self.handle);
        }
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore").finish()
    }
}

/// An exclusive lock on `<tmp>/<name>.lock`, enforcing single-reader channel
/// creation.
pub struct LockFile {
    handle: HANDLE,
    path: std::path::PathBuf,
    locked: bool,
}

impl LockFile {
    /// Open (creating if necessary) and exclusively lock the file backing
    /// `name`'s channel identity. Blocks until the lock is available.
    pub fn acquire(name: &str) -> io::Result<Self> {
        let path = super::names::lock_file_path(name);
        let wpath = wide(&path.to_string_lossy());
        // SAFETY: `wpath` is a valid NUL-terminated UTF-16 string for the call's
        // duration.
        let handle = unsafe {
            CreateFileW(
                wpath.as_ptr(),
                windows_sys::Win32::Storage::FileSystem::FILE_GENERIC_READ
                    | windows_sys::Win32::Storage::FileSystem::FILE_GENERIC_WRITE,
                FILE_SHARE_READ | FILE_SHARE_WRITE,
                std::ptr::null(),
                OPEN_ALWAYS,
                FILE_ATTRIBUTE_NORMAL,
                std::ptr::null_mut(),
            )
        };
        if handle.is_null() || handle == windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE {
            return Err(last_err());
        }
        let mut overlapped = unsafe { std::mem::zeroed() };
        // SAFETY: locking the whole (small) lock file with a blocking,
        // exclusive request; `overlapped` is zeroed and lives for the call.
        let ok = unsafe {
            LockFileEx(
                handle,
                LOCKFILE_EXCLUSIVE_LOCK,
                0,
                u32::MAX,
                u32::MAX,
                &mut overlapped,
            )
        };
        if ok == 0 {
            let err = last_err();
            unsafe { CloseHandle(handle) };
            return Err(err);
        }
        Ok(Self {
            handle,
            path,
            locked: true,
        })
    }

    /// Release the exclusive lock while keeping the underlying file handle
    /// open.
    pub fn unlock(&mut self) -> io::Result<()> {
        if self.locked {
            // SAFETY: `self.handle` is a valid, currently-locked file handle.
            if unsafe { UnlockFile(self.handle, 0, 0, u32::MAX, u32::MAX) } == 0 {
                return Err(last_err());
            }
            self.locked = false;
        }
        Ok(())
    }

    /// Path to the backing lock file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.unlock();
        // SAFETY: `self.handle` is a valid handle owned by `self`.
        unsafe {
            CloseHandle(self.handle);
        }
    }
}

/// Best-effort liveness probe for `pid`: opens the process with the
/// minimal query rights and checks it has not yet returned an exit code.
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: `PROCESS_QUERY_LIMITED_INFORMATION` only grants the rights this
    // function uses below.
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
    if handle.is_null() {
        return false;
    }
    let mut exit_code = 0u32;
    // SAFETY: `handle` is valid and `exit_code` is a valid out-parameter.
    let ok = unsafe { GetExitCodeProcess(handle, &mut exit_code) };
    unsafe { CloseHandle(handle) };
    ok != 0 && exit_code == STILL_ACTIVE as u32
}
