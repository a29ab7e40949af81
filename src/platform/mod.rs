//! Platform primitives: named shared memory, named counting
//! semaphores, an exclusive lock file, and OS process liveness — one portable
//! surface with two backends.
//!
//! The rest of the crate only calls into the types re-exported here
//! (`Segment`, `Semaphore`, `LockFile`, `process_alive`); it never matches on
//! `cfg(unix)`/`cfg(windows)` itself.

pub mod names;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::{process_alive, LockFile, Segment, Semaphore};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::{process_alive, LockFile, Segment, Semaphore};

#[cfg(not(any(unix, windows)))]
compile_error!("zerobuffer's platform module supports only unix and windows targets");
