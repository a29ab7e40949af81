//! Translation from a channel's logical name to the OS-specific
//! strings each backend requires.

/// Which of the two semaphores in a channel a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreRole {
    /// "data-available", posted by the writer, waited on by the reader.
    DataAvailable,
    /// "space-available", posted by the reader, waited on by the writer.
    SpaceAvailable,
}

impl SemaphoreRole {
    fn suffix(self) -> &'static str {
        match self {
            SemaphoreRole::DataAvailable => "w",
            SemaphoreRole::SpaceAvailable => "r",
        }
    }
}

/// POSIX `shm_open`/`sem_open` names must start with a single leading `/` and
/// contain no other `/`. Channel names may not, so we mangle a fixed prefix in
/// and reject embedded slashes explicitly rather than silently collapsing them.
#[cfg(unix)]
pub fn posix_segment_name(channel: &str) -> String {
    format!("/zerobuffer-{channel}")
}

#[cfg(unix)]
pub fn posix_semaphore_name(channel: &str, role: SemaphoreRole) -> String {
    format!("/zerobuffer-{channel}-{}", role.suffix())
}

/// Windows kernel object names live in a single namespace per session; a
/// `Local\` prefix keeps them out of the global namespace and collision-free
/// with unrelated applications.
#[cfg(windows)]
pub fn win32_segment_name(channel: &str) -> String {
    format!("Local\\zerobuffer-{channel}")
}

#[cfg(windows)]
pub fn win32_semaphore_name(channel: &str, role: SemaphoreRole) -> String {
    format!("Local\\zerobuffer-{channel}-{}", role.suffix())
}

/// `<tmp>/<name>.lock`, the file whose advisory lock enforces exclusive
/// reader creation for a channel name.
pub fn lock_file_path(channel: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("{channel}.lock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_is_under_tmp() {
        let p = lock_file_path("B1");
        assert_eq!(p.file_name().unwrap(), "B1.lock");
        assert_eq!(p.parent().unwrap(), std::env::temp_dir());
    }
}
