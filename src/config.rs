//! Configuration structs recognized by the core channel API.
//!
//! These are plain, `serde`-derived data structs, not a file/env configuration
//! layer — `zerobuffer` is a library, so callers construct these directly rather
//! than loading them from TOML.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 64-byte alignment boundary shared by the metadata slab and the payload ring.
pub const ALIGNMENT: usize = 64;

/// Round `size` up to the next multiple of [`ALIGNMENT`].
pub fn align64(size: usize) -> usize {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Sizing for a channel's metadata slab and payload ring.
///
/// Both sizes are rounded up to a 64-byte boundary by [`Reader::create`] before the
/// segment is created; the rounded values are what end up in the OIEB.
///
/// [`Reader::create`]: crate::reader::Reader::create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Requested metadata slab capacity, in bytes.
    pub metadata_size: usize,
    /// Requested payload ring capacity, in bytes.
    pub payload_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            metadata_size: 1024,
            payload_size: 1024 * 1024,
        }
    }
}

impl BufferConfig {
    /// Construct a config with explicit sizes.
    pub fn new(metadata_size: usize, payload_size: usize) -> Self {
        Self {
            metadata_size,
            payload_size,
        }
    }

    /// Metadata slab size rounded up to the 64-byte boundary.
    pub fn aligned_metadata_size(&self) -> usize {
        align64(self.metadata_size)
    }

    /// Payload ring size rounded up to the 64-byte boundary.
    pub fn aligned_payload_size(&self) -> usize {
        align64(self.payload_size)
    }
}

/// Per-call timeouts and diagnostics options shared by readers and writers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Blocking timeout for [`Writer::write_frame`] and [`Writer::acquire_buffer`];
    /// also governs the liveness-probe tick while blocked.
    ///
    /// [`Writer::write_frame`]: crate::writer::Writer::write_frame
    /// [`Writer::acquire_buffer`]: crate::writer::Writer::acquire_buffer
    #[serde(with = "duration_as_millis")]
    pub write_timeout: Duration,

    /// Default timeout for [`Reader::read_frame`] when the caller does not override
    /// it per-call.
    ///
    /// [`Reader::read_frame`]: crate::reader::Reader::read_frame
    #[serde(with = "duration_as_millis")]
    pub read_timeout: Duration,

    /// Declared log verbosity; consulted only as a hint since this crate never
    /// installs its own subscriber.
    pub log_level: LogLevel,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            log_level: LogLevel::Info,
        }
    }
}

/// Liveness-probe tick while a writer or reader call is blocked. Matches the
/// write timeout when the timeout is shorter than the default tick.
pub const DEFAULT_LIVENESS_TICK: Duration = Duration::from_secs(5);

/// Log verbosity recognized by the core channel API. Informational only —
/// this crate never initializes a `tracing` subscriber on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose.
    Trace,
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warning.
    Warning,
    /// Error.
    Error,
    /// Fatal.
    Fatal,
}

/// Handler scheduling mode for [`ImmutableServer::start`].
///
/// [`ImmutableServer::start`]: crate::duplex::ImmutableServer::start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingMode {
    /// One handler invocation at a time, on the caller's thread. The only mode
    /// implemented by this core.
    SingleThread,
    /// Declared by the core API but deferred to a future major version.
    /// Requesting it fails fast with
    /// [`ZeroBufferError::UnsupportedMode`].
    ///
    /// [`ZeroBufferError::UnsupportedMode`]: crate::error::ZeroBufferError::UnsupportedMode
    ThreadPool,
}

mod duration_as_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sizes_are_1kb_metadata_1mb_payload() {
        let cfg = BufferConfig::default();
        assert_eq!(cfg.metadata_size, 1024);
        assert_eq!(cfg.payload_size, 1024 * 1024);
    }

    #[test]
    fn align64_rounds_up() {
        assert_eq!(align64(0), 0);
        assert_eq!(align64(1), 64);
        assert_eq!(align64(64), 64);
        assert_eq!(align64(65), 128);
    }

    #[test]
    fn options_default_write_timeout_is_five_seconds() {
        let opts = ChannelOptions::default();
        assert_eq!(opts.write_timeout, Duration::from_secs(5));
    }
}
