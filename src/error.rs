//! Error types for the zerobuffer channel.
//!
//! `ZeroBufferError` consolidates every failure mode a reader, writer, or duplex
//! participant can observe, from OS resource exhaustion to protocol violations on
//! the wire. Using `thiserror`, each variant carries the minimal context a caller
//! needs to decide whether to retry, reconnect, or give up.

use thiserror::Error;

/// Convenience alias for results using [`ZeroBufferError`].
pub type Result<T> = std::result::Result<T, ZeroBufferError>;

/// Errors that can occur while creating, attaching to, or operating a zerobuffer
/// channel.
#[derive(Error, Debug)]
pub enum ZeroBufferError {
    /// Another live peer already owns the reader or writer role for this channel name.
    #[error("channel '{name}' is already in use by a live {role}")]
    AlreadyInUse {
        /// Channel name.
        name: String,
        /// Which role ("reader" or "writer") is already occupied.
        role: &'static str,
    },

    /// The peer's OIEB major version does not match ours.
    #[error("version mismatch on '{name}': local major {local_major}, peer major {peer_major}")]
    VersionMismatch {
        /// Channel name.
        name: String,
        /// Our major version.
        local_major: u8,
        /// The peer's major version.
        peer_major: u8,
    },

    /// `Writer::set_metadata` was called more than once.
    #[error("metadata already set ({written_bytes} bytes committed)")]
    MetadataAlreadySet {
        /// Number of bytes already committed to the metadata slab.
        written_bytes: u64,
    },

    /// The metadata payload does not fit in the configured slab.
    #[error("metadata of {requested} bytes exceeds slab capacity of {capacity} bytes")]
    MetadataTooLarge {
        /// Size of the metadata the caller tried to write.
        requested: usize,
        /// Configured slab capacity.
        capacity: usize,
    },

    /// A frame cannot fit even into a fully empty ring.
    #[error(
        "frame of {requested} bytes (plus 16-byte header) cannot fit in a ring of {capacity} bytes"
    )]
    FrameTooLarge {
        /// Requested payload size.
        requested: usize,
        /// Ring capacity.
        capacity: usize,
    },

    /// A write could not acquire enough space before its timeout expired.
    #[error("write blocked for {waited:?} without enough free space in the ring")]
    BufferFull {
        /// How long the writer waited before giving up.
        waited: std::time::Duration,
    },

    /// The reader detected that the writer process has died.
    #[error("writer process (pid {pid}) is no longer alive")]
    WriterDead {
        /// The dead writer's OS PID.
        pid: u32,
    },

    /// The writer detected that the reader process has died.
    #[error("reader process (pid {pid}) is no longer alive")]
    ReaderDead {
        /// The dead reader's OS PID.
        pid: u32,
    },

    /// A frame header violates the ring's invariants (e.g. payload would cross the
    /// end of the ring without a wrap marker).
    #[error("invalid frame header at ring offset {offset}: {reason}")]
    InvalidFrame {
        /// Byte offset within the payload ring where the bad header was found.
        offset: u64,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// The OS refused to create or attach a segment, semaphore, or lock file.
    #[error("failed to initialize resource '{resource}' for channel '{name}': {source}")]
    ResourceInit {
        /// Which resource failed ("segment", "semaphore:data", "semaphore:space", "lock").
        resource: &'static str,
        /// Channel name.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// A processing mode was requested that this core does not implement.
    #[error("processing mode '{mode}' is not supported by this implementation")]
    UnsupportedMode {
        /// The name of the requested mode.
        mode: &'static str,
    },

    /// Transparent wrapper for I/O failures not otherwise classified above.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
