//! # zerobuffer
//!
//! A cross-platform, single-writer/single-reader shared-memory IPC channel.
//!
//! A channel is a named shared-memory ring buffer plus a small write-once
//! metadata slab, fronted by two named counting semaphores (data-available
//! and space-available) and a PID-based liveness check so a crashed peer is
//! detected instead of hanging the other side forever. [`Reader::create`]
//! creates the channel's resources; [`Writer::connect`] attaches to an
//! existing one. [`duplex`] composes two channels into a request/response
//! pair for RPC-style usage.
//!
//! ## Crate structure
//!
//! - **`oieb`**: the Operation Info Exchange Block, the 128-byte `#[repr(C)]`
//!   control header at the start of every channel segment.
//! - **`frame`**: the 16-byte frame header and the [`FrameView`] RAII guard
//!   returned by [`Reader::read_frame`].
//! - **`ring`**: pure free-space and wrap-around accounting shared by the
//!   reader and writer, kept separate from the atomics that apply it.
//! - **`platform`**: the OS-specific primitives (named shared memory, named
//!   semaphores, an exclusive lock file, process liveness) behind one
//!   portable surface.
//! - **`reader`** / **`writer`**: the two halves of a channel.
//! - **`duplex`**: request/response composition of two channels.
//! - **`config`**: plain `serde`-derived sizing and option structs.
//! - **`error`**: the crate's single `thiserror` error enum.
//! - **`logging`**: shared `tracing` span helpers.

pub mod config;
pub mod duplex;
pub mod error;
pub mod frame;
pub(crate) mod logging;
pub mod oieb;
pub mod platform;
pub mod reader;
pub mod ring;
pub mod writer;

pub use config::{BufferConfig, ChannelOptions, LogLevel, ProcessingMode};
pub use duplex::{Client, ImmutableServer};
pub use error::{Result, ZeroBufferError};
pub use frame::FrameView;
pub use oieb::{OiebSnapshot, Version, CURRENT_VERSION};
pub use reader::Reader;
pub use writer::Writer;
