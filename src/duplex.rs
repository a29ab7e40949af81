//! Request/response composition of two channels.
//!
//! A duplex channel named `N` is the pair of rings `N#request` and
//! `N#response`. [`ImmutableServer`] owns the request ring's reader and the
//! response ring's writer; [`Client`] owns the opposite halves. The server
//! mirrors each request's sequence number onto its response so a client with
//! several requests outstanding can correlate replies without relying on
//! arrival order.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, Span};

use crate::config::{BufferConfig, ChannelOptions, ProcessingMode, DEFAULT_LIVENESS_TICK};
use crate::error::{Result, ZeroBufferError};
use crate::frame::FrameView;
use crate::logging::channel_span;
use crate::reader::Reader;
use crate::writer::Writer;

/// How long [`ImmutableServer::create`] and [`Client::create`] retry
/// attaching to a peer-owned ring before giving up.
const CONNECT_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

fn request_ring_name(name: &str) -> String {
    format!("{name}#request")
}

fn response_ring_name(name: &str) -> String {
    format!("{name}#response")
}

fn connect_retrying(name: &str, options: ChannelOptions) -> Result<Writer> {
    let deadline = Instant::now() + CONNECT_RETRY_TIMEOUT;
    loop {
        match Writer::connect(name, options) {
            Ok(writer) => return Ok(writer),
            Err(ZeroBufferError::ResourceInit { source, .. })
                if source.kind() == io::ErrorKind::NotFound =>
            {
                if Instant::now() >= deadline {
                    return Err(ZeroBufferError::ResourceInit {
                        resource: "segment",
                        name: name.to_string(),
                        source: io::Error::new(
                            io::ErrorKind::TimedOut,
                            "peer ring was never created",
                        ),
                    });
                }
                std::thread::sleep(DEFAULT_LIVENESS_TICK.min(Duration::from_millis(50)));
            }
            Err(e) => return Err(e),
        }
    }
}

/// The server half of a duplex channel: reads requests, runs a handler, and
/// publishes replies tagged with the request's own sequence number.
pub struct ImmutableServer {
    request: Reader,
    response: Writer,
    running: AtomicBool,
    options: ChannelOptions,
    span: Span,
}

// SAFETY: `stop` is the only method meant to be called from a thread other
// than the one running `start`, and it only ever touches the atomic
// `running` flag; every other field is read and written exclusively from
// the thread inside `start`, matching the single-writer/single-reader
// discipline `Reader`/`Writer` already assume.
unsafe impl Sync for ImmutableServer {}

impl ImmutableServer {
    /// Create the request ring (as its reader) and attach to the response
    /// ring (as its writer), waiting for a [`Client`] to have created it.
    pub fn create(name: &str, cfg: BufferConfig, options: ChannelOptions) -> Result<Self> {
        let span = channel_span(name, "duplex-server");
        let _enter = span.enter();
        let request = Reader::create(&request_ring_name(name), cfg, options)?;
        let response = connect_retrying(&response_ring_name(name), options)?;
        debug!("duplex server ready");
        drop(_enter);
        Ok(Self {
            request,
            response,
            running: AtomicBool::new(false),
            options,
            span,
        })
    }

    /// Run `handler` against each request until [`stop`](Self::stop) is
    /// called or the request ring's writer dies.
    ///
    /// Only [`ProcessingMode::SingleThread`] is implemented; requesting
    /// [`ProcessingMode::ThreadPool`] fails fast with
    /// [`ZeroBufferError::UnsupportedMode`].
    pub fn start(
        &self,
        mode: ProcessingMode,
        mut handler: impl FnMut(&[u8]) -> Vec<u8>,
    ) -> Result<()> {
        if mode != ProcessingMode::SingleThread {
            return Err(ZeroBufferError::UnsupportedMode {
                mode: "thread_pool",
            });
        }
        let _enter = self.span.enter();
        self.running.store(true, Ordering::Release);
        while self.running.load(Ordering::Acquire) {
            let view = match self.request.read_frame(self.options.read_timeout) {
                Ok(view) => view,
                Err(ZeroBufferError::WriterDead { .. }) => break,
                Err(e) => return Err(e),
            };
            if !view.is_valid() {
                continue;
            }
            let sequence = view.sequence();
            let reply = handler(view.data());
            drop(view);
            self.response
                .write_frame_with_sequence(&reply, Some(sequence))?;
        }
        Ok(())
    }

    /// Signal a concurrently running [`start`](Self::start) to return after
    /// its current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for ImmutableServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImmutableServer")
            .field("request", &self.request.name())
            .field("response", &self.response.name())
            .finish()
    }
}

/// The client half of a duplex channel: creates the response ring (as its
/// reader) and attaches to the request ring (as its writer).
pub struct Client {
    request: Writer,
    response: Reader,
}

impl Client {
    /// Create the response ring and attach to the request ring created by an
    /// [`ImmutableServer`], waiting for it to exist.
    pub fn create(name: &str, cfg: BufferConfig, options: ChannelOptions) -> Result<Self> {
        let response = Reader::create(&response_ring_name(name), cfg, options)?;
        let request = connect_retrying(&request_ring_name(name), options)?;
        Ok(Self { request, response })
    }

    /// Reserve space for a request of `n` bytes without publishing it yet.
    /// Pair with [`commit`](Self::commit).
    pub fn acquire_request(&self, n: usize) -> Result<&mut [u8]> {
        self.request.acquire_buffer(n)
    }

    /// Publish the request reserved by [`acquire_request`](Self::acquire_request),
    /// returning its assigned sequence number.
    pub fn commit(&self) -> Result<u64> {
        let sequence = self
            .request
            .pending_sequence()
            .expect("commit called with no outstanding acquire_request");
        self.request.commit_frame()?;
        Ok(sequence)
    }

    /// Copy `bytes` into the request ring as one frame, returning its
    /// assigned sequence number.
    pub fn send_request(&self, bytes: &[u8]) -> Result<u64> {
        let buf = self.acquire_request(bytes.len())?;
        buf.copy_from_slice(bytes);
        self.commit()
    }

    /// Block until a response is available or `timeout` elapses.
    pub fn read(&self, timeout: Duration) -> Result<FrameView<'_>> {
        self.response.read_frame(timeout)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("request", &self.request.name())
            .field("response", &self.response.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::Arc;

    fn unique_name(tag: &str) -> String {
        format!("zb-test-duplex-{}-{}-{}", tag, std::process::id(), unsafe {
            libc_clock()
        })
    }

    #[cfg(unix)]
    fn libc_clock() -> i64 {
        unsafe { libc::clock() }
    }
    #[cfg(windows)]
    fn libc_clock() -> i64 {
        std::process::id() as i64
    }

    #[test]
    #[serial]
    fn echo_round_trip_preserves_sequence_number() {
        let name = unique_name("echo");
        let cfg = BufferConfig::new(64, 4096);
        let options = ChannelOptions {
            read_timeout: Duration::from_millis(200),
            ..ChannelOptions::default()
        };

        // Both sides wait on a ring the other side creates (server waits on
        // the client's response ring, client waits on the server's request
        // ring), so construction must happen concurrently rather than
        // sequentially.
        let server_name = name.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let server = Arc::new(ImmutableServer::create(&server_name, cfg, options).unwrap());
            ready_tx.send(Arc::clone(&server)).unwrap();
            server
                .start(ProcessingMode::SingleThread, |req| req.to_vec())
                .unwrap();
        });

        let client = Client::create(&name, cfg, options).unwrap();
        let seq = client.send_request(b"ping").unwrap();
        let view = client.read(Duration::from_secs(1)).unwrap();
        assert!(view.is_valid());
        assert_eq!(view.data(), b"ping");
        assert_eq!(view.sequence(), seq);
        drop(view);

        let server = ready_rx.recv().unwrap();
        server.stop();
        drop(client);
        handle.join().unwrap();
    }

    #[test]
    #[serial]
    fn thread_pool_mode_is_rejected() {
        let name = unique_name("mode");
        let cfg = BufferConfig::new(64, 4096);
        let options = ChannelOptions::default();
        // Pre-create the response ring so `ImmutableServer::create` attaches
        // to it immediately instead of retrying for up to 30 seconds.
        let response_reader =
            Reader::create(&response_ring_name(&name), cfg, options).unwrap();
        let server = ImmutableServer::create(&name, cfg, options).unwrap();
        let err = server
            .start(ProcessingMode::ThreadPool, |req| req.to_vec())
            .unwrap_err();
        assert!(matches!(err, ZeroBufferError::UnsupportedMode { .. }));
        drop(response_reader);
    }
}
