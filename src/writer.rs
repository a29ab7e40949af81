//! The writer half of a channel: attaches to an existing segment, publishes
//! metadata once, and publishes frames under backpressure.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, trace, warn, Span};

use crate::config::{ChannelOptions, DEFAULT_LIVENESS_TICK};
use crate::error::{Result, ZeroBufferError};
use crate::frame::{FrameHeader, FRAME_HEADER_SIZE};
use crate::logging::channel_span;
use crate::oieb::{Oieb, OiebSnapshot, OIEB_SIZE, CURRENT_VERSION};
use crate::platform::names::SemaphoreRole;
use crate::platform::{process_alive, LockFile, Segment, Semaphore};
use crate::ring;

struct PendingWrite {
    offset: u64,
    len: u64,
    sequence: u64,
}

/// Attaches to a channel created by a [`Reader`](crate::reader::Reader) and
/// publishes frames to it.
///
/// Dropping a `Writer` clears `writer_pid`, wakes any reader still blocked on
/// the data-available semaphore, and destroys the channel's shared resources
/// if no reader is attached.
pub struct Writer {
    name: String,
    segment: Segment,
    oieb: *mut Oieb,
    metadata: *mut u8,
    metadata_len: usize,
    payload: *mut u8,
    payload_len: u64,
    sem_data: Semaphore,
    sem_space: Semaphore,
    _lock: LockFile,
    options: ChannelOptions,
    next_sequence: AtomicU64,
    bytes_written: AtomicU64,
    pending: Mutex<Option<PendingWrite>>,
    span: Span,
}

// SAFETY: see `Reader`'s impl — the mapped bytes are governed entirely by the
// channel protocol, and the protocol assumes a single writer, so `Writer` is
// `Send` but not `Sync`.
unsafe impl Send for Writer {}

impl Writer {
    /// Attach to an existing channel named `name`, becoming its writer.
    ///
    /// Fails with [`ZeroBufferError::VersionMismatch`] if the segment's major
    /// version differs, or [`ZeroBufferError::AlreadyInUse`] if a live writer
    /// is already attached.
    pub fn connect(name: &str, options: ChannelOptions) -> Result<Self> {
        let span = channel_span(name, "writer");
        let _enter = span.enter();

        let lock = LockFile::acquire(name).map_err(|e| resource_err("lock", name, e))?;

        let segment = Segment::attach(name).map_err(|e| resource_err("segment", name, e))?;
        let oieb_ptr = segment.as_ptr() as *mut Oieb;
        // SAFETY: any segment reachable by name was initialized by
        // `Reader::create`, so its first `OIEB_SIZE` bytes are a valid `Oieb`.
        let oieb = unsafe { &*oieb_ptr };

        let peer_version = oieb.version;
        if peer_version.major != CURRENT_VERSION.major {
            return Err(ZeroBufferError::VersionMismatch {
                name: name.to_string(),
                local_major: CURRENT_VERSION.major,
                peer_major: peer_version.major,
            });
        }

        let existing_writer = oieb.writer_pid.load(Ordering::Acquire);
        if existing_writer != 0 && process_alive(existing_writer as u32) {
            return Err(ZeroBufferError::AlreadyInUse {
                name: name.to_string(),
                role: "writer",
            });
        }
        oieb
            .writer_pid
            .store(u64::from(std::process::id()), Ordering::Release);

        let sem_data = Semaphore::attach(name, SemaphoreRole::DataAvailable)
            .map_err(|e| resource_err("semaphore:data", name, e))?;
        let sem_space = Semaphore::attach(name, SemaphoreRole::SpaceAvailable)
            .map_err(|e| resource_err("semaphore:space", name, e))?;

        let mut lock = lock;
        lock.unlock().map_err(|e| resource_err("lock", name, e))?;

        let metadata_len = oieb.metadata_size as usize;
        let payload_len = oieb.payload_size;
        let base = segment.as_ptr();
        // SAFETY: the metadata and payload regions follow the OIEB at the
        // offsets the reader committed when it created the segment.
        let metadata = unsafe { base.add(OIEB_SIZE as usize) };
        let payload = unsafe { metadata.add(metadata_len) };

        debug!("writer attached");
        drop(_enter);

        Ok(Self {
            name: name.to_string(),
            segment,
            oieb: oieb_ptr,
            metadata,
            metadata_len,
            payload,
            payload_len,
            sem_data,
            sem_space,
            _lock: lock,
            options,
            next_sequence: AtomicU64::new(1),
            bytes_written: AtomicU64::new(0),
            pending: Mutex::new(None),
            span,
        })
    }

    fn oieb(&self) -> &Oieb {
        // SAFETY: `self.oieb` points into `self.segment`'s mapping for the
        // lifetime of `self`.
        unsafe { &*self.oieb }
    }

    /// Commit the channel's write-once metadata slab.
    ///
    /// Fails with [`ZeroBufferError::MetadataAlreadySet`] if already called,
    /// or [`ZeroBufferError::MetadataTooLarge`] if `bytes` overflows the
    /// configured slab.
    pub fn set_metadata(&self, bytes: &[u8]) -> Result<()> {
        let already = self.oieb().metadata_written_bytes.load(Ordering::Acquire);
        if already > 0 {
            return Err(ZeroBufferError::MetadataAlreadySet {
                written_bytes: already,
            });
        }
        if bytes.len() > self.metadata_len {
            return Err(ZeroBufferError::MetadataTooLarge {
                requested: bytes.len(),
                capacity: self.metadata_len,
            });
        }
        // SAFETY: `bytes.len() <= self.metadata_len`, the size of the mapped
        // metadata region, and nobody else writes to it (write-once).
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.metadata, bytes.len());
        }
        self.oieb()
            .metadata_free_bytes
            .store((self.metadata_len - bytes.len()) as u64, Ordering::Relaxed);
        self.oieb()
            .metadata_written_bytes
            .store(bytes.len() as u64, Ordering::Release);
        let _enter = self.span.enter();
        debug!(len = bytes.len(), "metadata committed");
        Ok(())
    }

    /// Copy `bytes` into the ring as one frame, blocking under backpressure.
    pub fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        self.write_frame_with_sequence(bytes, None)
    }

    pub(crate) fn write_frame_with_sequence(
        &self,
        bytes: &[u8],
        sequence: Option<u64>,
    ) -> Result<()> {
        let buf = self.acquire_buffer_with_sequence(bytes.len(), sequence)?;
        buf.copy_from_slice(bytes);
        self.commit_frame()
    }

    /// Reserve space for a frame of `n` bytes and return a mutable view over
    /// its payload, without publishing it yet.
    ///
    /// Only one acquired buffer may be outstanding at a time; calling this
    /// again before [`commit_frame`](Self::commit_frame) is a programmer
    /// error and panics.
    pub fn acquire_buffer(&self, n: usize) -> Result<&mut [u8]> {
        self.acquire_buffer_with_sequence(n, None)
    }

    /// Like [`acquire_buffer`](Self::acquire_buffer), but if `sequence` is
    /// `Some`, stamps the frame with that sequence number instead of drawing
    /// the next one from this writer's own counter.
    ///
    /// Used by [`duplex`](crate::duplex) to mirror a request's sequence
    /// number onto its response rather than assigning a fresh one.
    pub(crate) fn acquire_buffer_with_sequence(
        &self,
        n: usize,
        sequence: Option<u64>,
    ) -> Result<&mut [u8]> {
        if ring::frame_too_large(self.payload_len, n as u64) {
            return Err(ZeroBufferError::FrameTooLarge {
                requested: n,
                capacity: self.payload_len as usize,
            });
        }

        let mut pending = self.pending.lock();
        assert!(
            pending.is_none(),
            "acquire_buffer called while a previous buffer is still uncommitted"
        );

        let write_pos = self.oieb().payload_write_pos.load(Ordering::Relaxed);
        let plan = ring::plan_write(write_pos, self.payload_len, n as u64);
        self.wait_for_space(plan.required_free_bytes)?;

        if plan.needs_wrap {
            let wrap_debit = if plan.marker_fits {
                // SAFETY: `marker_fits` means a 16-byte header fits before the
                // physical end of the ring at `write_pos`.
                unsafe {
                    FrameHeader::WRAP_MARKER.write_to(self.payload.add(write_pos as usize));
                }
                FRAME_HEADER_SIZE as u64 + plan.wasted_tail
            } else {
                // Tail too short to hold a marker header at all; waste it
                // silently. The reader independently derives the same
                // "no room for a header" condition from `payload_read_pos`
                // and the ring's capacity, so it knows not to read one here.
                plan.wasted_tail
            };
            self.oieb()
                .payload_free_bytes
                .fetch_sub(wrap_debit, Ordering::AcqRel);
            self.oieb().payload_write_pos.store(0, Ordering::Relaxed);
            let _enter = self.span.enter();
            warn!(
                wasted = plan.wasted_tail,
                marker_fits = plan.marker_fits,
                "wrapped to start of ring"
            );
        }

        let sequence = sequence.unwrap_or_else(|| self.next_sequence.fetch_add(1, Ordering::Relaxed));
        // SAFETY: `plan.frame_offset + 16 + n` fits within the payload ring;
        // the free-space wait above guarantees the bytes are not in use by
        // any unreleased frame.
        let frame_ptr = unsafe { self.payload.add(plan.frame_offset as usize) };
        unsafe {
            FrameHeader {
                payload_size: n as u64,
                sequence_number: sequence,
            }
            .write_to(frame_ptr);
        }
        // SAFETY: `frame_ptr` has at least `16 + n` writable bytes reserved
        // for it, and no other party may read or write this range until
        // `commit_frame` posts sem-data.
        let data = unsafe { std::slice::from_raw_parts_mut(frame_ptr.add(FRAME_HEADER_SIZE), n) };

        *pending = Some(PendingWrite {
            offset: plan.frame_offset,
            len: n as u64,
            sequence,
        });

        Ok(data)
    }

    /// The sequence number assigned to the currently outstanding
    /// [`acquire_buffer`](Self::acquire_buffer) reservation, if any.
    pub fn pending_sequence(&self) -> Option<u64> {
        self.pending.lock().as_ref().map(|p| p.sequence)
    }

    /// Publish the frame reserved by the last [`acquire_buffer`](Self::acquire_buffer) call.
    ///
    /// Panics if no buffer is currently outstanding.
    pub fn commit_frame(&self) -> Result<()> {
        let mut pending = self.pending.lock();
        let p = pending
            .take()
            .expect("commit_frame called with no outstanding acquire_buffer");
        let total = FRAME_HEADER_SIZE as u64 + p.len;
        let new_pos = ring::normalize_pos(p.offset + total, self.payload_len);
        self.oieb().payload_write_pos.store(new_pos, Ordering::Release);
        self.oieb()
            .payload_free_bytes
            .fetch_sub(total, Ordering::AcqRel);
        self.oieb()
            .payload_written_count
            .fetch_add(1, Ordering::AcqRel);
        self.bytes_written.fetch_add(p.len, Ordering::Relaxed);
        let _ = self.sem_data.post();
        let _enter = self.span.enter();
        trace!(sequence = p.sequence, len = p.len, "committed frame");
        Ok(())
    }

    fn wait_for_space(&self, required: u64) -> Result<()> {
        let deadline = Instant::now() + self.options.write_timeout;
        loop {
            if self.oieb().payload_free_bytes.load(Ordering::Acquire) >= required {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let _enter = self.span.enter();
                warn!("write blocked until timeout with insufficient ring space");
                return Err(ZeroBufferError::BufferFull {
                    waited: self.options.write_timeout,
                });
            }
            let wait = remaining.min(DEFAULT_LIVENESS_TICK);
            if !self
                .sem_space
                .wait_timeout(wait)
                .map_err(ZeroBufferError::Io)?
            {
                self.check_reader_alive()?;
            }
        }
    }

    fn check_reader_alive(&self) -> Result<()> {
        let pid = self.oieb().reader_pid.load(Ordering::Acquire);
        if pid != 0 && !process_alive(pid as u32) {
            let _enter = self.span.enter();
            error!(pid, "reader process is dead");
            return Err(ZeroBufferError::ReaderDead { pid: pid as u32 });
        }
        Ok(())
    }

    /// Total frames this writer has committed.
    pub fn frames_written(&self) -> u64 {
        self.oieb().payload_written_count.load(Ordering::Acquire)
    }

    /// Total frames released by the reader so far, read from the OIEB.
    pub fn frames_read(&self) -> u64 {
        self.oieb().payload_read_count.load(Ordering::Acquire)
    }

    /// Total payload bytes this writer has committed, across all frames.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// A point-in-time copy of the OIEB's fields, for diagnostics and tests.
    pub fn oieb_snapshot(&self) -> OiebSnapshot {
        self.oieb().snapshot()
    }

    /// The channel's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        let _enter = self.span.enter();
        self.oieb().writer_pid.store(0, Ordering::Release);
        // Unblock a reader that is still waiting on sem-data so it observes
        // the cleared `writer_pid` on its next liveness check instead of
        // blocking for a full tick.
        let _ = self.sem_data.post();
        let reader_pid = self.oieb().reader_pid.load(Ordering::Acquire);
        if reader_pid == 0 {
            debug!("last party out, destroying channel resources");
            let _ = Segment::unlink(&self.name);
            let _ = Semaphore::unlink(&self.name, SemaphoreRole::DataAvailable);
            let _ = Semaphore::unlink(&self.name, SemaphoreRole::SpaceAvailable);
        }
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("name", &self.name)
            .field("payload_len", &self.payload_len)
            .finish()
    }
}

fn resource_err(resource: &'static str, name: &str, source: io::Error) -> ZeroBufferError {
    ZeroBufferError::ResourceInit {
        resource,
        name: name.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::reader::Reader;
    use serial_test::serial;

    fn unique_name(tag: &str) -> String {
        format!("zb-test-writer-{}-{}-{}", tag, std::process::id(), unsafe {
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
    fn connect_without_a_reader_fails() {
        let name = unique_name("no-reader");
        let err = Writer::connect(&name, ChannelOptions::default()).unwrap_err();
        assert!(matches!(err, ZeroBufferError::ResourceInit { .. }));
    }

    #[test]
    #[serial]
    fn set_metadata_twice_fails_on_the_second_call() {
        let name = unique_name("meta-twice");
        let reader = Reader::create(&name, BufferConfig::new(64, 4096), ChannelOptions::default())
            .unwrap();
        let writer = Writer::connect(&name, ChannelOptions::default()).unwrap();
        writer.set_metadata(b"hello").unwrap();
        let err = writer.set_metadata(b"again").unwrap_err();
        assert!(matches!(err, ZeroBufferError::MetadataAlreadySet { written_bytes: 5 }));
        drop(writer);
        drop(reader);
    }

    #[test]
    #[serial]
    fn metadata_too_large_is_rejected() {
        let name = unique_name("meta-big");
        let reader = Reader::create(&name, BufferConfig::new(64, 4096), ChannelOptions::default())
            .unwrap();
        let writer = Writer::connect(&name, ChannelOptions::default()).unwrap();
        let err = writer.set_metadata(&vec![0u8; 65]).unwrap_err();
        assert!(matches!(err, ZeroBufferError::MetadataTooLarge { .. }));
        drop(writer);
        drop(reader);
    }

    #[test]
    #[serial]
    fn write_then_read_round_trips_one_frame() {
        let name = unique_name("roundtrip");
        let reader = Reader::create(&name, BufferConfig::new(64, 4096), ChannelOptions::default())
            .unwrap();
        let writer = Writer::connect(&name, ChannelOptions::default()).unwrap();
        writer.write_frame(&[1, 2, 3, 4]).unwrap();
        let view = reader.read_frame(Duration::from_secs(1)).unwrap();
        assert_eq!(view.data(), &[1, 2, 3, 4]);
        assert_eq!(view.sequence(), 1);
        drop(view);
        assert_eq!(reader.oieb_snapshot().payload_free_bytes, 4096);
        drop(writer);
        drop(reader);
    }

    #[test]
    #[serial]
    #[should_panic(expected = "acquire_buffer called while a previous buffer is still uncommitted")]
    fn double_acquire_without_commit_panics() {
        let name = unique_name("double-acquire");
        let reader = Reader::create(&name, BufferConfig::new(64, 4096), ChannelOptions::default())
            .unwrap();
        let writer = Writer::connect(&name, ChannelOptions::default()).unwrap();
        let _first = writer.acquire_buffer(16).unwrap();
        let _second = writer.acquire_buffer(16);
        drop(writer);
        drop(reader);
    }

    #[test]
    #[serial]
    fn frame_larger_than_ring_is_rejected() {
        let name = unique_name("too-large");
        let reader = Reader::create(&name, BufferConfig::new(64, 256), ChannelOptions::default())
            .unwrap();
        let writer = Writer::connect(&name, ChannelOptions::default()).unwrap();
        let err = writer.write_frame(&vec![0u8; 512]).unwrap_err();
        assert!(matches!(err, ZeroBufferError::FrameTooLarge { .. }));
        drop(writer);
        drop(reader);
    }
}
