//! The reader half of a channel: owns the segment, accepts one writer, and
//! hands out [`FrameView`]s that reclaim their ring space on drop.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn, Span};

use crate::config::{BufferConfig, ChannelOptions, DEFAULT_LIVENESS_TICK};
use crate::error::{Result, ZeroBufferError};
use crate::frame::{FrameHeader, FrameView, FRAME_HEADER_SIZE};
use crate::logging::channel_span;
use crate::oieb::{Oieb, OiebSnapshot, OIEB_SIZE};
use crate::platform::names::SemaphoreRole;
use crate::platform::{process_alive, LockFile, Segment, Semaphore};
use crate::ring;

/// Owns a channel segment, accepts exactly one writer, and reads frames.
///
/// Dropping a `Reader` clears `reader_pid` and destroys the channel's shared
/// resources if no writer is attached.
pub struct Reader {
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
    bytes_read: AtomicU64,
    span: Span,
}

// SAFETY: the payload/metadata pointers are only ever dereferenced through
// the atomics and raw-pointer arithmetic the channel protocol defines; a
// `Reader` adds no aliasing beyond what the protocol already requires, and
// the protocol itself assumes a single reader, so `Reader` is `Send` but not
// `Sync`.
unsafe impl Send for Reader {}

impl Reader {
    /// Create a new channel named `name`, becoming its reader.
    ///
    /// If a segment with this name already exists but both the writer and
    /// reader PIDs it records are dead, the stale segment and its semaphores
    /// are destroyed first. If a live reader already owns the name, this
    /// fails with [`ZeroBufferError::AlreadyInUse`].
    pub fn create(name: &str, cfg: BufferConfig, options: ChannelOptions) -> Result<Self> {
        let span = channel_span(name, "reader");
        let _enter = span.enter();

        let lock = LockFile::acquire(name)
            .map_err(|e| resource_err("lock", name, e))?;

        Self::reclaim_if_stale(name)?;

        let metadata_len = cfg.aligned_metadata_size();
        let payload_len = cfg.aligned_payload_size();
        let total = OIEB_SIZE as usize + metadata_len + payload_len;

        let segment = Segment::create_exclusive(name, total).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                ZeroBufferError::AlreadyInUse {
                    name: name.to_string(),
                    role: "reader",
                }
            } else {
                resource_err("segment", name, e)
            }
        })?;

        let base = segment.as_ptr();
        let oieb_ptr = base as *mut Oieb;
        // SAFETY: `segment` was just created and zero-filled; nothing else
        // observes it until the lock below is released.
        unsafe {
            Oieb::init_at(
                oieb_ptr,
                metadata_len as u64,
                payload_len as u64,
                std::process::id(),
            );
        }
        // SAFETY: `base` points to `total` contiguous mapped bytes; metadata
        // and payload regions follow the OIEB at the offsets computed above.
        let metadata = unsafe { base.add(OIEB_SIZE as usize) };
        let payload = unsafe { metadata.add(metadata_len) };

        let sem_data = Semaphore::create(name, SemaphoreRole::DataAvailable, 0)
            .map_err(|e| resource_err("semaphore:data", name, e))?;
        let sem_space = Semaphore::create(name, SemaphoreRole::SpaceAvailable, 0)
            .map_err(|e| resource_err("semaphore:space", name, e))?;

        let mut lock = lock;
        lock.unlock().map_err(|e| resource_err("lock", name, e))?;

        debug!("channel created");
        drop(_enter);

        Ok(Self {
            name: name.to_string(),
            segment,
            oieb: oieb_ptr,
            metadata,
            metadata_len,
            payload,
            payload_len: payload_len as u64,
            sem_data,
            sem_space,
            _lock: lock,
            options,
            bytes_read: AtomicU64::new(0),
            span,
        })
    }

    fn reclaim_if_stale(name: &str) -> Result<()> {
        match Segment::attach(name) {
            Ok(existing) => {
                // SAFETY: any existing segment of this name was created by a
                // prior `Reader::create`, so its first `OIEB_SIZE` bytes are a
                // valid `Oieb`.
                let snap = unsafe { &*(existing.as_ptr() as *const Oieb) }.snapshot();
                drop(existing);
                let writer_dead = snap.writer_pid == 0 || !process_alive(snap.writer_pid as u32);
                let reader_dead = snap.reader_pid == 0 || !process_alive(snap.reader_pid as u32);
                if writer_dead && reader_dead {
                    warn!(name, "destroying stale channel left by dead peers");
                    let _ = Segment::unlink(name);
                    let _ = Semaphore::unlink(name, SemaphoreRole::DataAvailable);
                    let _ = Semaphore::unlink(name, SemaphoreRole::SpaceAvailable);
                    Ok(())
                } else {
                    Err(ZeroBufferError::AlreadyInUse {
                        name: name.to_string(),
                        role: "reader",
                    })
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(resource_err("segment", name, e)),
        }
    }

    fn oieb(&self) -> &Oieb {
        // SAFETY: `self.oieb` points into `self.segment`'s mapping for the
        // lifetime of `self`.
        unsafe { &*self.oieb }
    }

    /// Like [`read_frame`](Self::read_frame), using the channel's configured
    /// `read_timeout` instead of a per-call override.
    pub fn read_frame_default(&self) -> Result<FrameView<'_>> {
        self.read_frame(self.options.read_timeout)
    }

    /// Block until a frame is available or `timeout` elapses.
    ///
    /// Returns an invalid, empty [`FrameView`] on timeout rather than an
    /// error, so callers can poll. Raises [`ZeroBufferError::WriterDead`] if
    /// the writer is found dead and the ring has no buffered frames left to
    /// deliver.
    pub fn read_frame(&self, timeout: Duration) -> Result<FrameView<'_>> {
        let _enter = self.span.enter();
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                trace!("read_frame timed out");
                return Ok(FrameView::invalid());
            }
            let wait = remaining.min(DEFAULT_LIVENESS_TICK);
            if self.sem_data.wait_timeout(wait).map_err(ZeroBufferError::Io)? {
                let written = self.oieb().payload_written_count.load(Ordering::Acquire);
                let read = self.oieb().payload_read_count.load(Ordering::Acquire);
                if written > read {
                    break;
                }
                // A dropped writer posts sem-data unconditionally to unblock
                // whoever is waiting; with nothing left in the ring this wake
                // is spurious. Fall back to the liveness-checked wait instead
                // of parsing a header that was never written.
                trace!("spurious data-available wake with nothing to read");
            }
            self.check_writer_alive()?;
        }

        loop {
            let read_pos = self.oieb().payload_read_pos.load(Ordering::Acquire);

            if !ring::marker_fits_at(read_pos, self.payload_len) {
                let wasted = self.payload_len - read_pos;
                self.oieb().payload_read_pos.store(0, Ordering::Release);
                self.oieb()
                    .payload_free_bytes
                    .fetch_add(wasted, Ordering::AcqRel);
                trace!(wasted, "traversed unmarked wrap gap");
                continue;
            }

            // SAFETY: `read_pos` is within `[0, payload_len)` by invariant,
            // `marker_fits_at` just confirmed a full header lies within the
            // mapping, and the writer's sem-w post happens-after the header
            // it describes was fully written.
            let header = unsafe { FrameHeader::read_from(self.payload.add(read_pos as usize)) };

            if header.is_wrap_marker() {
                let wasted = self.payload_len - read_pos - FRAME_HEADER_SIZE as u64;
                self.oieb().payload_read_pos.store(0, Ordering::Release);
                self.oieb()
                    .payload_free_bytes
                    .fetch_add(FRAME_HEADER_SIZE as u64 + wasted, Ordering::AcqRel);
                trace!(wasted, "traversed wrap marker");
                continue;
            }

            let total = FRAME_HEADER_SIZE as u64 + header.payload_size;
            let start = read_pos as usize + FRAME_HEADER_SIZE;
            // SAFETY: the writer never commits a frame whose payload crosses
            // the end of the ring without first emitting a wrap marker, so
            // `[start, start + payload_size)` lies entirely within the mapping.
            let data = unsafe {
                std::slice::from_raw_parts(self.payload.add(start), header.payload_size as usize)
            };
            let sequence = header.sequence_number;

            trace!(sequence, len = header.payload_size, "read frame");
            return Ok(FrameView::new(data, sequence, move || {
                self.release_frame(read_pos, total)
            }));
        }
    }

    fn release_frame(&self, read_pos: u64, total: u64) {
        let new_pos = ring::normalize_pos(read_pos + total, self.payload_len);
        self.oieb().payload_read_pos.store(new_pos, Ordering::Release);
        self.oieb()
            .payload_free_bytes
            .fetch_add(total, Ordering::AcqRel);
        self.oieb()
            .payload_read_count
            .fetch_add(1, Ordering::AcqRel);
        self.bytes_read
            .fetch_add(total - FRAME_HEADER_SIZE as u64, Ordering::Relaxed);
        let _ = self.sem_space.post();
    }

    fn check_writer_alive(&self) -> Result<()> {
        let snap = self.oieb().snapshot();
        let ring_empty = snap.payload_written_count == snap.payload_read_count;
        if snap.writer_pid != 0 && ring_empty && !process_alive(snap.writer_pid as u32) {
            error!(pid = snap.writer_pid, "writer process is dead");
            return Err(ZeroBufferError::WriterDead {
                pid: snap.writer_pid as u32,
            });
        }
        Ok(())
    }

    /// A read-only view over the metadata slab's committed bytes. Empty until
    /// the writer calls `set_metadata`.
    pub fn get_metadata(&self) -> &[u8] {
        let written = self.oieb().metadata_written_bytes.load(Ordering::Acquire) as usize;
        debug_assert!(written <= self.metadata_len);
        // SAFETY: `written` never exceeds `metadata_len`, the size of the
        // mapped metadata region, and the writer publishes it with a release
        // store before any reader can observe a nonzero value.
        unsafe { std::slice::from_raw_parts(self.metadata, written) }
    }

    /// Poll until a live writer is attached or `timeout` elapses.
    pub fn is_writer_connected(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pid = self.oieb().writer_pid.load(Ordering::Acquire);
            if pid != 0 && process_alive(pid as u32) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            std::thread::sleep(remaining.min(Duration::from_millis(10)));
        }
    }

    /// Total frames committed by the writer so far, read from the OIEB.
    pub fn frames_written(&self) -> u64 {
        self.oieb().payload_written_count.load(Ordering::Acquire)
    }

    /// Total frames this reader has released.
    pub fn frames_read(&self) -> u64 {
        self.oieb().payload_read_count.load(Ordering::Acquire)
    }

    /// Total payload bytes this reader has released, across all frames.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
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

impl Drop for Reader {
    fn drop(&mut self) {
        let _enter = self.span.enter();
        self.oieb().reader_pid.store(0, Ordering::Release);
        let writer_pid = self.oieb().writer_pid.load(Ordering::Acquire);
        if writer_pid == 0 {
            debug!("last party out, destroying channel resources");
            let _ = Segment::unlink(&self.name);
            let _ = Semaphore::unlink(&self.name, SemaphoreRole::DataAvailable);
            let _ = Semaphore::unlink(&self.name, SemaphoreRole::SpaceAvailable);
        }
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
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
    use serial_test::serial;

    fn unique_name(tag: &str) -> String {
        format!("zb-test-reader-{}-{}-{}", tag, std::process::id(), unsafe {
            libc_clock()
        })
    }

    // Avoids a hard `libc` dependency in a unix-and-windows-shared test; on
    // unix this is just `libc::clock()`, used only to decorrelate parallel
    // test runs' segment names.
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
    fn create_then_drop_destroys_resources_with_no_writer() {
        let name = unique_name("lifecycle");
        let reader = Reader::create(&name, BufferConfig::new(64, 4096), ChannelOptions::default())
            .unwrap();
        assert_eq!(reader.frames_written(), 0);
        assert!(reader.get_metadata().is_empty());
        drop(reader);
        // The segment should be gone: attaching again must succeed as a fresh create.
        let reader2 =
            Reader::create(&name, BufferConfig::new(64, 4096), ChannelOptions::default()).unwrap();
        drop(reader2);
    }

    #[test]
    #[serial]
    fn is_writer_connected_times_out_with_no_writer() {
        let name = unique_name("no-writer");
        let reader = Reader::create(&name, BufferConfig::new(64, 4096), ChannelOptions::default())
            .unwrap();
        assert!(!reader.is_writer_connected(Duration::from_millis(20)));
    }

    #[test]
    #[serial]
    fn read_frame_times_out_on_empty_ring() {
        let name = unique_name("empty-read");
        let reader = Reader::create(&name, BufferConfig::new(64, 4096), ChannelOptions::default())
            .unwrap();
        let view = reader.read_frame(Duration::from_millis(20)).unwrap();
        assert!(!view.is_valid());
    }

    #[test]
    #[serial]
    fn second_reader_on_live_channel_fails_with_already_in_use() {
        let name = unique_name("dup");
        let reader = Reader::create(&name, BufferConfig::new(64, 4096), ChannelOptions::default())
            .unwrap();
        let err =
            Reader::create(&name, BufferConfig::new(64, 4096), ChannelOptions::default())
                .unwrap_err();
        assert!(matches!(err, ZeroBufferError::AlreadyInUse { .. }));
        drop(reader);
    }
}
