//! The 16-byte frame header and the move-only [`FrameView`] handle returned by
//! [`Reader::read_frame`].
//!
//! [`Reader::read_frame`]: crate::reader::Reader::read_frame

use std::sync::atomic::{AtomicU64, Ordering};

/// Header that precedes every frame's payload bytes in the ring.
///
/// `payload_size == 0` marks a wrap marker: the reader must jump
/// `payload_read_pos` to 0 and re-read the header there instead of treating this
/// as a zero-length frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Length of the payload that follows, or 0 for a wrap marker.
    pub payload_size: u64,
    /// Monotonic sequence number assigned by the writer, starting at 1. Zero
    /// for wrap markers (not user-visible).
    pub sequence_number: u64,
}

/// Size in bytes of [`FrameHeader`] on the wire.
pub const FRAME_HEADER_SIZE: usize = 16;

const _: () = assert!(std::mem::size_of::<FrameHeader>() == FRAME_HEADER_SIZE);

impl FrameHeader {
    /// A zero-payload wrap marker.
    pub const WRAP_MARKER: FrameHeader = FrameHeader {
        payload_size: 0,
        sequence_number: 0,
    };

    /// True if this header marks a ring wrap rather than a real frame.
    pub fn is_wrap_marker(&self) -> bool {
        self.payload_size == 0
    }

    /// Read a header from raw bytes at `ptr`, using an acquire load on the
    /// length field so that a subsequent payload read is ordered after the
    /// writer's release store.
    ///
    /// # Safety
    /// `ptr` must point to at least [`FRAME_HEADER_SIZE`] readable, properly
    /// aligned bytes.
    pub unsafe fn read_from(ptr: *const u8) -> FrameHeader {
        let len_ptr = ptr as *const AtomicU64;
        let seq_ptr = ptr.add(8) as *const AtomicU64;
        FrameHeader {
            payload_size: (*len_ptr).load(Ordering::Acquire),
            sequence_number: (*seq_ptr).load(Ordering::Acquire),
        }
    }

    /// Write this header to raw bytes at `ptr` with a release store on the
    /// length field, publishing it (together with the payload bytes written
    /// before it) to any reader that subsequently waits on sem-w.
    ///
    /// # Safety
    /// `ptr` must point to at least [`FRAME_HEADER_SIZE`] writable, properly
    /// aligned bytes.
    pub unsafe fn write_to(&self, ptr: *mut u8) {
        let seq_ptr = ptr.add(8) as *const AtomicU64;
        (*seq_ptr).store(self.sequence_number, Ordering::Relaxed);
        let len_ptr = ptr as *const AtomicU64;
        (*len_ptr).store(self.payload_size, Ordering::Release);
    }
}

/// A borrowed view of one frame's payload bytes inside the ring.
///
/// `FrameView` is move-only and exclusively owned by whoever holds it. Dropping
/// it — on any exit path, including a panic unwind — reclaims the ring space it
/// occupied and posts the space-available semaphore, via the `release` closure
/// captured at construction. This mirrors the `Loaned<T>`-style RAII guard used
/// by this crate's buffer pool ancestor: a linear value whose destructor is the
/// only way back to the shared resource.
pub struct FrameView<'a> {
    data: &'a [u8],
    sequence: u64,
    release: Option<Box<dyn FnOnce() + 'a>>,
}

impl<'a> FrameView<'a> {
    /// Construct a view over `data` tagged with `sequence`, whose drop invokes
    /// `release` exactly once.
    pub(crate) fn new(
        data: &'a [u8],
        sequence: u64,
        release: impl FnOnce() + 'a,
    ) -> Self {
        Self {
            data,
            sequence,
            release: Some(Box::new(release)),
        }
    }

    /// An invalid/empty view, returned by `read_frame` on timeout. Reading its
    /// bytes yields an empty slice; dropping it is a no-op.
    pub(crate) fn invalid() -> Self {
        Self {
            data: &[],
            sequence: 0,
            release: None,
        }
    }

    /// True if this view represents a real frame (as opposed to a
    /// timed-out/invalid read).
    pub fn is_valid(&self) -> bool {
        self.release.is_some()
    }

    /// The frame's payload bytes.
    pub fn data(&self) -> &[u8] {
        self.data
    }

    /// The frame's length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the frame carries no payload bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The sequence number the writer assigned to this frame. Meaningless
    /// (zero) on an invalid view.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Explicitly release the frame's ring space now rather than waiting for
    /// drop. Equivalent to `drop(view)`, offered for callers that want the
    /// release to be visible at a specific point in their control flow.
    pub fn release(self) {
        // Consuming `self` here runs `Drop::drop`, which performs the release.
    }
}

impl Drop for FrameView<'_> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for FrameView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameView")
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn header_round_trips_through_raw_bytes() {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        let hdr = FrameHeader {
            payload_size: 42,
            sequence_number: 7,
        };
        unsafe {
            hdr.write_to(buf.as_mut_ptr());
            let read_back = FrameHeader::read_from(buf.as_ptr());
            assert_eq!(read_back.payload_size, 42);
            assert_eq!(read_back.sequence_number, 7);
        }
    }

    #[test]
    fn wrap_marker_has_zero_payload_size() {
        assert!(FrameHeader::WRAP_MARKER.is_wrap_marker());
        let real = FrameHeader {
            payload_size: 1,
            sequence_number: 1,
        };
        assert!(!real.is_wrap_marker());
    }

    #[test]
    fn drop_invokes_release_exactly_once() {
        let released = Cell::new(0);
        {
            let data = [1u8, 2, 3];
            let view = FrameView::new(&data, 1, || released.set(released.get() + 1));
            assert_eq!(view.data(), &[1, 2, 3]);
            assert_eq!(view.sequence(), 1);
        }
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn explicit_release_does_not_double_release() {
        let released = Cell::new(0);
        let data = [1u8];
        let view = FrameView::new(&data, 1, || released.set(released.get() + 1));
        view.release();
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn invalid_view_release_is_a_no_op() {
        let released = Cell::new(0);
        {
            let view = FrameView::invalid();
            assert!(!view.is_valid());
            assert!(view.is_empty());
            let _ = &released;
        }
        assert_eq!(released.get(), 0);
    }
}
