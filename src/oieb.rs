//! The Operation Info Exchange Block (OIEB): the fixed 128-byte control header
//! at offset 0 of every channel segment.
//!
//! This is a POD byte image shared between two OS processes, and potentially
//! between two different language runtimes, so its layout is declared with
//! `#[repr(C)]` and never uses Rust-specific packing, alignment tricks, or
//! polymorphism. Fields that only one side ever mutates (`payload_write_pos` by
//! the writer, `payload_read_pos` by the reader, ...) are still declared as
//! atomics so that reads from the *other* process are well-defined; only
//! `payload_free_bytes` is actually updated by both sides.

use std::sync::atomic::{AtomicU64, Ordering};

/// Current OIEB version: requires equal `major` between peers.
pub const CURRENT_VERSION: Version = Version {
    major: 1,
    minor: 0,
    patch: 0,
    reserved: 0,
};

/// `oieb_size` field value for this layout version.
pub const OIEB_SIZE: u32 = 128;

/// `{major, minor, patch, reserved}` version quad.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// Breaking-change version component. Peers require equal major versions.
    pub major: u8,
    /// Feature version component.
    pub minor: u8,
    /// Patch version component.
    pub patch: u8,
    /// Reserved, always zero.
    pub reserved: u8,
}

const _: () = assert!(std::mem::size_of::<Version>() == 4);

/// The 128-byte control block placed at offset 0 of every channel segment.
///
/// Field ownership:
/// - writer-only: `writer_pid`, `payload_write_pos`, `payload_written_count`,
///   `metadata_free_bytes`, `metadata_written_bytes` (metadata is write-once).
/// - reader-only: `reader_pid`, `payload_read_pos`, `payload_read_count`.
/// - shared: `payload_free_bytes`, updated with atomic fetch-add/fetch-sub by
///   both sides, never read-modify-written non-atomically.
#[repr(C)]
pub struct Oieb {
    /// Always [`OIEB_SIZE`] for this layout version.
    pub oieb_size: u32,
    /// `{major, minor, patch, reserved}`.
    pub version: Version,
    /// Metadata slab capacity, in bytes. Immutable after creation.
    pub metadata_size: u64,
    /// Remaining free bytes in the metadata slab.
    pub metadata_free_bytes: AtomicU64,
    /// Bytes committed to the metadata slab; monotonic, zero until
    /// `set_metadata` commits.
    pub metadata_written_bytes: AtomicU64,
    /// Payload ring capacity, in bytes. Immutable after creation.
    pub payload_size: u64,
    /// Bytes currently free in the payload ring. Updated atomically by both
    /// reader and writer.
    pub payload_free_bytes: AtomicU64,
    /// Next byte index the writer will write to (`0 <= pos < payload_size`).
    pub payload_write_pos: AtomicU64,
    /// Next byte index the reader will read from (`0 <= pos < payload_size`).
    pub payload_read_pos: AtomicU64,
    /// Monotonic count of frames committed by the writer.
    pub payload_written_count: AtomicU64,
    /// Monotonic count of frames released by the reader.
    pub payload_read_count: AtomicU64,
    /// OS PID of the current writer, or 0 if none attached.
    pub writer_pid: AtomicU64,
    /// OS PID of the current reader, or 0 if none attached.
    pub reader_pid: AtomicU64,
    /// Reserved for future use; always zero.
    pub reserved: [u64; 4],
}

const _: () = assert!(std::mem::size_of::<Oieb>() == OIEB_SIZE as usize);
const _: () = assert!(std::mem::align_of::<Oieb>() <= 8);

impl Oieb {
    /// Initialize a freshly zero-filled segment's OIEB in place.
    ///
    /// # Safety
    /// `ptr` must point to at least [`OIEB_SIZE`] bytes of writable, properly
    /// aligned memory that is not concurrently observed by any other party yet
    /// (i.e. this runs before the segment name is published).
    pub unsafe fn init_at(ptr: *mut Oieb, metadata_size: u64, payload_size: u64, reader_pid: u32) {
        ptr.write(Oieb {
            oieb_size: OIEB_SIZE,
            version: CURRENT_VERSION,
            metadata_size,
            metadata_free_bytes: AtomicU64::new(metadata_size),
            metadata_written_bytes: AtomicU64::new(0),
            payload_size,
            payload_free_bytes: AtomicU64::new(payload_size),
            payload_write_pos: AtomicU64::new(0),
            payload_read_pos: AtomicU64::new(0),
            payload_written_count: AtomicU64::new(0),
            payload_read_count: AtomicU64::new(0),
            writer_pid: AtomicU64::new(0),
            reader_pid: AtomicU64::new(u64::from(reader_pid)),
            reserved: [0; 4],
        });
    }

    /// Cheap `Copy` snapshot of the OIEB for diagnostics and tests.
    pub fn snapshot(&self) -> OiebSnapshot {
        OiebSnapshot {
            oieb_size: self.oieb_size,
            version: self.version,
            metadata_size: self.metadata_size,
            metadata_free_bytes: self.metadata_free_bytes.load(Ordering::Acquire),
            metadata_written_bytes: self.metadata_written_bytes.load(Ordering::Acquire),
            payload_size: self.payload_size,
            payload_free_bytes: self.payload_free_bytes.load(Ordering::Acquire),
            payload_write_pos: self.payload_write_pos.load(Ordering::Acquire),
            payload_read_pos: self.payload_read_pos.load(Ordering::Acquire),
            payload_written_count: self.payload_written_count.load(Ordering::Acquire),
            payload_read_count: self.payload_read_count.load(Ordering::Acquire),
            writer_pid: self.writer_pid.load(Ordering::Acquire),
            reader_pid: self.reader_pid.load(Ordering::Acquire),
        }
    }
}

/// A point-in-time, owned copy of the OIEB's fields, returned by
/// [`Reader::oieb_snapshot`](crate::reader::Reader::oieb_snapshot) and
/// [`Writer::oieb_snapshot`](crate::writer::Writer::oieb_snapshot) for
/// diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OiebSnapshot {
    /// See [`Oieb::oieb_size`].
    pub oieb_size: u32,
    /// See [`Oieb::version`].
    pub version: Version,
    /// See [`Oieb::metadata_size`].
    pub metadata_size: u64,
    /// See [`Oieb::metadata_free_bytes`].
    pub metadata_free_bytes: u64,
    /// See [`Oieb::metadata_written_bytes`].
    pub metadata_written_bytes: u64,
    /// See [`Oieb::payload_size`].
    pub payload_size: u64,
    /// See [`Oieb::payload_free_bytes`].
    pub payload_free_bytes: u64,
    /// See [`Oieb::payload_write_pos`].
    pub payload_write_pos: u64,
    /// See [`Oieb::payload_read_pos`].
    pub payload_read_pos: u64,
    /// See [`Oieb::payload_written_count`].
    pub payload_written_count: u64,
    /// See [`Oieb::payload_read_count`].
    pub payload_read_count: u64,
    /// See [`Oieb::writer_pid`].
    pub writer_pid: u64,
    /// See [`Oieb::reader_pid`].
    pub reader_pid: u64,
}

impl OiebSnapshot {
    /// `written_count == read_count` iff the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.payload_written_count == self.payload_read_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_exactly_128_bytes() {
        assert_eq!(std::mem::size_of::<Oieb>(), 128);
    }

    #[test]
    fn field_offsets_match_declared_order() {
        let base = std::mem::MaybeUninit::<Oieb>::uninit();
        let ptr = base.as_ptr();
        macro_rules! offset_of {
            ($field:ident) => {
                unsafe { (std::ptr::addr_of!((*ptr).$field) as usize) - (ptr as usize) }
            };
        }
        assert_eq!(offset_of!(oieb_size), 0);
        assert_eq!(offset_of!(version), 4);
        assert_eq!(offset_of!(metadata_size), 8);
        assert_eq!(offset_of!(metadata_free_bytes), 16);
        assert_eq!(offset_of!(metadata_written_bytes), 24);
        assert_eq!(offset_of!(payload_size), 32);
        assert_eq!(offset_of!(payload_free_bytes), 40);
        assert_eq!(offset_of!(payload_write_pos), 48);
        assert_eq!(offset_of!(payload_read_pos), 56);
        assert_eq!(offset_of!(payload_written_count), 64);
        assert_eq!(offset_of!(payload_read_count), 72);
        assert_eq!(offset_of!(writer_pid), 80);
        assert_eq!(offset_of!(reader_pid), 88);
        assert_eq!(offset_of!(reserved), 96);
    }

    #[test]
    fn init_at_sets_expected_defaults() {
        let mut buf = vec![0xAAu8; OIEB_SIZE as usize];
        let ptr = buf.as_mut_ptr() as *mut Oieb;
        unsafe { Oieb::init_at(ptr, 1024, 4096, 42) };
        let oieb = unsafe { &*ptr };
        let snap = oieb.snapshot();
        assert_eq!(snap.oieb_size, OIEB_SIZE);
        assert_eq!(snap.metadata_size, 1024);
        assert_eq!(snap.metadata_free_bytes, 1024);
        assert_eq!(snap.payload_size, 4096);
        assert_eq!(snap.payload_free_bytes, 4096);
        assert_eq!(snap.reader_pid, 42);
        assert_eq!(snap.writer_pid, 0);
        assert!(snap.is_empty());
    }
}
