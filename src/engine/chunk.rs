//! Chunk header layout and the pointer-arithmetic abstraction around it.
//!
//! Every byte the allocator controls belongs to exactly one chunk: a header
//! immediately followed by its payload. All raw pointer arithmetic in the
//! allocator is confined to this module; the rest of the engine works with
//! [`Chunk`] handles instead of addresses.

use core::mem::size_of;
use core::ptr::NonNull;

/// Payload sizes (and chunk addresses) are always a multiple of this many
/// bytes. A power of two, at least as wide as a pointer.
pub(crate) const ALIGNMENT: usize = size_of::<usize>();

const FLAG_FREE: u8 = 0b01;
const FLAG_IN_INDEX: u8 = 0b10;

/// The metadata that precedes every chunk's payload.
///
/// Headers are intrusive: the chunk heap and the free index both link
/// through the same header rather than through separate node allocations
/// (there are no node allocations; the allocator never allocates from
/// itself).
#[repr(C)]
pub(crate) struct ChunkHeader {
    prev: *mut ChunkHeader,
    next: *mut ChunkHeader,
    next_in_bucket: *mut ChunkHeader,
    payload_size: usize,
    flags: u8,
}

/// Size in bytes of a [`ChunkHeader`]; also the fixed offset between a
/// chunk's address and its payload's address.
pub(crate) const HEADER_SIZE: usize = size_of::<ChunkHeader>();

/// Rounds `n` up to the nearest multiple of [`ALIGNMENT`].
pub(crate) fn round_up(n: usize) -> usize {
    (n + ALIGNMENT - 1) / ALIGNMENT * ALIGNMENT
}

/// A handle to a live chunk, i.e. a non-null pointer to its header.
///
/// This is the "chunk view" abstraction: every unsafe dereference of chunk
/// memory happens behind one of these methods, so callers never see a raw
/// `*mut ChunkHeader`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Chunk(NonNull<ChunkHeader>);

impl Chunk {
    /// Wraps a raw header pointer, or returns `None` if it is null.
    ///
    /// # Safety
    /// If non-null, `ptr` must point at a live, properly initialized
    /// `ChunkHeader`.
    unsafe fn from_header_ptr(ptr: *mut ChunkHeader) -> Option<Self> {
        NonNull::new(ptr).map(Chunk)
    }

    /// Same as [`Chunk::from_header_ptr`], exposed to sibling modules (the
    /// free index stores raw bucket-head pointers and needs to rebuild
    /// handles from them).
    ///
    /// # Safety
    /// See `from_header_ptr`.
    pub(crate) unsafe fn from_raw(ptr: *mut ChunkHeader) -> Option<Self> {
        // SAFETY: forwarded to the caller's contract.
        unsafe { Chunk::from_header_ptr(ptr) }
    }

    /// Recovers the chunk owning a payload pointer previously handed out by
    /// this allocator.
    ///
    /// # Safety
    /// `ptr` must be a non-null payload address previously returned by this
    /// allocator and not yet invalidated by a later operation on it.
    pub(crate) unsafe fn from_payload_ptr(ptr: *mut u8) -> Self {
        // SAFETY: the payload always immediately follows the header, so
        // stepping back `HEADER_SIZE` bytes recovers it; the caller
        // guarantees `ptr` actually originated from this allocator.
        let header = unsafe { ptr.sub(HEADER_SIZE).cast::<ChunkHeader>() };
        // SAFETY: `ptr` is non-null by caller contract, so `header` is too.
        Chunk(unsafe { NonNull::new_unchecked(header) })
    }

    pub(crate) fn header_ptr(self) -> *mut ChunkHeader {
        self.0.as_ptr()
    }

    fn header(self) -> &'static mut ChunkHeader {
        // SAFETY: chunk handles are only created from live headers, and
        // every access to the heap happens with the allocator-wide mutex
        // held, so this is the only live reference to this header.
        unsafe { &mut *self.0.as_ptr() }
    }

    pub(crate) fn payload_ptr(self) -> *mut u8 {
        // SAFETY: the payload immediately follows the header by construction.
        unsafe { self.header_ptr().cast::<u8>().add(HEADER_SIZE) }
    }

    pub(crate) fn payload_size(self) -> usize {
        self.header().payload_size
    }

    pub(crate) fn set_payload_size(self, size: usize) {
        debug_assert!(size >= ALIGNMENT, "a chunk's payload size must never be zero");
        self.header().payload_size = size;
    }

    /// Total bytes this chunk occupies in the heap, header included.
    pub(crate) fn total_size(self) -> usize {
        HEADER_SIZE + self.payload_size()
    }

    pub(crate) fn is_free(self) -> bool {
        self.header().flags & FLAG_FREE != 0
    }

    pub(crate) fn set_free(self, free: bool) {
        let header = self.header();
        if free {
            header.flags |= FLAG_FREE;
        } else {
            header.flags &= !FLAG_FREE;
        }
    }

    pub(crate) fn is_indexed(self) -> bool {
        self.header().flags & FLAG_IN_INDEX != 0
    }

    pub(crate) fn set_indexed(self, indexed: bool) {
        let header = self.header();
        if indexed {
            header.flags |= FLAG_IN_INDEX;
        } else {
            header.flags &= !FLAG_IN_INDEX;
        }
    }

    pub(crate) fn prev(self) -> Option<Chunk> {
        // SAFETY: `prev` is either null or was set from a live chunk handle.
        unsafe { Chunk::from_header_ptr(self.header().prev) }
    }

    pub(crate) fn next(self) -> Option<Chunk> {
        // SAFETY: `next` is either null or was set from a live chunk handle.
        unsafe { Chunk::from_header_ptr(self.header().next) }
    }

    pub(crate) fn set_prev(self, prev: Option<Chunk>) {
        self.header().prev = prev.map_or(core::ptr::null_mut(), Chunk::header_ptr);
    }

    pub(crate) fn set_next(self, next: Option<Chunk>) {
        self.header().next = next.map_or(core::ptr::null_mut(), Chunk::header_ptr);
    }

    pub(crate) fn next_in_bucket(self) -> Option<Chunk> {
        // SAFETY: `next_in_bucket` is either null or was set from a live
        // chunk handle by the free index.
        unsafe { Chunk::from_header_ptr(self.header().next_in_bucket) }
    }

    pub(crate) fn set_next_in_bucket(self, next: Option<Chunk>) {
        self.header().next_in_bucket = next.map_or(core::ptr::null_mut(), Chunk::header_ptr);
    }

    /// Writes a fresh header at `ptr`, covering `payload_size` bytes of
    /// payload, and returns a handle to it. The new chunk starts out free,
    /// unindexed, and unlinked (`prev`/`next`/`next_in_bucket` all null);
    /// callers are responsible for linking it into the heap.
    ///
    /// # Safety
    /// `ptr` must be valid for writes of `HEADER_SIZE` bytes, must be
    /// properly aligned for `ChunkHeader`, and `payload_size` bytes
    /// starting immediately after it must belong to this allocator.
    pub(crate) unsafe fn init(ptr: *mut ChunkHeader, payload_size: usize) -> Chunk {
        debug_assert!(payload_size >= ALIGNMENT);
        debug_assert!(payload_size % ALIGNMENT == 0);
        // SAFETY: caller guarantees `ptr` is valid for a `ChunkHeader` write.
        unsafe {
            ptr.write(ChunkHeader {
                prev: core::ptr::null_mut(),
                next: core::ptr::null_mut(),
                next_in_bucket: core::ptr::null_mut(),
                payload_size,
                flags: FLAG_FREE,
            });
        }
        // SAFETY: `ptr` was just written to and is non-null (caller
        // contract forbids a null write target).
        Chunk(unsafe { NonNull::new_unchecked(ptr) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Buf([u8; 256]);

    fn buf() -> Buf {
        Buf([0; 256])
    }

    #[test]
    fn header_size_is_word_aligned() {
        assert_eq!(HEADER_SIZE % ALIGNMENT, 0);
        assert!(HEADER_SIZE >= ALIGNMENT);
    }

    #[test]
    fn round_up_rounds_to_alignment() {
        assert_eq!(round_up(0), 0);
        assert_eq!(round_up(1), ALIGNMENT);
        assert_eq!(round_up(ALIGNMENT), ALIGNMENT);
        assert_eq!(round_up(ALIGNMENT + 1), 2 * ALIGNMENT);
    }

    #[test]
    fn init_sets_free_unindexed_unlinked() {
        let mut b = buf();
        let ptr = b.0.as_mut_ptr().cast::<ChunkHeader>();
        let c = unsafe { Chunk::init(ptr, 64) };
        assert!(c.is_free());
        assert!(!c.is_indexed());
        assert!(c.prev().is_none());
        assert!(c.next().is_none());
        assert_eq!(c.payload_size(), 64);
        assert_eq!(c.total_size(), HEADER_SIZE + 64);
    }

    #[test]
    fn flags_round_trip() {
        let mut b = buf();
        let ptr = b.0.as_mut_ptr().cast::<ChunkHeader>();
        let c = unsafe { Chunk::init(ptr, 32) };
        c.set_free(false);
        assert!(!c.is_free());
        c.set_indexed(true);
        assert!(c.is_indexed());
        c.set_indexed(false);
        assert!(!c.is_indexed());
    }

    #[test]
    fn payload_ptr_follows_header() {
        let mut b = buf();
        let ptr = b.0.as_mut_ptr().cast::<ChunkHeader>();
        let c = unsafe { Chunk::init(ptr, 32) };
        let payload = c.payload_ptr();
        assert_eq!(payload as usize, ptr as usize + HEADER_SIZE);
        assert_eq!(unsafe { Chunk::from_payload_ptr(payload) }, c);
    }

    #[test]
    fn linking_round_trips() {
        let mut b1 = buf();
        let mut b2 = buf();
        let c1 = unsafe { Chunk::init(b1.0.as_mut_ptr().cast(), 32) };
        let c2 = unsafe { Chunk::init(b2.0.as_mut_ptr().cast(), 32) };
        c1.set_next(Some(c2));
        c2.set_prev(Some(c1));
        assert_eq!(c1.next(), Some(c2));
        assert_eq!(c2.prev(), Some(c1));
        assert!(c1.prev().is_none());
        assert!(c2.next().is_none());
    }
}
