//! The free index: a size-keyed exact-fit cache of free chunks.
//!
//! This is deliberately not a general best-fit structure. It trades tail
//! memory (one bucket head per possible payload size up to
//! [`COARSE_BLOCK`]) for O(1) same-size reuse, which dominates realistic
//! workloads. Anything the index can't place (because it's too large, or
//! the index hasn't seen it yet) is still found by the chunk-heap linear
//! scan in [`super::Heap::allocate`].

use super::chunk::{Chunk, ChunkHeader, ALIGNMENT};
use super::segment::COARSE_BLOCK;

/// Number of distinct size buckets the index can track: one per possible
/// exact payload size up to a full coarse block.
pub(crate) const CAPACITY: usize = COARSE_BLOCK / ALIGNMENT;

/// Maps a payload size to its bucket index, or `None` if the size is too
/// large to be tracked (such chunks stay in the heap, unindexed, and are
/// only ever found by the linear scan).
fn bucket_index(payload_size: usize) -> Option<usize> {
    debug_assert!(payload_size >= ALIGNMENT);
    debug_assert!(
        payload_size % ALIGNMENT == 0,
        "chunk sizes are always alignment multiples"
    );
    let index = payload_size / ALIGNMENT - 1;
    if index < CAPACITY {
        Some(index)
    } else {
        None
    }
}

/// A fixed-capacity array of bucket heads, each chaining chunks of one
/// exact payload size through `next_in_bucket`. Chains are unordered.
///
/// The array lives inline in the enclosing [`super::Heap`] (itself a
/// `static`), never on this allocator's own heap. The allocator must never
/// allocate from itself.
pub(crate) struct FreeIndex {
    buckets: [*mut ChunkHeader; CAPACITY],
    free_bytes: usize,
}

impl FreeIndex {
    pub(crate) const fn new() -> Self {
        Self {
            buckets: [core::ptr::null_mut(); CAPACITY],
            free_bytes: 0,
        }
    }

    /// Sum of payload sizes of every chunk currently indexed.
    pub(crate) fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    /// Inserts `c` into its bucket. No-op if `c` is already indexed, or if
    /// its payload size has no bucket (too large).
    pub(crate) fn insert(&mut self, c: Chunk) {
        if c.is_indexed() {
            return;
        }
        let Some(index) = bucket_index(c.payload_size()) else {
            return;
        };
        // SAFETY: the array access below stays within `buckets` because
        // `bucket_index` only returns indices `< CAPACITY`.
        let head = self.buckets[index];
        c.set_next_in_bucket(unsafe { chunk_from_raw(head) });
        self.buckets[index] = c.header_ptr();
        c.set_indexed(true);
        self.free_bytes += c.payload_size();
    }

    /// Removes `c` from its bucket. Idempotent: a no-op if `c` is not
    /// currently indexed (this is relied upon by the coalescer, which may
    /// call remove on a chunk that was never inserted, see §9 of the
    /// design notes).
    pub(crate) fn remove(&mut self, c: Chunk) {
        if !c.is_indexed() {
            return;
        }
        let Some(index) = bucket_index(c.payload_size()) else {
            return;
        };

        let mut cursor = unsafe { chunk_from_raw(self.buckets[index]) };
        let mut prev: Option<Chunk> = None;
        while let Some(node) = cursor {
            if node == c {
                let successor = node.next_in_bucket();
                match prev {
                    Some(p) => p.set_next_in_bucket(successor),
                    None => {
                        self.buckets[index] =
                            successor.map_or(core::ptr::null_mut(), Chunk::header_ptr)
                    }
                }
                break;
            }
            prev = Some(node);
            cursor = node.next_in_bucket();
        }

        c.set_indexed(false);
        c.set_next_in_bucket(None);
        self.free_bytes -= c.payload_size();
    }

    /// Returns and detaches the bucket head for an exact `size`, if any.
    /// Does not search larger buckets; the index is an exact-fit cache.
    pub(crate) fn take(&mut self, size: usize) -> Option<Chunk> {
        let index = bucket_index(size)?;
        let head = unsafe { chunk_from_raw(self.buckets[index]) }?;
        self.buckets[index] = head
            .next_in_bucket()
            .map_or(core::ptr::null_mut(), Chunk::header_ptr);
        head.set_indexed(false);
        head.set_next_in_bucket(None);
        self.free_bytes -= head.payload_size();
        Some(head)
    }
}

/// # Safety
/// `ptr` must be null or point at a live, initialized `ChunkHeader`.
unsafe fn chunk_from_raw(ptr: *mut ChunkHeader) -> Option<Chunk> {
    // SAFETY: forwarded to the caller's contract.
    unsafe { Chunk::from_raw(ptr) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::MaybeUninit;

    fn new_chunk(storage: &mut [MaybeUninit<u8>], payload_size: usize) -> Chunk {
        let ptr = storage.as_mut_ptr().cast::<ChunkHeader>();
        unsafe { Chunk::init(ptr, payload_size) }
    }

    #[test]
    fn bucket_index_math() {
        assert_eq!(bucket_index(ALIGNMENT), Some(0));
        assert_eq!(bucket_index(2 * ALIGNMENT), Some(1));
        assert_eq!(bucket_index(CAPACITY * ALIGNMENT), Some(CAPACITY - 1));
        assert_eq!(bucket_index((CAPACITY + 1) * ALIGNMENT), None);
    }

    #[test]
    fn insert_take_round_trip() {
        let mut storage = [MaybeUninit::<u8>::uninit(); 64];
        let c = new_chunk(&mut storage, 32);
        let mut index = FreeIndex::new();

        index.insert(c);
        assert!(c.is_indexed());
        assert_eq!(index.free_bytes(), 32);

        let taken = index.take(32).unwrap();
        assert_eq!(taken, c);
        assert!(!taken.is_indexed());
        assert_eq!(index.free_bytes(), 0);
        assert!(index.take(32).is_none());
    }

    #[test]
    fn insert_is_idempotent() {
        let mut storage = [MaybeUninit::<u8>::uninit(); 64];
        let c = new_chunk(&mut storage, 32);
        let mut index = FreeIndex::new();
        index.insert(c);
        index.insert(c);
        assert_eq!(index.free_bytes(), 32);
    }

    #[test]
    fn remove_is_idempotent_when_absent() {
        let mut storage = [MaybeUninit::<u8>::uninit(); 64];
        let c = new_chunk(&mut storage, 32);
        let mut index = FreeIndex::new();
        index.remove(c); // never inserted
        assert_eq!(index.free_bytes(), 0);
        assert!(!c.is_indexed());
    }

    #[test]
    fn remove_unlinks_from_middle_of_chain() {
        let mut s1 = [MaybeUninit::<u8>::uninit(); 64];
        let mut s2 = [MaybeUninit::<u8>::uninit(); 64];
        let mut s3 = [MaybeUninit::<u8>::uninit(); 64];
        let c1 = new_chunk(&mut s1, 16);
        let c2 = new_chunk(&mut s2, 16);
        let c3 = new_chunk(&mut s3, 16);

        let mut index = FreeIndex::new();
        index.insert(c1);
        index.insert(c2);
        index.insert(c3);
        assert_eq!(index.free_bytes(), 48);

        index.remove(c2);
        assert!(!c2.is_indexed());
        assert_eq!(index.free_bytes(), 32);

        // c1 and c3 (inserted before/after c2) must still both be reachable.
        let first = index.take(16).unwrap();
        let second = index.take(16).unwrap();
        assert!((first == c1 && second == c3) || (first == c3 && second == c1));
        assert!(index.take(16).is_none());
    }

    #[test]
    fn oversized_payload_is_silently_unindexed() {
        let huge_size = (CAPACITY + 1) * ALIGNMENT;
        // Build a header in a boxed buffer large enough to hold the claimed
        // payload region (never actually touched by this test).
        let mut storage = vec![0u8; core::mem::size_of::<ChunkHeader>()].into_boxed_slice();
        let ptr = storage.as_mut_ptr().cast::<ChunkHeader>();
        let c = unsafe { Chunk::init(ptr, huge_size) };

        let mut index = FreeIndex::new();
        index.insert(c);
        assert!(!c.is_indexed(), "oversized chunks must not be indexed");
        assert_eq!(index.free_bytes(), 0);
    }
}
