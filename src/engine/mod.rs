//! The allocator core: a doubly linked heap of chunks, a size-indexed free
//! cache, and the splitting/coalescing/segment-growth rules that keep them
//! consistent.
//!
//! Everything in this module is free of heap allocation. The allocator
//! must never call back into itself (see the crate-level reentrancy note).
//! The only state is inline arrays and raw intrusive pointers, all confined
//! behind the [`chunk::Chunk`] view.

mod chunk;
mod free_index;
mod segment;

pub(crate) use chunk::ALIGNMENT;
pub(crate) use segment::SystemBreak;
#[cfg(test)]
pub(crate) use segment::FixedBreak;

use chunk::{round_up, Chunk, HEADER_SIZE};
use free_index::FreeIndex;
use segment::{Segment, COARSE_BLOCK};

/// Why an allocating operation failed. Kept internal and distinct from the
/// public C ABI (§6), which always communicates failure as a null pointer
/// regardless of cause. This enum exists so the core stays `Result`-typed
/// and free of `unwrap`/`expect` outside tests, per the crate's ambient
/// error-handling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocError {
    /// The break primitive refused to grow the segment far enough.
    OutOfMemory,
    /// A `zeroed_allocate` element-count/size product would overflow.
    Overflow,
}

/// The allocator core, generic over the break primitive so production code
/// (over `sbrk`) and tests (over a fixed in-process buffer) share one
/// implementation.
pub(crate) struct Heap<B> {
    head: Option<Chunk>,
    tail: Option<Chunk>,
    free_index: FreeIndex,
    segment: Segment<B>,
}

// SAFETY: a `Heap` is only ever reached through the enclosing
// `spin::Mutex`, which grants exclusive access to at most one thread at a
// time; the raw intrusive pointers it contains are never read across
// threads without that lock held.
unsafe impl<B: Send> Send for Heap<B> {}

impl<B> Heap<B> {
    pub(crate) const fn new(source: B) -> Self {
        Self {
            head: None,
            tail: None,
            free_index: FreeIndex::new(),
            segment: Segment::new(source),
        }
    }
}

impl<B: segment::BreakSource> Heap<B> {
    /// Allocates `n` bytes. `n == 0` is treated as one alignment unit.
    /// Returns `Err(AllocError::OutOfMemory)` (and logs at `debug!`) if the
    /// segment cannot grow far enough to satisfy the request.
    pub(crate) fn allocate(&mut self, n: usize) -> Result<*mut u8, AllocError> {
        let n = round_up(if n == 0 { ALIGNMENT } else { n });
        self.allocate_exact(n)
    }

    /// `k * s` bytes, zeroed. Rejects (before touching the segment) if the
    /// product would overflow.
    pub(crate) fn zeroed_allocate(&mut self, k: usize, s: usize) -> Result<*mut u8, AllocError> {
        if s > 0 && k > usize::MAX / s {
            log::debug!("breakalloc: calloc({k}, {s}) would overflow, rejected");
            return Err(AllocError::Overflow);
        }
        let ptr = self.allocate(k * s)?;
        let c = unsafe { Chunk::from_payload_ptr(ptr) };
        // SAFETY: `ptr` is a freshly allocated payload of `c.payload_size()`
        // writable bytes (which may exceed the logical request, the whole
        // chunk is zeroed, per §4.5).
        unsafe { core::ptr::write_bytes(ptr, 0, c.payload_size()) };
        Ok(ptr)
    }

    /// Resizes the allocation at `p` to `n` bytes. `p == null` behaves as
    /// `allocate(n)`; `n == 0` frees `p` and returns a minimum-size
    /// allocation. On failure, `p` is left untouched.
    pub(crate) fn reallocate(&mut self, p: *mut u8, n: usize) -> Result<*mut u8, AllocError> {
        if p.is_null() {
            return self.allocate(n);
        }
        if n == 0 {
            self.release(p);
            return self.allocate(ALIGNMENT);
        }

        let n = round_up(n);
        let c = unsafe { Chunk::from_payload_ptr(p) };
        if c.payload_size() == n {
            return Ok(p);
        }

        let new_ptr = self.allocate(n)?;
        let copy_size = c.payload_size().min(n);
        // SAFETY: `p` and `new_ptr` are distinct live chunks' payloads, each
        // large enough for `copy_size` bytes.
        unsafe { core::ptr::copy_nonoverlapping(p, new_ptr, copy_size) };
        self.release(p);
        Ok(new_ptr)
    }

    /// Releases a pointer previously returned by this allocator. `null` and
    /// an already-free pointer are both silent no-ops.
    pub(crate) fn release(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            log::trace!("breakalloc: free(null) ignored");
            return;
        }
        // SAFETY: caller contract, `ptr` was returned by this allocator.
        let c = unsafe { Chunk::from_payload_ptr(ptr) };
        if c.is_free() {
            log::debug!("breakalloc: double free ignored");
            return;
        }
        c.set_free(true);

        let merged = if let Some(prev) = c.prev().filter(|p| p.is_free()) {
            self.coalesce_from(prev)
        } else if c.next().is_some_and(|n| n.is_free()) {
            self.coalesce_from(c)
        } else {
            c
        };
        self.free_index.insert(merged);

        self.tail_trim();
    }

    /// Allocates an already-rounded, non-zero payload size: the fast path
    /// (exact-fit free-index hit), the slow path (tail-to-head scan,
    /// opportunistically re-indexing skipped free chunks), and, failing
    /// both, a segment growth followed by a restart.
    fn allocate_exact(&mut self, n: usize) -> Result<*mut u8, AllocError> {
        loop {
            if let Some(c) = self.free_index.take(n) {
                c.set_free(false);
                return Ok(c.payload_ptr());
            }

            let mut cursor = self.tail;
            let mut found = None;
            while let Some(c) = cursor {
                if c.is_free() {
                    if c.payload_size() >= n {
                        found = Some(c);
                        break;
                    }
                    self.free_index.insert(c);
                }
                cursor = c.prev();
            }

            if let Some(c) = found {
                self.free_index.remove(c);
                self.split(c, n);
                c.set_free(false);
                return Ok(c.payload_ptr());
            }

            self.grow_for(n)?;
            // Growth succeeded: restart from the fast path.
        }
    }

    /// Splits a free chunk `c` (payload size `>= requested`, not currently
    /// indexed) into a used chunk of exactly `requested` bytes and, if
    /// there's enough slack, a free remainder inserted into the index.
    fn split(&mut self, c: Chunk, requested: usize) {
        debug_assert!(!c.is_indexed());
        debug_assert!(c.payload_size() >= requested);

        let total_payload = c.payload_size();
        if total_payload > HEADER_SIZE + requested {
            let remainder_payload = total_payload - requested - HEADER_SIZE;
            // SAFETY: the remainder sits entirely inside `c`'s own payload
            // region, `requested` bytes past its start.
            let remainder_ptr =
                unsafe { c.payload_ptr().add(requested).cast::<chunk::ChunkHeader>() };
            let remainder = unsafe { chunk::Chunk::init(remainder_ptr, remainder_payload) };

            remainder.set_prev(Some(c));
            remainder.set_next(c.next());
            match c.next() {
                Some(next) => next.set_prev(Some(remainder)),
                None => self.tail = Some(remainder),
            }
            c.set_next(Some(remainder));

            self.free_index.insert(remainder);
            c.set_payload_size(requested);
        }
    }

    /// Runs the coalescer starting at `start`: walks forward absorbing
    /// every contiguous free chunk until hitting a non-free chunk or the
    /// end, removing each absorbed chunk (and `start` itself) from the
    /// free index as it goes. Returns the single resulting chunk, which is
    /// not yet (re-)inserted into the index.
    fn coalesce_from(&mut self, start: Chunk) -> Chunk {
        // Idempotent: `start` may not be indexed yet on the very first
        // iteration (the just-freed chunk never was), see §9.
        self.free_index.remove(start);

        let mut total_payload = start.payload_size();
        let mut terminator = start.next();
        while let Some(c) = terminator {
            if !c.is_free() {
                break;
            }
            self.free_index.remove(c);
            total_payload += HEADER_SIZE + c.payload_size();
            terminator = c.next();
        }

        start.set_payload_size(total_payload);
        start.set_next(terminator);
        match terminator {
            Some(t) => t.set_prev(Some(start)),
            None => self.tail = Some(start),
        }
        start
    }

    /// Grows the break by enough to satisfy an `n`-byte request (plus a
    /// full coarse block of slack), then either extends an already-free
    /// tail chunk or links a freshly carved one. Returns `Err` (and logs)
    /// if the break primitive refuses.
    fn grow_for(&mut self, n: usize) -> Result<(), AllocError> {
        let growth = round_up_coarse(n + HEADER_SIZE + COARSE_BLOCK);
        let Some(start) = self.segment.grow(growth) else {
            log::debug!("breakalloc: sbrk refused to grow by {growth} bytes");
            return Err(AllocError::OutOfMemory);
        };

        if let Some(tail) = self.tail {
            if tail.is_free() {
                self.free_index.remove(tail);
                tail.set_payload_size(tail.payload_size() + growth);
                self.free_index.insert(tail);
                return Ok(());
            }
        }

        // SAFETY: `start` is the address of `growth` freshly committed
        // bytes from the break primitive, large enough for a header plus a
        // strictly positive payload.
        let header_ptr = start.cast::<chunk::ChunkHeader>();
        let payload_size = growth - HEADER_SIZE;
        let new_chunk = unsafe { chunk::Chunk::init(header_ptr, payload_size) };

        new_chunk.set_prev(self.tail);
        match self.tail {
            Some(tail) => tail.set_next(Some(new_chunk)),
            None => self.head = Some(new_chunk),
        }
        self.tail = Some(new_chunk);
        self.free_index.insert(new_chunk);
        Ok(())
    }

    /// If the physical tail chunk is free and already at least a coarse
    /// block by itself, trims a fully-free tail run back to the OS.
    /// Re-inserts the collected chunks into the free index if the run turns
    /// out too small, or if the shrink primitive itself fails; the heap must
    /// stay fully invariant-preserving in both cases (see the resolved open
    /// question in the design notes).
    ///
    /// The gate reads the tail chunk's own size, not the free index's byte
    /// counter: a chunk whose payload exceeds the index's bucket capacity is
    /// never indexed (§4.1), so the counter alone would never see it and a
    /// large coalesced tail would sit there forever. Invariant 4 (no two
    /// adjacent chunks are both free) also means the backward walk below
    /// never has more than one chunk to collect at the point this is called,
    /// right after `release`'s own coalescing.
    fn tail_trim(&mut self) {
        let Some(old_tail) = self.tail else { return };
        if !old_tail.is_free() || old_tail.total_size() < COARSE_BLOCK {
            return;
        }

        let mut first_free = old_tail;
        let mut collected = old_tail.total_size();
        self.free_index.remove(old_tail);
        while let Some(prev) = first_free.prev() {
            if !prev.is_free() {
                break;
            }
            self.free_index.remove(prev);
            collected += prev.total_size();
            first_free = prev;
        }

        if collected < COARSE_BLOCK {
            self.reinsert_run(first_free, old_tail);
            return;
        }

        let boundary = first_free.prev();
        if self.segment.shrink(collected) {
            match boundary {
                Some(b) => {
                    b.set_next(None);
                    self.tail = Some(b);
                }
                None => {
                    self.head = None;
                    self.tail = None;
                }
            }
        } else {
            log::warn!("breakalloc: sbrk shrink of {collected} bytes failed, keeping heap as-is");
            self.reinsert_run(first_free, old_tail);
        }
    }

    /// Re-inserts every chunk from `first` to `last` (inclusive, walking
    /// forward) back into the free index. Used to undo the bookkeeping
    /// side of a tail-trim attempt that didn't go through.
    fn reinsert_run(&mut self, first: Chunk, last: Chunk) {
        let mut cursor = Some(first);
        while let Some(c) = cursor {
            self.free_index.insert(c);
            if c == last {
                break;
            }
            cursor = c.next();
        }
    }
}

fn round_up_coarse(x: usize) -> usize {
    (x + COARSE_BLOCK - 1) / COARSE_BLOCK * COARSE_BLOCK
}

#[cfg(test)]
impl<B> Heap<B> {
    pub(crate) fn segment(&self) -> &Segment<B> {
        &self.segment
    }
}

#[cfg(test)]
impl<B: segment::BreakSource> Heap<B> {
    /// Walks the heap both ways and checks the §3 invariants that don't
    /// need the free index's own bookkeeping (that part is checked by
    /// `free_index`'s own tests). Panics on violation.
    fn check_linkage(&self) {
        let mut cursor = self.head;
        let mut prev = None;
        let mut last_free = false;
        while let Some(c) = cursor {
            assert_eq!(c.prev(), prev, "prev-link mismatch while walking forward");
            assert!(!(last_free && c.is_free()), "two adjacent chunks are both free");
            last_free = c.is_free();
            prev = Some(c);
            cursor = c.next();
        }
        assert_eq!(self.tail, prev, "tail must be the last chunk reached by next-walk");
    }
}
