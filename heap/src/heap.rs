//! Conservative stop-the-world mark–sweep collector over a fixed arena.
//!
//! The heap owns one contiguous anonymous mapping and hands out raw regions
//! ("chunks") from it. Reclamation runs in up to four phases:
//!
//! 1. mark: conservatively scan the native call stack; any word that lands
//!    inside a live chunk keeps that chunk.
//! 2. sweep: unmarked chunks move to the freed index for first-fit reuse.
//! 3. compact: live chunks slide toward the arena base and the bump line
//!    retreats.
//! 4. free: freed-chunk descriptors are destroyed.
//!
//! Allocation first tries the freed index (first fit, splitting oversized
//! chunks), then bumps the high-water line; exhaustion triggers one full
//! collection and a single retry.
//!
//! This crate is decoupled from any specific client. Embedders create a
//! [`Heap`], record the topmost scannable frame with [`Heap::set_stack_top`],
//! and route every allocation through [`Heap::alloc`]. Without a recorded
//! stack top the root set is empty and every chunk is considered dead at the
//! next collection.

use std::ptr::{self, NonNull};

use bitflags::bitflags;
use tracing::Level;

use crate::chunk::Chunk;
use crate::error::HeapError;
use crate::profiler::{HeapEvent, Profiler, RecordOptions};
use crate::stack::{self, StackAddress};
use crate::system::Mapping;

/// Arena capacity used by production builds: 240 MiB.
pub const HEAP_SIZE: usize = 240 * 1024 * 1024;

bitflags! {
    /// Phase mask for conditional collection.
    ///
    /// Selected phases always execute in MARK → SWEEP → COMPACT → FREE
    /// order; partial masks exist for diagnostics and tests, a production
    /// collection runs all four.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Phases: u8 {
        const MARK = 1 << 0;
        const SWEEP = 1 << 1;
        const COMPACT = 1 << 2;
        const FREE = 1 << 3;
    }
}

/// Configuration for the collector's arena.
#[derive(Clone, Debug)]
pub struct HeapSettings {
    /// Total arena capacity in bytes. Rounded up to page granularity.
    pub heap_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            heap_size: HEAP_SIZE,
        }
    }
}

impl HeapSettings {
    #[inline]
    fn validate(&self) -> Result<(), HeapError> {
        if self.heap_size == 0 {
            return Err(HeapError::InvalidSettings {
                reason: "heap_size must be > 0",
            });
        }
        Ok(())
    }
}

/// The collector: arena, chunk indexes, and the profiler hook.
///
/// Exclusively owned; the API is `&mut self` throughout. One mutator thread,
/// stop-the-world collection, no suspension points.
pub struct Heap {
    arena: Mapping,
    /// High-water offset: bytes below it have been handed out at least once.
    bump: usize,
    /// Chunks currently owned by the mutator.
    allocated: Vec<Chunk>,
    /// Reclaimed chunks available for reuse, in reclamation order.
    freed: Vec<Chunk>,
    /// Upper bound for stack scans, recorded by the embedder at startup.
    stack_top: Option<StackAddress>,
    /// Replaces the live stack as the root source. Testing only.
    #[cfg(any(test, feature = "test-roots"))]
    root_override: Option<Vec<usize>>,
    profiler: Profiler,
}

impl Heap {
    /// Map the arena and return an empty heap.
    pub fn new(settings: HeapSettings) -> Result<Self, HeapError> {
        settings.validate()?;
        let arena = Mapping::new(settings.heap_size)?;
        Ok(Self {
            arena,
            bump: 0,
            allocated: Vec::new(),
            freed: Vec::new(),
            stack_top: None,
            #[cfg(any(test, feature = "test-roots"))]
            root_override: None,
            profiler: Profiler::new(),
        })
    }

    /// Record the upper bound for stack scans.
    ///
    /// Capture the address in the outermost frame that can still hold
    /// references into the arena; everything between a collection's own frame
    /// and this bound is scanned.
    pub fn set_stack_top(&mut self, top: StackAddress) {
        self.stack_top = Some(top);
    }

    /// Arena capacity in bytes (page granular).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.arena.len()
    }

    /// Current high-water offset.
    #[inline]
    pub fn bump(&self) -> usize {
        self.bump
    }

    /// Address of arena byte 0.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.arena.base()
    }

    /// Descriptors of chunks currently owned by the mutator.
    pub fn allocated_chunks(&self) -> &[Chunk] {
        &self.allocated
    }

    /// Descriptors of reclaimed chunks available for reuse.
    pub fn freed_chunks(&self) -> &[Chunk] {
        &self.freed
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    pub fn profiler_mut(&mut self) -> &mut Profiler {
        &mut self.profiler
    }

    pub fn set_profiler(&mut self, enabled: bool) {
        self.profiler.set_enabled(enabled);
    }

    pub fn set_profiler_log_options(&mut self, options: RecordOptions) {
        self.profiler.set_options(options);
    }

    /// Replace the live stack with an explicit word buffer for subsequent
    /// collections; `None` restores stack scanning.
    #[cfg(any(test, feature = "test-roots"))]
    pub fn set_root_override(&mut self, roots: Option<Vec<usize>>) {
        self.root_override = roots;
    }

    // ── Allocation ────────────────────────────────────────────────────

    /// Allocate `size` bytes from the arena.
    ///
    /// The freed index is searched first fit; a fresh bump allocation covers
    /// the rest. When neither fits, one full collection runs and the request
    /// is retried once before reporting [`HeapError::OutOfMemory`]. `size`
    /// is used as given; callers pad for alignment themselves.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>, HeapError> {
        if size == 0 {
            return Err(HeapError::InvalidRequest { requested: size });
        }
        if let Some(ptr) = self.try_alloc(size) {
            self.debug_verify();
            return Ok(ptr);
        }
        tracing::debug!(target: "heap", size, "allocation failed, collecting");
        self.collect(Phases::all());
        match self.try_alloc(size) {
            Some(ptr) => {
                self.debug_verify();
                Ok(ptr)
            }
            None => Err(HeapError::OutOfMemory {
                requested: size,
                available: self.available(),
            }),
        }
    }

    fn try_alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.reuse(size).or_else(|| self.bump_alloc(size))
    }

    /// First fit over the freed index, splitting oversized chunks.
    fn reuse(&mut self, size: usize) -> Option<NonNull<u8>> {
        let index = self.freed.iter().position(|c| c.size >= size)?;
        let mut chunk = self.freed.remove(index);
        if let Some(remainder) = chunk.split_at(size) {
            self.freed.push(remainder);
        }
        let offset = chunk.offset;
        self.allocated.push(chunk);
        self.profiler.emit(HeapEvent::AllocReuse { offset, size });
        Some(self.address_of(offset))
    }

    fn bump_alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let end = self.bump.checked_add(size)?;
        if end > self.capacity() {
            return None;
        }
        let offset = self.bump;
        self.bump = end;
        self.allocated.push(Chunk::new(offset, size));
        self.profiler.emit(HeapEvent::AllocBump { offset, size });
        Some(self.address_of(offset))
    }

    /// Largest request the arena could currently satisfy.
    fn available(&self) -> usize {
        let tail = self.capacity() - self.bump;
        self.freed.iter().map(|c| c.size).fold(tail, usize::max)
    }

    #[inline]
    fn address_of(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.capacity());
        // SAFETY: offset is inside the mapping.
        unsafe { NonNull::new_unchecked(self.arena.base().as_ptr().add(offset)) }
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Run the phases selected by `phases`, in fixed order.
    pub fn collect(&mut self, phases: Phases) {
        let _span = tracing::span!(Level::TRACE, "collect", phases = ?phases).entered();
        if phases.contains(Phases::MARK) {
            self.mark_roots();
        }
        if phases.contains(Phases::SWEEP) {
            self.sweep();
        }
        if phases.contains(Phases::COMPACT) {
            self.compact();
        }
        if phases.contains(Phases::FREE) {
            self.release_freed();
        }
        self.debug_verify();
    }

    fn mark_roots(&mut self) {
        #[cfg(any(test, feature = "test-roots"))]
        if let Some(words) = self.root_override.clone() {
            self.mark(words);
            return;
        }
        let Some(top) = self.stack_top else {
            self.mark(std::iter::empty());
            return;
        };
        stack::spill_and_scan(|bound| {
            let (low, high) = if bound < top { (bound, top) } else { (top, bound) };
            // SAFETY: [low, high) lies on this thread's live stack.
            let words = unsafe { stack::words_in(low, high) };
            self.mark(words);
        });
    }

    /// Conservative mark over candidate root words.
    ///
    /// Any word that falls inside a live chunk's extent marks that chunk and
    /// removes it from the work list; the scan continues until the words run
    /// out or the work list drains.
    fn mark(&mut self, words: impl IntoIterator<Item = usize>) {
        self.profiler.emit(HeapEvent::MarkStart {
            candidates: self.allocated.len(),
        });
        let base = self.arena.base().as_ptr() as usize;
        let high = base + self.bump;

        // Work list sorted by start offset so containment is a binary search.
        let mut worklist: Vec<(usize, usize)> = self
            .allocated
            .iter()
            .enumerate()
            .map(|(index, chunk)| (chunk.offset, index))
            .collect();
        worklist.sort_unstable();

        let mut marked = 0usize;
        for word in words {
            if worklist.is_empty() {
                break;
            }
            if word < base || word >= high {
                continue;
            }
            let offset = word - base;
            // Nearest unmarked chunk starting at or below the witness offset.
            let slot = match worklist.binary_search_by(|&(start, _)| start.cmp(&offset)) {
                Ok(slot) => slot,
                Err(0) => continue,
                Err(slot) => slot - 1,
            };
            let (_, index) = worklist[slot];
            if self.allocated[index].contains(offset) {
                self.allocated[index].marked = true;
                worklist.remove(slot);
                marked += 1;
            }
        }
        tracing::trace!(target: "heap", marked, "mark done");
        self.profiler.emit(HeapEvent::MarkEnd { marked });
    }

    /// Move unmarked chunks to the freed index; retain marked ones with the
    /// bit cleared. After sweep no chunk carries a mark.
    fn sweep(&mut self) {
        self.profiler.emit(HeapEvent::SweepStart);
        let mut live = Vec::with_capacity(self.allocated.len());
        let mut swept = 0usize;
        for mut chunk in self.allocated.drain(..) {
            if chunk.marked {
                chunk.marked = false;
                live.push(chunk);
            } else {
                swept += 1;
                self.freed.push(chunk);
            }
        }
        self.allocated = live;
        tracing::trace!(target: "heap", swept, "sweep done");
        self.profiler.emit(HeapEvent::SweepEnd { swept });
    }

    /// Slide live chunks toward the arena base and retreat the bump line.
    ///
    /// Every freed descriptor is stale once bytes have moved, so the freed
    /// index is dropped here as well; afterwards the only free space is the
    /// single span above `bump`.
    fn compact(&mut self) {
        self.profiler.emit(HeapEvent::CompactStart);
        self.allocated.sort_unstable_by_key(|chunk| chunk.offset);
        let base = self.arena.base().as_ptr();
        let mut cursor = 0usize;
        let mut moved = 0usize;
        for chunk in &mut self.allocated {
            if chunk.offset != cursor {
                // SAFETY: source and destination lie inside the mapping;
                // `copy` handles the overlap of a downward slide.
                unsafe {
                    ptr::copy(base.add(chunk.offset), base.add(cursor), chunk.size);
                }
                chunk.offset = cursor;
                moved += 1;
            }
            cursor += chunk.size;
        }
        self.bump = cursor;
        self.release_freed();
        tracing::trace!(target: "heap", moved, bump = self.bump, "compact done");
        self.profiler.emit(HeapEvent::CompactEnd {
            moved,
            bump: self.bump,
        });
    }

    /// Destroy freed-chunk descriptors without touching arena bytes.
    fn release_freed(&mut self) {
        for chunk in self.freed.drain(..) {
            self.profiler.emit(HeapEvent::DescriptorFree {
                offset: chunk.offset,
                size: chunk.size,
            });
        }
    }

    // ── Debug inspection ──────────────────────────────────────────────

    /// Dump the allocated and freed chunk tables.
    #[cfg(debug_assertions)]
    pub fn print_contents(&self) {
        if self.allocated.is_empty() {
            println!("no allocated chunks");
        } else {
            println!("allocated chunks ({})", self.allocated.len());
            for chunk in &self.allocated {
                println!(
                    "  {:#010x}..{:#010x}  {:>8} B  marked={}",
                    chunk.offset,
                    chunk.end(),
                    chunk.size,
                    chunk.marked
                );
            }
        }
        if self.freed.is_empty() {
            println!("no freed chunks");
        } else {
            println!("freed chunks ({})", self.freed.len());
            for chunk in &self.freed {
                println!(
                    "  {:#010x}..{:#010x}  {:>8} B",
                    chunk.offset,
                    chunk.end(),
                    chunk.size
                );
            }
        }
    }

    /// Emit a one-line summary.
    #[cfg(debug_assertions)]
    pub fn print_summary(&self) {
        println!(
            "heap: {} allocated / {} freed chunks, bump {} / {} B",
            self.allocated.len(),
            self.freed.len(),
            self.bump,
            self.capacity()
        );
    }

    /// Check the descriptor geometry invariants after a public mutation:
    /// chunks stay below the bump line and never overlap.
    #[cfg(debug_assertions)]
    fn debug_verify(&self) {
        assert!(self.bump <= self.capacity(), "bump beyond arena");
        let mut all: Vec<&Chunk> = self.allocated.iter().chain(self.freed.iter()).collect();
        for chunk in &all {
            assert!(chunk.size > 0, "zero-sized descriptor");
            assert!(chunk.end() <= self.bump, "chunk beyond the bump line");
        }
        all.sort_unstable_by_key(|chunk| chunk.offset);
        for pair in all.windows(2) {
            assert!(pair[0].end() <= pair[1].offset, "overlapping chunks");
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn debug_verify(&self) {}
}
