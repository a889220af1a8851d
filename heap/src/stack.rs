//! Conservative root discovery over the native call stack.
//!
//! The collector treats the stack as an untyped word array: any word whose
//! value lands inside a live chunk keeps that chunk alive, whether or not it
//! was ever a pointer. Reading the stack is isolated behind
//! [`spill_and_scan`] and [`words_in`], so the mark phase only ever sees an
//! iterator of candidate words and tests can feed it an ordinary buffer.

use std::hint;

const WORD: usize = size_of::<usize>();

/// A position on the native call stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StackAddress(usize);

impl StackAddress {
    /// Capture the approximate address of the caller's frame.
    ///
    /// Inlined so the sampled slot lives in the caller's frame, not in a
    /// frame of this crate. Capture the upper scan bound in the outermost
    /// frame that can still hold references into the arena.
    #[inline(always)]
    pub fn here() -> Self {
        let slot = 0usize;
        Self(hint::black_box(&slot as *const usize as usize))
    }

    pub fn from_usize(addr: usize) -> Self {
        Self(addr)
    }

    pub fn as_usize(self) -> usize {
        self.0
    }
}

/// Spill-buffer length in words, sized past `jmp_buf` on every supported
/// target.
const SPILL_WORDS: usize = 64;

#[cfg(unix)]
unsafe extern "C" {
    /// `_setjmp` writes the callee-saved register file into the buffer,
    /// which is all the spill needs; the buffer is never jumped back to.
    fn _setjmp(env: *mut usize) -> i32;
}

/// Flush callee-saved registers into a buffer on the current frame, then run
/// `scan` with that buffer's address as the deepest scannable position.
///
/// Arena references living only in registers at the moment of a collection
/// are pushed into the scanned range this way.
#[inline(never)]
pub fn spill_and_scan<R>(scan: impl FnOnce(StackAddress) -> R) -> R {
    let mut regs = [0usize; SPILL_WORDS];
    // SAFETY: the buffer outlives the call and no longjmp ever targets it.
    unsafe {
        _setjmp(regs.as_mut_ptr());
    }
    let bound = StackAddress(regs.as_ptr() as usize);
    let result = scan(bound);
    hint::black_box(&regs);
    result
}

/// Iterate the word-aligned values stored in `[low, high)`.
///
/// # Safety
///
/// The whole range must be mapped, readable memory. It is for a live stack
/// between a frame address and the recorded stack top.
pub unsafe fn words_in(
    low: StackAddress,
    high: StackAddress,
) -> impl Iterator<Item = usize> {
    let start = low.0.next_multiple_of(WORD);
    let end = high.0 & !(WORD - 1);
    (start..end).step_by(WORD).map(|addr| {
        // SAFETY: addr is word aligned and inside the caller-vouched range.
        unsafe { (addr as *const usize).read_volatile() }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_in_reads_a_buffer_verbatim() {
        let buffer = [0xdead_usize, 0xbeef, 0xf00d];
        let low = StackAddress(buffer.as_ptr() as usize);
        let high = StackAddress(buffer.as_ptr() as usize + buffer.len() * WORD);
        // SAFETY: the range covers a live local array.
        let words: Vec<usize> = unsafe { words_in(low, high).collect() };
        assert_eq!(words, vec![0xdead, 0xbeef, 0xf00d]);
    }

    #[test]
    fn words_in_empty_range_yields_nothing() {
        let buffer = [7usize];
        let addr = StackAddress(buffer.as_ptr() as usize);
        // SAFETY: empty range, nothing is read.
        assert_eq!(unsafe { words_in(addr, addr).count() }, 0);
    }

    #[test]
    fn spill_and_scan_exposes_a_scannable_range() {
        let here = StackAddress::here();
        let count = spill_and_scan(|bound| {
            assert_ne!(bound, here);
            let (low, high) = if bound < here { (bound, here) } else { (here, bound) };
            // SAFETY: both bounds lie on this thread's live stack.
            unsafe { words_in(low, high).count() }
        });
        assert!(count > 0);
    }
}
