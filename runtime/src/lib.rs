//! Runtime surface for compiler-generated code.
//!
//! Generated programs call these hooks: [`gc_init`] once at startup (it
//! records the topmost frame as the upper bound for stack scans), [`gc_alloc`]
//! for every managed allocation, [`gc_dispose`] at exit. The heap lives in a
//! process-wide slot behind a mutex; collection itself is single-mutator and
//! stop-the-world, the lock only turns concurrent misuse into serialization.
//!
//! Errors crossing the C boundary are fatal: the runtime prints a diagnostic
//! and aborts, including every usage-order violation (allocation before
//! init, double init, use after dispose).

#[cfg(debug_assertions)]
use heap::Phases;
use heap::{Heap, HeapSettings, RecordOptions, StackAddress};
use parking_lot::Mutex;

static HEAP: Mutex<Option<Heap>> = Mutex::new(None);

fn fatal(message: &str) -> ! {
    tracing::error!(target: "heap", "fatal: {message}");
    eprintln!("heap runtime: {message}");
    std::process::abort();
}

fn with_heap<R>(operation: &str, f: impl FnOnce(&mut Heap) -> R) -> R {
    let mut slot = HEAP.lock();
    match slot.as_mut() {
        Some(heap) => f(heap),
        None => fatal(&format!("{operation} called before init")),
    }
}

/// Create the process heap.
///
/// Must be called exactly once, before the first allocation, from the
/// outermost frame of the generated program: the caller's frame address
/// becomes the upper bound for every later stack scan.
#[unsafe(no_mangle)]
pub extern "C" fn gc_init() {
    let top = StackAddress::here();
    let mut slot = HEAP.lock();
    if slot.is_some() {
        fatal("init called twice");
    }
    match Heap::new(HeapSettings::default()) {
        Ok(mut heap) => {
            heap.set_stack_top(top);
            *slot = Some(heap);
        }
        Err(err) => fatal(&format!("init failed: {err}")),
    }
}

/// Release the arena and every descriptor. Later runtime calls are fatal.
#[unsafe(no_mangle)]
pub extern "C" fn gc_dispose() {
    let mut slot = HEAP.lock();
    if slot.take().is_none() {
        fatal("dispose called before init");
    }
}

/// Allocate `size` bytes from the arena and return their address.
#[unsafe(no_mangle)]
pub extern "C" fn gc_alloc(size: usize) -> *mut u8 {
    with_heap("alloc", |heap| match heap.alloc(size) {
        Ok(ptr) => ptr.as_ptr(),
        Err(err) => fatal(&err.to_string()),
    })
}

/// Toggle the profiler.
#[unsafe(no_mangle)]
pub extern "C" fn gc_set_profiler(enabled: bool) {
    with_heap("set_profiler", |heap| heap.set_profiler(enabled));
}

/// Restrict which profiler event kinds are recorded. Unknown bits are
/// ignored.
#[unsafe(no_mangle)]
pub extern "C" fn gc_set_profiler_log_options(mask: u8) {
    with_heap("set_profiler_log_options", |heap| {
        heap.set_profiler_log_options(RecordOptions::from_bits_truncate(mask))
    });
}

/// Force a collection restricted to the phases in `mask` (bit 0 mark, bit 1
/// sweep, bit 2 compact, bit 3 free). Debug builds only.
#[cfg(debug_assertions)]
#[unsafe(no_mangle)]
pub extern "C" fn gc_collect(mask: u8) {
    with_heap("collect", |heap| {
        heap.collect(Phases::from_bits_truncate(mask))
    });
}

/// Dump the allocated and freed chunk tables to stdout. Debug builds only.
#[cfg(debug_assertions)]
#[unsafe(no_mangle)]
pub extern "C" fn gc_print_contents() {
    with_heap("print_contents", |heap| heap.print_contents());
}

/// Print a one-line heap summary. Debug builds only.
#[cfg(debug_assertions)]
#[unsafe(no_mangle)]
pub extern "C" fn gc_print_summary() {
    with_heap("print_summary", |heap| heap.print_summary());
}

#[cfg(test)]
mod tests {
    use super::*;

    // The heap slot is process-wide, so the whole surface is exercised as a
    // single lifecycle.
    #[test]
    fn runtime_lifecycle_round_trip() {
        gc_init();

        let a = gc_alloc(64);
        assert!(!a.is_null());
        // SAFETY: a points at 64 fresh arena bytes.
        unsafe {
            a.write_bytes(0xab, 64);
        }

        let b = gc_alloc(128);
        assert!(!b.is_null());
        assert_ne!(a, b);
        // SAFETY: a is still live and unaliased by b.
        unsafe {
            assert_eq!(a.read(), 0xab);
        }

        gc_set_profiler(true);
        gc_set_profiler_log_options(0x1f);
        let c = gc_alloc(8);
        assert!(!c.is_null());

        #[cfg(debug_assertions)]
        {
            gc_collect(Phases::all().bits());
            gc_print_summary();
        }

        gc_dispose();
    }
}
