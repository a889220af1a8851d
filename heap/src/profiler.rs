//! Observation of allocator and collector activity.
//!
//! The heap emits one [`HeapEvent`] per observable action. A [`Profiler`]
//! filters them through an enabled flag and a [`RecordOptions`] mask, keeps
//! rolling totals, and forwards what survives to a [`ProfilerSink`]. Sink
//! failures are the sink's problem; the heap never reacts to them.

use bitflags::bitflags;

bitflags! {
    /// Selects which event kinds a profiler records.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RecordOptions: u8 {
        const ALLOC = 1 << 0;
        const MARK = 1 << 1;
        const SWEEP = 1 << 2;
        const COMPACT = 1 << 3;
        const FREE = 1 << 4;
    }
}

/// One observable heap action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapEvent {
    /// Fresh allocation past the high-water line.
    AllocBump { offset: usize, size: usize },
    /// Allocation served out of the freed-chunk index.
    AllocReuse { offset: usize, size: usize },
    MarkStart { candidates: usize },
    MarkEnd { marked: usize },
    SweepStart,
    SweepEnd { swept: usize },
    CompactStart,
    CompactEnd { moved: usize, bump: usize },
    /// A freed-chunk descriptor was destroyed.
    DescriptorFree { offset: usize, size: usize },
}

impl HeapEvent {
    /// The record-option bit gating this event.
    pub fn kind(&self) -> RecordOptions {
        match self {
            Self::AllocBump { .. } | Self::AllocReuse { .. } => RecordOptions::ALLOC,
            Self::MarkStart { .. } | Self::MarkEnd { .. } => RecordOptions::MARK,
            Self::SweepStart | Self::SweepEnd { .. } => RecordOptions::SWEEP,
            Self::CompactStart | Self::CompactEnd { .. } => RecordOptions::COMPACT,
            Self::DescriptorFree { .. } => RecordOptions::FREE,
        }
    }
}

/// Receives recorded events.
pub trait ProfilerSink: Send {
    fn record(&mut self, event: HeapEvent);
}

/// Default sink: forwards events to `tracing` under the `heap` target.
#[derive(Debug, Default)]
pub struct TraceSink;

impl ProfilerSink for TraceSink {
    fn record(&mut self, event: HeapEvent) {
        tracing::debug!(target: "heap", event = ?event, "profile");
    }
}

/// Rolling totals over recorded events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProfileStats {
    pub bump_allocs: usize,
    pub reuse_allocs: usize,
    pub allocated_bytes: usize,
    pub marked_chunks: usize,
    pub swept_chunks: usize,
    pub moved_chunks: usize,
    pub freed_descriptors: usize,
}

impl ProfileStats {
    fn apply(&mut self, event: HeapEvent) {
        match event {
            HeapEvent::AllocBump { size, .. } => {
                self.bump_allocs += 1;
                self.allocated_bytes += size;
            }
            HeapEvent::AllocReuse { size, .. } => {
                self.reuse_allocs += 1;
                self.allocated_bytes += size;
            }
            HeapEvent::MarkEnd { marked } => self.marked_chunks += marked,
            HeapEvent::SweepEnd { swept } => self.swept_chunks += swept,
            HeapEvent::CompactEnd { moved, .. } => self.moved_chunks += moved,
            HeapEvent::DescriptorFree { .. } => self.freed_descriptors += 1,
            _ => {}
        }
    }
}

/// Event filter, counters, and sink dispatch, owned by the heap.
pub struct Profiler {
    enabled: bool,
    options: RecordOptions,
    stats: ProfileStats,
    sink: Box<dyn ProfilerSink>,
}

impl Profiler {
    pub fn new() -> Self {
        Self {
            enabled: false,
            options: RecordOptions::all(),
            stats: ProfileStats::default(),
            sink: Box::new(TraceSink),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn options(&self) -> RecordOptions {
        self.options
    }

    pub fn set_options(&mut self, options: RecordOptions) {
        self.options = options;
    }

    /// Replace the sink events are forwarded to.
    pub fn set_sink(&mut self, sink: Box<dyn ProfilerSink>) {
        self.sink = sink;
    }

    pub fn stats(&self) -> ProfileStats {
        self.stats
    }

    #[inline]
    pub(crate) fn emit(&mut self, event: HeapEvent) {
        if !self.enabled || !self.options.contains(event.kind()) {
            return;
        }
        self.stats.apply(event);
        self.sink.record(event);
    }
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct VecSink(Arc<Mutex<Vec<HeapEvent>>>);

    impl ProfilerSink for VecSink {
        fn record(&mut self, event: HeapEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn disabled_profiler_records_nothing() {
        let sink = VecSink::default();
        let mut profiler = Profiler::new();
        profiler.set_sink(Box::new(sink.clone()));
        profiler.emit(HeapEvent::SweepStart);
        assert!(sink.0.lock().unwrap().is_empty());
        assert_eq!(profiler.stats(), ProfileStats::default());
    }

    #[test]
    fn record_options_suppress_kinds_at_the_source() {
        let sink = VecSink::default();
        let mut profiler = Profiler::new();
        profiler.set_sink(Box::new(sink.clone()));
        profiler.set_enabled(true);
        profiler.set_options(RecordOptions::ALLOC);

        profiler.emit(HeapEvent::AllocBump { offset: 0, size: 16 });
        profiler.emit(HeapEvent::SweepStart);
        profiler.emit(HeapEvent::DescriptorFree { offset: 0, size: 16 });

        let events = sink.0.lock().unwrap();
        assert_eq!(events.as_slice(), &[HeapEvent::AllocBump { offset: 0, size: 16 }]);
        assert_eq!(profiler.stats().bump_allocs, 1);
        assert_eq!(profiler.stats().freed_descriptors, 0);
    }

    #[test]
    fn stats_accumulate_per_kind() {
        let mut profiler = Profiler::new();
        profiler.set_enabled(true);
        profiler.emit(HeapEvent::AllocBump { offset: 0, size: 64 });
        profiler.emit(HeapEvent::AllocReuse { offset: 0, size: 32 });
        profiler.emit(HeapEvent::MarkEnd { marked: 3 });
        profiler.emit(HeapEvent::SweepEnd { swept: 2 });
        profiler.emit(HeapEvent::CompactEnd { moved: 1, bump: 96 });
        profiler.emit(HeapEvent::DescriptorFree { offset: 64, size: 32 });

        let stats = profiler.stats();
        assert_eq!(stats.bump_allocs, 1);
        assert_eq!(stats.reuse_allocs, 1);
        assert_eq!(stats.allocated_bytes, 96);
        assert_eq!(stats.marked_chunks, 3);
        assert_eq!(stats.swept_chunks, 2);
        assert_eq!(stats.moved_chunks, 1);
        assert_eq!(stats.freed_descriptors, 1);
    }

    #[test]
    fn every_event_maps_to_one_kind() {
        let events = [
            HeapEvent::AllocBump { offset: 0, size: 1 },
            HeapEvent::AllocReuse { offset: 0, size: 1 },
            HeapEvent::MarkStart { candidates: 0 },
            HeapEvent::MarkEnd { marked: 0 },
            HeapEvent::SweepStart,
            HeapEvent::SweepEnd { swept: 0 },
            HeapEvent::CompactStart,
            HeapEvent::CompactEnd { moved: 0, bump: 0 },
            HeapEvent::DescriptorFree { offset: 0, size: 1 },
        ];
        for event in events {
            assert_eq!(event.kind().bits().count_ones(), 1);
        }
    }
}
