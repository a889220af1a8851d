mod chunk;
mod error;
mod heap;
mod profiler;
mod stack;
mod system;

pub use chunk::Chunk;
pub use error::HeapError;
pub use heap::{HEAP_SIZE, Heap, HeapSettings, Phases};
pub use profiler::{HeapEvent, ProfileStats, Profiler, ProfilerSink, RecordOptions, TraceSink};
pub use stack::{StackAddress, spill_and_scan, words_in};
pub use system::{Mapping, OS_PAGE_SIZE, page_align};
