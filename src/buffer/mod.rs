pub mod pool;
pub mod replacer;

pub use pool::{LogSync, PageRef, PartitionedBufferPool};
pub use replacer::{create_replacer, ClockReplacer, LruReplacer, Replacer, ReplacerPolicy};
