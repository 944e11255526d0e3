mod file_source;
mod range_source;

pub use file_source::FileRangeSource;
pub use range_source::{MemoryRangeSource, RangeSource};
