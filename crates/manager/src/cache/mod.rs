pub mod chunks;
pub mod converter_cache;
pub mod filter_index;
pub mod varint;

pub use converter_cache::{CompactionThresholds, ConverterCache, SearchData};
pub use filter_index::{FilterIndex, INVALID_STREAM_ID};
