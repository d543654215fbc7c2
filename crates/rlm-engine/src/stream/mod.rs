// crates/rlm-engine/src/stream/mod.rs
// Stream normalization and batched processing

mod normalize;
mod processor;

pub use normalize::{StreamChunk, normalize_event};
pub use processor::{
    DEFAULT_BATCH_SIZE, DEFAULT_UPDATE_INTERVAL, StreamOutcome, StreamProcessor, StreamStatus,
    StreamUpdate,
};
