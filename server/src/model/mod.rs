pub mod classification;
pub mod context_chunk;
pub mod cycle;
pub mod feedback;
pub mod item;
pub mod source_record;

pub use classification::ClassificationRecord;
pub use context_chunk::ContextChunk;
pub use cycle::CycleReport;
pub use feedback::UserFeedback;
pub use item::{idempotency_key, Item, ItemState};
pub use source_record::{SourceBatch, SourceRecord};
