//! Batch processing: data model, target resolution, sync execution, async
//! submission and result retrieval.

pub mod aggregator;
pub mod executor;
pub mod item;
pub mod resolver;
pub mod submitter;

pub use aggregator::{ResultAggregator, Retrieval};
pub use executor::BatchExecutor;
pub use item::{BatchRequest, QueuedItem, RequestItem, ResponseItem};
pub use resolver::{TargetMap, TargetResolver};
pub use submitter::AsyncSubmitter;
