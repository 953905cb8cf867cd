//! Progressive dataset loading.
//!
//! Large series are loaded in chunks so the first images are usable long
//! before the last ones arrive:
//!
//! ```text
//!  identifiers ──► order_identifiers(strategy, focus)
//!                         │
//!                         ▼
//!                  ChunkPlanner ── next_size() ──► chunk 0, chunk 1, ...
//!                         ▲                          │ (≤ maxConcurrentChunks)
//!                         └──── record(latency) ─────┘
//!                                                    ▼
//!                                  dataset-progress ... dataset-complete
//! ```
//!
//! - [`LoadingStrategy::Sequential`]: input order, fixed chunks
//! - [`LoadingStrategy::Adaptive`]: chunks grow or shrink with latency
//! - [`LoadingStrategy::Predictive`]: nearest to the focus index first

mod session;
mod strategy;

pub use session::{
    ChunkResult, DatasetProgress, DatasetProgressCallback, DatasetSummary, SessionCompleteCallback,
    SessionHandle, SessionOptions, SessionOutcome, SessionRegistry,
};
pub use strategy::{
    order_identifiers, ChunkPlanner, LoadingStrategy, ProgressiveConfig, DEFAULT_CHUNK_SIZE,
    DEFAULT_MAX_CONCURRENT_CHUNKS, DEFAULT_MEMORY_THRESHOLD, DEFAULT_PRELOAD_DISTANCE,
    DEFAULT_PRIORITY_LEVELS, TARGET_IMAGE_LATENCY,
};

pub(crate) use session::start_session;
