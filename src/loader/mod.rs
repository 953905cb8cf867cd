//! Load coordination.
//!
//! The [`LoadCoordinator`] is the entry point for retrieving images. It sits
//! between callers and the protocol clients:
//!
//! ```text
//!  load_image / load_volume / prefetch / progressive sessions
//!                         │
//!                         ▼
//!               ┌───────────────────┐   hit
//!               │    ImageCache     │ ──────► ImagePayload
//!               └─────────┬─────────┘
//!                         │ miss
//!                         ▼
//!               ┌───────────────────┐
//!               │  in-flight map    │  one fetch per identifier,
//!               │  (coalescing)     │  any number of waiters
//!               └─────────┬─────────┘
//!                         ▼
//!               ┌───────────────────┐
//!               │ ConcurrencyLimiter│  volume, session and prefetch loads
//!               └─────────┬─────────┘
//!                         ▼
//!     ProtocolClient ─► PixelDecoder ─► ModalityRegistry ─► cache insert
//! ```

mod coordinator;
mod decoder;
mod events;
mod limiter;
mod prefetch;
mod volume;

pub use coordinator::{LoadCoordinator, LoadCoordinatorBuilder};
pub use decoder::{DecodeError, DecodedImage, PixelDecoder};
pub use events::{
    EventBus, LoaderEvent, LoaderHooks, ProgressState, ProgressStatus, EVENT_CHANNEL_CAPACITY,
};
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use prefetch::PREFETCH_BATCH_PAUSE;
pub use volume::{
    sort_slices, SliceOrdering, VolumeFailure, VolumeLoadContext, VolumeMetadata, VolumeResult,
};

use tokio_util::sync::CancellationToken;

use crate::protocol::RenderHints;

/// Admission priority for background work such as prefetch.
pub const PRIORITY_BACKGROUND: u8 = 0;

/// Default admission priority.
pub const PRIORITY_NORMAL: u8 = 1;

/// Admission priority for work the user is waiting on.
pub const PRIORITY_HIGH: u8 = 2;

/// Why an image is being loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestType {
    /// The user is looking at it; never queued behind other loads
    #[default]
    Interaction,
    /// Queued prefetch work, lowest priority
    Prefetch,
    /// Volume and session members, admitted through the limiter
    Background,
}

/// Per-call options for image and volume loads.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Bypass the cache on lookup and do not insert the result
    pub skip_cache: bool,
    pub request_type: RequestType,
    /// Admission priority; higher is admitted first
    pub priority: u8,
    /// Cancels this caller's wait (and the fetch once nobody else waits)
    pub cancel: Option<CancellationToken>,
    /// Expected size in bytes, used as the initial progress total
    pub expected_size: Option<usize>,
    pub render_hints: RenderHints,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            skip_cache: false,
            request_type: RequestType::Interaction,
            priority: PRIORITY_NORMAL,
            cancel: None,
            expected_size: None,
            render_hints: RenderHints::default(),
        }
    }
}

impl LoadOptions {
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_request_type(mut self, request_type: RequestType) -> Self {
        self.request_type = request_type;
        self
    }

    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone().unwrap_or_default()
    }
}
