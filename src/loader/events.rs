//! Load progress and the loader event stream.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::dicom::{DicomMetadata, ImagePayload};
use crate::error::LoaderError;
use crate::loader::volume::VolumeMetadata;
use crate::progressive::{DatasetProgress, DatasetSummary};

/// Buffered events per subscriber before slow receivers start lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Progress
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Pending,
    Loading,
    Completed,
    Failed,
}

/// Progress of one in-flight image load.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub identifier: String,
    pub loaded: u64,
    pub total: u64,
    pub percentage: f64,
    pub status: ProgressStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressState {
    pub fn pending(identifier: impl Into<String>, expected_bytes: Option<usize>) -> Self {
        Self {
            identifier: identifier.into(),
            loaded: 0,
            total: expected_bytes.unwrap_or(0) as u64,
            percentage: 0.0,
            status: ProgressStatus::Pending,
            error: None,
        }
    }

    pub fn loading(mut self) -> Self {
        self.status = ProgressStatus::Loading;
        self
    }

    pub fn completed(mut self, bytes: usize) -> Self {
        self.loaded = bytes as u64;
        self.total = bytes as u64;
        self.percentage = 100.0;
        self.status = ProgressStatus::Completed;
        self
    }

    pub fn failed(mut self, error: &LoaderError) -> Self {
        self.status = ProgressStatus::Failed;
        self.error = Some(error.to_string());
        self
    }
}

// =============================================================================
// Events
// =============================================================================

/// Events published by the loader.
///
/// Serialized as `{"event": "<name>", "data": ...}` with the event names
/// `progress`, `error`, `metadataExtracted`, `cacheCleared`,
/// `dataset-progress`, `dataset-complete` and `volume-loaded`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum LoaderEvent {
    #[serde(rename = "progress")]
    Progress(ProgressState),

    #[serde(rename = "error")]
    Error { identifier: String, error: String },

    #[serde(rename = "metadataExtracted")]
    MetadataExtracted {
        identifier: String,
        metadata: DicomMetadata,
    },

    #[serde(rename = "cacheCleared")]
    CacheCleared,

    #[serde(rename = "dataset-progress")]
    DatasetProgress(DatasetProgress),

    #[serde(rename = "dataset-complete")]
    DatasetComplete(DatasetSummary),

    #[serde(rename = "volume-loaded")]
    VolumeLoaded(VolumeMetadata),
}

impl LoaderEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LoaderEvent::Progress(_) => "progress",
            LoaderEvent::Error { .. } => "error",
            LoaderEvent::MetadataExtracted { .. } => "metadataExtracted",
            LoaderEvent::CacheCleared => "cacheCleared",
            LoaderEvent::DatasetProgress(_) => "dataset-progress",
            LoaderEvent::DatasetComplete(_) => "dataset-complete",
            LoaderEvent::VolumeLoaded(_) => "volume-loaded",
        }
    }
}

/// Fan-out of [`LoaderEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LoaderEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Events without subscribers are dropped.
    pub fn emit(&self, event: LoaderEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            trace!(event = name, "No event subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

// =============================================================================
// Hooks
// =============================================================================

pub type ProgressHook = Arc<dyn Fn(&ProgressState) + Send + Sync>;
pub type MetadataHook = Arc<dyn Fn(&str, &DicomMetadata) + Send + Sync>;
pub type ImageHook = Arc<dyn Fn(&ImagePayload) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&str, &LoaderError) + Send + Sync>;

/// Optional callbacks invoked alongside the event stream.
#[derive(Clone, Default)]
pub struct LoaderHooks {
    pub on_progress: Option<ProgressHook>,
    pub on_metadata_loaded: Option<MetadataHook>,
    pub on_image_loaded: Option<ImageHook>,
    pub on_error: Option<ErrorHook>,
}

impl LoaderHooks {
    pub fn on_progress(mut self, hook: impl Fn(&ProgressState) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(hook));
        self
    }

    pub fn on_metadata_loaded(
        mut self,
        hook: impl Fn(&str, &DicomMetadata) + Send + Sync + 'static,
    ) -> Self {
        self.on_metadata_loaded = Some(Arc::new(hook));
        self
    }

    pub fn on_image_loaded(mut self, hook: impl Fn(&ImagePayload) + Send + Sync + 'static) -> Self {
        self.on_image_loaded = Some(Arc::new(hook));
        self
    }

    pub fn on_error(mut self, hook: impl Fn(&str, &LoaderError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for LoaderHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderHooks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_metadata_loaded", &self.on_metadata_loaded.is_some())
            .field("on_image_loaded", &self.on_image_loaded.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
