//! Modality-specific pre/post-processing.
//!
//! The [`ModalityRegistry`] keeps an ordered list of [`ModalityHandler`]s.
//! Resolution scans the list in registration order and picks the first
//! handler whose predicate accepts the SOP Class UID; several handlers may
//! match the same class and the earliest one wins.
//!
//! After a payload has been retrieved the loader runs [`ModalityRegistry::process`]:
//!
//! 1. `pre_process` validates and logs, never blocking the pipeline
//! 2. `post_process` may transform the payload (derived values)
//! 3. a window carried by the dataset is copied onto the payload
//! 4. otherwise the handler's `default_window` is applied
//!
//! Instances whose SOP class has no handler pass through unmodified and
//! without a default window.

use std::sync::Arc;

use tracing::debug;

use crate::dicom::{DicomMetadata, ImagePayload, Window};

mod handlers;

pub use handlers::{
    CtHandler, MrHandler, MultiFrameHandler, PetHandler, RtDoseHandler, XRayHandler,
};

/// Hooks for one family of SOP classes.
pub trait ModalityHandler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    fn can_handle(&self, sop_class_uid: &str) -> bool;

    /// Validate metadata before processing. Problems are logged, not returned.
    fn pre_process(&self, _identifier: &str, _metadata: &DicomMetadata) {}

    /// Transform a retrieved payload.
    fn post_process(&self, _identifier: &str, payload: ImagePayload) -> ImagePayload {
        payload
    }

    /// Window to use when the payload carries none.
    fn default_window(&self, metadata: &DicomMetadata) -> Option<Window>;
}

/// Ordered table of modality handlers.
#[derive(Clone, Default)]
pub struct ModalityRegistry {
    handlers: Vec<Arc<dyn ModalityHandler>>,
}

impl ModalityRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with every built-in handler.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(CtHandler);
        registry.register(MrHandler);
        registry.register(PetHandler);
        registry.register(XRayHandler);
        registry.register(RtDoseHandler);
        registry.register(MultiFrameHandler);
        registry
    }

    /// Append a handler. Earlier registrations take precedence.
    pub fn register(&mut self, handler: impl ModalityHandler + 'static) {
        self.handlers.push(Arc::new(handler));
    }

    /// First handler accepting `sop_class_uid`.
    pub fn resolve(&self, sop_class_uid: &str) -> Option<Arc<dyn ModalityHandler>> {
        self.handlers
            .iter()
            .find(|handler| handler.can_handle(sop_class_uid))
            .cloned()
    }

    pub fn is_supported(&self, sop_class_uid: &str) -> bool {
        self.resolve(sop_class_uid).is_some()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run the processing pipeline on a retrieved payload.
    pub fn process(&self, identifier: &str, payload: ImagePayload) -> ImagePayload {
        let handler = payload
            .metadata
            .sop_class_uid
            .as_deref()
            .and_then(|uid| self.resolve(uid));

        let Some(handler) = handler else {
            debug!(
                identifier,
                sop_class = ?payload.metadata.sop_class_uid,
                "No modality handler, passing payload through"
            );
            return Self::pass_through(payload);
        };

        handler.pre_process(identifier, &payload.metadata);
        let mut payload = handler.post_process(identifier, payload);

        if payload.has_window() {
            payload.window = payload.window.or_else(|| payload.metadata.window());
        } else {
            payload.window = handler.default_window(&payload.metadata);
        }

        debug!(
            identifier,
            handler = handler.name(),
            window = ?payload.window,
            "Modality processing complete"
        );
        payload
    }

    /// Skip handler dispatch, keeping only the dataset's own window.
    pub fn pass_through(mut payload: ImagePayload) -> ImagePayload {
        if payload.window.is_none() {
            payload.window = payload.metadata.window();
        }
        payload
    }
}

impl std::fmt::Debug for ModalityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| h.name()))
            .finish()
    }
}
