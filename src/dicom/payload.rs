use bytes::Bytes;
use serde::Serialize;

use super::metadata::{DicomMetadata, Window};

/// Modality LUT parameters: `output = stored * slope + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rescale {
    pub slope: f64,
    pub intercept: f64,
}

/// One retrieved image: bytes plus everything derived while processing it.
///
/// `data` is a reference-counted, immutable view. Cloning a payload out of
/// the cache never copies pixel bytes, and evicting the cache entry leaves
/// outstanding clones valid.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    /// Identifier the payload was loaded under
    pub identifier: String,

    /// Raw DICOM bytes, a rendered image, or a decoded pixel buffer
    pub data: Bytes,

    /// Media type reported by the server
    pub content_type: String,

    /// Transfer syntax the bytes were encoded with, if known
    pub transfer_syntax: Option<String>,

    /// Whether `data` has been through the pixel decoder
    pub decoded: bool,

    pub metadata: DicomMetadata,

    /// Window/level to display with; explicit values win over modality defaults
    pub window: Option<Window>,

    pub rescale: Option<Rescale>,

    /// SUV body-weight factor for PET
    pub suv_factor: Option<f64>,

    /// Dose grid scaling for RT dose
    pub dose_grid_scaling: Option<f64>,
}

impl ImagePayload {
    /// Create a payload for freshly retrieved bytes.
    pub fn new(identifier: impl Into<String>, data: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            data,
            content_type: content_type.into(),
            transfer_syntax: None,
            decoded: false,
            metadata: DicomMetadata::default(),
            window: None,
            rescale: None,
            suv_factor: None,
            dose_grid_scaling: None,
        }
    }

    pub fn with_metadata(mut self, metadata: DicomMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Bytes accounted against the cache budget.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload already carries an explicit window/level.
    pub fn has_window(&self) -> bool {
        self.window.is_some() || self.metadata.window().is_some()
    }
}
