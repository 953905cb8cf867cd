//! Pixel decoding seam.
//!
//! The loader does not decode compressed pixel data itself. A decoder can be
//! plugged in; it runs on the blocking pool so codec work never stalls the
//! async runtime.

use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

use crate::dicom::DicomMetadata;
use crate::error::LoaderError;

/// Failure reported by a [`PixelDecoder`].
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct DecodeError(pub String);

impl From<DecodeError> for LoaderError {
    fn from(e: DecodeError) -> Self {
        LoaderError::Decode(e.0)
    }
}

/// Output of a decoder.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub pixels: Bytes,
    /// Attributes the decoder read from the dataset, merged where the loader has none
    pub metadata: Option<DicomMetadata>,
}

/// Decodes retrieved bytes into pixel data.
pub trait PixelDecoder: Send + Sync {
    fn decode(&self, data: Bytes, transfer_syntax: &str) -> Result<DecodedImage, DecodeError>;
}

/// Run `decoder` on the blocking pool.
pub(crate) async fn decode_blocking(
    decoder: std::sync::Arc<dyn PixelDecoder>,
    data: Bytes,
    transfer_syntax: String,
) -> Result<DecodedImage, LoaderError> {
    debug!(bytes = data.len(), transfer_syntax = %transfer_syntax, "Decoding pixel data");
    tokio::task::spawn_blocking(move || decoder.decode(data, &transfer_syntax))
        .await
        .map_err(|e| LoaderError::Decode(format!("decoder task failed: {}", e)))?
        .map_err(LoaderError::from)
}
