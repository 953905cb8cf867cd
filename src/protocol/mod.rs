//! Retrieval protocols.
//!
//! Two clients implement the same [`ProtocolClient`] contract:
//!
//! ```text
//! ┌──────────────────────┐      ┌──────────────────────┐
//! │    WadoUriClient     │      │     WadoRsClient     │
//! │ ?requestType=WADO&.. │      │ /studies/../series/..│
//! └──────────┬───────────┘      └──────────┬───────────┘
//!            └─────────────┬───────────────┘
//!                          ▼
//!              ┌──────────────────────┐
//!              │    HttpTransport     │
//!              │ auth + retry + abort │
//!              └──────────────────────┘
//! ```
//!
//! - [`Locator`]: parsed identifier
//! - [`RetryPolicy`]: retry eligibility and backoff
//! - [`AuthConfig`]: header injection (basic, bearer, custom)

use async_trait::async_trait;
use bytes::Bytes;
use http::HeaderMap;
use tokio_util::sync::CancellationToken;

use crate::dicom::DicomMetadata;
use crate::error::Result;

mod auth;
mod locator;
pub mod multipart;
mod retry;
mod transport;
mod wado_rs;
mod wado_uri;

pub use auth::{AuthConfig, HeaderProvider};
pub use locator::{Locator, Protocol, WADO_RS_SCHEME, WADO_URI_SCHEME};
pub use retry::{default_retry_predicate, RetryConfig, RetryPolicy, RetryPredicate};
pub use transport::{HttpTransport, DEFAULT_REQUEST_TIMEOUT};
pub use wado_rs::{WadoRsClient, WadoRsConfig};
pub use wado_uri::{WadoUriClient, WadoUriConfig};

/// `Accept` for DICOM instances in any transfer syntax.
pub const ACCEPT_DICOM: &str = "application/dicom; transfer-syntax=*";

/// `Accept` for DICOM-JSON metadata.
pub const ACCEPT_DICOM_JSON: &str = "application/dicom+json";

/// `Accept` for server-rendered frames.
pub const ACCEPT_RENDERED: &str = "image/jpeg, image/png";

/// `Accept` for raw frame pixel data.
pub const ACCEPT_FRAME_PIXELS: &str =
    "multipart/related; type=\"application/octet-stream\"; transfer-syntax=*";

/// Raw response of a retrieval.
#[derive(Debug, Clone)]
pub struct RetrieveResponse {
    pub payload: Bytes,
    pub headers: HeaderMap,
    pub status: u16,
    pub content_type: String,
}

impl RetrieveResponse {
    /// Transfer syntax announced in the `Content-Type`, if any.
    pub fn transfer_syntax(&self) -> Option<String> {
        content_type_param(&self.content_type, "transfer-syntax")
    }
}

/// Server-side rendering hints. Only WADO-URI forwards them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderHints {
    pub rows: Option<u32>,
    pub columns: Option<u32>,
    /// Normalized region `x1,y1,x2,y2` in `[0, 1]`
    pub region: Option<[f64; 4]>,
    pub window_center: Option<f64>,
    pub window_width: Option<f64>,
    /// JPEG quality 1-100
    pub quality: Option<u8>,
}

/// A retrieval protocol.
///
/// Implementations build the request for a [`Locator`], execute it under
/// their retry policy and return the (possibly unwrapped) response body.
/// They fail with `Protocol`, `Transport`/`Timeout` or `Cancelled` errors.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Retrieve the binary payload (DICOM instance, frame or rendered image).
    async fn retrieve(
        &self,
        locator: &Locator,
        hints: &RenderHints,
        cancel: &CancellationToken,
    ) -> Result<RetrieveResponse>;

    /// Retrieve instance metadata, if the protocol can.
    async fn retrieve_metadata(
        &self,
        _locator: &Locator,
        _cancel: &CancellationToken,
    ) -> Result<Option<DicomMetadata>> {
        Ok(None)
    }
}

/// Read a parameter from a media type such as
/// `multipart/related; type="application/dicom"; boundary=abc`.
pub fn content_type_param(content_type: &str, name: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case(name) {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Media type without parameters, lowercased.
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}
