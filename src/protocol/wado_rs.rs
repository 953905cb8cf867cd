//! WADO-RS retrieval.
//!
//! Resources are addressed hierarchically and content is negotiated with
//! the `Accept` header:
//!
//! | Resource                                         | Accept                                  |
//! |--------------------------------------------------|-----------------------------------------|
//! | `/studies/{s}/series/{se}/instances/{i}`         | `application/dicom; transfer-syntax=*`  |
//! | `/studies/{s}/series/{se}/instances/{i}/metadata`| `application/dicom+json`                |
//! | `/studies/{s}/series/{se}/instances/{i}/frames/{n}` | multipart octet-stream               |
//! | `/studies/{s}/series/{se}/instances/{i}/frames/{n}/rendered` | `image/jpeg, image/png`     |
//!
//! `multipart/related` responses are reduced to their first part when
//! multipart support is enabled.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::locator::{Locator, Protocol};
use super::multipart;
use super::transport::HttpTransport;
use super::{
    media_type, ProtocolClient, RenderHints, RetrieveResponse, ACCEPT_DICOM, ACCEPT_DICOM_JSON,
    ACCEPT_FRAME_PIXELS, ACCEPT_RENDERED,
};
use crate::dicom::DicomMetadata;
use crate::error::{LoaderError, Result};

/// WADO-RS endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WadoRsConfig {
    pub base_url: String,
    /// Overrides the `Accept` header for instance retrieval
    pub accept_header: Option<String>,
    pub multipart_support: bool,
    /// Base URL for binary retrievals when bulk data is served elsewhere
    #[serde(rename = "bulkDataURI")]
    pub bulk_data_uri: Option<String>,
}

impl Default for WadoRsConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            accept_header: None,
            multipart_support: true,
            bulk_data_uri: None,
        }
    }
}

impl WadoRsConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }
}

/// Which representation of an instance to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resource {
    Instance,
    Metadata,
    Frame(u32),
    RenderedFrame(u32),
}

/// WADO-RS protocol client.
pub struct WadoRsClient {
    config: WadoRsConfig,
    base_url: Url,
    bulk_data_url: Option<Url>,
    transport: Arc<HttpTransport>,
}

impl WadoRsClient {
    /// Create a client. Fails with a configuration error on unparsable URLs.
    pub fn new(config: WadoRsConfig, transport: Arc<HttpTransport>) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)?;
        let bulk_data_url = config.bulk_data_uri.as_deref().map(Url::parse).transpose()?;
        Ok(Self {
            config,
            base_url,
            bulk_data_url,
            transport,
        })
    }

    pub fn config(&self) -> &WadoRsConfig {
        &self.config
    }

    fn resource_for(locator: &Locator) -> Resource {
        match (locator.frame, locator.rendered) {
            (Some(frame), true) => Resource::RenderedFrame(frame),
            (Some(frame), false) => Resource::Frame(frame),
            (None, _) => Resource::Instance,
        }
    }

    fn build_url(&self, locator: &Locator, resource: Resource) -> Result<Url> {
        let base = match (resource, &self.bulk_data_url) {
            (Resource::Instance | Resource::Frame(_), Some(bulk)) => bulk,
            _ => &self.base_url,
        };

        let mut path = format!(
            "{}/studies/{}/series/{}/instances/{}",
            base.path().trim_end_matches('/'),
            urlencoding::encode(&locator.study_uid),
            urlencoding::encode(&locator.series_uid),
            urlencoding::encode(&locator.object_uid),
        );
        match resource {
            Resource::Instance => {}
            Resource::Metadata => path.push_str("/metadata"),
            Resource::Frame(n) => path.push_str(&format!("/frames/{}", n)),
            Resource::RenderedFrame(n) => path.push_str(&format!("/frames/{}/rendered", n)),
        }

        let mut url = base.clone();
        url.set_path(&path);
        Ok(url)
    }

    /// URL of the binary or rendered representation named by `locator`.
    pub fn retrieve_url(&self, locator: &Locator) -> Result<Url> {
        self.build_url(locator, Self::resource_for(locator))
    }

    /// URL of the instance metadata.
    pub fn metadata_url(&self, locator: &Locator) -> Result<Url> {
        self.build_url(locator, Resource::Metadata)
    }

    fn accept_for(&self, resource: Resource) -> &str {
        match resource {
            Resource::Instance => self.config.accept_header.as_deref().unwrap_or(ACCEPT_DICOM),
            Resource::Metadata => ACCEPT_DICOM_JSON,
            Resource::Frame(_) => ACCEPT_FRAME_PIXELS,
            Resource::RenderedFrame(_) => ACCEPT_RENDERED,
        }
    }

    /// Reduce a multipart body to its first part when enabled.
    fn unwrap_multipart(&self, mut response: RetrieveResponse) -> RetrieveResponse {
        if !self.config.multipart_support || media_type(&response.content_type) != "multipart/related"
        {
            return response;
        }

        match multipart::first_part(&response.payload, &response.content_type) {
            Some(part) => {
                let outer_syntax = response.transfer_syntax();
                response.payload = part.body;
                if let Some(part_type) = part.content_type {
                    response.content_type = match outer_syntax {
                        Some(ts) if !part_type.contains("transfer-syntax") => {
                            format!("{}; transfer-syntax={}", part_type, ts)
                        }
                        _ => part_type,
                    };
                }
            }
            None => debug!(
                content_type = %response.content_type,
                "Multipart body could not be split, using the whole body"
            ),
        }
        response
    }
}

#[async_trait]
impl ProtocolClient for WadoRsClient {
    fn protocol(&self) -> Protocol {
        Protocol::Rest
    }

    async fn retrieve(
        &self,
        locator: &Locator,
        _hints: &RenderHints,
        cancel: &CancellationToken,
    ) -> Result<RetrieveResponse> {
        let resource = Self::resource_for(locator);
        let url = self.build_url(locator, resource)?;
        let response = self
            .transport
            .get(&url, self.accept_for(resource), cancel)
            .await?;
        Ok(self.unwrap_multipart(response))
    }

    async fn retrieve_metadata(
        &self,
        locator: &Locator,
        cancel: &CancellationToken,
    ) -> Result<Option<DicomMetadata>> {
        let url = self.metadata_url(locator)?;
        let response = self.transport.get(&url, ACCEPT_DICOM_JSON, cancel).await?;

        let document: serde_json::Value = serde_json::from_slice(&response.payload)
            .map_err(|e| LoaderError::Metadata(format!("invalid DICOM-JSON: {}", e)))?;

        DicomMetadata::from_dicom_json(&document).map(Some)
    }
}
