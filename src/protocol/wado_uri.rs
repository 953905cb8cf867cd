//! WADO-URI retrieval.
//!
//! A single GET with everything in the query string:
//!
//! ```text
//! {baseUrl}?requestType=WADO&studyUID=..&seriesUID=..&objectUID=..
//!          &contentType=application/dicom[&transferSyntax=..][&rows=..]
//!          [&columns=..][&region=..][&windowCenter=..][&windowWidth=..]
//!          [&imageQuality=..]
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::locator::{Locator, Protocol};
use super::transport::HttpTransport;
use super::{ProtocolClient, RenderHints, RetrieveResponse};
use crate::error::{LoaderError, Result};

/// WADO-URI endpoint configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WadoUriConfig {
    pub base_url: String,
    pub study_param: String,
    pub series_param: String,
    pub object_param: String,
    pub content_type: String,
    pub transfer_syntax: Option<String>,
}

impl Default for WadoUriConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            study_param: "studyUID".to_string(),
            series_param: "seriesUID".to_string(),
            object_param: "objectUID".to_string(),
            content_type: "application/dicom".to_string(),
            transfer_syntax: None,
        }
    }
}

impl WadoUriConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }
}

/// WADO-URI protocol client.
pub struct WadoUriClient {
    config: WadoUriConfig,
    base_url: Url,
    transport: Arc<HttpTransport>,
}

impl WadoUriClient {
    /// Create a client. Fails with a configuration error on an unparsable base URL.
    pub fn new(config: WadoUriConfig, transport: Arc<HttpTransport>) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)?;
        Ok(Self {
            config,
            base_url,
            transport,
        })
    }

    pub fn config(&self) -> &WadoUriConfig {
        &self.config
    }

    /// Build the query-parameterized request URL.
    pub fn build_url(&self, locator: &Locator, hints: &RenderHints) -> Result<Url> {
        if locator.frame.is_some() {
            return Err(LoaderError::InvalidIdentifier(format!(
                "{} (frames are not addressable over wado-uri)",
                locator
            )));
        }

        let mut url = self.base_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("requestType", "WADO")
                .append_pair(&self.config.study_param, &locator.study_uid)
                .append_pair(&self.config.series_param, &locator.series_uid)
                .append_pair(&self.config.object_param, &locator.object_uid)
                .append_pair("contentType", &self.config.content_type);

            if let Some(ref transfer_syntax) = self.config.transfer_syntax {
                query.append_pair("transferSyntax", transfer_syntax);
            }
            if let Some(rows) = hints.rows {
                query.append_pair("rows", &rows.to_string());
            }
            if let Some(columns) = hints.columns {
                query.append_pair("columns", &columns.to_string());
            }
            if let Some([x1, y1, x2, y2]) = hints.region {
                query.append_pair("region", &format!("{},{},{},{}", x1, y1, x2, y2));
            }
            if let Some(center) = hints.window_center {
                query.append_pair("windowCenter", &center.to_string());
            }
            if let Some(width) = hints.window_width {
                query.append_pair("windowWidth", &width.to_string());
            }
            if let Some(quality) = hints.quality {
                query.append_pair("imageQuality", &quality.to_string());
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl ProtocolClient for WadoUriClient {
    fn protocol(&self) -> Protocol {
        Protocol::Uri
    }

    async fn retrieve(
        &self,
        locator: &Locator,
        hints: &RenderHints,
        cancel: &CancellationToken,
    ) -> Result<RetrieveResponse> {
        let url = self.build_url(locator, hints)?;
        self.transport
            .get(&url, &self.config.content_type, cancel)
            .await
    }
}
