//! Identifier parsing.
//!
//! An identifier names one retrievable instance (or frame):
//!
//! ```text
//! wadouri:<study>/<series>/<object>
//! wadors:<study>/<series>/<instance>
//! wadors:<study>/<series>/<instance>/frames/<n>
//! wadors:<study>/<series>/<instance>/frames/<n>/rendered
//! <study>/<series>/<instance>          (protocol picked by the loader)
//! ```
//!
//! Frame numbers are 1-based, as in DICOMweb.

use std::fmt;

use crate::error::{LoaderError, Result};

/// Scheme prefix selecting WADO-URI retrieval.
pub const WADO_URI_SCHEME: &str = "wadouri:";

/// Scheme prefix selecting WADO-RS retrieval.
pub const WADO_RS_SCHEME: &str = "wadors:";

/// Retrieval protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Query-parameter style (WADO-URI)
    Uri,
    /// Resource-path style (WADO-RS)
    Rest,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Uri => f.write_str("wado-uri"),
            Protocol::Rest => f.write_str("wado-rs"),
        }
    }
}

/// Parsed identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    /// Explicit protocol from the scheme prefix, if any
    pub protocol: Option<Protocol>,
    pub study_uid: String,
    pub series_uid: String,
    pub object_uid: String,
    pub frame: Option<u32>,
    /// Request a server-rendered frame instead of DICOM bytes
    pub rendered: bool,
}

impl Locator {
    /// Build a locator for a whole instance.
    pub fn instance(
        study_uid: impl Into<String>,
        series_uid: impl Into<String>,
        object_uid: impl Into<String>,
    ) -> Self {
        Self {
            protocol: None,
            study_uid: study_uid.into(),
            series_uid: series_uid.into(),
            object_uid: object_uid.into(),
            frame: None,
            rendered: false,
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_frame(mut self, frame: u32, rendered: bool) -> Self {
        self.frame = Some(frame);
        self.rendered = rendered;
        self
    }

    /// Parse an identifier.
    pub fn parse(identifier: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            LoaderError::InvalidIdentifier(format!("{} ({})", identifier, reason))
        };

        let (protocol, rest) = if let Some(rest) = identifier.strip_prefix(WADO_URI_SCHEME) {
            (Some(Protocol::Uri), rest)
        } else if let Some(rest) = identifier.strip_prefix(WADO_RS_SCHEME) {
            (Some(Protocol::Rest), rest)
        } else {
            (None, identifier)
        };

        let segments: Vec<&str> = rest.split('/').collect();
        if segments.iter().any(|s| s.trim().is_empty()) {
            return Err(invalid("empty path segment"));
        }

        let (frame, rendered) = match segments.len() {
            3 => (None, false),
            5 | 6 => {
                if protocol == Some(Protocol::Uri) {
                    return Err(invalid("frames are only addressable over wado-rs"));
                }
                if segments[3] != "frames" {
                    return Err(invalid("expected 'frames' after the instance UID"));
                }
                let frame: u32 = segments[4]
                    .parse()
                    .map_err(|_| invalid("frame number is not an integer"))?;
                if frame == 0 {
                    return Err(invalid("frame numbers start at 1"));
                }
                let rendered = match segments.get(5) {
                    None => false,
                    Some(&"rendered") => true,
                    Some(_) => return Err(invalid("expected 'rendered' after the frame number")),
                };
                (Some(frame), rendered)
            }
            _ => return Err(invalid("expected <study>/<series>/<instance>")),
        };

        Ok(Self {
            protocol,
            study_uid: segments[0].to_string(),
            series_uid: segments[1].to_string(),
            object_uid: segments[2].to_string(),
            frame,
            rendered,
        })
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            Some(Protocol::Uri) => f.write_str(WADO_URI_SCHEME)?,
            Some(Protocol::Rest) => f.write_str(WADO_RS_SCHEME)?,
            None => {}
        }
        write!(f, "{}/{}/{}", self.study_uid, self.series_uid, self.object_uid)?;
        if let Some(frame) = self.frame {
            write!(f, "/frames/{}", frame)?;
            if self.rendered {
                f.write_str("/rendered")?;
            }
        }
        Ok(())
    }
}
