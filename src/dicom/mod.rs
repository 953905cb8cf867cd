//! DICOM data model shared by every component.
//!
//! - [`DicomMetadata`]: per-instance attributes, built from DICOM-JSON
//! - [`ImagePayload`]: retrieved bytes plus derived display parameters
//! - [`sop_class`]: SOP Class UIDs used for modality dispatch

mod metadata;
mod payload;
pub mod sop_class;

pub use metadata::{tags, DicomMetadata, Window, WindowValue};
pub use payload::{ImagePayload, Rescale};

/// Explicit VR Little Endian, assumed when nothing else is known.
pub const DEFAULT_TRANSFER_SYNTAX: &str = "1.2.840.10008.1.2.1";
