//! Built-in modality handlers.
//!
//! | Handler              | SOP classes                         | Default window              |
//! |----------------------|-------------------------------------|-----------------------------|
//! | [`CtHandler`]        | CT, Enhanced CT                     | lung: W 1500 / C -600       |
//! | [`MrHandler`]        | MR, Enhanced MR                     | full stored range           |
//! | [`PetHandler`]       | PET, Enhanced PET                   | SUV 0-5: W 5 / C 2.5        |
//! | [`XRayHandler`]      | CR, DX, mammography, tomosynthesis  | full stored range           |
//! | [`RtDoseHandler`]    | RT Dose                             | percent: W 100 / C 50       |
//! | [`MultiFrameHandler`]| multi-frame SC, US multi-frame, SEG | none                        |

use tracing::{debug, warn};

use super::ModalityHandler;
use crate::dicom::{sop_class, tags, DicomMetadata, ImagePayload, Rescale, Window};

/// Window used when the stored bit depth is unknown (12-bit data).
const FALLBACK_FULL_RANGE: Window = Window {
    width: 4096.0,
    center: 2048.0,
};

/// Window spanning the whole stored range.
fn full_range_window(metadata: &DicomMetadata) -> Window {
    match metadata.bits_stored {
        Some(bits) if (1..=32).contains(&bits) => {
            let range = 2f64.powi(bits as i32);
            Window::new(range, range / 2.0)
        }
        _ => FALLBACK_FULL_RANGE,
    }
}

fn rescale_from(metadata: &DicomMetadata) -> Option<Rescale> {
    if metadata.rescale_slope.is_none() && metadata.rescale_intercept.is_none() {
        return None;
    }
    Some(Rescale {
        slope: metadata.rescale_slope.unwrap_or(1.0),
        intercept: metadata.rescale_intercept.unwrap_or(0.0),
    })
}

fn warn_missing_geometry(handler: &str, identifier: &str, metadata: &DicomMetadata) {
    let mut missing = Vec::new();
    if metadata.rows.is_none() {
        missing.push("Rows");
    }
    if metadata.columns.is_none() {
        missing.push("Columns");
    }
    if metadata.sop_instance_uid.is_none() {
        missing.push("SOPInstanceUID");
    }
    if !missing.is_empty() {
        warn!(handler, identifier, ?missing, "Required attributes missing");
    }
}

// =============================================================================
// CT
// =============================================================================

/// CT: applies the modality LUT and defaults to a lung window.
#[derive(Debug, Default)]
pub struct CtHandler;

impl CtHandler {
    pub const LUNG_WINDOW: Window = Window {
        width: 1500.0,
        center: -600.0,
    };
}

impl ModalityHandler for CtHandler {
    fn name(&self) -> &str {
        "ct"
    }

    fn can_handle(&self, sop_class_uid: &str) -> bool {
        matches!(
            sop_class_uid,
            sop_class::CT_IMAGE
                | sop_class::ENHANCED_CT_IMAGE
                | sop_class::LEGACY_CONVERTED_ENHANCED_CT_IMAGE
        )
    }

    fn pre_process(&self, identifier: &str, metadata: &DicomMetadata) {
        warn_missing_geometry(self.name(), identifier, metadata);
        if metadata.rescale_slope.is_none() || metadata.rescale_intercept.is_none() {
            warn!(identifier, "CT instance without rescale slope/intercept");
        }
    }

    fn post_process(&self, _identifier: &str, mut payload: ImagePayload) -> ImagePayload {
        payload.rescale = rescale_from(&payload.metadata);
        payload
    }

    fn default_window(&self, _metadata: &DicomMetadata) -> Option<Window> {
        Some(Self::LUNG_WINDOW)
    }
}

// =============================================================================
// MR
// =============================================================================

/// MR: no modality LUT, full-range default window.
#[derive(Debug, Default)]
pub struct MrHandler;

impl ModalityHandler for MrHandler {
    fn name(&self) -> &str {
        "mr"
    }

    fn can_handle(&self, sop_class_uid: &str) -> bool {
        matches!(
            sop_class_uid,
            sop_class::MR_IMAGE | sop_class::ENHANCED_MR_IMAGE | sop_class::ENHANCED_MR_COLOR_IMAGE
        )
    }

    fn pre_process(&self, identifier: &str, metadata: &DicomMetadata) {
        warn_missing_geometry(self.name(), identifier, metadata);
    }

    fn default_window(&self, metadata: &DicomMetadata) -> Option<Window> {
        Some(full_range_window(metadata))
    }
}

// =============================================================================
// PET
// =============================================================================

/// PET: derives the SUV body-weight factor when weight and dose are known.
#[derive(Debug, Default)]
pub struct PetHandler;

impl PetHandler {
    pub const SUV_WINDOW: Window = Window {
        width: 5.0,
        center: 2.5,
    };

    /// `weight[g] / injected dose[Bq]`
    fn suv_factor(metadata: &DicomMetadata) -> Option<f64> {
        let weight_kg = metadata.custom_number(tags::PATIENT_WEIGHT)?;
        let dose = metadata.custom_sequence_number(
            tags::RADIOPHARMACEUTICAL_INFO_SEQUENCE,
            tags::RADIONUCLIDE_TOTAL_DOSE,
        )?;
        (weight_kg > 0.0 && dose > 0.0).then(|| weight_kg * 1000.0 / dose)
    }
}

impl ModalityHandler for PetHandler {
    fn name(&self) -> &str {
        "pet"
    }

    fn can_handle(&self, sop_class_uid: &str) -> bool {
        matches!(
            sop_class_uid,
            sop_class::PET_IMAGE | sop_class::ENHANCED_PET_IMAGE
        )
    }

    fn pre_process(&self, identifier: &str, metadata: &DicomMetadata) {
        warn_missing_geometry(self.name(), identifier, metadata);
        if Self::suv_factor(metadata).is_none() {
            warn!(
                identifier,
                "PET instance without patient weight or injected dose, SUV unavailable"
            );
        }
    }

    fn post_process(&self, _identifier: &str, mut payload: ImagePayload) -> ImagePayload {
        payload.rescale = rescale_from(&payload.metadata);
        payload.suv_factor = Self::suv_factor(&payload.metadata);
        payload
    }

    fn default_window(&self, _metadata: &DicomMetadata) -> Option<Window> {
        Some(Self::SUV_WINDOW)
    }
}

// =============================================================================
// X-ray and mammography
// =============================================================================

/// Projection radiography (CR, DX) and mammography.
#[derive(Debug, Default)]
pub struct XRayHandler;

impl ModalityHandler for XRayHandler {
    fn name(&self) -> &str {
        "xray"
    }

    fn can_handle(&self, sop_class_uid: &str) -> bool {
        matches!(
            sop_class_uid,
            sop_class::COMPUTED_RADIOGRAPHY_IMAGE
                | sop_class::DIGITAL_XRAY_PRESENTATION
                | sop_class::DIGITAL_XRAY_PROCESSING
                | sop_class::DIGITAL_MAMMOGRAPHY_PRESENTATION
                | sop_class::DIGITAL_MAMMOGRAPHY_PROCESSING
                | sop_class::BREAST_TOMOSYNTHESIS_IMAGE
        )
    }

    fn pre_process(&self, identifier: &str, metadata: &DicomMetadata) {
        warn_missing_geometry(self.name(), identifier, metadata);
    }

    fn post_process(&self, _identifier: &str, mut payload: ImagePayload) -> ImagePayload {
        payload.rescale = rescale_from(&payload.metadata);
        payload
    }

    fn default_window(&self, metadata: &DicomMetadata) -> Option<Window> {
        Some(full_range_window(metadata))
    }
}

// =============================================================================
// RT Dose
// =============================================================================

/// RT dose grids, displayed as a percentage of the maximum dose.
#[derive(Debug, Default)]
pub struct RtDoseHandler;

impl RtDoseHandler {
    pub const PERCENT_WINDOW: Window = Window {
        width: 100.0,
        center: 50.0,
    };
}

impl ModalityHandler for RtDoseHandler {
    fn name(&self) -> &str {
        "rtdose"
    }

    fn can_handle(&self, sop_class_uid: &str) -> bool {
        sop_class_uid == sop_class::RT_DOSE
    }

    fn pre_process(&self, identifier: &str, metadata: &DicomMetadata) {
        if metadata.custom_number(tags::DOSE_GRID_SCALING).is_none() {
            warn!(identifier, "RT dose without DoseGridScaling");
        }
    }

    fn post_process(&self, _identifier: &str, mut payload: ImagePayload) -> ImagePayload {
        payload.dose_grid_scaling = payload.metadata.custom_number(tags::DOSE_GRID_SCALING);
        payload
    }

    fn default_window(&self, _metadata: &DicomMetadata) -> Option<Window> {
        Some(Self::PERCENT_WINDOW)
    }
}

// =============================================================================
// Multi-frame / segmentation
// =============================================================================

/// Multi-frame secondary capture, ultrasound cine and segmentations.
///
/// Payloads pass through untouched and get no default window.
#[derive(Debug, Default)]
pub struct MultiFrameHandler;

impl ModalityHandler for MultiFrameHandler {
    fn name(&self) -> &str {
        "multiframe"
    }

    fn can_handle(&self, sop_class_uid: &str) -> bool {
        matches!(
            sop_class_uid,
            sop_class::MULTIFRAME_SINGLE_BIT_SC
                | sop_class::MULTIFRAME_GRAYSCALE_BYTE_SC
                | sop_class::MULTIFRAME_GRAYSCALE_WORD_SC
                | sop_class::MULTIFRAME_TRUE_COLOR_SC
                | sop_class::ULTRASOUND_MULTIFRAME_IMAGE
                | sop_class::SEGMENTATION
        )
    }

    fn pre_process(&self, identifier: &str, metadata: &DicomMetadata) {
        if metadata.number_of_frames.is_none() {
            debug!(identifier, "Multi-frame instance without NumberOfFrames");
        }
    }

    fn default_window(&self, _metadata: &DicomMetadata) -> Option<Window> {
        None
    }
}
