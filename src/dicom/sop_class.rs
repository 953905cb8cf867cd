//! SOP Class UIDs grouped by modality family.

pub const CT_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
pub const ENHANCED_CT_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.2.1";
pub const LEGACY_CONVERTED_ENHANCED_CT_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.2.2";

pub const MR_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
pub const ENHANCED_MR_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.4.1";
pub const ENHANCED_MR_COLOR_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.4.3";

pub const PET_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.128";
pub const ENHANCED_PET_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.130";

pub const COMPUTED_RADIOGRAPHY_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.1";
pub const DIGITAL_XRAY_PRESENTATION: &str = "1.2.840.10008.5.1.4.1.1.1.1";
pub const DIGITAL_XRAY_PROCESSING: &str = "1.2.840.10008.5.1.4.1.1.1.1.1";
pub const DIGITAL_MAMMOGRAPHY_PRESENTATION: &str = "1.2.840.10008.5.1.4.1.1.1.2";
pub const DIGITAL_MAMMOGRAPHY_PROCESSING: &str = "1.2.840.10008.5.1.4.1.1.1.2.1";
pub const BREAST_TOMOSYNTHESIS_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.13.1.3";

pub const RT_DOSE: &str = "1.2.840.10008.5.1.4.1.1.481.2";

pub const MULTIFRAME_SINGLE_BIT_SC: &str = "1.2.840.10008.5.1.4.1.1.7.1";
pub const MULTIFRAME_GRAYSCALE_BYTE_SC: &str = "1.2.840.10008.5.1.4.1.1.7.2";
pub const MULTIFRAME_GRAYSCALE_WORD_SC: &str = "1.2.840.10008.5.1.4.1.1.7.3";
pub const MULTIFRAME_TRUE_COLOR_SC: &str = "1.2.840.10008.5.1.4.1.1.7.4";
pub const ULTRASOUND_MULTIFRAME_IMAGE: &str = "1.2.840.10008.5.1.4.1.1.3.1";
pub const SEGMENTATION: &str = "1.2.840.10008.5.1.4.1.1.66.4";
