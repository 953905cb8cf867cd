//! DICOM metadata model and DICOM-JSON conversion.
//!
//! WADO-RS metadata responses use the DICOM JSON model (PS3.18 F.2), where
//! every attribute is keyed by its eight-digit group/element tag:
//!
//! ```text
//! {
//!   "0020000D": { "vr": "UI", "Value": ["1.2.840.113619.2.55.3"] },
//!   "00280010": { "vr": "US", "Value": [512] },
//!   "00100010": { "vr": "PN", "Value": [{ "Alphabetic": "DOE^JANE" }] }
//! }
//! ```
//!
//! Well-known tags are mapped onto [`DicomMetadata`] fields. A missing tag
//! leaves its field unset; it is never an error. Tags without a dedicated
//! field are kept verbatim in `custom_metadata`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{LoaderError, Result};

/// Group/element keys of the attributes mapped onto [`DicomMetadata`].
pub mod tags {
    pub const TRANSFER_SYNTAX_UID: &str = "00020010";
    pub const SOP_CLASS_UID: &str = "00080016";
    pub const SOP_INSTANCE_UID: &str = "00080018";
    pub const MODALITY: &str = "00080060";
    pub const PATIENT_NAME: &str = "00100010";
    pub const PATIENT_ID: &str = "00100020";
    pub const PATIENT_WEIGHT: &str = "00101030";
    pub const SLICE_THICKNESS: &str = "00180050";
    pub const RADIONUCLIDE_TOTAL_DOSE: &str = "00181074";
    pub const STUDY_INSTANCE_UID: &str = "0020000D";
    pub const SERIES_INSTANCE_UID: &str = "0020000E";
    pub const INSTANCE_NUMBER: &str = "00200013";
    pub const IMAGE_POSITION_PATIENT: &str = "00200032";
    pub const NUMBER_OF_FRAMES: &str = "00280008";
    pub const ROWS: &str = "00280010";
    pub const COLUMNS: &str = "00280011";
    pub const PIXEL_SPACING: &str = "00280030";
    pub const BITS_STORED: &str = "00280101";
    pub const WINDOW_CENTER: &str = "00281050";
    pub const WINDOW_WIDTH: &str = "00281051";
    pub const RESCALE_INTERCEPT: &str = "00281052";
    pub const RESCALE_SLOPE: &str = "00281053";
    pub const DOSE_GRID_SCALING: &str = "3004000E";
    pub const RADIOPHARMACEUTICAL_INFO_SEQUENCE: &str = "00540016";
}

// =============================================================================
// Window / Level
// =============================================================================

/// Linear mapping from stored intensity to displayed grayscale range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
    pub width: f64,
    pub center: f64,
}

impl Window {
    pub fn new(width: f64, center: f64) -> Self {
        Self { width, center }
    }
}

/// Window center or width as stored in the dataset.
///
/// Multi-frame instances may carry one value per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WindowValue {
    Single(f64),
    PerFrame(Vec<f64>),
}

impl WindowValue {
    /// The value applying to the first frame.
    pub fn first(&self) -> Option<f64> {
        match self {
            WindowValue::Single(v) => Some(*v),
            WindowValue::PerFrame(values) => values.first().copied(),
        }
    }

    fn from_values(values: Vec<f64>) -> Option<Self> {
        match values.len() {
            0 => None,
            1 => Some(WindowValue::Single(values[0])),
            _ => Some(WindowValue::PerFrame(values)),
        }
    }
}

// =============================================================================
// DicomMetadata
// =============================================================================

/// Metadata describing one DICOM instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DicomMetadata {
    pub study_uid: Option<String>,
    pub series_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub sop_class_uid: Option<String>,
    pub modality: Option<String>,
    pub patient_name: Option<String>,
    pub patient_id: Option<String>,
    pub rows: Option<u32>,
    pub columns: Option<u32>,
    /// Row spacing then column spacing, in millimetres
    pub pixel_spacing: Option<[f64; 2]>,
    pub slice_thickness: Option<f64>,
    pub window_center: Option<WindowValue>,
    pub window_width: Option<WindowValue>,
    pub instance_number: Option<i32>,
    pub image_position_patient: Option<[f64; 3]>,
    pub rescale_slope: Option<f64>,
    pub rescale_intercept: Option<f64>,
    pub bits_stored: Option<u16>,
    pub number_of_frames: Option<u32>,
    pub transfer_syntax_uid: Option<String>,
    /// Attributes without a dedicated field, keyed by tag
    pub custom_metadata: BTreeMap<String, Value>,
}

impl DicomMetadata {
    /// Convert a DICOM-JSON document into metadata.
    ///
    /// WADO-RS returns an array of instance objects; the first element is
    /// used. A bare object is accepted too.
    pub fn from_dicom_json(document: &Value) -> Result<Self> {
        let object = match document {
            Value::Array(items) => items
                .first()
                .and_then(Value::as_object)
                .ok_or_else(|| LoaderError::Metadata("empty DICOM-JSON array".to_string()))?,
            Value::Object(object) => object,
            other => {
                return Err(LoaderError::Metadata(format!(
                    "expected a DICOM-JSON object or array, got {}",
                    json_kind(other)
                )))
            }
        };

        let mut metadata = DicomMetadata {
            study_uid: first_string(object, tags::STUDY_INSTANCE_UID),
            series_uid: first_string(object, tags::SERIES_INSTANCE_UID),
            sop_instance_uid: first_string(object, tags::SOP_INSTANCE_UID),
            sop_class_uid: first_string(object, tags::SOP_CLASS_UID),
            modality: first_string(object, tags::MODALITY),
            patient_name: person_name(object, tags::PATIENT_NAME),
            patient_id: first_string(object, tags::PATIENT_ID),
            rows: first_number(object, tags::ROWS).map(|v| v as u32),
            columns: first_number(object, tags::COLUMNS).map(|v| v as u32),
            pixel_spacing: fixed_numbers::<2>(object, tags::PIXEL_SPACING),
            slice_thickness: first_number(object, tags::SLICE_THICKNESS),
            window_center: WindowValue::from_values(numbers(object, tags::WINDOW_CENTER)),
            window_width: WindowValue::from_values(numbers(object, tags::WINDOW_WIDTH)),
            instance_number: first_number(object, tags::INSTANCE_NUMBER).map(|v| v as i32),
            image_position_patient: fixed_numbers::<3>(object, tags::IMAGE_POSITION_PATIENT),
            rescale_slope: first_number(object, tags::RESCALE_SLOPE),
            rescale_intercept: first_number(object, tags::RESCALE_INTERCEPT),
            bits_stored: first_number(object, tags::BITS_STORED).map(|v| v as u16),
            number_of_frames: first_number(object, tags::NUMBER_OF_FRAMES).map(|v| v as u32),
            transfer_syntax_uid: first_string(object, tags::TRANSFER_SYNTAX_UID),
            custom_metadata: BTreeMap::new(),
        };

        for (tag, attribute) in object {
            if is_mapped(tag) {
                continue;
            }
            if let Some(values) = attribute.get("Value") {
                metadata.custom_metadata.insert(tag.to_uppercase(), values.clone());
            }
        }

        Ok(metadata)
    }

    /// Explicit window/level from the dataset, using the first frame's values.
    pub fn window(&self) -> Option<Window> {
        let center = self.window_center.as_ref()?.first()?;
        let width = self.window_width.as_ref()?.first()?;
        Some(Window::new(width, center))
    }

    /// First numeric value of an unmapped attribute.
    pub fn custom_number(&self, tag: &str) -> Option<f64> {
        self.custom_metadata
            .get(tag)
            .and_then(|values| values.as_array())
            .and_then(|values| values.first())
            .and_then(number_value)
    }

    /// First numeric value of `tag` inside the first item of sequence `sequence_tag`.
    pub fn custom_sequence_number(&self, sequence_tag: &str, tag: &str) -> Option<f64> {
        let item = self
            .custom_metadata
            .get(sequence_tag)?
            .as_array()?
            .first()?
            .as_object()?;
        first_number(item, tag)
    }

    /// Merge fields from `other` into `self` where `self` has none.
    pub fn fill_missing(&mut self, other: &DicomMetadata) {
        macro_rules! fill {
            ($($field:ident),*) => {
                $(if self.$field.is_none() {
                    self.$field = other.$field.clone();
                })*
            };
        }
        fill!(
            study_uid,
            series_uid,
            sop_instance_uid,
            sop_class_uid,
            modality,
            patient_name,
            patient_id,
            rows,
            columns,
            pixel_spacing,
            slice_thickness,
            window_center,
            window_width,
            instance_number,
            image_position_patient,
            rescale_slope,
            rescale_intercept,
            bits_stored,
            number_of_frames,
            transfer_syntax_uid
        );
        for (tag, value) in &other.custom_metadata {
            self.custom_metadata
                .entry(tag.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

// =============================================================================
// DICOM-JSON helpers
// =============================================================================

const MAPPED_TAGS: &[&str] = &[
    tags::TRANSFER_SYNTAX_UID,
    tags::SOP_CLASS_UID,
    tags::SOP_INSTANCE_UID,
    tags::MODALITY,
    tags::PATIENT_NAME,
    tags::PATIENT_ID,
    tags::SLICE_THICKNESS,
    tags::STUDY_INSTANCE_UID,
    tags::SERIES_INSTANCE_UID,
    tags::INSTANCE_NUMBER,
    tags::IMAGE_POSITION_PATIENT,
    tags::NUMBER_OF_FRAMES,
    tags::ROWS,
    tags::COLUMNS,
    tags::PIXEL_SPACING,
    tags::BITS_STORED,
    tags::WINDOW_CENTER,
    tags::WINDOW_WIDTH,
    tags::RESCALE_INTERCEPT,
    tags::RESCALE_SLOPE,
];

fn is_mapped(tag: &str) -> bool {
    MAPPED_TAGS.iter().any(|known| known.eq_ignore_ascii_case(tag))
}

/// Look up an attribute's `Value` array, tolerating lowercase hex in keys.
fn values<'a>(object: &'a Map<String, Value>, tag: &str) -> Option<&'a Vec<Value>> {
    let attribute = object.get(tag).or_else(|| {
        object
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(tag))
            .map(|(_, value)| value)
    })?;
    attribute.get("Value")?.as_array()
}

fn first_string(object: &Map<String, Value>, tag: &str) -> Option<String> {
    match values(object, tag)?.first()? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Numbers may be JSON numbers or, for DS/IS values, numeric strings.
fn number_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn first_number(object: &Map<String, Value>, tag: &str) -> Option<f64> {
    values(object, tag)?.first().and_then(number_value)
}

fn numbers(object: &Map<String, Value>, tag: &str) -> Vec<f64> {
    values(object, tag)
        .map(|values| values.iter().filter_map(number_value).collect())
        .unwrap_or_default()
}

fn fixed_numbers<const N: usize>(object: &Map<String, Value>, tag: &str) -> Option<[f64; N]> {
    let values = numbers(object, tag);
    values.get(..N)?.try_into().ok()
}

fn person_name(object: &Map<String, Value>, tag: &str) -> Option<String> {
    match values(object, tag)?.first()? {
        Value::Object(name) => name
            .get("Alphabetic")
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
