//! Test utilities for integration tests.
//!
//! Helpers for standing up a mock DICOMweb server with wiremock and building
//! loaders pointed at it.

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dicom_loader::protocol::{WadoRsConfig, WadoUriConfig};
use dicom_loader::{LoadCoordinator, LoaderConfig};

pub const STUDY: &str = "1.2.840.113619.2.1";
pub const SERIES: &str = "1.2.840.113619.2.1.1";

pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
pub const PET_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.128";

pub const BOUNDARY: &str = "DICOMwebBoundary";

// =============================================================================
// Configuration
// =============================================================================

/// Loader options with fast retries.
pub fn base_config() -> LoaderConfig {
    LoaderConfig {
        retry_attempts: 3,
        retry_delay: 10,
        max_retry_delay: 50,
        request_timeout: 5_000,
        ..Default::default()
    }
}

pub fn rs_config(server: &MockServer) -> LoaderConfig {
    LoaderConfig {
        wado_rs: Some(WadoRsConfig::new(server.uri())),
        ..base_config()
    }
}

pub fn uri_config(server: &MockServer) -> LoaderConfig {
    LoaderConfig {
        wado_uri: Some(WadoUriConfig::new(format!("{}/wado", server.uri()))),
        ..base_config()
    }
}

pub fn loader(config: LoaderConfig) -> LoadCoordinator {
    LoadCoordinator::new(config).expect("valid test config")
}

// =============================================================================
// Identifiers and paths
// =============================================================================

pub fn rs_id(instance: &str) -> String {
    format!("wadors:{}/{}/{}", STUDY, SERIES, instance)
}

pub fn uri_id(instance: &str) -> String {
    format!("wadouri:{}/{}/{}", STUDY, SERIES, instance)
}

pub fn instance_path(instance: &str) -> String {
    format!("/studies/{}/series/{}/instances/{}", STUDY, SERIES, instance)
}

pub fn metadata_path(instance: &str) -> String {
    format!("{}/metadata", instance_path(instance))
}

// =============================================================================
// Payloads
// =============================================================================

/// Fake DICOM bytes: preamble, magic, then filler.
pub fn dicom_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; 128];
    data.extend_from_slice(b"DICM");
    data.resize(len.max(132), 0xAB);
    data
}

/// Minimal DICOM-JSON instance metadata.
pub fn dicom_json(instance: &str, sop_class: &str, modality: &str, instance_number: i32) -> Value {
    json!([{
        "0020000D": { "vr": "UI", "Value": [STUDY] },
        "0020000E": { "vr": "UI", "Value": [SERIES] },
        "00080018": { "vr": "UI", "Value": [instance] },
        "00080016": { "vr": "UI", "Value": [sop_class] },
        "00080060": { "vr": "CS", "Value": [modality] },
        "00200013": { "vr": "IS", "Value": [instance_number] },
        "00280010": { "vr": "US", "Value": [512] },
        "00280011": { "vr": "US", "Value": [512] }
    }])
}

/// Single-part `multipart/related` body and its content type.
pub fn multipart(part_type: &str, data: &[u8]) -> (Vec<u8>, String) {
    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", part_type).as_bytes());
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    let content_type = format!(
        "multipart/related; type=\"{}\"; boundary={}",
        part_type, BOUNDARY
    );
    (body, content_type)
}

// =============================================================================
// Mock mounting
// =============================================================================

/// Serve an instance and its metadata.
pub async fn mount_instance(
    server: &MockServer,
    instance: &str,
    sop_class: &str,
    modality: &str,
    instance_number: i32,
    size: usize,
) {
    Mock::given(method("GET"))
        .and(path(metadata_path(instance)))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(dicom_json(instance, sop_class, modality, instance_number)),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(instance_path(instance)))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(dicom_bytes(size), "application/dicom"),
        )
        .mount(server)
        .await;
}
