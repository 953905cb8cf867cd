//! Protocol-level tests: request construction, auth, retry and response handling.

use std::time::Duration;

use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dicom_loader::protocol::WadoRsConfig;
use dicom_loader::{AuthConfig, LoadOptions, LoaderConfig, LoaderError, RenderHints};

use super::test_utils::*;

// =============================================================================
// WADO-URI
// =============================================================================

#[tokio::test]
async fn test_wado_uri_query_parameters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .and(query_param("requestType", "WADO"))
        .and(query_param("studyUID", STUDY))
        .and(query_param("seriesUID", SERIES))
        .and(query_param("objectUID", "1.1"))
        .and(query_param("contentType", "application/dicom"))
        .and(header("accept", "application/dicom"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(512), "application/dicom"))
        .expect(1)
        .mount(&server)
        .await;

    let loader = loader(uri_config(&server));
    let image = loader
        .load_image(&uri_id("1.1"), LoadOptions::default())
        .await
        .unwrap();

    assert_eq!(image.size_bytes(), 512);
    assert_eq!(image.transfer_syntax.as_deref(), Some("1.2.840.10008.1.2.1"));
    assert_eq!(image.metadata.study_uid.as_deref(), Some(STUDY));
    assert_eq!(image.metadata.sop_instance_uid.as_deref(), Some("1.1"));
}

#[tokio::test]
async fn test_wado_uri_render_hints() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .and(query_param("rows", "256"))
        .and(query_param("columns", "128"))
        .and(query_param("windowCenter", "40"))
        .and(query_param("windowWidth", "400"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0xFFu8, 0xD8, 0xFF], "image/jpeg"))
        .expect(1)
        .mount(&server)
        .await;

    let loader = loader(uri_config(&server));
    let options = LoadOptions {
        render_hints: RenderHints {
            rows: Some(256),
            columns: Some(128),
            window_center: Some(40.0),
            window_width: Some(400.0),
            ..Default::default()
        },
        ..Default::default()
    };
    let image = loader.load_image(&uri_id("1.2"), options).await.unwrap();

    assert_eq!(image.content_type, "image/jpeg");
    assert!(image.transfer_syntax.is_none());
}

#[tokio::test]
async fn test_bare_identifier_uses_configured_protocol() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .and(query_param("objectUID", "9"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(200), "application/dicom"))
        .expect(1)
        .mount(&server)
        .await;

    let loader = loader(uri_config(&server));
    let image = loader
        .load_image(&format!("{}/{}/9", STUDY, SERIES), LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(image.size_bytes(), 200);
}

// =============================================================================
// Authentication
// =============================================================================

#[tokio::test]
async fn test_bearer_token_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .and(header("authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(200), "application/dicom"))
        .expect(1)
        .mount(&server)
        .await;

    let config = LoaderConfig {
        auth: AuthConfig::Bearer {
            token: "secret-token".into(),
        },
        ..uri_config(&server)
    };
    loader(config)
        .load_image(&uri_id("1.3"), LoadOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_basic_auth_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .and(header("authorization", "Basic dXNlcjpwYXNz"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(200), "application/dicom"))
        .expect(1)
        .mount(&server)
        .await;

    let config = LoaderConfig {
        auth: AuthConfig::Basic {
            username: "user".into(),
            password: "pass".into(),
        },
        ..uri_config(&server)
    };
    loader(config)
        .load_image(&uri_id("1.4"), LoadOptions::default())
        .await
        .unwrap();
}

// =============================================================================
// Retry
// =============================================================================

#[tokio::test]
async fn test_server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(300), "application/dicom"))
        .expect(1)
        .mount(&server)
        .await;

    let image = loader(uri_config(&server))
        .load_image(&uri_id("2.1"), LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(image.size_bytes(), 300);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
        .expect(3)
        .mount(&server)
        .await;

    let err = loader(uri_config(&server))
        .load_image(&uri_id("2.2"), LoadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(503));
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such object"))
        .expect(1)
        .mount(&server)
        .await;

    let err = loader(uri_config(&server))
        .load_image(&uri_id("2.3"), LoadOptions::default())
        .await
        .unwrap_err();
    match err {
        LoaderError::Protocol { status, message } => {
            assert_eq!(status, 404);
            assert_eq!(message, "no such object");
        }
        other => panic!("expected protocol error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(dicom_bytes(200), "application/dicom")
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let config = LoaderConfig {
        request_timeout: 100,
        retry_attempts: 1,
        ..uri_config(&server)
    };
    let err = loader(config)
        .load_image(&uri_id("2.4"), LoadOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LoaderError::Timeout(_)), "got {:?}", err);
}

// =============================================================================
// WADO-RS
// =============================================================================

#[tokio::test]
async fn test_wado_rs_instance_with_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(metadata_path("3.1")))
        .and(header("accept", "application/dicom+json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(dicom_json("3.1", CT_IMAGE_STORAGE, "CT", 7)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(instance_path("3.1")))
        .and(header("accept", "application/dicom; transfer-syntax=*"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(1024), "application/dicom"))
        .expect(1)
        .mount(&server)
        .await;

    let image = loader(rs_config(&server))
        .load_image(&rs_id("3.1"), LoadOptions::default())
        .await
        .unwrap();

    assert_eq!(image.metadata.modality.as_deref(), Some("CT"));
    assert_eq!(image.metadata.instance_number, Some(7));
    assert_eq!(image.metadata.rows, Some(512));
    // Lung window from the CT handler
    let window = image.window.unwrap();
    assert_eq!((window.width, window.center), (1500.0, -600.0));
}

#[tokio::test]
async fn test_wado_rs_multipart_first_part() {
    let server = MockServer::start().await;
    let inner = dicom_bytes(256);
    let (body, content_type) = multipart("application/dicom", &inner);
    let content_type = format!("{}; transfer-syntax=1.2.840.10008.1.2.4.50", content_type);

    Mock::given(method("GET"))
        .and(path(instance_path("3.2")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, content_type.as_str()))
        .expect(1)
        .mount(&server)
        .await;

    let image = loader(rs_config(&server))
        .load_image(&rs_id("3.2"), LoadOptions::default())
        .await
        .unwrap();

    assert_eq!(&image.data[..], &inner[..]);
    assert_eq!(image.transfer_syntax.as_deref(), Some("1.2.840.10008.1.2.4.50"));
}

#[tokio::test]
async fn test_wado_rs_multipart_disabled_keeps_body() {
    let server = MockServer::start().await;
    let (body, content_type) = multipart("application/dicom", &dicom_bytes(200));
    let body_len = body.len();

    Mock::given(method("GET"))
        .and(path(instance_path("3.3")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, content_type.as_str()))
        .mount(&server)
        .await;

    let config = LoaderConfig {
        wado_rs: Some(WadoRsConfig {
            multipart_support: false,
            ..WadoRsConfig::new(server.uri())
        }),
        ..base_config()
    };
    let image = loader(config)
        .load_image(&rs_id("3.3"), LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(image.size_bytes(), body_len);
}

#[tokio::test]
async fn test_bulk_data_uri() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/bulk{}", instance_path("3.4"))))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(400), "application/dicom"))
        .expect(1)
        .mount(&server)
        .await;

    let config = LoaderConfig {
        wado_rs: Some(WadoRsConfig {
            bulk_data_uri: Some(format!("{}/bulk", server.uri())),
            ..WadoRsConfig::new(server.uri())
        }),
        ..base_config()
    };
    let image = loader(config)
        .load_image(&rs_id("3.4"), LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(image.size_bytes(), 400);
}

#[tokio::test]
async fn test_rendered_frame() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{}/frames/2/rendered", instance_path("3.5"))))
        .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0xFFu8, 0xD8, 0xFF, 0xE0], "image/jpeg"))
        .expect(1)
        .mount(&server)
        .await;

    let image = loader(rs_config(&server))
        .load_image(&format!("{}/frames/2/rendered", rs_id("3.5")), LoadOptions::default())
        .await
        .unwrap();
    assert_eq!(image.content_type, "image/jpeg");
    assert_eq!(image.size_bytes(), 4);
}

#[tokio::test]
async fn test_load_metadata() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(metadata_path("3.6")))
        .respond_with(ResponseTemplate::new(200).set_body_json(dicom_json("3.6", PET_IMAGE_STORAGE, "PT", 1)))
        .expect(1)
        .mount(&server)
        .await;

    let metadata = loader(rs_config(&server))
        .load_metadata(&rs_id("3.6"))
        .await
        .unwrap();
    assert_eq!(metadata.modality.as_deref(), Some("PT"));
    assert_eq!(metadata.sop_class_uid.as_deref(), Some(PET_IMAGE_STORAGE));
}

#[tokio::test]
async fn test_load_metadata_unavailable_over_wado_uri() {
    let server = MockServer::start().await;
    let err = loader(uri_config(&server))
        .load_metadata(&uri_id("3.7"))
        .await
        .unwrap_err();
    assert!(matches!(err, LoaderError::Metadata(_)));
}
