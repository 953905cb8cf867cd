//! End-to-end loader tests: caching, coalescing, volumes, prefetch and events.

use std::time::Duration;

use serde_json::json;
use tokio::task::JoinSet;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dicom_loader::loader::SliceOrdering;
use dicom_loader::{ConfigUpdate, LoadOptions, LoaderConfig, LoaderEvent, ProgressStatus};

use super::test_utils::*;

// =============================================================================
// Caching
// =============================================================================

#[tokio::test]
async fn test_second_load_served_from_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(metadata_path("10.1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(dicom_json("10.1", CT_IMAGE_STORAGE, "CT", 1)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(instance_path("10.1")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(2048), "application/dicom"))
        .expect(1)
        .mount(&server)
        .await;

    let loader = loader(rs_config(&server));
    let first = loader.load_image(&rs_id("10.1"), LoadOptions::default()).await.unwrap();
    let second = loader.load_image(&rs_id("10.1"), LoadOptions::default()).await.unwrap();

    assert_eq!(first.data, second.data);
    assert_eq!(second.metadata.modality.as_deref(), Some("CT"));

    let stats = loader.cache_info().await;
    assert_eq!(stats.entry_count, 1);
    assert_eq!(stats.used_bytes, 2048);
}

#[tokio::test]
async fn test_skip_cache_refetches() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(300), "application/dicom"))
        .expect(2)
        .mount(&server)
        .await;

    let loader = loader(uri_config(&server));
    loader.load_image(&uri_id("10.2"), LoadOptions::default()).await.unwrap();
    loader
        .load_image(&uri_id("10.2"), LoadOptions::default().skip_cache())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_cache_budget_evicts_oldest() {
    let server = MockServer::start().await;
    for instance in ["11.1", "11.2", "11.3"] {
        mount_instance(&server, instance, CT_IMAGE_STORAGE, "CT", 1, 400_000).await;
    }

    let config = LoaderConfig {
        cache_size: 1,
        ..rs_config(&server)
    };
    let loader = loader(config);
    for instance in ["11.1", "11.2", "11.3"] {
        loader.load_image(&rs_id(instance), LoadOptions::default()).await.unwrap();
    }

    let stats = loader.cache_info().await;
    assert_eq!(stats.capacity_bytes, 1024 * 1024);
    assert_eq!(stats.entry_count, 2);
    assert!(stats.used_bytes <= stats.capacity_bytes);
    assert!(!loader.cache().contains(&rs_id("11.1")).await);
    assert!(loader.cache().contains(&rs_id("11.3")).await);
}

#[tokio::test]
async fn test_configure_resizes_limits() {
    let server = MockServer::start().await;
    let loader = loader(rs_config(&server));

    loader
        .configure(ConfigUpdate {
            cache_size_mb: Some(2),
            max_concurrent_loads: Some(3),
            prefetch_size: None,
        })
        .await
        .unwrap();

    assert_eq!(loader.cache_info().await.capacity_bytes, 2 * 1024 * 1024);
    assert_eq!(loader.limiter().capacity(), 3);

    let err = loader
        .configure(ConfigUpdate {
            max_concurrent_loads: Some(0),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, dicom_loader::LoaderError::Configuration(_)));
    assert_eq!(loader.limiter().capacity(), 3);
}

// =============================================================================
// Coalescing
// =============================================================================

#[tokio::test]
async fn test_concurrent_loads_share_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(dicom_bytes(500), "application/dicom")
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let loader = loader(uri_config(&server));
    let mut tasks = JoinSet::new();
    for _ in 0..5 {
        let loader = loader.clone();
        tasks.spawn(async move { loader.load_image(&uri_id("12.1"), LoadOptions::default()).await });
    }

    let mut sizes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        sizes.push(joined.unwrap().unwrap().size_bytes());
    }
    assert_eq!(sizes, vec![500; 5]);
    assert!(loader.active_loads().is_empty());
}

// =============================================================================
// Modality processing
// =============================================================================

#[tokio::test]
async fn test_dataset_window_preferred_over_default() {
    let server = MockServer::start().await;
    let mut document = dicom_json("13.1", CT_IMAGE_STORAGE, "CT", 1);
    document[0]["00281050"] = json!({ "vr": "DS", "Value": ["40"] });
    document[0]["00281051"] = json!({ "vr": "DS", "Value": ["400"] });
    document[0]["00281052"] = json!({ "vr": "DS", "Value": ["-1024"] });
    document[0]["00281053"] = json!({ "vr": "DS", "Value": ["1"] });

    Mock::given(method("GET"))
        .and(path(metadata_path("13.1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(document))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(instance_path("13.1")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(200), "application/dicom"))
        .mount(&server)
        .await;

    let image = loader(rs_config(&server))
        .load_image(&rs_id("13.1"), LoadOptions::default())
        .await
        .unwrap();

    let window = image.window.unwrap();
    assert_eq!((window.width, window.center), (400.0, 40.0));
    let rescale = image.rescale.unwrap();
    assert_eq!((rescale.slope, rescale.intercept), (1.0, -1024.0));
}

#[tokio::test]
async fn test_pet_suv_factor() {
    let server = MockServer::start().await;
    let mut document = dicom_json("13.2", PET_IMAGE_STORAGE, "PT", 1);
    document[0]["00101030"] = json!({ "vr": "DS", "Value": ["70"] });
    document[0]["00540016"] = json!({ "vr": "SQ", "Value": [{
        "00181074": { "vr": "DS", "Value": ["350000000"] }
    }] });

    Mock::given(method("GET"))
        .and(path(metadata_path("13.2")))
        .respond_with(ResponseTemplate::new(200).set_body_json(document))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(instance_path("13.2")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(200), "application/dicom"))
        .mount(&server)
        .await;

    let image = loader(rs_config(&server))
        .load_image(&rs_id("13.2"), LoadOptions::default())
        .await
        .unwrap();

    let factor = image.suv_factor.unwrap();
    assert!((factor - 0.0002).abs() < 1e-12);
    let window = image.window.unwrap();
    assert_eq!((window.width, window.center), (5.0, 2.5));
}

// =============================================================================
// Volumes
// =============================================================================

#[tokio::test]
async fn test_volume_ordered_by_instance_number() {
    let server = MockServer::start().await;
    mount_instance(&server, "14.1", CT_IMAGE_STORAGE, "CT", 3, 300).await;
    mount_instance(&server, "14.2", CT_IMAGE_STORAGE, "CT", 1, 300).await;
    mount_instance(&server, "14.3", CT_IMAGE_STORAGE, "CT", 2, 300).await;

    let loader = loader(rs_config(&server));
    let mut events = loader.subscribe();

    let ids = vec![rs_id("14.1"), rs_id("14.2"), rs_id("14.3")];
    let volume = loader
        .load_volume("chest", ids, LoadOptions::default())
        .await
        .unwrap();

    assert!(volume.is_complete());
    assert_eq!(volume.metadata.ordering, SliceOrdering::InstanceNumber);
    assert_eq!(volume.metadata.total_size_bytes, 900);
    let order: Vec<_> = volume
        .images
        .iter()
        .map(|image| image.metadata.instance_number.unwrap())
        .collect();
    assert_eq!(order, vec![1, 2, 3]);

    let mut volume_loaded = false;
    while let Ok(event) = events.try_recv() {
        if let LoaderEvent::VolumeLoaded(metadata) = event {
            assert_eq!(metadata.volume_id, "chest");
            assert_eq!(metadata.loaded, 3);
            volume_loaded = true;
        }
    }
    assert!(volume_loaded);
}

#[tokio::test]
async fn test_volume_partial_failure() {
    let server = MockServer::start().await;
    mount_instance(&server, "15.1", CT_IMAGE_STORAGE, "CT", 1, 300).await;
    mount_instance(&server, "15.3", CT_IMAGE_STORAGE, "CT", 3, 300).await;

    let loader = loader(rs_config(&server));
    let ids = vec![rs_id("15.1"), rs_id("15.2"), rs_id("15.3")];
    let volume = loader
        .load_volume("partial", ids, LoadOptions::default())
        .await
        .unwrap();

    assert!(!volume.is_complete());
    assert_eq!(volume.images.len(), 2);
    assert_eq!(volume.failures.len(), 1);
    assert_eq!(volume.failures[0].identifier, rs_id("15.2"));
    assert_eq!(volume.metadata.failed, 1);
}

// =============================================================================
// Prefetch and events
// =============================================================================

#[tokio::test]
async fn test_prefetch_warms_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(256), "application/dicom"))
        .expect(3)
        .mount(&server)
        .await;

    let loader = loader(uri_config(&server));
    loader.prefetch(vec![uri_id("16.1"), uri_id("16.2"), uri_id("16.3")]);

    tokio::time::timeout(Duration::from_secs(5), async {
        while loader.cache_info().await.entry_count < 3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("prefetch should fill the cache");

    // Served from cache, no fourth request
    loader.load_image(&uri_id("16.2"), LoadOptions::default()).await.unwrap();
    assert_eq!(loader.pending_prefetch(), 0);
}

#[tokio::test]
async fn test_progress_and_error_events() {
    let server = MockServer::start().await;
    mount_instance(&server, "17.1", CT_IMAGE_STORAGE, "CT", 1, 256).await;

    let loader = loader(rs_config(&server));
    let mut events = loader.subscribe();

    loader.load_image(&rs_id("17.1"), LoadOptions::default()).await.unwrap();
    loader
        .load_image(&rs_id("17.404"), LoadOptions::default())
        .await
        .unwrap_err();

    let mut completed = false;
    let mut metadata_seen = false;
    let mut error_for = None;
    while let Ok(event) = events.try_recv() {
        match event {
            LoaderEvent::Progress(state) if state.status == ProgressStatus::Completed => {
                assert_eq!(state.identifier, rs_id("17.1"));
                assert_eq!(state.percentage, 100.0);
                completed = true;
            }
            LoaderEvent::MetadataExtracted { identifier, .. } => {
                assert_eq!(identifier, rs_id("17.1"));
                metadata_seen = true;
            }
            LoaderEvent::Error { identifier, .. } => error_for = Some(identifier),
            _ => {}
        }
    }

    assert!(completed);
    assert!(metadata_seen);
    assert_eq!(error_for, Some(rs_id("17.404")));
    assert!(loader.progress(&rs_id("17.1")).is_none());
}
