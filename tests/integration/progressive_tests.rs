//! Progressive session tests against a mock server.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use dicom_loader::{
    LoaderConfig, LoaderError, LoaderEvent, LoadingStrategy, ProgressiveConfig, SessionOptions,
};

use super::test_utils::*;

fn session_config(server: &MockServer, chunk_size: usize) -> LoaderConfig {
    LoaderConfig {
        progressive: ProgressiveConfig {
            chunk_size,
            max_concurrent_chunks: 1,
            adaptive_chunk_size: false,
            ..Default::default()
        },
        ..uri_config(server)
    }
}

fn ids(count: usize) -> Vec<String> {
    (1..=count).map(|n| uri_id(&format!("20.{}", n))).collect()
}

#[tokio::test]
async fn test_session_loads_in_chunks() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(256), "application/dicom"))
        .expect(5)
        .mount(&server)
        .await;

    let loader = loader(session_config(&server, 2));
    let mut events = loader.subscribe();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();

    let handle = loader
        .load_dataset_progressive(
            ids(5),
            SessionOptions::default()
                .with_id("series-a")
                .on_progress(move |progress| recorder.lock().unwrap().push(progress.loaded)),
        )
        .unwrap();
    assert_eq!(handle.id(), "series-a");

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.summary.total, 5);
    assert_eq!(outcome.summary.loaded, 5);
    assert_eq!(outcome.summary.chunks, 3);
    assert_eq!(outcome.images().count(), 5);
    assert_eq!(*seen.lock().unwrap(), vec![2, 4, 5]);

    // Finished sessions are no longer tracked
    assert!(matches!(
        loader.session_progress("series-a"),
        Err(LoaderError::UnknownSession(_))
    ));

    let mut complete = None;
    while let Ok(event) = events.try_recv() {
        if let LoaderEvent::DatasetComplete(summary) = event {
            complete = Some(summary);
        }
    }
    assert_eq!(complete.unwrap().session_id, "series-a");
}

#[tokio::test]
async fn test_session_reports_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let loader = loader(session_config(&server, 3));
    let outcome = loader
        .load_dataset_progressive(ids(3), SessionOptions::default())
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.summary.loaded, 0);
    assert_eq!(outcome.summary.failed, 3);
    assert_eq!(outcome.chunks[&0].failures.len(), 3);
}

#[tokio::test]
async fn test_predictive_session_loads_focus_first() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(dicom_bytes(128), "application/dicom"))
        .mount(&server)
        .await;

    let config = LoaderConfig {
        progressive: ProgressiveConfig {
            chunk_size: 1,
            preload_distance: 0,
            max_concurrent_chunks: 1,
            adaptive_chunk_size: false,
            ..Default::default()
        },
        ..uri_config(&server)
    };
    let loader = loader(config);
    let all = ids(5);

    let outcome = loader
        .load_dataset_progressive(
            all.clone(),
            SessionOptions::default()
                .with_strategy(LoadingStrategy::Predictive)
                .with_focus(3),
        )
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(outcome.chunks[&0].identifiers, vec![all[3].clone()]);
    assert_eq!(outcome.summary.loaded, 5);
}

#[tokio::test]
async fn test_cancel_running_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/wado"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(dicom_bytes(128), "application/dicom")
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let loader = loader(session_config(&server, 2));
    let handle = loader
        .load_dataset_progressive(ids(6), SessionOptions::default().with_id("slow"))
        .unwrap();

    assert_eq!(loader.active_sessions(), vec!["slow".to_string()]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    loader.cancel_session("slow").unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), handle.wait())
        .await
        .expect("cancelled session should finish promptly");
    assert!(matches!(result, Err(LoaderError::Cancelled)));
    assert!(loader.active_sessions().is_empty());
    assert!(loader.cancel_session("slow").is_err());
}
