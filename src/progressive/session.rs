//! Progressive sessions.
//!
//! A session loads a dataset chunk by chunk, reporting aggregate progress as
//! chunks finish. Up to `maxConcurrentChunks` chunks load at once; every image
//! load goes through the coordinator's concurrency limiter at the session's
//! priority.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::{self, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::strategy::{order_identifiers, ChunkPlanner, LoadingStrategy};
use crate::dicom::ImagePayload;
use crate::error::{LoaderError, Result};
use crate::loader::{
    LoadCoordinator, LoadOptions, LoaderEvent, RequestType, VolumeFailure, PRIORITY_NORMAL,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Progress and results
// =============================================================================

/// Aggregate progress of a session. `processed` never decreases.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetProgress {
    pub session_id: String,
    pub total: usize,
    pub loaded: usize,
    pub failed: usize,
    /// Loaded plus failed
    pub processed: usize,
    pub percentage: f64,
    pub chunks_completed: usize,
}

impl DatasetProgress {
    fn new(session_id: &str, total: usize) -> Self {
        Self {
            session_id: session_id.to_string(),
            total,
            loaded: 0,
            failed: 0,
            processed: 0,
            percentage: if total == 0 { 100.0 } else { 0.0 },
            chunks_completed: 0,
        }
    }

    fn record(&mut self, chunk: &ChunkResult) {
        self.loaded += chunk.images.len();
        self.failed += chunk.failures.len();
        self.processed = self.loaded + self.failed;
        self.chunks_completed += 1;
        self.percentage = if self.total == 0 {
            100.0
        } else {
            self.processed as f64 * 100.0 / self.total as f64
        };
    }
}

/// Summary published with the `dataset-complete` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetSummary {
    pub session_id: String,
    pub total: usize,
    pub loaded: usize,
    pub failed: usize,
    pub chunks: usize,
    pub elapsed_ms: u64,
}

/// One finished chunk.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    pub index: usize,
    pub identifiers: Vec<String>,
    /// Loaded images in load order
    pub images: Vec<ImagePayload>,
    pub failures: Vec<VolumeFailure>,
    pub elapsed: Duration,
}

impl ChunkResult {
    /// A chunk whose every member failed with `error`.
    fn failed(index: usize, identifiers: Vec<String>, error: LoaderError) -> Self {
        let failures = identifiers
            .iter()
            .map(|identifier| VolumeFailure {
                identifier: identifier.clone(),
                error: error.clone(),
            })
            .collect();
        Self {
            index,
            identifiers,
            images: Vec::new(),
            failures,
            elapsed: Duration::ZERO,
        }
    }
}

/// Everything a session produced, keyed by chunk index.
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub session_id: String,
    pub chunks: BTreeMap<usize, ChunkResult>,
    pub summary: DatasetSummary,
}

impl SessionOutcome {
    /// All loaded images in chunk order.
    pub fn images(&self) -> impl Iterator<Item = &ImagePayload> {
        self.chunks.values().flat_map(|chunk| chunk.images.iter())
    }
}

// =============================================================================
// Options and handle
// =============================================================================

pub type DatasetProgressCallback = Arc<dyn Fn(&DatasetProgress) + Send + Sync>;
pub type SessionCompleteCallback = Arc<dyn Fn(&SessionOutcome) + Send + Sync>;

/// Per-session options.
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Defaults to a generated `session-<n>`
    pub session_id: Option<String>,
    /// Defaults to the configured strategy
    pub strategy: Option<LoadingStrategy>,
    /// Admission priority, clamped to the configured levels
    pub priority: Option<u8>,
    /// Index the predictive strategy loads outward from
    pub focus_index: usize,
    pub skip_cache: bool,
    pub on_progress: Option<DatasetProgressCallback>,
    pub on_complete: Option<SessionCompleteCallback>,
}

impl SessionOptions {
    pub fn with_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_strategy(mut self, strategy: LoadingStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_focus(mut self, index: usize) -> Self {
        self.focus_index = index;
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(&DatasetProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn on_complete(mut self, callback: impl Fn(&SessionOutcome) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("session_id", &self.session_id)
            .field("strategy", &self.strategy)
            .field("priority", &self.priority)
            .field("focus_index", &self.focus_index)
            .field("skip_cache", &self.skip_cache)
            .finish()
    }
}

/// Handle to a running session.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: String,
    task: JoinHandle<Result<SessionOutcome>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// Wait for the session to finish.
    pub async fn wait(self) -> Result<SessionOutcome> {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => Err(LoaderError::Cancelled),
            Err(e) => Err(LoaderError::Internal(format!("session task failed: {}", e))),
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

struct SessionEntry {
    cancel: CancellationToken,
    progress: DatasetProgress,
}

/// Active sessions, keyed by id. Completed and cancelled sessions are removed.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    fn register(&self, session_id: &str, total: usize) -> Result<CancellationToken> {
        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(session_id) {
            return Err(LoaderError::InvalidIdentifier(format!(
                "session {} is already active",
                session_id
            )));
        }
        let cancel = CancellationToken::new();
        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                cancel: cancel.clone(),
                progress: DatasetProgress::new(session_id, total),
            },
        );
        Ok(cancel)
    }

    fn generate_id(&self) -> String {
        format!("session-{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn update(&self, progress: &DatasetProgress) {
        if let Some(entry) = lock(&self.sessions).get_mut(&progress.session_id) {
            entry.progress = progress.clone();
        }
    }

    fn remove(&self, session_id: &str) {
        lock(&self.sessions).remove(session_id);
    }

    pub fn cancel(&self, session_id: &str) -> Result<()> {
        let entry = lock(&self.sessions).remove(session_id);
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                info!(session_id, "Session cancelled");
                Ok(())
            }
            None => Err(LoaderError::UnknownSession(session_id.to_string())),
        }
    }

    pub fn progress(&self, session_id: &str) -> Result<DatasetProgress> {
        lock(&self.sessions)
            .get(session_id)
            .map(|entry| entry.progress.clone())
            .ok_or_else(|| LoaderError::UnknownSession(session_id.to_string()))
    }

    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }
}

struct SessionRegistration {
    coordinator: LoadCoordinator,
    session_id: String,
}

impl Drop for SessionRegistration {
    fn drop(&mut self) {
        self.coordinator.sessions().remove(&self.session_id);
    }
}

// =============================================================================
// Running a session
// =============================================================================

/// Register and spawn a session.
pub(crate) fn start_session(
    coordinator: LoadCoordinator,
    identifiers: Vec<String>,
    options: SessionOptions,
) -> Result<SessionHandle> {
    let config = coordinator.progressive_config().clone();
    let session_id = options
        .session_id
        .clone()
        .unwrap_or_else(|| coordinator.sessions().generate_id());
    let strategy = options.strategy.unwrap_or(config.strategy);
    let priority = config.clamp_priority(options.priority.unwrap_or(PRIORITY_NORMAL));

    let planner = if coordinator.progressive_loading() {
        ChunkPlanner::new(&config, strategy)
    } else {
        ChunkPlanner::single_chunk(identifiers.len())
    };
    let ordered = order_identifiers(strategy, &identifiers, options.focus_index);

    let cancel = coordinator.sessions().register(&session_id, identifiers.len())?;
    info!(
        session_id = %session_id,
        images = identifiers.len(),
        strategy = ?strategy,
        priority,
        "Starting progressive session"
    );

    let run = SessionRun {
        registration: SessionRegistration {
            coordinator,
            session_id: session_id.clone(),
        },
        ordered,
        planner,
        max_concurrent_chunks: config.max_concurrent_chunks,
        memory_threshold: config.memory_threshold,
        priority,
        options,
        cancel,
    };
    let task = tokio::spawn(run.execute());

    Ok(SessionHandle { session_id, task })
}

struct SessionRun {
    registration: SessionRegistration,
    ordered: Vec<(usize, String)>,
    planner: ChunkPlanner,
    max_concurrent_chunks: usize,
    memory_threshold: f64,
    priority: u8,
    options: SessionOptions,
    cancel: CancellationToken,
}

impl SessionRun {
    async fn execute(mut self) -> Result<SessionOutcome> {
        let coordinator = self.registration.coordinator.clone();
        let session_id = self.registration.session_id.clone();
        let started = Instant::now();
        let total = self.ordered.len();

        let mut progress = DatasetProgress::new(&session_id, total);
        let mut chunks = BTreeMap::new();
        let mut running = JoinSet::new();
        let mut pending: HashMap<task::Id, (usize, Vec<String>)> = HashMap::new();
        let mut cursor = 0;
        let mut next_index = 0;

        loop {
            while running.len() < self.max_concurrent_chunks && cursor < total {
                if coordinator.cache_fill_ratio().await > self.memory_threshold {
                    self.planner.memory_pressure();
                    debug!(session_id = %session_id, "Cache above memory threshold, shrinking chunk");
                }
                let size = self.planner.next_size();
                let end = cursor.saturating_add(size).min(total);
                let members = self.ordered[cursor..end].to_vec();
                cursor = end;

                let index = next_index;
                next_index += 1;
                debug!(session_id = %session_id, chunk = index, images = members.len(), "Loading chunk");
                let identifiers = members.iter().map(|(_, id)| id.clone()).collect();
                let handle = running.spawn(load_chunk(
                    coordinator.clone(),
                    index,
                    members,
                    self.image_options(),
                ));
                pending.insert(handle.id(), (index, identifiers));
            }

            if running.is_empty() {
                break;
            }

            let joined = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    running.shutdown().await;
                    return Err(LoaderError::Cancelled);
                }
                joined = running.join_next_with_id() => joined,
            };

            let chunk = match joined {
                Some(Ok((id, chunk))) => {
                    pending.remove(&id);
                    self.planner.record(chunk.identifiers.len(), chunk.elapsed);
                    chunk
                }
                Some(Err(e)) => {
                    warn!(session_id = %session_id, error = %e, "Chunk task failed");
                    let Some((index, identifiers)) = pending.remove(&e.id()) else {
                        continue;
                    };
                    ChunkResult::failed(
                        index,
                        identifiers,
                        LoaderError::Internal(format!("chunk task failed: {}", e)),
                    )
                }
                None => break,
            };

            progress.record(&chunk);
            coordinator.sessions().update(&progress);
            if let Some(ref callback) = self.options.on_progress {
                callback(&progress);
            }
            coordinator
                .events()
                .emit(LoaderEvent::DatasetProgress(progress.clone()));
            chunks.insert(chunk.index, chunk);
        }

        let summary = DatasetSummary {
            session_id: session_id.clone(),
            total,
            loaded: progress.loaded,
            failed: progress.failed,
            chunks: chunks.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            session_id = %session_id,
            loaded = summary.loaded,
            failed = summary.failed,
            chunks = summary.chunks,
            elapsed_ms = summary.elapsed_ms,
            "Progressive session complete"
        );

        let outcome = SessionOutcome {
            session_id,
            chunks,
            summary: summary.clone(),
        };
        if let Some(ref callback) = self.options.on_complete {
            callback(&outcome);
        }
        coordinator
            .events()
            .emit(LoaderEvent::DatasetComplete(summary));
        Ok(outcome)
    }

    fn image_options(&self) -> LoadOptions {
        LoadOptions {
            skip_cache: self.options.skip_cache,
            request_type: RequestType::Background,
            priority: self.priority,
            cancel: Some(self.cancel.child_token()),
            ..Default::default()
        }
    }
}

async fn load_chunk(
    coordinator: LoadCoordinator,
    index: usize,
    members: Vec<(usize, String)>,
    options: LoadOptions,
) -> ChunkResult {
    let started = Instant::now();
    let identifiers: Vec<String> = members.iter().map(|(_, id)| id.clone()).collect();

    let mut tasks = JoinSet::new();
    for (position, (_, identifier)) in members.into_iter().enumerate() {
        let coordinator = coordinator.clone();
        let options = options.clone();
        tasks.spawn(async move {
            let outcome = coordinator.load_admitted(&identifier, options).await;
            (position, identifier, outcome)
        });
    }

    let mut loaded = Vec::new();
    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((position, _, Ok(image))) => loaded.push((position, image)),
            Ok((position, identifier, Err(error))) => {
                failures.push((position, VolumeFailure { identifier, error }))
            }
            Err(e) => warn!(chunk = index, error = %e, "Image task failed"),
        }
    }
    settle_unreported(&identifiers, &loaded, &mut failures);
    loaded.sort_by_key(|(position, _)| *position);
    failures.sort_by_key(|(position, _)| *position);

    ChunkResult {
        index,
        identifiers,
        images: loaded.into_iter().map(|(_, image)| image).collect(),
        failures: failures.into_iter().map(|(_, failure)| failure).collect(),
        elapsed: started.elapsed(),
    }
}

/// Record a failure for every member whose task ended without reporting.
fn settle_unreported(
    identifiers: &[String],
    loaded: &[(usize, ImagePayload)],
    failures: &mut Vec<(usize, VolumeFailure)>,
) {
    for (position, identifier) in identifiers.iter().enumerate() {
        let reported = loaded.iter().any(|(p, _)| *p == position)
            || failures.iter().any(|(p, _)| *p == position);
        if !reported {
            failures.push((
                position,
                VolumeFailure {
                    identifier: identifier.clone(),
                    error: LoaderError::Internal("image task ended without a result".into()),
                },
            ));
        }
    }
}
