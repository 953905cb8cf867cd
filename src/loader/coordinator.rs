//! The load coordinator.
//!
//! Owns the cache, the protocol clients and all in-flight work. Cheap to
//! clone; clones share state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::decoder::{decode_blocking, PixelDecoder};
use super::events::{EventBus, LoaderEvent, LoaderHooks, ProgressState, EVENT_CHANNEL_CAPACITY};
use super::limiter::ConcurrencyLimiter;
use super::prefetch::{PrefetchQueue, PREFETCH_BATCH_PAUSE};
use super::volume::{VolumeLoadContext, VolumeResult};
use super::{LoadOptions, RequestType, PRIORITY_BACKGROUND};
use crate::cache::{CacheStats, ImageCache};
use crate::config::{ConfigUpdate, LoaderConfig};
use crate::dicom::{DicomMetadata, ImagePayload, DEFAULT_TRANSFER_SYNTAX};
use crate::error::{LoaderError, Result};
use crate::modality::ModalityRegistry;
use crate::progressive::{
    self, DatasetProgress, ProgressiveConfig, SessionHandle, SessionOptions, SessionRegistry,
};
use crate::protocol::{
    media_type, HttpTransport, Locator, Protocol, ProtocolClient, RetryPolicy, WadoRsClient,
    WadoUriClient,
};

const BYTES_PER_MB: usize = 1024 * 1024;

type FetchOutcome = Option<Result<ImagePayload>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One fetch shared by every caller waiting on the same identifier.
struct InFlight {
    generation: u64,
    cancel: CancellationToken,
    result: Arc<watch::Sender<FetchOutcome>>,
    waiters: usize,
}

fn publish(sender: &watch::Sender<FetchOutcome>, outcome: Result<ImagePayload>) {
    sender.send_if_modified(|slot| {
        if slot.is_none() {
            *slot = Some(outcome);
            true
        } else {
            false
        }
    });
}

/// Settings fixed at construction.
#[derive(Debug)]
struct Settings {
    supported_sop_classes: Vec<String>,
    default_transfer_syntax: Option<String>,
    progressive: ProgressiveConfig,
    progressive_loading: bool,
}

struct Inner {
    cache: ImageCache,
    uri_client: Option<Arc<dyn ProtocolClient>>,
    rs_client: Option<Arc<dyn ProtocolClient>>,
    registry: ModalityRegistry,
    decoder: Option<Arc<dyn PixelDecoder>>,
    limiter: Arc<ConcurrencyLimiter>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    progress: Mutex<HashMap<String, (u64, ProgressState)>>,
    volumes: Mutex<HashMap<String, CancellationToken>>,
    prefetch: PrefetchQueue,
    prefetch_size: AtomicUsize,
    sessions: SessionRegistry,
    events: EventBus,
    hooks: LoaderHooks,
    settings: Settings,
    next_generation: AtomicU64,
}

/// Coordinates retrieval, caching and processing of DICOM images.
///
/// # Example
///
/// ```no_run
/// use dicom_loader::{LoadCoordinator, LoadOptions, LoaderConfig};
/// use dicom_loader::protocol::WadoRsConfig;
///
/// # async fn example() -> dicom_loader::Result<()> {
/// let config = LoaderConfig {
///     wado_rs: Some(WadoRsConfig::new("http://localhost:8042/dicom-web")),
///     ..Default::default()
/// };
/// let loader = LoadCoordinator::new(config)?;
///
/// let image = loader
///     .load_image("wadors:1.2.3/1.2.3.4/1.2.3.4.5", LoadOptions::default())
///     .await?;
/// println!("{} bytes, window {:?}", image.size_bytes(), image.window);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LoadCoordinator {
    inner: Arc<Inner>,
}

impl LoadCoordinator {
    /// Create a coordinator with HTTP clients for the configured endpoints.
    pub fn new(config: LoaderConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: LoaderConfig) -> LoadCoordinatorBuilder {
        LoadCoordinatorBuilder::new(config)
    }

    // =========================================================================
    // Single images
    // =========================================================================

    /// Load one image.
    ///
    /// Served from the cache when present (unless `skip_cache`). Otherwise
    /// joins the fetch already in flight for the identifier, or starts one.
    /// Cancelling `options.cancel` abandons this caller's wait; the fetch
    /// itself is cancelled once no caller is left waiting.
    pub async fn load_image(&self, identifier: &str, options: LoadOptions) -> Result<ImagePayload> {
        let (locator, client) = match self.resolve(identifier) {
            Ok(resolved) => resolved,
            Err(e) => {
                self.report_error(identifier, &e);
                return Err(e);
            }
        };

        if !options.skip_cache {
            if let Some(entry) = self.inner.cache.get(identifier).await {
                debug!(identifier, bytes = entry.size_bytes, "Cache hit");
                let state = ProgressState::pending(identifier, None).completed(entry.size_bytes);
                self.emit_progress(state);
                return Ok(entry.payload);
            }
        }

        let cancel = options.cancel_token();
        if cancel.is_cancelled() {
            return Err(LoaderError::Cancelled);
        }

        let (mut rx, generation) = self.join_or_start(identifier, locator, client, &options);
        let _waiter = WaiterGuard {
            inner: &self.inner,
            identifier,
            generation,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(identifier, "Caller stopped waiting");
                Err(LoaderError::Cancelled)
            }
            published = rx.wait_for(Option::is_some) => match published {
                Ok(outcome) => (*outcome).clone().unwrap_or(Err(LoaderError::Cancelled)),
                Err(_) => Err(LoaderError::Cancelled),
            }
        }
    }

    /// Load through the concurrency limiter, unless the request is interactive.
    pub(crate) async fn load_admitted(
        &self,
        identifier: &str,
        options: LoadOptions,
    ) -> Result<ImagePayload> {
        if options.request_type == RequestType::Interaction {
            return self.load_image(identifier, options).await;
        }
        let cancel = options.cancel_token();
        let _permit = self.inner.limiter.acquire(options.priority, &cancel).await?;
        self.load_image(identifier, options).await
    }

    /// Fetch instance metadata without retrieving pixel data.
    pub async fn load_metadata(&self, identifier: &str) -> Result<DicomMetadata> {
        let (locator, client) = self.resolve(identifier)?;
        let cancel = CancellationToken::new();
        match client.retrieve_metadata(&locator, &cancel).await {
            Ok(Some(metadata)) => {
                self.publish_metadata(identifier, &metadata);
                Ok(metadata)
            }
            Ok(None) => {
                let e = LoaderError::Metadata(format!(
                    "{} cannot retrieve metadata for {}",
                    client.protocol(),
                    identifier
                ));
                self.report_error(identifier, &e);
                Err(e)
            }
            Err(e) => {
                self.report_error(identifier, &e);
                Err(e)
            }
        }
    }

    /// Cancel the in-flight fetch for an identifier. Every waiter fails with
    /// `Cancelled`. Returns false if nothing was in flight.
    pub fn cancel_image(&self, identifier: &str) -> bool {
        let entry = lock(&self.inner.in_flight).remove(identifier);
        let Some(entry) = entry else {
            return false;
        };
        entry.cancel.cancel();
        self.inner.remove_progress(identifier, entry.generation);
        publish(&entry.result, Err(LoaderError::Cancelled));
        info!(identifier, waiters = entry.waiters, "Image load cancelled");
        true
    }

    fn resolve(&self, identifier: &str) -> Result<(Locator, Arc<dyn ProtocolClient>)> {
        let locator = Locator::parse(identifier)?;
        let client = match locator.protocol {
            Some(Protocol::Uri) => self.inner.uri_client.clone().ok_or_else(|| {
                LoaderError::Configuration("wado-uri identifier but no wadoURI endpoint configured".to_string())
            })?,
            Some(Protocol::Rest) => self.inner.rs_client.clone().ok_or_else(|| {
                LoaderError::Configuration("wado-rs identifier but no wadoRS endpoint configured".to_string())
            })?,
            None => self
                .inner
                .rs_client
                .clone()
                .or_else(|| self.inner.uri_client.clone())
                .ok_or_else(|| {
                    LoaderError::Configuration("no retrieval endpoint configured".to_string())
                })?,
        };
        Ok((locator, client))
    }

    fn join_or_start(
        &self,
        identifier: &str,
        locator: Locator,
        client: Arc<dyn ProtocolClient>,
        options: &LoadOptions,
    ) -> (watch::Receiver<FetchOutcome>, u64) {
        let mut in_flight = lock(&self.inner.in_flight);
        if let Some(entry) = in_flight.get_mut(identifier) {
            entry.waiters += 1;
            debug!(identifier, waiters = entry.waiters, "Joining in-flight load");
            return (entry.result.subscribe(), entry.generation);
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);
        in_flight.insert(
            identifier.to_string(),
            InFlight {
                generation,
                cancel: cancel.clone(),
                result: Arc::clone(&tx),
                waiters: 1,
            },
        );
        lock(&self.inner.progress).insert(
            identifier.to_string(),
            (
                generation,
                ProgressState::pending(identifier, options.expected_size),
            ),
        );
        drop(in_flight);

        let coordinator = self.clone();
        let identifier = identifier.to_string();
        let options = options.clone();
        let fetch = {
            let coordinator = self.clone();
            let identifier = identifier.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator
                    .fetch(&identifier, &locator, client, &options, &cancel, generation)
                    .await
            })
        };
        // The fetch runs in its own task so a panic still settles every waiter.
        tokio::spawn(async move {
            let outcome = match fetch.await {
                Ok(outcome) => outcome,
                Err(e) => Err(LoaderError::Internal(format!("fetch task failed: {}", e))),
            };
            coordinator.finish_fetch(&identifier, generation, &tx, &cancel, outcome);
        });

        (rx, generation)
    }

    async fn fetch(
        &self,
        identifier: &str,
        locator: &Locator,
        client: Arc<dyn ProtocolClient>,
        options: &LoadOptions,
        cancel: &CancellationToken,
        generation: u64,
    ) -> Result<ImagePayload> {
        let started = Instant::now();
        self.update_progress(identifier, generation, ProgressState::loading);
        debug!(identifier, protocol = %client.protocol(), "Fetching image");

        let mut metadata = match client.retrieve_metadata(locator, cancel).await {
            Ok(Some(metadata)) => {
                self.publish_metadata(identifier, &metadata);
                metadata
            }
            Ok(None) => DicomMetadata::default(),
            Err(e) if e.is_cancellation() => return Err(LoaderError::Cancelled),
            Err(e) => {
                warn!(identifier, error = %e, "Metadata retrieval failed, continuing without");
                DicomMetadata::default()
            }
        };
        metadata.fill_missing(&locator_metadata(locator));

        let response = match client.retrieve(locator, &options.render_hints, cancel).await {
            Err(e) if e.is_cancellation() => return Err(LoaderError::Cancelled),
            other => other?,
        };

        let media = media_type(&response.content_type);
        let rendered = media.starts_with("image/");
        let transfer_syntax = response
            .transfer_syntax()
            .or_else(|| metadata.transfer_syntax_uid.clone())
            .or_else(|| self.inner.settings.default_transfer_syntax.clone())
            .or_else(|| (!rendered).then(|| DEFAULT_TRANSFER_SYNTAX.to_string()));

        let mut payload = ImagePayload::new(identifier, response.payload, response.content_type)
            .with_metadata(metadata);
        payload.transfer_syntax = transfer_syntax;

        if let (Some(decoder), false) = (self.inner.decoder.clone(), rendered) {
            let syntax = payload
                .transfer_syntax
                .clone()
                .unwrap_or_else(|| DEFAULT_TRANSFER_SYNTAX.to_string());
            let decoded = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LoaderError::Cancelled),
                decoded = decode_blocking(decoder, payload.data.clone(), syntax) => decoded?,
            };
            payload.data = decoded.pixels;
            payload.decoded = true;
            if let Some(ref extra) = decoded.metadata {
                payload.metadata.fill_missing(extra);
            }
        }

        let payload = if self.check_supported(identifier, &payload.metadata) {
            self.inner.registry.process(identifier, payload)
        } else {
            ModalityRegistry::pass_through(payload)
        };

        if cancel.is_cancelled() {
            return Err(LoaderError::Cancelled);
        }
        if !options.skip_cache {
            self.inner.cache.put(identifier, payload.clone()).await;
        }

        debug!(
            identifier,
            bytes = payload.size_bytes(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Image loaded"
        );
        Ok(payload)
    }

    fn finish_fetch(
        &self,
        identifier: &str,
        generation: u64,
        sender: &watch::Sender<FetchOutcome>,
        cancel: &CancellationToken,
        outcome: Result<ImagePayload>,
    ) {
        let outcome = if cancel.is_cancelled() {
            Err(LoaderError::Cancelled)
        } else {
            outcome
        };

        match outcome {
            Ok(ref payload) => {
                let bytes = payload.size_bytes();
                self.update_progress(identifier, generation, |p| p.completed(bytes));
                if let Some(ref hook) = self.inner.hooks.on_image_loaded {
                    hook(payload);
                }
            }
            Err(LoaderError::Cancelled) => {
                debug!(identifier, "Fetch cancelled");
            }
            Err(ref e) => {
                self.update_progress(identifier, generation, |p| p.failed(e));
                self.report_error(identifier, e);
            }
        }

        {
            let mut in_flight = lock(&self.inner.in_flight);
            if in_flight
                .get(identifier)
                .is_some_and(|entry| entry.generation == generation)
            {
                in_flight.remove(identifier);
            }
        }
        self.inner.remove_progress(identifier, generation);
        publish(sender, outcome);
    }

    /// False when `supportedSOPClasses` is set and excludes the instance's class.
    fn check_supported(&self, identifier: &str, metadata: &DicomMetadata) -> bool {
        let supported = &self.inner.settings.supported_sop_classes;
        let Some(ref sop_class) = metadata.sop_class_uid else {
            return true;
        };
        if supported.is_empty() || supported.iter().any(|s| s == sop_class) {
            return true;
        }
        warn!(
            identifier,
            sop_class = %sop_class,
            "SOP class not in supportedSOPClasses, processing without a modality handler"
        );
        false
    }

    fn update_progress(
        &self,
        identifier: &str,
        generation: u64,
        update: impl FnOnce(ProgressState) -> ProgressState,
    ) {
        let state = {
            let mut progress = lock(&self.inner.progress);
            match progress.get_mut(identifier) {
                Some((current, state)) if *current == generation => {
                    *state = update(state.clone());
                    state.clone()
                }
                _ => return,
            }
        };
        self.emit_progress(state);
    }

    fn emit_progress(&self, state: ProgressState) {
        if let Some(ref hook) = self.inner.hooks.on_progress {
            hook(&state);
        }
        self.inner.events.emit(LoaderEvent::Progress(state));
    }

    fn publish_metadata(&self, identifier: &str, metadata: &DicomMetadata) {
        if let Some(ref hook) = self.inner.hooks.on_metadata_loaded {
            hook(identifier, metadata);
        }
        self.inner.events.emit(LoaderEvent::MetadataExtracted {
            identifier: identifier.to_string(),
            metadata: metadata.clone(),
        });
    }

    pub(crate) fn report_error(&self, identifier: &str, error: &LoaderError) {
        warn!(identifier, error = %error, "Image load failed");
        if let Some(ref hook) = self.inner.hooks.on_error {
            hook(identifier, error);
        }
        self.inner.events.emit(LoaderEvent::Error {
            identifier: identifier.to_string(),
            error: error.to_string(),
        });
    }

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Load a set of images as one volume.
    ///
    /// Per-image failures do not fail the volume; they are reported in
    /// [`VolumeResult::failures`]. Cancelling the volume (through
    /// `options.cancel` or [`cancel_volume`](Self::cancel_volume)) cancels
    /// every outstanding image load and fails with `Cancelled`.
    pub async fn load_volume(
        &self,
        volume_id: &str,
        identifiers: Vec<String>,
        options: LoadOptions,
    ) -> Result<VolumeResult> {
        let cancel = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        {
            let mut volumes = lock(&self.inner.volumes);
            if volumes.contains_key(volume_id) {
                return Err(LoaderError::InvalidIdentifier(format!(
                    "volume {} is already loading",
                    volume_id
                )));
            }
            volumes.insert(volume_id.to_string(), cancel.clone());
        }
        let _registration = VolumeRegistration {
            inner: &self.inner,
            volume_id,
        };

        info!(volume_id, images = identifiers.len(), "Loading volume");
        let mut context =
            VolumeLoadContext::new(volume_id.to_string(), identifiers.clone(), cancel.clone());

        let mut tasks = JoinSet::new();
        for (index, identifier) in identifiers.into_iter().enumerate() {
            let coordinator = self.clone();
            let mut image_options = options.clone();
            if image_options.request_type == RequestType::Interaction {
                image_options.request_type = RequestType::Background;
            }
            image_options.cancel = Some(cancel.child_token());
            tasks.spawn(async move {
                let outcome = coordinator.load_admitted(&identifier, image_options).await;
                (index, outcome)
            });
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.shutdown().await;
                    info!(volume_id, "Volume load cancelled");
                    return Err(LoaderError::Cancelled);
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((index, outcome))) => context.record(index, outcome),
                    Some(Err(e)) => warn!(volume_id, error = %e, "Volume image task failed"),
                    None => break,
                }
            }
        }

        let result = context.finish();
        info!(
            volume_id,
            loaded = result.metadata.loaded,
            failed = result.metadata.failed,
            bytes = result.metadata.total_size_bytes,
            elapsed_ms = result.metadata.elapsed_ms,
            "Volume loaded"
        );
        self.inner
            .events
            .emit(LoaderEvent::VolumeLoaded(result.metadata.clone()));
        Ok(result)
    }

    /// Cancel a volume load. Returns false if no such volume is loading.
    pub fn cancel_volume(&self, volume_id: &str) -> bool {
        match lock(&self.inner.volumes).get(volume_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Prefetch
    // =========================================================================

    /// Queue identifiers for background loading at the lowest priority.
    pub fn prefetch(&self, identifiers: impl IntoIterator<Item = String>) {
        if self.inner.prefetch.enqueue(identifiers) {
            let coordinator = self.clone();
            tokio::spawn(async move { coordinator.drain_prefetch().await });
        }
    }

    /// Drop queued prefetches and cancel the batch in progress.
    pub fn cancel_prefetch(&self) -> usize {
        let dropped = self.inner.prefetch.clear();
        debug!(dropped, "Prefetch queue cleared");
        dropped
    }

    pub fn pending_prefetch(&self) -> usize {
        self.inner.prefetch.len()
    }

    async fn drain_prefetch(&self) {
        loop {
            let size = self.inner.prefetch_size.load(Ordering::Relaxed);
            let Some((batch, cancel)) = self.inner.prefetch.next_batch(size) else {
                break;
            };

            let mut tasks = JoinSet::new();
            for identifier in batch {
                if self.inner.cache.contains(&identifier).await {
                    continue;
                }
                let coordinator = self.clone();
                let options = LoadOptions::default()
                    .with_request_type(RequestType::Prefetch)
                    .with_priority(PRIORITY_BACKGROUND)
                    .with_cancel(cancel.child_token());
                tasks.spawn(async move {
                    let outcome = coordinator.load_admitted(&identifier, options).await;
                    (identifier, outcome)
                });
            }
            while let Some(joined) = tasks.join_next().await {
                if let Ok((identifier, Err(e))) = joined {
                    debug!(identifier = %identifier, error = %e, "Prefetch failed");
                }
            }

            tokio::time::sleep(PREFETCH_BATCH_PAUSE).await;
        }
    }

    // =========================================================================
    // Progressive sessions
    // =========================================================================

    /// Start a progressive session over `identifiers`.
    pub fn load_dataset_progressive(
        &self,
        identifiers: Vec<String>,
        options: SessionOptions,
    ) -> Result<SessionHandle> {
        progressive::start_session(self.clone(), identifiers, options)
    }

    /// Cancel a running session.
    pub fn cancel_session(&self, session_id: &str) -> Result<()> {
        self.inner.sessions.cancel(session_id)
    }

    pub fn session_progress(&self, session_id: &str) -> Result<DatasetProgress> {
        self.inner.sessions.progress(session_id)
    }

    pub fn active_sessions(&self) -> Vec<String> {
        self.inner.sessions.active()
    }

    pub(crate) fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub(crate) fn progressive_config(&self) -> &ProgressiveConfig {
        &self.inner.settings.progressive
    }

    pub(crate) fn progressive_loading(&self) -> bool {
        self.inner.settings.progressive_loading
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.inner.events
    }

    // =========================================================================
    // Cache, configuration, introspection
    // =========================================================================

    pub async fn clear_cache(&self) {
        self.inner.cache.clear().await;
        info!("Cache cleared");
        self.inner.events.emit(LoaderEvent::CacheCleared);
    }

    pub async fn cache_info(&self) -> CacheStats {
        self.inner.cache.stats().await
    }

    /// Fraction of the cache budget in use.
    pub(crate) async fn cache_fill_ratio(&self) -> f64 {
        let stats = self.inner.cache.stats().await;
        if stats.capacity_bytes == 0 {
            return 1.0;
        }
        stats.used_bytes as f64 / stats.capacity_bytes as f64
    }

    pub fn cache(&self) -> &ImageCache {
        &self.inner.cache
    }

    /// Apply runtime configuration changes.
    pub async fn configure(&self, update: ConfigUpdate) -> Result<()> {
        update.validate()?;
        if let Some(mb) = update.cache_size_mb {
            let evicted = self
                .inner
                .cache
                .set_capacity(mb.saturating_mul(BYTES_PER_MB))
                .await;
            info!(cache_size_mb = mb, evicted, "Cache budget changed");
        }
        if let Some(max) = update.max_concurrent_loads {
            self.inner.limiter.set_capacity(max);
            info!(max_concurrent_loads = max, "Concurrency limit changed");
        }
        if let Some(size) = update.prefetch_size {
            self.inner.prefetch_size.store(size, Ordering::Relaxed);
            info!(prefetch_size = size, "Prefetch batch size changed");
        }
        Ok(())
    }

    /// Progress of an in-flight load.
    pub fn progress(&self, identifier: &str) -> Option<ProgressState> {
        lock(&self.inner.progress)
            .get(identifier)
            .map(|(_, state)| state.clone())
    }

    /// Identifiers with a fetch in flight.
    pub fn active_loads(&self) -> Vec<String> {
        let mut loads: Vec<String> = lock(&self.inner.in_flight).keys().cloned().collect();
        loads.sort();
        loads
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.inner.limiter
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoaderEvent> {
        self.inner.events.subscribe()
    }
}

impl std::fmt::Debug for LoadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadCoordinator")
            .field("uri_client", &self.inner.uri_client.is_some())
            .field("rs_client", &self.inner.rs_client.is_some())
            .field("registry", &self.inner.registry)
            .field("limiter", &self.inner.limiter)
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl Inner {
    fn remove_progress(&self, identifier: &str, generation: u64) {
        let mut progress = lock(&self.progress);
        if progress
            .get(identifier)
            .is_some_and(|(current, _)| *current == generation)
        {
            progress.remove(identifier);
        }
    }
}

fn locator_metadata(locator: &Locator) -> DicomMetadata {
    DicomMetadata {
        study_uid: Some(locator.study_uid.clone()),
        series_uid: Some(locator.series_uid.clone()),
        sop_instance_uid: Some(locator.object_uid.clone()),
        ..Default::default()
    }
}

// =============================================================================
// Guards
// =============================================================================

/// Leaves the waiter count of an in-flight fetch on drop. The last waiter to
/// leave before the fetch finishes cancels it.
struct WaiterGuard<'a> {
    inner: &'a Inner,
    identifier: &'a str,
    generation: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.inner.in_flight);
        let Some(entry) = in_flight.get_mut(self.identifier) else {
            return;
        };
        if entry.generation != self.generation {
            return;
        }
        entry.waiters = entry.waiters.saturating_sub(1);
        if entry.waiters > 0 {
            return;
        }
        if let Some(entry) = in_flight.remove(self.identifier) {
            drop(in_flight);
            entry.cancel.cancel();
            self.inner.remove_progress(self.identifier, self.generation);
            publish(&entry.result, Err(LoaderError::Cancelled));
            debug!(identifier = self.identifier, "Last waiter left, fetch cancelled");
        }
    }
}

struct VolumeRegistration<'a> {
    inner: &'a Inner,
    volume_id: &'a str,
}

impl Drop for VolumeRegistration<'_> {
    fn drop(&mut self) {
        lock(&self.inner.volumes).remove(self.volume_id);
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builds a [`LoadCoordinator`], optionally with custom protocol clients,
/// modality handlers, a pixel decoder and hooks.
pub struct LoadCoordinatorBuilder {
    config: LoaderConfig,
    uri_client: Option<Arc<dyn ProtocolClient>>,
    rs_client: Option<Arc<dyn ProtocolClient>>,
    registry: Option<ModalityRegistry>,
    decoder: Option<Arc<dyn PixelDecoder>>,
    hooks: LoaderHooks,
    event_capacity: usize,
}

impl LoadCoordinatorBuilder {
    pub fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            uri_client: None,
            rs_client: None,
            registry: None,
            decoder: None,
            hooks: LoaderHooks::default(),
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }

    /// Use `client` for its protocol instead of building an HTTP client.
    pub fn protocol_client(mut self, client: Arc<dyn ProtocolClient>) -> Self {
        match client.protocol() {
            Protocol::Uri => self.uri_client = Some(client),
            Protocol::Rest => self.rs_client = Some(client),
        }
        self
    }

    pub fn modality_registry(mut self, registry: ModalityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn decoder(mut self, decoder: impl PixelDecoder + 'static) -> Self {
        self.decoder = Some(Arc::new(decoder));
        self
    }

    pub fn hooks(mut self, hooks: LoaderHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<LoadCoordinator> {
        let config = self.config;
        config.validate()?;

        let needs_transport = (self.uri_client.is_none() && config.wado_uri.is_some())
            || (self.rs_client.is_none() && config.wado_rs.is_some());
        let transport = if needs_transport {
            Some(Arc::new(HttpTransport::new(
                config.auth.clone(),
                RetryPolicy::new(config.retry_config()),
                config.request_timeout(),
            )?))
        } else {
            None
        };

        let uri_client = match (self.uri_client, &config.wado_uri, &transport) {
            (Some(client), _, _) => Some(client),
            (None, Some(uri), Some(transport)) => Some(Arc::new(WadoUriClient::new(
                uri.clone(),
                Arc::clone(transport),
            )?) as Arc<dyn ProtocolClient>),
            _ => None,
        };
        let rs_client = match (self.rs_client, &config.wado_rs, &transport) {
            (Some(client), _, _) => Some(client),
            (None, Some(rs), Some(transport)) => Some(Arc::new(WadoRsClient::new(
                rs.clone(),
                Arc::clone(transport),
            )?) as Arc<dyn ProtocolClient>),
            _ => None,
        };

        if uri_client.is_none() && rs_client.is_none() {
            return Err(LoaderError::Configuration(
                "no retrieval protocol configured: set wadoURI or wadoRS".to_string(),
            ));
        }

        let settings = Settings {
            supported_sop_classes: config.supported_sop_classes.clone(),
            default_transfer_syntax: config
                .wado_uri
                .as_ref()
                .and_then(|uri| uri.transfer_syntax.clone()),
            progressive: config.progressive.clone(),
            progressive_loading: config.progressive_loading,
        };

        if config.use_web_workers {
            debug!(
                worker_count = config.web_worker_count,
                "useWebWorkers has no effect; decoding runs on the blocking pool"
            );
        }

        info!(
            wado_uri = uri_client.is_some(),
            wado_rs = rs_client.is_some(),
            max_concurrent_loads = config.max_concurrent_loads,
            cache_size_mb = config.cache_size,
            prefetch_size = config.prefetch_size,
            "Load coordinator ready"
        );

        Ok(LoadCoordinator {
            inner: Arc::new(Inner {
                cache: ImageCache::with_capacity(config.cache_capacity_bytes()),
                uri_client,
                rs_client,
                registry: self.registry.unwrap_or_else(ModalityRegistry::with_defaults),
                decoder: self.decoder,
                limiter: ConcurrencyLimiter::new(config.max_concurrent_loads),
                in_flight: Mutex::new(HashMap::new()),
                progress: Mutex::new(HashMap::new()),
                volumes: Mutex::new(HashMap::new()),
                prefetch: PrefetchQueue::default(),
                prefetch_size: AtomicUsize::new(config.prefetch_size),
                sessions: SessionRegistry::default(),
                events: EventBus::new(self.event_capacity),
                hooks: self.hooks,
                settings,
                next_generation: AtomicU64::new(0),
            }),
        })
    }
}
