//! Volume assembly.
//!
//! A volume is a set of instances loaded together and returned in slice order.
//! Ordering rules, in this order:
//!
//! 1. Instance number, if every image has one
//! 2. Z of image position (patient), if every image has one
//! 3. Input order
//!
//! Sorting is stable, so equal keys keep input order.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::dicom::ImagePayload;
use crate::error::LoaderError;

/// How the images of a volume were ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SliceOrdering {
    InstanceNumber,
    ImagePosition,
    Input,
}

/// Summary published with the `volume-loaded` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMetadata {
    pub volume_id: String,
    pub requested: usize,
    pub loaded: usize,
    pub failed: usize,
    pub total_size_bytes: usize,
    pub elapsed_ms: u64,
    pub ordering: SliceOrdering,
    pub study_uid: Option<String>,
    pub series_uid: Option<String>,
    pub rows: Option<u32>,
    pub columns: Option<u32>,
}

/// An image of the volume that could not be loaded.
#[derive(Debug, Clone)]
pub struct VolumeFailure {
    pub identifier: String,
    pub error: LoaderError,
}

/// Outcome of a volume load.
#[derive(Debug, Clone)]
pub struct VolumeResult {
    pub metadata: VolumeMetadata,
    /// Successfully loaded images in slice order
    pub images: Vec<ImagePayload>,
    pub failures: Vec<VolumeFailure>,
}

impl VolumeResult {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Accumulates per-image outcomes while a volume loads.
#[derive(Debug)]
pub struct VolumeLoadContext {
    pub volume_id: String,
    pub identifiers: Vec<String>,
    pub loaded: HashMap<usize, ImagePayload>,
    pub failures: Vec<(usize, VolumeFailure)>,
    pub total_size_bytes: usize,
    pub start_time: Instant,
    pub cancel: CancellationToken,
}

impl VolumeLoadContext {
    pub fn new(volume_id: String, identifiers: Vec<String>, cancel: CancellationToken) -> Self {
        Self {
            volume_id,
            identifiers,
            loaded: HashMap::new(),
            failures: Vec::new(),
            total_size_bytes: 0,
            start_time: Instant::now(),
            cancel,
        }
    }

    pub fn record(&mut self, index: usize, outcome: Result<ImagePayload, LoaderError>) {
        match outcome {
            Ok(payload) => {
                self.total_size_bytes += payload.size_bytes();
                self.loaded.insert(index, payload);
            }
            Err(error) => {
                let identifier = self.identifiers.get(index).cloned().unwrap_or_default();
                self.failures.push((index, VolumeFailure { identifier, error }));
            }
        }
    }

    /// Assemble the result. An identifier whose task never reported an
    /// outcome is listed as an internal failure.
    pub fn finish(self) -> VolumeResult {
        let mut failures = self.failures;
        let reported: HashSet<usize> = self
            .loaded
            .keys()
            .copied()
            .chain(failures.iter().map(|(index, _)| *index))
            .collect();
        for (index, identifier) in self.identifiers.iter().enumerate() {
            if !reported.contains(&index) {
                failures.push((
                    index,
                    VolumeFailure {
                        identifier: identifier.clone(),
                        error: LoaderError::Internal("image task ended without a result".into()),
                    },
                ));
            }
        }

        let mut indexed: Vec<(usize, ImagePayload)> = self.loaded.into_iter().collect();
        indexed.sort_by_key(|(index, _)| *index);
        let mut images: Vec<ImagePayload> = indexed.into_iter().map(|(_, p)| p).collect();
        let ordering = sort_slices(&mut images);

        failures.sort_by_key(|(index, _)| *index);
        let failures: Vec<VolumeFailure> = failures.into_iter().map(|(_, f)| f).collect();

        let first = images.first().map(|image| &image.metadata);
        let metadata = VolumeMetadata {
            volume_id: self.volume_id,
            requested: self.identifiers.len(),
            loaded: images.len(),
            failed: failures.len(),
            total_size_bytes: self.total_size_bytes,
            elapsed_ms: self.start_time.elapsed().as_millis() as u64,
            ordering,
            study_uid: first.and_then(|m| m.study_uid.clone()),
            series_uid: first.and_then(|m| m.series_uid.clone()),
            rows: first.and_then(|m| m.rows),
            columns: first.and_then(|m| m.columns),
        };

        VolumeResult {
            metadata,
            images,
            failures,
        }
    }
}

/// Sort images into slice order and report which rule applied.
pub fn sort_slices(images: &mut [ImagePayload]) -> SliceOrdering {
    if images
        .iter()
        .all(|image| image.metadata.instance_number.is_some())
    {
        images.sort_by_key(|image| image.metadata.instance_number);
        return SliceOrdering::InstanceNumber;
    }

    if images
        .iter()
        .all(|image| image.metadata.image_position_patient.is_some())
    {
        images.sort_by(|a, b| {
            let za = a.metadata.image_position_patient.map_or(0.0, |p| p[2]);
            let zb = b.metadata.image_position_patient.map_or(0.0, |p| p[2]);
            za.total_cmp(&zb)
        });
        return SliceOrdering::ImagePosition;
    }

    SliceOrdering::Input
}
