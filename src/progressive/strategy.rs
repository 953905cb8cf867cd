//! Chunk planning for progressive sessions.
//!
//! A session's identifiers are first put in load order, then cut into
//! chunks lazily: each time a chunk slot frees up the [`ChunkPlanner`] decides
//! how many identifiers go into the next chunk.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LoaderError, Result};

/// Default number of images per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Default number of chunks loading at once.
pub const DEFAULT_MAX_CONCURRENT_CHUNKS: usize = 2;

/// Default number of distinct priority levels.
pub const DEFAULT_PRIORITY_LEVELS: u8 = 3;

/// Default number of images loaded on each side of the focus index first.
pub const DEFAULT_PRELOAD_DISTANCE: usize = 5;

/// Default cache fill ratio above which chunks shrink.
pub const DEFAULT_MEMORY_THRESHOLD: f64 = 0.8;

/// Per-image chunk latency the adaptive strategy aims for.
pub const TARGET_IMAGE_LATENCY: Duration = Duration::from_millis(250);

/// Ceiling for adaptive chunk growth, as a multiple of the base chunk size.
const MAX_CHUNK_MULTIPLIER: usize = 4;

/// Order in which a session loads its images.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingStrategy {
    /// Input order, fixed chunk size
    #[default]
    Sequential,
    /// Input order, chunk size follows observed latency
    Adaptive,
    /// Images nearest the focus index first
    Predictive,
}

/// Progressive loading options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProgressiveConfig {
    pub chunk_size: usize,
    pub max_concurrent_chunks: usize,
    pub priority_levels: u8,
    pub preload_distance: usize,
    /// Cache fill ratio in (0, 1]
    pub memory_threshold: f64,
    pub adaptive_chunk_size: bool,
    pub strategy: LoadingStrategy,
}

impl Default for ProgressiveConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_chunks: DEFAULT_MAX_CONCURRENT_CHUNKS,
            priority_levels: DEFAULT_PRIORITY_LEVELS,
            preload_distance: DEFAULT_PRELOAD_DISTANCE,
            memory_threshold: DEFAULT_MEMORY_THRESHOLD,
            adaptive_chunk_size: true,
            strategy: LoadingStrategy::Sequential,
        }
    }
}

impl ProgressiveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(LoaderError::Configuration(
                "progressive.chunkSize must be greater than 0".to_string(),
            ));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(LoaderError::Configuration(
                "progressive.maxConcurrentChunks must be greater than 0".to_string(),
            ));
        }
        if self.priority_levels == 0 {
            return Err(LoaderError::Configuration(
                "progressive.priorityLevels must be greater than 0".to_string(),
            ));
        }
        if !(self.memory_threshold > 0.0 && self.memory_threshold <= 1.0) {
            return Err(LoaderError::Configuration(
                "progressive.memoryThreshold must be in (0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Clamp a requested priority into the configured levels.
    pub fn clamp_priority(&self, priority: u8) -> u8 {
        priority.min(self.priority_levels.saturating_sub(1))
    }
}

/// Put identifiers in load order, keeping each one's input index.
///
/// Sequential and adaptive keep input order. Predictive sorts by distance
/// from `focus`, lower index first on ties.
pub fn order_identifiers(
    strategy: LoadingStrategy,
    identifiers: &[String],
    focus: usize,
) -> Vec<(usize, String)> {
    let mut ordered: Vec<(usize, String)> = identifiers.iter().cloned().enumerate().collect();
    if strategy == LoadingStrategy::Predictive && !ordered.is_empty() {
        let focus = focus.min(ordered.len() - 1);
        ordered.sort_by_key(|(index, _)| (index.abs_diff(focus), *index));
    }
    ordered
}

/// Decides the size of each chunk as a session progresses.
#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    strategy: LoadingStrategy,
    base: usize,
    current: usize,
    max: usize,
    adaptive: bool,
    /// Size of the first chunk for predictive sessions
    first_chunk: Option<usize>,
    planned: usize,
}

impl ChunkPlanner {
    pub fn new(config: &ProgressiveConfig, strategy: LoadingStrategy) -> Self {
        let base = config.chunk_size.max(1);
        let first_chunk = match strategy {
            LoadingStrategy::Predictive => {
                Some(config.preload_distance.saturating_mul(2).saturating_add(1))
            }
            _ => None,
        };
        Self {
            strategy,
            base,
            current: base,
            max: base.saturating_mul(MAX_CHUNK_MULTIPLIER),
            adaptive: config.adaptive_chunk_size && strategy != LoadingStrategy::Sequential,
            first_chunk,
            planned: 0,
        }
    }

    /// A planner that puts everything into a single chunk.
    pub fn single_chunk(total: usize) -> Self {
        let size = total.max(1);
        Self {
            strategy: LoadingStrategy::Sequential,
            base: size,
            current: size,
            max: size,
            adaptive: false,
            first_chunk: None,
            planned: 0,
        }
    }

    pub fn strategy(&self) -> LoadingStrategy {
        self.strategy
    }

    /// Size of the next chunk. Always at least 1.
    pub fn next_size(&mut self) -> usize {
        self.planned += 1;
        if self.planned == 1 {
            if let Some(first) = self.first_chunk {
                return first.max(1);
            }
        }
        self.current
    }

    /// Feed back the latency of a finished chunk.
    pub fn record(&mut self, images: usize, elapsed: Duration) {
        if !self.adaptive || images == 0 {
            return;
        }
        let per_image = elapsed / images as u32;
        if per_image < TARGET_IMAGE_LATENCY {
            self.current = self.current.saturating_add(self.current.div_ceil(2)).min(self.max);
        } else if per_image > TARGET_IMAGE_LATENCY * 2 {
            self.current = (self.current / 2).max(1);
        }
    }

    /// Halve the next chunk because the cache is filling up.
    pub fn memory_pressure(&mut self) {
        self.current = (self.current / 2).max(1);
    }

    pub fn base(&self) -> usize {
        self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("img-{}", i)).collect()
    }

    #[test]
    fn test_sequential_order() {
        let ordered = order_identifiers(LoadingStrategy::Sequential, &ids(4), 2);
        let indices: Vec<usize> = ordered.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_predictive_order_around_focus() {
        let ordered = order_identifiers(LoadingStrategy::Predictive, &ids(6), 3);
        let indices: Vec<usize> = ordered.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![3, 2, 4, 1, 5, 0]);

        // Focus beyond the end is clamped to the last image
        let ordered = order_identifiers(LoadingStrategy::Predictive, &ids(3), 10);
        assert_eq!(ordered[0].0, 2);
    }

    #[test]
    fn test_sequential_size_is_fixed() {
        let config = ProgressiveConfig {
            chunk_size: 4,
            ..Default::default()
        };
        let mut planner = ChunkPlanner::new(&config, LoadingStrategy::Sequential);
        assert_eq!(planner.next_size(), 4);
        planner.record(4, Duration::from_millis(1));
        assert_eq!(planner.next_size(), 4);
    }

    #[test]
    fn test_adaptive_grows_and_shrinks_within_bounds() {
        let config = ProgressiveConfig {
            chunk_size: 4,
            ..Default::default()
        };
        let mut planner = ChunkPlanner::new(&config, LoadingStrategy::Adaptive);

        for _ in 0..10 {
            planner.record(4, Duration::from_millis(10));
        }
        assert_eq!(planner.next_size(), 16);

        for _ in 0..10 {
            planner.record(1, Duration::from_secs(5));
        }
        assert_eq!(planner.next_size(), 1);
    }

    #[test]
    fn test_adaptive_disabled() {
        let config = ProgressiveConfig {
            chunk_size: 4,
            adaptive_chunk_size: false,
            ..Default::default()
        };
        let mut planner = ChunkPlanner::new(&config, LoadingStrategy::Adaptive);
        planner.record(4, Duration::from_millis(1));
        assert_eq!(planner.next_size(), 4);
    }

    #[test]
    fn test_predictive_first_chunk_covers_preload_window() {
        let config = ProgressiveConfig {
            chunk_size: 3,
            preload_distance: 2,
            ..Default::default()
        };
        let mut planner = ChunkPlanner::new(&config, LoadingStrategy::Predictive);
        assert_eq!(planner.next_size(), 5);
        assert_eq!(planner.next_size(), 3);
    }

    #[test]
    fn test_memory_pressure_halves() {
        let config = ProgressiveConfig {
            chunk_size: 8,
            ..Default::default()
        };
        let mut planner = ChunkPlanner::new(&config, LoadingStrategy::Sequential);
        planner.memory_pressure();
        assert_eq!(planner.next_size(), 4);
        planner.memory_pressure();
        planner.memory_pressure();
        planner.memory_pressure();
        assert_eq!(planner.next_size(), 1);
    }

    #[test]
    fn test_huge_sizes_saturate() {
        let config = ProgressiveConfig {
            chunk_size: usize::MAX,
            preload_distance: usize::MAX,
            adaptive_chunk_size: true,
            ..Default::default()
        };
        let mut planner = ChunkPlanner::new(&config, LoadingStrategy::Predictive);
        assert_eq!(planner.next_size(), usize::MAX);
        assert_eq!(planner.next_size(), usize::MAX);

        // Growth from the largest size stays at the cap
        planner.record(1, Duration::from_millis(1));
        assert_eq!(planner.next_size(), usize::MAX);

        let mut planner = ChunkPlanner::new(&config, LoadingStrategy::Adaptive);
        planner.record(1, Duration::from_millis(1));
        assert_eq!(planner.next_size(), usize::MAX);
    }

    #[test]
    fn test_single_chunk() {
        let mut planner = ChunkPlanner::single_chunk(42);
        assert_eq!(planner.next_size(), 42);
        assert_eq!(ChunkPlanner::single_chunk(0).next_size(), 1);
    }

    #[test]
    fn test_config_validation() {
        assert!(ProgressiveConfig::default().validate().is_ok());
        let invalid = ProgressiveConfig {
            memory_threshold: 1.5,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());
        let invalid = ProgressiveConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_clamp_priority() {
        let config = ProgressiveConfig::default();
        assert_eq!(config.clamp_priority(0), 0);
        assert_eq!(config.clamp_priority(9), 2);
    }
}
