//! Tuning knobs for the render core and their JSON persistence.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigIoError};
use crate::material::NoteTheme;

/// Pixel scale of the piano roll at zoom 1.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub pixels_per_beat: f64,
    pub key_height: f64,
    /// Notes narrower than this are widened so they stay clickable.
    pub min_note_width: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            pixels_per_beat: 100.0,
            key_height: 12.0,
            min_note_width: 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    pub bucket_size: f64,
    pub min_bucket_size: f64,
    pub max_bucket_size: f64,
    pub rebuild_threshold: f64,
    /// Re-tune the bucket size after every full rebuild.
    pub auto_optimize: bool,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        Self {
            bucket_size: 200.0,
            min_bucket_size: 50.0,
            max_bucket_size: 1000.0,
            rebuild_threshold: 10.0,
            auto_optimize: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CullingConfig {
    /// Scroll distance under which the last index query is reused.
    pub viewport_change_threshold: f64,
    /// Margin queried around the viewport. Must cover the change threshold.
    pub overscan: f64,
}

impl Default for CullingConfig {
    fn default() -> Self {
        Self {
            viewport_change_threshold: 5.0,
            overscan: 16.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeometryConfig {
    pub corner_segments: u32,
}

impl Default for GeometryConfig {
    fn default() -> Self {
        Self { corner_segments: 8 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_items_per_batch: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items_per_batch: 10_000,
        }
    }
}

/// Thresholds of the level-of-detail tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LodConfig {
    pub density_note_threshold: usize,
    pub density_zoom_threshold: f64,
    pub low_note_threshold: usize,
    pub low_zoom_threshold: f64,
    pub medium_note_threshold: usize,
    pub density_cell_size: f64,
}

impl Default for LodConfig {
    fn default() -> Self {
        Self {
            density_note_threshold: 5000,
            density_zoom_threshold: 0.3,
            low_note_threshold: 2000,
            low_zoom_threshold: 0.7,
            medium_note_threshold: 2000,
            density_cell_size: 8.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatCacheConfig {
    /// Draw pre-rendered beat textures instead of the density grid at the lowest tier.
    pub enabled: bool,
    pub texture_width: u32,
    pub texture_height: u32,
    pub max_entries: usize,
}

impl Default for BeatCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            texture_width: 256,
            texture_height: 128,
            max_entries: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub history_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 300,
        }
    }
}

/// Limits used by the optimization advisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    pub target_frame_time_ms: f64,
    pub max_batch_count: f64,
    pub gpu_memory_ceiling_mb: f64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            target_frame_time_ms: 1000.0 / 60.0,
            max_batch_count: 1000.0,
            gpu_memory_ceiling_mb: 1000.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Preparation pool size. Zero means one thread per logical CPU.
    pub worker_threads: usize,
    /// Concurrent preparation jobs. Zero means one per logical CPU.
    pub max_concurrent_jobs: usize,
    pub visible_margin: f64,
    pub dirty_region_margin: f64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            max_concurrent_jobs: 0,
            visible_margin: 100.0,
            dirty_region_margin: 5.0,
        }
    }
}

impl TaskConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_negative("tasks.visible_margin", self.visible_margin)?;
        non_negative("tasks.dirty_region_margin", self.dirty_region_margin)
    }

    pub fn resolved_worker_threads(&self) -> usize {
        resolve_parallelism(self.worker_threads)
    }

    pub fn resolved_max_concurrent_jobs(&self) -> usize {
        resolve_parallelism(self.max_concurrent_jobs)
    }
}

fn resolve_parallelism(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get().max(1)
    } else {
        requested
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Consecutive failed frames before the LOD floor drops to the density map.
    pub max_consecutive_failures: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
        }
    }
}

/// Complete configuration of a [`crate::RenderContext`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub layout: LayoutConfig,
    pub spatial: SpatialConfig,
    pub culling: CullingConfig,
    pub geometry: GeometryConfig,
    pub batching: BatchConfig,
    pub lod: LodConfig,
    pub beat_cache: BeatCacheConfig,
    pub monitor: MonitorConfig,
    pub advisor: AdvisorConfig,
    pub tasks: TaskConfig,
    pub recovery: RecoveryConfig,
    pub theme: NoteTheme,
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(field, "finite and > 0", value))
    }
}

fn non_negative(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(field, "finite and >= 0", value))
    }
}

fn at_least_one(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value >= 1 {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(field, ">= 1", value as f64))
    }
}

impl RenderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("layout.pixels_per_beat", self.layout.pixels_per_beat)?;
        positive("layout.key_height", self.layout.key_height)?;
        non_negative("layout.min_note_width", self.layout.min_note_width)?;

        positive("spatial.bucket_size", self.spatial.bucket_size)?;
        positive("spatial.min_bucket_size", self.spatial.min_bucket_size)?;
        positive("spatial.max_bucket_size", self.spatial.max_bucket_size)?;
        non_negative("spatial.rebuild_threshold", self.spatial.rebuild_threshold)?;
        if self.spatial.min_bucket_size > self.spatial.max_bucket_size {
            return Err(ConfigError::Inconsistent(
                "spatial.min_bucket_size exceeds spatial.max_bucket_size",
            ));
        }

        non_negative(
            "culling.viewport_change_threshold",
            self.culling.viewport_change_threshold,
        )?;
        non_negative("culling.overscan", self.culling.overscan)?;
        if self.culling.overscan < self.culling.viewport_change_threshold {
            return Err(ConfigError::Inconsistent(
                "culling.overscan must cover culling.viewport_change_threshold",
            ));
        }

        if !(1..=64).contains(&self.geometry.corner_segments) {
            return Err(ConfigError::out_of_range(
                "geometry.corner_segments",
                "between 1 and 64",
                f64::from(self.geometry.corner_segments),
            ));
        }

        at_least_one("batching.max_items_per_batch", self.batching.max_items_per_batch)?;

        non_negative("lod.density_zoom_threshold", self.lod.density_zoom_threshold)?;
        non_negative("lod.low_zoom_threshold", self.lod.low_zoom_threshold)?;
        positive("lod.density_cell_size", self.lod.density_cell_size)?;
        if self.lod.density_note_threshold < self.lod.low_note_threshold {
            return Err(ConfigError::Inconsistent(
                "lod.density_note_threshold must be >= lod.low_note_threshold",
            ));
        }
        if self.lod.density_zoom_threshold > self.lod.low_zoom_threshold {
            return Err(ConfigError::Inconsistent(
                "lod.density_zoom_threshold must be <= lod.low_zoom_threshold",
            ));
        }

        at_least_one("beat_cache.texture_width", self.beat_cache.texture_width as usize)?;
        at_least_one("beat_cache.texture_height", self.beat_cache.texture_height as usize)?;
        at_least_one("beat_cache.max_entries", self.beat_cache.max_entries)?;

        at_least_one("monitor.history_capacity", self.monitor.history_capacity)?;
        positive("advisor.target_frame_time_ms", self.advisor.target_frame_time_ms)?;
        non_negative("advisor.max_batch_count", self.advisor.max_batch_count)?;
        non_negative("advisor.gpu_memory_ceiling_mb", self.advisor.gpu_memory_ceiling_mb)?;

        self.tasks.validate()?;

        if self.recovery.max_consecutive_failures == 0 {
            return Err(ConfigError::out_of_range(
                "recovery.max_consecutive_failures",
                ">= 1",
                0.0,
            ));
        }
        Ok(())
    }

    /// Default location: `<config dir>/HarmoniqStudio/noteview.json`.
    pub fn default_path() -> Option<PathBuf> {
        let mut base = dirs::config_dir()?;
        base.push("HarmoniqStudio");
        base.push("noteview.json");
        Some(base)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigIoError> {
        let contents = fs::read_to_string(path)?;
        let config: RenderConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigIoError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Loads the config from the default location, falling back to defaults.
    pub fn load_or_default() -> Self {
        let Some(path) = Self::default_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    ?err,
                    path = %path.display(),
                    "failed to load render config, using defaults"
                );
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<PathBuf, ConfigIoError> {
        let path = Self::default_path().ok_or(ConfigIoError::NoConfigDir)?;
        self.save_to(&path)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RenderConfig::default()
            .validate()
            .expect("default config validates");
    }

    #[test]
    fn rejects_inverted_lod_thresholds() {
        let mut config = RenderConfig::default();
        config.lod.density_note_threshold = 100;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Inconsistent(_))
        ));
    }

    #[test]
    fn rejects_non_positive_scale() {
        let mut config = RenderConfig::default();
        config.layout.pixels_per_beat = 0.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "layout.pixels_per_beat",
                ..
            })
        ));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: RenderConfig =
            serde_json::from_str(r#"{ "batching": { "max_items_per_batch": 64 } }"#)
                .expect("parse partial config");
        assert_eq!(config.batching.max_items_per_batch, 64);
        assert_eq!(config.spatial, SpatialConfig::default());
    }
}
