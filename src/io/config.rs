//! Pipeline configuration.
//!
//! Supplied once at process start (usually as YAML), validated, and shared
//! read-only by every export task.

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::core::processors::{OpticalParams, RadarParams, ReanalysisParams};
use crate::core::table::DuplicateDatePolicy;
use crate::core::zonal::ReducerParams;
use crate::types::{Region, SeriesError, SeriesResult, TimeWindow};

/// Region outline in geographic coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GeometryConfig {
    Rectangle {
        min_lon: f64,
        min_lat: f64,
        max_lon: f64,
        max_lat: f64,
    },
    /// Exterior ring as `[lon, lat]` pairs; closing vertex optional
    Polygon { coordinates: Vec<[f64; 2]> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    pub id: String,
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub display_color: Option<String>,
}

impl RegionConfig {
    pub fn to_region(&self) -> SeriesResult<Region> {
        let region = match &self.geometry {
            GeometryConfig::Rectangle {
                min_lon,
                min_lat,
                max_lon,
                max_lat,
            } => {
                if !(min_lon < max_lon && min_lat < max_lat) {
                    return Err(SeriesError::InvalidConfig(format!(
                        "Region '{}' rectangle has empty extent",
                        self.id
                    )));
                }
                Region::rectangle(&self.id, *min_lon, *min_lat, *max_lon, *max_lat)
            }
            GeometryConfig::Polygon { coordinates } => {
                let mut distinct: Vec<[f64; 2]> = Vec::new();
                for point in coordinates {
                    if !distinct.contains(point) {
                        distinct.push(*point);
                    }
                }
                if distinct.len() < 3 {
                    return Err(SeriesError::InvalidConfig(format!(
                        "Region '{}' polygon needs at least 3 distinct vertices",
                        self.id
                    )));
                }
                Region::polygon(&self.id, coordinates.iter().map(|[lon, lat]| (*lon, *lat)).collect())
            }
        };

        Ok(match &self.display_color {
            Some(color) => region.with_color(color),
            None => region,
        })
    }
}

/// Top-level pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub regions: Vec<RegionConfig>,

    /// First acquisition date (inclusive)
    pub start_date: NaiveDate,

    /// Last acquisition date (exclusive)
    pub end_date: NaiveDate,

    /// Spatial resolution of the zonal reduction (meters)
    #[serde(default = "default_scale_m")]
    pub scale_m: f64,

    /// Reduction cell cap per image before coarsening
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u64,

    /// Concurrent (region, sensor) tasks; bounded by what the source tolerates
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    #[serde(default = "default_reduce_timeout_secs")]
    pub reduce_timeout_secs: u64,

    /// Retries for transient source errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    #[serde(default)]
    pub duplicate_dates: DuplicateDatePolicy,

    #[serde(default)]
    pub radar: RadarParams,

    #[serde(default)]
    pub optical: OpticalParams,

    #[serde(default)]
    pub reanalysis: ReanalysisParams,
}

fn default_scale_m() -> f64 {
    10.0
}

fn default_max_pixels() -> u64 {
    10_000_000
}

fn default_max_concurrent_tasks() -> usize {
    4
}

fn default_query_timeout_secs() -> u64 {
    300
}

fn default_reduce_timeout_secs() -> u64 {
    900
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

impl PipelineConfig {
    /// Configuration with defaults for everything but regions and dates
    pub fn new(regions: Vec<RegionConfig>, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            regions,
            start_date,
            end_date,
            scale_m: default_scale_m(),
            max_pixels: default_max_pixels(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            query_timeout_secs: default_query_timeout_secs(),
            reduce_timeout_secs: default_reduce_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            duplicate_dates: DuplicateDatePolicy::default(),
            radar: RadarParams::default(),
            optical: OpticalParams::default(),
            reanalysis: ReanalysisParams::default(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> SeriesResult<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> SeriesResult<Self> {
        log::info!("Loading pipeline configuration from {}", path.as_ref().display());
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> SeriesResult<()> {
        if self.regions.is_empty() {
            return Err(SeriesError::InvalidConfig("No regions configured".to_string()));
        }

        let id_pattern = Regex::new(r"^[A-Za-z0-9_-]+$")
            .map_err(|e| SeriesError::InvalidConfig(format!("Region id pattern: {}", e)))?;
        let mut seen = HashSet::new();
        for region in &self.regions {
            if !id_pattern.is_match(&region.id) {
                return Err(SeriesError::InvalidConfig(format!(
                    "Region id '{}' must only use letters, digits, '_' or '-'",
                    region.id
                )));
            }
            if !seen.insert(region.id.as_str()) {
                return Err(SeriesError::InvalidConfig(format!(
                    "Duplicate region id '{}'",
                    region.id
                )));
            }
            region.to_region()?;
        }

        if self.start_date >= self.end_date {
            return Err(SeriesError::InvalidConfig(format!(
                "start_date {} must be before end_date {}",
                self.start_date, self.end_date
            )));
        }
        if !(self.scale_m > 0.0) {
            return Err(SeriesError::InvalidConfig("scale_m must be positive".to_string()));
        }
        if self.max_pixels == 0 {
            return Err(SeriesError::InvalidConfig("max_pixels must be positive".to_string()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(SeriesError::InvalidConfig(
                "max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.query_timeout_secs == 0 || self.reduce_timeout_secs == 0 {
            return Err(SeriesError::InvalidConfig("Timeouts must be positive".to_string()));
        }
        if !(0.0..=100.0).contains(&self.optical.cloud_cover_max) {
            return Err(SeriesError::InvalidConfig(format!(
                "optical.cloud_cover_max {} is not a percentage",
                self.optical.cloud_cover_max
            )));
        }
        if self.reanalysis.sample_hour > 23 {
            return Err(SeriesError::InvalidConfig(format!(
                "reanalysis.sample_hour {} is not an hour of day",
                self.reanalysis.sample_hour
            )));
        }
        if !(self.radar.smoothing_radius_m >= 0.0) {
            return Err(SeriesError::InvalidConfig(
                "radar.smoothing_radius_m must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow::new(self.start_date, self.end_date)
    }

    pub fn regions(&self) -> SeriesResult<Vec<Region>> {
        self.regions.iter().map(RegionConfig::to_region).collect()
    }

    pub fn reducer_params(&self) -> ReducerParams {
        ReducerParams {
            scale_m: self.scale_m,
            max_pixels: self.max_pixels,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn reduce_timeout(&self) -> Duration {
        Duration::from_secs(self.reduce_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
