//! TerraSeries: per-region environmental time series from satellite collections
//!
//! For every configured region this library pulls radar backscatter, optical
//! moisture/vegetation/water indices and reanalysis soil moisture and
//! precipitation from a raster source, reduces each image to a regional mean,
//! and writes one date-sorted CSV table per (region, sensor) pair.

pub mod types;
pub mod io;
pub mod core;
pub mod export;

// Re-export main types and functions for easier access
pub use types::{
    BandGrid, CancelToken, GeoTransform, Pixel, PropertyValue, RasterImage, Region, SeriesError,
    SeriesResult, TimeWindow,
};

pub use io::{CsvDirectorySink, MemoryCatalog, PipelineConfig, RasterSource, TableSink};
pub use export::{ExportOrchestrator, ExportReport, SensorKind, TaskId, TaskReport, TaskStatus};
