//! I/O modules: raster sources, table sinks and configuration

pub mod source;
pub mod sink;
pub mod config;

pub use source::{CatalogQuery, MemoryCatalog, PropertyFilter, RasterSource};
pub use sink::{CsvDirectorySink, ExportRow, ExportTable, MemorySink, TableSink};
pub use config::{GeometryConfig, PipelineConfig, RegionConfig};
