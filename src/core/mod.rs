//! Core processing: band algebra, collections, zonal reduction and tables

pub mod speckle_filter;
pub mod masking;
pub mod indices;
pub mod units;
pub mod collection;
pub mod schema;
pub mod processors;
pub mod zonal;
pub mod table;

// Re-export main types
pub use speckle_filter::{SpeckleFilter, SpeckleFilterParams};
pub use masking::{apply_mask, QualityMask, QualityMaskParams};
pub use indices::{compute_indices, normalized_difference, BandPair};
pub use units::{convert_band, scale_band, METERS_TO_MILLIMETERS};
pub use collection::{ImageCollection, ImageTransform};
pub use schema::{BandSchema, OpticalValues, PrecipitationValues, RadarValues, SoilMoistureValues};
pub use processors::{
    CollectionProcessor, OpticalParams, OpticalProcessor, RadarParams, RadarProcessor,
    ReanalysisCollections, ReanalysisParams, ReanalysisProcessor,
};
pub use zonal::{ReducerParams, ZonalRecord, ZonalReducer};
pub use table::{DuplicateDatePolicy, OutputTable, TableRow, TemporalTable};
