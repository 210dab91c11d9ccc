//! Per-sensor collection processors
//!
//! Each processor turns a catalog query for one region into a cleaned
//! collection whose bands match the sensor's [`BandSchema`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core::collection::ImageCollection;
use crate::core::indices::{compute_indices, BandPair};
use crate::core::masking::{QualityMask, QualityMaskParams};
use crate::core::schema::{BandSchema, OpticalValues, PrecipitationValues, RadarValues, SoilMoistureValues};
use crate::core::speckle_filter::{SpeckleFilter, SpeckleFilterParams};
use crate::core::units::{convert_band, METERS_TO_MILLIMETERS};
use crate::io::source::{CatalogQuery, PropertyFilter, RasterSource};
use crate::types::{RasterImage, Region, SeriesResult, TimeWindow};

/// Turns a (region, window) pair into a processed collection
pub trait CollectionProcessor {
    type Output;

    fn process(&self, region: &Region, window: &TimeWindow) -> SeriesResult<Self::Output>;
}

/// Radar (Sentinel-1 GRD style) query and smoothing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadarParams {
    pub catalog_id: String,
    pub mode_property: String,
    pub instrument_mode: String,
    pub polarisation_property: String,
    pub pass_property: String,
    pub pass_direction: String,
    /// Source band names for VV and VH backscatter (dB)
    pub vv_band: String,
    pub vh_band: String,
    pub smoothing_radius_m: f64,
}

impl Default for RadarParams {
    fn default() -> Self {
        Self {
            catalog_id: "COPERNICUS/S1_GRD".to_string(),
            mode_property: "instrumentMode".to_string(),
            instrument_mode: "IW".to_string(),
            polarisation_property: "transmitterReceiverPolarisation".to_string(),
            pass_property: "orbitProperties_pass".to_string(),
            pass_direction: "DESCENDING".to_string(),
            vv_band: "VV".to_string(),
            vh_band: "VH".to_string(),
            smoothing_radius_m: 100.0,
        }
    }
}

pub struct RadarProcessor {
    source: Arc<dyn RasterSource>,
    params: RadarParams,
}

impl RadarProcessor {
    pub fn new(source: Arc<dyn RasterSource>, params: RadarParams) -> Self {
        Self { source, params }
    }

    pub fn query(&self, region: &Region, window: &TimeWindow) -> CatalogQuery {
        let p = &self.params;
        CatalogQuery::new(&p.catalog_id, region, *window)
            .filter(PropertyFilter::equals(&p.mode_property, &p.instrument_mode))
            .filter(PropertyFilter::contains_all(&p.polarisation_property, &["VV", "VH"]))
            .filter(PropertyFilter::equals(&p.pass_property, &p.pass_direction))
    }
}

impl CollectionProcessor for RadarProcessor {
    type Output = ImageCollection;

    fn process(&self, region: &Region, window: &TimeWindow) -> SeriesResult<ImageCollection> {
        let collection = self.source.query(&self.query(region, window))?;
        log::info!(
            "Radar collection for '{}': {} scenes",
            region.id,
            collection.len()
        );

        let filter = SpeckleFilter::with_params(SpeckleFilterParams {
            radius_m: self.params.smoothing_radius_m,
        });
        let sources = [self.params.vv_band.clone(), self.params.vh_band.clone()];
        Ok(collection.map(move |image: RasterImage| {
            filter.apply_to_image(&image, &[sources[0].as_str(), sources[1].as_str()], RadarValues::BANDS)
        }))
    }
}

/// Optical (Sentinel-2 SR style) query, masking and index parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpticalParams {
    pub catalog_id: String,
    pub cloud_property: String,
    /// Scenes with cloud cover at or above this percentage are skipped
    pub cloud_cover_max: f64,
    pub quality_mask: QualityMaskParams,
    pub moisture: BandPair,
    pub vegetation: BandPair,
    pub water: BandPair,
}

impl Default for OpticalParams {
    fn default() -> Self {
        Self {
            catalog_id: "COPERNICUS/S2_SR_HARMONIZED".to_string(),
            cloud_property: "CLOUDY_PIXEL_PERCENTAGE".to_string(),
            cloud_cover_max: 30.0,
            quality_mask: QualityMaskParams::default(),
            moisture: BandPair::new("B8", "B11"),
            vegetation: BandPair::new("B8", "B4"),
            water: BandPair::new("B3", "B8"),
        }
    }
}

pub struct OpticalProcessor {
    source: Arc<dyn RasterSource>,
    params: OpticalParams,
}

impl OpticalProcessor {
    pub fn new(source: Arc<dyn RasterSource>, params: OpticalParams) -> Self {
        Self { source, params }
    }

    pub fn query(&self, region: &Region, window: &TimeWindow) -> CatalogQuery {
        CatalogQuery::new(&self.params.catalog_id, region, *window).filter(PropertyFilter::less_than(
            &self.params.cloud_property,
            self.params.cloud_cover_max,
        ))
    }
}

impl CollectionProcessor for OpticalProcessor {
    type Output = ImageCollection;

    fn process(&self, region: &Region, window: &TimeWindow) -> SeriesResult<ImageCollection> {
        let collection = self.source.query(&self.query(region, window))?;
        log::info!(
            "Optical collection for '{}': {} scenes below {}% cloud",
            region.id,
            collection.len(),
            self.params.cloud_cover_max
        );

        let mask = QualityMask::new(self.params.quality_mask.clone());
        let pairs = [
            self.params.moisture.clone(),
            self.params.vegetation.clone(),
            self.params.water.clone(),
        ];
        Ok(collection.map(move |image: RasterImage| {
            let masked = mask.mask_image(&image)?;
            let indices: Vec<(&str, &BandPair)> = OpticalValues::BANDS
                .iter()
                .copied()
                .zip(pairs.iter())
                .collect();
            compute_indices(&masked, &indices)
        }))
    }
}

/// Reanalysis (ERA5-Land hourly style) parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReanalysisParams {
    pub catalog_id: String,
    /// UTC hour sampled to get one reading per day
    pub sample_hour: u32,
    pub soil_moisture_band: String,
    pub precipitation_band: String,
    pub precipitation_factor: f64,
}

impl Default for ReanalysisParams {
    fn default() -> Self {
        Self {
            catalog_id: "ECMWF/ERA5_LAND/HOURLY".to_string(),
            sample_hour: 12,
            soil_moisture_band: "volumetric_soil_water_layer_1".to_string(),
            precipitation_band: "total_precipitation".to_string(),
            precipitation_factor: METERS_TO_MILLIMETERS,
        }
    }
}

/// Soil moisture and precipitation, kept apart since their availability differs
#[derive(Debug, Clone)]
pub struct ReanalysisCollections {
    pub soil_moisture: ImageCollection,
    pub precipitation: ImageCollection,
}

pub struct ReanalysisProcessor {
    source: Arc<dyn RasterSource>,
    params: ReanalysisParams,
}

impl ReanalysisProcessor {
    pub fn new(source: Arc<dyn RasterSource>, params: ReanalysisParams) -> Self {
        Self { source, params }
    }

    pub fn query(&self, region: &Region, window: &TimeWindow) -> CatalogQuery {
        CatalogQuery::new(&self.params.catalog_id, region, *window)
            .filter(PropertyFilter::HourOfDay(self.params.sample_hour))
    }
}

impl CollectionProcessor for ReanalysisProcessor {
    type Output = ReanalysisCollections;

    fn process(&self, region: &Region, window: &TimeWindow) -> SeriesResult<ReanalysisCollections> {
        let collection = self.source.query(&self.query(region, window))?;
        log::info!(
            "Reanalysis collection for '{}': {} readings at {:02}:00 UTC",
            region.id,
            collection.len(),
            self.params.sample_hour
        );

        let soil_band = self.params.soil_moisture_band.clone();
        let soil_moisture = collection
            .clone()
            .select(&[soil_band.as_str()])
            .rename(&[(soil_band.as_str(), SoilMoistureValues::BANDS[0])]);

        let precip_band = self.params.precipitation_band.clone();
        let factor = self.params.precipitation_factor;
        let precipitation = collection.map(move |image: RasterImage| {
            convert_band(&image, &precip_band, PrecipitationValues::BANDS[0], factor)
        });

        Ok(ReanalysisCollections {
            soil_moisture,
            precipitation,
        })
    }
}
