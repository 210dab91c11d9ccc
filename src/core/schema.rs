//! Fixed per-sensor band schemas
//!
//! Each exported dataset has a band set known at compile time. Rows of an
//! [`OutputTable`](crate::core::table::OutputTable) are typed by one of these
//! records, so a misspelt band name cannot reach the sink.

use std::fmt::Debug;

pub trait BandSchema: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Sensor tag used in destination names
    const TAG: &'static str;
    /// Output band names, in column order
    const BANDS: &'static [&'static str];

    /// Build from values ordered as [`Self::BANDS`]; `None` on length mismatch
    fn from_values(values: &[f64]) -> Option<Self>;

    /// Values ordered as [`Self::BANDS`]
    fn values(&self) -> Vec<f64>;
}

/// Radar backscatter in dB
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadarValues {
    pub vv: f64,
    pub vh: f64,
}

impl BandSchema for RadarValues {
    const TAG: &'static str = "radar";
    const BANDS: &'static [&'static str] = &["VV", "VH"];

    fn from_values(values: &[f64]) -> Option<Self> {
        match *values {
            [vv, vh] => Some(Self { vv, vh }),
            _ => None,
        }
    }

    fn values(&self) -> Vec<f64> {
        vec![self.vv, self.vh]
    }
}

/// Optical moisture, vegetation and water indices
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpticalValues {
    pub ndmi: f64,
    pub ndvi: f64,
    pub ndwi: f64,
}

impl BandSchema for OpticalValues {
    const TAG: &'static str = "optical";
    const BANDS: &'static [&'static str] = &["NDMI", "NDVI", "NDWI"];

    fn from_values(values: &[f64]) -> Option<Self> {
        match *values {
            [ndmi, ndvi, ndwi] => Some(Self { ndmi, ndvi, ndwi }),
            _ => None,
        }
    }

    fn values(&self) -> Vec<f64> {
        vec![self.ndmi, self.ndvi, self.ndwi]
    }
}

/// Reanalysis volumetric soil water, source units
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoilMoistureValues {
    pub soil_moisture: f64,
}

impl BandSchema for SoilMoistureValues {
    const TAG: &'static str = "soil_moisture";
    const BANDS: &'static [&'static str] = &["soil_moisture"];

    fn from_values(values: &[f64]) -> Option<Self> {
        match *values {
            [soil_moisture] => Some(Self { soil_moisture }),
            _ => None,
        }
    }

    fn values(&self) -> Vec<f64> {
        vec![self.soil_moisture]
    }
}

/// Reanalysis precipitation in millimeters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrecipitationValues {
    pub precipitation_mm: f64,
}

impl BandSchema for PrecipitationValues {
    const TAG: &'static str = "precipitation";
    const BANDS: &'static [&'static str] = &["precipitation_mm"];

    fn from_values(values: &[f64]) -> Option<Self> {
        match *values {
            [precipitation_mm] => Some(Self { precipitation_mm }),
            _ => None,
        }
    }

    fn values(&self) -> Vec<f64> {
        vec![self.precipitation_mm]
    }
}
