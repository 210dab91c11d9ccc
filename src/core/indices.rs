//! Normalized difference spectral indices

use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::types::{BandGrid, RasterImage, SeriesError, SeriesResult};

/// Band pair for `(positive - negative) / (positive + negative)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandPair {
    pub positive: String,
    pub negative: String,
}

impl BandPair {
    pub fn new(positive: impl Into<String>, negative: impl Into<String>) -> Self {
        Self {
            positive: positive.into(),
            negative: negative.into(),
        }
    }
}

/// Compute `(a - b) / (a + b)` pixelwise.
///
/// The result is NaN where either input is NaN or where `a + b == 0`.
pub fn normalized_difference(band_a: &BandGrid, band_b: &BandGrid) -> SeriesResult<BandGrid> {
    if band_a.dim() != band_b.dim() {
        return Err(SeriesError::Processing(format!(
            "Normalized difference inputs differ in shape: {:?} vs {:?}",
            band_a.dim(),
            band_b.dim()
        )));
    }

    let mut out = Array2::from_elem(band_a.dim(), f64::NAN);
    Zip::from(&mut out)
        .and(band_a)
        .and(band_b)
        .for_each(|value, &a, &b| {
            let sum = a + b;
            if a.is_finite() && b.is_finite() && sum != 0.0 {
                *value = (a - b) / sum;
            }
        });
    Ok(out)
}

/// Compute named indices from an image; the output carries only the index bands
pub fn compute_indices(image: &RasterImage, indices: &[(&str, &BandPair)]) -> SeriesResult<RasterImage> {
    let mut out = image.derive();
    for (name, pair) in indices {
        let index = normalized_difference(image.band(&pair.positive)?, image.band(&pair.negative)?)?;
        out.insert_band(*name, index)?;
    }
    Ok(out)
}
