use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

use crate::types::{BandGrid, RasterImage, SeriesResult};

/// Quality masking configuration for optical imagery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMaskParams {
    /// Categorical scene classification band
    pub band: String,
    /// Class codes to exclude (cloud, shadow, snow/ice, no data, ...)
    pub excluded_classes: Vec<u16>,
}

impl Default for QualityMaskParams {
    fn default() -> Self {
        // Sentinel-2 L2A scene classification
        Self {
            band: "SCL".to_string(),
            excluded_classes: vec![
                0,  // no data
                3,  // cloud shadow
                8,  // cloud, medium probability
                9,  // cloud, high probability
                10, // thin cirrus
                11, // snow / ice
            ],
        }
    }
}

/// Boolean keep-mask built from a classification band
pub struct QualityMask {
    params: QualityMaskParams,
}

impl QualityMask {
    pub fn new(params: QualityMaskParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &QualityMaskParams {
        &self.params
    }

    /// True where the pixel class is valid and not excluded
    pub fn keep_mask(&self, image: &RasterImage) -> SeriesResult<Array2<bool>> {
        let quality = image.band(&self.params.band)?;
        Ok(quality.mapv(|class| self.keeps(class)))
    }

    fn keeps(&self, class: f64) -> bool {
        if !class.is_finite() || class < 0.0 {
            return false;
        }
        let code = class.round();
        !self
            .params
            .excluded_classes
            .iter()
            .any(|&excluded| f64::from(excluded) == code)
    }

    /// Apply the mask to every non-quality band of the image.
    ///
    /// Masked pixels become NaN; the classification band is dropped.
    pub fn mask_image(&self, image: &RasterImage) -> SeriesResult<RasterImage> {
        let keep = self.keep_mask(image)?;
        let kept = keep.iter().filter(|&&k| k).count();
        log::debug!(
            "Quality mask on '{}': {}/{} pixels kept",
            image.id,
            kept,
            keep.len()
        );

        let mut out = image.derive();
        for name in image.band_names() {
            if name == self.params.band {
                continue;
            }
            out.insert_band(name, apply_mask(image.band(name)?, &keep))?;
        }
        Ok(out)
    }
}

/// Set masked-out pixels to NaN (never to zero)
pub fn apply_mask(grid: &BandGrid, keep: &Array2<bool>) -> BandGrid {
    let mut out = grid.clone();
    Zip::from(&mut out).and(keep).for_each(|value, &k| {
        if !k {
            *value = f64::NAN;
        }
    });
    out
}
