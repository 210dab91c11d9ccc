use crate::types::{BandGrid, RasterImage, SeriesError, SeriesResult};
use ndarray::Array2;

/// Speckle filtering parameters
#[derive(Debug, Clone)]
pub struct SpeckleFilterParams {
    /// Neighbourhood radius in map units (meters)
    pub radius_m: f64,
}

impl Default for SpeckleFilterParams {
    fn default() -> Self {
        Self {
            radius_m: 100.0,
        }
    }
}

/// Circular-neighbourhood median filter for radar backscatter.
///
/// Invalid (NaN) neighbours are ignored. A pixel whose whole neighbourhood
/// is invalid stays invalid. Values are not required to be positive, so the
/// filter can run directly on decibel data.
pub struct SpeckleFilter {
    params: SpeckleFilterParams,
}

impl SpeckleFilter {
    /// Create a new speckle filter with default parameters
    pub fn new() -> Self {
        Self {
            params: SpeckleFilterParams::default(),
        }
    }

    /// Create a speckle filter with custom parameters
    pub fn with_params(params: SpeckleFilterParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &SpeckleFilterParams {
        &self.params
    }

    /// Pixel offsets inside the circular kernel for a grid of the given resolution
    pub fn kernel_offsets(&self, resolution_m: f64) -> Vec<(isize, isize)> {
        let radius_px = if resolution_m > 0.0 {
            self.params.radius_m / resolution_m
        } else {
            0.0
        };
        let reach = radius_px.floor().max(0.0) as isize;
        let r2 = radius_px * radius_px;

        let mut offsets = Vec::new();
        for di in -reach..=reach {
            for dj in -reach..=reach {
                if ((di * di + dj * dj) as f64) <= r2 {
                    offsets.push((di, dj));
                }
            }
        }
        if offsets.is_empty() {
            offsets.push((0, 0));
        }
        offsets
    }

    /// Apply the focal median to a single band grid
    pub fn apply_filter(&self, grid: &BandGrid, resolution_m: f64) -> SeriesResult<BandGrid> {
        if !(resolution_m > 0.0) {
            return Err(SeriesError::Processing(format!(
                "Invalid ground resolution {} for speckle filtering",
                resolution_m
            )));
        }

        let offsets = self.kernel_offsets(resolution_m);
        let (height, width) = grid.dim();
        log::debug!(
            "Focal median: {}x{} grid, radius {} m, {} kernel cells",
            height,
            width,
            self.params.radius_m,
            offsets.len()
        );

        let data = self.filter_rows(grid, &offsets);
        Array2::from_shape_vec((height, width), data)
            .map_err(|e| SeriesError::Processing(format!("Speckle filter output shape: {}", e)))
    }

    /// Filter `source_bands` of an image and store them under `output_bands`.
    ///
    /// The returned image keeps the input timestamp and properties and only
    /// carries the filtered bands.
    pub fn apply_to_image(
        &self,
        image: &RasterImage,
        source_bands: &[&str],
        output_bands: &[&str],
    ) -> SeriesResult<RasterImage> {
        if source_bands.len() != output_bands.len() {
            return Err(SeriesError::Processing(
                "Speckle filter needs one output name per input band".to_string(),
            ));
        }

        let mut out = image.derive();
        for (source, output) in source_bands.iter().zip(output_bands) {
            let filtered = self.apply_filter(image.band(source)?, image.resolution_m)?;
            out.insert_band(*output, filtered)?;
        }
        Ok(out)
    }

    #[cfg(feature = "parallel")]
    fn filter_rows(&self, grid: &BandGrid, offsets: &[(isize, isize)]) -> Vec<f64> {
        use rayon::prelude::*;

        let (height, _) = grid.dim();
        (0..height)
            .into_par_iter()
            .flat_map_iter(|i| filter_row(grid, offsets, i))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    fn filter_rows(&self, grid: &BandGrid, offsets: &[(isize, isize)]) -> Vec<f64> {
        let (height, _) = grid.dim();
        (0..height).flat_map(|i| filter_row(grid, offsets, i)).collect()
    }
}

impl Default for SpeckleFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn filter_row(grid: &BandGrid, offsets: &[(isize, isize)], i: usize) -> Vec<f64> {
    let (height, width) = grid.dim();
    let mut row = Vec::with_capacity(width);
    let mut window_values = Vec::with_capacity(offsets.len());

    for j in 0..width {
        window_values.clear();
        for &(di, dj) in offsets {
            let ii = i as isize + di;
            let jj = j as isize + dj;
            if ii < 0 || jj < 0 || ii >= height as isize || jj >= width as isize {
                continue;
            }
            let value = grid[[ii as usize, jj as usize]];
            if value.is_finite() {
                window_values.push(value);
            }
        }
        row.push(median(&mut window_values));
    }
    row
}

/// Median of the finite values; mean of the two middle values for even counts
fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
