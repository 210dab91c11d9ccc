use crate::types::{BandGrid, RasterImage, SeriesResult};

pub const METERS_TO_MILLIMETERS: f64 = 1000.0;

/// Multiply every pixel by `factor`. NaN pixels stay NaN.
pub fn scale_band(grid: &BandGrid, factor: f64) -> BandGrid {
    grid.mapv(|value| value * factor)
}

/// Scale `source` into a new single-band image named `output`.
///
/// Timestamp and properties are carried over unchanged.
pub fn convert_band(image: &RasterImage, source: &str, output: &str, factor: f64) -> SeriesResult<RasterImage> {
    let scaled = scale_band(image.band(source)?, factor);
    image.derive().with_band(output, scaled)
}
