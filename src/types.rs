use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use geo::{Area, BooleanOps, BoundingRect, Contains, Coord, Intersects, LineString, Point, Polygon, Rect};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Scalar pixel value. Invalid pixels (masked, no-data, undefined) are NaN.
pub type Pixel = f64;

/// 2D band grid (rows x cols)
pub type BandGrid = Array2<Pixel>;

/// Geospatial transformation parameters (affine, geographic degrees)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform without rotation. `pixel_height` is negative for
    /// rows running southwards.
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height,
        }
    }

    /// Map a fractional (row, col) pixel position to (lon, lat).
    pub fn to_geo(&self, row: f64, col: f64) -> (f64, f64) {
        let x = self.top_left_x + col * self.pixel_width + row * self.rotation_x;
        let y = self.top_left_y + col * self.rotation_y + row * self.pixel_height;
        (x, y)
    }

    /// Centre of pixel (row, col)
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        self.to_geo(row as f64 + 0.5, col as f64 + 0.5)
    }

    /// Bounding rectangle covered by a grid of the given shape
    pub fn footprint(&self, rows: usize, cols: usize) -> Rect<f64> {
        self.window_rect(0, 0, rows, cols)
    }

    /// Bounding rectangle of pixel rows `row0..row1` and columns `col0..col1`
    pub fn window_rect(&self, row0: usize, col0: usize, row1: usize, col1: usize) -> Rect<f64> {
        let (r0, c0, r1, c1) = (row0 as f64, col0 as f64, row1 as f64, col1 as f64);
        let corners = [
            self.to_geo(r0, c0),
            self.to_geo(r0, c1),
            self.to_geo(r1, c0),
            self.to_geo(r1, c1),
        ];
        let (mut min_x, mut min_y) = corners[0];
        let (mut max_x, mut max_y) = corners[0];
        for &(x, y) in &corners[1..] {
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
        Rect::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y })
    }
}

/// Named region of interest
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    /// Unique identifier, also used as the output filename key
    pub id: String,
    /// Outline in geographic coordinates (lon, lat)
    pub geometry: Polygon<f64>,
    /// Display-only metadata, never used in processing
    pub display_color: Option<String>,
}

impl Region {
    pub fn new(id: impl Into<String>, geometry: Polygon<f64>) -> Self {
        Self {
            id: id.into(),
            geometry,
            display_color: None,
        }
    }

    /// Axis-aligned rectangle region
    pub fn rectangle(id: impl Into<String>, min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        let rect = Rect::new(
            Coord { x: min_lon, y: min_lat },
            Coord { x: max_lon, y: max_lat },
        );
        Self::new(id, rect.to_polygon())
    }

    /// Polygon region from an exterior ring of (lon, lat) vertices
    pub fn polygon(id: impl Into<String>, ring: Vec<(f64, f64)>) -> Self {
        Self::new(id, Polygon::new(LineString::from(ring), vec![]))
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.display_color = Some(color.into());
        self
    }

    pub fn bounds(&self) -> Option<Rect<f64>> {
        self.geometry.bounding_rect()
    }

    /// True if (lon, lat) lies strictly inside the region
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        self.geometry.contains(&Point::new(lon, lat))
    }

    /// Share of `rect` (0..=1) covered by the region
    pub fn overlap_fraction(&self, rect: &Rect<f64>) -> f64 {
        let cell_area = rect.unsigned_area();
        if cell_area <= 0.0 || !self.geometry.intersects(rect) {
            return 0.0;
        }
        let shared = self.geometry.intersection(&rect.to_polygon()).unsigned_area();
        (shared / cell_area).clamp(0.0, 1.0)
    }
}

/// Global acquisition window: `start` inclusive, `end` exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn contains(&self, instant: &DateTime<Utc>) -> bool {
        let start = self.start.and_time(NaiveTime::MIN).and_utc();
        let end = self.end.and_time(NaiveTime::MIN).and_utc();
        *instant >= start && *instant < end
    }
}

/// Scalar or string image property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
    List(Vec<String>),
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Number(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::Text(value.to_string())
    }
}

impl From<Vec<&str>> for PropertyValue {
    fn from(values: Vec<&str>) -> Self {
        PropertyValue::List(values.into_iter().map(str::to_string).collect())
    }
}

/// Time-stamped multi-band raster image.
///
/// Images are never mutated in place by processing steps: every transform
/// consumes or borrows an image and produces a new one via [`RasterImage::derive`].
#[derive(Debug, Clone)]
pub struct RasterImage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub transform: GeoTransform,
    /// Nominal ground resolution in meters
    pub resolution_m: f64,
    pub properties: BTreeMap<String, PropertyValue>,
    shape: (usize, usize),
    bands: BTreeMap<String, BandGrid>,
}

impl RasterImage {
    pub fn new(
        id: impl Into<String>,
        timestamp: DateTime<Utc>,
        transform: GeoTransform,
        resolution_m: f64,
        shape: (usize, usize),
    ) -> Self {
        Self {
            id: id.into(),
            timestamp,
            transform,
            resolution_m,
            properties: BTreeMap::new(),
            shape,
            bands: BTreeMap::new(),
        }
    }

    /// Empty image sharing this image's id, timestamp, grid and properties
    pub fn derive(&self) -> RasterImage {
        RasterImage {
            id: self.id.clone(),
            timestamp: self.timestamp,
            transform: self.transform,
            resolution_m: self.resolution_m,
            properties: self.properties.clone(),
            shape: self.shape,
            bands: BTreeMap::new(),
        }
    }

    pub fn with_band(mut self, name: impl Into<String>, grid: BandGrid) -> SeriesResult<Self> {
        self.insert_band(name, grid)?;
        Ok(self)
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn insert_band(&mut self, name: impl Into<String>, grid: BandGrid) -> SeriesResult<()> {
        let name = name.into();
        if grid.dim() != self.shape {
            return Err(SeriesError::Processing(format!(
                "Band '{}' has shape {:?}, image '{}' expects {:?}",
                name,
                grid.dim(),
                self.id,
                self.shape
            )));
        }
        self.bands.insert(name, grid);
        Ok(())
    }

    pub fn band(&self, name: &str) -> SeriesResult<&BandGrid> {
        self.bands.get(name).ok_or_else(|| {
            SeriesError::Processing(format!("Image '{}' has no band '{}'", self.id, name))
        })
    }

    pub fn has_band(&self, name: &str) -> bool {
        self.bands.contains_key(name)
    }

    pub fn band_names(&self) -> Vec<&str> {
        self.bands.keys().map(String::as_str).collect()
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Calendar date (UTC) of the acquisition
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn footprint(&self) -> Rect<f64> {
        self.transform.footprint(self.shape.0, self.shape.1)
    }

    /// Keep only the named bands
    pub fn select(&self, names: &[&str]) -> SeriesResult<RasterImage> {
        let mut out = self.derive();
        for name in names {
            out.bands.insert(name.to_string(), self.band(name)?.clone());
        }
        Ok(out)
    }

    /// Rename bands; bands not listed keep their names
    pub fn rename(mut self, renames: &[(String, String)]) -> SeriesResult<RasterImage> {
        for (from, to) in renames {
            let grid = self.bands.remove(from).ok_or_else(|| {
                SeriesError::Processing(format!("Image '{}' has no band '{}' to rename", self.id, from))
            })?;
            self.bands.insert(to.clone(), grid);
        }
        Ok(self)
    }
}

/// Cooperative cancellation flag shared between a task and its workers
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled by itself or whenever `self` is cancelled
    pub fn child(&self) -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.parent.as_ref().map_or(false, |p| p.is_cancelled())
    }

    pub fn check(&self) -> SeriesResult<()> {
        if self.is_cancelled() {
            Err(SeriesError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Error types for time series extraction
#[derive(Debug, thiserror::Error)]
pub enum SeriesError {
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("Transient source error: {0}")]
    TransientSource(String),

    #[error("Sink failure: {0}")]
    SinkFailure(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SeriesError {
    /// Errors worth retrying at the source boundary
    pub fn is_transient(&self) -> bool {
        matches!(self, SeriesError::TransientSource(_))
    }
}

/// Result type for time series operations
pub type SeriesResult<T> = Result<T, SeriesError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_window_is_end_exclusive() {
        let window = TimeWindow::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2023, 2, 1).unwrap(),
        );
        assert!(window.contains(&Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()));
        assert!(window.contains(&Utc.with_ymd_and_hms(2023, 1, 31, 23, 59, 59).unwrap()));
        assert!(!window.contains(&Utc.with_ymd_and_hms(2023, 2, 1, 0, 0, 0).unwrap()));
        assert!(window.is_valid());
    }

    #[test]
    fn test_footprint_north_up() {
        let transform = GeoTransform::north_up(10.0, 50.0, 0.1, -0.1);
        let rect = transform.footprint(10, 20);
        assert!((rect.min().x - 10.0).abs() < 1e-12);
        assert!((rect.max().x - 12.0).abs() < 1e-12);
        assert!((rect.min().y - 49.0).abs() < 1e-12);
        assert!((rect.max().y - 50.0).abs() < 1e-12);
    }

    #[test]
    fn test_overlap_fraction() {
        let cell = GeoTransform::north_up(0.0, 0.4, 0.1, -0.1).window_rect(1, 1, 2, 2);
        let inside = Region::rectangle("inside", 0.11, 0.21, 0.13, 0.23);
        assert!((inside.overlap_fraction(&cell) - 0.04).abs() < 1e-9);
        assert!(!inside.contains(0.15, 0.25));

        let covering = Region::rectangle("covering", -1.0, -1.0, 1.0, 1.0);
        assert!((covering.overlap_fraction(&cell) - 1.0).abs() < 1e-9);

        let far = Region::rectangle("far", 5.0, 5.0, 6.0, 6.0);
        assert_eq!(far.overlap_fraction(&cell), 0.0);
    }

    #[test]
    fn test_band_shape_is_checked() {
        let image = RasterImage::new(
            "img",
            Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            GeoTransform::north_up(0.0, 1.0, 0.1, -0.1),
            10.0,
            (3, 3),
        );
        assert!(image.with_band("B1", Array2::zeros((2, 3))).is_err());
    }

    #[test]
    fn test_child_token_follows_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(matches!(child.check(), Err(SeriesError::Cancelled)));

        let other = CancelToken::new();
        let other_child = other.child();
        other_child.cancel();
        assert!(!other.is_cancelled());
    }
}
