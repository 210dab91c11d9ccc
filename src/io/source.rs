//! Raster source query contract and an in-memory catalog

use chrono::Timelike;
use geo::{BoundingRect, Intersects, Polygon};
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::collection::ImageCollection;
use crate::types::{PropertyValue, RasterImage, Region, SeriesError, SeriesResult, TimeWindow};

/// Image property filter applied by the source
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyFilter {
    /// Text property equals `value`
    Equals { key: String, value: String },
    /// List property contains every entry of `values`
    ContainsAll { key: String, values: Vec<String> },
    /// Numeric property strictly below `threshold`
    LessThan { key: String, threshold: f64 },
    /// Acquisition hour (UTC) equals `hour`
    HourOfDay(u32),
}

impl PropertyFilter {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        PropertyFilter::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn contains_all(key: impl Into<String>, values: &[&str]) -> Self {
        PropertyFilter::ContainsAll {
            key: key.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn less_than(key: impl Into<String>, threshold: f64) -> Self {
        PropertyFilter::LessThan {
            key: key.into(),
            threshold,
        }
    }

    /// Missing properties never match
    pub fn matches(&self, image: &RasterImage) -> bool {
        match self {
            PropertyFilter::Equals { key, value } => match image.property(key) {
                Some(PropertyValue::Text(text)) => text == value,
                _ => false,
            },
            PropertyFilter::ContainsAll { key, values } => match image.property(key) {
                Some(PropertyValue::List(items)) => values.iter().all(|v| items.contains(v)),
                Some(PropertyValue::Text(text)) => values.iter().all(|v| text == v),
                _ => false,
            },
            PropertyFilter::LessThan { key, threshold } => match image.property(key) {
                Some(PropertyValue::Number(n)) => n < threshold,
                _ => false,
            },
            PropertyFilter::HourOfDay(hour) => image.timestamp.hour() == *hour,
        }
    }
}

/// Catalog query: identifier, bounds, date range and property filters
#[derive(Debug, Clone)]
pub struct CatalogQuery {
    pub catalog_id: String,
    pub bounds: Polygon<f64>,
    pub window: TimeWindow,
    pub filters: Vec<PropertyFilter>,
}

impl CatalogQuery {
    pub fn new(catalog_id: impl Into<String>, region: &Region, window: TimeWindow) -> Self {
        Self {
            catalog_id: catalog_id.into(),
            bounds: region.geometry.clone(),
            window,
            filters: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: PropertyFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// True if the image satisfies window, bounds and every filter
    pub fn accepts(&self, image: &RasterImage) -> bool {
        let Some(bounds) = self.bounds.bounding_rect() else {
            return false;
        };
        self.window.contains(&image.timestamp)
            && image.footprint().intersects(&bounds)
            && self.filters.iter().all(|f| f.matches(image))
    }
}

/// Provider of time-stamped raster collections.
///
/// Implementations are shared between concurrent export tasks and must be
/// safe to call from several threads. Unknown catalogs and invalid windows
/// fail with [`SeriesError::SourceUnavailable`]; retryable failures use
/// [`SeriesError::TransientSource`].
pub trait RasterSource: Send + Sync {
    fn query(&self, query: &CatalogQuery) -> SeriesResult<ImageCollection>;
}

/// Source backed by images held in memory
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    catalogs: HashMap<String, Vec<Arc<RasterImage>>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a catalog, possibly empty
    pub fn with_catalog(mut self, catalog_id: impl Into<String>, images: Vec<RasterImage>) -> Self {
        self.catalogs
            .entry(catalog_id.into())
            .or_default()
            .extend(images.into_iter().map(Arc::new));
        self
    }

    pub fn insert(&mut self, catalog_id: impl Into<String>, image: RasterImage) {
        self.catalogs
            .entry(catalog_id.into())
            .or_default()
            .push(Arc::new(image));
    }

    pub fn catalog_ids(&self) -> Vec<&str> {
        self.catalogs.keys().map(String::as_str).collect()
    }
}

impl RasterSource for MemoryCatalog {
    fn query(&self, query: &CatalogQuery) -> SeriesResult<ImageCollection> {
        let images = self.catalogs.get(&query.catalog_id).ok_or_else(|| {
            SeriesError::SourceUnavailable(format!("Unknown catalog '{}'", query.catalog_id))
        })?;

        if !query.window.is_valid() {
            return Err(SeriesError::SourceUnavailable(format!(
                "Invalid date range {} .. {}",
                query.window.start, query.window.end
            )));
        }
        if query.bounds.bounding_rect().is_none() {
            return Err(SeriesError::SourceUnavailable(
                "Query geometry is empty".to_string(),
            ));
        }

        let matched: Vec<Arc<RasterImage>> = images
            .iter()
            .filter(|image| query.accepts(image))
            .cloned()
            .collect();

        log::debug!(
            "Catalog '{}': {} of {} images match",
            query.catalog_id,
            matched.len(),
            images.len()
        );
        Ok(ImageCollection::from_shared(matched))
    }
}
