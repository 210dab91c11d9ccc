//! Lazily evaluated image collections
//!
//! A collection is a list of fetched images plus an ordered chain of
//! per-image transform stages. Stages are only run when the collection is
//! evaluated, one image at a time, so a stage never sees more than the
//! image it is applied to.

use std::fmt;
use std::sync::Arc;

use crate::types::{RasterImage, SeriesResult};

/// Per-image transform stage
pub trait ImageTransform: Send + Sync {
    fn apply(&self, image: RasterImage) -> SeriesResult<RasterImage>;
}

impl<F> ImageTransform for F
where
    F: Fn(RasterImage) -> SeriesResult<RasterImage> + Send + Sync,
{
    fn apply(&self, image: RasterImage) -> SeriesResult<RasterImage> {
        self(image)
    }
}

#[derive(Clone, Default)]
pub struct ImageCollection {
    images: Vec<Arc<RasterImage>>,
    stages: Vec<Arc<dyn ImageTransform>>,
}

impl ImageCollection {
    /// Build a collection ordered by acquisition time (stable for equal times)
    pub fn from_images(images: Vec<RasterImage>) -> Self {
        Self::from_shared(images.into_iter().map(Arc::new).collect())
    }

    pub fn from_shared(mut images: Vec<Arc<RasterImage>>) -> Self {
        images.sort_by_key(|image| image.timestamp);
        Self {
            images,
            stages: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Source images, before any stage is applied
    pub fn source_images(&self) -> impl Iterator<Item = &RasterImage> {
        self.images.iter().map(|image| image.as_ref())
    }

    /// Append a transform stage
    pub fn map<T>(mut self, transform: T) -> Self
    where
        T: ImageTransform + 'static,
    {
        self.stages.push(Arc::new(transform));
        self
    }

    /// Keep only the named bands
    pub fn select(self, bands: &[&str]) -> Self {
        let bands: Vec<String> = bands.iter().map(|b| b.to_string()).collect();
        self.map(move |image: RasterImage| {
            let names: Vec<&str> = bands.iter().map(String::as_str).collect();
            image.select(&names)
        })
    }

    /// Rename bands (from, to)
    pub fn rename(self, renames: &[(&str, &str)]) -> Self {
        let renames: Vec<(String, String)> = renames
            .iter()
            .map(|(from, to)| (from.to_string(), to.to_string()))
            .collect();
        self.map(move |image: RasterImage| image.rename(&renames))
    }

    /// Drop source images failing a metadata predicate (no stage is run)
    pub fn filter<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&RasterImage) -> bool,
    {
        self.images.retain(|image| predicate(image));
        self
    }

    /// Run every stage over image `index`
    pub fn evaluate_image(&self, index: usize) -> Option<SeriesResult<RasterImage>> {
        let source = self.images.get(index)?;
        let mut image = RasterImage::clone(source);
        for stage in &self.stages {
            image = match stage.apply(image) {
                Ok(next) => next,
                Err(e) => return Some(Err(e)),
            };
        }
        Some(Ok(image))
    }

    /// Lazily evaluate images in time order
    pub fn iter(&self) -> impl Iterator<Item = SeriesResult<RasterImage>> + '_ {
        (0..self.images.len()).filter_map(move |index| self.evaluate_image(index))
    }

    /// Evaluate every image, failing on the first stage error
    pub fn evaluate(&self) -> SeriesResult<Vec<RasterImage>> {
        self.iter().collect()
    }
}

impl fmt::Debug for ImageCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageCollection")
            .field("images", &self.images.len())
            .field("stages", &self.stages.len())
            .finish()
    }
}
