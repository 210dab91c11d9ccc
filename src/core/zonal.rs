//! Zonal mean reduction over a region
//!
//! Each image is reduced to one value per requested band. The reduction
//! grid is the image grid aggregated into square blocks that approximate the
//! requested scale; a block contributes when its centre falls inside the
//! region, weighted by its number of valid pixels. A region too small to hold
//! any block centre falls back to the blocks it overlaps, weighted by the
//! covered share. When a region would need more blocks than `max_pixels`, the
//! block size grows until it fits, or the fine blocks are subsampled when
//! coarse blocks miss the region. The result is then an approximation rather
//! than a failure.

use chrono::NaiveDate;
use geo::Intersects;

use crate::core::collection::ImageCollection;
use crate::types::{CancelToken, RasterImage, Region, SeriesError, SeriesResult};

/// Zonal reduction parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReducerParams {
    /// Reduction scale in meters
    pub scale_m: f64,
    /// Upper bound on reduction cells per image
    pub max_pixels: u64,
}

impl Default for ReducerParams {
    fn default() -> Self {
        Self {
            scale_m: 10.0,
            max_pixels: 10_000_000,
        }
    }
}

/// Per-image reduction result; `None` means no valid pixel in the region
#[derive(Debug, Clone, PartialEq)]
pub struct ZonalRecord {
    pub date: NaiveDate,
    /// One entry per requested band, in request order
    pub values: Vec<Option<f64>>,
}

impl ZonalRecord {
    pub fn is_complete(&self) -> bool {
        self.values.iter().all(Option::is_some)
    }

    /// `YYYY-MM-DD`
    pub fn date_string(&self) -> String {
        self.date.format("%Y-%m-%d").to_string()
    }
}

pub struct ZonalReducer {
    params: ReducerParams,
}

#[derive(Debug, Default, Clone, Copy)]
struct Accumulator {
    sum: f64,
    weight: f64,
}

/// Reduction block and its weight (1 unless only partly covered)
#[derive(Debug, Clone, Copy)]
struct Cell {
    row: usize,
    col: usize,
    weight: f64,
}

impl ZonalReducer {
    pub fn new(params: ReducerParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ReducerParams {
        &self.params
    }

    /// Reduce every image of the collection, checking `cancel` between images
    pub fn reduce(
        &self,
        collection: &ImageCollection,
        region: &Region,
        bands: &[&str],
        cancel: &CancelToken,
    ) -> SeriesResult<Vec<ZonalRecord>> {
        log::debug!(
            "Reducing {} images over '{}' at {} m",
            collection.len(),
            region.id,
            self.params.scale_m
        );

        let mut records = Vec::with_capacity(collection.len());
        for image in collection.iter() {
            cancel.check()?;
            records.push(self.reduce_image(&image?, region, bands)?);
        }
        Ok(records)
    }

    /// Mean of each band over the region for a single image
    pub fn reduce_image(&self, image: &RasterImage, region: &Region, bands: &[&str]) -> SeriesResult<ZonalRecord> {
        let grids = bands
            .iter()
            .map(|name| image.band(name))
            .collect::<SeriesResult<Vec<_>>>()?;
        let date = image.date();

        let Some(bounds) = region.bounds() else {
            return Err(SeriesError::Processing(format!("Region '{}' has an empty geometry", region.id)));
        };
        if !image.footprint().intersects(&bounds) {
            log::debug!("Image '{}' does not overlap '{}'", image.id, region.id);
            return Ok(ZonalRecord {
                date,
                values: vec![None; bands.len()],
            });
        }

        let (rows, cols) = image.shape();
        let (block, cells) = self.reduction_cells(image, region);

        let mut totals = vec![Accumulator::default(); grids.len()];
        for cell in &cells {
            let r0 = cell.row * block;
            let c0 = cell.col * block;
            let r1 = (r0 + block).min(rows);
            let c1 = (c0 + block).min(cols);
            for (grid, acc) in grids.iter().zip(totals.iter_mut()) {
                for r in r0..r1 {
                    for c in c0..c1 {
                        let value = grid[[r, c]];
                        if value.is_finite() {
                            acc.sum += cell.weight * value;
                            acc.weight += cell.weight;
                        }
                    }
                }
            }
        }

        let values = totals
            .iter()
            .map(|acc| (acc.weight > 0.0).then(|| acc.sum / acc.weight))
            .collect();
        Ok(ZonalRecord { date, values })
    }

    /// Block edge and the blocks to aggregate, kept within `max_pixels`.
    ///
    /// Over the cap the block edge grows; if coarse blocks no longer hit the
    /// region, a regular subsample of the fine blocks is used instead.
    fn reduction_cells(&self, image: &RasterImage, region: &Region) -> (usize, Vec<Cell>) {
        let (rows, cols) = image.shape();
        let base = self.base_block(image);
        let fine = self.cells_covering(image, region, base);
        let budget = self.params.max_pixels.max(1);
        if fine.len() as u64 <= budget {
            return (base, fine);
        }

        let longest = rows.max(cols).max(1);
        let mut block = base;
        let mut count = fine.len();
        while count as u64 > budget && block < longest {
            let ratio = count as f64 / budget as f64;
            let grow = ratio.sqrt().ceil().max(2.0) as usize;
            block = block.saturating_mul(grow).min(longest);
            let coarser = self.cells_with_center_inside(image, region, block);
            if coarser.is_empty() {
                break;
            }
            log::warn!(
                "'{}' over '{}' needs {} cells (cap {}); coarsening to {}x{} pixel blocks",
                image.id,
                region.id,
                count,
                budget,
                block,
                block
            );
            if coarser.len() as u64 <= budget {
                return (block, coarser);
            }
            count = coarser.len();
        }

        let stride = (fine.len() as u64).div_ceil(budget) as usize;
        log::warn!(
            "'{}' over '{}' needs {} cells (cap {}); keeping 1 in {} blocks",
            image.id,
            region.id,
            fine.len(),
            budget,
            stride
        );
        (base, fine.into_iter().step_by(stride).collect())
    }

    /// Block edge (pixels) approximating the requested scale
    fn base_block(&self, image: &RasterImage) -> usize {
        if image.resolution_m > 0.0 && self.params.scale_m > image.resolution_m {
            (self.params.scale_m / image.resolution_m).round().max(1.0) as usize
        } else {
            1
        }
    }

    /// Blocks whose centre lies inside the region; for regions smaller than
    /// a block, every overlapping block weighted by its covered share
    fn cells_covering(&self, image: &RasterImage, region: &Region, block: usize) -> Vec<Cell> {
        let cells = self.cells_with_center_inside(image, region, block);
        if !cells.is_empty() {
            return cells;
        }

        let (rows, cols) = image.shape();
        let mut partial = Vec::new();
        for (row, col) in block_indices(rows, cols, block) {
            let r0 = row * block;
            let c0 = col * block;
            let rect = image
                .transform
                .window_rect(r0, c0, (r0 + block).min(rows), (c0 + block).min(cols));
            let weight = region.overlap_fraction(&rect);
            if weight > 0.0 {
                partial.push(Cell { row, col, weight });
            }
        }
        if !partial.is_empty() {
            log::debug!(
                "No block centre of '{}' inside '{}'; using {} partially covered blocks",
                image.id,
                region.id,
                partial.len()
            );
        }
        partial
    }

    fn cells_with_center_inside(&self, image: &RasterImage, region: &Region, block: usize) -> Vec<Cell> {
        let (rows, cols) = image.shape();
        block_indices(rows, cols, block)
            .filter(|&(row, col)| {
                let r0 = row * block;
                let c0 = col * block;
                let row_center = r0 as f64 + (block.min(rows - r0)) as f64 / 2.0;
                let col_center = c0 as f64 + (block.min(cols - c0)) as f64 / 2.0;
                let (lon, lat) = image.transform.to_geo(row_center, col_center);
                region.contains(lon, lat)
            })
            .map(|(row, col)| Cell { row, col, weight: 1.0 })
            .collect()
    }
}

fn block_indices(rows: usize, cols: usize, block: usize) -> impl Iterator<Item = (usize, usize)> {
    let block_rows = (rows + block - 1) / block;
    let block_cols = (cols + block - 1) / block;
    (0..block_rows).flat_map(move |row| (0..block_cols).map(move |col| (row, col)))
}
