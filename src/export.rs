//! Export orchestration.
//!
//! Runs every (region, sensor) pair as an independent task on a bounded
//! worker pool. Blocking work (source queries, reductions, sink writes) runs
//! on tokio's blocking pool; queries and reductions are guarded by timeouts.
//! A failed task is logged and reported, the others carry on.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::core::collection::ImageCollection;
use crate::core::processors::{CollectionProcessor, OpticalProcessor, RadarProcessor, ReanalysisProcessor};
use crate::core::schema::{BandSchema, OpticalValues, PrecipitationValues, RadarValues, SoilMoistureValues};
use crate::core::table::TemporalTable;
use crate::core::zonal::ZonalReducer;
use crate::io::config::PipelineConfig;
use crate::io::sink::TableSink;
use crate::io::source::RasterSource;
use crate::types::{CancelToken, Region, SeriesError, SeriesResult, TimeWindow};

/// The four exported datasets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SensorKind {
    Radar,
    Optical,
    SoilMoisture,
    Precipitation,
}

impl SensorKind {
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Radar,
        SensorKind::Optical,
        SensorKind::SoilMoisture,
        SensorKind::Precipitation,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            SensorKind::Radar => RadarValues::TAG,
            SensorKind::Optical => OpticalValues::TAG,
            SensorKind::SoilMoisture => SoilMoistureValues::TAG,
            SensorKind::Precipitation => PrecipitationValues::TAG,
        }
    }

    pub fn bands(&self) -> &'static [&'static str] {
        match self {
            SensorKind::Radar => RadarValues::BANDS,
            SensorKind::Optical => OpticalValues::BANDS,
            SensorKind::SoilMoisture => SoilMoistureValues::BANDS,
            SensorKind::Precipitation => PrecipitationValues::BANDS,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Identifies one export task
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskId {
    pub region_id: String,
    pub sensor: SensorKind,
}

impl TaskId {
    pub fn new(region_id: impl Into<String>, sensor: SensorKind) -> Self {
        Self {
            region_id: region_id.into(),
            sensor,
        }
    }

    /// `{regionId}_{sensorTag}`
    pub fn destination_name(&self) -> String {
        format!("{}_{}", self.region_id, self.sensor.tag())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.destination_name())
    }
}

/// Outcome of a successful task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Table delivered; `rows` may be 0 when every image was fully masked
    Exported { rows: usize },
    /// The source returned no images; a header-only table was delivered
    EmptyCollection,
}

#[derive(Debug)]
pub struct TaskReport {
    pub task: TaskId,
    pub outcome: SeriesResult<TaskStatus>,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct ExportReport {
    pub tasks: Vec<TaskReport>,
}

impl ExportReport {
    pub fn succeeded(&self) -> usize {
        self.tasks.iter().filter(|t| t.outcome.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.tasks.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&TaskId, &SeriesError)> {
        self.tasks
            .iter()
            .filter_map(|t| t.outcome.as_ref().err().map(|e| (&t.task, e)))
    }

    pub fn get(&self, task: &TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| &t.task == task)
    }
}

type Fetch = dyn Fn(&Region, &TimeWindow) -> SeriesResult<ImageCollection> + Send + Sync;

/// Drives source → processor → reducer → table → sink for every task
#[derive(Clone)]
pub struct ExportOrchestrator {
    config: Arc<PipelineConfig>,
    regions: Arc<Vec<Arc<Region>>>,
    source: Arc<dyn RasterSource>,
    sink: Arc<dyn TableSink>,
    workers: Arc<Semaphore>,
}

impl ExportOrchestrator {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn RasterSource>,
        sink: Arc<dyn TableSink>,
    ) -> SeriesResult<Self> {
        config.validate()?;
        let regions = config.regions()?.into_iter().map(Arc::new).collect();
        let workers = Arc::new(Semaphore::new(config.max_concurrent_tasks));
        Ok(Self {
            config: Arc::new(config),
            regions: Arc::new(regions),
            source,
            sink,
            workers,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn regions(&self) -> &[Arc<Region>] {
        &self.regions
    }

    /// Task list in region-major order
    pub fn tasks(&self) -> Vec<TaskId> {
        self.regions
            .iter()
            .flat_map(|region| SensorKind::ALL.iter().map(move |&sensor| TaskId::new(&region.id, sensor)))
            .collect()
    }

    /// Run every task; never fails as a whole
    pub async fn run(&self, cancel: &CancelToken) -> ExportReport {
        let started = Instant::now();
        log::info!(
            "Starting export: {} regions x {} sensors, {} workers, window {} .. {}",
            self.regions.len(),
            SensorKind::ALL.len(),
            self.config.max_concurrent_tasks,
            self.config.start_date,
            self.config.end_date
        );

        let mut handles = Vec::new();
        for region in self.regions.iter() {
            for sensor in SensorKind::ALL {
                let this = self.clone();
                let region = Arc::clone(region);
                let task_cancel = cancel.child();
                let task = TaskId::new(&region.id, sensor);
                let handle = tokio::spawn(async move {
                    let _permit = match this.workers.acquire().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return TaskReport {
                                task: TaskId::new(&region.id, sensor),
                                outcome: Err(SeriesError::Cancelled),
                                elapsed: Duration::ZERO,
                            }
                        }
                    };
                    this.run_task(region, sensor, &task_cancel).await
                });
                handles.push((task, handle));
            }
        }

        let mut report = ExportReport::default();
        for (task, handle) in handles {
            let task_report = match handle.await {
                Ok(task_report) => task_report,
                Err(e) => {
                    log::error!("[{}] worker panicked: {}", task, e);
                    TaskReport {
                        task,
                        outcome: Err(SeriesError::Processing(format!("Worker panicked: {}", e))),
                        elapsed: Duration::ZERO,
                    }
                }
            };
            report.tasks.push(task_report);
        }

        log::info!(
            "Export finished in {:.1}s: {} succeeded, {} failed",
            started.elapsed().as_secs_f64(),
            report.succeeded(),
            report.failed()
        );
        report
    }

    /// Blocking entry point that owns its runtime
    pub fn run_blocking(&self, cancel: &CancelToken) -> SeriesResult<ExportReport> {
        let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
        Ok(runtime.block_on(self.run(cancel)))
    }

    /// Run one (region, sensor) pair, catching and reporting its failure
    pub async fn run_task(&self, region: Arc<Region>, sensor: SensorKind, cancel: &CancelToken) -> TaskReport {
        let task = TaskId::new(&region.id, sensor);
        let started = Instant::now();
        log::info!("[{}] started", task);

        let outcome = self.execute(&task, region, sensor, cancel).await;
        let elapsed = started.elapsed();
        match &outcome {
            Ok(TaskStatus::Exported { rows }) => {
                log::info!("[{}] exported {} rows in {:.1}s", task, rows, elapsed.as_secs_f64())
            }
            Ok(TaskStatus::EmptyCollection) => {
                log::info!("[{}] no images in window; wrote header only", task)
            }
            Err(e) => log::error!("[{}] failed after {:.1}s: {}", task, elapsed.as_secs_f64(), e),
        }

        TaskReport { task, outcome, elapsed }
    }

    async fn execute(
        &self,
        task: &TaskId,
        region: Arc<Region>,
        sensor: SensorKind,
        cancel: &CancelToken,
    ) -> SeriesResult<TaskStatus> {
        let source = Arc::clone(&self.source);
        match sensor {
            SensorKind::Radar => {
                let processor = RadarProcessor::new(source, self.config.radar.clone());
                self.export_series::<RadarValues>(task, region, cancel, Arc::new(move |r: &Region, w: &TimeWindow| processor.process(r, w)))
                    .await
            }
            SensorKind::Optical => {
                let processor = OpticalProcessor::new(source, self.config.optical.clone());
                self.export_series::<OpticalValues>(task, region, cancel, Arc::new(move |r: &Region, w: &TimeWindow| processor.process(r, w)))
                    .await
            }
            SensorKind::SoilMoisture => {
                let processor = ReanalysisProcessor::new(source, self.config.reanalysis.clone());
                self.export_series::<SoilMoistureValues>(
                    task,
                    region,
                    cancel,
                    Arc::new(move |r: &Region, w: &TimeWindow| Ok(processor.process(r, w)?.soil_moisture)),
                )
                .await
            }
            SensorKind::Precipitation => {
                let processor = ReanalysisProcessor::new(source, self.config.reanalysis.clone());
                self.export_series::<PrecipitationValues>(
                    task,
                    region,
                    cancel,
                    Arc::new(move |r: &Region, w: &TimeWindow| Ok(processor.process(r, w)?.precipitation)),
                )
                .await
            }
        }
    }

    async fn export_series<S: BandSchema>(
        &self,
        task: &TaskId,
        region: Arc<Region>,
        cancel: &CancelToken,
        fetch: Arc<Fetch>,
    ) -> SeriesResult<TaskStatus> {
        let collection = self.fetch_with_retry(task, Arc::clone(&region), cancel, fetch).await?;
        let empty = collection.is_empty();
        log::debug!("[{}] {} images to reduce", task, collection.len());

        let reducer = ZonalReducer::new(self.config.reducer_params());
        let reduce_cancel = cancel.clone();
        let records = self
            .guarded(task, "reduction", self.config.reduce_timeout(), cancel, move || {
                reducer.reduce(&collection, &region, S::BANDS, &reduce_cancel)
            })
            .await?;

        let table = TemporalTable::<S>::new(self.config.duplicate_dates).assemble(records)?;
        cancel.check()?;

        let rows = table.len();
        let export = table.to_export();
        let sink = Arc::clone(&self.sink);
        let destination = task.destination_name();
        tokio::task::spawn_blocking(move || sink.write_table(&export, &destination))
            .await
            .map_err(|e| SeriesError::SinkFailure(format!("Sink worker failed: {}", e)))??;

        Ok(if empty {
            TaskStatus::EmptyCollection
        } else {
            TaskStatus::Exported { rows }
        })
    }

    async fn fetch_with_retry(
        &self,
        task: &TaskId,
        region: Arc<Region>,
        cancel: &CancelToken,
        fetch: Arc<Fetch>,
    ) -> SeriesResult<ImageCollection> {
        let window = self.config.window();
        let mut attempt = 0;
        loop {
            let fetch_once = Arc::clone(&fetch);
            let query_region = Arc::clone(&region);
            let result = self
                .guarded(task, "query", self.config.query_timeout(), cancel, move || {
                    fetch_once(&query_region, &window)
                })
                .await;

            match result {
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let backoff = self.config.retry_backoff() * attempt;
                    log::warn!(
                        "[{}] transient source error (attempt {}/{}), retrying in {:?}: {}",
                        task,
                        attempt,
                        self.config.max_retries,
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                    cancel.check()?;
                }
                Err(e) if e.is_transient() => {
                    return Err(SeriesError::SourceUnavailable(format!(
                        "giving up after {} attempts: {}",
                        attempt + 1,
                        e
                    )));
                }
                other => return other,
            }
        }
    }

    /// Run blocking `work` under a timeout; on expiry the task token is cancelled
    async fn guarded<T, F>(
        &self,
        task: &TaskId,
        stage: &'static str,
        timeout: Duration,
        cancel: &CancelToken,
        work: F,
    ) -> SeriesResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> SeriesResult<T> + Send + 'static,
    {
        cancel.check()?;
        match tokio::time::timeout(timeout, tokio::task::spawn_blocking(work)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SeriesError::Processing(format!("{} worker failed: {}", stage, e))),
            Err(_) => {
                cancel.cancel();
                log::warn!("[{}] {} timed out after {:?}", task, stage, timeout);
                Err(SeriesError::SourceUnavailable(format!(
                    "{} timed out after {:?}",
                    stage, timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_names() {
        let names: Vec<String> = SensorKind::ALL
            .iter()
            .map(|&sensor| TaskId::new("farm", sensor).destination_name())
            .collect();
        assert_eq!(
            names,
            vec!["farm_radar", "farm_optical", "farm_soil_moisture", "farm_precipitation"]
        );
    }

    #[test]
    fn test_sensor_bands() {
        assert_eq!(SensorKind::Radar.bands(), &["VV", "VH"]);
        assert_eq!(SensorKind::Optical.bands(), &["NDMI", "NDVI", "NDWI"]);
        assert_eq!(SensorKind::SoilMoisture.bands(), &["soil_moisture"]);
        assert_eq!(SensorKind::Precipitation.bands(), &["precipitation_mm"]);
    }
}
