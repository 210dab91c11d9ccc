use chrono::{NaiveDate, TimeZone, Utc};
use ndarray::Array2;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use terraseries::core::collection::ImageCollection;
use terraseries::io::config::{GeometryConfig, PipelineConfig, RegionConfig};
use terraseries::io::sink::{CsvDirectorySink, MemorySink, TableSink};
use terraseries::io::source::{CatalogQuery, MemoryCatalog, RasterSource};
use terraseries::{
    CancelToken, ExportOrchestrator, GeoTransform, RasterImage, Region, SensorKind, SeriesError, SeriesResult,
    TaskId, TaskStatus,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn date(month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, month, day).unwrap()
}

fn region_config(id: &str, south: f64) -> RegionConfig {
    RegionConfig {
        id: id.to_string(),
        geometry: GeometryConfig::Rectangle {
            min_lon: 5.0,
            min_lat: south,
            max_lon: 5.1,
            max_lat: south + 0.1,
        },
        display_color: None,
    }
}

fn config(regions: Vec<RegionConfig>) -> PipelineConfig {
    let mut config = PipelineConfig::new(regions, date(5, 1), date(6, 1));
    config.retry_backoff_ms = 1;
    config
}

/// 10x10 grid at 10 m covering lon 5.0..5.1, lat `south`..`south + 0.1`
fn scene(id: &str, day: u32, hour: u32, south: f64) -> RasterImage {
    RasterImage::new(
        id,
        Utc.with_ymd_and_hms(2023, 5, day, hour, 0, 0).unwrap(),
        GeoTransform::north_up(5.0, south + 0.1, 0.01, -0.01),
        10.0,
        (10, 10),
    )
}

fn grid(value: f64) -> Array2<f64> {
    Array2::from_elem((10, 10), value)
}

fn radar(id: &str, day: u32, vv: f64, south: f64) -> RasterImage {
    scene(id, day, 5, south)
        .with_band("VV", grid(vv))
        .unwrap()
        .with_band("VH", grid(-16.25))
        .unwrap()
        .with_property("instrumentMode", "IW")
        .with_property("transmitterReceiverPolarisation", vec!["VV", "VH"])
        .with_property("orbitProperties_pass", "DESCENDING")
}

fn optical(id: &str, day: u32, scl: f64, cloud_pct: f64, south: f64) -> RasterImage {
    scene(id, day, 10, south)
        .with_band("SCL", grid(scl))
        .unwrap()
        .with_band("B3", grid(0.25))
        .unwrap()
        .with_band("B4", grid(0.25))
        .unwrap()
        .with_band("B8", grid(0.75))
        .unwrap()
        .with_band("B11", grid(0.25))
        .unwrap()
        .with_property("CLOUDY_PIXEL_PERCENTAGE", cloud_pct)
}

fn reanalysis(id: &str, day: u32, hour: u32, south: f64) -> RasterImage {
    scene(id, day, hour, south)
        .with_band("volumetric_soil_water_layer_1", grid(0.25))
        .unwrap()
        .with_band("total_precipitation", grid(0.0123))
        .unwrap()
}

/// Catalog with scenes over a region whose southern edge is `south`
fn add_region_scenes(catalog: MemoryCatalog, tag: &str, south: f64) -> MemoryCatalog {
    catalog
        .with_catalog(
            "COPERNICUS/S1_GRD",
            vec![
                radar(&format!("{}-s1-20", tag), 20, -10.5, south),
                radar(&format!("{}-s1-03", tag), 3, -8.5, south),
                radar(&format!("{}-s1-11", tag), 11, -9.5, south),
            ],
        )
        .with_catalog(
            "COPERNICUS/S2_SR_HARMONIZED",
            vec![
                optical(&format!("{}-s2-14", tag), 14, 4.0, 10.0, south),
                optical(&format!("{}-s2-02", tag), 2, 4.0, 5.0, south),
                // cloudy everywhere according to the scene classification
                optical(&format!("{}-s2-07", tag), 7, 9.0, 25.0, south),
                // rejected by the scene-level cloud filter
                optical(&format!("{}-s2-09", tag), 9, 4.0, 85.0, south),
            ],
        )
        .with_catalog(
            "ECMWF/ERA5_LAND/HOURLY",
            (1..=3)
                .flat_map(|day| {
                    vec![
                        reanalysis(&format!("{}-era-{}-11", tag, day), day, 11, south),
                        reanalysis(&format!("{}-era-{}-12", tag, day), day, 12, south),
                    ]
                })
                .collect(),
        )
}

fn catalog() -> MemoryCatalog {
    add_region_scenes(add_region_scenes(MemoryCatalog::new(), "north", 50.0), "south", 40.0)
}

fn parse_column(csv: &str, column: usize) -> Vec<f64> {
    csv.lines()
        .skip(1)
        .map(|line| line.split(',').nth(column).unwrap().parse().unwrap())
        .collect()
}

#[tokio::test]
async fn test_full_export_writes_every_table() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let orchestrator = ExportOrchestrator::new(
        config(vec![region_config("north", 50.0)]),
        Arc::new(catalog()),
        Arc::new(CsvDirectorySink::new(dir.path())),
    )
    .unwrap();

    let report = orchestrator.run(&CancelToken::new()).await;
    assert_eq!(report.tasks.len(), 4);
    assert_eq!(report.failed(), 0);

    let read = |name: &str| std::fs::read_to_string(dir.path().join(format!("{}.csv", name))).unwrap();

    // rows sorted by date regardless of catalog order
    assert_eq!(
        read("north_radar"),
        "date,VV,VH\n2023-05-03,-8.5,-16.25\n2023-05-11,-9.5,-16.25\n2023-05-20,-10.5,-16.25\n"
    );

    // the fully clouded date is dropped, not written as zeros
    assert_eq!(
        read("north_optical"),
        "date,NDMI,NDVI,NDWI\n2023-05-02,0.5,0.5,-0.5\n2023-05-14,0.5,0.5,-0.5\n"
    );
    let optical = report.get(&TaskId::new("north", SensorKind::Optical)).unwrap();
    assert_eq!(optical.outcome.as_ref().unwrap(), &TaskStatus::Exported { rows: 2 });

    // one reading per day at the sampled hour
    assert_eq!(
        read("north_soil_moisture"),
        "date,soil_moisture\n2023-05-01,0.25\n2023-05-02,0.25\n2023-05-03,0.25\n"
    );

    let precipitation = read("north_precipitation");
    assert!(precipitation.starts_with("date,precipitation_mm\n"));
    let millimeters = parse_column(&precipitation, 1);
    assert_eq!(millimeters.len(), 3);
    for mm in millimeters {
        approx::assert_relative_eq!(mm, 12.3, max_relative = 1e-9);
    }
}

#[tokio::test]
async fn test_region_tables_are_independent_of_other_regions() {
    init_logging();
    let alone = Arc::new(MemorySink::new());
    ExportOrchestrator::new(
        config(vec![region_config("north", 50.0)]),
        Arc::new(catalog()),
        alone.clone(),
    )
    .unwrap()
    .run(&CancelToken::new())
    .await;

    let together = Arc::new(MemorySink::new());
    let report = ExportOrchestrator::new(
        config(vec![region_config("south", 40.0), region_config("north", 50.0)]),
        Arc::new(catalog()),
        together.clone(),
    )
    .unwrap()
    .run(&CancelToken::new())
    .await;
    assert_eq!(report.tasks.len(), 8);
    assert_eq!(together.names().len(), 8);

    for sensor in SensorKind::ALL {
        let name = TaskId::new("north", sensor).destination_name();
        assert_eq!(alone.get(&name).unwrap(), together.get(&name).unwrap(), "{}", name);
    }
}

#[tokio::test]
async fn test_empty_window_writes_header_only() {
    init_logging();
    let sink = Arc::new(MemorySink::new());
    let mut config = config(vec![region_config("north", 50.0)]);
    config.start_date = NaiveDate::from_ymd_opt(2019, 1, 1).unwrap();
    config.end_date = NaiveDate::from_ymd_opt(2019, 2, 1).unwrap();

    let report = ExportOrchestrator::new(config, Arc::new(catalog()), sink.clone())
        .unwrap()
        .run(&CancelToken::new())
        .await;

    for task in &report.tasks {
        assert_eq!(task.outcome.as_ref().unwrap(), &TaskStatus::EmptyCollection);
    }
    assert_eq!(sink.get("north_radar").unwrap(), "date,VV,VH\n");
    assert_eq!(sink.get("north_optical").unwrap(), "date,NDMI,NDVI,NDWI\n");
}

#[tokio::test]
async fn test_one_failing_sensor_does_not_stop_the_others() {
    init_logging();
    let sink = Arc::new(MemorySink::new());
    let mut config = config(vec![region_config("north", 50.0)]);
    config.radar.catalog_id = "COPERNICUS/S1_MISSING".to_string();

    let report = ExportOrchestrator::new(config, Arc::new(catalog()), sink.clone())
        .unwrap()
        .run(&CancelToken::new())
        .await;

    assert_eq!(report.succeeded(), 3);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, &TaskId::new("north", SensorKind::Radar));
    assert!(matches!(failures[0].1, SeriesError::SourceUnavailable(_)));

    assert!(sink.get("north_radar").is_none());
    assert!(sink.get("north_optical").is_some());
    assert!(sink.get("north_precipitation").is_some());
}

/// Fails the first `failures` queries with a transient error
struct FlakySource {
    inner: MemoryCatalog,
    failures: usize,
    calls: AtomicUsize,
}

impl RasterSource for FlakySource {
    fn query(&self, query: &CatalogQuery) -> SeriesResult<ImageCollection> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(SeriesError::TransientSource(format!("quota exceeded (call {})", call)));
        }
        self.inner.query(query)
    }
}

#[tokio::test]
async fn test_transient_errors_are_retried() {
    init_logging();
    let source = Arc::new(FlakySource {
        inner: catalog(),
        failures: 2,
        calls: AtomicUsize::new(0),
    });
    let sink = Arc::new(MemorySink::new());
    let orchestrator =
        ExportOrchestrator::new(config(vec![region_config("north", 50.0)]), source.clone(), sink.clone()).unwrap();

    let region = orchestrator.regions()[0].clone();
    let report = orchestrator.run_task(region, SensorKind::Radar, &CancelToken::new()).await;

    assert_eq!(report.outcome.unwrap(), TaskStatus::Exported { rows: 3 });
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    assert!(sink.get("north_radar").is_some());
}

#[tokio::test]
async fn test_retries_are_bounded() {
    init_logging();
    let source = Arc::new(FlakySource {
        inner: catalog(),
        failures: usize::MAX,
        calls: AtomicUsize::new(0),
    });
    let mut config = config(vec![region_config("north", 50.0)]);
    config.max_retries = 1;
    let sink = Arc::new(MemorySink::new());
    let orchestrator = ExportOrchestrator::new(config, source.clone(), sink.clone()).unwrap();

    let region = orchestrator.regions()[0].clone();
    let report = orchestrator.run_task(region, SensorKind::Optical, &CancelToken::new()).await;

    assert!(matches!(report.outcome, Err(SeriesError::SourceUnavailable(_))));
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    assert!(sink.names().is_empty());
}

/// Blocks every query for `delay`
struct SlowSource {
    inner: MemoryCatalog,
    delay: Duration,
}

impl RasterSource for SlowSource {
    fn query(&self, query: &CatalogQuery) -> SeriesResult<ImageCollection> {
        std::thread::sleep(self.delay);
        self.inner.query(query)
    }
}

#[tokio::test]
async fn test_query_timeout_fails_the_task() {
    init_logging();
    let mut config = config(vec![region_config("north", 50.0)]);
    config.query_timeout_secs = 1;
    let sink = Arc::new(MemorySink::new());
    let orchestrator = ExportOrchestrator::new(
        config,
        Arc::new(SlowSource {
            inner: catalog(),
            delay: Duration::from_secs(2),
        }),
        sink.clone(),
    )
    .unwrap();

    let region = orchestrator.regions()[0].clone();
    let cancel = CancelToken::new();
    let report = orchestrator.run_task(region, SensorKind::SoilMoisture, &cancel).await;

    match report.outcome {
        Err(SeriesError::SourceUnavailable(message)) => assert!(message.contains("timed out")),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(cancel.is_cancelled());
    assert!(sink.get("north_soil_moisture").is_none());
}

#[tokio::test]
async fn test_cancelled_run_writes_nothing() {
    init_logging();
    let sink = Arc::new(MemorySink::new());
    let orchestrator =
        ExportOrchestrator::new(config(vec![region_config("north", 50.0)]), Arc::new(catalog()), sink.clone())
            .unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let report = orchestrator.run(&cancel).await;

    assert_eq!(report.failed(), 4);
    assert!(report.tasks.iter().all(|t| matches!(t.outcome, Err(SeriesError::Cancelled))));
    assert!(sink.names().is_empty());
}

#[test]
fn test_invalid_config_is_rejected_up_front() {
    let mut config = config(vec![region_config("north", 50.0)]);
    config.max_concurrent_tasks = 0;
    let sink: Arc<dyn TableSink> = Arc::new(MemorySink::new());
    let result = ExportOrchestrator::new(config, Arc::new(catalog()), sink);
    assert!(matches!(result, Err(SeriesError::InvalidConfig(_))));
}

#[test]
fn test_yaml_config_to_csv_directory() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("pipeline.yaml");
    std::fs::write(
        &config_path,
        r#"
regions:
  - id: north
    geometry:
      type: rectangle
      min_lon: 5.0
      min_lat: 50.0
      max_lon: 5.1
      max_lat: 50.1
start_date: 2023-05-01
end_date: 2023-05-15
max_concurrent_tasks: 2
duplicate_dates: keep_first
"#,
    )
    .unwrap();

    let config = PipelineConfig::from_path(&config_path).unwrap();
    let out = dir.path().join("tables");
    let orchestrator =
        ExportOrchestrator::new(config, Arc::new(catalog()), Arc::new(CsvDirectorySink::new(&out))).unwrap();
    let report = orchestrator.run_blocking(&CancelToken::new()).unwrap();
    assert_eq!(report.succeeded(), 4);

    // the window closes before the 20 May scene
    let radar = std::fs::read_to_string(out.join("north_radar.csv")).unwrap();
    assert_eq!(radar.lines().count(), 3);

    let region: Region = orchestrator.regions()[0].as_ref().clone();
    assert!(region.contains(5.05, 50.05));
}

#[tokio::test]
async fn test_field_smaller_than_a_pixel_gets_values() {
    init_logging();
    let sink = Arc::new(MemorySink::new());
    let field = RegionConfig {
        id: "plot".to_string(),
        geometry: GeometryConfig::Rectangle {
            min_lon: 5.0502,
            min_lat: 50.0502,
            max_lon: 5.0508,
            max_lat: 50.0508,
        },
        display_color: None,
    };
    let orchestrator = ExportOrchestrator::new(config(vec![field]), Arc::new(catalog()), sink.clone()).unwrap();

    let region = orchestrator.regions()[0].clone();
    let report = orchestrator.run_task(region, SensorKind::SoilMoisture, &CancelToken::new()).await;

    assert_eq!(report.outcome.unwrap(), TaskStatus::Exported { rows: 3 });
    assert_eq!(
        sink.get("plot_soil_moisture").unwrap(),
        "date,soil_moisture\n2023-05-01,0.25\n2023-05-02,0.25\n2023-05-03,0.25\n"
    );
}
