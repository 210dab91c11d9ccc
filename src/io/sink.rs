//! Table sinks: CSV files delivered atomically

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

use crate::types::{SeriesError, SeriesResult};

/// One output row: date plus band values in column order
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRow {
    pub date: NaiveDate,
    pub values: Vec<f64>,
}

/// Schema-erased table handed to a sink
#[derive(Debug, Clone, PartialEq)]
pub struct ExportTable {
    /// `date` followed by band names
    pub columns: Vec<String>,
    pub rows: Vec<ExportRow>,
}

impl ExportTable {
    /// Write `date,<band1>,...` followed by one line per row
    pub fn write_csv<W: Write>(&self, writer: W) -> SeriesResult<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(&self.columns)?;
        for row in &self.rows {
            let mut record = Vec::with_capacity(row.values.len() + 1);
            record.push(row.date.format("%Y-%m-%d").to_string());
            record.extend(row.values.iter().map(|v| v.to_string()));
            csv_writer.write_record(&record)?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    pub fn to_csv_string(&self) -> SeriesResult<String> {
        let mut buffer = Vec::new();
        self.write_csv(&mut buffer)?;
        String::from_utf8(buffer).map_err(|e| SeriesError::Processing(format!("CSV is not UTF-8: {}", e)))
    }
}

/// Destination for finished tables.
///
/// A table is either delivered whole under `destination_name` or not at all.
pub trait TableSink: Send + Sync {
    fn write_table(&self, table: &ExportTable, destination_name: &str) -> SeriesResult<()>;
}

/// Writes `{dir}/{destination_name}.csv`
#[derive(Debug, Clone)]
pub struct CsvDirectorySink {
    dir: PathBuf,
    overwrite: bool,
}

impl CsvDirectorySink {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            overwrite: true,
        }
    }

    /// Fail with [`SeriesError::SinkFailure`] if the target file already exists
    pub fn no_clobber(mut self) -> Self {
        self.overwrite = false;
        self
    }

    pub fn path_for(&self, destination_name: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", destination_name))
    }

    fn deliver(&self, table: &ExportTable, target: &Path) -> SeriesResult<()> {
        std::fs::create_dir_all(&self.dir)?;

        // temp file in the target directory so the final rename stays on one filesystem
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        table.write_csv(&mut tmp)?;
        tmp.as_file().sync_all()?;

        let persisted = if self.overwrite {
            tmp.persist(target)
        } else {
            tmp.persist_noclobber(target)
        };
        persisted.map_err(|e| SeriesError::SinkFailure(format!("{}: {}", target.display(), e.error)))?;
        Ok(())
    }
}

impl TableSink for CsvDirectorySink {
    fn write_table(&self, table: &ExportTable, destination_name: &str) -> SeriesResult<()> {
        if destination_name.is_empty() || destination_name.contains(['/', '\\']) {
            return Err(SeriesError::SinkFailure(format!(
                "Invalid destination name '{}'",
                destination_name
            )));
        }

        let target = self.path_for(destination_name);
        if !self.overwrite && target.exists() {
            return Err(SeriesError::SinkFailure(format!(
                "Destination {} already exists",
                target.display()
            )));
        }

        self.deliver(table, &target).map_err(|e| match e {
            SeriesError::SinkFailure(_) => e,
            other => SeriesError::SinkFailure(format!("{}: {}", target.display(), other)),
        })?;
        log::info!("Wrote {} rows to {}", table.rows.len(), target.display());
        Ok(())
    }
}

/// Keeps delivered CSV documents in memory, keyed by destination name
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<BTreeMap<String, String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, destination_name: &str) -> Option<String> {
        self.tables.lock().ok()?.get(destination_name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tables
            .lock()
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl TableSink for MemorySink {
    fn write_table(&self, table: &ExportTable, destination_name: &str) -> SeriesResult<()> {
        let csv = table
            .to_csv_string()
            .map_err(|e| SeriesError::SinkFailure(e.to_string()))?;
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| SeriesError::SinkFailure("Memory sink lock poisoned".to_string()))?;
        tables.insert(destination_name.to_string(), csv);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn table(rows: Vec<(u32, Vec<f64>)>) -> ExportTable {
        ExportTable {
            columns: vec!["date".to_string(), "VV".to_string(), "VH".to_string()],
            rows: rows
                .into_iter()
                .map(|(day, values)| ExportRow {
                    date: NaiveDate::from_ymd_opt(2023, 1, day).unwrap(),
                    values,
                })
                .collect(),
        }
    }

    #[test]
    fn test_csv_layout() {
        let csv = table(vec![(3, vec![-10.5, -17.25]), (15, vec![0.0, -16.0])])
            .to_csv_string()
            .unwrap();
        assert_eq!(csv, "date,VV,VH\n2023-01-03,-10.5,-17.25\n2023-01-15,0,-16\n");
    }

    #[test]
    fn test_empty_table_has_header_only() {
        let csv = table(vec![]).to_csv_string().unwrap();
        assert_eq!(csv, "date,VV,VH\n");
    }

    #[test]
    fn test_directory_sink_writes_named_file() {
        let dir = TempDir::new().unwrap();
        let sink = CsvDirectorySink::new(dir.path());
        sink.write_table(&table(vec![(1, vec![1.0, 2.0])]), "farm_radar").unwrap();

        let written = std::fs::read_to_string(dir.path().join("farm_radar.csv")).unwrap();
        assert_eq!(written, "date,VV,VH\n2023-01-01,1,2\n");
        // no temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_no_clobber_reports_collision() {
        let dir = TempDir::new().unwrap();
        let sink = CsvDirectorySink::new(dir.path()).no_clobber();
        sink.write_table(&table(vec![]), "farm_radar").unwrap();
        let second = sink.write_table(&table(vec![(1, vec![1.0, 2.0])]), "farm_radar");
        assert!(matches!(second, Err(SeriesError::SinkFailure(_))));

        let kept = std::fs::read_to_string(dir.path().join("farm_radar.csv")).unwrap();
        assert_eq!(kept, "date,VV,VH\n");
    }

    #[test]
    fn test_memory_sink() {
        let sink = MemorySink::new();
        sink.write_table(&table(vec![(2, vec![1.5, 2.5])]), "a_radar").unwrap();
        assert_eq!(sink.names(), vec!["a_radar".to_string()]);
        assert_eq!(sink.get("a_radar").unwrap(), "date,VV,VH\n2023-01-02,1.5,2.5\n");
    }
}
