use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

use crate::core::schema::BandSchema;
use crate::core::zonal::ZonalRecord;
use crate::io::sink::{ExportRow, ExportTable};
use crate::types::{SeriesError, SeriesResult};

/// What to do with several surviving records on the same date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateDatePolicy {
    /// Keep every row, in encounter order
    #[default]
    KeepAll,
    /// Keep the earliest-acquired row of each date
    KeepFirst,
    /// Average each band over the rows of a date
    Mean,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRow<S> {
    pub date: NaiveDate,
    pub values: S,
}

/// Date-sorted rows with every band present; columns `[date] + S::BANDS`
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTable<S> {
    rows: Vec<TableRow<S>>,
}

impl<S: BandSchema> OutputTable<S> {
    pub fn rows(&self) -> &[TableRow<S>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn header() -> Vec<&'static str> {
        std::iter::once("date").chain(S::BANDS.iter().copied()).collect()
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.rows.iter().map(|row| row.date).collect()
    }

    /// Rows back as (always complete) zonal records
    pub fn to_records(&self) -> Vec<ZonalRecord> {
        self.rows
            .iter()
            .map(|row| ZonalRecord {
                date: row.date,
                values: row.values.values().into_iter().map(Some).collect(),
            })
            .collect()
    }

    /// Schema-erased copy for the sink
    pub fn to_export(&self) -> ExportTable {
        ExportTable {
            columns: Self::header().into_iter().map(str::to_string).collect(),
            rows: self
                .rows
                .iter()
                .map(|row| ExportRow {
                    date: row.date,
                    values: row.values.values(),
                })
                .collect(),
        }
    }
}

/// Turns zonal records into an [`OutputTable`]
pub struct TemporalTable<S> {
    policy: DuplicateDatePolicy,
    _schema: PhantomData<S>,
}

impl<S: BandSchema> TemporalTable<S> {
    pub fn new(policy: DuplicateDatePolicy) -> Self {
        Self {
            policy,
            _schema: PhantomData,
        }
    }

    /// Drop incomplete records, sort by date and apply the duplicate policy.
    ///
    /// Records must carry one value per band of `S`, in `S::BANDS` order.
    pub fn assemble(&self, records: Vec<ZonalRecord>) -> SeriesResult<OutputTable<S>> {
        let total = records.len();
        let mut rows = Vec::with_capacity(total);
        for record in records {
            if record.values.len() != S::BANDS.len() {
                return Err(SeriesError::Processing(format!(
                    "Record for {} has {} values, {} table expects {}",
                    record.date_string(),
                    record.values.len(),
                    S::TAG,
                    S::BANDS.len()
                )));
            }
            let Some(values) = record.values.iter().copied().collect::<Option<Vec<f64>>>() else {
                continue;
            };
            let values = S::from_values(&values).ok_or_else(|| {
                SeriesError::Processing(format!("Values do not fit the {} schema", S::TAG))
            })?;
            rows.push(TableRow {
                date: record.date,
                values,
            });
        }

        let dropped = total - rows.len();
        if dropped > 0 {
            log::debug!("{}: dropped {} of {} records with absent bands", S::TAG, dropped, total);
        }

        // stable: equal dates keep encounter order
        rows.sort_by_key(|row| row.date);

        let rows = match self.policy {
            DuplicateDatePolicy::KeepAll => rows,
            DuplicateDatePolicy::KeepFirst => {
                let mut rows = rows;
                rows.dedup_by_key(|row| row.date);
                rows
            }
            DuplicateDatePolicy::Mean => average_by_date(rows)?,
        };
        Ok(OutputTable { rows })
    }
}

fn average_by_date<S: BandSchema>(rows: Vec<TableRow<S>>) -> SeriesResult<Vec<TableRow<S>>> {
    let mut out: Vec<TableRow<S>> = Vec::with_capacity(rows.len());
    let mut group: Vec<Vec<f64>> = Vec::new();
    let mut current: Option<NaiveDate> = None;

    for row in rows {
        if let Some(date) = current {
            if date != row.date {
                out.push(mean_row(date, &group)?);
                group.clear();
            }
        }
        current = Some(row.date);
        group.push(row.values.values());
    }
    if let Some(date) = current {
        out.push(mean_row(date, &group)?);
    }
    Ok(out)
}

fn mean_row<S: BandSchema>(date: NaiveDate, group: &[Vec<f64>]) -> SeriesResult<TableRow<S>> {
    let n = group.len() as f64;
    let means: Vec<f64> = (0..S::BANDS.len())
        .map(|band| group.iter().map(|values| values[band]).sum::<f64>() / n)
        .collect();
    let values = S::from_values(&means)
        .ok_or_else(|| SeriesError::Processing(format!("Values do not fit the {} schema", S::TAG)))?;
    Ok(TableRow { date, values })
}
