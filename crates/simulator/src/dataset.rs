//! Sensor dataset loading.
//!
//! The dataset is a CSV file with a header row. Recognised columns:
//!
//! | Column | Meaning |
//! |--------|---------|
//! | `timestamp` | source timestamp of the row (optional) |
//! | `machine_status` | `NORMAL` / `BROKEN` / `RECOVERING` (optional, defaults to `NORMAL`) |
//! | blank or `Unnamed: 0` | pandas index column, ignored |
//! | anything else | a sensor; empty cells mean "no measurement" |
//!
//! Quoted cells may contain commas, `""` escapes and line breaks. A leading
//! UTF-8 byte order mark (as written by spreadsheet exports) is ignored.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use domain::{MachineStatus, SensorValues, Timestamp};

const TIMESTAMP_COLUMN: &str = "timestamp";
const STATUS_COLUMN: &str = "machine_status";
const INDEX_COLUMN: &str = "Unnamed: 0";

/// Errors raised while loading a dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The file could not be read.
    #[error("failed to read dataset: {0}")]
    Io(#[from] std::io::Error),

    /// The input has no header row.
    #[error("dataset has no header row")]
    MissingHeader,

    /// The header has no sensor columns.
    #[error("dataset has no sensor columns")]
    NoSensors,

    /// The header is present but there are no data rows.
    #[error("dataset has no data rows")]
    Empty,

    /// A row has a different number of cells from the header.
    #[error("line {line}: expected {expected} cells, found {found}")]
    RowLength {
        /// 1-based line number.
        line: usize,
        /// Cells in the header.
        expected: usize,
        /// Cells in this row.
        found: usize,
    },

    /// A sensor cell is not a number.
    #[error("line {line}, column '{column}': '{value}' is not a number")]
    InvalidNumber {
        /// 1-based line number.
        line: usize,
        /// Column header.
        column: String,
        /// Offending cell.
        value: String,
    },

    /// The timestamp cell could not be parsed.
    #[error("line {line}: invalid timestamp '{value}'")]
    InvalidTimestamp {
        /// 1-based line number.
        line: usize,
        /// Offending cell.
        value: String,
    },

    /// The status cell is not a known label.
    #[error("line {line}: unknown machine status '{value}'")]
    UnknownStatus {
        /// 1-based line number.
        line: usize,
        /// Offending cell.
        value: String,
    },
}

/// One row of the dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRow {
    /// Timestamp recorded in the dataset, if it had a timestamp column.
    pub source_timestamp: Option<Timestamp>,
    /// Measurements present in this row.
    pub values: SensorValues,
    /// Labelled status.
    pub status: MachineStatus,
}

/// An in-memory sensor dataset.
#[derive(Debug, Clone)]
pub struct SensorDataset {
    sensors: Vec<String>,
    rows: Vec<DatasetRow>,
}

enum ColumnRole {
    Ignored,
    Timestamp,
    Status,
    Sensor(String),
}

impl SensorDataset {
    /// Loads a dataset from a CSV file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    /// Parses a dataset from CSV bytes, e.g. a downloaded blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DatasetError> {
        Self::from_reader(bytes)
    }

    /// Parses a dataset from any buffered CSV source.
    pub fn from_reader(reader: impl BufRead) -> Result<Self, DatasetError> {
        let mut records = Records::new(reader);

        let header = loop {
            match records.next() {
                Some(record) => {
                    let (_, record) = record?;
                    if !record.trim().is_empty() {
                        break split_record(record.strip_prefix('\u{feff}').unwrap_or(&record));
                    }
                }
                None => return Err(DatasetError::MissingHeader),
            }
        };

        let roles: Vec<ColumnRole> = header
            .iter()
            .map(|name| match name.trim() {
                "" | INDEX_COLUMN => ColumnRole::Ignored,
                TIMESTAMP_COLUMN => ColumnRole::Timestamp,
                STATUS_COLUMN => ColumnRole::Status,
                sensor => ColumnRole::Sensor(sensor.to_owned()),
            })
            .collect();
        let sensors: Vec<String> = roles
            .iter()
            .filter_map(|role| match role {
                ColumnRole::Sensor(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        if sensors.is_empty() {
            return Err(DatasetError::NoSensors);
        }

        let mut rows = Vec::new();
        for record in records {
            let (line, record) = record?;
            if record.trim().is_empty() {
                continue;
            }
            rows.push(parse_row(line, &record, &roles)?);
        }
        if rows.is_empty() {
            return Err(DatasetError::Empty);
        }

        Ok(Self { sensors, rows })
    }

    /// Builds a deterministic synthetic dataset.
    ///
    /// Rows are one minute apart. Each machine cycles through 500-row periods
    /// that end with a short BROKEN then RECOVERING episode, during which the
    /// readings drift away from their baseline.
    pub fn synthetic(sensors: usize, rows: usize, seed: u64) -> Self {
        let sensors = sensors.max(1);
        let rows = rows.max(1);
        let mut rng = StdRng::seed_from_u64(seed);

        let names: Vec<String> = (0..sensors).map(|i| format!("sensor_{i:02}")).collect();
        let baselines: Vec<f64> = (0..sensors).map(|_| rng.gen_range(10.0..100.0)).collect();
        let start = Utc.with_ymd_and_hms(2018, 4, 1, 0, 0, 0).single();

        let data = (0..rows)
            .map(|r| {
                let status = match r % 500 {
                    400..=429 => MachineStatus::Broken,
                    430..=449 => MachineStatus::Recovering,
                    _ => MachineStatus::Normal,
                };
                let drift = if status.is_failure() { 0.35 } else { 0.0 };
                let values = names
                    .iter()
                    .zip(&baselines)
                    .map(|(name, base)| {
                        let noise: f64 = rng.gen_range(-0.05..0.05);
                        (name.clone(), base * (1.0 - drift + noise))
                    })
                    .collect();
                DatasetRow {
                    source_timestamp: start
                        .map(|t| Timestamp::from_utc(t + chrono::Duration::minutes(r as i64))),
                    values,
                    status,
                }
            })
            .collect();

        Self {
            sensors: names,
            rows: data,
        }
    }

    /// Sensor column names in file order.
    pub fn sensors(&self) -> &[String] {
        &self.sensors
    }

    /// All rows.
    pub fn rows(&self) -> &[DatasetRow] {
        &self.rows
    }

    /// Row at `index`, if any.
    pub fn row(&self, index: usize) -> Option<&DatasetRow> {
        self.rows.get(index)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Always `false` for a successfully loaded dataset.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

fn parse_row(line_no: usize, line: &str, roles: &[ColumnRole]) -> Result<DatasetRow, DatasetError> {
    let cells = split_record(line);
    if cells.len() != roles.len() {
        return Err(DatasetError::RowLength {
            line: line_no,
            expected: roles.len(),
            found: cells.len(),
        });
    }

    let mut row = DatasetRow {
        source_timestamp: None,
        values: SensorValues::new(),
        status: MachineStatus::Normal,
    };

    for (cell, role) in cells.iter().zip(roles) {
        let cell = cell.trim();
        match role {
            ColumnRole::Ignored => {}
            ColumnRole::Timestamp if cell.is_empty() => {}
            ColumnRole::Timestamp => {
                row.source_timestamp = Some(parse_timestamp(cell).ok_or_else(|| {
                    DatasetError::InvalidTimestamp {
                        line: line_no,
                        value: cell.to_owned(),
                    }
                })?);
            }
            ColumnRole::Status if cell.is_empty() => {}
            ColumnRole::Status => {
                row.status =
                    MachineStatus::parse(cell).ok_or_else(|| DatasetError::UnknownStatus {
                        line: line_no,
                        value: cell.to_owned(),
                    })?;
            }
            ColumnRole::Sensor(_) if cell.is_empty() => {}
            ColumnRole::Sensor(name) => {
                let value: f64 = cell.parse().map_err(|_| DatasetError::InvalidNumber {
                    line: line_no,
                    column: name.clone(),
                    value: cell.to_owned(),
                })?;
                // NaN and infinities are treated like empty cells.
                row.values.insert(name.as_str(), value);
            }
        }
    }

    Ok(row)
}

fn parse_timestamp(cell: &str) -> Option<Timestamp> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(cell) {
        return Some(Timestamp::from_utc(dt.with_timezone(&Utc)));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(cell, fmt).ok())
        .map(|naive| Timestamp::from_utc(naive.and_utc()))
}

/// Yields CSV records with the 1-based line they start on. A record continues
/// onto the next line while it has an unterminated quote.
struct Records<R> {
    lines: Lines<R>,
    line: usize,
}

impl<R: BufRead> Records<R> {
    fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }
}

impl<R: BufRead> Iterator for Records<R> {
    type Item = io::Result<(usize, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut record = match self.lines.next()? {
            Ok(line) => line,
            Err(e) => return Some(Err(e)),
        };
        self.line += 1;
        let start = self.line;

        // `""` escapes add two quotes, so an odd count means a cell is still open.
        while record.matches('"').count() % 2 == 1 {
            match self.lines.next() {
                Some(Ok(next)) => {
                    self.line += 1;
                    record.push('\n');
                    record.push_str(&next);
                }
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        Some(Ok((start, record)))
    }
}

/// Splits one CSV record, honouring double-quoted cells with `""` escapes.
fn split_record(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.trim_end_matches('\r').chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', _) => in_quotes = !in_quotes,
            (',', false) => cells.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    cells.push(current);
    cells
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
,timestamp,sensor_00,sensor_01,machine_status
0,2018-04-01 00:00:00,2.46,47.09,NORMAL
1,2018-04-01 00:01:00,,47.10,NORMAL
2,2018-04-01 00:02:00,2.44,46.8,BROKEN
";

    #[test]
    fn parses_pump_sensor_layout() {
        let dataset = SensorDataset::from_bytes(SAMPLE.as_bytes()).unwrap();
        assert_eq!(dataset.sensors(), ["sensor_00", "sensor_01"]);
        assert_eq!(dataset.len(), 3);

        let first = dataset.row(0).unwrap();
        assert_eq!(first.values.get("sensor_00"), Some(2.46));
        assert_eq!(
            first.source_timestamp.unwrap().to_string(),
            "2018-04-01T00:00:00+00:00"
        );

        let second = dataset.row(1).unwrap();
        assert_eq!(second.values.get("sensor_00"), None);
        assert_eq!(second.values.len(), 1);

        assert_eq!(dataset.row(2).unwrap().status, MachineStatus::Broken);
    }

    #[test]
    fn missing_status_column_defaults_to_normal() {
        let dataset = SensorDataset::from_bytes(b"Unnamed: 0,a,b\n0,1,2\n").unwrap();
        assert_eq!(dataset.sensors(), ["a", "b"]);
        assert_eq!(dataset.row(0).unwrap().status, MachineStatus::Normal);
        assert!(dataset.row(0).unwrap().source_timestamp.is_none());
    }

    #[test]
    fn bad_number_reports_line_and_column() {
        let err = SensorDataset::from_bytes(b"timestamp,s1\n2018-04-01 00:00:00,1\n2018-04-01 00:01:00,abc\n")
            .unwrap_err();
        match err {
            DatasetError::InvalidNumber { line, column, value } => {
                assert_eq!(line, 3);
                assert_eq!(column, "s1");
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_inputs_are_rejected() {
        assert!(matches!(
            SensorDataset::from_bytes(b""),
            Err(DatasetError::MissingHeader)
        ));
        assert!(matches!(
            SensorDataset::from_bytes(b"timestamp,s1\n"),
            Err(DatasetError::Empty)
        ));
        assert!(matches!(
            SensorDataset::from_bytes(b"timestamp,machine_status\nx,NORMAL\n"),
            Err(DatasetError::NoSensors)
        ));
    }

    #[test]
    fn ragged_rows_and_unknown_status_are_errors() {
        assert!(matches!(
            SensorDataset::from_bytes(b"a,b\n1\n"),
            Err(DatasetError::RowLength { line: 2, expected: 2, found: 1 })
        ));
        assert!(matches!(
            SensorDataset::from_bytes(b"a,machine_status\n1,EXPLODED\n"),
            Err(DatasetError::UnknownStatus { line: 2, .. })
        ));
    }

    #[test]
    fn quoted_cells_are_unwrapped() {
        assert_eq!(
            split_record(r#"a,"b,c","say ""hi""""#),
            vec!["a", "b,c", r#"say "hi""#]
        );
    }

    #[test]
    fn byte_order_mark_is_ignored() {
        let csv = "\u{feff}timestamp,sensor_00\n2018-04-01 00:00:00,1.5\n";
        let dataset = SensorDataset::from_bytes(csv.as_bytes()).unwrap();
        assert_eq!(dataset.sensors(), ["sensor_00"]);
        assert_eq!(dataset.row(0).unwrap().values.get("sensor_00"), Some(1.5));
        assert!(dataset.row(0).unwrap().source_timestamp.is_some());
    }

    #[test]
    fn quoted_cells_may_span_lines() {
        let csv = ",s1\n\"first\nnote\",1.5\n2,2.5\n3,abc\n";
        let err = SensorDataset::from_bytes(csv.as_bytes()).unwrap_err();
        // The two-line record shifts the following line numbers.
        assert!(matches!(err, DatasetError::InvalidNumber { line: 5, .. }));

        let dataset = SensorDataset::from_bytes(b",s1\n\"first\nnote\",1.5\n2,2.5\n").unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.row(0).unwrap().values.get("s1"), Some(1.5));
    }

    #[test]
    fn synthetic_dataset_is_deterministic_and_has_failures() {
        let a = SensorDataset::synthetic(4, 600, 7);
        let b = SensorDataset::synthetic(4, 600, 7);
        assert_eq!(a.len(), 600);
        assert_eq!(a.sensors().len(), 4);
        assert_eq!(a.rows(), b.rows());
        assert!(a.rows().iter().any(|r| r.status == MachineStatus::Broken));
        assert!(a.rows().iter().any(|r| r.status == MachineStatus::Recovering));
    }
}
