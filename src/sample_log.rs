//! Durable CSV logs
//!
//! One accelerometer log and one environmental log are created fresh for
//! every acquisition run. The accelerometer log receives one row per sampling
//! period, in acquisition order, under a `Z1,Z2,Z3` header.

use crate::error::{Result, SensorError};
use crate::sample::{AxisTriple, EnvironmentalReading};
use csv::Writer;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

/// Accelerometer log header
pub const ACCEL_HEADERS: [&str; 3] = ["Z1", "Z2", "Z3"];

/// Environmental log header
pub const ENV_HEADERS: [&str; 5] = [
    "Time",
    "Temperature (°C)",
    "Humidity (%)",
    "Wind Direction (°)",
    "Wind Speed (m/s)",
];

/// Sink for the per-period accelerometer rows
pub trait SampleLog {
    /// Append one row
    fn append(&mut self, triple: &AxisTriple) -> Result<()>;

    /// Push buffered rows to the underlying storage
    fn flush(&mut self) -> Result<()>;
}

/// Create the parent directory of `path` if needed
fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// CSV accelerometer log
pub struct CsvSampleLog<W: Write> {
    writer: Writer<W>,
    flush_every: usize,
    pending: usize,
    rows: usize,
}

impl CsvSampleLog<File> {
    /// Create (truncate) a log file and write its header
    ///
    /// # Arguments
    /// * `path` - Log file path; missing parent directories are created
    /// * `flush_every` - Rows buffered between flushes (0 flushes every row)
    pub fn create<P: AsRef<Path>>(path: P, flush_every: usize) -> Result<Self> {
        let path = path.as_ref();
        ensure_parent(path)?;
        Self::from_writer(File::create(path)?, flush_every)
    }
}

impl<W: Write> CsvSampleLog<W> {
    pub fn from_writer(inner: W, flush_every: usize) -> Result<Self> {
        let mut writer = Writer::from_writer(inner);
        writer.write_record(ACCEL_HEADERS)?;
        writer.flush()?;
        Ok(Self {
            writer,
            flush_every,
            pending: 0,
            rows: 0,
        })
    }

    /// Data rows written so far
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Flush and give back the underlying writer
    pub fn into_inner(self) -> Result<W> {
        self.writer.into_inner().map_err(into_io_error)
    }
}

impl<W: Write> SampleLog for CsvSampleLog<W> {
    fn append(&mut self, triple: &AxisTriple) -> Result<()> {
        self.writer.write_record([
            triple.z1.to_string(),
            triple.z2.to_string(),
            triple.z3.to_string(),
        ])?;
        self.rows += 1;
        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.pending = 0;
        Ok(())
    }
}

fn into_io_error<W: Write>(err: csv::IntoInnerError<Writer<W>>) -> SensorError {
    let inner = err.error();
    SensorError::Io(std::io::Error::new(inner.kind(), inner.to_string()))
}

/// Format an optional value with one decimal, empty when absent
fn one_decimal(value: Option<f64>) -> String {
    value.map(|v| format!("{:.1}", v)).unwrap_or_default()
}

/// CSV environmental log, flushed after every row
pub struct EnvironmentalLog<W: Write> {
    writer: Writer<W>,
}

impl EnvironmentalLog<File> {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        ensure_parent(path)?;
        Self::from_writer(File::create(path)?)
    }
}

impl<W: Write> EnvironmentalLog<W> {
    pub fn from_writer(inner: W) -> Result<Self> {
        let mut writer = Writer::from_writer(inner);
        writer.write_record(ENV_HEADERS)?;
        writer.flush()?;
        Ok(Self { writer })
    }

    /// Append one reading
    pub fn append(&mut self, reading: &EnvironmentalReading) -> Result<()> {
        let direction = reading
            .wind_dir_deg
            .map(|d| format!("{}", d.trunc() as i64))
            .unwrap_or_default();
        self.writer.write_record([
            reading.time_local.clone(),
            one_decimal(reading.temp_c),
            one_decimal(reading.hum_pct),
            direction,
            one_decimal(reading.wind_spd_ms),
        ])?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.writer.into_inner().map_err(into_io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone};

    #[test]
    fn test_accel_log_header_and_rows() {
        let mut log = CsvSampleLog::from_writer(Vec::new(), 0).unwrap();
        log.append(&AxisTriple::new(1, 2, 3)).unwrap();
        log.append(&AxisTriple::new(-4, 0, 65535)).unwrap();
        assert_eq!(log.rows(), 2);

        let text = String::from_utf8(log.into_inner().unwrap()).unwrap();
        assert_eq!(text, "Z1,Z2,Z3\n1,2,3\n-4,0,65535\n");
    }

    #[test]
    fn test_accel_log_file_is_created_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("adxl.csv");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "stale contents\n").unwrap();

        {
            let mut log = CsvSampleLog::create(&path, 10).unwrap();
            for i in 0..25 {
                log.append(&AxisTriple::new(i, i + 1, i + 2)).unwrap();
            }
            log.flush().unwrap();
        }

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 26);
        assert_eq!(lines[0], "Z1,Z2,Z3");
        assert_eq!(lines[1], "0,1,2");
        assert_eq!(lines[25], "24,25,26");
    }

    #[test]
    fn test_accel_log_flushes_every_n_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("adxl.csv");
        let mut log = CsvSampleLog::create(&path, 3).unwrap();
        let on_disk = || std::fs::read_to_string(&path).unwrap().lines().count();

        for i in 0..3 {
            log.append(&AxisTriple::new(i, i, i)).unwrap();
        }
        assert_eq!(on_disk(), 4);

        log.append(&AxisTriple::new(3, 3, 3)).unwrap();
        assert_eq!(on_disk(), 4);
        log.flush().unwrap();
        assert_eq!(on_disk(), 5);
    }

    #[test]
    fn test_accel_log_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("log.csv");
        CsvSampleLog::create(&path, 0).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Z1,Z2,Z3\n");
    }

    #[test]
    fn test_environmental_log_formats_values() {
        let time = Local.with_ymd_and_hms(2024, 5, 17, 8, 30, 1).unwrap();
        let mut log = EnvironmentalLog::from_writer(Vec::new()).unwrap();
        log.append(&EnvironmentalReading::new(
            time,
            Some(21.345),
            Some(55.0),
            Some(271.9),
            Some(4.26),
        ))
        .unwrap();
        log.append(&EnvironmentalReading::absent(time)).unwrap();

        let text = String::from_utf8(log.into_inner().unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "Time,Temperature (°C),Humidity (%),Wind Direction (°),Wind Speed (m/s)"
        );
        assert_eq!(lines[1], "2024-05-17 08:30:01,21.3,55.0,271,4.3");
        assert_eq!(lines[2], "2024-05-17 08:30:01,,,,");
    }
}
