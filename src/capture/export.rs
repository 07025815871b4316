//! CSV export of captured rows.
//!
//! One file per run, named after the local launch time
//! (`YYYY-MM-DD_HH-MM-SS.csv`). The file is created up front, before the run
//! launches, and is never overwritten. The first record is the header
//! (`__time__`, output names, input names); every data record starts with
//! the capture time as Unix seconds with microsecond precision.

use super::{DataRow, ExportSink};
use crate::error::{SweepError, SweepResult};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name for a run launched at `now`
pub fn export_file_name<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    now.format("%Y-%m-%d_%H-%M-%S.csv").to_string()
}

/// Resolve and check the export path for a run launched at `now`.
///
/// Fails when no directory is selected, the directory does not exist, or
/// the file is already there.
pub fn prepare_export_path<Tz>(dir: Option<&Path>, now: &DateTime<Tz>) -> SweepResult<PathBuf>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let dir = dir.ok_or(SweepError::NoExportDirectory)?;
    if !dir.is_dir() {
        return Err(SweepError::InvalidExportDirectory(dir.to_path_buf()));
    }

    let path = dir.join(export_file_name(now));
    if path.exists() {
        return Err(SweepError::ExportFileExists(path));
    }
    Ok(path)
}

/// Unix seconds with six decimals
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    let secs = timestamp.timestamp();
    let micros = timestamp.timestamp_subsec_micros();
    if secs < 0 && micros > 0 {
        format!("-{}.{:06}", -(secs + 1), 1_000_000 - micros)
    } else {
        format!("{secs}.{micros:06}")
    }
}

/// A writer for CSV export files.
pub struct CsvExport {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
    rows_written: u64,
}

impl CsvExport {
    /// Create `path` and write the header. Refuses to overwrite.
    pub fn create(path: impl Into<PathBuf>, header: &[String]) -> SweepResult<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => SweepError::ExportFileExists(path.clone()),
                _ => SweepError::Io(e),
            })?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(header)?;
        writer.flush()?;
        info!("CSV export opened at '{}'", path.display());

        Ok(Self {
            path,
            writer: Some(writer),
            rows_written: 0,
        })
    }

    /// Export file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data records written so far
    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    fn writer(&mut self) -> SweepResult<&mut csv::Writer<File>> {
        self.writer.as_mut().ok_or_else(|| {
            SweepError::Io(std::io::Error::new(
                ErrorKind::BrokenPipe,
                "export file already closed",
            ))
        })
    }
}

impl ExportSink for CsvExport {
    fn write_rows(&mut self, rows: &[DataRow]) -> SweepResult<()> {
        let writer = self.writer()?;
        for row in rows {
            let record: Vec<String> = std::iter::once(format_timestamp(&row.timestamp))
                .chain(row.outputs.iter().map(ToString::to_string))
                .chain(row.inputs.iter().map(ToString::to_string))
                .collect();
            writer.write_record(&record)?;
        }
        self.rows_written += rows.len() as u64;
        Ok(())
    }

    fn flush(&mut self) -> SweepResult<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> SweepResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            debug!(rows = self.rows_written, "CSV export closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Value;
    use tempfile::tempdir;

    fn header() -> Vec<String> {
        ["__time__", "bias", "current"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_file_name_format() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        assert_eq!(export_file_name(&now), "2024-03-05_14-07-09.csv");
    }

    #[test]
    fn test_timestamp_format() {
        let ts = DateTime::from_timestamp(1_700_000_000, 1_500_000).unwrap();
        assert_eq!(format_timestamp(&ts), "1700000000.001500");
    }

    #[test]
    fn test_prepare_export_path_checks() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        assert!(matches!(
            prepare_export_path(None, &now),
            Err(SweepError::NoExportDirectory)
        ));

        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            prepare_export_path(Some(&missing), &now),
            Err(SweepError::InvalidExportDirectory(_))
        ));

        let path = prepare_export_path(Some(dir.path()), &now).unwrap();
        assert_eq!(path, dir.path().join("2024-03-05_14-07-09.csv"));

        std::fs::write(&path, "taken").unwrap();
        assert!(matches!(
            prepare_export_path(Some(dir.path()), &now),
            Err(SweepError::ExportFileExists(p)) if p == path
        ));
    }

    #[test]
    fn test_csv_export_writes_header_and_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");
        let mut export = CsvExport::create(&path, &header()).unwrap();

        let row = DataRow {
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            outputs: vec![Value::Float(0.5)],
            inputs: vec![Value::Integer(7)],
        };
        export.write_rows(&[row]).unwrap();
        export.close().unwrap();
        assert_eq!(export.rows_written(), 1);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "__time__,bias,current\n1700000000.000000,0.5,7\n");

        // Closed exports reject further rows
        assert!(export.write_rows(&[]).is_err());
    }

    #[test]
    fn test_csv_export_refuses_overwrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run.csv");
        std::fs::write(&path, "keep me").unwrap();

        assert!(matches!(
            CsvExport::create(&path, &header()),
            Err(SweepError::ExportFileExists(_))
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");
    }
}
