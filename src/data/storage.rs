//! CSV event logs written by the components.
//!
//! Every log is a header row followed by one row per event. A log that cannot
//! be created is a resource error at construction; a failed write is returned
//! to the owning task, which ends on it.
use crate::error::{IaError, IaResult};
use chrono::Local;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Header-first CSV writer.
pub struct CsvLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl std::fmt::Debug for CsvLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CsvLog").field("path", &self.path).finish()
    }
}

impl CsvLog {
    /// Creates (truncating) `path` and writes `header`.
    pub fn create(path: impl AsRef<Path>, header: &[&str]) -> IaResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| IaError::Resource {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let file = File::create(&path).map_err(|source| IaError::Resource {
            path: path.clone(),
            source,
        })?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(header)?;
        writer.flush()?;
        tracing::debug!("CSV log created at '{}'.", path.display());
        Ok(Self { path, writer })
    }

    /// Location of the log.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one row.
    pub fn append<I, S>(&mut self, record: I) -> IaResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        self.writer.write_record(record)?;
        Ok(())
    }

    /// Flushes buffered rows to disk.
    pub fn flush(&mut self) -> IaResult<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Flushes and releases the file.
    pub fn close(mut self) -> IaResult<()> {
        self.writer.flush()?;
        tracing::debug!("CSV log '{}' closed.", self.path.display());
        Ok(())
    }
}

/// Wall-clock timestamp used in the timestamped logs.
pub fn timestamp() -> String {
    Local::now().format("%H:%M:%S%.6f").to_string()
}

/// Locations of every component log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogFiles {
    /// Selections, one row per sweep.
    pub selection: PathBuf,
    /// Every KPI seen by the selector.
    pub kpi: PathBuf,
    /// Beam changes seen by the aggregator.
    pub beam: PathBuf,
    /// KPIs published by the aggregator.
    pub measurement: PathBuf,
    /// Throughput and overhead windows.
    pub rate: PathBuf,
}

impl LogFiles {
    /// Standard file names inside `dir`, each tagged with `suffix`.
    pub fn in_dir(dir: impl AsRef<Path>, suffix: &str) -> Self {
        let dir = dir.as_ref();
        let name = |stem: &str| {
            if suffix.is_empty() {
                dir.join(format!("{}.csv", stem))
            } else {
                dir.join(format!("{}_{}.csv", stem, suffix))
            }
        };
        Self {
            selection: name("sel_pair"),
            kpi: name("sel_kpi"),
            beam: name("kpi_beam"),
            measurement: name("kpi_meas"),
            rate: name("rate_meas"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_then_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("log.csv");
        let mut log = CsvLog::create(&path, &["#", "tx", "rx", "kpi"]).unwrap();
        log.append(["1", "32", "33", "-41.5"]).unwrap();
        log.append([2.to_string(), 30.to_string(), 31.to_string(), (-50.0f64).to_string()])
            .unwrap();
        log.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "#,tx,rx,kpi\n1,32,33,-41.5\n2,30,31,-50\n");
    }

    #[test]
    fn test_unwritable_location_is_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, "x").unwrap();
        let err = CsvLog::create(blocker.join("log.csv"), &["a"]).unwrap_err();
        assert!(matches!(err, IaError::Resource { .. }));
    }

    #[test]
    fn test_log_file_names() {
        let files = LogFiles::in_dir("/tmp/ia", "run1");
        assert_eq!(files.selection, PathBuf::from("/tmp/ia/sel_pair_run1.csv"));
        assert_eq!(LogFiles::in_dir("/tmp/ia", "").rate, PathBuf::from("/tmp/ia/rate_meas.csv"));
    }
}
