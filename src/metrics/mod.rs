//! Metric logging.
//!
//! Every reported score is handed to an explicit [`MetricLogger`], which is opened at the start
//! of a run and flushed and closed at its end. The [`JsonLinesLogger`] appends one JSON object per
//! data point to `metrics.jsonl` in the log directory:
//!
//! ```text
//! {"round_id":10,"key":"server.cloud.test.accuracy","value":0.83}
//! ```

use std::{
    fmt,
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// The name of the metric log in the log directory.
pub const METRICS_FILE: &str = "metrics.jsonl";

/// Errors of the metric logging.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to write the metric log {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to serialize a metric: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("the metric logger is closed")]
    Closed,
}

/// A metrics data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub round_id: u64,
    pub key: String,
    pub value: f64,
}

/// A sink for metrics.
pub trait MetricLogger: fmt::Debug {
    /// Records the `value` of `key` in the given round.
    fn log(&mut self, round_id: u64, key: &str, value: f64) -> Result<(), MetricsError>;

    /// Writes out all buffered metrics.
    fn flush(&mut self) -> Result<(), MetricsError>;

    /// Flushes and releases the sink. Logging afterwards fails.
    fn close(&mut self) -> Result<(), MetricsError>;
}

/// Drops every metric.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl MetricLogger for NoopLogger {
    fn log(&mut self, _round_id: u64, _key: &str, _value: f64) -> Result<(), MetricsError> {
        Ok(())
    }

    fn flush(&mut self) -> Result<(), MetricsError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// Writes metrics as JSON lines.
#[derive(Debug)]
pub struct JsonLinesLogger {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonLinesLogger {
    /// Opens the metric log in `dir`, creating the directory if needed and truncating an
    /// existing log.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, MetricsError> {
        let dir = dir.as_ref();
        let path = dir.join(METRICS_FILE);
        let io_error = |source| MetricsError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(dir).map_err(io_error)?;
        let file = File::create(&path).map_err(io_error)?;
        debug!("opened the metric log {}", path.display());
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> MetricsError {
        MetricsError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl MetricLogger for JsonLinesLogger {
    fn log(&mut self, round_id: u64, key: &str, value: f64) -> Result<(), MetricsError> {
        let metric = Metric {
            round_id,
            key: key.to_string(),
            value,
        };
        let line = serde_json::to_string(&metric)?;
        let writer = self.writer.as_mut().ok_or(MetricsError::Closed)?;
        writeln!(writer, "{}", line).map_err(|err| self.io_error(err))
    }

    fn flush(&mut self) -> Result<(), MetricsError> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush().map_err(|err| self.io_error(err)),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), MetricsError> {
        self.flush()?;
        self.writer = None;
        Ok(())
    }
}

impl Drop for JsonLinesLogger {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!("failed to close the metric log: {}", err);
        }
    }
}

/// Opens a [`JsonLinesLogger`] in `dir`, or a [`NoopLogger`] without a directory.
pub fn open_logger(dir: Option<&Path>) -> Result<Box<dyn MetricLogger + Send>, MetricsError> {
    match dir {
        Some(dir) => Ok(Box::new(JsonLinesLogger::open(dir)?)),
        None => Ok(Box::new(NoopLogger)),
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};

    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fedsim-{}-{}", name, std::process::id()))
    }

    #[test]
    fn test_json_lines() {
        let dir = temp_dir("json-lines");
        let mut logger = JsonLinesLogger::open(&dir).unwrap();
        logger.log(1, "clients.test.accuracy", 0.5).unwrap();
        logger.log(2, "server.cloud.test.accuracy", 0.75).unwrap();
        logger.close().unwrap();
        assert!(matches!(logger.log(3, "x", 0.0), Err(MetricsError::Closed)));

        let file = File::open(dir.join(METRICS_FILE)).unwrap();
        let metrics: Vec<Metric> = BufReader::new(file)
            .lines()
            .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
            .collect();
        assert_eq!(
            metrics,
            vec![
                Metric {
                    round_id: 1,
                    key: "clients.test.accuracy".to_string(),
                    value: 0.5
                },
                Metric {
                    round_id: 2,
                    key: "server.cloud.test.accuracy".to_string(),
                    value: 0.75
                },
            ]
        );
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_noop() {
        let mut logger = open_logger(None).unwrap();
        logger.log(1, "x", 1.0).unwrap();
        logger.flush().unwrap();
        logger.close().unwrap();
    }
}
