//! Persisted log sink
//!
//! The collector hands every displayed DATA packet and every BATCH reading to
//! a [`RecordSink`] as one [`TelemetryRecord`]. [`CsvLog`] is the file-backed
//! sink; it appends one row per record and flushes after each write.
//!
//! Column order: `timestamp, device_id, seq_num, msg_type, temperature,
//! humidity, duplicate, gap, retransmit, bytes`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{Local, TimeZone};

use crate::errors::Result;

/// CSV header row
pub const CSV_HEADER: &str =
    "timestamp,device_id,seq_num,msg_type,temperature,humidity,duplicate,gap,retransmit,bytes";

/// One logged reading
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryRecord {
    /// Unix seconds: arrival time for DATA, packet timestamp for BATCH readings
    pub event_time: u64,
    pub device_id: u16,
    pub seq_num: u16,
    /// `DATA` or `BATCH_DATA`
    pub kind_label: &'static str,
    pub temperature: f64,
    pub humidity: f64,
    pub duplicate: bool,
    pub gap: bool,
    pub retransmit: bool,
    /// Size of the datagram that carried the reading
    pub byte_size: usize,
}

impl TelemetryRecord {
    /// Render as a CSV row (no trailing newline)
    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{}",
            format_event_time(self.event_time),
            self.device_id,
            self.seq_num,
            self.kind_label,
            self.temperature,
            self.humidity,
            self.duplicate as u8,
            self.gap as u8,
            self.retransmit as u8,
            self.byte_size
        )
    }
}

/// Local time as `YYYY-mm-dd HH:MM:SS`, falling back to raw seconds
pub fn format_event_time(unix_secs: u64) -> String {
    Local
        .timestamp_opt(unix_secs as i64, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| unix_secs.to_string())
}

/// Append-only destination for telemetry records
pub trait RecordSink: Send {
    fn write_record(&mut self, record: &TelemetryRecord) -> Result<()>;
}

/// CSV file sink, flushed after every row
pub struct CsvLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CsvLog {
    /// Create (truncate) `path` and write the header row
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut writer = BufWriter::new(File::create(&path)?);
        writeln!(writer, "{}", CSV_HEADER)?;
        writer.flush()?;
        Ok(Self { path, writer })
    }

    /// Create `telemetry_YYYYmmdd_HHMMSS.csv` inside `dir`
    pub fn create_timestamped(dir: impl AsRef<Path>) -> Result<Self> {
        let name = format!("telemetry_{}.csv", Local::now().format("%Y%m%d_%H%M%S"));
        Self::create(dir.as_ref().join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for CsvLog {
    fn write_record(&mut self, record: &TelemetryRecord) -> Result<()> {
        writeln!(self.writer, "{}", record.to_csv_row())?;
        self.writer.flush()?;
        Ok(())
    }
}

/// In-memory sink; clones share the same record list
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TelemetryRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far
    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

impl RecordSink for MemorySink {
    fn write_record(&mut self, record: &TelemetryRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record.clone());
        Ok(())
    }
}
