//! Per-sample trace capture.

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::aggregate::SampleRecord;
use crate::judge::{ParseStage, Sample};

/// One completed sample, as written to the trace.
#[derive(Debug, Clone, Serialize)]
pub struct SampleTrace {
    pub timestamp_ms: i64,
    pub test_id: String,
    pub criterion_id: String,
    pub request_digest: String,
    pub backend_id: String,
    pub identity: String,
    pub sample_index: u32,
    pub attempts: u32,
    pub latency_ms: u64,
    pub score: Option<f64>,
    pub rationale: Option<String>,
    pub parse_stage: Option<ParseStage>,
    pub failure: Option<String>,
}

impl SampleTrace {
    pub fn from_sample(
        test_id: &str,
        criterion_id: &str,
        request_digest: &str,
        identity: &str,
        sample: &Sample,
    ) -> Self {
        let record = SampleRecord::from(sample);
        Self {
            timestamp_ms: now_epoch_ms(),
            test_id: test_id.to_string(),
            criterion_id: criterion_id.to_string(),
            request_digest: request_digest.to_string(),
            backend_id: sample.backend_id.clone(),
            identity: identity.to_string(),
            sample_index: sample.index,
            attempts: sample.attempts,
            latency_ms: sample.latency_ms,
            score: record.score,
            rationale: record.rationale,
            parse_stage: record.parse_stage,
            failure: record.failure,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: SampleTrace) -> Result<(), TraceError>;
}

#[derive(Clone)]
pub struct JsonlTraceSink {
    sender: mpsc::Sender<SampleTrace>,
}

pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TraceError>>>,
}

impl TraceWorker {
    /// Wait for the writer thread; returns after every sender is dropped and
    /// the file is flushed.
    pub fn join(mut self) -> Result<(), TraceError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TraceError::Join("trace worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<SampleTrace>();
        let handle = std::thread::spawn(move || write_trace_loop(file, receiver));
        Ok((
            Self { sender },
            TraceWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: SampleTrace) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<SampleTrace>,
) -> Result<(), TraceError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
