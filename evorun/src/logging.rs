// src/logging.rs
//
// Per-generation telemetry sinks.
// - EventSink: trait used by the population scheduler
// - NoopSink:  discards all events
// - FileSink:  appends one JSON object per event (JSONL)
//
// FileSink::from_env honours:
// - EVORUN_TELEMETRY_MODE: "off" (default) or "jsonl"
// - EVORUN_TELEMETRY_PATH: path to the JSONL file
//
// Telemetry never aborts a run: the first I/O error disables the sink.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use crate::history::{FitnessSample, ScoreSample};
use crate::population::CandidateId;
use crate::verify::VerificationOutcome;

/// Summary of one completed generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRecord {
    pub generation: u64,
    pub candidates: usize,
    /// Candidates whose rollout faulted.
    pub failed: usize,
    pub scores: ScoreSample,
    pub fitness: FitnessSample,
    /// Average mean fitness over the trailing window.
    pub trailing_mean_fitness: f64,
    /// Average min fitness over the trailing window.
    pub trailing_min_fitness: f64,
    /// Best candidate across all generations so far.
    pub best_candidate: Option<CandidateId>,
    pub best_fitness: Option<f64>,
    /// Wall-clock time spent evaluating the generation.
    pub eval_ms: u64,
    pub checkpointed: bool,
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum TelemetryEvent<'a> {
    Generation(&'a GenerationRecord),
    Verification(&'a VerificationOutcome),
}

/// Abstract sink for per-generation telemetry.
pub trait EventSink {
    fn log_generation(&mut self, record: &GenerationRecord);

    fn log_verification(&mut self, _outcome: &VerificationOutcome) {}

    fn flush(&mut self) {}
}

/// Sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn log_generation(&mut self, _record: &GenerationRecord) {
        // intentionally no-op
    }
}

/// Collects records in memory. Used by tests and by the binary's summary.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    pub generations: Vec<GenerationRecord>,
    pub verifications: Vec<VerificationOutcome>,
}

impl EventSink for MemorySink {
    fn log_generation(&mut self, record: &GenerationRecord) {
        self.generations.push(record.clone());
    }

    fn log_verification(&mut self, outcome: &VerificationOutcome) {
        self.verifications.push(outcome.clone());
    }
}

/// JSONL file sink. The file is opened lazily on the first event and
/// appended to, so a resumed run extends the same log.
pub struct FileSink {
    enabled: bool,
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

impl FileSink {
    /// Sink writing to `path`.
    pub fn enable(path: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            path: Some(path.into()),
            writer: None,
        }
    }

    /// Disabled unless EVORUN_TELEMETRY_MODE=jsonl and a path is set.
    pub fn from_env() -> Self {
        let enabled = env::var("EVORUN_TELEMETRY_MODE")
            .map(|s| s.to_lowercase() == "jsonl")
            .unwrap_or(false);

        let path = env::var("EVORUN_TELEMETRY_PATH").ok().map(PathBuf::from);

        Self {
            enabled: enabled && path.is_some(),
            path,
            writer: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn ensure_writer(&mut self) -> Option<&mut BufWriter<File>> {
        if !self.enabled {
            return None;
        }

        if self.writer.is_none() {
            let path = self.path.as_ref()?;

            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }

            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => self.writer = Some(BufWriter::new(file)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "telemetry disabled");
                    self.enabled = false;
                    return None;
                }
            }
        }

        self.writer.as_mut()
    }

    fn write_event(&mut self, event: &TelemetryEvent<'_>) {
        let line = match serde_json::to_string(event) {
            Ok(s) => s,
            Err(_) => return,
        };
        let Some(writer) = self.ensure_writer() else {
            return;
        };

        if writeln!(writer, "{line}").and_then(|_| writer.flush()).is_err() {
            warn!("telemetry write failed; disabling sink");
            self.enabled = false;
            self.writer = None;
        }
    }
}

impl EventSink for FileSink {
    fn log_generation(&mut self, record: &GenerationRecord) {
        self.write_event(&TelemetryEvent::Generation(record));
    }

    fn log_verification(&mut self, outcome: &VerificationOutcome) {
        self.write_event(&TelemetryEvent::Verification(outcome));
    }

    fn flush(&mut self) {
        if let Some(w) = self.writer.as_mut() {
            let _ = w.flush();
        }
    }
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn log_generation(&mut self, record: &GenerationRecord) {
        (**self).log_generation(record)
    }

    fn log_verification(&mut self, outcome: &VerificationOutcome) {
        (**self).log_verification(outcome)
    }

    fn flush(&mut self) {
        (**self).flush()
    }
}
