//! Structured job event log
//!
//! Every layer of the pipeline reports success as a plain `bool`; the detail
//! behind a failure (command text, output, exit code, timeout) is attached to
//! a [`JobEvent`] at the point of failure instead. Events are serialised as
//! JSON lines so they can be shipped to whatever sink the operator uses.
//!
//! The log also tracks the current stage and its status, and records job
//! start/finish.

use crate::job::JobStatus;
use crate::redaction::RedactionConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Global event ID counter for deterministic ordering
static EVENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Severity of a message event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Success,
    Failure,
}

/// Status of a stage as reported to the event log
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Success,
    Failure,
    Skipped,
}

/// A single record in the event log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum JobEvent {
    #[serde(rename = "job.start")]
    JobStart {
        id: u64,
        timestamp: u64,
        job_id: String,
    },
    #[serde(rename = "job.end")]
    JobEnd {
        id: u64,
        timestamp: u64,
        job_id: String,
        status: JobStatus,
        duration_ms: u64,
    },
    #[serde(rename = "stage.status")]
    Stage {
        id: u64,
        timestamp: u64,
        job_id: String,
        stage: String,
        status: StageStatus,
    },
    #[serde(rename = "message")]
    Message {
        id: u64,
        timestamp: u64,
        job_id: String,
        stage: Option<String>,
        level: EventLevel,
        message: String,
        context: Value,
    },
}

impl JobEvent {
    /// Message text, for message events
    pub fn message(&self) -> Option<&str> {
        match self {
            JobEvent::Message { message, .. } => Some(message),
            _ => None,
        }
    }

    /// Level, for message events
    pub fn level(&self) -> Option<EventLevel> {
        match self {
            JobEvent::Message { level, .. } => Some(*level),
            _ => None,
        }
    }

    /// Context object, for message events
    pub fn context(&self) -> Option<&Value> {
        match self {
            JobEvent::Message { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Sink for job events
pub trait EventEmitter: Send + Sync + std::fmt::Debug {
    /// Emit a job event
    fn emit(&mut self, event: &JobEvent) -> Result<()>;
}

/// JSON lines emitter that appends to a file
#[derive(Debug)]
pub struct JsonFileEmitter {
    writer: BufWriter<File>,
}

impl JsonFileEmitter {
    /// Open (or create) `file_path` in append mode, creating parent directories
    pub fn new(file_path: &Path) -> Result<Self> {
        if let Some(parent) = file_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl EventEmitter for JsonFileEmitter {
    fn emit(&mut self, event: &JobEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Emitter that discards all events
#[derive(Debug)]
pub struct SilentEmitter;

impl EventEmitter for SilentEmitter {
    fn emit(&mut self, _event: &JobEvent) -> Result<()> {
        Ok(())
    }
}

/// Emitter that keeps events in memory; clones share the same buffer
#[derive(Debug, Clone, Default)]
pub struct MemoryEmitter {
    events: Arc<Mutex<Vec<JobEvent>>>,
}

impl MemoryEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far
    pub fn events(&self) -> Vec<JobEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Message events only
    pub fn messages(&self) -> Vec<JobEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(e, JobEvent::Message { .. }))
            .collect()
    }

    /// Whether any message contains `needle`
    pub fn contains_message(&self, needle: &str) -> bool {
        self.events()
            .iter()
            .filter_map(|e| e.message())
            .any(|m| m.contains(needle))
    }
}

impl EventEmitter for MemoryEmitter {
    fn emit(&mut self, event: &JobEvent) -> Result<()> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
        Ok(())
    }
}

#[derive(Debug)]
struct EventLogInner {
    job_id: String,
    stage: Option<String>,
    started: Option<Instant>,
    emitters: Vec<Box<dyn EventEmitter>>,
}

/// Shared handle to the job event log
///
/// Cloning is cheap; all clones write to the same emitters and share the
/// current job and stage.
#[derive(Debug, Clone)]
pub struct EventLog {
    inner: Arc<Mutex<EventLogInner>>,
    redaction: RedactionConfig,
}

impl EventLog {
    /// Create an event log writing to `emitter`
    pub fn new(emitter: Box<dyn EventEmitter>, redaction: RedactionConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventLogInner {
                job_id: String::new(),
                stage: None,
                started: None,
                emitters: vec![emitter],
            })),
            redaction,
        }
    }

    /// Event log that discards everything
    pub fn silent() -> Self {
        Self::new(Box::new(SilentEmitter), RedactionConfig::default())
    }

    /// Event log backed by a [`MemoryEmitter`], returned alongside it
    pub fn memory() -> (Self, MemoryEmitter) {
        let emitter = MemoryEmitter::new();
        (
            Self::new(Box::new(emitter.clone()), RedactionConfig::default()),
            emitter,
        )
    }

    /// Redaction settings applied to every event
    pub fn redaction(&self) -> &RedactionConfig {
        &self.redaction
    }

    /// Record that `job_id` started
    pub fn start_job(&self, job_id: &str) {
        let job_id = job_id.to_string();
        self.with_inner(|inner| {
            inner.job_id = job_id.clone();
            inner.started = Some(Instant::now());
            JobEvent::JobStart {
                id: next_event_id(),
                timestamp: current_timestamp(),
                job_id,
            }
        });
    }

    /// Record the final job status
    pub fn finish_job(&self, status: JobStatus) {
        self.with_inner(|inner| JobEvent::JobEnd {
            id: next_event_id(),
            timestamp: current_timestamp(),
            job_id: inner.job_id.clone(),
            status,
            duration_ms: inner
                .started
                .map(|s| s.elapsed().as_millis() as u64)
                .unwrap_or_default(),
        });
    }

    /// Set the current stage and report its status
    pub fn set_stage(&self, stage: &str, status: StageStatus) {
        let stage = stage.to_string();
        self.with_inner(|inner| {
            inner.stage = Some(stage.clone());
            JobEvent::Stage {
                id: next_event_id(),
                timestamp: current_timestamp(),
                job_id: inner.job_id.clone(),
                stage,
                status,
            }
        });
    }

    /// Current stage name, if any
    pub fn current_stage(&self) -> Option<String> {
        self.inner.lock().ok().and_then(|inner| inner.stage.clone())
    }

    pub fn info(&self, message: &str, context: Value) {
        self.event(EventLevel::Info, message, context);
    }

    pub fn success(&self, message: &str, context: Value) {
        self.event(EventLevel::Success, message, context);
    }

    pub fn failure(&self, message: &str, context: Value) {
        self.event(EventLevel::Failure, message, context);
    }

    /// Record a message event
    pub fn event(&self, level: EventLevel, message: &str, mut context: Value) {
        let message = self.redaction.redact(message);
        self.redaction.redact_json(&mut context);

        match level {
            EventLevel::Failure => warn!(%message, "job event"),
            _ => debug!(%message, "job event"),
        }

        self.with_inner(|inner| JobEvent::Message {
            id: next_event_id(),
            timestamp: current_timestamp(),
            job_id: inner.job_id.clone(),
            stage: inner.stage.clone(),
            level,
            message,
            context,
        });
    }

    fn with_inner<F>(&self, build: F)
    where
        F: FnOnce(&mut EventLogInner) -> JobEvent,
    {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let event = build(&mut inner);
        for emitter in inner.emitters.iter_mut() {
            // A broken sink must not fail the job
            if let Err(e) = emitter.emit(&event) {
                warn!("Failed to emit job event: {}", e);
            }
        }
    }
}

/// Returns a unique event identifier and advances the global counter
pub fn next_event_id() -> u64 {
    EVENT_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
