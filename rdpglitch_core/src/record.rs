use crate::oracle::{HeldEvidence, Outcome};
use crate::params::GlitchParameters;
use crate::snapshot::MemorySnapshot;
use serde::Serialize;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Per-attempt controller states, in the order an attempt walks them.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Idle,
    Armed,
    BaselineWritten,
    Protected,
    Racing,
    Classified,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttemptState::Idle => "Idle",
            AttemptState::Armed => "Armed",
            AttemptState::BaselineWritten => "BaselineWritten",
            AttemptState::Protected => "Protected",
            AttemptState::Racing => "Racing",
            AttemptState::Classified => "Classified",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    InvalidParameters,
    ProbeCommunication,
    TargetCommunication,
    MalformedConfig,
    BaselineMismatch,
    ProtectionNotEngaged,
    RaceTimeout,
    /// A late leg of the previous race still held the target or the probe.
    RigBusy,
    SafetyInvariantViolation,
}

/// Why an attempt stopped short of classification.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub stage: AttemptState,
    pub kind: FailureKind,
    pub detail: String,
}

impl AttemptFailure {
    pub fn new(stage: AttemptState, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} during {}: {}", self.kind, self.stage, self.detail)
    }
}

/// What each leg of the race reported. `None` means the leg succeeded.
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct RaceSummary {
    pub foreground_error: Option<String>,
    pub trigger_error: Option<String>,
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

/// One campaign iteration. Fields are private: a record cannot change once built.
#[derive(Serialize, Debug, Clone)]
pub struct AttemptRecord {
    index: u64,
    parameters: GlitchParameters,
    reached: AttemptState,
    outcome: Outcome,
    baseline: Option<MemorySnapshot>,
    post_glitch: Option<MemorySnapshot>,
    race: Option<RaceSummary>,
    failure: Option<AttemptFailure>,
    started_at_ms: u64,
    elapsed_ms: u64,
}

impl AttemptRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: u64,
        parameters: GlitchParameters,
        reached: AttemptState,
        outcome: Outcome,
        baseline: Option<MemorySnapshot>,
        post_glitch: Option<MemorySnapshot>,
        race: Option<RaceSummary>,
        failure: Option<AttemptFailure>,
        started_at: SystemTime,
        elapsed: Duration,
    ) -> Self {
        Self {
            index,
            parameters,
            reached,
            outcome,
            baseline,
            post_glitch,
            race,
            failure,
            started_at_ms: started_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }
    pub fn parameters(&self) -> &GlitchParameters {
        &self.parameters
    }
    pub fn reached(&self) -> AttemptState {
        self.reached
    }
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }
    pub fn baseline(&self) -> Option<&MemorySnapshot> {
        self.baseline.as_ref()
    }
    pub fn post_glitch(&self) -> Option<&MemorySnapshot> {
        self.post_glitch.as_ref()
    }
    pub fn race(&self) -> Option<&RaceSummary> {
        self.race.as_ref()
    }
    pub fn failure(&self) -> Option<&AttemptFailure> {
        self.failure.as_ref()
    }
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms)
    }
}

/// Receives every record as it is appended to the log.
pub trait RecordSink: Send {
    fn name(&self) -> &'static str;
    fn append(&mut self, record: &AttemptRecord) -> Result<(), RecordError>;
}

/// Appends one JSON document per line.
pub struct JsonLinesSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn open(path: &Path) -> Result<Self, RecordError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for JsonLinesSink {
    fn name(&self) -> &'static str {
        "JsonLinesSink"
    }

    fn append(&mut self, record: &AttemptRecord) -> Result<(), RecordError> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps the raw post-glitch read of attempts worth a closer look.
pub struct SnapshotArchive {
    dir: PathBuf,
}

impl SnapshotArchive {
    pub fn open(dir: &Path) -> Result<Self, RecordError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn file_for(&self, record: &AttemptRecord) -> PathBuf {
        self.dir.join(format!(
            "attempt-{:04}-{}.bin",
            record.index(),
            record.outcome().label()
        ))
    }
}

impl RecordSink for SnapshotArchive {
    fn name(&self) -> &'static str {
        "SnapshotArchive"
    }

    fn append(&mut self, record: &AttemptRecord) -> Result<(), RecordError> {
        let keep = matches!(
            record.outcome(),
            Outcome::GlitchSucceeded | Outcome::GlitchDestroyedData
        );
        if let (true, Some(snapshot)) = (keep, record.post_glitch()) {
            fs::write(self.file_for(record), snapshot.bytes())?;
        }
        Ok(())
    }
}

/// Per-outcome counters.
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeTally {
    pub succeeded: usize,
    pub held: usize,
    pub erased: usize,
    pub destroyed: usize,
    pub unresponsive: usize,
    pub aborted: usize,
}

impl OutcomeTally {
    pub fn count(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::GlitchSucceeded => self.succeeded += 1,
            Outcome::GlitchFailedProtectionHeld(HeldEvidence::ProtectedSignature) => self.held += 1,
            Outcome::GlitchFailedProtectionHeld(HeldEvidence::ErasedFlash) => self.erased += 1,
            Outcome::GlitchDestroyedData => self.destroyed += 1,
            Outcome::DeviceUnresponsive => self.unresponsive += 1,
            Outcome::Aborted => self.aborted += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.held + self.erased + self.destroyed + self.unresponsive + self.aborted
    }
}

impl fmt::Display for OutcomeTally {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "succeeded: {}, held: {}, erased: {}, destroyed: {}, unresponsive: {}, aborted: {}",
            self.succeeded, self.held, self.erased, self.destroyed, self.unresponsive, self.aborted
        )
    }
}

/// Ordered, append-only history of attempts.
///
/// Records are forwarded to every sink on append. A failing sink is logged
/// and does not lose the in-memory record.
#[derive(Default)]
pub struct AttemptLog {
    records: Vec<AttemptRecord>,
    tally: OutcomeTally,
    sinks: Vec<Box<dyn RecordSink>>,
}

impl AttemptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Box<dyn RecordSink>) {
        self.sinks.push(sink);
    }

    pub fn append(&mut self, record: AttemptRecord) -> &AttemptRecord {
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.append(&record) {
                warn!(
                    "sink '{}' failed to store attempt {}: {e}",
                    sink.name(),
                    record.index()
                );
            }
        }
        self.tally.count(record.outcome());
        self.records.push(record);
        &self.records[self.records.len() - 1]
    }

    pub fn records(&self) -> &[AttemptRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&AttemptRecord> {
        self.records.last()
    }

    pub fn tally(&self) -> OutcomeTally {
        self.tally
    }

    pub fn successes(&self) -> impl Iterator<Item = &AttemptRecord> {
        self.records
            .iter()
            .filter(|r| r.outcome() == Outcome::GlitchSucceeded)
    }
}
