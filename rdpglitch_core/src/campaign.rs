use crate::config::{GlitcherConfig, MemoryLayout};
use crate::oracle::{Oracle, Outcome, SignatureOracle};
use crate::params::{GlitchParameters, ParameterSource};
use crate::probe::ProbeDriver;
use crate::protection::{
    ProtectionError, ProtectionLevel, ProtectionTracker, RequestMode, RequestableLevel,
};
use crate::record::{
    AttemptFailure, AttemptLog, AttemptRecord, AttemptState, FailureKind, OutcomeTally,
    RaceSummary, RecordSink,
};
use crate::scheduler::{GlitchTrigger, LegOutcome, RaceReport, Stragglers, lock_handle};
use crate::snapshot::{MemoryRange, MemorySnapshot};
use crate::target::{TargetError, TargetMemory};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors that end a campaign. Everything else is recorded per attempt.
#[derive(Error, Debug)]
pub enum CampaignError {
    #[error("safety invariant violated: {0}")]
    SafetyInvariantViolation(String),
    #[error("pre-flight check failed: {0}")]
    Preflight(#[source] TargetError),
    #[error("rig busy: {0}")]
    RigBusy(&'static str),
}

/// Shared stop flag, checked between attempts. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct CampaignSummary {
    pub attempts: usize,
    pub tally: OutcomeTally,
    /// Indices of attempts that read the pattern back through protection.
    pub successes: Vec<u64>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl fmt::Display for CampaignSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} attempts in {:.1?}{}: {}",
            self.attempts,
            self.elapsed,
            if self.cancelled { " (cancelled)" } else { "" },
            self.tally
        )
    }
}

/// Per-attempt values resolved once from the configuration.
#[derive(Debug, Clone)]
struct Plan {
    iterations: u64,
    test_pattern: Vec<u8>,
    protected_signature: Vec<u8>,
    readback_length: usize,
    layout: MemoryLayout,
    disarm_attempts: u32,
    inter_attempt_delay: Duration,
}

/// What an attempt has collected so far, kept even when it fails.
#[derive(Default)]
struct AttemptTrace {
    reached: Option<AttemptState>,
    baseline: Option<MemorySnapshot>,
    post_glitch: Option<MemorySnapshot>,
    race: Option<RaceSummary>,
}

/// Drives glitch attempts against one target with one probe.
///
/// The campaign owns both handles for its whole lifetime and lends them to
/// the race legs. Every attempt walks
/// `Idle -> Armed -> BaselineWritten -> Protected -> Racing -> Classified`
/// and ends with the probe confirmed disarmed, whatever happened on the way.
///
/// A leg that outlives the race deadline keeps its handle. The next attempt
/// waits up to the race timeout for it and is refused as `RigBusy` if it is
/// still running.
pub struct Campaign<T: TargetMemory, P: ProbeDriver> {
    plan: Plan,
    target: Arc<Mutex<T>>,
    probe: Arc<Mutex<P>>,
    stragglers: Stragglers,
    protection: ProtectionTracker,
    trigger: GlitchTrigger,
    oracle: Box<dyn Oracle>,
    log: AttemptLog,
    next_index: u64,
}

impl<T: TargetMemory + 'static, P: ProbeDriver + 'static> Campaign<T, P> {
    pub fn new(config: &GlitcherConfig, target: T, probe: P) -> Self {
        let settings = &config.campaign;
        let layout = config.target.layout;
        Self {
            plan: Plan {
                iterations: settings.iterations,
                test_pattern: settings.test_pattern.as_bytes().to_vec(),
                protected_signature: settings.protected_signature.clone(),
                readback_length: settings.readback_length(),
                layout,
                disarm_attempts: settings.disarm_attempts.max(1),
                inter_attempt_delay: Duration::from_millis(settings.inter_attempt_delay_ms),
            },
            target: Arc::new(Mutex::new(target)),
            probe: Arc::new(Mutex::new(probe)),
            stragglers: Stragglers::default(),
            protection: ProtectionTracker::new(&layout),
            trigger: GlitchTrigger::new(Duration::from_millis(settings.race_timeout_ms)),
            oracle: Box::new(SignatureOracle::new()),
            log: AttemptLog::new(),
            next_index: 0,
        }
    }

    pub fn with_oracle(mut self, oracle: Box<dyn Oracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn add_sink(&mut self, sink: Box<dyn RecordSink>) {
        self.log.add_sink(sink);
    }

    pub fn log(&self) -> &AttemptLog {
        &self.log
    }

    /// Blocks while a late race leg still holds the target.
    pub fn target(&self) -> MutexGuard<'_, T> {
        lock_handle(&self.target)
    }

    /// Blocks while a late race leg still holds the probe.
    pub fn probe(&self) -> MutexGuard<'_, P> {
        lock_handle(&self.probe)
    }

    /// Asks the target who it is and makes sure the probe starts disarmed.
    pub fn preflight(&mut self) -> Result<(), CampaignError> {
        if !self.stragglers.settle_foreground(self.trigger.join_timeout()) {
            return Err(CampaignError::RigBusy("target held by a late downgrade leg"));
        }
        let identity = lock_handle(&self.target)
            .identify()
            .map_err(CampaignError::Preflight)?;
        match identity {
            Some(identity) => info!("target: {identity}"),
            None => info!("target did not identify itself"),
        }
        self.secure_probe(AttemptState::Idle)
            .map_err(|failure| CampaignError::SafetyInvariantViolation(failure.detail))?;
        info!("probe: {} (disarmed)", lock_handle(&self.probe).name());
        Ok(())
    }

    /// Runs the configured number of attempts, drawing parameters from `source`.
    ///
    /// Only a safety violation or a failed pre-flight stops the loop early;
    /// every other failure is recorded and the next attempt starts.
    pub fn run(
        &mut self,
        source: &mut dyn ParameterSource,
        cancel: &CancellationToken,
    ) -> Result<CampaignSummary, CampaignError> {
        self.preflight()?;
        let started = Instant::now();
        let mut cancelled = false;

        for i in 0..self.plan.iterations {
            if cancel.is_cancelled() {
                info!("campaign cancelled after {i} attempts");
                cancelled = true;
                break;
            }
            if i > 0 {
                std::thread::sleep(self.plan.inter_attempt_delay);
            }
            let params = source.next_parameters();
            let record = self.run_attempt(params)?;
            info!(
                attempt = record.index(),
                outcome = record.outcome().label(),
                "{}",
                record.outcome()
            );
        }

        let summary = CampaignSummary {
            attempts: self.log.len(),
            tally: self.log.tally(),
            successes: self.log.successes().map(|r| r.index()).collect(),
            cancelled,
            elapsed: started.elapsed(),
        };
        info!("{summary}");
        Ok(summary)
    }

    /// Runs one attempt and appends its record to the log.
    ///
    /// Returns `SafetyInvariantViolation` after recording the attempt if the
    /// probe was found armed before a memory operation or could not be
    /// confirmed disarmed afterwards.
    pub fn run_attempt(
        &mut self,
        params: GlitchParameters,
    ) -> Result<&AttemptRecord, CampaignError> {
        let index = self.next_index;
        self.next_index += 1;
        let started_at = SystemTime::now();
        let started = Instant::now();
        info!(attempt = index, "starting attempt with {params}");

        let mut trace = AttemptTrace::default();
        let (mut outcome, mut failure) = match self.drive(index, &params, &mut trace) {
            Ok(outcome) => (outcome, None),
            Err(failure) => (outcome_for(failure.kind), Some(failure)),
        };

        let stage = trace.reached.unwrap_or(AttemptState::Idle);
        if let Err(unsafe_exit) = self.secure_probe(stage) {
            if let Some(previous) = failure.take() {
                warn!(attempt = index, "superseded failure: {previous}");
            }
            if trace.reached != Some(AttemptState::Classified) {
                outcome = Outcome::Aborted;
            }
            failure = Some(unsafe_exit);
        }

        if let Some(f) = &failure {
            warn!(attempt = index, "{f}");
        }
        let fatal = failure
            .as_ref()
            .filter(|f| f.kind == FailureKind::SafetyInvariantViolation)
            .map(|f| f.detail.clone());

        let record = AttemptRecord::new(
            index,
            params,
            stage,
            outcome,
            trace.baseline,
            trace.post_glitch,
            trace.race,
            failure,
            started_at,
            started.elapsed(),
        );
        let record = self.log.append(record);

        match fatal {
            Some(detail) => {
                error!(attempt = index, "halting campaign: {detail}");
                Err(CampaignError::SafetyInvariantViolation(detail))
            }
            None => Ok(record),
        }
    }

    fn drive(
        &mut self,
        index: u64,
        params: &GlitchParameters,
        trace: &mut AttemptTrace,
    ) -> Result<Outcome, AttemptFailure> {
        let flash = self.plan.layout.flash_address;
        enter(index, trace, AttemptState::Idle);

        params.validate().map_err(|e| {
            AttemptFailure::new(AttemptState::Idle, FailureKind::InvalidParameters, e.to_string())
        })?;
        if !self.stragglers.settle_trigger(self.trigger.join_timeout()) {
            return Err(AttemptFailure::new(
                AttemptState::Idle,
                FailureKind::RigBusy,
                "probe held by a late trigger leg",
            ));
        }
        {
            let mut probe = lock_handle(&self.probe);
            probe.configure(params).map_err(|e| {
                AttemptFailure::new(AttemptState::Idle, FailureKind::ProbeCommunication, e.to_string())
            })?;
            match probe.telemetry() {
                Ok(Some(report)) => info!(attempt = index, "probe status: {report}"),
                Ok(None) => {}
                Err(e) => warn!(attempt = index, "probe status unavailable: {e}"),
            }
        }
        enter(index, trace, AttemptState::Armed);

        // Baseline: start from level 0 and prove the pattern is readable.
        self.ensure_disarmed(AttemptState::Armed)?;
        if !self.stragglers.settle_foreground(self.trigger.join_timeout()) {
            return Err(AttemptFailure::new(
                AttemptState::Armed,
                FailureKind::RigBusy,
                "target held by a late downgrade leg",
            ));
        }
        let baseline = {
            let mut target = lock_handle(&self.target);
            self.protection
                .request_level(&mut *target, RequestableLevel::Unprotected, RequestMode::Settled)
                .map_err(|e| protection_failure(AttemptState::Armed, e))?;
            target
                .write_range(flash, &self.plan.test_pattern)
                .map_err(|e| target_failure(AttemptState::Armed, e))?;
            target
                .reset()
                .map_err(|e| target_failure(AttemptState::Armed, e))?;
            MemorySnapshot::capture(
                &mut *target,
                MemoryRange::new(flash, self.plan.test_pattern.len()),
            )
            .map_err(|e| target_failure(AttemptState::Armed, e))?
        };
        let matches = baseline.bytes() == self.plan.test_pattern.as_slice();
        let preview = baseline.preview_hex();
        trace.baseline = Some(baseline);
        if !matches {
            return Err(AttemptFailure::new(
                AttemptState::Armed,
                FailureKind::BaselineMismatch,
                format!("baseline read back {preview}"),
            ));
        }
        enter(index, trace, AttemptState::BaselineWritten);

        self.ensure_disarmed(AttemptState::BaselineWritten)?;
        let level = {
            let mut target = lock_handle(&self.target);
            self.protection
                .request_level(&mut *target, RequestableLevel::Level1, RequestMode::Settled)
                .map_err(|e| protection_failure(AttemptState::BaselineWritten, e))?;
            target
                .reset()
                .map_err(|e| target_failure(AttemptState::BaselineWritten, e))?;
            self.protection
                .read_level(&mut *target)
                .map_err(|e| protection_failure(AttemptState::BaselineWritten, e))?
        };
        if level != ProtectionLevel::Level1 {
            return Err(AttemptFailure::new(
                AttemptState::BaselineWritten,
                FailureKind::ProtectionNotEngaged,
                format!("target reports {level} after requesting level 1"),
            ));
        }
        enter(index, trace, AttemptState::Protected);

        self.ensure_disarmed(AttemptState::Protected)?;
        enter(index, trace, AttemptState::Racing);
        let mut report = {
            let target = Arc::clone(&self.target);
            let protection = self.protection.clone();
            self.trigger.race(Arc::clone(&self.probe), params.pulse_count, move || {
                let mut target = lock_handle(&target);
                protection.request_level(&mut *target, RequestableLevel::Unprotected, RequestMode::Fast)
            })
        };
        self.stragglers.absorb(std::mem::take(&mut report.stragglers));
        let summary = summarize(&report);
        if let Some(e) = &summary.foreground_error {
            warn!(attempt = index, "downgrade leg: {e}");
        }
        if let Some(e) = &summary.trigger_error {
            warn!(attempt = index, "trigger leg: {e}");
        }
        let timed_out = summary.timed_out;
        trace.race = Some(summary);
        if timed_out {
            return Err(AttemptFailure::new(
                AttemptState::Racing,
                FailureKind::RaceTimeout,
                format!("race did not join within {:?}", self.trigger.join_timeout()),
            ));
        }

        // The trigger leg disarms on its own, but its disarm may have failed.
        self.secure_probe(AttemptState::Racing)?;
        let snapshot = MemorySnapshot::capture(
            &mut *lock_handle(&self.target),
            MemoryRange::new(flash, self.plan.readback_length),
        )
        .map_err(|e| target_failure(AttemptState::Racing, e))?;
        let outcome = self.oracle.classify(
            &snapshot,
            &self.plan.test_pattern,
            &self.plan.protected_signature,
        );
        info!(attempt = index, "read back {}", snapshot.preview_hex());
        trace.post_glitch = Some(snapshot);
        enter(index, trace, AttemptState::Classified);
        Ok(outcome)
    }

    /// Refuses to touch target memory while the probe is charged.
    fn ensure_disarmed(&mut self, stage: AttemptState) -> Result<(), AttemptFailure> {
        if !self.stragglers.settle_trigger(Duration::ZERO) {
            return Err(AttemptFailure::new(
                stage,
                FailureKind::SafetyInvariantViolation,
                "trigger leg still running before a memory operation",
            ));
        }
        match lock_handle(&self.probe).is_armed() {
            Ok(false) => Ok(()),
            Ok(true) => Err(AttemptFailure::new(
                stage,
                FailureKind::SafetyInvariantViolation,
                "probe found armed before a memory operation",
            )),
            Err(e) => Err(AttemptFailure::new(
                stage,
                FailureKind::ProbeCommunication,
                e.to_string(),
            )),
        }
    }

    /// Disarms and confirms, retrying up to `disarm_attempts` times.
    /// A trigger leg that is still running owns the probe, so its disarm
    /// cannot be confirmed until the leg lets go.
    fn secure_probe(&mut self, stage: AttemptState) -> Result<(), AttemptFailure> {
        if !self.stragglers.settle_trigger(self.trigger.join_timeout()) {
            return Err(AttemptFailure::new(
                stage,
                FailureKind::SafetyInvariantViolation,
                "trigger leg still holds the probe, disarm not confirmed",
            ));
        }
        let mut probe = lock_handle(&self.probe);
        let mut last_problem = String::new();
        for attempt in 1..=self.plan.disarm_attempts {
            if let Err(e) = probe.disarm() {
                warn!("disarm try {attempt} failed: {e}");
                last_problem = e.to_string();
                continue;
            }
            match probe.is_armed() {
                Ok(false) => return Ok(()),
                Ok(true) => last_problem = "probe still reports armed after disarm".to_string(),
                Err(e) => last_problem = e.to_string(),
            }
            warn!("disarm try {attempt} not confirmed: {last_problem}");
        }
        Err(AttemptFailure::new(
            stage,
            FailureKind::SafetyInvariantViolation,
            format!(
                "probe not confirmed disarmed after {} tries: {last_problem}",
                self.plan.disarm_attempts
            ),
        ))
    }
}

fn enter(index: u64, trace: &mut AttemptTrace, state: AttemptState) {
    match trace.reached.replace(state) {
        Some(previous) => info!(attempt = index, "{previous} -> {state}"),
        None => info!(attempt = index, "{state}"),
    }
}

fn outcome_for(kind: FailureKind) -> Outcome {
    match kind {
        FailureKind::InvalidParameters
        | FailureKind::BaselineMismatch
        | FailureKind::ProtectionNotEngaged
        | FailureKind::SafetyInvariantViolation => Outcome::Aborted,
        FailureKind::ProbeCommunication
        | FailureKind::TargetCommunication
        | FailureKind::MalformedConfig
        | FailureKind::RaceTimeout
        | FailureKind::RigBusy => Outcome::DeviceUnresponsive,
    }
}

fn target_failure(stage: AttemptState, e: TargetError) -> AttemptFailure {
    AttemptFailure::new(stage, FailureKind::TargetCommunication, e.to_string())
}

fn protection_failure(stage: AttemptState, e: ProtectionError) -> AttemptFailure {
    let kind = match e {
        ProtectionError::Communication(_) => FailureKind::TargetCommunication,
        ProtectionError::MalformedConfig { .. } => FailureKind::MalformedConfig,
    };
    AttemptFailure::new(stage, kind, e.to_string())
}

fn summarize<R, E: fmt::Display>(report: &RaceReport<Result<R, E>>) -> RaceSummary {
    let foreground_error = match &report.foreground {
        LegOutcome::Completed(Ok(_)) | LegOutcome::TimedOut => None,
        LegOutcome::Completed(Err(e)) => Some(e.to_string()),
        LegOutcome::Panicked(msg) => Some(format!("panicked: {msg}")),
    };
    let trigger_error = match &report.trigger {
        LegOutcome::Completed(Ok(())) | LegOutcome::TimedOut => None,
        LegOutcome::Completed(Err(e)) => Some(e.to_string()),
        LegOutcome::Panicked(msg) => Some(format!("panicked: {msg}")),
    };
    RaceSummary {
        foreground_error,
        trigger_error,
        timed_out: report.any_timed_out(),
        elapsed_ms: report.elapsed.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_PROTECTED_SIGNATURE, RigMode, SimulationSettings};
    use crate::oracle::HeldEvidence;
    use crate::params::FixedParameters;
    use crate::probe::ProbeError;
    use crate::sim::{SimProbe, SimTarget, SimulatedRig};

    const PATTERN: &[u8] = b"SIMON_SIMON_SIMO";

    fn params() -> GlitchParameters {
        GlitchParameters {
            voltage: 400,
            pulse_width: 120,
            pulse_repeat: 5,
            deadtime: 2,
            pulse_count: 1,
        }
    }

    fn config(sim: SimulationSettings) -> GlitcherConfig {
        let mut config = GlitcherConfig {
            mode: RigMode::Simulated,
            simulation: sim,
            ..GlitcherConfig::default()
        };
        config.target.layout.settle_ms = 0;
        config.campaign.inter_attempt_delay_ms = 0;
        config.campaign.race_timeout_ms = 5_000;
        config
    }

    fn quiet() -> SimulationSettings {
        SimulationSettings {
            window_us: 0,
            arm_latency_us: 0,
            hit_rate: 0.0,
            failure_rate: 0.0,
            ..SimulationSettings::default()
        }
    }

    /// The pulse fires 50 ms after the race starts, well inside a 300 ms window.
    fn landing(clean_bypass_rate: f64) -> SimulationSettings {
        SimulationSettings {
            window_us: 300_000,
            arm_latency_us: 50_000,
            hit_rate: 1.0,
            clean_bypass_rate,
            ..quiet()
        }
    }

    fn rig_campaign(
        sim: SimulationSettings,
    ) -> (SimulatedRig, Campaign<SimTarget, SimProbe>) {
        let config = config(sim);
        let rig = SimulatedRig::new(
            &config.simulation,
            &config.target.layout,
            &config.campaign.protected_signature,
        );
        let campaign = Campaign::new(&config, rig.target(), rig.probe());
        (rig, campaign)
    }

    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Fault {
        /// Flip one bit of every flash write.
        CorruptFlashWrites,
        /// Acknowledge level 1 writes without applying them.
        IgnoreLevel1Writes,
        /// Reject the n-th option byte write.
        RejectOptionWrite(usize),
        /// Stall the n-th option byte write.
        StallOptionWrite(usize, Duration),
    }

    struct FaultyTarget {
        inner: SimTarget,
        fault: Fault,
        option_address: u32,
        option_writes: usize,
    }

    impl FaultyTarget {
        fn new(inner: SimTarget, fault: Fault) -> Self {
            Self {
                inner,
                fault,
                option_address: MemoryLayout::default().option_bytes_address,
                option_writes: 0,
            }
        }
    }

    impl TargetMemory for FaultyTarget {
        fn read_range(&mut self, address: u32, length: usize) -> Result<Vec<u8>, TargetError> {
            self.inner.read_range(address, length)
        }

        fn write_range(&mut self, address: u32, bytes: &[u8]) -> Result<(), TargetError> {
            if address != self.option_address {
                if self.fault == Fault::CorruptFlashWrites {
                    let mut flipped = bytes.to_vec();
                    flipped[0] ^= 0x01;
                    return self.inner.write_range(address, &flipped);
                }
                return self.inner.write_range(address, bytes);
            }
            self.option_writes += 1;
            match self.fault {
                Fault::IgnoreLevel1Writes if bytes[0] == 0x33 => Ok(()),
                Fault::RejectOptionWrite(n) if n == self.option_writes => {
                    Err(TargetError::Rejected("option write nak".into()))
                }
                Fault::StallOptionWrite(n, stall) if n == self.option_writes => {
                    std::thread::sleep(stall);
                    self.inner.write_range(address, bytes)
                }
                _ => self.inner.write_range(address, bytes),
            }
        }

        fn reset(&mut self) -> Result<(), TargetError> {
            self.inner.reset()
        }
    }

    fn faulty_campaign(
        sim: SimulationSettings,
        fault: Fault,
        race_timeout_ms: u64,
    ) -> (SimulatedRig, Campaign<FaultyTarget, SimProbe>) {
        let mut config = config(sim);
        config.campaign.race_timeout_ms = race_timeout_ms;
        let rig = SimulatedRig::new(
            &config.simulation,
            &config.target.layout,
            &config.campaign.protected_signature,
        );
        let target = FaultyTarget::new(rig.target(), fault);
        let campaign = Campaign::new(&config, target, rig.probe());
        (rig, campaign)
    }

    #[test]
    fn baseline_match_proceeds_to_protection() {
        let (rig, mut campaign) = rig_campaign(quiet());
        let record = campaign.run_attempt(params()).unwrap();

        assert_eq!(record.baseline().unwrap().bytes(), PATTERN);
        assert_eq!(record.reached(), AttemptState::Classified);
        assert!(record.failure().is_none());
        assert_eq!(rig.configured(), Some(params()));
        assert_eq!(rig.pulses_fired(), 1);
    }

    #[test]
    fn baseline_mismatch_aborts_without_protection_step() {
        let (rig, mut campaign) = faulty_campaign(quiet(), Fault::CorruptFlashWrites, 5_000);
        let record = campaign.run_attempt(params()).unwrap();

        assert_eq!(record.outcome(), Outcome::Aborted);
        assert_eq!(record.failure().unwrap().kind, FailureKind::BaselineMismatch);
        assert_eq!(record.reached(), AttemptState::Armed);
        assert_eq!(campaign.target().option_writes, 0, "No protection write");
        assert_eq!(rig.level(), ProtectionLevel::Unprotected);
        assert_eq!(rig.pulses_fired(), 0);
    }

    #[test]
    fn blocked_downgrade_reads_protected_signature() {
        // Option writes: #1 engages level 1, #2 is the raced downgrade.
        let (rig, mut campaign) = faulty_campaign(quiet(), Fault::RejectOptionWrite(2), 5_000);
        let record = campaign.run_attempt(params()).unwrap();

        assert_eq!(
            record.outcome(),
            Outcome::GlitchFailedProtectionHeld(HeldEvidence::ProtectedSignature)
        );
        let race = record.race().unwrap();
        assert!(race.foreground_error.as_deref().unwrap().contains("option write nak"));
        assert!(race.trigger_error.is_none());
        assert_eq!(record.post_glitch().unwrap().bytes(), DEFAULT_PROTECTED_SIGNATURE);
        assert_eq!(rig.level(), ProtectionLevel::Level1);
    }

    #[test]
    fn clean_downgrade_is_held_with_erased_flash() {
        let (rig, mut campaign) = rig_campaign(quiet());
        let record = campaign.run_attempt(params()).unwrap();
        assert_eq!(
            record.outcome(),
            Outcome::GlitchFailedProtectionHeld(HeldEvidence::ErasedFlash)
        );
        assert_eq!(rig.level(), ProtectionLevel::Unprotected);
    }

    #[test]
    fn landed_pulse_that_skips_the_erase_succeeds() {
        let (_rig, mut campaign) = rig_campaign(landing(1.0));
        let record = campaign.run_attempt(params()).unwrap();
        assert_eq!(record.outcome(), Outcome::GlitchSucceeded);
        assert_eq!(record.post_glitch().unwrap().bytes(), PATTERN);
    }

    #[test]
    fn landed_pulse_that_scrambles_flash_destroys_data() {
        let (_rig, mut campaign) = rig_campaign(landing(0.0));
        let record = campaign.run_attempt(params()).unwrap();
        assert_eq!(record.outcome(), Outcome::GlitchDestroyedData);
    }

    #[test]
    fn protection_that_does_not_engage_aborts() {
        let (rig, mut campaign) = faulty_campaign(quiet(), Fault::IgnoreLevel1Writes, 5_000);
        let record = campaign.run_attempt(params()).unwrap();
        assert_eq!(record.outcome(), Outcome::Aborted);
        assert_eq!(record.failure().unwrap().kind, FailureKind::ProtectionNotEngaged);
        assert!(record.race().is_none());
        assert_eq!(rig.pulses_fired(), 0);
    }

    #[test]
    fn stalled_downgrade_times_out_as_unresponsive() {
        let (rig, mut campaign) = faulty_campaign(
            quiet(),
            Fault::StallOptionWrite(2, Duration::from_millis(400)),
            50,
        );
        let record = campaign.run_attempt(params()).unwrap();
        assert_eq!(record.outcome(), Outcome::DeviceUnresponsive);
        assert_eq!(record.failure().unwrap().kind, FailureKind::RaceTimeout);
        let race = record.race().unwrap();
        assert!(race.timed_out);
        assert!(race.elapsed_ms < 300, "race held on for {} ms", race.elapsed_ms);
        assert!(!rig.probe_armed());
    }

    #[test]
    fn late_downgrade_leg_refuses_the_next_attempt_until_it_returns() {
        let (_rig, mut campaign) = faulty_campaign(
            quiet(),
            Fault::StallOptionWrite(2, Duration::from_millis(600)),
            50,
        );
        campaign.run_attempt(params()).unwrap();

        let record = campaign.run_attempt(params()).unwrap();
        assert_eq!(record.failure().unwrap().kind, FailureKind::RigBusy);
        assert_eq!(record.outcome(), Outcome::DeviceUnresponsive);
        assert_eq!(record.reached(), AttemptState::Armed);
        assert!(record.baseline().is_none(), "Target untouched while held");

        std::thread::sleep(Duration::from_millis(700));
        let record = campaign.run_attempt(params()).unwrap();
        assert_eq!(record.reached(), AttemptState::Classified);
    }

    /// Holds the probe in `fire` longer than any race timeout used here.
    struct SlowFire {
        inner: SimProbe,
        stall: Duration,
    }

    impl ProbeDriver for SlowFire {
        fn name(&self) -> &'static str {
            "SlowFire"
        }
        fn configure(&mut self, params: &GlitchParameters) -> Result<(), ProbeError> {
            self.inner.configure(params)
        }
        fn arm(&mut self) -> Result<(), ProbeError> {
            self.inner.arm()
        }
        fn fire(&mut self, pulse_count: u32) -> Result<(), ProbeError> {
            std::thread::sleep(self.stall);
            self.inner.fire(pulse_count)
        }
        fn disarm(&mut self) -> Result<(), ProbeError> {
            self.inner.disarm()
        }
        fn is_armed(&mut self) -> Result<bool, ProbeError> {
            self.inner.is_armed()
        }
    }

    #[test]
    fn late_trigger_leg_halts_when_disarm_cannot_be_confirmed() {
        let mut config = config(quiet());
        config.campaign.race_timeout_ms = 50;
        let rig = SimulatedRig::new(
            &config.simulation,
            &config.target.layout,
            &config.campaign.protected_signature,
        );
        let probe = SlowFire {
            inner: rig.probe(),
            stall: Duration::from_millis(500),
        };
        let mut campaign = Campaign::new(&config, rig.target(), probe);

        let started = Instant::now();
        let result = campaign.run_attempt(params());
        assert!(started.elapsed() < Duration::from_millis(450));
        assert!(matches!(result, Err(CampaignError::SafetyInvariantViolation(_))));
        let record = campaign.log().last().unwrap();
        assert_eq!(record.failure().unwrap().kind, FailureKind::SafetyInvariantViolation);
        assert!(record.race().unwrap().timed_out);
    }

    #[test]
    fn invalid_parameters_abort_before_touching_the_rig() {
        let (rig, mut campaign) = rig_campaign(quiet());
        let bad = GlitchParameters {
            pulse_width: 0,
            ..params()
        };
        let record = campaign.run_attempt(bad).unwrap();
        assert_eq!(record.outcome(), Outcome::Aborted);
        assert_eq!(record.failure().unwrap().kind, FailureKind::InvalidParameters);
        assert_eq!(rig.configured(), None);
    }

    /// Fails `configure` a fixed number of times, then behaves.
    struct FlakyConfigure {
        inner: SimProbe,
        failures_left: usize,
    }

    impl ProbeDriver for FlakyConfigure {
        fn name(&self) -> &'static str {
            "FlakyConfigure"
        }
        fn configure(&mut self, params: &GlitchParameters) -> Result<(), ProbeError> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(ProbeError::Communication("serial timeout".into()));
            }
            self.inner.configure(params)
        }
        fn arm(&mut self) -> Result<(), ProbeError> {
            self.inner.arm()
        }
        fn fire(&mut self, pulse_count: u32) -> Result<(), ProbeError> {
            self.inner.fire(pulse_count)
        }
        fn disarm(&mut self) -> Result<(), ProbeError> {
            self.inner.disarm()
        }
        fn is_armed(&mut self) -> Result<bool, ProbeError> {
            self.inner.is_armed()
        }
        fn telemetry(&mut self) -> Result<Option<String>, ProbeError> {
            Err(ProbeError::Communication("status timeout".into()))
        }
    }

    #[test]
    fn configure_failure_is_recorded_and_campaign_continues() {
        let mut config = config(quiet());
        config.campaign.iterations = 2;
        let rig = SimulatedRig::new(
            &config.simulation,
            &config.target.layout,
            &config.campaign.protected_signature,
        );
        let probe = FlakyConfigure {
            inner: rig.probe(),
            failures_left: 1,
        };
        let mut campaign = Campaign::new(&config, rig.target(), probe);
        let summary = campaign
            .run(&mut FixedParameters(params()), &CancellationToken::new())
            .unwrap();

        assert_eq!(summary.attempts, 2);
        let records = campaign.log().records();
        assert_eq!(records[0].outcome(), Outcome::DeviceUnresponsive);
        assert_eq!(records[0].failure().unwrap().kind, FailureKind::ProbeCommunication);
        assert_eq!(records[1].reached(), AttemptState::Classified);
    }

    /// Reports armed no matter what it is told.
    struct StuckArmed;

    impl ProbeDriver for StuckArmed {
        fn name(&self) -> &'static str {
            "StuckArmed"
        }
        fn configure(&mut self, _params: &GlitchParameters) -> Result<(), ProbeError> {
            Ok(())
        }
        fn arm(&mut self) -> Result<(), ProbeError> {
            Ok(())
        }
        fn fire(&mut self, _pulse_count: u32) -> Result<(), ProbeError> {
            Ok(())
        }
        fn disarm(&mut self) -> Result<(), ProbeError> {
            Ok(())
        }
        fn is_armed(&mut self) -> Result<bool, ProbeError> {
            Ok(true)
        }
    }

    #[test]
    fn armed_probe_halts_the_campaign_after_recording() {
        let config = config(quiet());
        let rig = SimulatedRig::new(
            &config.simulation,
            &config.target.layout,
            &config.campaign.protected_signature,
        );
        let mut campaign = Campaign::new(&config, rig.target(), StuckArmed);

        match campaign.run_attempt(params()) {
            Err(CampaignError::SafetyInvariantViolation(detail)) => {
                assert!(detail.contains("disarmed") || detail.contains("armed"));
            }
            other => panic!("Expected SafetyInvariantViolation, got {:?}", other.map(|r| r.outcome())),
        }
        assert_eq!(campaign.log().len(), 1, "The attempt is still recorded");
        let record = campaign.log().last().unwrap();
        assert_eq!(record.failure().unwrap().kind, FailureKind::SafetyInvariantViolation);
        assert_eq!(record.outcome(), Outcome::Aborted);
        assert!(rig.flash().iter().all(|&b| b == 0), "No memory operation ran");
    }

    #[test]
    fn armed_probe_fails_preflight_in_run() {
        let config = config(quiet());
        let rig = SimulatedRig::new(
            &config.simulation,
            &config.target.layout,
            &config.campaign.protected_signature,
        );
        let mut campaign = Campaign::new(&config, rig.target(), StuckArmed);
        let result = campaign.run(&mut FixedParameters(params()), &CancellationToken::new());
        assert!(matches!(result, Err(CampaignError::SafetyInvariantViolation(_))));
        assert!(campaign.log().is_empty());
    }

    #[test]
    fn cancelled_token_stops_before_the_first_attempt() {
        let (_rig, mut campaign) = rig_campaign(quiet());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = campaign
            .run(&mut FixedParameters(params()), &cancel)
            .unwrap();
        assert!(summary.cancelled);
        assert_eq!(summary.attempts, 0);
    }

    #[test]
    fn cancelling_a_clone_stops_the_run() {
        let (_rig, mut campaign) = rig_campaign(quiet());
        let cancel = CancellationToken::new();
        let handler_copy = cancel.clone();
        handler_copy.cancel();
        assert!(cancel.is_cancelled());
        let summary = campaign
            .run(&mut FixedParameters(params()), &cancel)
            .unwrap();
        assert!(summary.cancelled);
    }

    #[test]
    fn run_performs_the_configured_iterations() {
        let mut config = config(quiet());
        config.campaign.iterations = 3;
        let rig = SimulatedRig::new(
            &config.simulation,
            &config.target.layout,
            &config.campaign.protected_signature,
        );
        let mut campaign = Campaign::new(&config, rig.target(), rig.probe());
        let summary = campaign
            .run(&mut FixedParameters(params()), &CancellationToken::new())
            .unwrap();
        assert_eq!(summary.attempts, 3);
        assert_eq!(summary.tally.erased, 3);
        assert!(summary.successes.is_empty());
        let indices: Vec<u64> = campaign.log().records().iter().map(|r| r.index()).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn probe_is_disarmed_after_every_attempt_under_injected_faults() {
        let sim = SimulationSettings {
            failure_rate: 0.2,
            max_consecutive_failures: 1,
            seed: 7,
            ..quiet()
        };
        let (rig, mut campaign) = rig_campaign(sim);
        for i in 0..1000 {
            let result = campaign.run_attempt(params());
            assert!(result.is_ok(), "attempt {i} halted the campaign");
            assert!(!rig.probe_armed(), "probe left armed after attempt {i}");
        }
        assert_eq!(campaign.log().len(), 1000);
    }
}
