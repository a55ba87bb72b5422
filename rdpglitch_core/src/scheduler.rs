use crate::probe::{ProbeDriver, ProbeError};
use crossbeam_channel as chan;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SETTLE_POLL: Duration = Duration::from_millis(5);

/// How one leg of the race ended.
#[derive(Debug)]
pub enum LegOutcome<R> {
    Completed(R),
    /// No report before the join deadline. The leg may still be running.
    TimedOut,
    Panicked(String),
}

impl<R> LegOutcome<R> {
    pub fn completed(&self) -> Option<&R> {
        match self {
            LegOutcome::Completed(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, LegOutcome::TimedOut)
    }
}

/// Legs that missed the join deadline and are still holding their handle.
///
/// The foreground leg holds the target and the trigger leg holds the probe
/// until they return, so neither handle may be used before its leg settles.
#[derive(Debug, Default)]
pub struct Stragglers {
    foreground: Option<JoinHandle<()>>,
    trigger: Option<JoinHandle<()>>,
}

impl Stragglers {
    pub fn is_empty(&self) -> bool {
        self.foreground.is_none() && self.trigger.is_none()
    }

    /// Waits up to `patience` for a late foreground leg. True once the target is free.
    pub fn settle_foreground(&mut self, patience: Duration) -> bool {
        settle(&mut self.foreground, patience)
    }

    /// Waits up to `patience` for a late trigger leg. True once the probe is free.
    pub fn settle_trigger(&mut self, patience: Duration) -> bool {
        settle(&mut self.trigger, patience)
    }

    /// Takes over the late legs of another race.
    pub fn absorb(&mut self, other: Stragglers) {
        if other.foreground.is_some() {
            self.foreground = other.foreground;
        }
        if other.trigger.is_some() {
            self.trigger = other.trigger;
        }
    }
}

fn settle(slot: &mut Option<JoinHandle<()>>, patience: Duration) -> bool {
    let deadline = Instant::now() + patience;
    loop {
        match slot.as_ref() {
            None => return true,
            Some(handle) if handle.is_finished() => {
                if let Some(handle) = slot.take() {
                    let _ = handle.join();
                }
                return true;
            }
            Some(_) if Instant::now() >= deadline => return false,
            Some(_) => thread::sleep(SETTLE_POLL),
        }
    }
}

/// Both leg results of one race. Neither is ever dropped.
#[derive(Debug)]
pub struct RaceReport<F> {
    pub foreground: LegOutcome<F>,
    pub trigger: LegOutcome<Result<(), ProbeError>>,
    pub elapsed: Duration,
    pub stragglers: Stragglers,
}

impl<F> RaceReport<F> {
    pub fn any_timed_out(&self) -> bool {
        self.foreground.is_timed_out() || self.trigger.is_timed_out()
    }
}

/// Locks a shared rig handle. A leg that panicked while holding it leaves the
/// handle usable.
pub fn lock_handle<T: ?Sized>(handle: &Mutex<T>) -> MutexGuard<'_, T> {
    handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fires the probe concurrently with a foreground target operation.
///
/// There is no hardware trigger line: both legs are started back to back
/// and overlap on a best-effort basis. Which one lands first is decided by
/// the probe's arm latency against the debug link's command latency.
#[derive(Debug, Clone, Copy)]
pub struct GlitchTrigger {
    join_timeout: Duration,
}

impl GlitchTrigger {
    pub fn new(join_timeout: Duration) -> Self {
        Self { join_timeout }
    }

    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    /// Runs `foreground` and the pulse sequence on two threads and returns
    /// once both reported or the join timeout expired, whichever is first.
    ///
    /// The pulse leg is `arm`, `fire(pulse_count)`, then `disarm`. When arming
    /// or firing fails a disarm is still attempted before the error is
    /// reported. Legs that miss the deadline are detached and handed back in
    /// `RaceReport::stragglers`.
    pub fn race<P, F, R>(&self, probe: Arc<Mutex<P>>, pulse_count: u32, foreground: F) -> RaceReport<R>
    where
        P: ProbeDriver + ?Sized + 'static,
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let started = Instant::now();
        let deadline = started + self.join_timeout;
        let (fg_tx, fg_rx) = chan::bounded::<Result<R, String>>(1);
        let (trig_tx, trig_rx) = chan::bounded::<Result<Result<(), ProbeError>, String>>(1);

        let fg_handle = spawn_leg("race-foreground", foreground, fg_tx);
        let trig_handle = spawn_leg(
            "race-trigger",
            move || {
                let mut probe = lock_handle(&probe);
                pulse_sequence(&mut *probe, pulse_count)
            },
            trig_tx,
        );

        let foreground = await_leg(&fg_rx, deadline);
        let trigger = await_leg(&trig_rx, deadline);
        let stragglers = Stragglers {
            foreground: release(foreground.is_timed_out(), fg_handle),
            trigger: release(trigger.is_timed_out(), trig_handle),
        };
        if !stragglers.is_empty() {
            warn!(
                "race join exceeded {:?}, detaching the late leg",
                self.join_timeout
            );
        }

        let elapsed = started.elapsed();
        debug!("race finished in {elapsed:?}");
        RaceReport {
            foreground,
            trigger,
            elapsed,
            stragglers,
        }
    }
}

fn spawn_leg<R, F>(
    name: &str,
    body: F,
    report: chan::Sender<Result<R, String>>,
) -> Option<JoinHandle<()>>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
        let result = catch_unwind(AssertUnwindSafe(body)).map_err(panic_message);
        let _ = report.send(result);
    });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            // The sender was dropped with the closure, so the leg reads as
            // disconnected.
            warn!("could not start {name}: {e}");
            None
        }
    }
}

fn await_leg<R>(rx: &chan::Receiver<Result<R, String>>, deadline: Instant) -> LegOutcome<R> {
    match rx.recv_deadline(deadline) {
        Ok(Ok(r)) => LegOutcome::Completed(r),
        Ok(Err(message)) => LegOutcome::Panicked(message),
        Err(chan::RecvTimeoutError::Timeout) => LegOutcome::TimedOut,
        Err(chan::RecvTimeoutError::Disconnected) => {
            LegOutcome::Panicked("leg exited without reporting".to_string())
        }
    }
}

/// A leg that reported is about to exit and is joined; a late one is kept.
fn release(late: bool, handle: Option<JoinHandle<()>>) -> Option<JoinHandle<()>> {
    match (late, handle) {
        (true, handle) => handle,
        (false, Some(handle)) => {
            let _ = handle.join();
            None
        }
        (false, None) => None,
    }
}

fn pulse_sequence<P: ProbeDriver + ?Sized>(probe: &mut P, pulse_count: u32) -> Result<(), ProbeError> {
    let fired = probe.arm().and_then(|_| probe.fire(pulse_count));
    let disarmed = probe.disarm();
    match (fired, disarmed) {
        (Err(e), Err(disarm_err)) => {
            warn!("disarm after failed pulse sequence also failed: {disarm_err}");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
        (Ok(()), disarmed) => disarmed,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic type".to_string()
    }
}
