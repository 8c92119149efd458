use crate::cancel::CancelToken;
use crate::error::{AttemptError, SpawnError};
use crate::executor::{AttemptHandle, Executor, ScriptOutcome};
use crate::observer::Observer;
use crate::oracle::{CrashEvidence, Oracle, Verdict};
use crate::outcome::TerminationOutcome;
use crate::script::TargetSpec;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// States of the crash-hunt state machine.
///
/// `Idle -> Attempting -> (RetryRequested -> Attempting)* -> CrashFound | Aborted | Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HuntState {
    Idle,
    Attempting,
    RetryRequested,
    CrashFound,
    Aborted,
    Stopped,
}

impl HuntState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HuntState::CrashFound | HuntState::Aborted | HuntState::Stopped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxAttempts(u64),
    Deadline(Duration),
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::MaxAttempts(max) => write!(f, "reached the limit of {max} attempts"),
            StopReason::Deadline(limit) => write!(f, "hunt deadline of {limit:?} elapsed"),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Conditions that end a hunt without a crash. None set means hunt forever.
#[derive(Debug, Clone, Default)]
pub struct StopConditions {
    pub max_attempts: Option<u64>,
    /// Checked between attempts; bound single attempts with the executor's timeouts.
    pub deadline: Option<Duration>,
    pub cancel: CancelToken,
}

#[derive(Debug)]
pub enum HuntOutcome {
    CrashFound(CrashEvidence),
    Aborted { attempt: u64, error: SpawnError },
    Stopped { attempts: u64, reason: StopReason },
}

/// What one finished attempt looked like, as handed to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptSummary {
    pub attempt: u64,
    pub script: ScriptOutcome,
    /// `None` when the attempt ended without a decodable status (timeout, wait error).
    pub outcome: Option<TerminationOutcome>,
    pub verdict: Verdict,
}

/// Runs the target over and over until it crashes, a stop condition fires,
/// or it cannot be spawned.
///
/// Attempts are strictly sequential: each handle is released before the next
/// spawn, so at most one target process is alive at any time.
pub struct CrashHunter<E: Executor, O: Oracle> {
    executor: E,
    oracle: O,
    stop: StopConditions,
    observers: Vec<Box<dyn Observer>>,
    state: HuntState,
    attempts: u64,
}

impl<E: Executor, O: Oracle> CrashHunter<E, O> {
    pub fn new(executor: E, oracle: O, stop: StopConditions) -> Self {
        Self {
            executor,
            oracle,
            stop,
            observers: Vec::new(),
            state: HuntState::Idle,
            attempts: 0,
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn state(&self) -> HuntState {
        self.state
    }

    /// Attempts made by the current or last run, counting a failed spawn.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn run(&mut self, target: &TargetSpec) -> HuntOutcome {
        let started = Instant::now();
        let cancel = self.stop.cancel.clone();
        self.attempts = 0;
        self.state = HuntState::Idle;
        info!(command = %target.display_command(), steps = target.script.len(), "hunt started");

        loop {
            if let Some(reason) = self.stop_reason(started) {
                return self.stopped(reason);
            }

            self.attempts += 1;
            let attempt = self.attempts;
            self.state = HuntState::Attempting;
            self.notify(|obs| obs.pre_attempt(attempt));

            let mut handle = match self.executor.spawn(target) {
                Ok(handle) => handle,
                Err(error) => {
                    self.state = HuntState::Aborted;
                    warn!(attempt, %error, "hunt aborted");
                    self.notify(|obs| obs.on_abort(attempt, &error));
                    return HuntOutcome::Aborted { attempt, error };
                }
            };
            debug!(attempt, pid = handle.pid(), "attempt started");

            let script = handle.run_script(&target.script, &cancel);
            if script.is_cancelled() {
                handle.release();
                return self.stopped(StopReason::Cancelled);
            }

            let outcome = match handle.wait(&cancel) {
                Ok(outcome) => Some(outcome),
                Err(AttemptError::Cancelled) => {
                    handle.release();
                    return self.stopped(StopReason::Cancelled);
                }
                Err(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        "no termination status, treating attempt as a retry"
                    );
                    None
                }
            };

            let verdict = self.oracle.examine(outcome.as_ref());
            let summary = AttemptSummary {
                attempt,
                script,
                outcome,
                verdict,
            };
            debug!(
                attempt,
                outcome = ?summary.outcome,
                verdict = ?summary.verdict,
                "attempt finished"
            );

            match verdict {
                Verdict::Crash { signal } => {
                    let output = handle.drain();
                    let truncated = handle.output_truncated();
                    handle.release();
                    self.notify(|obs| obs.post_attempt(&summary));
                    let evidence = CrashEvidence::new(
                        attempt,
                        signal,
                        output,
                        summary.script.is_completed(),
                    )
                    .with_output_truncated(truncated);
                    self.state = HuntState::CrashFound;
                    info!(attempt, signal = %evidence.signal_name, "crash found");
                    self.notify(|obs| obs.on_crash(&evidence));
                    return HuntOutcome::CrashFound(evidence);
                }
                Verdict::Retry => {
                    handle.release();
                    self.state = HuntState::RetryRequested;
                    self.notify(|obs| obs.post_attempt(&summary));
                }
            }
        }
    }

    fn stop_reason(&self, started: Instant) -> Option<StopReason> {
        if self.stop.cancel.is_cancelled() {
            return Some(StopReason::Cancelled);
        }
        if let Some(max) = self.stop.max_attempts {
            if self.attempts >= max {
                return Some(StopReason::MaxAttempts(max));
            }
        }
        if let Some(limit) = self.stop.deadline {
            if started.elapsed() >= limit {
                return Some(StopReason::Deadline(limit));
            }
        }
        None
    }

    fn stopped(&mut self, reason: StopReason) -> HuntOutcome {
        let attempts = self.attempts;
        self.state = HuntState::Stopped;
        info!(attempts, %reason, "hunt stopped without a crash");
        self.notify(|obs| obs.on_stop(attempts, reason));
        HuntOutcome::Stopped { attempts, reason }
    }

    fn notify(&mut self, mut hook: impl FnMut(&mut dyn Observer) -> Result<(), anyhow::Error>) {
        for obs in self.observers.iter_mut() {
            if let Err(e) = hook(obs.as_mut()) {
                warn!(observer = obs.name(), error = %e, "observer failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::HandleLedger;
    use crate::oracle::CrashOracle;
    use crate::script::Step;
    use crate::signal::SIGSEGV;
    use nix::sys::signal::Signal;
    use std::io;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    enum Behavior {
        Exit(i32),
        Signal(i32),
        /// Dies before the last marker, leaving `tail` unconsumed.
        DieMidScript { signal: i32, tail: Vec<u8> },
        TimeOut,
        SpawnFail,
        /// Cancels the token when spawned, then blocks until cancelled.
        CancelWhileRunning(CancelToken),
    }

    struct SimulatedExecutor {
        plan: Box<dyn FnMut(u64) -> Behavior + Send>,
        spawns: u64,
        ledger: HandleLedger,
        live: Arc<AtomicU64>,
        max_live: Arc<AtomicU64>,
    }

    impl SimulatedExecutor {
        fn new(plan: impl FnMut(u64) -> Behavior + Send + 'static) -> Self {
            Self {
                plan: Box::new(plan),
                spawns: 0,
                ledger: HandleLedger::default(),
                live: Arc::default(),
                max_live: Arc::default(),
            }
        }
    }

    struct SimulatedHandle {
        behavior: Behavior,
        ledger: HandleLedger,
        live: Arc<AtomicU64>,
    }

    impl Executor for SimulatedExecutor {
        type Handle = SimulatedHandle;

        fn spawn(&mut self, _target: &TargetSpec) -> Result<SimulatedHandle, SpawnError> {
            self.spawns += 1;
            let behavior = (self.plan)(self.spawns);
            if let Behavior::SpawnFail = behavior {
                return Err(SpawnError {
                    command: "./a.out".to_string(),
                    source: io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
                });
            }
            if let Behavior::CancelWhileRunning(token) = &behavior {
                token.cancel();
            }
            self.ledger.record_spawn();
            let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(live, Ordering::SeqCst);
            Ok(SimulatedHandle {
                behavior,
                ledger: self.ledger.clone(),
                live: self.live.clone(),
            })
        }
    }

    impl AttemptHandle for SimulatedHandle {
        fn pid(&self) -> u32 {
            4242
        }

        fn run_script(&mut self, script: &[Step], cancel: &CancelToken) -> ScriptOutcome {
            match self.behavior {
                Behavior::DieMidScript { .. } => ScriptOutcome::StreamClosed {
                    step: script.len().saturating_sub(1),
                },
                Behavior::CancelWhileRunning(_) if cancel.is_cancelled() => {
                    ScriptOutcome::Cancelled { step: 0 }
                }
                _ => ScriptOutcome::Completed,
            }
        }

        fn wait(&mut self, cancel: &CancelToken) -> Result<TerminationOutcome, AttemptError> {
            match &self.behavior {
                Behavior::Exit(code) => Ok(TerminationOutcome::Exited(*code)),
                Behavior::Signal(sig) | Behavior::DieMidScript { signal: sig, .. } => {
                    Ok(TerminationOutcome::Signaled(*sig))
                }
                Behavior::TimeOut => Err(AttemptError::TimedOut(Duration::from_millis(10))),
                Behavior::CancelWhileRunning(_) if cancel.is_cancelled() => {
                    Err(AttemptError::Cancelled)
                }
                other => panic!("unexpected wait for {other:?}"),
            }
        }

        fn drain(&mut self) -> Vec<u8> {
            match &self.behavior {
                Behavior::DieMidScript { tail, .. } => tail.clone(),
                _ => Vec::new(),
            }
        }

        fn release(self) {
            self.ledger.record_release();
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Clone, Default)]
    struct RecordingObserver {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingObserver {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Observer for RecordingObserver {
        fn name(&self) -> &'static str {
            "RecordingObserver"
        }
        fn pre_attempt(&mut self, attempt: u64) -> Result<(), anyhow::Error> {
            self.events.lock().unwrap().push(format!("pre {attempt}"));
            Ok(())
        }
        fn post_attempt(&mut self, summary: &AttemptSummary) -> Result<(), anyhow::Error> {
            self.events
                .lock()
                .unwrap()
                .push(format!("post {} {:?}", summary.attempt, summary.verdict));
            Ok(())
        }
        fn on_crash(&mut self, evidence: &CrashEvidence) -> Result<(), anyhow::Error> {
            self.events
                .lock()
                .unwrap()
                .push(format!("crash {}", evidence.attempt));
            Ok(())
        }
        fn on_abort(&mut self, attempt: u64, _error: &SpawnError) -> Result<(), anyhow::Error> {
            self.events.lock().unwrap().push(format!("abort {attempt}"));
            Ok(())
        }
        fn on_stop(&mut self, attempts: u64, reason: StopReason) -> Result<(), anyhow::Error> {
            self.events
                .lock()
                .unwrap()
                .push(format!("stop {attempts} {reason:?}"));
            Ok(())
        }
    }

    struct FailingObserver;

    impl Observer for FailingObserver {
        fn name(&self) -> &'static str {
            "FailingObserver"
        }
        fn on_crash(&mut self, _evidence: &CrashEvidence) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("sink unavailable"))
        }
    }

    fn target() -> TargetSpec {
        TargetSpec::from_command(
            &["./a.out".to_string()],
            vec![
                Step::expect("username:\n"),
                Step::send_line("aaaaaaaa"),
                Step::expect("serial number:\n"),
                Step::send_line("12"),
                Step::expect("s/n WRONG!"),
            ],
        )
        .unwrap()
    }

    fn limited(max: u64) -> StopConditions {
        StopConditions {
            max_attempts: Some(max),
            ..Default::default()
        }
    }

    #[test]
    fn clean_target_never_reports_a_crash() {
        let executor = SimulatedExecutor::new(|_| Behavior::Exit(0));
        let mut hunter = CrashHunter::new(executor, CrashOracle::new(), limited(50));

        match hunter.run(&target()) {
            HuntOutcome::Stopped { attempts, reason } => {
                assert_eq!(attempts, 50);
                assert_eq!(reason, StopReason::MaxAttempts(50));
            }
            other => panic!("Expected Stopped, got {other:?}"),
        }
        assert_eq!(hunter.state(), HuntState::Stopped);
        assert!(hunter.state().is_terminal());
        assert_eq!(hunter.executor().ledger.spawned(), 50);
        assert_eq!(hunter.executor().ledger.released(), 50);
        assert_eq!(hunter.executor().max_live.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn always_faulting_target_crashes_on_first_attempt() {
        for _ in 0..5 {
            let executor = SimulatedExecutor::new(|_| Behavior::Signal(SIGSEGV));
            let mut hunter =
                CrashHunter::new(executor, CrashOracle::new(), StopConditions::default());
            match hunter.run(&target()) {
                HuntOutcome::CrashFound(evidence) => {
                    assert_eq!(evidence.attempt, 1);
                    assert_eq!(evidence.signal, SIGSEGV);
                    assert!(evidence.script_completed);
                }
                other => panic!("Expected CrashFound, got {other:?}"),
            }
            assert_eq!(hunter.state(), HuntState::CrashFound);
            assert_eq!(hunter.executor().ledger.open(), 0);
        }
    }

    #[test]
    fn every_spawn_counts_once_and_is_released() {
        let observer = RecordingObserver::default();
        let executor = SimulatedExecutor::new(|n| match n {
            1 => Behavior::Exit(1),
            2 => Behavior::Exit(139),
            3 => Behavior::Exit(245),
            4 => Behavior::Signal(Signal::SIGKILL as i32),
            5 => Behavior::TimeOut,
            6 => Behavior::DieMidScript {
                signal: Signal::SIGABRT as i32,
                tail: b"abort".to_vec(),
            },
            _ => Behavior::Signal(SIGSEGV),
        });
        let mut hunter = CrashHunter::new(executor, CrashOracle::new(), StopConditions::default())
            .with_observer(Box::new(observer.clone()));

        match hunter.run(&target()) {
            HuntOutcome::CrashFound(evidence) => assert_eq!(evidence.attempt, 7),
            other => panic!("Expected CrashFound, got {other:?}"),
        }
        assert_eq!(hunter.attempts(), 7);
        assert_eq!(hunter.executor().ledger.spawned(), 7);
        assert_eq!(hunter.executor().ledger.released(), 7);

        let events = observer.events();
        let pre: Vec<String> = events
            .iter()
            .filter(|e| e.starts_with("pre "))
            .cloned()
            .collect();
        let expected: Vec<String> = (1..=7).map(|n| format!("pre {n}")).collect();
        assert_eq!(pre, expected);
        assert_eq!(events.last().unwrap(), "crash 7");
        assert!(events.contains(&"post 6 Retry".to_string()));
    }

    #[test]
    fn crash_mid_script_is_classified_by_termination() {
        let executor = SimulatedExecutor::new(|n| {
            if n < 3 {
                Behavior::DieMidScript {
                    signal: Signal::SIGTERM as i32,
                    tail: b"ignored".to_vec(),
                }
            } else {
                Behavior::DieMidScript {
                    signal: SIGSEGV,
                    tail: b"after serial\n".to_vec(),
                }
            }
        });
        let mut hunter = CrashHunter::new(executor, CrashOracle::new(), limited(10));
        match hunter.run(&target()) {
            HuntOutcome::CrashFound(evidence) => {
                assert_eq!(evidence.attempt, 3);
                assert_eq!(evidence.output, b"after serial\n".to_vec());
                assert!(!evidence.script_completed);
            }
            other => panic!("Expected CrashFound, got {other:?}"),
        }
    }

    #[test]
    fn spawn_failure_aborts_immediately() {
        let observer = RecordingObserver::default();
        let executor = SimulatedExecutor::new(|_| Behavior::SpawnFail);
        let mut hunter = CrashHunter::new(executor, CrashOracle::new(), StopConditions::default())
            .with_observer(Box::new(observer.clone()));

        match hunter.run(&target()) {
            HuntOutcome::Aborted { attempt, error } => {
                assert_eq!(attempt, 1);
                assert_eq!(error.source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("Expected Aborted, got {other:?}"),
        }
        assert_eq!(hunter.state(), HuntState::Aborted);
        assert_eq!(hunter.executor().spawns, 1);
        assert_eq!(hunter.executor().ledger.spawned(), 0);
        assert_eq!(observer.events(), vec!["pre 1", "abort 1"]);
    }

    #[test]
    fn spawn_failure_after_retries_is_not_retried() {
        let executor = SimulatedExecutor::new(|n| {
            if n < 4 {
                Behavior::Exit(0)
            } else {
                Behavior::SpawnFail
            }
        });
        let mut hunter = CrashHunter::new(executor, CrashOracle::new(), StopConditions::default());
        assert!(matches!(
            hunter.run(&target()),
            HuntOutcome::Aborted { attempt: 4, .. }
        ));
        assert_eq!(hunter.executor().ledger.released(), 3);
    }

    #[test]
    fn cancelled_before_start_spawns_nothing() {
        let stop = StopConditions::default();
        stop.cancel.cancel();
        let executor = SimulatedExecutor::new(|_| Behavior::Exit(0));
        let mut hunter = CrashHunter::new(executor, CrashOracle::new(), stop);
        assert!(matches!(
            hunter.run(&target()),
            HuntOutcome::Stopped {
                attempts: 0,
                reason: StopReason::Cancelled
            }
        ));
        assert_eq!(hunter.executor().spawns, 0);
    }

    #[test]
    fn cancellation_mid_attempt_releases_the_handle() {
        let stop = StopConditions::default();
        let token = stop.cancel.clone();
        let executor = SimulatedExecutor::new(move |n| {
            if n < 3 {
                Behavior::Exit(0)
            } else {
                Behavior::CancelWhileRunning(token.clone())
            }
        });
        let mut hunter = CrashHunter::new(executor, CrashOracle::new(), stop);
        assert!(matches!(
            hunter.run(&target()),
            HuntOutcome::Stopped {
                attempts: 3,
                reason: StopReason::Cancelled
            }
        ));
        assert_eq!(hunter.executor().ledger.spawned(), 3);
        assert_eq!(hunter.executor().ledger.released(), 3);
    }

    #[test]
    fn deadline_stops_the_hunt() {
        let executor = SimulatedExecutor::new(|_| Behavior::Exit(0));
        let stop = StopConditions {
            deadline: Some(Duration::ZERO),
            ..Default::default()
        };
        let mut hunter = CrashHunter::new(executor, CrashOracle::new(), stop);
        assert!(matches!(
            hunter.run(&target()),
            HuntOutcome::Stopped {
                reason: StopReason::Deadline(_),
                ..
            }
        ));
    }

    #[test]
    fn observer_failure_does_not_change_outcome() {
        let executor = SimulatedExecutor::new(|_| Behavior::Signal(SIGSEGV));
        let mut hunter = CrashHunter::new(executor, CrashOracle::new(), StopConditions::default())
            .with_observer(Box::new(FailingObserver));
        assert!(matches!(hunter.run(&target()), HuntOutcome::CrashFound(_)));
    }
}
