use crate::outcome::TerminationOutcome;
use crate::signal::{SIGSEGV, signal_name};

/// What the hunt should do with a finished attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The target died from a fault signal of interest.
    Crash { signal: i32 },
    Retry,
}

/// Evidence captured on the attempt that crashed. The only artifact the hunt produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashEvidence {
    /// 1-based attempt number at which the crash occurred.
    pub attempt: u64,
    pub signal: i32,
    pub signal_name: String,
    /// Raw bytes the target produced after the last matched marker, up to its death.
    pub output: Vec<u8>,
    /// MD5 of `output`, handy for telling repeated findings apart.
    pub output_hash: String,
    /// Whether the interaction script ran to completion before the crash.
    pub script_completed: bool,
    /// Output went past the attempt's buffer cap and the rest was dropped.
    pub output_truncated: bool,
}

impl CrashEvidence {
    pub fn new(attempt: u64, signal: i32, output: Vec<u8>, script_completed: bool) -> Self {
        let output_hash = format!("{:x}", md5::compute(&output));
        Self {
            attempt,
            signal,
            signal_name: signal_name(signal),
            output,
            output_hash,
            script_completed,
            output_truncated: false,
        }
    }

    pub fn with_output_truncated(mut self, truncated: bool) -> Self {
        self.output_truncated = truncated;
        self
    }
}

/// An `Oracle` decides whether a termination outcome is the crash being hunted.
///
/// Outcomes are already normalized by the driver, so oracles only ever compare
/// canonical signal numbers and never look at raw statuses. An attempt without
/// a decodable outcome (`None`) must never be promoted to a crash.
pub trait Oracle: Send + Sync {
    fn examine(&self, outcome: Option<&TerminationOutcome>) -> Verdict;
}

/// Reports a crash when the target was killed by one of a set of fault signals.
///
/// Defaults to segmentation violation only.
#[derive(Debug, Clone)]
pub struct CrashOracle {
    fault_signals: Vec<i32>,
}

impl CrashOracle {
    pub fn new() -> Self {
        Self::with_signals(vec![SIGSEGV])
    }

    pub fn with_signals(mut fault_signals: Vec<i32>) -> Self {
        fault_signals.sort_unstable();
        fault_signals.dedup();
        Self { fault_signals }
    }

    pub fn fault_signals(&self) -> &[i32] {
        &self.fault_signals
    }
}

impl Default for CrashOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl Oracle for CrashOracle {
    fn examine(&self, outcome: Option<&TerminationOutcome>) -> Verdict {
        match outcome.and_then(TerminationOutcome::signal) {
            Some(signal) if self.fault_signals.contains(&signal) => Verdict::Crash { signal },
            _ => Verdict::Retry,
        }
    }
}
