use crate::signal::{is_known_signal, signal_name};
use serde::Deserialize;
use std::fmt;
use std::process::ExitStatus;

/// How a finished attempt ended, normalized from the raw wait status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationOutcome {
    Exited(i32),
    Signaled(i32),
}

impl TerminationOutcome {
    pub fn signal(&self) -> Option<i32> {
        match self {
            TerminationOutcome::Signaled(sig) => Some(*sig),
            TerminationOutcome::Exited(_) => None,
        }
    }
}

impl fmt::Display for TerminationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationOutcome::Exited(code) => write!(f, "exited with code {code}"),
            TerminationOutcome::Signaled(sig) => {
                write!(f, "terminated by signal {sig} ({})", signal_name(*sig))
            }
        }
    }
}

/// How raw statuses are interpreted.
///
/// `Native` trusts only the OS "terminated by signal" indicator. `ShellWrapped`
/// is for targets launched through a shell, which reports a child killed by
/// signal N as exit code `128 + N`.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StatusConvention {
    #[default]
    Native,
    ShellWrapped,
}

impl StatusConvention {
    pub fn normalize(self, status: ExitStatus) -> Option<TerminationOutcome> {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return Some(TerminationOutcome::Signaled(sig));
            }
        }
        status.code().map(|code| self.normalize_code(code))
    }

    pub fn normalize_code(self, code: i32) -> TerminationOutcome {
        match self {
            StatusConvention::Native => TerminationOutcome::Exited(code),
            StatusConvention::ShellWrapped => {
                let sig = code - 128;
                if sig > 0 && is_known_signal(sig) {
                    TerminationOutcome::Signaled(sig)
                } else {
                    TerminationOutcome::Exited(code)
                }
            }
        }
    }
}
