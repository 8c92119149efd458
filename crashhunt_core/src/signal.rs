//! Signal naming and parsing, backed by `nix`'s signal table for the host.

use crate::error::ConfigError;
use nix::sys::signal::Signal;
use std::str::FromStr;

/// Segmentation violation, the default fault signal of interest.
pub const SIGSEGV: i32 = Signal::SIGSEGV as i32;

/// Returns true if `signo` is a signal the host knows about.
pub fn is_known_signal(signo: i32) -> bool {
    Signal::try_from(signo).is_ok()
}

/// Host name of a signal (`SIGSEGV`), or `signal N` for numbers outside the table.
pub fn signal_name(signo: i32) -> String {
    match Signal::try_from(signo) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("signal {signo}"),
    }
}

/// Parses `SIGSEGV`, `SEGV`, `segv` or `11` into a signal number.
pub fn parse_signal(s: &str) -> Result<i32, ConfigError> {
    let trimmed = s.trim();
    if let Ok(n) = trimmed.parse::<i32>() {
        return if is_known_signal(n) {
            Ok(n)
        } else {
            Err(ConfigError::UnknownSignal(s.to_string()))
        };
    }
    let upper = trimmed.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&name)
        .map(|sig| sig as i32)
        .map_err(|_| ConfigError::UnknownSignal(s.to_string()))
}
