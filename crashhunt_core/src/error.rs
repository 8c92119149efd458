use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The target could not be launched. Fatal to the whole hunt.
#[derive(Error, Debug)]
#[error("Failed to spawn command '{command}': {source}")]
pub struct SpawnError {
    pub command: String,
    #[source]
    pub source: io::Error,
}

/// Something went wrong while an attempt was already running.
///
/// None of these are fatal to the hunt. `StreamIo` and `TimedOut` are logged
/// and the attempt is retried, `Cancelled` stops the hunt.
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error("I/O error on target streams: {0}")]
    StreamIo(#[from] io::Error),
    #[error("Target did not terminate within {0:?}")]
    TimedOut(Duration),
    #[error("Attempt cancelled")]
    Cancelled,
    #[error("Wait status carried neither an exit code nor a signal")]
    UndecodableStatus,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to parse TOML from config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Target command is empty")]
    EmptyCommand,
    #[error("Unknown signal '{0}'")]
    UnknownSignal(String),
    #[error("Invalid script step '{0}': expected 'expect:<text>' or 'send:<text>'")]
    InvalidStep(String),
    #[error("Invalid escape sequence in '{0}'")]
    InvalidEscape(String),
}
