pub mod cancel;
pub mod config;
pub mod error;
pub mod executor;
pub mod hunt;
pub mod observer;
pub mod oracle;
pub mod outcome;
pub mod script;
pub mod signal;

pub use cancel::{CancelToken, install_interrupt_handler};
pub use config::HuntConfig;
pub use error::{AttemptError, ConfigError, SpawnError};
pub use executor::{
    AttemptHandle, CommandExecutor, CommandExecutorConfig, Executor, HandleLedger, ProcessHandle,
    ScriptOutcome,
};
pub use hunt::{AttemptSummary, CrashHunter, HuntOutcome, HuntState, StopConditions, StopReason};
pub use observer::{ConsoleObserver, JsonObserver, NoOpObserver, Observer};
pub use oracle::{CrashEvidence, CrashOracle, Oracle, Verdict};
pub use outcome::{StatusConvention, TerminationOutcome};
pub use script::{Step, TargetSpec};
