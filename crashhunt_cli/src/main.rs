mod logging;

use crashhunt_core::config::HuntConfig;
use crashhunt_core::executor::CommandExecutor;
use crashhunt_core::hunt::{CrashHunter, HuntOutcome, StopConditions};
use crashhunt_core::observer::{ConsoleObserver, JsonObserver};
use crashhunt_core::oracle::CrashOracle;
use crashhunt_core::outcome::StatusConvention;
use crashhunt_core::script::Step;
use crashhunt_core::{CancelToken, install_interrupt_handler};

use anyhow::Context;
use clap::{ArgAction, Parser};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{info, warn};

const DEFAULT_CONFIG_FILE: &str = "crashhunt.toml";

/// Exit status when a stop condition ended the hunt without a crash.
const EXIT_STOPPED: u8 = 2;
const EXIT_ABORTED: u8 = 1;

/// Run a target over and over with a scripted conversation until it crashes.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (defaults to ./crashhunt.toml when present).
    #[clap(short, long = "config", value_parser)]
    config_file: Option<PathBuf>,
    /// Script step, repeatable and run in order: `expect:<text>` or `send:<text>`.
    /// Text accepts \n, \r, \t, \\, \0 and \xNN escapes.
    #[clap(short = 's', long = "step")]
    steps: Vec<String>,
    #[clap(short = 'n', long)]
    max_attempts: Option<u64>,
    #[clap(long)]
    deadline_secs: Option<u64>,
    /// Kill and retry an attempt that runs longer than this.
    #[clap(long)]
    timeout_ms: Option<u64>,
    /// Give up on a marker that does not show up within this long.
    #[clap(long)]
    read_timeout_ms: Option<u64>,
    /// Signal that counts as a crash, repeatable (default SIGSEGV).
    #[clap(long = "fault-signal")]
    fault_signals: Vec<String>,
    /// Read exit codes above 128 as `128 + signal` (target runs behind a shell).
    #[clap(long)]
    shell_wrapped: bool,
    /// Print the crash evidence as one JSON line on stdout.
    #[clap(long)]
    json: bool,
    /// Print a progress line every N attempts, 0 to disable.
    #[clap(long)]
    progress_interval: Option<u64>,
    #[clap(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// Target command and its arguments, after `--`.
    #[clap(last = true)]
    target_command: Vec<String>,
}

fn load_config(path: Option<&Path>) -> Result<HuntConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!(?config_path, "loading configuration");
            Ok(HuntConfig::load_from_file(config_path)?)
        }
        None => {
            let default_config_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                info!(?default_config_path, "no config file specified, loading default");
                Ok(HuntConfig::load_from_file(&default_config_path)?)
            } else {
                info!("no config file found, using built-in defaults");
                Ok(HuntConfig::default())
            }
        }
    }
}

fn apply_overrides(config: &mut HuntConfig, cli: &Cli) {
    if !cli.target_command.is_empty() {
        config.target.command = cli.target_command.clone();
    }
    if cli.shell_wrapped {
        config.target.status_convention = StatusConvention::ShellWrapped;
    }
    if let Some(max) = cli.max_attempts {
        config.hunt.max_attempts = Some(max);
    }
    if let Some(secs) = cli.deadline_secs {
        config.hunt.deadline_secs = Some(secs);
    }
    if !cli.fault_signals.is_empty() {
        config.hunt.fault_signals = cli.fault_signals.clone();
    }
    if let Some(interval) = cli.progress_interval {
        config.hunt.progress_interval = interval;
    }
    if let Some(ms) = cli.timeout_ms {
        config.limits.attempt_timeout_ms = Some(ms);
    }
    if let Some(ms) = cli.read_timeout_ms {
        config.limits.read_timeout_ms = Some(ms);
    }
}

fn main() -> Result<ExitCode, anyhow::Error> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = load_config(cli.config_file.as_deref())?;
    apply_overrides(&mut config, &cli);

    let mut target = config
        .target_spec()
        .context("No target command: pass one after `--` or set target.command")?;
    if !cli.steps.is_empty() {
        target.script = cli
            .steps
            .iter()
            .map(|s| Step::parse(s))
            .collect::<Result<_, _>>()?;
    }
    let oracle = CrashOracle::with_signals(config.fault_signals()?);

    if let Err(e) = install_interrupt_handler() {
        warn!(error = %e, "could not install interrupt handlers");
    }
    let stop = StopConditions {
        max_attempts: config.hunt.max_attempts,
        deadline: config.deadline(),
        cancel: CancelToken::watching_interrupts(),
    };

    let executor = CommandExecutor::new(config.executor_config());
    let mut hunter = CrashHunter::new(executor, oracle, stop);
    hunter = if cli.json {
        hunter
            .with_observer(Box::new(JsonObserver::new()))
            .with_observer(Box::new(ConsoleObserver::with_writers(
                Box::new(std::io::stderr()),
                Box::new(std::io::stderr()),
                config.hunt.progress_interval,
            )))
    } else {
        hunter.with_observer(Box::new(ConsoleObserver::new(
            config.hunt.progress_interval,
        )))
    };

    let outcome = hunter.run(&target);
    let ledger = hunter.executor().ledger();
    info!(
        attempts = hunter.attempts(),
        spawned = ledger.spawned(),
        released = ledger.released(),
        "hunt finished"
    );

    Ok(match outcome {
        HuntOutcome::CrashFound(_) => ExitCode::SUCCESS,
        HuntOutcome::Aborted { .. } => ExitCode::from(EXIT_ABORTED),
        HuntOutcome::Stopped { .. } => ExitCode::from(EXIT_STOPPED),
    })
}
