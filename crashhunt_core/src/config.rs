use crate::error::ConfigError;
use crate::executor::CommandExecutorConfig;
use crate::outcome::StatusConvention;
use crate::script::{Step, TargetSpec};
use crate::signal::{SIGSEGV, parse_signal};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StepSettings {
    Expect(String),
    SendLine(String),
}

impl From<&StepSettings> for Step {
    fn from(settings: &StepSettings) -> Self {
        match settings {
            StepSettings::Expect(marker) => Step::expect(marker),
            StepSettings::SendLine(line) => Step::send_line(line),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    #[serde(default)]
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub status_convention: StatusConvention,
    #[serde(default)]
    pub script: Vec<StepSettings>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HuntSettings {
    pub max_attempts: Option<u64>,
    pub deadline_secs: Option<u64>,
    #[serde(default = "default_fault_signals")]
    pub fault_signals: Vec<String>,
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

fn default_fault_signals() -> Vec<String> {
    vec!["SIGSEGV".to_string()]
}

pub fn default_progress_interval() -> u64 {
    100
}

impl Default for HuntSettings {
    fn default() -> Self {
        Self {
            max_attempts: None,
            deadline_secs: None,
            fault_signals: default_fault_signals(),
            progress_interval: default_progress_interval(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct LimitSettings {
    pub read_timeout_ms: Option<u64>,
    pub attempt_timeout_ms: Option<u64>,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    /// Output one attempt may hold in memory; 0 disables the cap.
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: Option<usize>,
}

fn default_drain_timeout_ms() -> u64 {
    500
}

fn default_max_buffered_bytes() -> Option<usize> {
    Some(16 * 1024 * 1024)
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            read_timeout_ms: None,
            attempt_timeout_ms: None,
            drain_timeout_ms: default_drain_timeout_ms(),
            max_buffered_bytes: default_max_buffered_bytes(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HuntConfig {
    #[serde(default)]
    pub target: TargetSettings,
    #[serde(default)]
    pub hunt: HuntSettings,
    #[serde(default)]
    pub limits: LimitSettings,
}

impl HuntConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn target_spec(&self) -> Result<TargetSpec, ConfigError> {
        let script = self.target.script.iter().map(Step::from).collect();
        Ok(TargetSpec::from_command(&self.target.command, script)?
            .with_working_dir(self.target.working_dir.clone()))
    }

    pub fn executor_config(&self) -> CommandExecutorConfig {
        CommandExecutorConfig {
            read_timeout: self.limits.read_timeout_ms.map(Duration::from_millis),
            attempt_timeout: self.limits.attempt_timeout_ms.map(Duration::from_millis),
            drain_timeout: Duration::from_millis(self.limits.drain_timeout_ms),
            // Zero disables the cap.
            max_buffered_bytes: self.limits.max_buffered_bytes.filter(|&cap| cap > 0),
            status_convention: self.target.status_convention,
        }
    }

    /// Resolves the configured fault signal names. An empty list means SIGSEGV.
    pub fn fault_signals(&self) -> Result<Vec<i32>, ConfigError> {
        if self.hunt.fault_signals.is_empty() {
            return Ok(vec![SIGSEGV]);
        }
        self.hunt
            .fault_signals
            .iter()
            .map(|name| parse_signal(name))
            .collect()
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.hunt.deadline_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL_CONFIG: &str = r#"
[target]
command = ["./a.out", "--quiet"]
working-dir = "/tmp"
status-convention = "shell-wrapped"

[[target.script]]
expect = "username:\n"

[[target.script]]
send-line = "aaaaaaaa"

[[target.script]]
expect = "s/n WRONG!"

[hunt]
max-attempts = 1000
deadline-secs = 60
fault-signals = ["SIGSEGV", "bus"]
progress-interval = 0

[limits]
read-timeout-ms = 2000
attempt-timeout-ms = 5000
"#;

    #[test]
    fn parses_full_config() {
        let config: HuntConfig = toml::from_str(FULL_CONFIG).unwrap();
        let target = config.target_spec().unwrap();
        assert_eq!(target.program, "./a.out");
        assert_eq!(target.args, vec!["--quiet".to_string()]);
        assert_eq!(target.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(
            target.script,
            vec![
                Step::expect("username:\n"),
                Step::send_line("aaaaaaaa"),
                Step::expect("s/n WRONG!"),
            ]
        );

        let exec = config.executor_config();
        assert_eq!(exec.read_timeout, Some(Duration::from_millis(2000)));
        assert_eq!(exec.attempt_timeout, Some(Duration::from_millis(5000)));
        assert_eq!(exec.drain_timeout, Duration::from_millis(500));
        assert_eq!(exec.status_convention, StatusConvention::ShellWrapped);

        assert_eq!(config.hunt.max_attempts, Some(1000));
        assert_eq!(config.deadline(), Some(Duration::from_secs(60)));
        assert_eq!(config.fault_signals().unwrap().len(), 2);
        assert_eq!(config.hunt.progress_interval, 0);
    }

    #[test]
    fn defaults_are_unbounded_segfault_hunt() {
        let config: HuntConfig = toml::from_str("[target]\ncommand = [\"./a.out\"]\n").unwrap();
        assert_eq!(config.hunt.max_attempts, None);
        assert_eq!(config.deadline(), None);
        assert_eq!(config.fault_signals().unwrap(), vec![SIGSEGV]);
        assert_eq!(config.target.status_convention, StatusConvention::Native);
        assert!(config.target.script.is_empty());
        assert_eq!(config.limits.max_buffered_bytes, Some(16 * 1024 * 1024));
    }

    #[test]
    fn rejects_unknown_fields_and_bad_signals() {
        assert!(toml::from_str::<HuntConfig>("[target]\ncommand = []\nbogus = 1\n").is_err());

        let config: HuntConfig =
            toml::from_str("[hunt]\nfault-signals = [\"SIGNOPE\"]\n").unwrap();
        assert!(matches!(
            config.fault_signals(),
            Err(ConfigError::UnknownSignal(_))
        ));
    }

    #[test]
    fn empty_command_is_an_error() {
        let config = HuntConfig::default();
        assert!(matches!(config.target_spec(), Err(ConfigError::EmptyCommand)));
    }

    #[test]
    fn load_from_file_reports_path_on_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL_CONFIG.as_bytes()).unwrap();
        let config = HuntConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.target.command[0], "./a.out");

        let missing = HuntConfig::load_from_file(Path::new("/nonexistent/crashhunt.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        broken.write_all(b"[target\n").unwrap();
        assert!(matches!(
            HuntConfig::load_from_file(broken.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
