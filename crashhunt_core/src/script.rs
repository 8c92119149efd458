use crate::error::ConfigError;
use std::path::PathBuf;

/// One step of the scripted conversation with the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Block until this byte sequence shows up on the target's output.
    ExpectMarker(Vec<u8>),
    /// Write these bytes followed by `\n` to the target's stdin.
    SendLine(Vec<u8>),
}

impl Step {
    pub fn expect(marker: impl AsRef<[u8]>) -> Self {
        Step::ExpectMarker(marker.as_ref().to_vec())
    }

    pub fn send_line(line: impl AsRef<[u8]>) -> Self {
        Step::SendLine(line.as_ref().to_vec())
    }

    /// Parses the command-line form of a step: `expect:<text>` or `send:<text>`.
    ///
    /// The text accepts the escapes `\n`, `\r`, `\t`, `\\`, `\0` and `\xNN`.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let (kind, text) = spec
            .split_once(':')
            .ok_or_else(|| ConfigError::InvalidStep(spec.to_string()))?;
        let bytes = unescape(text)?;
        match kind {
            "expect" => Ok(Step::ExpectMarker(bytes)),
            "send" => Ok(Step::SendLine(bytes)),
            _ => Err(ConfigError::InvalidStep(spec.to_string())),
        }
    }
}

/// Immutable description of what to run and how to talk to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub script: Vec<Step>,
}

impl TargetSpec {
    /// Builds a target from an argv-style command. The first element is the program.
    pub fn from_command(command: &[String], script: Vec<Step>) -> Result<Self, ConfigError> {
        let (program, args) = command.split_first().ok_or(ConfigError::EmptyCommand)?;
        if program.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            working_dir: None,
            script,
        })
    }

    pub fn with_working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    /// The command line as a single string, for messages.
    pub fn display_command(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        parts.join(" ")
    }
}

/// Finds the first occurrence of `needle` inside `haystack`.
pub fn search_bytes(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

pub fn unescape(text: &str) -> Result<Vec<u8>, ConfigError> {
    let mut out = Vec::with_capacity(text.len());
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let esc = bytes
            .get(i + 1)
            .ok_or_else(|| ConfigError::InvalidEscape(text.to_string()))?;
        match esc {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'0' => out.push(0),
            b'\\' => out.push(b'\\'),
            b'x' => {
                let hex = text
                    .get(i + 2..i + 4)
                    .ok_or_else(|| ConfigError::InvalidEscape(text.to_string()))?;
                let value = u8::from_str_radix(hex, 16)
                    .map_err(|_| ConfigError::InvalidEscape(text.to_string()))?;
                out.push(value);
                i += 4;
                continue;
            }
            _ => return Err(ConfigError::InvalidEscape(text.to_string())),
        }
        i += 2;
    }
    Ok(out)
}
