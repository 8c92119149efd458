use crate::error::SpawnError;
use crate::hunt::{AttemptSummary, StopReason};
use crate::oracle::CrashEvidence;
use std::ascii::escape_default;
use std::io::Write;

/// An `Observer` is the reporting sink of a hunt.
///
/// The hunt loop notifies every observer when an attempt starts and finishes,
/// and once more when the hunt reaches a terminal state. Observer failures are
/// logged by the loop and never change the hunt's outcome.
///
/// Every hook has a no-op default so sinks only implement what they report.
pub trait Observer: Send {
    /// Static name used in log messages.
    fn name(&self) -> &'static str;

    fn pre_attempt(&mut self, _attempt: u64) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn post_attempt(&mut self, _summary: &AttemptSummary) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Called once with the evidence of the crashing attempt.
    fn on_crash(&mut self, _evidence: &CrashEvidence) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Called once when the target could not be spawned.
    fn on_abort(&mut self, _attempt: u64, _error: &SpawnError) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Called once when a stop condition ended the hunt without a crash.
    fn on_stop(&mut self, _attempts: u64, _reason: StopReason) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// Observer that reports nothing.
#[derive(Default, Debug, Clone, Copy)]
pub struct NoOpObserver;

impl Observer for NoOpObserver {
    fn name(&self) -> &'static str {
        "NoOpObserver"
    }
}

/// Renders bytes with every non-printable byte escaped.
pub fn escape_bytes(bytes: &[u8]) -> String {
    let mut visible = String::with_capacity(bytes.len());
    for &b in bytes {
        for c in escape_default(b) {
            visible.push(c as char);
        }
    }
    visible
}

/// Human-readable report: the crash on `out`, optional progress lines on `progress`.
pub struct ConsoleObserver {
    out: Box<dyn Write + Send>,
    progress: Box<dyn Write + Send>,
    /// Print a progress line every this many attempts. Zero disables it.
    progress_interval: u64,
}

impl ConsoleObserver {
    pub fn new(progress_interval: u64) -> Self {
        Self::with_writers(
            Box::new(std::io::stdout()),
            Box::new(std::io::stderr()),
            progress_interval,
        )
    }

    pub fn with_writers(
        out: Box<dyn Write + Send>,
        progress: Box<dyn Write + Send>,
        progress_interval: u64,
    ) -> Self {
        Self {
            out,
            progress,
            progress_interval,
        }
    }
}

impl Observer for ConsoleObserver {
    fn name(&self) -> &'static str {
        "ConsoleObserver"
    }

    fn post_attempt(&mut self, summary: &AttemptSummary) -> Result<(), anyhow::Error> {
        if self.progress_interval > 0 && summary.attempt % self.progress_interval == 0 {
            write!(self.progress, "\rAttempts: {}   ", summary.attempt)?;
            self.progress.flush()?;
        }
        Ok(())
    }

    fn on_crash(&mut self, evidence: &CrashEvidence) -> Result<(), anyhow::Error> {
        if self.progress_interval > 0 {
            writeln!(self.progress)?;
        }
        writeln!(
            self.out,
            "{} on attempt {}!",
            evidence.signal_name, evidence.attempt
        )?;
        writeln!(
            self.out,
            "Output ({} bytes{}, md5 {}):",
            evidence.output.len(),
            if evidence.output_truncated { ", truncated" } else { "" },
            evidence.output_hash
        )?;
        writeln!(self.out, "b\"{}\"", escape_bytes(&evidence.output))?;
        self.out.flush()?;
        Ok(())
    }

    fn on_abort(&mut self, attempt: u64, error: &SpawnError) -> Result<(), anyhow::Error> {
        writeln!(self.progress, "Aborted on attempt {attempt}: {error}")?;
        Ok(())
    }

    fn on_stop(&mut self, attempts: u64, reason: StopReason) -> Result<(), anyhow::Error> {
        writeln!(
            self.progress,
            "\nStopped after {attempts} attempts without a crash ({reason})"
        )?;
        Ok(())
    }
}

/// Emits the crash evidence as a single JSON line.
pub struct JsonObserver {
    out: Box<dyn Write + Send>,
}

impl JsonObserver {
    pub fn new() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }
}

impl Default for JsonObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for JsonObserver {
    fn name(&self) -> &'static str {
        "JsonObserver"
    }

    fn on_crash(&mut self, evidence: &CrashEvidence) -> Result<(), anyhow::Error> {
        let line = serde_json::json!({
            "attempt": evidence.attempt,
            "signal": evidence.signal,
            "signal_name": evidence.signal_name,
            "script_completed": evidence.script_completed,
            "output": escape_bytes(&evidence.output),
            "output_len": evidence.output.len(),
            "output_truncated": evidence.output_truncated,
            "output_md5": evidence.output_hash,
        });
        serde_json::to_writer(&mut self.out, &line)?;
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SIGSEGV;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn text(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn escape_bytes_escapes_non_printables() {
        assert_eq!(escape_bytes(b"ok\n\x00\xff"), "ok\\n\\x00\\xff");
        assert_eq!(escape_bytes(b""), "");
    }

    #[test]
    fn console_observer_reports_crash() {
        let out = SharedBuf::default();
        let progress = SharedBuf::default();
        let mut observer =
            ConsoleObserver::with_writers(Box::new(out.clone()), Box::new(progress.clone()), 0);
        let evidence = CrashEvidence::new(10, SIGSEGV, b"partial\n".to_vec(), false);
        observer.on_crash(&evidence).unwrap();

        let text = out.text();
        assert!(text.contains("SIGSEGV on attempt 10!"), "got: {text}");
        assert!(text.contains("b\"partial\\n\""), "got: {text}");
        assert!(progress.text().is_empty());
        assert!(!text.contains("truncated"), "got: {text}");
    }

    #[test]
    fn console_observer_flags_truncated_output() {
        let out = SharedBuf::default();
        let mut observer = ConsoleObserver::with_writers(
            Box::new(out.clone()),
            Box::new(SharedBuf::default()),
            0,
        );
        let evidence =
            CrashEvidence::new(1, SIGSEGV, vec![b'y'; 4], true).with_output_truncated(true);
        observer.on_crash(&evidence).unwrap();
        assert!(out.text().contains("Output (4 bytes, truncated, md5"));
    }

    #[test]
    fn json_observer_writes_one_line() {
        let out = SharedBuf::default();
        let mut observer = JsonObserver::with_writer(Box::new(out.clone()));
        let evidence = CrashEvidence::new(3, SIGSEGV, b"x".to_vec(), true);
        observer.on_crash(&evidence).unwrap();

        let text = out.text();
        assert_eq!(text.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["attempt"], 3);
        assert_eq!(value["signal_name"], "SIGSEGV");
        assert_eq!(value["output"], "x");
        assert_eq!(value["output_truncated"], false);
    }
}
