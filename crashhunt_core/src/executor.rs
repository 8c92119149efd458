use crate::cancel::CancelToken;
use crate::error::{AttemptError, SpawnError};
use crate::outcome::{StatusConvention, TerminationOutcome};
use crate::script::{Step, TargetSpec, search_bytes};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};
use wait_timeout::ChildExt;

/// Granularity of every blocking wait; cancellation and timeouts are checked between slices.
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_CHUNK_SIZE: usize = 4096;

/// How far a scripted interaction got.
///
/// Everything except `Completed` ends the script early, but none of them is an
/// error: a target that dies mid-conversation is exactly what the hunt wants
/// to see. `step` is the index of the step that could not finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    Completed,
    /// Output closed or the target exited while waiting for a marker.
    StreamClosed { step: usize },
    ReadTimedOut { step: usize },
    BufferLimitExceeded { step: usize, buffered: usize },
    /// Writing a line to stdin failed (usually a broken pipe).
    WriteFailed { step: usize, error: String },
    Cancelled { step: usize },
}

impl ScriptOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, ScriptOutcome::Completed)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScriptOutcome::Cancelled { .. })
    }
}

/// One live target process, exclusively owned by the attempt that spawned it.
pub trait AttemptHandle {
    fn pid(&self) -> u32;

    /// Runs the interaction script in order. Returns early, without error,
    /// when the target stops talking.
    fn run_script(&mut self, script: &[Step], cancel: &CancelToken) -> ScriptOutcome;

    /// Blocks until the target is reaped and returns the normalized outcome.
    fn wait(&mut self, cancel: &CancelToken) -> Result<TerminationOutcome, AttemptError>;

    /// Everything still buffered or in flight from the target's output.
    fn drain(&mut self) -> Vec<u8>;

    /// Whether output was discarded because the attempt hit its buffer cap.
    fn output_truncated(&self) -> bool {
        false
    }

    /// Closes the streams and reaps the process. Consumes the handle.
    fn release(self)
    where
        Self: Sized;
}

/// Launches targets. The hunt loop only ever talks to this seam.
pub trait Executor {
    type Handle: AttemptHandle;

    fn spawn(&mut self, target: &TargetSpec) -> Result<Self::Handle, SpawnError>;
}

/// Counts spawned and released handles so leaks are observable.
#[derive(Debug, Clone, Default)]
pub struct HandleLedger {
    spawned: Arc<AtomicU64>,
    released: Arc<AtomicU64>,
}

impl HandleLedger {
    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    pub fn open(&self) -> u64 {
        self.spawned().saturating_sub(self.released())
    }

    pub fn record_spawn(&self) {
        self.spawned.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandExecutorConfig {
    /// Upper bound on a single marker read. `None` waits for the stream to close.
    pub read_timeout: Option<Duration>,
    /// Upper bound on the whole attempt, measured from spawn.
    pub attempt_timeout: Option<Duration>,
    /// How long `drain` keeps collecting after the target died.
    pub drain_timeout: Duration,
    /// Cap on target output held for one attempt, unmatched buffer plus
    /// anything in flight. Output past the cap is read and discarded.
    pub max_buffered_bytes: Option<usize>,
    pub status_convention: StatusConvention,
}

impl Default for CommandExecutorConfig {
    fn default() -> Self {
        Self {
            read_timeout: None,
            attempt_timeout: None,
            drain_timeout: Duration::from_millis(500),
            max_buffered_bytes: Some(16 * 1024 * 1024),
            status_convention: StatusConvention::Native,
        }
    }
}

pub struct CommandExecutor {
    config: CommandExecutorConfig,
    ledger: HandleLedger,
}

impl CommandExecutor {
    pub fn new(config: CommandExecutorConfig) -> Self {
        Self {
            config,
            ledger: HandleLedger::default(),
        }
    }

    pub fn ledger(&self) -> &HandleLedger {
        &self.ledger
    }
}

impl Executor for CommandExecutor {
    type Handle = ProcessHandle;

    fn spawn(&mut self, target: &TargetSpec) -> Result<ProcessHandle, SpawnError> {
        let mut cmd = Command::new(&target.program);
        cmd.args(&target.args);
        if let Some(cwd) = &target.working_dir {
            cmd.current_dir(cwd);
        }
        // Own process group, so release can take down whatever the target forked.
        cmd.process_group(0)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| {
            let err = SpawnError {
                command: target.display_command(),
                source,
            };
            error!(%err, "spawn failed");
            err
        })?;
        self.ledger.record_spawn();

        // stdout and stderr feed one channel, in arrival order.
        let (tx, rx) = mpsc::channel();
        let budget = Arc::new(OutputBudget::new(self.config.max_buffered_bytes));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, tx.clone(), Arc::clone(&budget)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, tx, Arc::clone(&budget)));
        }

        debug!(pid = child.id(), command = %target.display_command(), "target spawned");
        Ok(ProcessHandle {
            stdin: child.stdin.take(),
            child,
            output: Some(rx),
            readers,
            budget,
            buffer: Vec::new(),
            status: None,
            spawned_at: Instant::now(),
            config: self.config,
            ledger: self.ledger.clone(),
            released: false,
        })
    }
}

/// Bytes one attempt holds in memory, shared by both reader threads and the handle.
#[derive(Debug)]
struct OutputBudget {
    limit: Option<usize>,
    held: AtomicUsize,
    truncated: AtomicBool,
    closed: AtomicBool,
}

impl OutputBudget {
    fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            held: AtomicUsize::new(0),
            truncated: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Reserves room for `len` bytes and returns how many of them may be kept.
    fn claim(&self, len: usize) -> usize {
        let Some(limit) = self.limit else {
            return len;
        };
        let mut granted = 0;
        let _ = self
            .held
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                granted = len.min(limit.saturating_sub(held));
                Some(held + granted)
            });
        if granted < len {
            self.truncated.store(true, Ordering::SeqCst);
        }
        granted
    }

    /// Returns room taken by bytes a marker match consumed.
    fn release(&self, len: usize) {
        if self.limit.is_some() {
            let _ = self
                .held
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                    Some(held.saturating_sub(len))
                });
        }
    }

    fn is_exhausted(&self) -> bool {
        self.limit
            .is_some_and(|limit| self.held.load(Ordering::SeqCst) >= limit)
    }

    fn is_truncated(&self) -> bool {
        self.truncated.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut stream: R,
    tx: Sender<Vec<u8>>,
    budget: Arc<OutputBudget>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if budget.is_closed() {
                        break;
                    }
                    // Past the cap the pipe is still drained so the target never blocks.
                    let keep = budget.claim(n);
                    if keep > 0 && tx.send(chunk[..keep].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "target output stream read failed");
                    break;
                }
            }
        }
    })
}

pub struct ProcessHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    /// `None` once both output streams closed or the handle was drained.
    output: Option<Receiver<Vec<u8>>>,
    readers: Vec<JoinHandle<()>>,
    budget: Arc<OutputBudget>,
    /// Output read but not yet consumed by a marker match.
    buffer: Vec<u8>,
    status: Option<TerminationOutcome>,
    spawned_at: Instant,
    config: CommandExecutorConfig,
    ledger: HandleLedger,
    released: bool,
}

impl ProcessHandle {
    fn expect(
        &mut self,
        step: usize,
        marker: &[u8],
        cancel: &CancelToken,
    ) -> Option<ScriptOutcome> {
        let started = Instant::now();
        let mut exited_at: Option<Instant> = None;
        // Bytes before this offset were already searched; only the tail that
        // could start a straddling match is searched again.
        let mut scanned: usize = 0;
        loop {
            let from = scanned.saturating_sub(marker.len().saturating_sub(1));
            if let Some(pos) = search_bytes(marker, &self.buffer[from..]) {
                let end = from + pos + marker.len();
                self.buffer.drain(..end);
                self.budget.release(end);
                return None;
            }
            scanned = self.buffer.len();
            if cancel.is_cancelled() {
                return Some(ScriptOutcome::Cancelled { step });
            }
            if let Some(limit) = self.config.attempt_timeout {
                if self.spawned_at.elapsed() >= limit {
                    return Some(ScriptOutcome::ReadTimedOut { step });
                }
            }
            if let Some(at) = exited_at {
                // Give in-flight output a moment to arrive after the target died.
                if at.elapsed() >= self.config.drain_timeout {
                    return Some(ScriptOutcome::StreamClosed { step });
                }
            }
            let slice = match self.config.read_timeout {
                Some(timeout) => {
                    let elapsed = started.elapsed();
                    if elapsed >= timeout {
                        return Some(ScriptOutcome::ReadTimedOut { step });
                    }
                    (timeout - elapsed).min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            let Some(rx) = &self.output else {
                return Some(ScriptOutcome::StreamClosed { step });
            };
            match rx.recv_timeout(slice) {
                Ok(chunk) => self.buffer.extend_from_slice(&chunk),
                Err(RecvTimeoutError::Timeout) => {
                    // Nothing in flight and no room left: the marker cannot arrive.
                    if self.budget.is_exhausted() {
                        return Some(ScriptOutcome::BufferLimitExceeded {
                            step,
                            buffered: self.buffer.len(),
                        });
                    }
                    if exited_at.is_none() && matches!(self.child.try_wait(), Ok(Some(_))) {
                        exited_at = Some(Instant::now());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.output = None;
                    return Some(ScriptOutcome::StreamClosed { step });
                }
            }
        }
    }

    fn send_line(&mut self, line: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin already closed"))?;
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line);
        data.push(b'\n');
        stdin.write_all(&data)?;
        stdin.flush()
    }

    /// SIGKILL to the target's whole process group. Descendants that inherited
    /// the output pipes would otherwise keep the readers alive.
    fn kill_group(&self) {
        let pgid = Pid::from_raw(self.child.id() as i32);
        match signal::killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => debug!(error = %e, "killpg failed"),
        }
    }

    fn kill_and_reap(&mut self) {
        self.kill_group();
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "kill failed, target probably already exited");
        }
        if let Err(e) = self.child.wait() {
            warn!(error = %e, "failed to reap target");
        }
    }

    fn shutdown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        drop(self.stdin.take());
        self.kill_group();
        if self.status.is_none() {
            match self.child.try_wait() {
                Ok(Some(_)) => {}
                _ => self.kill_and_reap(),
            }
        }
        self.budget.close();
        drop(self.output.take());
        self.join_readers();
        self.ledger.record_release();
        debug!(pid = self.child.id(), "handle released");
    }

    /// Joins the reader threads, waiting at most `drain_timeout` for the pipes to close.
    fn join_readers(&mut self) {
        let deadline = Instant::now() + self.config.drain_timeout;
        while !self.readers.is_empty() {
            let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.readers)
                .into_iter()
                .partition(|reader| reader.is_finished());
            for reader in finished {
                if reader.join().is_err() {
                    warn!("output reader panicked");
                }
            }
            self.readers = running;
            if self.readers.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    pid = self.child.id(),
                    readers = self.readers.len(),
                    "output still open after release, detaching readers"
                );
                self.readers.clear();
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl AttemptHandle for ProcessHandle {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn run_script(&mut self, script: &[Step], cancel: &CancelToken) -> ScriptOutcome {
        for (index, step) in script.iter().enumerate() {
            match step {
                Step::ExpectMarker(marker) => {
                    if let Some(early) = self.expect(index, marker, cancel) {
                        debug!(?early, "script ended early");
                        return early;
                    }
                }
                Step::SendLine(line) => {
                    if cancel.is_cancelled() {
                        return ScriptOutcome::Cancelled { step: index };
                    }
                    if let Err(e) = self.send_line(line) {
                        warn!(step = index, error = %e, "write to target stdin failed");
                        return ScriptOutcome::WriteFailed {
                            step: index,
                            error: e.to_string(),
                        };
                    }
                }
            }
        }
        ScriptOutcome::Completed
    }

    fn wait(&mut self, cancel: &CancelToken) -> Result<TerminationOutcome, AttemptError> {
        if let Some(outcome) = self.status {
            return Ok(outcome);
        }
        // EOF on stdin, so a target still reading input can finish.
        drop(self.stdin.take());
        loop {
            if let Some(status) = self.child.wait_timeout(POLL_INTERVAL)? {
                let outcome = self
                    .config
                    .status_convention
                    .normalize(status)
                    .ok_or(AttemptError::UndecodableStatus)?;
                self.status = Some(outcome);
                debug!(pid = self.child.id(), %outcome, "target reaped");
                return Ok(outcome);
            }
            if cancel.is_cancelled() {
                self.kill_and_reap();
                return Err(AttemptError::Cancelled);
            }
            if let Some(limit) = self.config.attempt_timeout {
                if self.spawned_at.elapsed() >= limit {
                    warn!(pid = self.child.id(), ?limit, "target timed out, killing");
                    self.kill_and_reap();
                    return Err(AttemptError::TimedOut(limit));
                }
            }
        }
    }

    fn drain(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.buffer);
        if let Some(rx) = self.output.take() {
            let deadline = Instant::now() + self.config.drain_timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    while let Ok(chunk) = rx.try_recv() {
                        out.extend_from_slice(&chunk);
                    }
                    break;
                }
                match rx.recv_timeout(remaining) {
                    Ok(chunk) => out.extend_from_slice(&chunk),
                    Err(_) => break,
                }
            }
        }
        out
    }

    fn output_truncated(&self) -> bool {
        self.budget.is_truncated()
    }

    fn release(mut self) {
        self.shutdown();
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
