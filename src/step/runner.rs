//! Child-process runner shared by every pipeline step.
//!
//! Two reader threads split stdout/stderr on `\r` and `\n` (most tools redraw
//! their progress line with a bare carriage return) and feed one FIFO line
//! channel. A monitor thread owns the step's `ProgressGate`, turns lines into
//! `StepEvent`s and reaps the child once both streams close.

use std::io::{ErrorKind, Read};
use std::panic::{self, AssertUnwindSafe};
use std::process::{Child, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::AppError;
use crate::progress::{JobUpdate, OutputParser, ParseOutcome, ProgressEvent, ProgressGate};
use crate::tools::{Invocation, Tool};

/// Minimum interval between forwarded progress events.
const PROGRESS_EMIT_INTERVAL: Duration = Duration::from_millis(150);
/// Keep only the last N bytes of tool output for error reports.
const MAX_TAIL_BYTES: usize = 64 * 1024;
const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Completed | StepState::Failed | StepState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded,
    /// Non-zero exit. `diagnostic` is the last unparsed output line.
    Failed { code: i32, diagnostic: String },
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    Progress(ProgressEvent),
    Update(JobUpdate),
    /// Always the last event on the channel.
    Finished(StepOutcome),
}

#[derive(Default)]
struct Process {
    child: Option<Child>,
    monitor: Option<thread::JoinHandle<()>>,
}

struct Shared {
    state: Mutex<StepState>,
    process: Mutex<Process>,
    cancelled: AtomicBool,
}

/// Runs one invocation at a time. Clones share the same process, so a clone
/// handed to another thread can `stop()` a step that is being awaited elsewhere.
#[derive(Clone)]
pub struct StepRunner {
    shared: Arc<Shared>,
}

impl Default for StepRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl StepRunner {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StepState::Idle),
                process: Mutex::new(Process::default()),
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> StepState {
        *self.shared.state.lock()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// Launches the child and returns the step's event channel.
    ///
    /// Fails without starting anything when a child is already running or the
    /// runner was stopped. A spawn failure leaves the runner `Failed`.
    pub fn start(
        &self,
        invocation: &Invocation,
        parser: Box<dyn OutputParser>,
    ) -> Result<Receiver<StepEvent>, AppError> {
        let mut process = self.shared.process.lock();
        {
            let mut state = self.shared.state.lock();
            if *state == StepState::Running {
                return Err(AppError::AlreadyRunning(format!(
                    "{} is already running",
                    invocation.tool
                )));
            }
            if self.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            *state = StepState::Running;
        }

        log::info!(
            target: "vidconvert::step::runner",
            "start parameter: {}",
            invocation.display()
        );

        let spawned = invocation.command().and_then(|mut cmd| cmd.spawn());
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                *self.shared.state.lock() = StepState::Failed;
                log::error!(
                    target: "vidconvert::step::runner",
                    "Failed to start {} ({}): {}",
                    invocation.tool,
                    invocation.program.display(),
                    e
                );
                return Err(AppError::Launch {
                    tool: invocation.tool.to_string(),
                    message: e.to_string(),
                });
            }
        };

        let (line_tx, line_rx) = unbounded::<String>();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(read_lines(stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(read_lines(stderr, line_tx.clone()));
        }
        drop(line_tx);

        let (event_tx, event_rx) = unbounded();
        let monitor = Monitor {
            shared: Arc::clone(&self.shared),
            tool: invocation.tool,
            gate: ProgressGate::new(parser),
            started: Instant::now(),
            events: event_tx,
        };
        process.child = Some(child);
        process.monitor = Some(thread::spawn(move || monitor.run(line_rx, readers)));
        Ok(event_rx)
    }

    /// Kills the child if one is alive and waits until it has been reaped.
    ///
    /// Safe to call repeatedly, concurrently with the monitor, and before `start`.
    /// A runner that already finished keeps its terminal state.
    pub fn stop(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        let (child, monitor) = {
            let mut process = self.shared.process.lock();
            (process.child.take(), process.monitor.take())
        };
        if let Some(mut child) = child {
            log::info!(
                target: "vidconvert::step::runner",
                "Terminating child process {}",
                child.id()
            );
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = monitor {
            let _ = handle.join();
        }
        let mut state = self.shared.state.lock();
        if !state.is_terminal() {
            *state = StepState::Cancelled;
        }
    }

    /// Blocks until the monitor thread has delivered `Finished`.
    pub fn join(&self) {
        let monitor = self.shared.process.lock().monitor.take();
        if let Some(handle) = monitor {
            let _ = handle.join();
        }
    }
}

struct Monitor {
    shared: Arc<Shared>,
    tool: Tool,
    gate: ProgressGate,
    started: Instant,
    events: Sender<StepEvent>,
}

impl Monitor {
    fn run(mut self, lines: Receiver<String>, readers: Vec<thread::JoinHandle<()>>) {
        let mut tail: Vec<u8> = Vec::new();
        let mut last_diagnostic = String::new();
        let mut last_emit = self.started;
        let mut last_percent = 0.0_f64;

        for line in lines.iter() {
            tail.extend_from_slice(line.as_bytes());
            tail.push(b'\n');
            if tail.len() > MAX_TAIL_BYTES {
                let excess = tail.len() - MAX_TAIL_BYTES;
                tail.drain(..excess);
            }
            let elapsed = self.started.elapsed();
            let parsed = panic::catch_unwind(AssertUnwindSafe(|| self.gate.feed(&line, elapsed)));
            let parsed = parsed.unwrap_or_else(|_| {
                log::warn!(
                    target: "vidconvert::step::runner",
                    "{}: output parser panicked, line skipped: {}",
                    self.tool,
                    line
                );
                ParseOutcome::Ignored
            });
            match parsed {
                ParseOutcome::Progress(event) => {
                    let now = Instant::now();
                    let should_emit = now.duration_since(last_emit) >= PROGRESS_EMIT_INTERVAL
                        || (event.percent - last_percent).abs() >= 1.0
                        || event.percent >= 100.0;
                    if should_emit {
                        last_emit = now;
                        last_percent = event.percent;
                        let _ = self.events.send(StepEvent::Progress(event));
                    }
                }
                ParseOutcome::Update(update) => {
                    let _ = self.events.send(StepEvent::Update(update));
                }
                ParseOutcome::Log(text) => {
                    log::info!(target: "vidconvert::step::runner", "{}: {}", self.tool, text);
                    last_diagnostic = text;
                }
                ParseOutcome::Ignored => {}
            }
        }
        for reader in readers {
            let _ = reader.join();
        }

        let child = self.shared.process.lock().child.take();
        let status = match child {
            Some(mut child) => child.wait().ok(),
            None => None,
        };
        let outcome = self.outcome(status, last_diagnostic, &tail);
        *self.shared.state.lock() = match outcome {
            StepOutcome::Succeeded => StepState::Completed,
            StepOutcome::Failed { .. } => StepState::Failed,
            StepOutcome::Cancelled => StepState::Cancelled,
        };
        let _ = self.events.send(StepEvent::Finished(outcome));
    }

    fn outcome(&self, status: Option<ExitStatus>, diagnostic: String, tail: &[u8]) -> StepOutcome {
        if self.shared.cancelled.load(Ordering::SeqCst) {
            log::info!(target: "vidconvert::step::runner", "{} was stopped", self.tool);
            return StepOutcome::Cancelled;
        }
        let Some(status) = status else {
            log::warn!(
                target: "vidconvert::step::runner",
                "{} process was terminated externally",
                self.tool
            );
            return StepOutcome::Cancelled;
        };
        let code = status.code().unwrap_or(-1);
        log::info!(
            target: "vidconvert::step::runner",
            "{} exited with code {} after {:.1}s",
            self.tool,
            code,
            self.started.elapsed().as_secs_f64()
        );
        if status.success() {
            return StepOutcome::Succeeded;
        }
        let tail = String::from_utf8_lossy(tail);
        let preview = tail.lines().rev().take(3).collect::<Vec<_>>().join("; ");
        log::error!(
            target: "vidconvert::step::runner",
            "{} failed (code={}): {}",
            self.tool,
            code,
            preview
        );
        StepOutcome::Failed {
            code,
            diagnostic,
        }
    }
}

fn read_lines<R: Read + Send + 'static>(
    mut reader: R,
    lines: Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut chunk = [0u8; READ_CHUNK];
        let mut pending: Vec<u8> = Vec::with_capacity(256);
        let flush = |pending: &mut Vec<u8>| -> bool {
            if pending.is_empty() {
                return true;
            }
            let line = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            lines.send(line).is_ok()
        };
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            for &byte in &chunk[..n] {
                if byte == b'\n' || byte == b'\r' {
                    if !flush(&mut pending) {
                        return;
                    }
                } else {
                    pending.push(byte);
                }
            }
        }
        flush(&mut pending);
    })
}
