//! Queue processor: runs jobs strictly one after another on a background
//! worker thread, one step at a time, and reports everything on one event channel.
//!
//! `stop()` sets a flag and kills the running child. The worker checks the flag
//! under the same lock it uses to publish the current step's runner, so a step
//! is either never started or stopped by the caller.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::job::{EncodingStep, Job, JobId, JobStatus};
use crate::planner::JobPlanner;
use crate::progress::ProgressEvent;
use crate::script::{AviSynthScripts, FilterScriptGenerator};
use crate::step::{StepContext, StepRunner, run_step};
use crate::temp::{cleanup_job, move_output};
use crate::tools::{Tool, ToolLocator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Idle,
    Processing,
    Stopped,
}

/// Aggregated progress of the running step, its job and the whole queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueProgress {
    pub job_id: JobId,
    pub step: EncodingStep,
    pub step_percent: f64,
    pub job_percent: f64,
    pub queue_percent: f64,
    pub elapsed_secs: f64,
    pub remaining_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum QueueEvent {
    QueueStarted {
        jobs: usize,
    },
    JobStarted {
        job_id: JobId,
        input_file: PathBuf,
        output_file: PathBuf,
        steps: usize,
    },
    StepStarted {
        job_id: JobId,
        step: EncodingStep,
        tool: Tool,
        /// 1-based position in the job's plan.
        number: usize,
        total: usize,
    },
    Progress(QueueProgress),
    StepCompleted {
        job_id: JobId,
        step: EncodingStep,
        success: bool,
        exit_code: i32,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    JobCompleted {
        job_id: JobId,
        status: JobStatus,
        success: bool,
        exit_code: i32,
        completed_step: EncodingStep,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        queue_percent: f64,
    },
    JobRemoved {
        job_id: JobId,
    },
    QueueCompleted {
        stopped: bool,
        completed: usize,
        failed: usize,
        cancelled: usize,
    },
}

/// Two-level weighted progress. Values only ever grow within one queue run.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total_jobs: usize,
    jobs_done: usize,
    last_queue: f64,
    last_job: f64,
}

impl ProgressTracker {
    pub fn new(total_jobs: usize) -> Self {
        Self {
            total_jobs,
            jobs_done: 0,
            last_queue: 0.0,
            last_job: 0.0,
        }
    }

    /// Starts the next job at 0 %; the queue percentage is unaffected.
    pub fn begin_job(&mut self) {
        self.last_job = 0.0;
    }

    /// `(job_percent, queue_percent)` for a step at `step_percent` after
    /// `steps_done` of `total_steps` steps of the current job succeeded.
    pub fn step_progress(
        &mut self,
        steps_done: usize,
        total_steps: usize,
        step_percent: f64,
    ) -> (f64, f64) {
        let step_percent = if step_percent.is_finite() {
            step_percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        let job = if total_steps == 0 {
            100.0
        } else {
            ((steps_done as f64 * 100.0 + step_percent) / total_steps as f64).min(100.0)
        };
        self.last_job = self.last_job.max(job);
        (self.last_job, self.queue_percent_with(self.last_job))
    }

    /// Counts the current job as done and returns the queue percentage.
    pub fn finish_job(&mut self) -> f64 {
        self.jobs_done = (self.jobs_done + 1).min(self.total_jobs);
        self.last_job = 0.0;
        self.queue_percent_with(0.0)
    }

    pub fn queue_percent(&self) -> f64 {
        self.last_queue
    }

    fn queue_percent_with(&mut self, job_percent: f64) -> f64 {
        if self.total_jobs == 0 {
            return 100.0;
        }
        let queue = (self.jobs_done as f64 * 100.0 + job_percent) / self.total_jobs as f64;
        self.last_queue = self.last_queue.max(queue.min(100.0));
        self.last_queue
    }
}

struct Shared {
    state: Mutex<QueueState>,
    stop_requested: AtomicBool,
    current: Mutex<Option<StepRunner>>,
}

/// Sequential job queue. One instance can run several queues, one at a time.
pub struct QueueProcessor {
    config: Arc<AppConfig>,
    scripts: Arc<dyn FilterScriptGenerator>,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<Vec<Job>>>>,
}

impl QueueProcessor {
    pub fn new(config: AppConfig) -> Self {
        Self::with_scripts(config, Arc::new(AviSynthScripts::new(None)))
    }

    pub fn with_scripts(config: AppConfig, scripts: Arc<dyn FilterScriptGenerator>) -> Self {
        Self {
            config: Arc::new(config),
            scripts,
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::Idle),
                stop_requested: AtomicBool::new(false),
                current: Mutex::new(None),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> QueueState {
        *self.shared.state.lock()
    }

    pub fn is_processing(&self) -> bool {
        self.state() == QueueState::Processing
    }

    /// Starts processing `jobs` in order on a worker thread.
    ///
    /// Fails with `AlreadyRunning` while a previous queue is still processing.
    /// The returned channel ends with `QueueCompleted`.
    pub fn start(&self, jobs: Vec<Job>) -> Result<Receiver<QueueEvent>, AppError> {
        let mut worker = self.worker.lock();
        {
            let mut state = self.shared.state.lock();
            if *state == QueueState::Processing {
                return Err(AppError::AlreadyRunning(
                    "The queue is already being processed".to_string(),
                ));
            }
            self.config.ensure_work_dirs()?;
            *state = QueueState::Processing;
        }
        // a finished previous run is reaped here; its jobs were never collected
        if let Some(previous) = worker.take() {
            let _ = previous.join();
        }
        self.shared.stop_requested.store(false, Ordering::SeqCst);

        let (events, receiver) = unbounded();
        let run = QueueRun {
            config: Arc::clone(&self.config),
            scripts: Arc::clone(&self.scripts),
            shared: Arc::clone(&self.shared),
            events,
        };
        log::info!(target: "vidconvert::queue", "Processing {} job(s)", jobs.len());
        *worker = Some(thread::spawn(move || run.run(jobs)));
        Ok(receiver)
    }

    /// Requests cancellation: no further step or job starts and the running
    /// child is killed. Returns once that child is gone. Safe to call at any time.
    pub fn stop(&self) {
        let runner = {
            let current = self.shared.current.lock();
            self.shared.stop_requested.store(true, Ordering::SeqCst);
            current.clone()
        };
        if let Some(runner) = runner {
            log::info!(target: "vidconvert::queue", "Stop requested, terminating running step");
            runner.stop();
        }
    }

    /// Blocks until the worker is done and returns the jobs still visible in
    /// the queue, after the delete flags were applied. Empty when nothing ran.
    pub fn wait(&self) -> Result<Vec<Job>, AppError> {
        let handle = self.worker.lock().take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| AppError::Other("Queue worker panicked".to_string())),
            None => Ok(Vec::new()),
        }
    }
}

impl Drop for QueueProcessor {
    fn drop(&mut self) {
        if self.is_processing() {
            self.stop();
        }
    }
}

/// Everything the worker thread owns for one queue run.
struct QueueRun {
    config: Arc<AppConfig>,
    scripts: Arc<dyn FilterScriptGenerator>,
    shared: Arc<Shared>,
    events: Sender<QueueEvent>,
}

enum JobOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl QueueRun {
    fn emit(&self, event: QueueEvent) {
        // the receiver may have been dropped; processing continues regardless
        let _ = self.events.send(event);
    }

    fn stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::SeqCst)
    }

    fn run(self, jobs: Vec<Job>) -> Vec<Job> {
        let tools = ToolLocator::new(&self.config);
        let total = jobs.len();
        let mut tracker = ProgressTracker::new(total);
        let mut visible = Vec::with_capacity(total);
        let (mut completed, mut failed, mut cancelled) = (0, 0, 0);
        let mut halted = false;

        self.emit(QueueEvent::QueueStarted { jobs: total });

        let mut pending = jobs.into_iter().enumerate();
        for (index, mut job) in pending.by_ref() {
            if job.id == 0 {
                job.id = index as JobId + 1;
            }
            if self.stop_requested() {
                visible.push(job);
                break;
            }

            tracker.begin_job();
            let outcome = self.run_job(&mut job, &tools, &mut tracker);
            // a cancelled job does not count as processed
            let queue_percent = match outcome {
                JobOutcome::Cancelled => tracker.queue_percent(),
                _ => tracker.finish_job(),
            };
            self.emit(QueueEvent::JobCompleted {
                job_id: job.id,
                status: job.status,
                success: job.status == JobStatus::Completed,
                exit_code: job.exit_code,
                completed_step: job.completed_step,
                error: job.error.clone(),
                queue_percent,
            });

            let remove = match outcome {
                JobOutcome::Completed => {
                    completed += 1;
                    self.config.effective_delete_completed_jobs()
                }
                JobOutcome::Failed => {
                    failed += 1;
                    self.config.effective_delete_failed_jobs()
                }
                JobOutcome::Cancelled => {
                    cancelled += 1;
                    false
                }
            };
            if remove {
                log::debug!(target: "vidconvert::queue", "job {}: removed from queue", job.id);
                self.emit(QueueEvent::JobRemoved { job_id: job.id });
            } else {
                visible.push(job);
            }

            if matches!(outcome, JobOutcome::Failed) && self.config.effective_halt_on_error() {
                log::warn!(target: "vidconvert::queue", "Halting queue after failed job");
                halted = true;
                break;
            }
        }
        // jobs never started stay queued and visible
        visible.extend(pending.map(|(index, mut job)| {
            if job.id == 0 {
                job.id = index as JobId + 1;
            }
            job
        }));

        let stopped = self.stop_requested() || halted;
        *self.shared.state.lock() = if self.stop_requested() {
            QueueState::Stopped
        } else {
            QueueState::Idle
        };
        log::info!(
            target: "vidconvert::queue",
            "Queue finished: {} completed, {} failed, {} cancelled{}",
            completed,
            failed,
            cancelled,
            if stopped { " (stopped)" } else { "" }
        );
        self.emit(QueueEvent::QueueCompleted {
            stopped,
            completed,
            failed,
            cancelled,
        });
        visible
    }

    fn run_job(&self, job: &mut Job, tools: &ToolLocator, tracker: &mut ProgressTracker) -> JobOutcome {
        job.reset_pipeline_state();
        job.status = JobStatus::Running;
        log::info!(
            target: "vidconvert::queue",
            "job {}: {} -> {}",
            job.id,
            job.input_file.display(),
            job.output_file.display()
        );

        let planned = JobPlanner::new(&self.config, tools).plan(job);
        let plan = match planned {
            Ok(plan) => plan,
            Err(e) => {
                log::error!(target: "vidconvert::queue", "job {}: {}", job.id, e);
                self.emit(QueueEvent::JobStarted {
                    job_id: job.id,
                    input_file: job.input_file.clone(),
                    output_file: job.output_file.clone(),
                    steps: 0,
                });
                job.mark_failed(-1, e.to_string());
                return JobOutcome::Failed;
            }
        };
        self.emit(QueueEvent::JobStarted {
            job_id: job.id,
            input_file: job.input_file.clone(),
            output_file: job.output_file.clone(),
            steps: plan.len(),
        });

        let ctx = StepContext {
            config: &self.config,
            tools,
            scripts: self.scripts.as_ref(),
        };
        let total = plan.len();

        for (position, planned) in plan.steps().iter().enumerate() {
            let runner = StepRunner::new();
            {
                let mut current = self.shared.current.lock();
                if self.stop_requested() {
                    job.status = JobStatus::Cancelled;
                    job.error = Some(AppError::Cancelled.to_string());
                    break;
                }
                *current = Some(runner.clone());
            }

            let mut step = planned.build();
            self.emit(QueueEvent::StepStarted {
                job_id: job.id,
                step: step.kind(),
                tool: step.tool(),
                number: position + 1,
                total,
            });
            let job_id = job.id;
            let steps_done = job.steps_completed;
            let kind = step.kind();
            let result = run_step(step.as_mut(), job, &ctx, &runner, |progress: &ProgressEvent| {
                let (job_percent, queue_percent) =
                    tracker.step_progress(steps_done, total, progress.percent);
                self.emit(QueueEvent::Progress(QueueProgress {
                    job_id,
                    step: kind,
                    step_percent: progress.percent,
                    job_percent,
                    queue_percent,
                    elapsed_secs: progress.elapsed_secs,
                    remaining_secs: progress.remaining_secs,
                    fps: progress.fps,
                }));
            });
            *self.shared.current.lock() = None;

            self.emit(QueueEvent::StepCompleted {
                job_id: job.id,
                step: kind,
                success: result.is_ok(),
                exit_code: job.exit_code,
                error: result.as_ref().err().map(ToString::to_string),
            });
            if let Err(e) = result {
                if e.is_cancelled() {
                    log::info!(target: "vidconvert::queue", "job {}: cancelled during {}", job.id, kind);
                } else {
                    log::error!(
                        target: "vidconvert::queue",
                        "job {}: {} failed: {}",
                        job.id,
                        kind,
                        job.error.as_deref().unwrap_or("unknown error")
                    );
                }
                break;
            }
            let (job_percent, queue_percent) = tracker.step_progress(job.steps_completed, total, 0.0);
            self.emit(QueueEvent::Progress(QueueProgress {
                job_id: job.id,
                step: kind,
                step_percent: 100.0,
                job_percent,
                queue_percent,
                elapsed_secs: 0.0,
                remaining_secs: 0.0,
                fps: None,
            }));
        }

        if job.status == JobStatus::Running {
            self.finish_output(job);
        }
        if self.config.effective_delete_temporary_files() {
            let removed = cleanup_job(job);
            log::debug!(
                target: "vidconvert::queue",
                "job {}: removed {} temporary file(s)",
                job.id,
                removed
            );
        }

        match job.status {
            JobStatus::Completed => JobOutcome::Completed,
            JobStatus::Cancelled => JobOutcome::Cancelled,
            _ => JobOutcome::Failed,
        }
    }

    /// Moves a mux result written to the temp output into place and marks the job done.
    fn finish_output(&self, job: &mut Job) {
        if let Some(temp_output) = job.temp_output.clone() {
            job.next_step = EncodingStep::MoveOutFile;
            if let Err(e) = move_output(&temp_output, &job.output_file) {
                log::error!(
                    target: "vidconvert::queue",
                    "job {}: could not move {} to {}: {}",
                    job.id,
                    temp_output.display(),
                    job.output_file.display(),
                    e
                );
                job.mark_failed(-1, format!("Could not move output into place: {}", e));
                return;
            }
            job.completed_step = EncodingStep::MoveOutFile;
        }
        job.next_step = EncodingStep::Done;
        job.completed_step = EncodingStep::Done;
        job.status = JobStatus::Completed;
        log::info!(target: "vidconvert::queue", "job {}: completed", job.id);
    }
}
