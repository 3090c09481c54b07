//! Pipeline steps: one small struct per tool behind the `PipelineStep` trait,
//! all driven by the shared `StepRunner`.

mod demux;
mod dvd;
mod encode_audio;
mod encode_video;
mod index;
mod mux;
pub mod runner;
mod subtitle;

use std::path::PathBuf;

use crate::config::AppConfig;
use crate::error::{AppError, describe_tool_exit};
use crate::job::{EncodingStep, Job, JobStatus};
use crate::progress::{JobUpdate, OutputParser, ProgressEvent};
use crate::script::FilterScriptGenerator;
use crate::tools::{Invocation, Tool, ToolLocator};

pub use demux::{DumpStep, Eac3ToDemuxStep, FfmpegDemuxStep, TsMuxerDemuxStep};
pub use dvd::{DvdAuthorStep, MplexStep, SpuMuxStep};
pub use encode_audio::{AudioEncoder, EncodeAudioStep};
pub use encode_video::{FfmpegX264Step, Mpeg2Step, X264CliStep};
pub(crate) use encode_video::uses_filter_script;
pub use index::{CropDetectStep, IndexVideoStep};
pub use mux::{MkvMergeStep, Mp4BoxStep, TsMuxerStep};
pub(crate) use mux::ts_video_codec;
pub use runner::{StepEvent, StepOutcome, StepRunner, StepState};
pub use subtitle::{DemuxSubtitleStep, ProcessSubtitleStep};

/// Collaborators a step needs to build its command line.
pub struct StepContext<'a> {
    pub config: &'a AppConfig,
    pub tools: &'a ToolLocator,
    pub scripts: &'a dyn FilterScriptGenerator,
}

impl StepContext<'_> {
    pub fn temp_dir(&self) -> PathBuf {
        self.config.effective_temp_path()
    }

    pub fn demux_dir(&self) -> PathBuf {
        self.config.effective_demux_location()
    }

    pub fn program(&self, tool: Tool) -> Result<PathBuf, AppError> {
        self.tools.resolve(tool)
    }

    /// `-threads N` style value, `None` when the tool should decide.
    pub fn threads(&self) -> Option<u32> {
        match self.config.effective_thread_count() {
            0 => None,
            n => Some(n),
        }
    }
}

/// One external-tool invocation within a job's plan.
///
/// `prepare` only builds the invocation (it may write helper files such as
/// tsMuxeR meta files and registers them for cleanup); the artifacts a step
/// produces are recorded on the job in `on_success`.
pub trait PipelineStep: Send {
    fn kind(&self) -> EncodingStep;

    fn tool(&self) -> Tool;

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError>;

    fn parser(&self, job: &Job, ctx: &StepContext<'_>) -> Box<dyn OutputParser>;

    /// Structured values reported while running. The frame rate fills in a
    /// missing source rate; other updates are ignored unless a step overrides this.
    fn apply_update(&mut self, job: &mut Job, update: JobUpdate) {
        if let JobUpdate::FrameRate { fps } = update {
            if job.video_stream.fps <= 0.0 && fps > 0.0 {
                job.video_stream.fps = fps;
            }
        }
    }

    fn on_success(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<(), AppError>;
}

/// Runs one step to completion on the calling thread.
///
/// `runner` may be stopped from another thread; the step then ends `Cancelled`.
/// Every failure is also recorded on the job (status, exit code, message).
pub fn run_step(
    step: &mut dyn PipelineStep,
    job: &mut Job,
    ctx: &StepContext<'_>,
    runner: &StepRunner,
    mut on_progress: impl FnMut(&ProgressEvent),
) -> Result<(), AppError> {
    job.next_step = step.kind();
    let invocation = match step.prepare(job, ctx) {
        Ok(invocation) => invocation,
        Err(e) => return Err(record_error(job, e)),
    };
    let parser = step.parser(job, ctx);
    let events = match runner.start(&invocation, parser) {
        Ok(events) => events,
        Err(e) => return Err(record_error(job, e)),
    };
    for event in events.iter() {
        match event {
            StepEvent::Progress(progress) => on_progress(&progress),
            StepEvent::Update(update) => step.apply_update(job, update),
            StepEvent::Finished(outcome) => return complete_step(step, job, ctx, outcome),
        }
    }
    Err(record_error(
        job,
        AppError::Other(format!("{} monitor ended without an exit status", step.tool())),
    ))
}

/// Applies a step's terminal outcome to the job.
///
/// Success records the step's artifacts and advances `completed_step`; a
/// non-zero exit marks the job failed with the tool's exit code.
pub fn complete_step(
    step: &mut dyn PipelineStep,
    job: &mut Job,
    ctx: &StepContext<'_>,
    outcome: StepOutcome,
) -> Result<(), AppError> {
    match outcome {
        StepOutcome::Succeeded => {
            if let Err(e) = step.on_success(job, ctx) {
                job.mark_failed(0, e.to_string());
                return Err(e);
            }
            job.completed_step = step.kind();
            job.steps_completed += 1;
            job.exit_code = 0;
            log::debug!(
                target: "vidconvert::step",
                "job {}: {} finished ({} steps done)",
                job.id,
                step.kind(),
                job.steps_completed
            );
            Ok(())
        }
        StepOutcome::Failed { code, diagnostic } => {
            let tool = step.tool().to_string();
            let summary = describe_tool_exit(&tool, Some(code), &diagnostic).summary;
            let message = if diagnostic.trim().is_empty() {
                summary
            } else {
                format!("{} {}", summary, diagnostic.trim())
            };
            job.mark_failed(code, message);
            Err(AppError::tool_failed(tool, code, diagnostic))
        }
        StepOutcome::Cancelled => {
            job.status = JobStatus::Cancelled;
            job.error = Some(AppError::Cancelled.to_string());
            Err(AppError::Cancelled)
        }
    }
}

fn record_error(job: &mut Job, error: AppError) -> AppError {
    match &error {
        AppError::Cancelled => {
            job.status = JobStatus::Cancelled;
            job.error = Some(error.to_string());
        }
        AppError::Launch { .. } | AppError::ToolNotFound(_) => {
            job.mark_failed(-1, error.payload().summary);
        }
        _ => job.mark_failed(-1, error.to_string()),
    }
    error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::EncodingProfile;
    use crate::progress::LogOnlyParser;

    struct FakeStep {
        kind: EncodingStep,
        successes: usize,
    }

    impl PipelineStep for FakeStep {
        fn kind(&self) -> EncodingStep {
            self.kind
        }

        fn tool(&self) -> Tool {
            Tool::Ffmpeg
        }

        fn prepare(&mut self, _job: &mut Job, _ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
            Ok(Invocation::new(Tool::Ffmpeg, "ffmpeg"))
        }

        fn parser(&self, _job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
            Box::new(LogOnlyParser::new(Tool::Ffmpeg))
        }

        fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
            self.successes += 1;
            job.add_temp_file("/tmp/x.demuxed.video.mkv");
            Ok(())
        }
    }

    fn with_ctx<R>(f: impl FnOnce(&StepContext<'_>) -> R) -> R {
        let config = AppConfig::default();
        let tools = ToolLocator::new(&config);
        let scripts = crate::script::AviSynthScripts::new(None);
        let ctx = StepContext {
            config: &config,
            tools: &tools,
            scripts: &scripts,
        };
        f(&ctx)
    }

    #[test]
    fn success_advances_completed_step() {
        with_ctx(|ctx| {
            let mut job = Job::new("/in/a.mkv", "/out/a.mkv", EncodingProfile::default());
            let mut step = FakeStep {
                kind: EncodingStep::Demux,
                successes: 0,
            };
            complete_step(&mut step, &mut job, ctx, StepOutcome::Succeeded).expect("complete");
            assert_eq!(job.completed_step, EncodingStep::Demux);
            assert_eq!(job.steps_completed, 1);
            assert_eq!(step.successes, 1);
            assert_eq!(job.temp_files.len(), 1);
        });
    }

    #[test]
    fn failure_keeps_completed_step_and_sets_exit_code() {
        with_ctx(|ctx| {
            let mut job = Job::new("/in/a.mkv", "/out/a.mkv", EncodingProfile::default());
            job.completed_step = EncodingStep::Demux;
            let mut step = FakeStep {
                kind: EncodingStep::EncodeVideo,
                successes: 0,
            };
            let err = complete_step(
                &mut step,
                &mut job,
                ctx,
                StepOutcome::Failed {
                    code: 1,
                    diagnostic: "Conversion failed!".to_string(),
                },
            )
            .unwrap_err();
            assert!(matches!(err, AppError::ToolFailed { code: 1, .. }));
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.exit_code, 1);
            assert_eq!(job.completed_step, EncodingStep::Demux);
            assert_eq!(job.error.as_deref(), Some("ffmpeg failed. Conversion failed!"));
            assert_eq!(step.successes, 0);
        });
    }

    #[test]
    fn cancellation_is_not_a_failure() {
        with_ctx(|ctx| {
            let mut job = Job::new("/in/a.mkv", "/out/a.mkv", EncodingProfile::default());
            let mut step = FakeStep {
                kind: EncodingStep::Demux,
                successes: 0,
            };
            let err = complete_step(&mut step, &mut job, ctx, StepOutcome::Cancelled).unwrap_err();
            assert!(err.is_cancelled());
            assert_eq!(job.status, JobStatus::Cancelled);
            assert_eq!(job.exit_code, 0);
        });
    }

    #[test]
    fn frame_rate_update_fills_unknown_rate() {
        let mut job = Job::new("/in/a.mkv", "/out/a.mkv", EncodingProfile::default());
        let mut step = FakeStep {
            kind: EncodingStep::Demux,
            successes: 0,
        };
        step.apply_update(&mut job, JobUpdate::FrameRate { fps: 25.0 });
        step.apply_update(&mut job, JobUpdate::FrameRate { fps: 50.0 });
        assert_eq!(job.video_stream.fps, 25.0);
    }
}
