//! Source indexing for the FFMS2 script source and automatic crop detection.

use std::path::PathBuf;

use super::{PipelineStep, StepContext};
use crate::error::AppError;
use crate::job::{CropRect, EncodingStep, Job};
use crate::progress::{CropDetectParser, JobUpdate, OutputParser, PercentParser};
use crate::tools::{Invocation, Tool, null_device, path_to_string};

fn video_input(job: &Job) -> PathBuf {
    job.video_stream
        .temp_file
        .clone()
        .unwrap_or_else(|| job.source_file().to_path_buf())
}

/// Builds the `.ffindex` cache the filter script's `FFVideoSource` reads.
#[derive(Default)]
pub struct IndexVideoStep {
    index: Option<PathBuf>,
}

impl IndexVideoStep {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineStep for IndexVideoStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::IndexVideo
    }

    fn tool(&self) -> Tool {
        Tool::FfmsIndex
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let input = video_input(job);
        let index = PathBuf::from(format!("{}.ffindex", path_to_string(&input)));
        job.add_temp_file(&index);
        self.index = Some(index);
        Ok(Invocation::new(Tool::FfmsIndex, ctx.program(Tool::FfmsIndex)?)
            .args(["-f", "-t", "-1"])
            .path_arg(&input))
    }

    fn parser(&self, _job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(PercentParser::ffms_index())
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        job.ff_index_file = self.index.take();
        Ok(())
    }
}

/// Runs ffmpeg cropdetect over the first frames and keeps the last reported rectangle.
#[derive(Default)]
pub struct CropDetectStep {
    rect: Option<CropRect>,
}

impl CropDetectStep {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Widens a detected rectangle to the full frame in each dimension where it
/// only removes the remainder of 16-pixel alignment.
pub(crate) fn normalize_crop(mut rect: CropRect, width: u32, height: u32) -> CropRect {
    if width > 0 && rect.width >= width / 16 * 16 {
        rect.width = width;
        rect.left = 0;
    }
    if height > 0 && rect.height >= height / 16 * 16 {
        rect.height = height;
        rect.top = 0;
    }
    rect
}

impl PipelineStep for CropDetectStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::GetCropRect
    }

    fn tool(&self) -> Tool {
        Tool::Ffmpeg
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        self.rect = None;
        let mut inv = Invocation::new(Tool::Ffmpeg, ctx.program(Tool::Ffmpeg)?);
        if let Some(threads) = ctx.threads() {
            inv = inv.args(["-threads".to_string(), threads.to_string()]);
        }
        Ok(inv
            .arg("-i")
            .path_arg(&video_input(job))
            .args([
                "-frames:v".to_string(),
                ctx.config.effective_crop_detect_frames().to_string(),
            ])
            .args([
                "-vf", "cropdetect", "-vcodec", "rawvideo", "-an", "-sn", "-f", "matroska", "-y",
                null_device(),
            ]))
    }

    fn parser(&self, _job: &Job, ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(CropDetectParser::new(
            ctx.config.effective_crop_detect_frames() as u64,
        ))
    }

    fn apply_update(&mut self, job: &mut Job, update: JobUpdate) {
        match update {
            JobUpdate::CropRect(rect) => self.rect = Some(rect),
            JobUpdate::FrameRate { fps } => {
                if job.video_stream.fps <= 0.0 && fps > 0.0 {
                    job.video_stream.fps = fps;
                }
            }
        }
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        let video = &mut job.video_stream;
        match self.rect.take() {
            Some(rect) => {
                let rect = normalize_crop(rect, video.width, video.height);
                log::info!(
                    target: "vidconvert::step::index",
                    "job {}: crop {}x{} at {},{}",
                    job.id,
                    rect.width,
                    rect.height,
                    rect.left,
                    rect.top
                );
                video.crop_rect = Some(rect);
            }
            None => {
                log::warn!(
                    target: "vidconvert::step::index",
                    "job {}: cropdetect reported no rectangle, keeping full frame",
                    job.id
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::EncodingProfile;
    use crate::test_support::ToolEnv;

    fn job() -> Job {
        let mut job = Job::new("/media/Movie.mkv", "/out/Movie.mkv", EncodingProfile::default());
        job.video_stream.width = 1920;
        job.video_stream.height = 1080;
        job.video_stream.temp_file = Some(PathBuf::from("/tmp/Movie.demuxed.video.mkv"));
        job
    }

    #[test]
    fn ffmsindex_writes_index_next_to_input() {
        let env = ToolEnv::new();
        let mut job = job();
        let mut step = IndexVideoStep::new();
        let inv = step.prepare(&mut job, &env.ctx()).expect("prepare");
        assert_eq!(inv.args, vec!["-f", "-t", "-1", "/tmp/Movie.demuxed.video.mkv"]);
        step.on_success(&mut job, &env.ctx()).expect("success");
        assert_eq!(
            job.ff_index_file,
            Some(PathBuf::from("/tmp/Movie.demuxed.video.mkv.ffindex"))
        );
        assert!(job.temp_files.contains(&PathBuf::from("/tmp/Movie.demuxed.video.mkv.ffindex")));
    }

    #[test]
    fn cropdetect_args_use_configured_frames() {
        let mut env = ToolEnv::new();
        env.config.crop_detect_frames = Some(250);
        env.config.thread_count = Some(4);
        let mut job = job();
        let inv = CropDetectStep::new().prepare(&mut job, &env.ctx()).expect("prepare");
        assert_eq!(
            inv.args,
            vec![
                "-threads", "4", "-i", "/tmp/Movie.demuxed.video.mkv", "-frames:v", "250", "-vf",
                "cropdetect", "-vcodec", "rawvideo", "-an", "-sn", "-f", "matroska", "-y",
                null_device(),
            ]
        );
    }

    #[test]
    fn last_rectangle_wins() {
        let env = ToolEnv::new();
        let mut job = job();
        let mut step = CropDetectStep::new();
        step.apply_update(
            &mut job,
            JobUpdate::CropRect(CropRect { width: 1904, height: 800, left: 8, top: 136 }),
        );
        step.apply_update(
            &mut job,
            JobUpdate::CropRect(CropRect { width: 1920, height: 800, left: 0, top: 140 }),
        );
        step.on_success(&mut job, &env.ctx()).expect("success");
        assert_eq!(
            job.video_stream.crop_rect,
            Some(CropRect { width: 1920, height: 800, left: 0, top: 140 })
        );
    }

    #[test]
    fn normalize_keeps_real_crops() {
        let rect = CropRect { width: 1440, height: 1072, left: 240, top: 4 };
        assert_eq!(
            normalize_crop(rect, 1920, 1080),
            CropRect { width: 1440, height: 1080, left: 240, top: 0 }
        );
    }
}
