//! Video encoding: H.264 through ffmpeg's libx264 or the x264 CLI, MPEG-2 for DVD.

use std::fs;
use std::path::PathBuf;

use super::dvd::is_pal;
use super::{PipelineStep, StepContext};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::job::{EncodingStep, Job, Mpeg2Profile, VideoProfile, X264Mode, X264Profile};
use crate::progress::{FfmpegVideoParser, OutputParser, X264Parser};
use crate::script::target_size;
use crate::temp::artifact_path;
use crate::tools::{Invocation, Tool, null_device, path_to_string};

/// Upper bound for DVD video.
const DVD_MAX_RATE_KBPS: u32 = 9800;

/// Whether the video is read through a generated filter script. With ffmpeg
/// scaling enabled only burned-in subtitles still need one.
pub(crate) fn uses_filter_script(job: &Job, config: &AppConfig) -> bool {
    if !job.profile.wants_filter_script() && !(job.has_hard_subtitles() && !job.profile.copies_video()) {
        return false;
    }
    !config.effective_use_ffmpeg_scaling() || job.has_hard_subtitles()
}

/// Frames the encoder is expected to produce, for percent reporting.
fn expected_frames(job: &Job) -> u64 {
    let video = &job.video_stream;
    if video.frame_count > 0 {
        video.frame_count
    } else if video.length_secs > 0.0 && video.fps > 0.0 {
        (video.length_secs * video.fps).round() as u64
    } else {
        0
    }
}

/// The encoder's input: the filter script (written on first use) or the demuxed video.
fn video_source(job: &mut Job, ctx: &StepContext<'_>) -> Result<PathBuf, AppError> {
    if uses_filter_script(job, ctx.config) {
        if let Some(script) = &job.filter_script {
            return Ok(script.clone());
        }
        let dir = ctx.temp_dir();
        fs::create_dir_all(&dir)?;
        let script = ctx.scripts.generate(job, &dir)?;
        job.add_temp_file(&script);
        job.filter_script = Some(script.clone());
        return Ok(script);
    }
    Ok(job
        .video_stream
        .temp_file
        .clone()
        .unwrap_or_else(|| job.source_file().to_path_buf()))
}

/// ffmpeg filter chain used instead of a script when ffmpeg scaling is enabled.
fn ffmpeg_filters(job: &Job, ctx: &StepContext<'_>) -> Option<String> {
    if uses_filter_script(job, ctx.config) || job.profile.copies_video() {
        return None;
    }
    let video = &job.video_stream;
    let mut filters = Vec::new();
    if job.profile.deinterlace && video.interlaced {
        filters.push("yadif".to_string());
    }
    if let Some(crop) = video.crop_rect {
        if crop.width != video.width || crop.height != video.height {
            filters.push(format!(
                "crop={}:{}:{}:{}",
                crop.width, crop.height, crop.left, crop.top
            ));
        }
    }
    if let Some((width, height)) = target_size(job) {
        filters.push(format!("scale={}:{}", width, height));
    }
    (!filters.is_empty()).then(|| filters.join(","))
}

fn x264_profile(job: &Job) -> Result<&X264Profile, AppError> {
    match &job.profile.video {
        VideoProfile::X264(profile) => Ok(profile),
        _ => Err(AppError::Other("profile does not encode x264 video".to_string())),
    }
}

/// Marks the encoded stream as the job's video.
fn record_encoded(job: &mut Job, output: Option<PathBuf>, format: &str, raw: bool) {
    if let Some(output) = output {
        let video = &mut job.video_stream;
        video.temp_file = Some(output);
        video.encoded = true;
        video.is_raw_stream = raw;
        video.format = format.to_string();
    }
}

/// One libx264 pass through ffmpeg. For multi-pass modes `pass` is ffmpeg's
/// `-pass` value; the last pass writes the result.
pub struct FfmpegX264Step {
    pass: u8,
    passes: u8,
    output: Option<PathBuf>,
}

impl FfmpegX264Step {
    pub fn new(pass: u8, passes: u8) -> Self {
        Self {
            pass,
            passes,
            output: None,
        }
    }

    fn is_final(&self) -> bool {
        self.pass >= self.passes
    }
}

impl PipelineStep for FfmpegX264Step {
    fn kind(&self) -> EncodingStep {
        EncodingStep::EncodeVideo
    }

    fn tool(&self) -> Tool {
        Tool::Ffmpeg
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let source = video_source(job, ctx)?;
        let filters = ffmpeg_filters(job, ctx);
        let profile = x264_profile(job)?.clone();

        let mut inv = Invocation::new(Tool::Ffmpeg, ctx.program(Tool::Ffmpeg)?);
        if let Some(threads) = ctx.threads() {
            inv = inv.args(["-threads".to_string(), threads.to_string()]);
        }
        inv = inv.arg("-i").path_arg(&source).args(["-map", "0:v", "-vsync:v", "1"]);
        if let Some(rate) = job.video_stream.frame_rate_arg() {
            inv = inv.args(["-r:v".to_string(), rate]);
        }
        inv = inv.args(["-c:v", "libx264"]);
        if let Some(avc_profile) = &profile.profile {
            inv = inv.args(["-profile:v", avc_profile.as_str()]);
        }
        if profile.effective_preset() != "medium" {
            inv = inv.args(["-preset", profile.effective_preset()]);
        }
        if let Some(tune) = &profile.tune {
            inv = inv.args(["-tune", tune.as_str()]);
        }
        if profile.bluray_compat {
            inv = inv.args(["-bluray-compat", "1"]);
        }
        inv = match profile.mode {
            X264Mode::Abr { bitrate } => inv.args(["-b:v".to_string(), format!("{}k", bitrate)]),
            X264Mode::ConstantQuantizer { qp } => inv.args(["-qp".to_string(), qp.to_string()]),
            X264Mode::Crf { quality } => inv.args(["-crf".to_string(), quality.to_string()]),
            X264Mode::TwoPass { bitrate } | X264Mode::ThreePass { bitrate } => {
                let log = artifact_path(&ctx.temp_dir(), &job.base_name(), "x264");
                let log_name = path_to_string(&log);
                job.add_temp_file(format!("{}-0.log", log_name));
                job.add_temp_file(format!("{}-0.log.mbtree", log_name));
                inv.args([
                    "-pass".to_string(),
                    self.pass.to_string(),
                    "-b:v".to_string(),
                    format!("{}k", bitrate),
                    "-passlogfile".to_string(),
                    log_name,
                ])
            }
        };
        if let Some(filters) = filters {
            inv = inv.args(["-vf".to_string(), filters]);
        }
        inv = inv.args(["-an", "-sn"]);

        if self.is_final() {
            let output = artifact_path(&ctx.temp_dir(), &job.base_name(), "encoded.mkv");
            job.add_temp_file(&output);
            inv = inv.args(["-f", "matroska", "-y"]).path_arg(&output);
            self.output = Some(output);
        } else {
            inv = inv.args(["-f", "null", "-y", null_device()]);
        }
        Ok(inv)
    }

    fn parser(&self, job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(FfmpegVideoParser::new(expected_frames(job)))
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        if self.is_final() {
            record_encoded(job, self.output.take(), "AVC", false);
        }
        Ok(())
    }
}

/// One pass of the standalone x264 encoder, writing a raw H.264 stream.
pub struct X264CliStep {
    pass: u8,
    passes: u8,
    output: Option<PathBuf>,
}

impl X264CliStep {
    pub fn new(pass: u8, passes: u8) -> Self {
        Self {
            pass,
            passes,
            output: None,
        }
    }

    fn is_final(&self) -> bool {
        self.pass >= self.passes
    }
}

impl PipelineStep for X264CliStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::EncodeVideo
    }

    fn tool(&self) -> Tool {
        Tool::X264
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let source = video_source(job, ctx)?;
        let profile = x264_profile(job)?.clone();

        let mut inv = Invocation::new(Tool::X264, ctx.program(Tool::X264)?);
        if let Some(threads) = ctx.threads() {
            inv = inv.args(["--threads".to_string(), threads.to_string()]);
        }
        inv = inv.args(["--preset", profile.effective_preset()]);
        if let Some(tune) = &profile.tune {
            inv = inv.args(["--tune", tune.as_str()]);
        }
        if let Some(avc_profile) = &profile.profile {
            inv = inv.args(["--profile", avc_profile.as_str()]);
        }
        if profile.bluray_compat {
            inv = inv.arg("--bluray-compat");
        }
        inv = match profile.mode {
            X264Mode::Abr { bitrate } => inv.args(["--bitrate".to_string(), bitrate.to_string()]),
            X264Mode::ConstantQuantizer { qp } => inv.args(["--qp".to_string(), qp.to_string()]),
            X264Mode::Crf { quality } => inv.args(["--crf".to_string(), quality.to_string()]),
            X264Mode::TwoPass { bitrate } | X264Mode::ThreePass { bitrate } => {
                let stats = artifact_path(&ctx.temp_dir(), &job.base_name(), "stats");
                job.add_temp_file(&stats);
                job.add_temp_file(format!("{}.mbtree", path_to_string(&stats)));
                inv.args([
                    "--pass".to_string(),
                    self.pass.to_string(),
                    "--bitrate".to_string(),
                    bitrate.to_string(),
                    "--stats".to_string(),
                    path_to_string(&stats),
                ])
            }
        };
        if let Some(rate) = job.video_stream.frame_rate_arg() {
            inv = inv.args(["--fps".to_string(), rate]);
        }

        inv = inv.arg("--output");
        if self.is_final() {
            let output = artifact_path(&ctx.temp_dir(), &job.base_name(), "encoded.264");
            job.add_temp_file(&output);
            inv = inv.path_arg(&output);
            self.output = Some(output);
        } else {
            inv = inv.arg(null_device());
        }
        Ok(inv.path_arg(&source))
    }

    fn parser(&self, job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(X264Parser::new(expected_frames(job)))
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        if self.is_final() {
            record_encoded(job, self.output.take(), "AVC", true);
        }
        Ok(())
    }
}

/// DVD-compliant MPEG-2 elementary stream through ffmpeg.
#[derive(Default)]
pub struct Mpeg2Step {
    output: Option<PathBuf>,
}

impl Mpeg2Step {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineStep for Mpeg2Step {
    fn kind(&self) -> EncodingStep {
        EncodingStep::EncodeVideo
    }

    fn tool(&self) -> Tool {
        Tool::Ffmpeg
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let source = video_source(job, ctx)?;
        let filters = ffmpeg_filters(job, ctx);
        let bitrate = match &job.profile.video {
            VideoProfile::Mpeg2(Mpeg2Profile { bitrate }) => (*bitrate).min(DVD_MAX_RATE_KBPS),
            _ => return Err(AppError::Other("profile does not encode MPEG-2 video".to_string())),
        };
        let target = if is_pal(job) { "pal-dvd" } else { "ntsc-dvd" };

        let mut inv = Invocation::new(Tool::Ffmpeg, ctx.program(Tool::Ffmpeg)?);
        if let Some(threads) = ctx.threads() {
            inv = inv.args(["-threads".to_string(), threads.to_string()]);
        }
        inv = inv
            .arg("-i")
            .path_arg(&source)
            .args(["-map", "0:v", "-target", target])
            .args([
                "-b:v".to_string(),
                format!("{}k", bitrate),
                "-maxrate".to_string(),
                format!("{}k", DVD_MAX_RATE_KBPS),
                "-qmin".to_string(),
                "1".to_string(),
            ]);
        let video = &job.video_stream;
        if video.width > 0 && video.height > 0 {
            inv = inv.args([
                "-aspect".to_string(),
                format!("{:.3}", video.width as f64 / video.height as f64),
            ]);
        }
        if let Some(filters) = filters {
            inv = inv.args(["-vf".to_string(), filters]);
        }
        let output = artifact_path(&ctx.temp_dir(), &job.base_name(), "encoded.m2v");
        job.add_temp_file(&output);
        inv = inv.args(["-an", "-sn", "-f", "mpeg2video", "-y"]).path_arg(&output);
        self.output = Some(output);
        Ok(inv)
    }

    fn parser(&self, job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(FfmpegVideoParser::new(expected_frames(job)))
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        record_encoded(job, self.output.take(), "MPEG Video", true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CropRect, EncodingProfile, OutputType, SubtitleInfo};
    use crate::test_support::{ToolEnv, arg};

    fn job(mode: X264Mode) -> Job {
        let profile = EncodingProfile {
            video: VideoProfile::X264(X264Profile {
                mode,
                preset: Some("slow".to_string()),
                ..X264Profile::default()
            }),
            ..EncodingProfile::default()
        };
        let mut job = Job::new("/media/Movie.mkv", "/out/Movie.mkv", profile);
        job.video_stream.width = 1920;
        job.video_stream.height = 1080;
        job.video_stream.fps_num = 24000;
        job.video_stream.fps_den = 1001;
        job.video_stream.temp_file = Some(PathBuf::from("/tmp/Movie.demuxed.video.mkv"));
        job
    }

    #[test]
    fn crf_single_pass_writes_matroska() {
        let env = ToolEnv::new();
        let mut job = job(X264Mode::Crf { quality: 20.0 });
        let mut step = FfmpegX264Step::new(1, 1);
        let inv = step.prepare(&mut job, &env.ctx()).expect("prepare");
        let output = env.tmp().join("Movie.encoded.mkv");
        assert_eq!(
            inv.args,
            vec![
                "-i".to_string(),
                "/tmp/Movie.demuxed.video.mkv".to_string(),
                "-map".to_string(),
                "0:v".to_string(),
                "-vsync:v".to_string(),
                "1".to_string(),
                "-r:v".to_string(),
                "24000/1001".to_string(),
                "-c:v".to_string(),
                "libx264".to_string(),
                "-preset".to_string(),
                "slow".to_string(),
                "-crf".to_string(),
                "20".to_string(),
                "-an".to_string(),
                "-sn".to_string(),
                "-f".to_string(),
                "matroska".to_string(),
                "-y".to_string(),
                arg(&output),
            ]
        );
        step.on_success(&mut job, &env.ctx()).expect("success");
        assert!(job.video_stream.encoded);
        assert_eq!(job.video_stream.format, "AVC");
        assert_eq!(job.video_stream.temp_file, Some(output));
    }

    #[test]
    fn first_pass_discards_output() {
        let env = ToolEnv::new();
        let mut job = job(X264Mode::ThreePass { bitrate: 2500 });
        let mut step = FfmpegX264Step::new(1, 3);
        let inv = step.prepare(&mut job, &env.ctx()).expect("prepare");
        let line = inv.args.join(" ");
        let log = arg(&env.tmp().join("Movie.x264"));
        assert!(line.contains(&format!("-pass 1 -b:v 2500k -passlogfile {}", log)));
        assert!(line.ends_with(&format!("-f null -y {}", null_device())));
        assert!(job.temp_files.contains(&PathBuf::from(format!("{}-0.log.mbtree", log))));
        step.on_success(&mut job, &env.ctx()).expect("success");
        assert!(!job.video_stream.encoded);
    }

    #[test]
    fn last_of_three_passes_writes_the_result() {
        let env = ToolEnv::new();
        let mut job = job(X264Mode::ThreePass { bitrate: 2500 });
        let middle = FfmpegX264Step::new(2, 3).prepare(&mut job, &env.ctx()).expect("pass 2");
        let line = middle.args.join(" ");
        assert!(line.contains("-pass 2 -b:v 2500k"));
        assert!(line.ends_with(&format!("-f null -y {}", null_device())));

        let mut last = FfmpegX264Step::new(3, 3);
        let line = last.prepare(&mut job, &env.ctx()).expect("pass 3").args.join(" ");
        assert!(line.contains("-pass 3 -b:v 2500k"));
        assert!(line.contains("-f matroska -y"));
        last.on_success(&mut job, &env.ctx()).expect("success");
        assert!(job.video_stream.encoded);
    }

    #[test]
    fn filter_script_written_once() {
        let env = ToolEnv::new();
        let mut job = job(X264Mode::TwoPass { bitrate: 2000 });
        job.profile.target_width = Some(1280);
        let first = FfmpegX264Step::new(1, 2).prepare(&mut job, &env.ctx()).expect("pass 1");
        let script = env.tmp().join("Movie.avs");
        assert_eq!(first.args[1], arg(&script));
        assert!(script.is_file());
        assert_eq!(job.filter_script, Some(script.clone()));
        let second = FfmpegX264Step::new(2, 2).prepare(&mut job, &env.ctx()).expect("pass 2");
        assert_eq!(second.args[1], arg(&script));
        assert_eq!(job.temp_files.iter().filter(|p| **p == script).count(), 1);
    }

    #[test]
    fn ffmpeg_scaling_replaces_script() {
        let mut env = ToolEnv::new();
        env.config.use_ffmpeg_scaling = Some(true);
        let mut job = job(X264Mode::Abr { bitrate: 3000 });
        job.profile.target_width = Some(1280);
        job.video_stream.crop_rect = Some(CropRect { width: 1920, height: 800, left: 0, top: 140 });
        let inv = FfmpegX264Step::new(1, 1).prepare(&mut job, &env.ctx()).expect("prepare");
        let line = inv.args.join(" ");
        assert!(line.contains("-vf crop=1920:800:0:140,scale=1280:528"));
        assert!(job.filter_script.is_none());

        job.subtitle_streams.push(SubtitleInfo {
            hard_sub_into_video: true,
            format: "PGS".to_string(),
            ..SubtitleInfo::default()
        });
        assert!(uses_filter_script(&job, &env.config));
    }

    #[test]
    fn x264_cli_writes_raw_stream() {
        let env = ToolEnv::new();
        let mut job = job(X264Mode::Crf { quality: 18.5 });
        let mut step = X264CliStep::new(1, 1);
        let inv = step.prepare(&mut job, &env.ctx()).expect("prepare");
        let output = env.tmp().join("Movie.encoded.264");
        assert_eq!(
            inv.args,
            vec![
                "--preset".to_string(),
                "slow".to_string(),
                "--crf".to_string(),
                "18.5".to_string(),
                "--fps".to_string(),
                "24000/1001".to_string(),
                "--output".to_string(),
                arg(&output),
                "/tmp/Movie.demuxed.video.mkv".to_string(),
            ]
        );
        step.on_success(&mut job, &env.ctx()).expect("success");
        assert!(job.video_stream.is_raw_stream);
    }

    #[test]
    fn mpeg2_targets_dvd_standard() {
        let env = ToolEnv::new();
        let profile = EncodingProfile {
            out_format: OutputType::Dvd,
            video: VideoProfile::Mpeg2(Mpeg2Profile { bitrate: 12000 }),
            ..EncodingProfile::default()
        };
        let mut job = Job::new("/media/Movie.mkv", "/out/Movie", profile);
        job.video_stream.fps = 29.97;
        job.video_stream.width = 720;
        job.video_stream.height = 480;
        job.video_stream.temp_file = Some(PathBuf::from("/tmp/Movie.demuxed.video.mkv"));
        let inv = Mpeg2Step::new().prepare(&mut job, &env.ctx()).expect("prepare");
        let line = inv.args.join(" ");
        assert!(line.contains("-target ntsc-dvd -b:v 9800k -maxrate 9800k -qmin 1 -aspect 1.500"));
        assert!(line.ends_with(&format!("-f mpeg2video -y {}", arg(&env.tmp().join("Movie.encoded.m2v")))));
    }
}
