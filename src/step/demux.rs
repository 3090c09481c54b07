//! DVD dump and stream demuxing (ffmpeg, eac3to, tsMuxeR).

use std::fs;
use std::path::{Path, PathBuf};

use super::mux::{format_fps, ts_audio_codec, ts_subtitle_codec, ts_video_codec};
use super::{PipelineStep, StepContext};
use crate::error::AppError;
use crate::job::{EncodingStep, InputType, Job, lang_or_und};
use crate::progress::{Eac3ToParser, FfmpegDemuxParser, OutputParser, PercentParser};
use crate::temp::artifact_path;
use crate::tools::{Invocation, Tool, path_to_string};

/// Extension a stream of the given format gets when extracted; unknown formats are decoded to FLAC.
pub(crate) fn demux_extension(format: &str) -> &'static str {
    match format.to_ascii_lowercase().as_str() {
        "ac-3" | "ac3" | "ac3-ex" => "ac3",
        "eac-3" | "e-ac-3" | "eac3" => "eac3",
        "dts" | "dts-es" => "dts",
        "dts-hd" | "dts-hd hr" | "dts-hd ma" => "dtshd",
        "mpeg1" | "mpeg audio" => "mp2",
        "mp3" => "mp3",
        "truehd" => "truehd",
        "aac" => "aac",
        "vorbis" => "ogg",
        "utf-8" => "srt",
        "ssa" => "ssa",
        "ass" => "ass",
        "pgs" | "vobsub" => "sup",
        _ => "flac",
    }
}

fn stream_label(kind: &str, stream_id: u32, lang: &str, ext: &str) -> String {
    format!("demuxed.{}.{}.{}.{}", kind, stream_id, lang_or_und(lang), ext)
}

/// Base for demuxed file names: the dumped copy's stem when one exists.
fn demux_base(job: &Job) -> String {
    job.temp_input
        .as_deref()
        .and_then(Path::file_stem)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| job.base_name())
}

/// Copies a DVD title to a single MPEG program stream with mplayer.
#[derive(Default)]
pub struct DumpStep {
    output: Option<PathBuf>,
}

impl DumpStep {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineStep for DumpStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::Dump
    }

    fn tool(&self) -> Tool {
        Tool::Mplayer
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let output = artifact_path(&ctx.temp_dir(), &job.base_name(), "dump.mpg");
        job.add_temp_file(&output);
        let title = job.dvd_title.unwrap_or(1);
        let inv = Invocation::new(Tool::Mplayer, ctx.program(Tool::Mplayer)?)
            .working_dir(ctx.demux_dir())
            .arg("-dvd-device")
            .path_arg(&job.input_file)
            .arg(format!("dvdnav://{}", title))
            .args(["-nocache", "-dumpstream", "-dumpfile"])
            .path_arg(&output);
        self.output = Some(output);
        Ok(inv)
    }

    fn parser(&self, _job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(PercentParser::mplayer_dump())
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        job.temp_input = self.output.take();
        Ok(())
    }
}

/// Extracts video, audio and subtitle streams with ffmpeg stream copy.
#[derive(Default)]
pub struct FfmpegDemuxStep {
    video: Option<PathBuf>,
    audio: Vec<PathBuf>,
    subtitles: Vec<PathBuf>,
}

impl FfmpegDemuxStep {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineStep for FfmpegDemuxStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::Demux
    }

    fn tool(&self) -> Tool {
        Tool::Ffmpeg
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let dir = ctx.demux_dir();
        let base = demux_base(job);
        let dvd = job.input_type == InputType::Dvd;
        let decode_to_wav = job.profile.audio.needs_wav_input();

        let mut inv = Invocation::new(Tool::Ffmpeg, ctx.program(Tool::Ffmpeg)?);
        if dvd {
            inv = inv.args([
                "-probesize",
                "2147483647",
                "-analyzeduration",
                "2147483647",
                "-fflags",
                "genpts",
            ]);
        }
        inv = inv.arg("-i").path_arg(job.source_file());

        let video = artifact_path(&dir, &base, "demuxed.video.mkv");
        let video_map = if dvd {
            format!("#0x{:X}", job.video_stream.stream_id + 479)
        } else {
            format!("0:v:{}", job.video_stream.stream_kind_id)
        };
        inv = inv
            .args(["-map".to_string(), video_map])
            .args(["-c:v", "copy", "-y"])
            .path_arg(&video);
        job.add_temp_file(&video);
        self.video = Some(video);

        self.audio.clear();
        for audio in &job.audio_streams {
            let (codec, ext) = if decode_to_wav {
                ("pcm_s16le", "wav")
            } else {
                match demux_extension(&audio.format) {
                    "flac" => ("flac", "flac"),
                    ext => ("copy", ext),
                }
            };
            let path = artifact_path(
                &dir,
                &base,
                &stream_label("audio", audio.stream_id, &audio.lang_code, ext),
            );
            let map = if dvd {
                let lower = audio.format.to_ascii_lowercase();
                let offset = if lower == "mpeg1" || lower == "mpeg2" { 256 } else { 0 };
                format!("#0x{:X}", audio.stream_id + offset)
            } else {
                format!("0:a:{}", audio.stream_kind_id)
            };
            inv = inv
                .args(["-map".to_string(), map, "-c:a".to_string(), codec.to_string()])
                .arg("-y")
                .path_arg(&path);
            self.audio.push(path);
        }

        self.subtitles.clear();
        for sub in &job.subtitle_streams {
            let path = artifact_path(
                &dir,
                &base,
                &stream_label("subtitle", sub.stream_id, &sub.lang_code, "mkv"),
            );
            let map = if dvd {
                format!("#0x{:X}", sub.stream_id)
            } else {
                format!("0:s:{}", sub.stream_kind_id)
            };
            let codec = if sub.format.eq_ignore_ascii_case("vobsub") {
                "dvd_subtitle"
            } else {
                "copy"
            };
            inv = inv
                .args(["-map".to_string(), map, "-c:s".to_string(), codec.to_string()])
                .arg("-y")
                .path_arg(&path);
            self.subtitles.push(path);
        }
        for path in self.audio.iter().chain(self.subtitles.iter()) {
            job.add_temp_file(path);
        }
        Ok(inv)
    }

    fn parser(&self, job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(FfmpegDemuxParser::new(job.video_stream.length_secs))
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        job.video_stream.temp_file = self.video.take();
        let decoded = job.profile.audio.needs_wav_input();
        for (audio, path) in job.audio_streams.iter_mut().zip(self.audio.drain(..)) {
            if decoded {
                audio.format = "pcm".to_string();
            }
            audio.temp_file = Some(path);
        }
        for (sub, path) in job.subtitle_streams.iter_mut().zip(self.subtitles.drain(..)) {
            sub.temp_file = Some(path);
            sub.raw_stream = false;
        }
        Ok(())
    }
}

/// Demuxes AVCHD / HD-DVD sources with eac3to.
#[derive(Default)]
pub struct Eac3ToDemuxStep {
    video: Option<PathBuf>,
    audio: Vec<PathBuf>,
    subtitles: Vec<PathBuf>,
}

impl Eac3ToDemuxStep {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineStep for Eac3ToDemuxStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::Demux
    }

    fn tool(&self) -> Tool {
        Tool::Eac3To
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let dir = ctx.demux_dir();
        let base = demux_base(job);
        let video = artifact_path(&dir, &base, "demuxed.video.mkv");

        let mut inv = Invocation::new(Tool::Eac3To, ctx.program(Tool::Eac3To)?)
            .path_arg(job.source_file())
            .arg(format!("{}:{}", job.video_stream.stream_id, path_to_string(&video)));

        self.audio.clear();
        for audio in &job.audio_streams {
            let path = artifact_path(
                &dir,
                &base,
                &stream_label("audio", audio.stream_id, &audio.lang_code, demux_extension(&audio.format)),
            );
            inv = inv.arg(format!("{}:{}", audio.id, path_to_string(&path)));
            self.audio.push(path);
        }
        self.subtitles.clear();
        for sub in &job.subtitle_streams {
            let path = artifact_path(
                &dir,
                &base,
                &stream_label("subtitle", sub.stream_id, &sub.lang_code, demux_extension(&sub.format)),
            );
            inv = inv.arg(format!("{}:{}", sub.id, path_to_string(&path)));
            self.subtitles.push(path);
        }

        // eac3to writes "<video stem> - Log.txt" next to the video
        let log = PathBuf::from(format!(
            "{} - Log.txt",
            path_to_string(&video.with_extension(""))
        ));
        job.add_temp_file(&video);
        job.add_temp_file(log);
        for path in self.audio.iter().chain(self.subtitles.iter()) {
            job.add_temp_file(path);
        }
        self.video = Some(video);
        Ok(inv.args(["-progressNumbers", "-no2ndpass"]))
    }

    fn parser(&self, _job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(Eac3ToParser::new())
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        job.video_stream.temp_file = self.video.take();
        for (audio, path) in job.audio_streams.iter_mut().zip(self.audio.drain(..)) {
            audio.temp_file = Some(path);
        }
        for (sub, path) in job.subtitle_streams.iter_mut().zip(self.subtitles.drain(..)) {
            sub.temp_file = Some(path);
            sub.raw_stream = true;
        }
        Ok(())
    }
}

/// Demuxes Blu-ray sources with tsMuxeR driven by a generated meta file.
#[derive(Default)]
pub struct TsMuxerDemuxStep {
    video: Option<PathBuf>,
    audio: Vec<(usize, PathBuf)>,
    subtitles: Vec<(usize, PathBuf)>,
}

impl TsMuxerDemuxStep {
    pub fn new() -> Self {
        Self::default()
    }

    fn render_meta(&mut self, job: &Job, dir: &Path, bluray_audio_pes: bool) -> String {
        let input = format!("\"{}\"", path_to_string(job.source_file()));
        let stem = job
            .source_file()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| job.base_name());
        let track_file = |id: u32, ext: &str| dir.join(format!("{}.track_{:04}.{}", stem, id, ext));

        let mut meta = String::from("MUXOPT --no-pcr-on-video-pid ");
        if bluray_audio_pes {
            meta.push_str("--new-audio-pes ");
        }
        meta.push_str("--vbr --demux --vbv-len=500\n");

        let video = &job.video_stream;
        if let Some((codec, ext)) = ts_video_codec(&video.format) {
            if codec == "V_MPEG-2" {
                meta.push_str(&format!(
                    "{}, {}, fps={}, track={}, lang=und\n",
                    codec, input, format_fps(video.fps), video.stream_id
                ));
            } else {
                meta.push_str(&format!(
                    "{}, {}, fps={}, insertSEI, contSPS, track={}, lang=und\n",
                    codec, input, format_fps(video.fps), video.stream_id
                ));
            }
            self.video = Some(track_file(video.stream_id, ext));
        }

        self.audio.clear();
        for (index, audio) in job.audio_streams.iter().enumerate() {
            let Some((codec, ext)) = ts_audio_codec(&audio.format) else {
                continue;
            };
            let delay = if audio.delay_ms != 0 {
                format!("timeshift={}ms, ", audio.delay_ms)
            } else {
                String::new()
            };
            meta.push_str(&format!(
                "{}, {}, {}track={}, lang={}\n",
                codec,
                input,
                delay,
                audio.stream_id,
                lang_or_und(&audio.lang_code)
            ));
            self.audio.push((index, track_file(audio.stream_id, ext)));
        }

        self.subtitles.clear();
        for (index, sub) in job.subtitle_streams.iter().enumerate() {
            let Some((codec, ext)) = ts_subtitle_codec(&sub.format) else {
                continue;
            };
            meta.push_str(&format!(
                "{}, {}, track={}, lang={}\n",
                codec,
                input,
                sub.stream_id,
                lang_or_und(&sub.lang_code)
            ));
            self.subtitles.push((index, track_file(sub.stream_id, ext)));
        }
        meta
    }
}

impl PipelineStep for TsMuxerDemuxStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::Demux
    }

    fn tool(&self) -> Tool {
        Tool::TsMuxer
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let dir = ctx.demux_dir();
        fs::create_dir_all(&dir)?;
        let meta = self.render_meta(job, &dir, ctx.config.effective_ts_muxer_bluray_audio_pes());
        let meta_path = artifact_path(&ctx.temp_dir(), &job.base_name(), "demux.meta");
        fs::write(&meta_path, meta)?;
        job.add_temp_file(&meta_path);
        let outputs: Vec<PathBuf> = self
            .video
            .iter()
            .cloned()
            .chain(self.audio.iter().map(|(_, p)| p.clone()))
            .chain(self.subtitles.iter().map(|(_, p)| p.clone()))
            .collect();
        for path in outputs {
            job.add_temp_file(path);
        }
        Ok(Invocation::new(Tool::TsMuxer, ctx.program(Tool::TsMuxer)?)
            .path_arg(&meta_path)
            .path_arg(&dir))
    }

    fn parser(&self, _job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(PercentParser::ts_muxer())
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        if let Some(video) = self.video.take() {
            job.video_stream.temp_file = Some(video);
        }
        for (index, path) in self.audio.drain(..) {
            if let Some(audio) = job.audio_streams.get_mut(index) {
                audio.temp_file = Some(path);
            }
        }
        for (index, path) in self.subtitles.drain(..) {
            if let Some(sub) = job.subtitle_streams.get_mut(index) {
                sub.temp_file = Some(path);
                sub.raw_stream = true;
            }
        }
        Ok(())
    }
}
