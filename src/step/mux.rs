//! Final muxing into Matroska / WebM (mkvmerge), MP4 (MP4Box) and transport
//! streams or disc structures (tsMuxeR).

use std::fs;
use std::path::Path;

use super::{PipelineStep, StepContext};
use crate::error::AppError;
use crate::job::{EncodingStep, Job, OutputType, lang_or_und};
use crate::progress::{Mp4BoxParser, OutputParser, PercentParser};
use crate::temp::artifact_path;
use crate::tools::{Invocation, Tool, path_to_string};

/// tsMuxeR codec id and demux extension for a video format.
pub(crate) fn ts_video_codec(format: &str) -> Option<(&'static str, &'static str)> {
    match format {
        "VC-1" => Some(("V_MS/VFW/WVC1", "vc1")),
        "AVC" => Some(("V_MPEG4/ISO/AVC", "264")),
        "MPEG Video" | "MPEG-2" => Some(("V_MPEG-2", "mpv")),
        _ => None,
    }
}

pub(super) fn ts_audio_codec(format: &str) -> Option<(&'static str, &'static str)> {
    match format.to_ascii_lowercase().as_str() {
        "pcm" => Some(("A_LPCM", "lpcm")),
        "ac3" | "ac-3" | "eac3" | "eac-3" | "e-ac-3" | "e-ac3" | "ac3-ex" | "truehd"
        | "true-hd" | "true hd" => Some(("A_AC3", "ac3")),
        "dts" | "dts-hd" | "dts-hd hr" | "dts-hd ma" => Some(("A_DTS", "dts")),
        "mpeg audio" => Some(("A_MP3", "mp3")),
        _ => None,
    }
}

pub(super) fn ts_subtitle_codec(format: &str) -> Option<(&'static str, &'static str)> {
    match format.to_ascii_lowercase().as_str() {
        "pgs" => Some(("S_HDMV/PGS", "sup")),
        "utf-8" => Some(("S_TEXT/UTF8", "srt")),
        _ => None,
    }
}

/// Frame rate with up to three decimals and no trailing zeros (`25`, `23.976`).
pub(super) fn format_fps(fps: f64) -> String {
    let text = format!("{:.3}", fps);
    text.trim_end_matches('0').trim_end_matches('.').to_string()
}

fn ensure_parent(path: &Path) -> Result<(), AppError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn video_file(job: &Job) -> Result<&Path, AppError> {
    job.video_stream
        .temp_file
        .as_deref()
        .ok_or_else(|| AppError::Other("no video stream to mux".to_string()))
}

/// Muxes into Matroska or WebM with mkvmerge.
#[derive(Default)]
pub struct MkvMergeStep;

impl MkvMergeStep {
    pub fn new() -> Self {
        Self
    }
}

impl PipelineStep for MkvMergeStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::MuxResult
    }

    fn tool(&self) -> Tool {
        Tool::MkvMerge
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let webm = job.profile.out_format == OutputType::WebM;
        let target = job.mux_target().to_path_buf();
        ensure_parent(&target)?;

        let mut inv = Invocation::new(Tool::MkvMerge, ctx.program(Tool::MkvMerge)?)
            .working_dir(ctx.demux_dir())
            .arg("-o")
            .path_arg(&target);
        if webm {
            inv = inv.arg("--webm");
        }

        let video = &job.video_stream;
        inv = inv.args(["--language", "0:und"]);
        if video.is_raw_stream && video.fps > 0.0 {
            inv = inv.args([
                "--default-duration".to_string(),
                format!("0:{}fps", format_fps(video.fps)),
            ]);
        }
        inv = inv
            .args([
                "--default-track", "0:yes", "--forced-track", "0:yes", "-d", "0", "-A", "-S",
                "--no-global-tags", "--no-chapters", "--compression", "0:none",
            ])
            .path_arg(video_file(job)?);
        let mut tracks = 1;

        let mut default_set = false;
        for audio in &job.audio_streams {
            let Some(file) = audio.temp_file.as_deref() else {
                continue;
            };
            let default = audio.mkv_default && !default_set;
            default_set |= default;
            inv = inv.args(["--language".to_string(), format!("0:{}", lang_or_und(&audio.lang_code))]);
            if audio.delay_ms != 0 {
                inv = inv.args(["--sync".to_string(), format!("0:{}", audio.delay_ms)]);
            }
            inv = inv
                .args([
                    "--default-track",
                    if default { "0:yes" } else { "0:no" },
                    "--forced-track",
                    "0:no",
                    "-D",
                    "-a",
                    "0",
                    "-S",
                    "--no-global-tags",
                    "--no-chapters",
                    "--compression",
                    "0:none",
                ])
                .path_arg(file);
            tracks += 1;
        }

        if !webm {
            let mut default_set = false;
            for sub in job.subtitle_streams.iter().filter(|s| !s.hard_sub_into_video) {
                let Some(file) = sub.temp_file.as_deref() else {
                    continue;
                };
                let default = sub.mkv_default && !default_set;
                default_set |= default;
                inv = inv.args(["--language".to_string(), format!("0:{}", lang_or_und(&sub.lang_code))]);
                if sub.delay_ms != 0 {
                    inv = inv.args(["--sync".to_string(), format!("0:{}", sub.delay_ms)]);
                }
                inv = inv
                    .args([
                        "--default-track",
                        if default { "0:yes" } else { "0:no" },
                        "--forced-track",
                        "0:no",
                        "-s",
                        "0",
                        "-D",
                        "-A",
                        "--no-global-tags",
                        "--no-chapters",
                        "--compression",
                        "0:none",
                    ])
                    .path_arg(file);
                tracks += 1;
            }
        }

        let order = (0..tracks)
            .map(|i| format!("{}:0", i))
            .collect::<Vec<_>>()
            .join(",");
        Ok(inv.args(["--track-order".to_string(), order]))
    }

    fn parser(&self, _job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(PercentParser::mkvtoolnix(Tool::MkvMerge))
    }

    fn on_success(&mut self, _job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        Ok(())
    }
}

/// Muxes into MP4 with MP4Box.
#[derive(Default)]
pub struct Mp4BoxStep {
    imports: u32,
}

impl Mp4BoxStep {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineStep for Mp4BoxStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::MuxResult
    }

    fn tool(&self) -> Tool {
        Tool::Mp4Box
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let target = job.mux_target().to_path_buf();
        ensure_parent(&target)?;
        let video = &job.video_stream;

        let fps = if video.is_raw_stream {
            if video.fps_num > 0 && video.fps_den > 0 {
                format!(":fps={}/{}", video.fps_num, video.fps_den)
            } else if video.fps > 0.0 {
                format!(":fps={:.3}", video.fps)
            } else {
                String::new()
            }
        } else {
            String::new()
        };

        let mut inv = Invocation::new(Tool::Mp4Box, ctx.program(Tool::Mp4Box)?)
            .working_dir(ctx.demux_dir())
            .arg("-add")
            .arg(format!("{}#video{}:lang=eng", path_to_string(video_file(job)?), fps))
            .arg("-keep-sys");
        self.imports = 1;

        for audio in &job.audio_streams {
            let Some(file) = audio.temp_file.as_deref() else {
                continue;
            };
            let mut spec = format!("{}#audio:lang={}", path_to_string(file), lang_or_und(&audio.lang_code));
            if audio.delay_ms != 0 {
                spec.push_str(&format!(":delay={}", audio.delay_ms));
            }
            inv = inv.arg("-add").arg(spec).arg("-keep-sys");
            self.imports += 1;
        }

        // text and VobSub only; PGS was converted to VobSub beforehand
        for sub in &job.subtitle_streams {
            let format = sub.format.to_ascii_lowercase();
            if sub.hard_sub_into_video || !matches!(format.as_str(), "utf-8" | "vobsub") {
                continue;
            }
            let Some(file) = sub.temp_file.as_deref().filter(|f| f.exists()) else {
                continue;
            };
            let mut spec = format!("{}#lang={}", path_to_string(file), lang_or_und(&sub.lang_code));
            if sub.delay_ms != 0 {
                spec.push_str(&format!(":delay={}", sub.delay_ms));
            }
            inv = inv.arg("-add").arg(spec).arg("-keep-sys");
            self.imports += 1;
        }

        Ok(inv
            .arg("-tmp")
            .path_arg(&ctx.temp_dir())
            .args(["-v", "-new"])
            .path_arg(&target))
    }

    fn parser(&self, _job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(Mp4BoxParser::new(self.imports.max(1)))
    }

    fn on_success(&mut self, _job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        Ok(())
    }
}

/// Muxes transport streams, Blu-ray and AVCHD structures with tsMuxeR.
#[derive(Default)]
pub struct TsMuxerStep;

impl TsMuxerStep {
    pub fn new() -> Self {
        Self
    }

    fn render_meta(&self, job: &Job, bluray_audio_pes: bool) -> Result<String, AppError> {
        let out_format = job.profile.out_format;
        let mut meta = String::from("MUXOPT --no-pcr-on-video-pid ");
        if bluray_audio_pes && out_format == OutputType::BluRay {
            meta.push_str("--new-audio-pes ");
        }
        meta.push_str("--vbr ");
        match out_format {
            OutputType::BluRay => meta.push_str("--blu-ray "),
            OutputType::Avchd => meta.push_str("--avchd "),
            _ => {}
        }
        meta.push_str("--vbv-len=500\n");

        let video = &job.video_stream;
        let fps = format_fps(video.fps);
        let file = format!("\"{}\"", path_to_string(video_file(job)?));
        match ts_video_codec(&video.format) {
            Some(("V_MPEG-2", _)) => meta.push_str(&format!(
                "V_MPEG-2, {}, fps={}, track=1, lang=und\n",
                file, fps
            )),
            Some((codec, _)) => meta.push_str(&format!(
                "{}, {}, fps={}, insertSEI, contSPS, track=1, lang=und\n",
                codec, file, fps
            )),
            None => {
                return Err(AppError::Other(format!(
                    "tsMuxeR cannot mux {} video",
                    video.format
                )));
            }
        }

        for audio in &job.audio_streams {
            let Some((codec, _)) = ts_audio_codec(&audio.format) else {
                log::warn!(
                    target: "vidconvert::step::mux",
                    "job {}: skipping {} audio, not supported by tsMuxeR",
                    job.id,
                    audio.format
                );
                continue;
            };
            let Some(file) = audio.temp_file.as_deref() else {
                continue;
            };
            let delay = if audio.delay_ms != 0 {
                format!("timeshift={}ms, ", audio.delay_ms)
            } else {
                String::new()
            };
            meta.push_str(&format!(
                "{}, \"{}\", {}track=1, lang={}\n",
                codec,
                path_to_string(file),
                delay,
                lang_or_und(&audio.lang_code)
            ));
        }

        for sub in job.subtitle_streams.iter().filter(|s| !s.hard_sub_into_video) {
            let Some((codec, _)) = ts_subtitle_codec(&sub.format) else {
                continue;
            };
            let Some(file) = sub.temp_file.as_deref() else {
                continue;
            };
            let delay = if sub.delay_ms != 0 {
                format!("timeshift={}ms,", sub.delay_ms)
            } else {
                String::new()
            };
            let font = if codec == "S_TEXT/UTF8" {
                "font-name=\"Arial\",font-size=65,font-color=0xffffffff,"
            } else {
                ""
            };
            meta.push_str(&format!(
                "{}, \"{}\",{}{}bottom-offset=24,font-border=5,text-align=center,video-width={},video-height={},fps={}, track=1, lang={}\n",
                codec,
                path_to_string(file),
                delay,
                font,
                video.width,
                video.height,
                fps,
                lang_or_und(&sub.lang_code)
            ));
        }
        Ok(meta)
    }
}

impl PipelineStep for TsMuxerStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::MuxResult
    }

    fn tool(&self) -> Tool {
        Tool::TsMuxer
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let meta = self.render_meta(job, ctx.config.effective_ts_muxer_bluray_audio_pes())?;
        let dir = ctx.temp_dir();
        fs::create_dir_all(&dir)?;
        let meta_path = artifact_path(&dir, &job.base_name(), "mux.meta");
        fs::write(&meta_path, &meta)?;
        log::info!(target: "vidconvert::step::mux", "tsMuxeR meta:\n{}", meta.trim_end());
        job.add_temp_file(&meta_path);

        let target = job.mux_target().to_path_buf();
        ensure_parent(&target)?;
        Ok(Invocation::new(Tool::TsMuxer, ctx.program(Tool::TsMuxer)?)
            .path_arg(&meta_path)
            .path_arg(&target))
    }

    fn parser(&self, _job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(PercentParser::ts_muxer())
    }

    fn on_success(&mut self, _job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        Ok(())
    }
}
