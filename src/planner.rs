//! Job planner: turns a job's profile and detected streams into the ordered
//! list of steps to run, and checks every tool they need before anything starts.

use std::fmt;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::job::{
    Ac3Profile, AudioProfile, EncodingStep, InputType, Job, OutputType, SubtitleInfo, VideoProfile,
};
use crate::step::{
    AudioEncoder, CropDetectStep, DemuxSubtitleStep, DumpStep, DvdAuthorStep, Eac3ToDemuxStep,
    EncodeAudioStep, FfmpegDemuxStep, FfmpegX264Step, IndexVideoStep, MkvMergeStep, Mp4BoxStep,
    Mpeg2Step, MplexStep, PipelineStep, ProcessSubtitleStep, SpuMuxStep, TsMuxerDemuxStep,
    TsMuxerStep, X264CliStep, ts_video_codec, uses_filter_script,
};
use crate::tools::{Tool, ToolLocator};

/// One entry of a job's plan. Subtitle and audio indices refer to the job's
/// stream lists after planning dropped the subtitles the target cannot use.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedStep {
    Dump,
    DemuxFfmpeg,
    DemuxEac3To,
    DemuxTsMuxer,
    DemuxSubtitle { index: usize },
    ProcessSubtitle { index: usize },
    IndexVideo,
    CropDetect,
    EncodeVideoFfmpeg { pass: u8, passes: u8 },
    EncodeVideoX264 { pass: u8, passes: u8 },
    EncodeMpeg2,
    EncodeAudio { index: usize, encoder: AudioEncoder },
    Mplex,
    SpuMux { index: usize },
    MuxMkv,
    MuxMp4,
    MuxTs,
    MuxDvd,
}

impl PlannedStep {
    pub fn kind(&self) -> EncodingStep {
        match self {
            PlannedStep::Dump => EncodingStep::Dump,
            PlannedStep::DemuxFfmpeg | PlannedStep::DemuxEac3To | PlannedStep::DemuxTsMuxer => {
                EncodingStep::Demux
            }
            PlannedStep::DemuxSubtitle { .. } => EncodingStep::DemuxSubtitle,
            PlannedStep::ProcessSubtitle { .. } => EncodingStep::ProcessSubtitle,
            PlannedStep::IndexVideo => EncodingStep::IndexVideo,
            PlannedStep::CropDetect => EncodingStep::GetCropRect,
            PlannedStep::EncodeVideoFfmpeg { .. }
            | PlannedStep::EncodeVideoX264 { .. }
            | PlannedStep::EncodeMpeg2 => EncodingStep::EncodeVideo,
            PlannedStep::EncodeAudio { .. } => EncodingStep::EncodeAudio,
            PlannedStep::Mplex => EncodingStep::PreMuxResult,
            PlannedStep::SpuMux { .. } => EncodingStep::PremuxSubtitle,
            PlannedStep::MuxMkv | PlannedStep::MuxMp4 | PlannedStep::MuxTs | PlannedStep::MuxDvd => {
                EncodingStep::MuxResult
            }
        }
    }

    pub fn tool(&self) -> Tool {
        match self {
            PlannedStep::Dump => Tool::Mplayer,
            PlannedStep::DemuxFfmpeg
            | PlannedStep::CropDetect
            | PlannedStep::EncodeVideoFfmpeg { .. }
            | PlannedStep::EncodeMpeg2 => Tool::Ffmpeg,
            PlannedStep::DemuxEac3To => Tool::Eac3To,
            PlannedStep::DemuxTsMuxer | PlannedStep::MuxTs => Tool::TsMuxer,
            PlannedStep::DemuxSubtitle { .. } => Tool::MkvExtract,
            PlannedStep::ProcessSubtitle { .. } => Tool::BdSup2Sub,
            PlannedStep::IndexVideo => Tool::FfmsIndex,
            PlannedStep::EncodeVideoX264 { .. } => Tool::X264,
            PlannedStep::EncodeAudio { encoder, .. } => encoder.tool(),
            PlannedStep::Mplex => Tool::Mplex,
            PlannedStep::SpuMux { .. } => Tool::SpuMux,
            PlannedStep::MuxMkv => Tool::MkvMerge,
            PlannedStep::MuxMp4 => Tool::Mp4Box,
            PlannedStep::MuxDvd => Tool::DvdAuthor,
        }
    }

    /// Fresh step instance; steps carry per-run state and are never reused.
    pub fn build(&self) -> Box<dyn PipelineStep> {
        match self {
            PlannedStep::Dump => Box::new(DumpStep::new()),
            PlannedStep::DemuxFfmpeg => Box::new(FfmpegDemuxStep::new()),
            PlannedStep::DemuxEac3To => Box::new(Eac3ToDemuxStep::new()),
            PlannedStep::DemuxTsMuxer => Box::new(TsMuxerDemuxStep::new()),
            PlannedStep::DemuxSubtitle { index } => Box::new(DemuxSubtitleStep::new(*index)),
            PlannedStep::ProcessSubtitle { index } => Box::new(ProcessSubtitleStep::new(*index)),
            PlannedStep::IndexVideo => Box::new(IndexVideoStep::new()),
            PlannedStep::CropDetect => Box::new(CropDetectStep::new()),
            PlannedStep::EncodeVideoFfmpeg { pass, passes } => {
                Box::new(FfmpegX264Step::new(*pass, *passes))
            }
            PlannedStep::EncodeVideoX264 { pass, passes } => {
                Box::new(X264CliStep::new(*pass, *passes))
            }
            PlannedStep::EncodeMpeg2 => Box::new(Mpeg2Step::new()),
            PlannedStep::EncodeAudio { index, encoder } => {
                Box::new(EncodeAudioStep::new(*index, encoder.clone()))
            }
            PlannedStep::Mplex => Box::new(MplexStep::new()),
            PlannedStep::SpuMux { index } => Box::new(SpuMuxStep::new(*index)),
            PlannedStep::MuxMkv => Box::new(MkvMergeStep::new()),
            PlannedStep::MuxMp4 => Box::new(Mp4BoxStep::new()),
            PlannedStep::MuxTs => Box::new(TsMuxerStep::new()),
            PlannedStep::MuxDvd => Box::new(DvdAuthorStep::new()),
        }
    }
}

impl fmt::Display for PlannedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind(), self.tool())
    }
}

/// Ordered steps for one job. Muxing is always the last entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Plan {
    steps: Vec<PlannedStep>,
}

impl Plan {
    pub fn steps(&self) -> &[PlannedStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn kinds(&self) -> Vec<EncodingStep> {
        self.steps.iter().map(PlannedStep::kind).collect()
    }

    /// Every tool the plan runs, without duplicates.
    pub fn tools(&self) -> Vec<Tool> {
        let mut tools = Vec::new();
        for step in &self.steps {
            let tool = step.tool();
            if !tools.contains(&tool) {
                tools.push(tool);
            }
        }
        tools
    }
}

/// What happens to a subtitle stream in the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubtitleAction {
    Drop,
    Keep,
    Convert,
}

fn is_text(format: &str) -> bool {
    matches!(
        format.to_ascii_lowercase().as_str(),
        "utf-8" | "ssa" | "ass"
    )
}

fn subtitle_action(out_format: OutputType, sub: &SubtitleInfo) -> SubtitleAction {
    if is_text(&sub.format) {
        // burned in through TextSub, or stored as-is where the muxer takes text
        let stored = match out_format {
            OutputType::Matroska => true,
            OutputType::WebM | OutputType::Dvd => false,
            _ => sub.format.eq_ignore_ascii_case("utf-8"),
        };
        return if sub.hard_sub_into_video || stored {
            SubtitleAction::Keep
        } else {
            SubtitleAction::Drop
        };
    }
    if !sub.is_image_based() {
        return SubtitleAction::Drop;
    }
    if sub.hard_sub_into_video {
        return SubtitleAction::Convert;
    }
    match out_format {
        OutputType::WebM => SubtitleAction::Drop,
        out if out.carries_subtitle_format(&sub.format) => SubtitleAction::Keep,
        _ => SubtitleAction::Convert,
    }
}

/// Borrowed view of the config and tools; holds no state between jobs.
pub struct JobPlanner<'a> {
    config: &'a AppConfig,
    tools: &'a ToolLocator,
}

impl<'a> JobPlanner<'a> {
    pub fn new(config: &'a AppConfig, tools: &'a ToolLocator) -> Self {
        Self { config, tools }
    }

    /// Plans `job`. On success subtitles the target cannot use are removed
    /// from the job; on failure the job is left untouched and nothing has run.
    pub fn plan(&self, job: &mut Job) -> Result<Plan, AppError> {
        self.validate_profile(job)?;

        let out_format = job.profile.out_format;
        let actions: Vec<SubtitleAction> = job
            .subtitle_streams
            .iter()
            .map(|sub| subtitle_action(out_format, sub))
            .collect();

        let mut steps = Vec::new();

        if job.input_type == InputType::Dvd {
            steps.push(PlannedStep::Dump);
        }

        let demux = match job.input_type {
            InputType::BluRay => PlannedStep::DemuxTsMuxer,
            InputType::Avchd | InputType::HdDvd => PlannedStep::DemuxEac3To,
            _ => PlannedStep::DemuxFfmpeg,
        };
        // eac3to and tsMuxeR write elementary streams; ffmpeg writes one Matroska file per track
        let subs_raw_after_demux = demux != PlannedStep::DemuxFfmpeg;
        steps.push(demux);

        let kept: Vec<(usize, SubtitleAction)> = actions
            .iter()
            .filter(|action| **action != SubtitleAction::Drop)
            .copied()
            .enumerate()
            .collect();
        if !subs_raw_after_demux {
            steps.extend(kept.iter().map(|(index, _)| PlannedStep::DemuxSubtitle { index: *index }));
        }
        steps.extend(
            kept.iter()
                .filter(|(_, action)| *action == SubtitleAction::Convert)
                .map(|(index, _)| PlannedStep::ProcessSubtitle { index: *index }),
        );

        if uses_filter_script(job, self.config) {
            steps.push(PlannedStep::IndexVideo);
        }
        if job.profile.wants_crop_detection() {
            steps.push(PlannedStep::CropDetect);
        }

        match &job.profile.video {
            VideoProfile::Copy => {}
            VideoProfile::Mpeg2(_) => steps.push(PlannedStep::EncodeMpeg2),
            VideoProfile::X264(profile) => {
                let passes = profile.mode.passes().max(1);
                let standalone = self.config.effective_prefer_standalone_x264();
                for pass in 1..=passes {
                    steps.push(if standalone {
                        PlannedStep::EncodeVideoX264 { pass, passes }
                    } else {
                        PlannedStep::EncodeVideoFfmpeg { pass, passes }
                    });
                }
            }
        }

        for (index, audio) in job.audio_streams.iter().enumerate() {
            let encoder = match &job.profile.audio {
                AudioProfile::Ac3(profile) => Some(AudioEncoder::Ac3(profile.clone())),
                AudioProfile::Aac(profile) => Some(AudioEncoder::NeroAac(profile.clone())),
                AudioProfile::Mp3(profile) => Some(AudioEncoder::Lame(profile.clone())),
                AudioProfile::Vorbis(profile) => Some(AudioEncoder::OggEnc(profile.clone())),
                AudioProfile::Copy if out_format == OutputType::Dvd && !is_ac3(&audio.format) => {
                    Some(AudioEncoder::Ac3(Ac3Profile::default()))
                }
                AudioProfile::Copy => None,
            };
            if let Some(encoder) = encoder {
                steps.push(PlannedStep::EncodeAudio { index, encoder });
            }
        }

        if out_format == OutputType::Dvd {
            steps.push(PlannedStep::Mplex);
            let kept_subs = job
                .subtitle_streams
                .iter()
                .zip(&actions)
                .filter(|(_, action)| **action != SubtitleAction::Drop)
                .map(|(sub, _)| sub);
            for (index, sub) in kept_subs.enumerate() {
                if !sub.hard_sub_into_video {
                    steps.push(PlannedStep::SpuMux { index });
                }
            }
        }

        steps.push(match out_format {
            OutputType::Matroska | OutputType::WebM => PlannedStep::MuxMkv,
            OutputType::Mp4 => PlannedStep::MuxMp4,
            OutputType::Ts | OutputType::M2ts | OutputType::BluRay | OutputType::Avchd => {
                PlannedStep::MuxTs
            }
            OutputType::Dvd => PlannedStep::MuxDvd,
        });

        let plan = Plan { steps };
        for tool in plan.tools() {
            if let Err(e) = self.tools.require(tool) {
                return Err(AppError::Planning(format!(
                    "{} is required but not installed. {}",
                    tool, e
                )));
            }
        }

        let id = job.id;
        let mut actions = actions.into_iter();
        job.subtitle_streams.retain(|sub| {
            let keep = actions.next() != Some(SubtitleAction::Drop);
            if !keep {
                log::warn!(
                    target: "vidconvert::planner",
                    "job {}: dropping {} subtitle ({}), not supported in {}",
                    id,
                    sub.format,
                    sub.lang_code,
                    out_format.as_str()
                );
            }
            keep
        });

        log::info!(
            target: "vidconvert::planner",
            "job {}: planned {}",
            job.id,
            plan.steps
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" -> ")
        );
        Ok(plan)
    }

    /// Profile combinations no tool chain can produce.
    fn validate_profile(&self, job: &Job) -> Result<(), AppError> {
        let profile = &job.profile;
        let video_format = &job.video_stream.format;
        match profile.out_format {
            OutputType::Dvd => match &profile.video {
                VideoProfile::X264(_) => {
                    return Err(AppError::Planning(
                        "DVD output needs MPEG-2 video, the profile encodes H.264".to_string(),
                    ));
                }
                VideoProfile::Copy if !is_mpeg2(video_format) => {
                    return Err(AppError::Planning(format!(
                        "DVD output cannot stream-copy {} video",
                        display_format(video_format)
                    )));
                }
                _ => {}
            },
            OutputType::WebM => {
                if !matches!(profile.video, VideoProfile::Copy) {
                    return Err(AppError::Planning(
                        "WebM output only supports stream-copied video".to_string(),
                    ));
                }
                if !matches!(profile.audio, AudioProfile::Vorbis(_) | AudioProfile::Copy) {
                    return Err(AppError::Planning(
                        "WebM output needs Vorbis audio".to_string(),
                    ));
                }
            }
            out if out.is_transport_stream() => {
                if profile.copies_video() && ts_video_codec(video_format).is_none() {
                    return Err(AppError::Planning(format!(
                        "tsMuxeR cannot mux {} video",
                        display_format(video_format)
                    )));
                }
            }
            _ => {}
        }
        if matches!(profile.video, VideoProfile::Mpeg2(_)) && profile.out_format != OutputType::Dvd
        {
            return Err(AppError::Planning(format!(
                "MPEG-2 encoding is only supported for DVD output, not {}",
                profile.out_format.as_str()
            )));
        }
        Ok(())
    }
}

fn is_ac3(format: &str) -> bool {
    matches!(format.to_ascii_lowercase().as_str(), "ac-3" | "ac3")
}

fn is_mpeg2(format: &str) -> bool {
    matches!(format, "MPEG Video" | "MPEG-2")
}

fn display_format(format: &str) -> &str {
    if format.is_empty() { "unknown" } else { format }
}
