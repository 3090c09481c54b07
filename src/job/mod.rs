//! The conversion job: identity (input, output, profile) plus the pipeline state
//! each step reads and writes.

mod profile;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use profile::{
    AacMode, AacProfile, Ac3Profile, AudioProfile, EncodingProfile, Mp3Mode, Mp3Profile,
    Mpeg2Profile, OutputType, VideoProfile, VorbisProfile, X264Mode, X264Profile,
};

pub type JobId = u64;

/// Kinds of pipeline step, in the order a full pipeline visits them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingStep {
    #[default]
    NotSet,
    Dump,
    Demux,
    DemuxSubtitle,
    ProcessSubtitle,
    IndexVideo,
    GetCropRect,
    EncodeVideo,
    EncodeAudio,
    PreMuxResult,
    PremuxSubtitle,
    MuxResult,
    MoveOutFile,
    Done,
}

impl EncodingStep {
    pub fn as_str(self) -> &'static str {
        match self {
            EncodingStep::NotSet => "not_set",
            EncodingStep::Dump => "dump",
            EncodingStep::Demux => "demux",
            EncodingStep::DemuxSubtitle => "demux_subtitle",
            EncodingStep::ProcessSubtitle => "process_subtitle",
            EncodingStep::IndexVideo => "index_video",
            EncodingStep::GetCropRect => "get_crop_rect",
            EncodingStep::EncodeVideo => "encode_video",
            EncodingStep::EncodeAudio => "encode_audio",
            EncodingStep::PreMuxResult => "pre_mux_result",
            EncodingStep::PremuxSubtitle => "premux_subtitle",
            EncodingStep::MuxResult => "mux_result",
            EncodingStep::MoveOutFile => "move_out_file",
            EncodingStep::Done => "done",
        }
    }
}

impl fmt::Display for EncodingStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialEq<&str> for EncodingStep {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Source container, as detected by the media scanner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputType {
    #[default]
    Matroska,
    Mp4,
    Avi,
    Ts,
    Wm,
    Flash,
    Dvd,
    BluRay,
    Avchd,
    HdDvd,
    Other,
}

/// Crop rectangle as reported by ffmpeg cropdetect (`crop=w:h:x:y`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CropRect {
    pub width: u32,
    pub height: u32,
    pub left: u32,
    pub top: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoInfo {
    pub stream_id: u32,
    /// Index among video streams (`0:v:N`).
    pub stream_kind_id: u32,
    pub format: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub fps_num: u32,
    pub fps_den: u32,
    pub frame_count: u64,
    pub length_secs: f64,
    pub interlaced: bool,
    pub temp_file: Option<PathBuf>,
    pub encoded: bool,
    pub is_raw_stream: bool,
    pub crop_rect: Option<CropRect>,
}

impl VideoInfo {
    /// `num/den` when the exact rate is known, else the float rate.
    pub fn frame_rate_arg(&self) -> Option<String> {
        if self.fps_num > 0 && self.fps_den > 0 {
            Some(format!("{}/{}", self.fps_num, self.fps_den))
        } else if self.fps > 0.0 {
            Some(format!("{:.3}", self.fps))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioInfo {
    /// Track id as numbered by eac3to / tsMuxeR.
    pub id: u32,
    pub stream_id: u32,
    /// Index among audio streams (`0:a:N`).
    pub stream_kind_id: u32,
    pub lang_code: String,
    pub format: String,
    pub channels: u32,
    pub sample_rate: u32,
    pub delay_ms: i32,
    pub temp_file: Option<PathBuf>,
    pub mkv_default: bool,
    pub encoded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubtitleInfo {
    pub id: u32,
    pub stream_id: u32,
    pub stream_kind_id: u32,
    pub lang_code: String,
    pub format: String,
    pub temp_file: Option<PathBuf>,
    pub raw_stream: bool,
    pub hard_sub_into_video: bool,
    pub mkv_default: bool,
    pub forced_only: bool,
    pub delay_ms: i32,
}

impl SubtitleInfo {
    pub fn is_image_based(&self) -> bool {
        matches!(
            self.format.to_ascii_lowercase().as_str(),
            "pgs" | "vobsub" | "xml" | "spumux"
        )
    }
}

/// ISO-639 code or `und` when unknown.
pub fn lang_or_und(code: &str) -> &str {
    if code.is_empty() || code == "xx" {
        "und"
    } else {
        code
    }
}

/// A single conversion task together with its pipeline state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    #[serde(default)]
    pub id: JobId,
    pub input_file: PathBuf,
    #[serde(default)]
    pub input_type: InputType,
    pub output_file: PathBuf,
    #[serde(default)]
    pub temp_input: Option<PathBuf>,
    /// When set, muxing writes here and the result is moved to `output_file` afterwards.
    #[serde(default)]
    pub temp_output: Option<PathBuf>,
    #[serde(default)]
    pub dvd_title: Option<u32>,
    pub profile: EncodingProfile,
    #[serde(default)]
    pub video_stream: VideoInfo,
    #[serde(default)]
    pub audio_streams: Vec<AudioInfo>,
    #[serde(default)]
    pub subtitle_streams: Vec<SubtitleInfo>,

    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub completed_step: EncodingStep,
    #[serde(default)]
    pub next_step: EncodingStep,
    #[serde(default)]
    pub steps_completed: usize,
    #[serde(default)]
    pub ff_index_file: Option<PathBuf>,
    #[serde(default)]
    pub filter_script: Option<PathBuf>,
    #[serde(default)]
    pub temp_files: Vec<PathBuf>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    pub fn new(
        input_file: impl Into<PathBuf>,
        output_file: impl Into<PathBuf>,
        profile: EncodingProfile,
    ) -> Self {
        Self {
            id: 0,
            input_file: input_file.into(),
            input_type: InputType::default(),
            output_file: output_file.into(),
            temp_input: None,
            temp_output: None,
            dvd_title: None,
            profile,
            video_stream: VideoInfo::default(),
            audio_streams: Vec::new(),
            subtitle_streams: Vec::new(),
            status: JobStatus::Queued,
            completed_step: EncodingStep::NotSet,
            next_step: EncodingStep::NotSet,
            steps_completed: 0,
            ff_index_file: None,
            filter_script: None,
            temp_files: Vec::new(),
            exit_code: 0,
            error: None,
        }
    }

    /// Output file stem; used to name intermediate artifacts.
    pub fn base_name(&self) -> String {
        self.output_file
            .file_stem()
            .or_else(|| self.input_file.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("job{}", self.id))
    }

    /// The file demuxers read: the dumped copy when one exists.
    pub fn source_file(&self) -> &Path {
        self.temp_input.as_deref().unwrap_or(&self.input_file)
    }

    /// Where the muxer writes.
    pub fn mux_target(&self) -> &Path {
        self.temp_output.as_deref().unwrap_or(&self.output_file)
    }

    /// Register an intermediate file for cleanup. Input and output files are never registered.
    pub fn add_temp_file(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if path.as_os_str().is_empty() || path == self.input_file || path == self.output_file {
            return;
        }
        if !self.temp_files.contains(&path) {
            self.temp_files.push(path);
        }
    }

    pub fn has_hard_subtitles(&self) -> bool {
        self.subtitle_streams.iter().any(|s| s.hard_sub_into_video)
    }

    /// Clears state left over from a previous run, keeping identity and stream info.
    pub fn reset_pipeline_state(&mut self) {
        self.status = JobStatus::Queued;
        self.completed_step = EncodingStep::NotSet;
        self.next_step = EncodingStep::NotSet;
        self.steps_completed = 0;
        self.exit_code = 0;
        self.error = None;
    }

    pub fn mark_failed(&mut self, exit_code: i32, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.exit_code = exit_code;
        self.error = Some(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_files_skip_input_output_and_duplicates() {
        let mut job = Job::new("/in/movie.mkv", "/out/movie.mkv", EncodingProfile::default());
        job.add_temp_file("/in/movie.mkv");
        job.add_temp_file("/out/movie.mkv");
        job.add_temp_file("/tmp/movie.demuxed.video.mkv");
        job.add_temp_file("/tmp/movie.demuxed.video.mkv");
        assert_eq!(
            job.temp_files,
            vec![PathBuf::from("/tmp/movie.demuxed.video.mkv")]
        );
    }

    #[test]
    fn base_name_from_output() {
        let job = Job::new("/in/a.ts", "/out/Feature Film.mp4", EncodingProfile::default());
        assert_eq!(job.base_name(), "Feature Film");
    }

    #[test]
    fn source_and_mux_target_prefer_temp_paths() {
        let mut job = Job::new("/dvd/VIDEO_TS", "/out/dvd.mkv", EncodingProfile::default());
        assert_eq!(job.source_file(), Path::new("/dvd/VIDEO_TS"));
        job.temp_input = Some(PathBuf::from("/tmp/dump.vob"));
        job.temp_output = Some(PathBuf::from("/tmp/out.mkv"));
        assert_eq!(job.source_file(), Path::new("/tmp/dump.vob"));
        assert_eq!(job.mux_target(), Path::new("/tmp/out.mkv"));
    }

    #[test]
    fn step_compares_with_name() {
        assert_eq!(EncodingStep::Demux, "demux");
        assert_eq!(
            serde_json::to_string(&EncodingStep::GetCropRect).expect("serialize"),
            "\"get_crop_rect\""
        );
    }

    #[test]
    fn job_deserializes_with_pipeline_defaults() {
        let json = r#"{
            "inputFile": "/in/a.mkv",
            "outputFile": "/out/a.mp4",
            "profile": { "outFormat": "mp4", "video": { "type": "copy" }, "audio": { "type": "copy" } },
            "audioStreams": [ { "streamKindId": 1, "langCode": "deu", "format": "AC-3" } ]
        }"#;
        let job: Job = serde_json::from_str(json).expect("parse job");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.completed_step, EncodingStep::NotSet);
        assert_eq!(job.audio_streams[0].lang_code, "deu");
        assert_eq!(lang_or_und(""), "und");
    }
}
