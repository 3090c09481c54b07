//! Encoding profiles: the read-only part of a job that decides which steps get planned.

use serde::{Deserialize, Serialize};

/// Target container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputType {
    Matroska,
    WebM,
    Mp4,
    Ts,
    M2ts,
    BluRay,
    Avchd,
    Dvd,
}

impl OutputType {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputType::Matroska => "matroska",
            OutputType::WebM => "webm",
            OutputType::Mp4 => "mp4",
            OutputType::Ts => "ts",
            OutputType::M2ts => "m2ts",
            OutputType::BluRay => "bluRay",
            OutputType::Avchd => "avchd",
            OutputType::Dvd => "dvd",
        }
    }

    /// Containers muxed by tsMuxeR.
    pub fn is_transport_stream(self) -> bool {
        matches!(
            self,
            OutputType::Ts | OutputType::M2ts | OutputType::BluRay | OutputType::Avchd
        )
    }

    /// Whether image subtitles of the given format can be stored without conversion.
    pub fn carries_subtitle_format(self, format: &str) -> bool {
        let format = format.to_ascii_lowercase();
        match self {
            OutputType::Matroska => true,
            OutputType::WebM => false,
            OutputType::Mp4 => !matches!(format.as_str(), "pgs" | "xml"),
            OutputType::Ts | OutputType::M2ts | OutputType::BluRay | OutputType::Avchd => {
                format == "pgs"
            }
            OutputType::Dvd => format == "spumux",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingProfile {
    #[serde(default)]
    pub name: String,
    pub out_format: OutputType,
    pub video: VideoProfile,
    pub audio: AudioProfile,
    #[serde(default)]
    pub auto_crop_resize: bool,
    #[serde(default)]
    pub keep_input_resolution: bool,
    /// Resize target width; height follows the source aspect ratio.
    #[serde(default)]
    pub target_width: Option<u32>,
    #[serde(default)]
    pub deinterlace: bool,
}

impl Default for EncodingProfile {
    fn default() -> Self {
        Self {
            name: "Matroska x264 / AC3".to_string(),
            out_format: OutputType::Matroska,
            video: VideoProfile::X264(X264Profile::default()),
            audio: AudioProfile::Ac3(Ac3Profile::default()),
            auto_crop_resize: false,
            keep_input_resolution: false,
            target_width: None,
            deinterlace: false,
        }
    }
}

impl EncodingProfile {
    pub fn copies_video(&self) -> bool {
        matches!(self.video, VideoProfile::Copy)
    }

    /// Auto crop runs only when the profile may change the picture size.
    pub fn wants_crop_detection(&self) -> bool {
        !self.copies_video()
            && self.auto_crop_resize
            && !self.keep_input_resolution
            && self.out_format != OutputType::Dvd
    }

    /// Filters the encoder cannot express on its own and that need a generated filter script.
    pub fn wants_filter_script(&self) -> bool {
        !self.copies_video()
            && (self.wants_crop_detection()
                || self.deinterlace
                || (self.target_width.is_some() && !self.keep_input_resolution))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VideoProfile {
    Copy,
    X264(X264Profile),
    Mpeg2(Mpeg2Profile),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct X264Profile {
    pub mode: X264Mode,
    pub preset: Option<String>,
    pub tune: Option<String>,
    /// baseline, main or high.
    pub profile: Option<String>,
    #[serde(default)]
    pub bluray_compat: bool,
}

impl Default for X264Profile {
    fn default() -> Self {
        Self {
            mode: X264Mode::Crf { quality: 22.0 },
            preset: None,
            tune: None,
            profile: None,
            bluray_compat: false,
        }
    }
}

impl X264Profile {
    pub fn effective_preset(&self) -> &str {
        self.preset.as_deref().unwrap_or("medium")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum X264Mode {
    Abr { bitrate: u32 },
    ConstantQuantizer { qp: u32 },
    TwoPass { bitrate: u32 },
    ThreePass { bitrate: u32 },
    Crf { quality: f32 },
}

impl X264Mode {
    pub fn passes(&self) -> u8 {
        match self {
            X264Mode::TwoPass { .. } => 2,
            X264Mode::ThreePass { .. } => 3,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mpeg2Profile {
    /// kbit/s
    pub bitrate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AudioProfile {
    Copy,
    Ac3(Ac3Profile),
    Aac(AacProfile),
    Mp3(Mp3Profile),
    Vorbis(VorbisProfile),
}

impl AudioProfile {
    /// CLI encoders that read WAV, so demux must decode for them.
    pub fn needs_wav_input(&self) -> bool {
        matches!(
            self,
            AudioProfile::Aac(_) | AudioProfile::Mp3(_) | AudioProfile::Vorbis(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ac3Profile {
    pub bitrate: u32,
    pub channels: Option<u32>,
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub dynamic_range_compression: bool,
}

impl Default for Ac3Profile {
    fn default() -> Self {
        Self {
            bitrate: 384,
            channels: None,
            sample_rate: None,
            dynamic_range_compression: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AacProfile {
    pub mode: AacMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum AacMode {
    Abr { bitrate: u32 },
    Cbr { bitrate: u32 },
    Quality { quality: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mp3Profile {
    pub mode: Mp3Mode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Mp3Mode {
    Vbr { quality: u8 },
    Abr { bitrate: u32 },
    Cbr { bitrate: u32 },
    Preset { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VorbisProfile {
    pub quality: Option<f32>,
    pub bitrate: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_per_mode() {
        assert_eq!(X264Mode::Crf { quality: 20.0 }.passes(), 1);
        assert_eq!(X264Mode::TwoPass { bitrate: 2000 }.passes(), 2);
        assert_eq!(X264Mode::ThreePass { bitrate: 2000 }.passes(), 3);
    }

    #[test]
    fn crop_detection_skipped_for_dvd_and_keep_resolution() {
        let mut profile = EncodingProfile {
            auto_crop_resize: true,
            ..EncodingProfile::default()
        };
        assert!(profile.wants_crop_detection());
        profile.keep_input_resolution = true;
        assert!(!profile.wants_crop_detection());
        profile.keep_input_resolution = false;
        profile.out_format = OutputType::Dvd;
        assert!(!profile.wants_crop_detection());
    }

    #[test]
    fn copy_never_needs_filter_script() {
        let profile = EncodingProfile {
            video: VideoProfile::Copy,
            deinterlace: true,
            ..EncodingProfile::default()
        };
        assert!(!profile.wants_filter_script());
    }

    #[test]
    fn profile_deserializes_from_tagged_json() {
        let json = r#"{
            "outFormat": "mp4",
            "video": { "type": "x264", "mode": { "kind": "twoPass", "bitrate": 2500 }, "preset": "slow" },
            "audio": { "type": "aac", "mode": { "kind": "quality", "quality": 0.5 } }
        }"#;
        let profile: EncodingProfile = serde_json::from_str(json).expect("parse profile");
        assert_eq!(profile.out_format, OutputType::Mp4);
        match profile.video {
            VideoProfile::X264(ref x) => {
                assert_eq!(x.mode.passes(), 2);
                assert_eq!(x.effective_preset(), "slow");
            }
            _ => panic!("expected x264"),
        }
        assert!(profile.audio.needs_wav_input());
    }

    #[test]
    fn transport_streams_only_carry_pgs() {
        assert!(OutputType::BluRay.carries_subtitle_format("PGS"));
        assert!(!OutputType::BluRay.carries_subtitle_format("VobSub"));
        assert!(OutputType::Matroska.carries_subtitle_format("VobSub"));
        assert!(!OutputType::Mp4.carries_subtitle_format("PGS"));
    }
}
