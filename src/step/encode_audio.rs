//! Audio encoding: AC-3 through ffmpeg, AAC with neroAacEnc, MP3 with lame,
//! Vorbis with oggenc.

use std::path::PathBuf;

use super::{PipelineStep, StepContext};
use crate::error::AppError;
use crate::job::{
    AacMode, AacProfile, Ac3Profile, AudioInfo, EncodingStep, Job, Mp3Mode, Mp3Profile,
    OutputType, VorbisProfile,
};
use crate::progress::{FfmpegAudioParser, NeroAacParser, OutputParser, PercentParser};
use crate::temp::with_suffix;
use crate::tools::{Invocation, Tool};

/// Encoder and settings for one audio track.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEncoder {
    Ac3(Ac3Profile),
    NeroAac(AacProfile),
    Lame(Mp3Profile),
    OggEnc(VorbisProfile),
}

impl AudioEncoder {
    pub fn tool(&self) -> Tool {
        match self {
            AudioEncoder::Ac3(_) => Tool::Ffmpeg,
            AudioEncoder::NeroAac(_) => Tool::NeroAacEnc,
            AudioEncoder::Lame(_) => Tool::Lame,
            AudioEncoder::OggEnc(_) => Tool::OggEnc,
        }
    }

    /// Output extension and the format name recorded on the track.
    fn output_format(&self) -> (&'static str, &'static str) {
        match self {
            AudioEncoder::Ac3(_) => ("ac3", "AC-3"),
            AudioEncoder::NeroAac(_) => ("m4a", "AAC"),
            AudioEncoder::Lame(_) => ("mp3", "MPEG Audio"),
            AudioEncoder::OggEnc(_) => ("ogg", "Vorbis"),
        }
    }
}

pub struct EncodeAudioStep {
    index: usize,
    encoder: AudioEncoder,
    output: Option<PathBuf>,
}

impl EncodeAudioStep {
    pub fn new(index: usize, encoder: AudioEncoder) -> Self {
        Self {
            index,
            encoder,
            output: None,
        }
    }

    pub fn encoder(&self) -> &AudioEncoder {
        &self.encoder
    }

    fn ac3_args(inv: Invocation, profile: &Ac3Profile, audio: &AudioInfo, dvd: bool) -> Invocation {
        let mut inv = inv
            .args(["-map", "0:a", "-c:a", "ac3"])
            .args(["-b:a".to_string(), format!("{}k", profile.bitrate)]);
        let channels = profile
            .channels
            .unwrap_or(audio.channels)
            .min(6);
        if channels > 0 && channels != audio.channels {
            inv = inv.args(["-ac".to_string(), channels.to_string()]);
        }
        if channels == 2 || channels == 3 {
            inv = inv.args(["-dsur_mode", "1"]);
        }
        let sample_rate = if dvd { Some(48000) } else { profile.sample_rate };
        if let Some(rate) = sample_rate.filter(|r| *r != audio.sample_rate) {
            inv = inv.args(["-ar".to_string(), rate.to_string()]);
        }
        if profile.dynamic_range_compression {
            inv = inv.args(["-dialnorm", "-27"]);
        }
        inv.args(["-vn", "-y"])
    }
}

impl PipelineStep for EncodeAudioStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::EncodeAudio
    }

    fn tool(&self) -> Tool {
        self.encoder.tool()
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let audio = job
            .audio_streams
            .get(self.index)
            .ok_or_else(|| AppError::Other(format!("no audio stream {}", self.index)))?;
        let input = audio
            .temp_file
            .clone()
            .ok_or_else(|| AppError::Other(format!("audio {} was not demuxed", self.index)))?;
        let (ext, _) = self.encoder.output_format();
        let output = with_suffix(&input, &format!("encoded.{}", ext));
        let tool = self.encoder.tool();
        let inv = Invocation::new(tool, ctx.program(tool)?);

        let inv = match &self.encoder {
            AudioEncoder::Ac3(profile) => {
                let dvd = job.profile.out_format == OutputType::Dvd;
                let inv = inv.arg("-i").path_arg(&input);
                Self::ac3_args(inv, profile, audio, dvd).path_arg(&output)
            }
            AudioEncoder::NeroAac(profile) => {
                let inv = match profile.mode {
                    AacMode::Abr { bitrate } => {
                        inv.args(["-br".to_string(), (bitrate * 1000).to_string()])
                    }
                    AacMode::Cbr { bitrate } => {
                        inv.args(["-cbr".to_string(), (bitrate * 1000).to_string()])
                    }
                    AacMode::Quality { quality } => {
                        inv.args(["-q".to_string(), format!("{:.2}", quality)])
                    }
                };
                inv.args(["-ignorelength", "-if"])
                    .path_arg(&input)
                    .arg("-of")
                    .path_arg(&output)
            }
            AudioEncoder::Lame(profile) => {
                let inv = match &profile.mode {
                    Mp3Mode::Vbr { quality } => inv.args(["-V".to_string(), quality.to_string()]),
                    Mp3Mode::Abr { bitrate } => {
                        inv.args(["--preset".to_string(), bitrate.to_string()])
                    }
                    Mp3Mode::Cbr { bitrate } => {
                        inv.args(["--preset".to_string(), "cbr".to_string(), bitrate.to_string()])
                    }
                    Mp3Mode::Preset { name } => inv.args(["--preset", name.as_str()]),
                };
                inv.path_arg(&input).path_arg(&output)
            }
            AudioEncoder::OggEnc(profile) => {
                let inv = match (profile.bitrate, profile.quality) {
                    (Some(bitrate), _) => inv.args(["-b".to_string(), bitrate.to_string()]),
                    (None, Some(quality)) => inv.args(["-q".to_string(), format!("{:.2}", quality)]),
                    (None, None) => inv,
                };
                inv.arg("-o").path_arg(&output).path_arg(&input)
            }
        };

        job.add_temp_file(&output);
        self.output = Some(output);
        Ok(inv)
    }

    fn parser(&self, job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        let length = job.video_stream.length_secs;
        match self.encoder {
            AudioEncoder::Ac3(_) => Box::new(FfmpegAudioParser::new(length)),
            AudioEncoder::NeroAac(_) => Box::new(NeroAacParser::new(length)),
            AudioEncoder::Lame(_) => Box::new(PercentParser::lame()),
            AudioEncoder::OggEnc(_) => Box::new(PercentParser::oggenc()),
        }
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        let (_, format) = self.encoder.output_format();
        if let (Some(output), Some(audio)) = (self.output.take(), job.audio_streams.get_mut(self.index)) {
            audio.temp_file = Some(output);
            audio.format = format.to_string();
            audio.encoded = true;
        }
        Ok(())
    }
}
