//! Subtitle extraction (mkvextract) and conversion (BDSup2Sub).

use std::path::{Path, PathBuf};

use super::demux::demux_extension;
use super::dvd::is_pal;
use super::{PipelineStep, StepContext};
use crate::error::AppError;
use crate::job::{EncodingStep, Job, OutputType, SubtitleInfo};
use crate::progress::{BdSup2SubParser, OutputParser, PercentParser};
use crate::temp::with_suffix;
use crate::tools::{Invocation, Tool};

fn subtitle(job: &Job, index: usize) -> Result<&SubtitleInfo, AppError> {
    job.subtitle_streams
        .get(index)
        .ok_or_else(|| AppError::Other(format!("no subtitle stream {}", index)))
}

fn subtitle_file(sub: &SubtitleInfo, index: usize) -> Result<&Path, AppError> {
    sub.temp_file
        .as_deref()
        .ok_or_else(|| AppError::Other(format!("subtitle {} has no demuxed file", index)))
}

/// Extracts the raw subtitle stream from its single-track Matroska file.
pub struct DemuxSubtitleStep {
    index: usize,
    output: Option<PathBuf>,
}

impl DemuxSubtitleStep {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            output: None,
        }
    }
}

impl PipelineStep for DemuxSubtitleStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::DemuxSubtitle
    }

    fn tool(&self) -> Tool {
        Tool::MkvExtract
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let sub = subtitle(job, self.index)?;
        let input = subtitle_file(sub, self.index)?.to_path_buf();
        let ext = if sub.format.eq_ignore_ascii_case("vobsub") {
            "idx"
        } else {
            demux_extension(&sub.format)
        };
        let output = with_suffix(&input, &format!("raw.{}", ext));
        let inv = Invocation::new(Tool::MkvExtract, ctx.program(Tool::MkvExtract)?)
            .arg("tracks")
            .path_arg(&input)
            .arg(format!("0:{}", output.to_string_lossy()));
        job.add_temp_file(&output);
        if ext == "idx" {
            job.add_temp_file(output.with_extension("sub"));
        }
        self.output = Some(output);
        Ok(inv)
    }

    fn parser(&self, _job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(PercentParser::mkvtoolnix(Tool::MkvExtract))
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        let output = self.output.take();
        if let Some(sub) = job.subtitle_streams.get_mut(self.index) {
            sub.temp_file = output;
            sub.raw_stream = true;
        }
        Ok(())
    }
}

/// Converts an image subtitle into what the target needs: spumux XML for DVD,
/// VobSub for MP4, PGS for transport streams and burned-in subtitles.
pub struct ProcessSubtitleStep {
    index: usize,
    output: Option<(PathBuf, &'static str)>,
}

impl ProcessSubtitleStep {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            output: None,
        }
    }

    /// Output extension and the subtitle format it represents.
    fn target(job: &Job, sub: &SubtitleInfo) -> (&'static str, &'static str) {
        if sub.hard_sub_into_video {
            return ("sup", "pgs");
        }
        match job.profile.out_format {
            OutputType::Dvd => ("processed.xml", "spumux"),
            OutputType::Mp4 | OutputType::Matroska | OutputType::WebM => ("idx", "vobsub"),
            _ => ("sup", "pgs"),
        }
    }
}

impl PipelineStep for ProcessSubtitleStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::ProcessSubtitle
    }

    fn tool(&self) -> Tool {
        Tool::BdSup2Sub
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let sub = subtitle(job, self.index)?;
        let input = subtitle_file(sub, self.index)?.to_path_buf();
        let (ext, format) = Self::target(job, sub);
        let suffix = if sub.forced_only {
            format!("forced.{}", ext)
        } else {
            format!("converted.{}", ext)
        };
        let output = with_suffix(&input, &suffix);

        let mut inv = Invocation::new(Tool::BdSup2Sub, ctx.program(Tool::Java)?)
            .working_dir(ctx.demux_dir())
            .arg("-jar")
            .path_arg(&ctx.program(Tool::BdSup2Sub)?)
            .path_arg(&input)
            .arg("--output")
            .path_arg(&output)
            .args(["--fps-target", "keep", "--palette-mode", "keep"]);
        if sub.forced_only {
            inv = inv.arg("--forced-only");
        }
        if job.profile.out_format == OutputType::Dvd {
            let lines = if is_pal(job) { "576" } else { "480" };
            inv = inv.args(["--resolution", lines]);
        }

        job.add_temp_file(&output);
        match format {
            "vobsub" => job.add_temp_file(output.with_extension("sub")),
            // spumux XML references one PNG per caption, written next to it
            "spumux" => job.add_temp_file(output.with_extension("")),
            _ => {}
        }
        self.output = Some((output, format));
        Ok(inv)
    }

    fn parser(&self, _job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(BdSup2SubParser::new())
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        if let (Some((output, format)), Some(sub)) =
            (self.output.take(), job.subtitle_streams.get_mut(self.index))
        {
            sub.temp_file = Some(output);
            sub.format = format.to_string();
        }
        Ok(())
    }
}
