//! DVD authoring: mplex premux, spumux subtitle muxing and dvdauthor.

use std::fs;
use std::path::{Path, PathBuf};

use super::{PipelineStep, StepContext};
use crate::error::AppError;
use crate::job::{EncodingStep, Job};
use crate::progress::{LogOnlyParser, OutputParser};
use crate::temp::{artifact_path, strip_extension, with_suffix};
use crate::tools::{Invocation, Tool, path_to_string};

/// Two-letter code dvdauthor expects; unknown three-letter codes map to none.
fn iso1_lang(code: &str) -> Option<&'static str> {
    let code = code.to_ascii_lowercase();
    let iso1 = match code.as_str() {
        "en" | "eng" => "en",
        "de" | "deu" | "ger" => "de",
        "fr" | "fra" | "fre" => "fr",
        "es" | "spa" => "es",
        "it" | "ita" => "it",
        "nl" | "nld" | "dut" => "nl",
        "pt" | "por" => "pt",
        "ru" | "rus" => "ru",
        "pl" | "pol" => "pl",
        "cs" | "ces" | "cze" => "cs",
        "sv" | "swe" => "sv",
        "da" | "dan" => "da",
        "fi" | "fin" => "fi",
        "no" | "nor" => "no",
        "ja" | "jpn" => "ja",
        "zh" | "zho" | "chi" => "zh",
        "ko" | "kor" => "ko",
        _ => return None,
    };
    Some(iso1)
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn current_video(job: &Job) -> Result<PathBuf, AppError> {
    job.video_stream
        .temp_file
        .clone()
        .ok_or_else(|| AppError::Other("no encoded video to author".to_string()))
}

/// PAL when the source runs at 25 fps or has 576 lines.
pub(crate) fn is_pal(job: &Job) -> bool {
    let video = &job.video_stream;
    (video.fps - 25.0).abs() < 0.01 || video.height == 576
}

/// Multiplexes the MPEG-2 video and audio into a DVD program stream.
#[derive(Default)]
pub struct MplexStep {
    output: Option<PathBuf>,
}

impl MplexStep {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PipelineStep for MplexStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::PreMuxResult
    }

    fn tool(&self) -> Tool {
        Tool::Mplex
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let video = current_video(job)?;
        let output = with_suffix(&video, "premuxed.mpg");
        let mut inv = Invocation::new(Tool::Mplex, ctx.program(Tool::Mplex)?)
            .args(["-f", "8", "-r", "0", "-V", "-v", "1", "-o"])
            .path_arg(&output)
            .path_arg(&video);
        for audio in &job.audio_streams {
            if let Some(file) = &audio.temp_file {
                inv = inv.path_arg(file);
            }
        }
        job.add_temp_file(&output);
        self.output = Some(output);
        Ok(inv)
    }

    fn parser(&self, _job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(LogOnlyParser::new(Tool::Mplex))
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        if let Some(output) = self.output.take() {
            job.video_stream.temp_file = Some(output);
        }
        Ok(())
    }
}

/// Muxes one processed subtitle into the program stream. spumux reads the
/// stream on stdin and writes the result to stdout.
pub struct SpuMuxStep {
    index: usize,
    output: Option<PathBuf>,
}

impl SpuMuxStep {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            output: None,
        }
    }
}

impl PipelineStep for SpuMuxStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::PremuxSubtitle
    }

    fn tool(&self) -> Tool {
        Tool::SpuMux
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let video = current_video(job)?;
        let sub = job
            .subtitle_streams
            .get(self.index)
            .ok_or_else(|| AppError::Other(format!("no subtitle stream {}", self.index)))?;
        let xml = sub
            .temp_file
            .clone()
            .ok_or_else(|| AppError::Other(format!("subtitle {} was not processed", self.index)))?;
        // subpicture stream number among the subtitles muxed before this one
        let stream = job.subtitle_streams[..self.index]
            .iter()
            .filter(|s| !s.hard_sub_into_video)
            .count();
        let output = PathBuf::from(format!(
            "{}+{}.mpg",
            path_to_string(&strip_extension(&video)),
            sub.lang_code
        ));

        let inv = Invocation::new(Tool::SpuMux, ctx.program(Tool::SpuMux)?)
            .working_dir(ctx.demux_dir())
            .arg("-s")
            .arg(stream.to_string())
            .path_arg(&xml)
            .stdin_file(&video)
            .stdout_file(&output);
        job.add_temp_file(&output);
        self.output = Some(output);
        Ok(inv)
    }

    fn parser(&self, _job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(LogOnlyParser::new(Tool::SpuMux))
    }

    fn on_success(&mut self, job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        if let Some(output) = self.output.take() {
            job.video_stream.temp_file = Some(output);
        }
        Ok(())
    }
}

/// Builds the DVD file structure from the premuxed program stream.
#[derive(Default)]
pub struct DvdAuthorStep;

impl DvdAuthorStep {
    pub fn new() -> Self {
        Self
    }

    fn render_xml(&self, job: &Job, dest: &Path, vob: &Path) -> String {
        let format = if is_pal(job) { "pal" } else { "ntsc" };
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\" standalone=\"yes\"?>\n");
        xml.push_str(&format!(
            "<dvdauthor dest=\"{}\">\n",
            xml_escape(&path_to_string(dest).replace('\\', "/"))
        ));
        xml.push_str("  <vmgm />\n  <titleset>\n    <titles>\n");
        xml.push_str(&format!("      <video format=\"{}\" />\n", format));
        for audio in &job.audio_streams {
            match iso1_lang(&audio.lang_code) {
                Some(lang) => xml.push_str(&format!("      <audio lang=\"{}\" />\n", lang)),
                None => xml.push_str("      <audio />\n"),
            }
        }
        for sub in job.subtitle_streams.iter().filter(|s| !s.hard_sub_into_video) {
            match iso1_lang(&sub.lang_code) {
                Some(lang) => xml.push_str(&format!("      <subpicture lang=\"{}\" />\n", lang)),
                None => xml.push_str("      <subpicture />\n"),
            }
        }
        xml.push_str(&format!(
            "      <pgc>\n        <vob file=\"{}\" />\n      </pgc>\n",
            xml_escape(&path_to_string(vob))
        ));
        xml.push_str("    </titles>\n  </titleset>\n</dvdauthor>\n");
        xml
    }
}

impl PipelineStep for DvdAuthorStep {
    fn kind(&self) -> EncodingStep {
        EncodingStep::MuxResult
    }

    fn tool(&self) -> Tool {
        Tool::DvdAuthor
    }

    fn prepare(&mut self, job: &mut Job, ctx: &StepContext<'_>) -> Result<Invocation, AppError> {
        let vob = current_video(job)?;
        let dest = job.mux_target().to_path_buf();
        fs::create_dir_all(&dest)?;
        let dir = ctx.temp_dir();
        fs::create_dir_all(&dir)?;
        let xml_path = artifact_path(&dir, &job.base_name(), "dvdauthor.xml");
        fs::write(&xml_path, self.render_xml(job, &dest, &vob))?;
        job.add_temp_file(&xml_path);
        Ok(Invocation::new(Tool::DvdAuthor, ctx.program(Tool::DvdAuthor)?)
            .arg("-x")
            .path_arg(&xml_path))
    }

    fn parser(&self, _job: &Job, _ctx: &StepContext<'_>) -> Box<dyn OutputParser> {
        Box::new(LogOnlyParser::new(Tool::DvdAuthor))
    }

    fn on_success(&mut self, _job: &mut Job, _ctx: &StepContext<'_>) -> Result<(), AppError> {
        Ok(())
    }
}
