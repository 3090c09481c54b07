//! Per-tool output parsers turning child-process lines into progress events.
//!
//! Each parser is an owned state machine created per step run. Parsers compute
//! their own remaining-time estimate because the tools report different units
//! (percent, frames, media time); `ProgressGate` then clamps the percent into
//! [0, 100], keeps it non-decreasing and zeroes the estimate at the ends.

mod bdsup2sub;
mod eac3to;
mod ffmpeg;
mod mp4box;
mod nero;
mod percent;
mod x264;

use std::time::Duration;

use serde::Serialize;

use crate::job::CropRect;
use crate::tools::Tool;

pub use bdsup2sub::BdSup2SubParser;
pub use eac3to::Eac3ToParser;
pub use ffmpeg::{CropDetectParser, FfmpegAudioParser, FfmpegDemuxParser, FfmpegVideoParser};
pub use mp4box::Mp4BoxParser;
pub use nero::NeroAacParser;
pub use percent::PercentParser;
pub use x264::X264Parser;

/// Snapshot of a step's progress.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// 0-100
    pub percent: f64,
    pub elapsed_secs: f64,
    pub remaining_secs: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<u64>,
}

impl ProgressEvent {
    pub fn new(percent: f64, elapsed: Duration, remaining_secs: f64) -> Self {
        let mut event = Self {
            percent,
            elapsed_secs: elapsed.as_secs_f64(),
            remaining_secs,
            fps: None,
            frame: None,
        };
        event.normalize();
        event
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        if fps.is_finite() && fps >= 0.0 {
            self.fps = Some(fps);
        }
        self
    }

    pub fn with_frame(mut self, frame: u64) -> Self {
        self.frame = Some(frame);
        self
    }

    fn normalize(&mut self) {
        self.percent = if self.percent.is_finite() {
            self.percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        if self.percent <= 0.0
            || self.percent >= 100.0
            || !self.remaining_secs.is_finite()
            || self.remaining_secs < 0.0
        {
            self.remaining_secs = 0.0;
        }
    }
}

/// Structured values a parser can report back to the job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum JobUpdate {
    CropRect(CropRect),
    FrameRate { fps: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Progress(ProgressEvent),
    Update(JobUpdate),
    /// Unrecognized output, forwarded to the log verbatim.
    Log(String),
    /// Blank lines and recognized noise.
    Ignored,
}

pub trait OutputParser: Send {
    fn tool(&self) -> Tool;

    /// Parse one line of output. `elapsed` is the time since the process started.
    fn parse_line(&mut self, line: &str, elapsed: Duration) -> ParseOutcome;
}

/// Wraps a parser so that percent never leaves [0, 100] and never goes backwards.
pub struct ProgressGate {
    inner: Box<dyn OutputParser>,
    last_percent: f64,
}

impl ProgressGate {
    pub fn new(inner: Box<dyn OutputParser>) -> Self {
        Self {
            inner,
            last_percent: 0.0,
        }
    }

    pub fn feed(&mut self, line: &str, elapsed: Duration) -> ParseOutcome {
        if line.trim().is_empty() {
            return ParseOutcome::Ignored;
        }
        match self.inner.parse_line(line, elapsed) {
            ParseOutcome::Progress(mut event) => {
                event.normalize();
                if event.percent < self.last_percent {
                    event.percent = self.last_percent;
                    event.normalize();
                }
                self.last_percent = event.percent;
                ParseOutcome::Progress(event)
            }
            other => other,
        }
    }
}

/// Parser for tools without a progress format; every line is logged.
pub struct LogOnlyParser {
    tool: Tool,
}

impl LogOnlyParser {
    pub fn new(tool: Tool) -> Self {
        Self { tool }
    }
}

impl OutputParser for LogOnlyParser {
    fn tool(&self) -> Tool {
        self.tool
    }

    fn parse_line(&mut self, line: &str, _elapsed: Duration) -> ParseOutcome {
        ParseOutcome::Log(line.to_string())
    }
}

/// `(100 - p) * (elapsed / p)`; zero at 0 %.
pub fn eta_from_percent(percent: f64, elapsed: Duration) -> f64 {
    if percent <= 0.0 {
        return 0.0;
    }
    (100.0 - percent) * (elapsed.as_secs_f64() / percent)
}

/// Remaining units at the rate observed so far; zero until any unit is done.
pub fn eta_from_rate(done: f64, remaining: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if done <= 0.0 || secs <= 0.0 {
        return 0.0;
    }
    remaining / (done / secs)
}

/// `hh:mm:ss.ff`, `mm:ss.ff` or plain seconds.
pub fn parse_timestamp(text: &str) -> Option<f64> {
    let mut total = 0.0;
    for part in text.trim().split(':') {
        let value: f64 = part.parse().ok()?;
        total = total * 60.0 + value;
    }
    Some(total)
}

/// Accepts both `12.5` and `12,5`.
pub(crate) fn parse_decimal(text: &str) -> Option<f64> {
    text.trim().replace(',', ".").parse().ok()
}
