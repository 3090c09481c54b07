use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::{OutputParser, ParseOutcome, ProgressEvent, eta_from_rate};
use crate::tools::Tool;

static PROCESSED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Processed (\d+) seconds").expect("invalid neroAacEnc regex"));

/// neroAacEnc only reports processed media seconds.
///
/// Percent: `seconds / stream length`. ETA: remaining media seconds at the observed rate.
pub struct NeroAacParser {
    length_secs: f64,
}

impl NeroAacParser {
    pub fn new(length_secs: f64) -> Self {
        Self { length_secs }
    }
}

impl OutputParser for NeroAacParser {
    fn tool(&self) -> Tool {
        Tool::NeroAacEnc
    }

    fn parse_line(&mut self, line: &str, elapsed: Duration) -> ParseOutcome {
        let Some(caps) = PROCESSED_RE.captures(line) else {
            return ParseOutcome::Log(line.to_string());
        };
        if self.length_secs <= 0.0 {
            return ParseOutcome::Log(line.to_string());
        }
        let position: f64 = caps[1].parse().unwrap_or(0.0);
        let percent = position / self.length_secs * 100.0;
        ParseOutcome::Progress(ProgressEvent::new(
            percent,
            elapsed,
            eta_from_rate(position, (self.length_secs - position).max(0.0), elapsed),
        ))
    }
}
