use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::{OutputParser, ParseOutcome, ProgressEvent, eta_from_percent};
use crate::tools::Tool;

static ANALYZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"analyze: (\d+)%").expect("invalid eac3to analyze regex"));
static PROCESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"process: (\d+)%").expect("invalid eac3to process regex"));

/// eac3to with `-progressNumbers`: an analyze pass (first half) then a process pass (second half).
///
/// ETA: `(100 - p) * elapsed / p` over the combined percent.
pub struct Eac3ToParser;

impl Eac3ToParser {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Eac3ToParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputParser for Eac3ToParser {
    fn tool(&self) -> Tool {
        Tool::Eac3To
    }

    fn parse_line(&mut self, line: &str, elapsed: Duration) -> ParseOutcome {
        let percent = if let Some(caps) = ANALYZE_RE.captures(line) {
            caps[1].parse::<f64>().ok().map(|p| p / 2.0)
        } else if let Some(caps) = PROCESS_RE.captures(line) {
            caps[1].parse::<f64>().ok().map(|p| 50.0 + p / 2.0)
        } else {
            None
        };
        match percent {
            Some(p) => ParseOutcome::Progress(ProgressEvent::new(
                p,
                elapsed,
                eta_from_percent(p, elapsed),
            )),
            None => ParseOutcome::Log(line.to_string()),
        }
    }
}
