use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::{OutputParser, ParseOutcome, ProgressEvent, eta_from_rate};
use crate::tools::Tool;

static DECODING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Decoding frame\s(\d*)/(\d*)").expect("invalid BDSup2Sub decoding regex")
});
static WRITING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#>\s+?(\d*?)\s\(").expect("invalid BDSup2Sub writing regex"));

/// BDSup2Sub decodes all captions (first half) then writes them (second half).
///
/// The caption total is only known once a `Decoding frame n/total` line arrives;
/// writing lines before that are logged. ETA: remaining captions at the observed rate.
pub struct BdSup2SubParser {
    total: Option<u64>,
}

impl BdSup2SubParser {
    pub fn new() -> Self {
        Self { total: None }
    }

    fn event(&self, done_units: u64, elapsed: Duration) -> Option<ProgressEvent> {
        let all_units = self.total?.checked_mul(2)?;
        let done = done_units.min(all_units);
        let percent = done as f64 / all_units as f64 * 100.0;
        Some(ProgressEvent::new(
            percent,
            elapsed,
            eta_from_rate(done as f64, (all_units - done) as f64, elapsed),
        ))
    }
}

impl Default for BdSup2SubParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputParser for BdSup2SubParser {
    fn tool(&self) -> Tool {
        Tool::BdSup2Sub
    }

    fn parse_line(&mut self, line: &str, elapsed: Duration) -> ParseOutcome {
        let event = if let Some(caps) = DECODING_RE.captures(line) {
            let frame: u64 = caps[1].parse().unwrap_or(0);
            // a total too large to double is treated as unknown
            if let Ok(total) = caps[2].parse::<u64>() {
                if total > 0 && total.checked_mul(2).is_some() {
                    self.total = Some(total);
                }
            }
            self.event(frame, elapsed)
        } else if let Some(caps) = WRITING_RE.captures(line) {
            let frame: u64 = caps[1].parse().unwrap_or(0);
            self.total
                .and_then(|total| self.event(total.saturating_add(frame), elapsed))
        } else {
            None
        };
        match event {
            Some(e) => ParseOutcome::Progress(e),
            None => ParseOutcome::Log(line.to_string()),
        }
    }
}
