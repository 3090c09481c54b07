use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::{OutputParser, ParseOutcome, ProgressEvent};
use crate::tools::Tool;

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Importing ([\w-]*|ISO File): \|.+?\| \((\d+?)/\d+?\)$")
        .expect("invalid MP4Box import regex")
});
static WRITING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ISO File Writing: \|.+?\| \((\d+?)/\d+?\)$")
        .expect("invalid MP4Box writing regex")
});

/// MP4Box `-v` output. Each imported track and the final write count as equal parts.
///
/// A new part starts when the import name changes or its counter falls back.
/// ETA: `(100 - p) / (p / elapsed)`.
pub struct Mp4BoxParser {
    parts: u32,
    finished: u32,
    current_name: Option<String>,
    current_value: u32,
}

impl Mp4BoxParser {
    /// `imports` is the number of `-add` inputs.
    pub fn new(imports: u32) -> Self {
        Self {
            parts: imports.saturating_add(1),
            finished: 0,
            current_name: None,
            current_value: 0,
        }
    }

    fn event(&self, value: u32, elapsed: Duration) -> ProgressEvent {
        let percent =
            (self.finished as f64 * 100.0 + value as f64) / self.parts.max(1) as f64;
        let secs = elapsed.as_secs_f64();
        let remaining = if percent > 0.0 && secs > 0.0 {
            (100.0 - percent) / (percent / secs)
        } else {
            0.0
        };
        ProgressEvent::new(percent, elapsed, remaining)
    }
}

impl OutputParser for Mp4BoxParser {
    fn tool(&self) -> Tool {
        Tool::Mp4Box
    }

    fn parse_line(&mut self, line: &str, elapsed: Duration) -> ParseOutcome {
        let line = line.trim();
        if let Some(caps) = IMPORT_RE.captures(line) {
            let name = caps[1].to_string();
            let value: u32 = caps[2].parse().unwrap_or(0);
            let same_part = self.current_name.as_deref() == Some(name.as_str())
                && value >= self.current_value;
            if !same_part && self.current_name.is_some() {
                self.finished = (self.finished + 1).min(self.parts.saturating_sub(1));
            }
            self.current_name = Some(name);
            self.current_value = value;
            return ParseOutcome::Progress(self.event(value, elapsed));
        }
        if let Some(caps) = WRITING_RE.captures(line) {
            let value: u32 = caps[1].parse().unwrap_or(0);
            self.finished = self.parts.saturating_sub(1);
            self.current_name = Some("ISO File Writing".to_string());
            self.current_value = value;
            return ParseOutcome::Progress(self.event(value, elapsed));
        }
        ParseOutcome::Log(line.to_string())
    }
}
