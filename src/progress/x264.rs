use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::{OutputParser, ParseOutcome, ProgressEvent, parse_decimal};
use crate::tools::Tool;

static STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[[\d\.]+?%\] (\d+?)/(\d+?) frames, ([\d\.]+?) fps, ([\d\.]+?) kb/s")
        .expect("invalid x264 status regex")
});
static FRAMES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\D?(\d+).*frames: ([\d\.]+) fps, ([\d\.]+)").expect("invalid x264 frames regex")
});

/// Standalone x264 CLI.
///
/// The total frame count comes from the job when known and is replaced by the
/// total x264 prints in its `[p%] n/total frames` status. Lines without a total
/// are deferred until one is available. ETA: remaining frames / reported fps.
pub struct X264Parser {
    total_frames: Option<u64>,
}

impl X264Parser {
    pub fn new(frame_count: u64) -> Self {
        Self {
            total_frames: (frame_count > 0).then_some(frame_count),
        }
    }

    pub fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    fn event(&self, frame: u64, fps: f64, elapsed: Duration) -> Option<ProgressEvent> {
        let total = self.total_frames?;
        let percent = frame as f64 / total as f64 * 100.0;
        let remaining = if fps > 0.0 {
            total.saturating_sub(frame) as f64 / fps
        } else {
            0.0
        };
        Some(
            ProgressEvent::new(percent, elapsed, remaining)
                .with_fps(fps)
                .with_frame(frame),
        )
    }
}

impl OutputParser for X264Parser {
    fn tool(&self) -> Tool {
        Tool::X264
    }

    fn parse_line(&mut self, line: &str, elapsed: Duration) -> ParseOutcome {
        let line = line.trim();
        let parsed = if let Some(caps) = STATUS_RE.captures(line) {
            let frame: u64 = caps[1].parse().unwrap_or(0);
            if let Ok(total) = caps[2].parse::<u64>() {
                if total > 0 {
                    self.total_frames = Some(total);
                }
            }
            Some((frame, parse_decimal(&caps[3]).unwrap_or(0.0)))
        } else if let Some(caps) = FRAMES_RE.captures(line) {
            Some((
                caps[1].parse().unwrap_or(0),
                parse_decimal(&caps[2]).unwrap_or(0.0),
            ))
        } else {
            None
        };
        match parsed.and_then(|(frame, fps)| self.event(frame, fps, elapsed)) {
            Some(event) => ParseOutcome::Progress(event),
            None => ParseOutcome::Log(line.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_discovers_total() {
        let mut p = X264Parser::new(0);
        match p.parse_line(
            "[25.0%] 250/1000 frames, 50.00 fps, 1500.00 kb/s, eta 0:00:15",
            Duration::from_secs(5),
        ) {
            ParseOutcome::Progress(e) => {
                assert_eq!(e.percent, 25.0);
                assert_eq!(e.remaining_secs, 15.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(p.total_frames(), Some(1000));
    }

    #[test]
    fn frames_line_needs_known_total() {
        let mut unknown = X264Parser::new(0);
        assert!(matches!(
            unknown.parse_line("500 frames: 25.00 fps, 1200.50 kb/s", Duration::from_secs(20)),
            ParseOutcome::Log(_)
        ));
        let mut known = X264Parser::new(1000);
        match known.parse_line("500 frames: 25.00 fps, 1200.50 kb/s", Duration::from_secs(20)) {
            ParseOutcome::Progress(e) => {
                assert_eq!(e.percent, 50.0);
                assert_eq!(e.remaining_secs, 20.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
