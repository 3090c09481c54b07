//! ffmpeg stderr formats: demux/copy, video encode, audio encode and cropdetect.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::{
    JobUpdate, OutputParser, ParseOutcome, ProgressEvent, eta_from_rate, parse_decimal,
    parse_timestamp,
};
use crate::job::CropRect;
use crate::tools::Tool;

static DEMUX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"size=\s*?(\d+)[\w\s]+?time=([\d\.\:]+)").expect("invalid demux regex")
});
static STREAM_FPS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Stream #\d+:\d+.*Video:.*?([\d\.]+) fps").expect("invalid stream fps regex")
});
static VIDEO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"frame=\s*(\d*)\s*fps=\s*([\d\.]*).*time=\s*([\d\.\:]*).*bitrate=\s*([\d\.]*).*kbits/s",
    )
    .expect("invalid video regex")
});
static AUDIO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^size=\s*(\d+)\s*[kK]i?B\s*time=\s*([\d\.\:]+)\s*bitrate=")
        .expect("invalid audio regex")
});
static CROP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"crop=(\d*):(\d*):(\d*):(\d*)").expect("invalid crop regex"));
static FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"frame=\s*(\d*)").expect("invalid frame regex"));

/// Progress over media time. Shared by demux and audio encode.
fn time_progress(position: f64, length: f64, elapsed: Duration) -> ProgressEvent {
    let percent = position / length * 100.0;
    ProgressEvent::new(
        percent,
        elapsed,
        eta_from_rate(position, (length - position).max(0.0), elapsed),
    )
}

/// Stream copy into elementary streams.
///
/// Percent: `time / stream length`. ETA: remaining media seconds at the observed
/// media-seconds-per-second rate. Reports the source frame rate from the stream banner.
pub struct FfmpegDemuxParser {
    length_secs: f64,
}

impl FfmpegDemuxParser {
    pub fn new(length_secs: f64) -> Self {
        Self { length_secs }
    }
}

impl OutputParser for FfmpegDemuxParser {
    fn tool(&self) -> Tool {
        Tool::Ffmpeg
    }

    fn parse_line(&mut self, line: &str, elapsed: Duration) -> ParseOutcome {
        if let Some(caps) = DEMUX_RE.captures(line) {
            if self.length_secs <= 0.0 {
                return ParseOutcome::Log(line.to_string());
            }
            let Some(position) = parse_timestamp(&caps[2]) else {
                return ParseOutcome::Log(line.to_string());
            };
            return ParseOutcome::Progress(time_progress(position, self.length_secs, elapsed));
        }
        if let Some(caps) = STREAM_FPS_RE.captures(line) {
            if let Some(fps) = parse_decimal(&caps[1]).filter(|f| *f > 0.0) {
                return ParseOutcome::Update(JobUpdate::FrameRate { fps });
            }
        }
        ParseOutcome::Log(line.to_string())
    }
}

/// Video encodes (libx264, MPEG-2).
///
/// Percent: `frame / frame_count`. ETA: remaining frames divided by the coding
/// rate `frame / elapsed`, only once that rate exceeds 1 fps; zero otherwise.
pub struct FfmpegVideoParser {
    frame_count: u64,
}

impl FfmpegVideoParser {
    pub fn new(frame_count: u64) -> Self {
        Self { frame_count }
    }
}

impl OutputParser for FfmpegVideoParser {
    fn tool(&self) -> Tool {
        Tool::Ffmpeg
    }

    fn parse_line(&mut self, line: &str, elapsed: Duration) -> ParseOutcome {
        let Some(caps) = VIDEO_RE.captures(line) else {
            return ParseOutcome::Log(line.to_string());
        };
        let frame: u64 = caps[1].parse().unwrap_or(0);
        let reported_fps = parse_decimal(&caps[2]).unwrap_or(0.0);
        if self.frame_count == 0 {
            return ParseOutcome::Log(line.to_string());
        }
        let percent = frame as f64 / self.frame_count as f64 * 100.0;
        let secs = elapsed.as_secs_f64();
        let coding_fps = if secs > 0.0 { frame as f64 / secs } else { 0.0 };
        let remaining_frames = self.frame_count.saturating_sub(frame) as f64;
        let remaining = if coding_fps > 1.0 {
            remaining_frames / coding_fps
        } else {
            0.0
        };
        ParseOutcome::Progress(
            ProgressEvent::new(percent, elapsed, remaining)
                .with_fps(reported_fps)
                .with_frame(frame),
        )
    }
}

/// Audio encodes (AC3).
///
/// Percent: `time / stream length`. ETA: as for demux.
pub struct FfmpegAudioParser {
    length_secs: f64,
}

impl FfmpegAudioParser {
    pub fn new(length_secs: f64) -> Self {
        Self { length_secs }
    }
}

impl OutputParser for FfmpegAudioParser {
    fn tool(&self) -> Tool {
        Tool::Ffmpeg
    }

    fn parse_line(&mut self, line: &str, elapsed: Duration) -> ParseOutcome {
        let Some(caps) = AUDIO_RE.captures(line.trim_start()) else {
            return ParseOutcome::Log(line.to_string());
        };
        if self.length_secs <= 0.0 {
            return ParseOutcome::Log(line.to_string());
        }
        match parse_timestamp(&caps[2]) {
            Some(position) => {
                ParseOutcome::Progress(time_progress(position, self.length_secs, elapsed))
            }
            None => ParseOutcome::Log(line.to_string()),
        }
    }
}

/// cropdetect over the first `frames` frames.
///
/// Each `crop=` line becomes a job update (last one wins). Percent:
/// `frame / frames`. ETA: remaining frames at the observed frame rate.
pub struct CropDetectParser {
    frames: u64,
}

impl CropDetectParser {
    pub fn new(frames: u64) -> Self {
        Self { frames }
    }
}

impl OutputParser for CropDetectParser {
    fn tool(&self) -> Tool {
        Tool::Ffmpeg
    }

    fn parse_line(&mut self, line: &str, elapsed: Duration) -> ParseOutcome {
        if let Some(caps) = CROP_RE.captures(line) {
            let field = |i: usize| caps[i].parse::<u32>().unwrap_or(0);
            return ParseOutcome::Update(JobUpdate::CropRect(CropRect {
                width: field(1),
                height: field(2),
                left: field(3),
                top: field(4),
            }));
        }
        if let Some(caps) = FRAME_RE.captures(line) {
            if self.frames == 0 {
                return ParseOutcome::Log(line.to_string());
            }
            let frame: u64 = caps[1].parse().unwrap_or(0);
            let done = frame.min(self.frames);
            let percent = done as f64 / self.frames as f64 * 100.0;
            let remaining = eta_from_rate(done as f64, (self.frames - done) as f64, elapsed);
            return ParseOutcome::Progress(
                ProgressEvent::new(percent, elapsed, remaining).with_frame(frame),
            );
        }
        ParseOutcome::Log(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demux_progress_from_time() {
        let mut p = FfmpegDemuxParser::new(100.0);
        let line = "frame= 1200 fps=600 q=-1.0 size=   20480kB time=00:00:25.00 bitrate=6710.9kbits/s";
        match p.parse_line(line, Duration::from_secs(5)) {
            ParseOutcome::Progress(e) => {
                assert_eq!(e.percent, 25.0);
                // 25 media secs in 5 s -> 5x; 75 left -> 15 s
                assert_eq!(e.remaining_secs, 15.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn demux_without_length_defers() {
        let mut p = FfmpegDemuxParser::new(0.0);
        let line = "size=   20480kB time=00:00:25.00 bitrate=6710.9kbits/s";
        assert!(matches!(
            p.parse_line(line, Duration::from_secs(5)),
            ParseOutcome::Log(_)
        ));
    }

    #[test]
    fn demux_reports_frame_rate() {
        let mut p = FfmpegDemuxParser::new(100.0);
        let line = "  Stream #0:0(eng): Video: h264 (High), yuv420p, 1920x1080, 23.98 fps, 23.98 tbr, 1k tbn";
        assert_eq!(
            p.parse_line(line, Duration::ZERO),
            ParseOutcome::Update(JobUpdate::FrameRate { fps: 23.98 })
        );
    }

    #[test]
    fn video_progress_and_eta() {
        let mut p = FfmpegVideoParser::new(1000);
        let line = "frame=  250 fps= 50 q=28.0 size=    1024kB time=00:00:10.00 bitrate= 838.9kbits/s speed=2x";
        match p.parse_line(line, Duration::from_secs(5)) {
            ParseOutcome::Progress(e) => {
                assert_eq!(e.percent, 25.0);
                assert_eq!(e.frame, Some(250));
                assert_eq!(e.fps, Some(50.0));
                // 50 fps coding rate, 750 frames left
                assert_eq!(e.remaining_secs, 15.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn video_slow_start_has_zero_eta() {
        let mut p = FfmpegVideoParser::new(1000);
        let line = "frame=    1 fps=0.0 q=0.0 size=       0kB time=00:00:00.00 bitrate=N/A kbits/s";
        match p.parse_line(line, Duration::from_secs(5)) {
            ParseOutcome::Progress(e) => assert_eq!(e.remaining_secs, 0.0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn audio_progress() {
        let mut p = FfmpegAudioParser::new(200.0);
        let line = "size=    5120kB time=00:01:40.00 bitrate= 419.4kbits/s speed=50x";
        match p.parse_line(line, Duration::from_secs(2)) {
            ParseOutcome::Progress(e) => {
                assert_eq!(e.percent, 50.0);
                assert_eq!(e.remaining_secs, 2.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn crop_line_is_update() {
        let mut p = CropDetectParser::new(500);
        let line = "[Parsed_cropdetect_0 @ 0x55d] x1:0 x2:1919 y1:140 y2:939 w:1920 h:800 x:0 y:140 pts:1 t:0.04 crop=1920:800:0:140";
        assert_eq!(
            p.parse_line(line, Duration::ZERO),
            ParseOutcome::Update(JobUpdate::CropRect(CropRect {
                width: 1920,
                height: 800,
                left: 0,
                top: 140
            }))
        );
    }

    #[test]
    fn crop_frames_progress_capped() {
        let mut p = CropDetectParser::new(500);
        match p.parse_line("frame=  750 fps=300 q=-0.0 size=N/A", Duration::from_secs(2)) {
            ParseOutcome::Progress(e) => {
                assert_eq!(e.percent, 100.0);
                assert_eq!(e.remaining_secs, 0.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
