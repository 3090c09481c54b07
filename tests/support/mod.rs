#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tempfile::TempDir;
use vidconvert_core::AppConfig;
use vidconvert_core::job::{AudioInfo, AudioProfile, EncodingProfile, Job, VideoProfile};
use vidconvert_core::queue::QueueEvent;
use vidconvert_core::tools::Tool;

/// ffmpeg that succeeds and prints a stats line.
pub const FFMPEG_OK: &str = r#"echo "  Duration: 00:00:10.00, start: 0.000000, bitrate: 1000 kb/s" >&2
echo "frame=  125 fps= 50 q=20.0 size=    1024kB time=00:00:05.00 bitrate=1677.7kbits/s speed=2x" >&2
echo "frame=  250 fps= 50 q=20.0 Lsize=    2048kB time=00:00:10.00 bitrate=1677.7kbits/s speed=2x" >&2
exit 0"#;

/// ffmpeg that fails whenever it is asked to encode H.264.
pub const FFMPEG_X264_FAILS: &str = r#"case "$*" in
  *libx264*)
    echo "frame=   10 fps=5.0 q=20.0 size=       1kB time=00:00:00.40 bitrate=  10.0kbits/s" >&2
    echo "Conversion failed!" >&2
    exit 1
    ;;
esac
echo "frame=  250 fps= 50 q=20.0 Lsize=    2048kB time=00:00:10.00 bitrate=1677.7kbits/s" >&2
exit 0"#;

/// mkvmerge that writes the file named after `-o`.
pub const MKVMERGE_OK: &str = r#"echo "Progress: 50%"
echo "Progress: 100%"
: > "$2"
exit 0"#;

/// Scratch directory with executable fake tools under `tools/` and a config
/// pointing at them.
pub struct FakeTools {
    pub dir: TempDir,
    pub config: AppConfig,
}

impl FakeTools {
    /// Every tool succeeds silently unless overridden with [`FakeTools::script`].
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools_dir = dir.path().join("tools");
        fs::create_dir_all(&tools_dir).expect("create tools dir");
        let mut tool_paths = HashMap::new();
        for tool in Tool::ALL {
            tool_paths.insert(tool.id().to_string(), tools_dir.join(tool.id()));
        }
        let config = AppConfig {
            tool_paths: Some(tool_paths),
            search_system_path: Some(false),
            temp_path: Some(dir.path().join("tmp")),
            ..AppConfig::default()
        };
        let env = Self { dir, config };
        for tool in Tool::ALL {
            env.script(tool, "exit 0");
        }
        env.script(Tool::Ffmpeg, FFMPEG_OK);
        env.script(Tool::MkvMerge, MKVMERGE_OK);
        env
    }

    pub fn tool_path(&self, tool: Tool) -> PathBuf {
        self.dir.path().join("tools").join(tool.id())
    }

    /// Replaces the fake for `tool` with a `/bin/sh` script running `body`.
    pub fn script(&self, tool: Tool, body: &str) {
        let path = self.tool_path(tool);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write fake tool");
        let mut perms = fs::metadata(&path).expect("stat fake tool").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("chmod fake tool");
    }

    pub fn remove(&self, tool: Tool) {
        fs::remove_file(self.tool_path(tool)).expect("remove fake tool");
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Matroska job with one DTS track: demux, encode video, encode audio, mux.
    pub fn job(&self, name: &str) -> Job {
        self.job_with(name, EncodingProfile::default())
    }

    /// Like [`FakeTools::job`] but copying video: demux, encode audio, mux.
    pub fn copy_job(&self, name: &str) -> Job {
        let profile = EncodingProfile {
            video: VideoProfile::Copy,
            ..EncodingProfile::default()
        };
        self.job_with(name, profile)
    }

    pub fn job_with(&self, name: &str, profile: EncodingProfile) -> Job {
        let mut job = Job::new(
            self.path(&format!("{}.m2ts", name)),
            self.path(&format!("out/{}.mkv", name)),
            profile,
        );
        job.video_stream.format = "AVC".to_string();
        job.video_stream.width = 1920;
        job.video_stream.height = 1080;
        job.video_stream.fps = 25.0;
        job.video_stream.fps_num = 25;
        job.video_stream.fps_den = 1;
        job.video_stream.frame_count = 250;
        job.video_stream.length_secs = 10.0;
        job.audio_streams.push(AudioInfo {
            id: 1,
            stream_id: 1,
            lang_code: "en".to_string(),
            format: "DTS".to_string(),
            channels: 6,
            sample_rate: 48_000,
            ..AudioInfo::default()
        });
        job
    }
}

pub fn copy_audio(mut job: Job) -> Job {
    job.profile.audio = AudioProfile::Copy;
    job
}

/// Drains the channel; it ends when the worker finishes.
pub fn collect(events: Receiver<QueueEvent>) -> Vec<QueueEvent> {
    events.iter().collect()
}

pub fn wait_for(events: &Receiver<QueueEvent>, mut done: impl FnMut(&QueueEvent) -> bool) -> Vec<QueueEvent> {
    let mut seen = Vec::new();
    loop {
        let event = events
            .recv_timeout(Duration::from_secs(20))
            .expect("queue event before timeout");
        let hit = done(&event);
        seen.push(event);
        if hit {
            return seen;
        }
    }
}

pub fn job_started_ids(events: &[QueueEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            QueueEvent::JobStarted { job_id, .. } => Some(*job_id),
            _ => None,
        })
        .collect()
}

/// `kill -0`: true while a process with this pid exists.
pub fn process_alive(pid: &str) -> bool {
    Command::new("kill")
        .args(["-0", pid.trim()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

pub fn read_pid(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().filter(|s| !s.trim().is_empty())
}

/// Polls until `path` holds a pid, for at most `timeout`.
pub fn wait_for_pid(path: &Path, timeout: Duration) -> Option<String> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(pid) = read_pid(path) {
            return Some(pid);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(20));
    }
}
