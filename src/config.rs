//! Engine configuration: tool locations, temp dirs and queue policy flags.
//!
//! Every field is optional in the JSON file; `effective_*` accessors supply defaults.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AppError;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Directory holding bundled tool executables.
    pub tools_path: Option<PathBuf>,
    /// Per-tool executable overrides, keyed by tool id (`ffmpeg`, `mkvmerge`, ...).
    pub tool_paths: Option<HashMap<String, PathBuf>>,
    /// Fall back to common install dirs and `which`/`where`. Default true.
    pub search_system_path: Option<bool>,
    pub temp_path: Option<PathBuf>,
    /// Where demuxed streams are written. Default: temp path.
    pub demux_location: Option<PathBuf>,
    #[serde(rename = "use64bitEncoders")]
    pub use_64bit_encoders: Option<bool>,
    pub use_ffmpeg_scaling: Option<bool>,
    /// Encode x264 video with the standalone x264 CLI instead of ffmpeg's libx264.
    pub prefer_standalone_x264: Option<bool>,
    /// 0 lets each tool pick its own thread count.
    pub thread_count: Option<u32>,
    pub delete_temporary_files: Option<bool>,
    pub delete_completed_jobs: Option<bool>,
    pub delete_failed_jobs: Option<bool>,
    pub halt_on_error: Option<bool>,
    pub crop_detect_frames: Option<u32>,
    #[serde(rename = "tsMuxeRBlurayAudioPes")]
    pub ts_muxer_bluray_audio_pes: Option<bool>,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let text = fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, AppError> {
        let config: AppConfig =
            serde_json::from_str(text).map_err(|e| AppError::Config(e.to_string()))?;
        if config.effective_crop_detect_frames() == 0 {
            return Err(AppError::Config(
                "cropDetectFrames must be greater than 0".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn tool_override(&self, tool_id: &str) -> Option<&Path> {
        self.tool_paths
            .as_ref()
            .and_then(|m| m.get(tool_id))
            .map(PathBuf::as_path)
    }

    pub fn effective_search_system_path(&self) -> bool {
        self.search_system_path.unwrap_or(true)
    }

    pub fn effective_temp_path(&self) -> PathBuf {
        self.temp_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("vidconvert"))
    }

    pub fn effective_demux_location(&self) -> PathBuf {
        self.demux_location
            .clone()
            .unwrap_or_else(|| self.effective_temp_path())
    }

    pub fn effective_use_64bit_encoders(&self) -> bool {
        self.use_64bit_encoders.unwrap_or(false)
    }

    pub fn effective_use_ffmpeg_scaling(&self) -> bool {
        self.use_ffmpeg_scaling.unwrap_or(false)
    }

    pub fn effective_prefer_standalone_x264(&self) -> bool {
        self.prefer_standalone_x264.unwrap_or(false)
    }

    pub fn effective_thread_count(&self) -> u32 {
        self.thread_count.unwrap_or(0)
    }

    pub fn effective_delete_temporary_files(&self) -> bool {
        self.delete_temporary_files.unwrap_or(true)
    }

    pub fn effective_delete_completed_jobs(&self) -> bool {
        self.delete_completed_jobs.unwrap_or(false)
    }

    pub fn effective_delete_failed_jobs(&self) -> bool {
        self.delete_failed_jobs.unwrap_or(false)
    }

    pub fn effective_halt_on_error(&self) -> bool {
        self.halt_on_error.unwrap_or(false)
    }

    pub fn effective_crop_detect_frames(&self) -> u32 {
        self.crop_detect_frames.unwrap_or(500)
    }

    pub fn effective_ts_muxer_bluray_audio_pes(&self) -> bool {
        self.ts_muxer_bluray_audio_pes.unwrap_or(false)
    }

    /// Creates the temp and demux directories if missing.
    pub fn ensure_work_dirs(&self) -> Result<(), AppError> {
        fs::create_dir_all(self.effective_temp_path())?;
        fs::create_dir_all(self.effective_demux_location())?;
        Ok(())
    }
}
