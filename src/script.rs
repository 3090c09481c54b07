//! AviSynth filter scripts consumed by the video encoder when the profile needs
//! crop, resize, deinterlace or burned-in subtitles.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AppError;
use crate::job::{Job, SubtitleInfo};
use crate::tools::path_to_string;

/// Produces a script file for a job and returns its path.
pub trait FilterScriptGenerator: Send + Sync {
    fn generate(&self, job: &Job, dir: &Path) -> Result<PathBuf, AppError>;
}

/// Writes `<base>.avs` using the FFMS2 source filter.
pub struct AviSynthScripts {
    plugin_dir: Option<PathBuf>,
}

impl AviSynthScripts {
    /// `plugin_dir` holds ffms2 / yadif / VSFilter / SupTitle; plugins are autoloaded when `None`.
    pub fn new(plugin_dir: Option<PathBuf>) -> Self {
        Self { plugin_dir }
    }

    fn load_plugin(&self, out: &mut String, dll: &str, c_plugin: bool) {
        if let Some(dir) = &self.plugin_dir {
            let func = if c_plugin { "LoadCPlugin" } else { "LoadPlugin" };
            out.push_str(&format!(
                "{}(\"{}\")\n",
                func,
                path_to_string(&dir.join(dll))
            ));
        }
    }

    pub fn render(&self, job: &Job) -> String {
        let video = &job.video_stream;
        let source = video
            .temp_file
            .as_deref()
            .unwrap_or_else(|| job.source_file());
        let mut out = String::new();

        self.load_plugin(&mut out, "ffms2.dll", false);
        let mut source_call = format!("FFVideoSource(\"{}\"", path_to_string(source));
        if let Some(index) = &job.ff_index_file {
            source_call.push_str(&format!(", cachefile=\"{}\"", path_to_string(index)));
        }
        if video.fps_num > 0 && video.fps_den > 0 {
            source_call.push_str(&format!(
                ", fpsnum={}, fpsden={}",
                video.fps_num, video.fps_den
            ));
        }
        source_call.push_str(")\n");
        out.push_str(&source_call);

        if job.profile.deinterlace && video.interlaced {
            self.load_plugin(&mut out, "yadif.dll", true);
            out.push_str("Yadif(order=-1)\n");
        }

        if let Some(crop) = video.crop_rect {
            let right = video.width.saturating_sub(crop.left + crop.width);
            let bottom = video.height.saturating_sub(crop.top + crop.height);
            if crop.left > 0 || crop.top > 0 || right > 0 || bottom > 0 {
                out.push_str(&format!(
                    "Crop({}, {}, -{}, -{})\n",
                    crop.left, crop.top, right, bottom
                ));
            }
        }

        if let Some((width, height)) = target_size(job) {
            out.push_str(&format!("Spline36Resize({}, {})\n", width, height));
        }

        for sub in job.subtitle_streams.iter().filter(|s| s.hard_sub_into_video) {
            if let Some(line) = self.subtitle_filter(&mut out, sub) {
                out.push_str(&line);
            }
        }
        out
    }

    fn subtitle_filter(&self, out: &mut String, sub: &SubtitleInfo) -> Option<String> {
        let file = path_to_string(sub.temp_file.as_deref()?);
        let line = match sub.format.to_ascii_lowercase().as_str() {
            "pgs" => {
                self.load_plugin(out, "SupTitle.dll", false);
                format!("SupTitle(\"{}\")\n", file)
            }
            "vobsub" => {
                self.load_plugin(out, "VSFilter.dll", false);
                format!("VobSub(\"{}\")\n", file)
            }
            _ => {
                self.load_plugin(out, "VSFilter.dll", false);
                format!("TextSub(\"{}\")\n", file)
            }
        };
        Some(line)
    }
}

impl FilterScriptGenerator for AviSynthScripts {
    fn generate(&self, job: &Job, dir: &Path) -> Result<PathBuf, AppError> {
        let path = dir.join(format!("{}.avs", job.base_name()));
        fs::write(&path, self.render(job))?;
        log::debug!(
            target: "vidconvert::script",
            "Wrote filter script {}",
            path.display()
        );
        Ok(path)
    }
}

/// Resize target after crop, mod-16 width and height following the cropped aspect ratio.
pub(crate) fn target_size(job: &Job) -> Option<(u32, u32)> {
    if job.profile.keep_input_resolution {
        return None;
    }
    let target_width = job.profile.target_width?;
    let video = &job.video_stream;
    let (width, height) = match video.crop_rect {
        Some(crop) => (crop.width, crop.height),
        None => (video.width, video.height),
    };
    if width == 0 || height == 0 || target_width >= width {
        return None;
    }
    let out_width = target_width / 16 * 16;
    let out_height = ((height as f64 * out_width as f64 / width as f64) / 16.0).round() as u32 * 16;
    Some((out_width, out_height.max(16)))
}
