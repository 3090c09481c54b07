use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Command;

use parking_lot::Mutex;

use super::Tool;
use crate::config::AppConfig;
use crate::error::AppError;

#[cfg(target_os = "windows")]
fn find_in_path(name: &str) -> Option<PathBuf> {
    let output = Command::new("where").arg(name).output().ok()?;
    if output.status.success() {
        let path = String::from_utf8_lossy(&output.stdout);
        let first = path.lines().next()?.trim();
        if !first.is_empty() {
            return Some(PathBuf::from(first));
        }
    }
    None
}

#[cfg(not(target_os = "windows"))]
fn find_in_path(name: &str) -> Option<PathBuf> {
    let output = Command::new("which").arg(name).output().ok()?;
    if output.status.success() {
        let path = String::from_utf8_lossy(&output.stdout);
        let first = path.lines().next()?.trim();
        if !first.is_empty() {
            return Some(PathBuf::from(first));
        }
    }
    None
}

fn common_dirs() -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/opt/homebrew/bin"),
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/opt/local/bin"),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        vec![
            PathBuf::from("C:\\Program Files\\MKVToolNix"),
            PathBuf::from("C:\\ffmpeg\\bin"),
            PathBuf::from("C:\\Program Files\\ffmpeg\\bin"),
        ]
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    {
        vec![
            PathBuf::from("/usr/bin"),
            PathBuf::from("/usr/local/bin"),
            PathBuf::from("/usr/share/java"),
        ]
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows", unix)))]
    {
        vec![]
    }
}

/// Resolves tool executables from configuration, env, common dirs and PATH.
/// Results are cached per locator.
pub struct ToolLocator {
    overrides: HashMap<String, PathBuf>,
    tools_path: Option<PathBuf>,
    use_64bit: bool,
    search_system_path: bool,
    cache: Mutex<HashMap<Tool, PathBuf>>,
}

impl ToolLocator {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            overrides: config.tool_paths.clone().unwrap_or_default(),
            tools_path: config.tools_path.clone(),
            use_64bit: config.effective_use_64bit_encoders(),
            search_system_path: config.effective_search_system_path(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Locations tried for `tool`, in order, excluding the PATH lookup.
    /// Common install dirs are only searched together with PATH.
    pub fn candidates(&self, tool: Tool) -> Vec<PathBuf> {
        let mut out = Vec::new();
        if let Some(p) = self.overrides.get(tool.id()) {
            out.push(p.clone());
        }
        if let Ok(env_path) = std::env::var(tool.env_var()) {
            if !env_path.is_empty() {
                out.push(PathBuf::from(env_path));
            }
        }
        if let Some(dir) = &self.tools_path {
            if self.use_64bit && tool.has_64bit_build() {
                out.push(dir.join(tool.file_name(true)));
            }
            out.push(dir.join(tool.file_name(false)));
        }
        if self.search_system_path {
            for dir in common_dirs() {
                out.push(dir.join(tool.file_name(false)));
            }
        }
        out
    }

    fn locate(&self, tool: Tool) -> Result<PathBuf, AppError> {
        let candidates = self.candidates(tool);
        if let Some(found) = candidates.iter().find(|p| p.is_file()) {
            log::debug!(
                target: "vidconvert::tools::discovery",
                "{} found: {}",
                tool,
                found.display()
            );
            return Ok(found.clone());
        }

        if self.search_system_path && tool != Tool::BdSup2Sub {
            if let Some(p) = find_in_path(&tool.file_name(false)) {
                if p.exists() {
                    log::debug!(
                        target: "vidconvert::tools::discovery",
                        "{} found in PATH: {}",
                        tool,
                        p.display()
                    );
                    return Ok(p);
                }
            }
        }

        log::error!(
            target: "vidconvert::tools::discovery",
            "{} not found in configured or common locations",
            tool
        );
        let searched = candidates
            .iter()
            .map(|p| format!("  - {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n");
        Err(AppError::ToolNotFound(format!(
            "{} not found. Searched:\n{}{}\nSet `toolPaths.{}` in the config or the {} environment variable.",
            tool,
            searched,
            if self.search_system_path {
                "\n  - PATH"
            } else {
                ""
            },
            tool.id(),
            tool.env_var()
        )))
    }

    /// Path to `tool`, failing with a descriptive error when it is not installed.
    pub fn resolve(&self, tool: Tool) -> Result<PathBuf, AppError> {
        if let Some(path) = self.cache.lock().get(&tool) {
            log::trace!(
                target: "vidconvert::tools::discovery",
                "{} path (cached): {}",
                tool,
                path.display()
            );
            return Ok(path.clone());
        }
        let path = self.locate(tool)?;
        self.cache.lock().insert(tool, path.clone());
        Ok(path)
    }

    /// Resolves `tool` and everything it needs to run.
    pub fn require(&self, tool: Tool) -> Result<PathBuf, AppError> {
        for companion in tool.companions() {
            self.resolve(*companion)?;
        }
        self.resolve(tool)
    }
}
