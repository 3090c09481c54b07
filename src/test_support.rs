//! Unit-test fixtures: a scratch dir with placeholder tool files and a matching config.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::config::AppConfig;
use crate::script::AviSynthScripts;
use crate::step::StepContext;
use crate::tools::{Tool, ToolLocator};

pub struct ToolEnv {
    pub dir: TempDir,
    pub config: AppConfig,
    pub tools: ToolLocator,
    pub scripts: AviSynthScripts,
}

impl ToolEnv {
    /// Every tool present as an empty file under `<dir>/tools`.
    pub fn new() -> Self {
        Self::with_tools(&Tool::ALL)
    }

    pub fn with_tools(present: &[Tool]) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let tools_dir = dir.path().join("tools");
        fs::create_dir_all(&tools_dir).expect("create tools dir");
        let mut tool_paths = HashMap::new();
        for tool in Tool::ALL {
            let path = tools_dir.join(tool.id());
            if present.contains(&tool) {
                fs::write(&path, b"").expect("write tool placeholder");
            }
            tool_paths.insert(tool.id().to_string(), path);
        }
        let config = AppConfig {
            tool_paths: Some(tool_paths),
            search_system_path: Some(false),
            temp_path: Some(dir.path().join("tmp")),
            ..AppConfig::default()
        };
        let tools = ToolLocator::new(&config);
        Self {
            dir,
            config,
            tools,
            scripts: AviSynthScripts::new(None),
        }
    }

    pub fn ctx(&self) -> StepContext<'_> {
        StepContext {
            config: &self.config,
            tools: &self.tools,
            scripts: &self.scripts,
        }
    }

    pub fn tmp(&self) -> PathBuf {
        self.dir.path().join("tmp")
    }

    pub fn tool_path(&self, tool: Tool) -> PathBuf {
        self.dir.path().join("tools").join(tool.id())
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// `path` as it appears in an argument list.
pub fn arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
