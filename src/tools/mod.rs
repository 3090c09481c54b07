//! External tools and the process descriptors used to launch them.

pub mod discovery;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

#[cfg(windows)]
use std::os::windows::process::CommandExt;

use serde::{Deserialize, Serialize};

pub use discovery::ToolLocator;

/// Every external executable the pipeline knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Tool {
    Ffmpeg,
    FfmsIndex,
    X264,
    MkvMerge,
    MkvExtract,
    Mp4Box,
    TsMuxer,
    Eac3To,
    Lame,
    NeroAacEnc,
    OggEnc,
    BdSup2Sub,
    Java,
    Mplayer,
    Mplex,
    SpuMux,
    DvdAuthor,
}

impl Tool {
    pub const ALL: [Tool; 17] = [
        Tool::Ffmpeg,
        Tool::FfmsIndex,
        Tool::X264,
        Tool::MkvMerge,
        Tool::MkvExtract,
        Tool::Mp4Box,
        Tool::TsMuxer,
        Tool::Eac3To,
        Tool::Lame,
        Tool::NeroAacEnc,
        Tool::OggEnc,
        Tool::BdSup2Sub,
        Tool::Java,
        Tool::Mplayer,
        Tool::Mplex,
        Tool::SpuMux,
        Tool::DvdAuthor,
    ];

    /// Stable id used in config overrides and env var names.
    pub fn id(self) -> &'static str {
        match self {
            Tool::Ffmpeg => "ffmpeg",
            Tool::FfmsIndex => "ffmsindex",
            Tool::X264 => "x264",
            Tool::MkvMerge => "mkvmerge",
            Tool::MkvExtract => "mkvextract",
            Tool::Mp4Box => "mp4box",
            Tool::TsMuxer => "tsmuxer",
            Tool::Eac3To => "eac3to",
            Tool::Lame => "lame",
            Tool::NeroAacEnc => "neroaacenc",
            Tool::OggEnc => "oggenc",
            Tool::BdSup2Sub => "bdsup2sub",
            Tool::Java => "java",
            Tool::Mplayer => "mplayer",
            Tool::Mplex => "mplex",
            Tool::SpuMux => "spumux",
            Tool::DvdAuthor => "dvdauthor",
        }
    }

    /// Name used in log lines and error messages.
    pub fn display_name(self) -> &'static str {
        match self {
            Tool::Ffmpeg => "ffmpeg",
            Tool::FfmsIndex => "ffmsindex",
            Tool::X264 => "x264",
            Tool::MkvMerge => "mkvmerge",
            Tool::MkvExtract => "mkvextract",
            Tool::Mp4Box => "MP4Box",
            Tool::TsMuxer => "tsMuxeR",
            Tool::Eac3To => "eac3to",
            Tool::Lame => "lame",
            Tool::NeroAacEnc => "neroAacEnc",
            Tool::OggEnc => "oggenc",
            Tool::BdSup2Sub => "BDSup2Sub",
            Tool::Java => "java",
            Tool::Mplayer => "mplayer",
            Tool::Mplex => "mplex",
            Tool::SpuMux => "spumux",
            Tool::DvdAuthor => "dvdauthor",
        }
    }

    /// File name looked up in the tools dir. BDSup2Sub is a jar run through java.
    pub fn file_name(self, use_64bit: bool) -> String {
        let base = match self {
            Tool::BdSup2Sub => return "BDSup2Sub.jar".to_string(),
            Tool::Ffmpeg if use_64bit => "ffmpeg_64",
            Tool::X264 if use_64bit => "x264_64",
            Tool::Lame if use_64bit => "lame_64",
            Tool::OggEnc if use_64bit => "oggenc_64",
            Tool::Mp4Box => "MP4Box",
            Tool::TsMuxer => "tsMuxeR",
            Tool::NeroAacEnc => "neroAacEnc",
            other => other.id(),
        };
        if cfg!(windows) {
            format!("{}.exe", base)
        } else {
            base.to_string()
        }
    }

    pub fn has_64bit_build(self) -> bool {
        matches!(self, Tool::Ffmpeg | Tool::X264 | Tool::Lame | Tool::OggEnc)
    }

    /// Env var consulted before the tools dir, e.g. `VIDCONVERT_FFMPEG`.
    pub fn env_var(self) -> String {
        format!("VIDCONVERT_{}", self.id().to_ascii_uppercase())
    }

    /// Tools that must be installed alongside this one to run it.
    pub fn companions(self) -> &'static [Tool] {
        match self {
            Tool::BdSup2Sub => &[Tool::Java],
            _ => &[],
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Ready-to-start child process descriptor. Building one never starts anything.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub tool: Tool,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Capture stdout/stderr for progress parsing.
    pub capture_output: bool,
    /// CREATE_NO_WINDOW on Windows; no effect elsewhere.
    pub hide_window: bool,
    /// Feed this file to the child's stdin (spumux reads the MPEG stream there).
    pub stdin_file: Option<PathBuf>,
    /// Redirect stdout into this file; only stderr is parsed then.
    pub stdout_file: Option<PathBuf>,
}

impl Invocation {
    pub fn new(tool: Tool, program: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            capture_output: true,
            hide_window: true,
            stdin_file: None,
            stdout_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path_to_string(path))
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    pub fn stdout_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }

    /// Command line as logged ("start parameter").
    pub fn display(&self) -> String {
        let mut out = quote_if_needed(&path_to_string(&self.program));
        for arg in &self.args {
            out.push(' ');
            out.push_str(&quote_if_needed(arg));
        }
        out
    }

    /// Builds the `Command`. Stdio files are opened here, so this can fail.
    pub fn command(&self) -> std::io::Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        match &self.stdin_file {
            Some(path) => {
                cmd.stdin(Stdio::from(std::fs::File::open(path)?));
            }
            None => {
                cmd.stdin(Stdio::null());
            }
        }
        match (&self.stdout_file, self.capture_output) {
            (Some(path), _) => {
                cmd.stdout(Stdio::from(std::fs::File::create(path)?));
            }
            (None, true) => {
                cmd.stdout(Stdio::piped());
            }
            (None, false) => {
                cmd.stdout(Stdio::null());
            }
        }
        if self.capture_output {
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stderr(Stdio::null());
        }
        #[cfg(windows)]
        if self.hide_window {
            cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW
        }
        Ok(cmd)
    }
}

pub fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn quote_if_needed(s: &str) -> String {
    if s.is_empty() || s.contains(char::is_whitespace) {
        format!("\"{}\"", s)
    } else {
        s.to_string()
    }
}

/// Null sink for tools that must write somewhere (cropdetect, first passes).
pub fn null_device() -> &'static str {
    if cfg!(windows) { "NUL" } else { "/dev/null" }
}
