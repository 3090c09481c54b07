//! App error type for the conversion engine. Implements Display and Serialize for event consumers.

use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    ToolNotFound(String),

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Failed to start {tool}: {message}")]
    Launch { tool: String, message: String },

    #[error("{tool} failed (code {code}): {detail}")]
    ToolFailed {
        tool: String,
        code: i32,
        detail: String,
    },

    #[error("{0}")]
    AlreadyRunning(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl AppError {
    pub fn tool_failed(tool: impl Into<String>, code: i32, detail: impl Into<String>) -> Self {
        Self::ToolFailed {
            tool: tool.into(),
            code,
            detail: detail.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short summary plus detail, for surfacing to a UI or event stream.
    pub fn payload(&self) -> ErrorPayload {
        match self {
            AppError::ToolFailed { tool, code, detail } => {
                describe_tool_exit(tool, Some(*code), detail)
            }
            AppError::Launch { tool, message } => describe_tool_exit(tool, Some(-1), message),
            _ => {
                let text = self.to_string();
                ErrorPayload {
                    summary: text.clone(),
                    detail: text,
                }
            }
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            AppError::ToolFailed { .. } => {
                let payload = self.payload();
                let json =
                    serde_json::json!({ "summary": payload.summary, "detail": payload.detail });
                serializer.serialize_str(&json.to_string())
            }
            _ => serializer.serialize_str(&self.to_string()),
        }
    }
}

impl From<String> for AppError {
    fn from(s: String) -> Self {
        if s == "Cancelled" {
            AppError::Cancelled
        } else {
            AppError::Other(s)
        }
    }
}

impl From<&str> for AppError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}

/// Payload for job error events. Consumers show summary; detail is expandable.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub summary: String,
    pub detail: String,
}

const ELLIPSIS: &str = "…";

/// Maps a tool exit code to a short summary. The diagnostic text is passed through as detail.
///
/// -1 is used for launch failures; 255/123 are what most tools report after a kill.
pub fn describe_tool_exit(tool: &str, exit_code: Option<i32>, diagnostic: &str) -> ErrorPayload {
    let summary = match exit_code {
        Some(-1) => format!("{} not found or failed to start.", tool),
        Some(1) => format!("{} failed.", tool),
        Some(123) | Some(255) => format!("{} was stopped.", tool),
        Some(code) => format!("{} failed (exit code {}).", tool, code),
        None => first_line_truncated(diagnostic, 120),
    };
    ErrorPayload {
        summary,
        detail: diagnostic.trim().to_string(),
    }
}

fn first_line_truncated(text: &str, max_len: usize) -> String {
    let first = text
        .lines()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.trim())
        .unwrap_or(text);
    if first.len() <= max_len {
        return first.to_string();
    }
    let mut cut = max_len.saturating_sub(ELLIPSIS.len());
    while !first.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &first[..cut], ELLIPSIS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_cancelled_string() {
        let e = AppError::from("Cancelled");
        assert!(e.is_cancelled());
    }

    #[test]
    fn from_other_string() {
        let e = AppError::from("some error message");
        match &e {
            AppError::Other(msg) => assert_eq!(msg, "some error message"),
            _ => panic!("expected Other"),
        }
    }

    #[test]
    fn tool_failed_display() {
        let e = AppError::tool_failed("x264", 3, "x264 [error]: could not open input file");
        assert_eq!(
            e.to_string(),
            "x264 failed (code 3): x264 [error]: could not open input file"
        );
    }

    #[test]
    fn payload_for_known_exit_codes() {
        assert_eq!(
            describe_tool_exit("ffmpeg", Some(1), "").summary,
            "ffmpeg failed."
        );
        assert_eq!(
            describe_tool_exit("mkvmerge", Some(255), "").summary,
            "mkvmerge was stopped."
        );
        assert_eq!(
            describe_tool_exit("lame", Some(-1), "").summary,
            "lame not found or failed to start."
        );
        assert_eq!(
            describe_tool_exit("lame", Some(42), "").summary,
            "lame failed (exit code 42)."
        );
    }

    #[test]
    fn payload_without_code_uses_first_line() {
        let p = describe_tool_exit("tsMuxeR", None, "\n  bad meta file  \nsecond");
        assert_eq!(p.summary, "bad meta file");
        assert_eq!(p.detail, "bad meta file  \nsecond");
    }

    #[test]
    fn long_first_line_truncated() {
        let long = "x".repeat(300);
        let p = describe_tool_exit("ffmpeg", None, &long);
        assert!(p.summary.ends_with(ELLIPSIS));
        assert!(p.summary.len() <= 120);
    }

    #[test]
    fn launch_payload_maps_to_minus_one() {
        let e = AppError::Launch {
            tool: "ffmsindex".into(),
            message: "No such file".into(),
        };
        let p = e.payload();
        assert_eq!(p.summary, "ffmsindex not found or failed to start.");
        assert_eq!(p.detail, "No such file");
    }
}
