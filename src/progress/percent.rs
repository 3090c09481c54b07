use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use super::{OutputParser, ParseOutcome, ProgressEvent, eta_from_percent, parse_decimal};
use crate::tools::Tool;

static FFMSINDEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Indexing, please wait\.\.\. (\d+)%").expect("invalid ffmsindex regex")
});
static MKVTOOLNIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.?Progress: (\d+?)%").expect("invalid mkvtoolnix regex"));
static TSMUXER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([\d\.]+?)% complete").expect("invalid tsMuxeR regex"));
static MPLAYER_DUMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^dump: .*\(~([\d\.]+?)%\)$").expect("invalid mplayer dump regex")
});
static LAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\s*(\d+)%\)").expect("invalid lame regex"));
static OGGENC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\s*([\d\.,]+)%\]").expect("invalid oggenc regex"));

/// Parser for tools that print their own completion percentage.
///
/// ETA: `(100 - p) * elapsed / p`.
pub struct PercentParser {
    tool: Tool,
    pattern: &'static LazyLock<Regex>,
}

impl PercentParser {
    /// `Indexing, please wait... 42%`
    pub fn ffms_index() -> Self {
        Self::with(Tool::FfmsIndex, &FFMSINDEX_RE)
    }

    /// `Progress: 42%`, shared by mkvmerge and mkvextract.
    pub fn mkvtoolnix(tool: Tool) -> Self {
        Self::with(tool, &MKVTOOLNIX_RE)
    }

    /// `42.3% complete`, both demux and mux.
    pub fn ts_muxer() -> Self {
        Self::with(Tool::TsMuxer, &TSMUXER_RE)
    }

    /// `dump: 1234567 bytes written (~42.3%)`
    pub fn mplayer_dump() -> Self {
        Self::with(Tool::Mplayer, &MPLAYER_DUMP_RE)
    }

    /// `   512/4096   (12%)| 0:01/ 0:09| ...`
    pub fn lame() -> Self {
        Self::with(Tool::Lame, &LAME_RE)
    }

    /// `	[ 42.3%] [ 0m12s remaining] |`
    pub fn oggenc() -> Self {
        Self::with(Tool::OggEnc, &OGGENC_RE)
    }

    fn with(tool: Tool, pattern: &'static LazyLock<Regex>) -> Self {
        Self { tool, pattern }
    }
}

impl OutputParser for PercentParser {
    fn tool(&self) -> Tool {
        self.tool
    }

    fn parse_line(&mut self, line: &str, elapsed: Duration) -> ParseOutcome {
        let Some(caps) = self.pattern.captures(line) else {
            return ParseOutcome::Log(line.to_string());
        };
        let Some(percent) = parse_decimal(&caps[1]) else {
            return ParseOutcome::Log(line.to_string());
        };
        ParseOutcome::Progress(ProgressEvent::new(
            percent,
            elapsed,
            eta_from_percent(percent, elapsed),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn percent_of(parser: &mut PercentParser, line: &str) -> Option<f64> {
        match parser.parse_line(line, Duration::from_secs(10)) {
            ParseOutcome::Progress(e) => Some(e.percent),
            _ => None,
        }
    }

    #[test]
    fn ffmsindex_progress() {
        let mut p = PercentParser::ffms_index();
        match p.parse_line("Indexing, please wait... 25%", Duration::from_secs(10)) {
            ParseOutcome::Progress(e) => {
                assert_eq!(e.percent, 25.0);
                assert_eq!(e.remaining_secs, 30.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ffmsindex_zero_percent_has_zero_eta() {
        let mut p = PercentParser::ffms_index();
        match p.parse_line("Indexing, please wait... 0%", Duration::from_secs(3)) {
            ParseOutcome::Progress(e) => {
                assert_eq!(e.percent, 0.0);
                assert_eq!(e.remaining_secs, 0.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ffmsindex_full_percent_has_zero_eta() {
        let mut p = PercentParser::ffms_index();
        match p.parse_line("Indexing, please wait... 100%", Duration::from_secs(3)) {
            ParseOutcome::Progress(e) => assert_eq!(e.remaining_secs, 0.0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn mkvmerge_progress() {
        let mut p = PercentParser::mkvtoolnix(Tool::MkvMerge);
        assert_eq!(percent_of(&mut p, "Progress: 57%"), Some(57.0));
        assert_eq!(percent_of(&mut p, "#GUI#progress 57%"), None);
    }

    #[test]
    fn tsmuxer_progress() {
        let mut p = PercentParser::ts_muxer();
        assert_eq!(percent_of(&mut p, "12.3% complete"), Some(12.3));
    }

    #[test]
    fn mplayer_dump_progress() {
        let mut p = PercentParser::mplayer_dump();
        assert_eq!(
            percent_of(&mut p, "dump: 104857600 bytes written (~12.5%)"),
            Some(12.5)
        );
    }

    #[test]
    fn lame_and_oggenc_progress() {
        let mut lame = PercentParser::lame();
        assert_eq!(
            percent_of(&mut lame, "   512/4096   (12%)|    0:01/    0:09|"),
            Some(12.0)
        );
        let mut ogg = PercentParser::oggenc();
        assert_eq!(
            percent_of(&mut ogg, "\t[ 42,5%] [ 0m12s remaining] |"),
            Some(42.5)
        );
    }

    #[test]
    fn unmatched_line_is_logged() {
        let mut p = PercentParser::ts_muxer();
        assert_eq!(
            p.parse_line("Muxing started", Duration::ZERO),
            ParseOutcome::Log("Muxing started".into())
        );
    }
}
