//! Upstream line shaping: timestamp prefix split, truncation, level sniffing.

use chrono::DateTime;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::LogLevel;

/// Stable ASCII-detectable suffix appended to truncated lines so the UI can
/// flag them.
pub const TRUNCATION_MARKER: &str = "…[truncated]";

/// A line as produced by the upstream reader, before a worker stamps it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLine {
    /// Source timestamp in nanoseconds, when the upstream prefix parsed.
    pub ts: Option<i64>,
    pub line: String,
    pub truncated: bool,
}

/// Split off the RFC3339Nano timestamp the kubelet prepends when
/// `timestamps=true`. A line that does not start with a parsable timestamp
/// is kept intact with `ts: None`.
pub fn parse_source_line(raw: &str, truncated: bool) -> SourceLine {
    if let Some((prefix, rest)) = raw.split_once(' ') {
        if let Ok(dt) = DateTime::parse_from_rfc3339(prefix) {
            if let Some(ns) = dt.timestamp_nanos_opt() {
                return SourceLine { ts: Some(ns), line: rest.to_string(), truncated };
            }
        }
    }
    SourceLine { ts: None, line: raw.to_string(), truncated }
}

/// Cut `line` down to `max_bytes` of content (at a UTF-8 boundary) and
/// append [`TRUNCATION_MARKER`]. Lines at or under the limit come back
/// unchanged; re-truncating an already-truncated line is a no-op.
pub fn truncate_line(line: &str, max_bytes: usize) -> (String, bool) {
    if line.len() <= max_bytes {
        return (line.to_string(), false);
    }
    if line.ends_with(TRUNCATION_MARKER) && line.len() <= max_bytes + TRUNCATION_MARKER.len() {
        return (line.to_string(), true);
    }
    let mut cut = max_bytes;
    while cut > 0 && !line.is_char_boundary(cut) {
        cut -= 1;
    }
    (format!("{}{}", &line[..cut], TRUNCATION_MARKER), true)
}

static LEVEL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(trace|debug|info|warning|warn|error|err|fatal)\b")
        .expect("level pattern")
});

/// Best-effort severity sniffing over the raw line. Returns `None` for lines
/// that carry no recognisable level token.
pub fn sniff_level(line: &str) -> Option<LogLevel> {
    let m = LEVEL_RE.find(line)?;
    m.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_kubelet_timestamp_prefix() {
        let s = parse_source_line("2024-03-01T10:00:00.123456789Z hello world", false);
        assert!(s.ts.is_some());
        assert_eq!(s.line, "hello world");
    }

    #[test]
    fn keeps_line_intact_when_prefix_missing() {
        let s = parse_source_line("no timestamp here", false);
        assert_eq!(s.ts, None);
        assert_eq!(s.line, "no timestamp here");
    }

    #[test]
    fn truncation_appends_marker_and_is_idempotent() {
        let (once, cut) = truncate_line("abcdefghij", 4);
        assert!(cut);
        assert_eq!(once, format!("abcd{TRUNCATION_MARKER}"));
        let (twice, cut2) = truncate_line(&once, 4);
        assert!(cut2);
        assert_eq!(twice, once);
    }

    #[test]
    fn line_at_exact_limit_is_untouched() {
        let (out, cut) = truncate_line("abcd", 4);
        assert!(!cut);
        assert_eq!(out, "abcd");
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        // 'é' is two bytes; cutting at 3 must back off to the boundary.
        let (out, cut) = truncate_line("aéz", 3);
        assert!(cut);
        assert!(out.starts_with("aé") || out.starts_with('a'));
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn sniffs_common_level_tokens() {
        assert_eq!(sniff_level("2024 ERROR something broke"), Some(LogLevel::Error));
        assert_eq!(sniff_level("level=warn msg=x"), Some(LogLevel::Warn));
        assert_eq!(sniff_level("[INFO] started"), Some(LogLevel::Info));
        assert_eq!(sniff_level("plain text"), None);
    }
}
