//! Reply parsing for command-backed generators.
//!
//! A reply is either a JSON object:
//!
//! ```json
//! {"output": "...", "hurdle": {"description": "...", "severity": "critical"}, "tokens_used": 1200}
//! ```
//!
//! or plain text, optionally containing a hurdle marker:
//! `<hurdle severity="critical">database schema is undecidable</hurdle>`.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use super::{GenerationReply, Hurdle, HurdleSeverity};
use crate::errors::GenerationError;

static HURDLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<hurdle(?:\s+severity\s*=\s*"([A-Za-z]+)")?\s*>(.*?)</hurdle>"#).unwrap()
});

#[derive(Debug, Deserialize)]
struct JsonReply {
    output: String,
    #[serde(default)]
    hurdle: Option<Hurdle>,
    #[serde(default)]
    tokens_used: Option<u64>,
}

/// Parse raw collaborator output into a reply.
///
/// Empty output is malformed. Unknown severities fall back to the default
/// (medium) so a typo never escalates a run.
pub fn parse_reply(raw: &str) -> Result<GenerationReply, GenerationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GenerationError::Malformed("empty reply".into()));
    }

    if trimmed.starts_with('{')
        && let Ok(reply) = serde_json::from_str::<JsonReply>(trimmed)
    {
        return Ok(GenerationReply {
            output: reply.output,
            hurdle: reply.hurdle,
            tokens_used: reply.tokens_used,
        });
    }

    let hurdle = find_hurdle(trimmed);
    Ok(GenerationReply {
        output: trimmed.to_string(),
        hurdle,
        tokens_used: None,
    })
}

/// Most severe hurdle marker in `text`, if any.
fn find_hurdle(text: &str) -> Option<Hurdle> {
    HURDLE_REGEX
        .captures_iter(text)
        .filter_map(|cap| {
            let description = cap.get(2)?.as_str().trim();
            if description.is_empty() {
                return None;
            }
            let severity = cap
                .get(1)
                .and_then(|m| HurdleSeverity::parse(m.as_str()))
                .unwrap_or_default();
            Some(Hurdle::new(description, severity))
        })
        .max_by_key(|h| h.severity)
}

/// Remove hurdle markers from text.
pub fn strip_hurdles(text: &str) -> String {
    HURDLE_REGEX.replace_all(text, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_reply() {
        let reply = parse_reply("## Plan\n1. Build the API\n").unwrap();
        assert_eq!(reply.output, "## Plan\n1. Build the API");
        assert!(reply.hurdle.is_none());
        assert!(reply.tokens_used.is_none());
    }

    #[test]
    fn test_hurdle_marker() {
        let reply = parse_reply(
            "Working on it\n<hurdle severity=\"critical\">Schema conflicts with the plan</hurdle>",
        )
        .unwrap();
        let hurdle = reply.hurdle.unwrap();
        assert!(hurdle.is_critical());
        assert_eq!(hurdle.description, "Schema conflicts with the plan");
    }

    #[test]
    fn test_most_severe_hurdle_wins() {
        let text = "<hurdle severity=\"low\">lint</hurdle>\n<hurdle severity=\"high\">flaky db</hurdle>";
        let hurdle = parse_reply(text).unwrap().hurdle.unwrap();
        assert_eq!(hurdle.severity, HurdleSeverity::High);
        assert_eq!(hurdle.description, "flaky db");
    }

    #[test]
    fn test_hurdle_without_severity_is_medium() {
        let hurdle = parse_reply("<hurdle>unclear</hurdle>").unwrap().hurdle.unwrap();
        assert_eq!(hurdle.severity, HurdleSeverity::Medium);

        let hurdle = parse_reply("<hurdle severity=\"bogus\">x</hurdle>")
            .unwrap()
            .hurdle
            .unwrap();
        assert_eq!(hurdle.severity, HurdleSeverity::Medium);
    }

    #[test]
    fn test_json_reply() {
        let raw = r#"{"output":"fn main() {}","hurdle":{"description":"no db","severity":"critical"},"tokens_used":42}"#;
        let reply = parse_reply(raw).unwrap();
        assert_eq!(reply.output, "fn main() {}");
        assert_eq!(reply.tokens_used, Some(42));
        assert!(reply.hurdle.unwrap().is_critical());
    }

    #[test]
    fn test_json_like_text_falls_back_to_text() {
        let reply = parse_reply("{ not json").unwrap();
        assert_eq!(reply.output, "{ not json");
    }

    #[test]
    fn test_empty_reply_is_malformed() {
        assert!(matches!(
            parse_reply("  \n"),
            Err(GenerationError::Malformed(_))
        ));
    }

    #[test]
    fn test_strip_hurdles() {
        let text = "before <hurdle severity=\"low\">x</hurdle> after";
        assert_eq!(strip_hurdles(text), "before  after");
    }
}
