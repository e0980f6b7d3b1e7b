//! Rating extraction from peer-review replies.
//!
//! Recognized forms, in order of precedence:
//! - a JSON object: `{"rating": 4, "comment": "clear plan"}`
//! - tags: `<rating>4</rating>` with optional `<comment>...</comment>`
//! - a labeled line: `Rating: 4` or `Rating: 4/5`

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static JSON_OBJECT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)\{[^{}]*"rating"[^{}]*\}"#).unwrap());

static RATING_TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<rating>\s*(-?\d+(?:\.\d+)?)\s*(?:/\s*5\s*)?</rating>").unwrap());

static COMMENT_TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<comment>(.*?)</comment>").unwrap());

static RATING_LINE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[\s*#_-]*(?:rating|score)[\s*_]*[:=][\s*_]*(-?\d+(?:\.\d+)?)").unwrap()
});

static COMMENT_LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^[\s*#_-]*comments?[\s*_]*:\s*(.+)$").unwrap());

/// Raw rating as found in a reply, before clamping.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRating {
    /// `None` when no rating could be found.
    pub value: Option<i64>,
    pub comment: String,
}

/// Extract a rating and comment from a review reply.
pub fn parse_rating(text: &str) -> ParsedRating {
    if let Some(parsed) = parse_json(text) {
        return parsed;
    }

    if let Some(value) = RATING_TAG_REGEX
        .captures(text)
        .and_then(|cap| number(cap.get(1)?.as_str()))
    {
        let comment = COMMENT_TAG_REGEX
            .captures(text)
            .and_then(|cap| cap.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| strip_markers(text));
        return ParsedRating {
            value: Some(value),
            comment,
        };
    }

    if let Some(value) = RATING_LINE_REGEX
        .captures(text)
        .and_then(|cap| number(cap.get(1)?.as_str()))
    {
        let comment = COMMENT_LINE_REGEX
            .captures(text)
            .and_then(|cap| cap.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_else(|| strip_markers(text));
        return ParsedRating {
            value: Some(value),
            comment,
        };
    }

    ParsedRating {
        value: None,
        comment: text.trim().to_string(),
    }
}

fn parse_json(text: &str) -> Option<ParsedRating> {
    let candidate = JSON_OBJECT_REGEX.find(text)?;
    let value: Value = serde_json::from_str(candidate.as_str()).ok()?;
    let rating = match value.get("rating")? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))?,
        Value::String(s) => number(s)?,
        _ => return None,
    };
    let comment = value
        .get("comment")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();
    Some(ParsedRating {
        value: Some(rating),
        comment,
    })
}

fn number(s: &str) -> Option<i64> {
    let s = s.trim();
    s.parse::<i64>()
        .ok()
        .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
}

/// The reply without rating lines or tags, used as the comment fallback.
fn strip_markers(text: &str) -> String {
    let without_tags = RATING_TAG_REGEX.replace_all(text, "");
    RATING_LINE_REGEX
        .replace_all(&without_tags, "")
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
