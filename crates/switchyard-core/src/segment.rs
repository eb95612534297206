//! Message segments and the inline rich-text code format.
//!
//! Legacy bots send message bodies as a single string with embedded codes
//! such as `hello [CQ:at,qq=10001] [CQ:face,id=14]`. [`parse_codes`] splits
//! that string into alternating text and typed segments in one regex pass;
//! [`render_codes`] is its inverse.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[CQ:([A-Za-z0-9_.\-]+)((?:,[^,\]]*)*)\]").expect("code pattern is valid")
});

pub const TEXT: &str = "text";

/// One typed piece of a message body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
}

impl Segment {
    pub fn text(text: impl Into<String>) -> Self {
        let mut data = BTreeMap::new();
        let _ = data.insert("text".to_string(), Value::String(text.into()));
        Self {
            kind: TEXT.to_string(),
            data,
        }
    }

    pub fn typed(kind: impl Into<String>, data: BTreeMap<String, Value>) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    pub fn is_text(&self) -> bool {
        self.kind == TEXT
    }

    /// Text payload of a text segment, `None` for any other kind.
    pub fn as_text(&self) -> Option<&str> {
        if self.is_text() {
            self.data.get("text").and_then(Value::as_str)
        } else {
            None
        }
    }

    /// String form of a data field; non-string JSON is rendered compactly.
    pub fn field(&self, key: &str) -> Option<String> {
        self.data.get(key).map(value_to_plain)
    }
}

/// Reverse the text escaping: `&#91;` `&#93;` `&amp;`.
pub fn unescape_text(s: &str) -> String {
    s.replace("&#91;", "[").replace("&#93;", "]").replace("&amp;", "&")
}

/// Reverse the parameter escaping, which additionally covers `&#44;`.
pub fn unescape_param(s: &str) -> String {
    s.replace("&#44;", ",")
        .replace("&#91;", "[")
        .replace("&#93;", "]")
        .replace("&amp;", "&")
}

pub fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('[', "&#91;").replace(']', "&#93;")
}

pub fn escape_param(s: &str) -> String {
    escape_text(s).replace(',', "&#44;")
}

/// Tokenize a code-string into segments.
///
/// Plain text between codes becomes text segments; empty runs are dropped.
/// A malformed code (unterminated bracket, missing type) stays as text.
pub fn parse_codes(input: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut cursor = 0;

    for caps in CODE_PATTERN.captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        if whole.start() > cursor {
            segments.push(Segment::text(unescape_text(&input[cursor..whole.start()])));
        }

        let kind = caps.get(1).map_or("", |m| m.as_str());
        let mut data = BTreeMap::new();
        if let Some(params) = caps.get(2) {
            for pair in params.as_str().split(',').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                let _ = data.insert(key.to_string(), Value::String(unescape_param(value)));
            }
        }
        segments.push(Segment::typed(kind, data));
        cursor = whole.end();
    }

    if cursor < input.len() {
        segments.push(Segment::text(unescape_text(&input[cursor..])));
    }
    segments
}

/// Render segments back into a code-string.
pub fn render_codes(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        if let Some(text) = segment.as_text() {
            out.push_str(&escape_text(text));
            continue;
        }
        out.push_str("[CQ:");
        out.push_str(&segment.kind);
        for (key, value) in &segment.data {
            out.push(',');
            out.push_str(key);
            out.push('=');
            out.push_str(&escape_param(&value_to_plain(value)));
        }
        out.push(']');
    }
    out
}

/// Concatenated text of all text segments.
pub fn plain_text(segments: &[Segment]) -> String {
    segments.iter().filter_map(Segment::as_text).collect()
}

fn value_to_plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
