//! Layered JSON object extraction from free-form model output.
//!
//! Strategies run in order and the first one that yields a JSON object
//! wins. Each strategy is a pure function of the input text.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

pub type JsonObject = Map<String, Value>;

static RE_OBJECT_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("object span regex"));
static RE_COMMENT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*//.*$").expect("comment regex"));
static RE_OBJECT_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\s*\.\.\.\s*\}").expect("object placeholder regex"));
static RE_ARRAY_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\s*\.\.\.\s*\]").expect("array placeholder regex"));
static RE_NAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\bNaN\b").expect("nan regex"));
static RE_EMPTY_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""\s*:\s*([,}])"#).expect("empty value regex"));
static RE_TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("trailing comma regex"));

/// Which strategy produced the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Strict,
    BalancedBlock,
    RegexSpan,
    Lenient,
}

fn parse_object(text: &str) -> Option<JsonObject> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Parse the whole (trimmed) text.
pub fn strict(text: &str) -> Option<JsonObject> {
    parse_object(text.trim())
}

/// The first `{...}` block by brace counting, aware of strings and escapes.
///
/// A block truncated before its closing braces is padded with `}`.
fn first_balanced_block(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }

    if in_string || depth == 0 {
        return None;
    }
    let mut padded = text[start..].trim_end().to_string();
    padded.push_str(&"}".repeat(depth));
    Some(padded)
}

pub fn balanced_block(text: &str) -> Option<JsonObject> {
    first_balanced_block(text).and_then(|block| parse_object(&block))
}

/// Greedy span from the first `{` to the last `}`.
pub fn regex_span(text: &str) -> Option<JsonObject> {
    RE_OBJECT_SPAN
        .find(text)
        .and_then(|m| parse_object(m.as_str()))
}

/// Clean up common model mistakes, then parse.
pub fn lenient(text: &str) -> Option<JsonObject> {
    let candidate = first_balanced_block(text)
        .or_else(|| RE_OBJECT_SPAN.find(text).map(|m| m.as_str().to_string()))
        .unwrap_or_else(|| text.trim().to_string());

    let cleaned = RE_COMMENT_LINE.replace_all(&candidate, "");
    let cleaned = RE_OBJECT_PLACEHOLDER.replace_all(&cleaned, "{}");
    let cleaned = RE_ARRAY_PLACEHOLDER.replace_all(&cleaned, "[]");
    let cleaned = RE_NAN.replace_all(&cleaned, "0");
    let cleaned = RE_EMPTY_VALUE.replace_all(&cleaned, "\": null$1");
    let cleaned = RE_TRAILING_COMMA.replace_all(&cleaned, "$1");

    parse_object(&cleaned)
}

/// Run every strategy in order and report which one succeeded.
pub fn extract_with_strategy(text: &str) -> Option<(Strategy, JsonObject)> {
    let chain: [(Strategy, fn(&str) -> Option<JsonObject>); 4] = [
        (Strategy::Strict, strict),
        (Strategy::BalancedBlock, balanced_block),
        (Strategy::RegexSpan, regex_span),
        (Strategy::Lenient, lenient),
    ];
    chain
        .into_iter()
        .find_map(|(strategy, parse)| parse(text).map(|obj| (strategy, obj)))
}

/// Extract a JSON object from model output, or `None` if nothing parses.
pub fn extract_json_object(text: &str) -> Option<JsonObject> {
    extract_with_strategy(text).map(|(_, obj)| obj)
}
