use serde_json::Value;

use crate::error::{Error, Result};

/// Recovers the JSON payload from a raw provider completion.
///
/// Models frequently wrap the instruction object in a triple-backtick fence
/// (optionally tagged `json`) and surround it with narration. The interior
/// of the first fence wins; with no fence the whole text is parsed as-is.
/// A parse failure here is terminal: retrying the identical request will
/// not make a syntactically broken answer parse.
pub fn payload(raw: &str) -> Result<Value> {
    let body = unwrap_fence(raw).trim();
    serde_json::from_str(body).map_err(|e| Error::Parse(e.to_string()))
}

fn unwrap_fence(raw: &str) -> &str {
    if let Some(start) = raw.find("```") {
        let after = &raw[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            return &after[..end];
        }
    }
    raw
}
