//! JSON decoding for data.gov.in responses.

use anyhow::{Result, anyhow};
use serde::de::DeserializeOwned;

/// Deserialize `body`, reporting the JSON path and a snippet of the offending
/// line on failure.
pub fn parse_json_with_context<T: DeserializeOwned>(body: &str) -> Result<T> {
    let mut deserializer = serde_json::Deserializer::from_str(body);
    serde_path_to_error::deserialize(&mut deserializer).map_err(|err| {
        let path = err.path().to_string();
        let inner = err.into_inner();
        let snippet = snippet_at(body, inner.line(), inner.column(), 40);
        if path.is_empty() || path == "." {
            anyhow!("{inner}\n{snippet}")
        } else {
            anyhow!("at path '{path}': {inner}\n{snippet}")
        }
    })
}

/// Up to `width` characters around a 1-based (line, column), with a caret underneath.
///
/// Works on chars rather than bytes; district names are frequently non-ASCII.
fn snippet_at(body: &str, line: usize, column: usize, width: usize) -> String {
    let Some(target) = body.lines().nth(line.saturating_sub(1)) else {
        return "(no such line)".to_owned();
    };
    let chars: Vec<char> = target.chars().collect();
    if chars.is_empty() {
        return "(empty line)".to_owned();
    }

    let at = column.saturating_sub(1).min(chars.len() - 1);
    let start = at.saturating_sub(width / 2);
    let end = (at + width / 2).min(chars.len());
    let excerpt: String = chars[start..end].iter().collect();
    let caret = " ".repeat(at - start);

    format!("...{excerpt}...\n   {caret}^")
}
