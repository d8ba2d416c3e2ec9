//! Formatting helpers for log fields and [`custom_debug_derive`] attributes.

use std::fmt;
use std::time::Duration;

/// Render a `Duration` with two decimals and automatic unit scaling (`1.94ms`, `2.34s`).
pub fn duration(d: Duration) -> String {
    format!("{d:.2?}")
}

/// Prints whether a secret is set without printing the secret itself.
///
/// Use with `#[debug(with = "crate::fmt::redacted")]` on `Option<String>` fields.
pub fn redacted(value: &Option<String>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match value {
        Some(_) => f.write_str("Some(\"<redacted>\")"),
        None => f.write_str("None"),
    }
}
