//! Display titles for bugs that share a stored title.
//!
//! The first bug with a given title is shown as-is. Later ones carry a one-based
//! ` (N)` suffix while the stored sequence number stays zero-based.

use std::sync::OnceLock;

use regex_lite::Regex;

/// Largest one-based suffix accepted when parsing a display title.
pub const MAX_DISPLAY_SEQ: i64 = 1_000_000;

const DISPLAY_TITLE_PATTERN: &str = r"^(.*) \(([^\s()]+)\)$";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TitleError {
    #[error("failed to parse bug title `{display}`: `{raw}` is not a number")]
    InvalidNumber { display: String, raw: String },
    #[error("failed to parse bug title `{display}`: seq={value} is outside 1..={MAX_DISPLAY_SEQ}")]
    SeqOutOfRange { display: String, value: i64 },
    #[error("display title pattern failed to compile: {0}")]
    Pattern(String),
}

/// Render the title shown to users for the bug stored as `(title, seq)`.
#[must_use]
pub fn format_title(title: &str, seq: u64) -> String {
    if seq == 0 {
        return title.to_string();
    }
    format!("{title} ({})", seq.saturating_add(1))
}

/// Split a display title back into the stored title and zero-based sequence.
///
/// A title without a trailing ` (token)` is returned whole with sequence 0. A literal title
/// that really ends in ` (N)` cannot be told apart from a numbered duplicate.
///
/// # Errors
/// Returns [`TitleError::InvalidNumber`] when the suffix token is not a run of ASCII digits
/// that fits an `i64` and [`TitleError::SeqOutOfRange`] when it is not within
/// `1..=MAX_DISPLAY_SEQ`.
pub fn parse_title(display: &str) -> Result<(String, u64), TitleError> {
    let Some(captures) = display_title_re()?.captures(display) else {
        return Ok((display.to_string(), 0));
    };
    let (Some(title), Some(token)) = (captures.get(1), captures.get(2)) else {
        return Ok((display.to_string(), 0));
    };
    let (title, token) = (title.as_str(), token.as_str());

    let invalid =
        || TitleError::InvalidNumber { display: display.to_string(), raw: token.to_string() };
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let value = token.parse::<i64>().map_err(|_| invalid())?;
    if value <= 0 || value > MAX_DISPLAY_SEQ {
        return Err(TitleError::SeqOutOfRange { display: display.to_string(), value });
    }

    Ok((title.to_string(), value.unsigned_abs() - 1))
}

fn display_title_re() -> Result<&'static Regex, TitleError> {
    static DISPLAY_TITLE_RE: OnceLock<Result<Regex, String>> = OnceLock::new();
    DISPLAY_TITLE_RE
        .get_or_init(|| Regex::new(DISPLAY_TITLE_PATTERN).map_err(|err| err.to_string()))
        .as_ref()
        .map_err(|err| TitleError::Pattern(err.clone()))
}
