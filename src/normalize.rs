//! Label normalization.
//!
//! Turns raw extraction labels into comparable keys:
//! - Unicode NFKD decomposition with combining marks dropped (diacritics)
//! - Lowercase conversion
//! - Punctuation replaced by spaces, whitespace collapsed
//! - Kind-specific canonical forms for amounts, times, years, persons, places
//!
//! Everything here is pure. The anchor key is a function of the normalized
//! name and kind only, so replaying an entry reproduces the same identity.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::entity::EntityKind;
use crate::error::ValidationError;

const HONORIFICS: &[&str] = &["mr", "mrs", "ms", "miss", "dr", "prof", "sig", "sra", "sr"];

/// A normalized label and the anchor key derived from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub normalized_name: String,
    pub anchor_key: String,
}

/// Generic fold: diacritics stripped, lowercased, punctuation removed.
///
/// ```
/// use canonry::normalize::fold;
///
/// assert_eq!(fold("  Café  Müller! "), "cafe muller");
/// ```
#[must_use]
pub fn fold(s: &str) -> String {
    let stripped: String = s
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Folded whitespace tokens.
#[must_use]
pub fn tokens(s: &str) -> Vec<String> {
    fold(s).split_whitespace().map(str::to_string).collect()
}

/// Anchor key for a normalized name of the given kind.
#[must_use]
pub fn anchor_key(kind: &EntityKind, normalized_name: &str) -> String {
    format!("{kind}:{normalized_name}")
}

/// Normalizes a label for the given kind.
///
/// # Errors
/// Returns [`ValidationError::EmptyLabel`] when nothing comparable remains.
pub fn normalize_label(label: &str, kind: &EntityKind) -> Result<Normalized, ValidationError> {
    let normalized_name = normalize_name(label, kind);
    if normalized_name.is_empty() {
        return Err(ValidationError::EmptyLabel {
            label: label.to_string(),
        });
    }
    Ok(Normalized {
        anchor_key: anchor_key(kind, &normalized_name),
        normalized_name,
    })
}

/// Kind-specific normalized name; falls back to [`fold`].
#[must_use]
pub fn normalize_name(label: &str, kind: &EntityKind) -> String {
    let specific = match kind {
        EntityKind::Amount => normalize_amount(label),
        EntityKind::Time => normalize_time(label),
        EntityKind::Year => normalize_year(label),
        EntityKind::Person => Some(strip_leading(&fold(label), HONORIFICS)),
        EntityKind::Place => Some(strip_leading(&fold(label), &["the"])),
        _ => None,
    };
    specific.unwrap_or_else(|| fold(label))
}

fn strip_leading(folded: &str, words: &[&str]) -> String {
    let mut toks: Vec<&str> = folded.split_whitespace().collect();
    while toks.len() > 1 && words.contains(&toks[0]) {
        toks.remove(0);
    }
    toks.join(" ")
}

/// Amounts in fixed two-decimal form: `"$1,234.5"` -> `"1234.50"`.
#[must_use]
pub fn normalize_amount(raw: &str) -> Option<String> {
    let negative = raw.trim_start().starts_with('-');
    let numeric: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    let numeric = numeric.trim_matches(|c| c == '.' || c == ',');
    if !numeric.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let (int_part, frac_part) = split_decimal(numeric);
    let int_digits: String = int_part.chars().filter(char::is_ascii_digit).collect();
    let frac_digits: String = frac_part.chars().filter(char::is_ascii_digit).collect();

    let mut whole: u128 = if int_digits.is_empty() {
        0
    } else {
        int_digits.parse().ok()?
    };

    let mut frac = frac_digits.chars();
    let d1 = frac.next().and_then(|c| c.to_digit(10)).unwrap_or(0);
    let d2 = frac.next().and_then(|c| c.to_digit(10)).unwrap_or(0);
    let d3 = frac.next().and_then(|c| c.to_digit(10)).unwrap_or(0);
    let mut cents = d1 * 10 + d2;
    if d3 >= 5 {
        cents += 1;
        if cents == 100 {
            cents = 0;
            whole = whole.checked_add(1)?;
        }
    }

    let sign = if negative && (whole > 0 || cents > 0) { "-" } else { "" };
    Some(format!("{sign}{whole}.{cents:02}"))
}

/// Splits a numeric string into integer and fractional parts, guessing which
/// separator is the decimal mark.
fn split_decimal(numeric: &str) -> (&str, &str) {
    let last_dot = numeric.rfind('.');
    let last_comma = numeric.rfind(',');
    let decimal_at = match (last_dot, last_comma) {
        (Some(d), Some(c)) => Some(d.max(c)),
        (Some(d), None) => single_separator_decimal(numeric, '.', d),
        (None, Some(c)) => single_separator_decimal(numeric, ',', c),
        (None, None) => None,
    };
    match decimal_at {
        Some(idx) => (&numeric[..idx], &numeric[idx + 1..]),
        None => (numeric, ""),
    }
}

fn single_separator_decimal(numeric: &str, sep: char, idx: usize) -> Option<usize> {
    if numeric.matches(sep).count() > 1 {
        return None;
    }
    let trailing = numeric.len() - idx - 1;
    let leading = &numeric[..idx];
    // "1,234" and "1.234" read as thousands; "0.999" and anything else as a decimal mark.
    if trailing == 3 && !leading.is_empty() && leading != "0" {
        None
    } else {
        Some(idx)
    }
}

/// Times in 24h `HH:MM`: `"3pm"` -> `"15:00"`, `"7:05 a.m."` -> `"07:05"`.
#[must_use]
pub fn normalize_time(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase().replace("a.m.", "am").replace("p.m.", "pm");
    let compact: String = lowered.chars().filter(|c| !c.is_whitespace()).collect();

    let (body, meridiem) = if let Some(b) = compact.strip_suffix("am") {
        (b, Some(false))
    } else if let Some(b) = compact.strip_suffix("pm") {
        (b, Some(true))
    } else {
        (compact.as_str(), None)
    };

    let hour_len = body.chars().take_while(char::is_ascii_digit).count();
    if hour_len == 0 || hour_len > 2 {
        return None;
    }
    let hour: u32 = body[..hour_len].parse().ok()?;
    let rest = &body[hour_len..];
    let minute: u32 = if rest.is_empty() {
        0
    } else {
        let mut chars = rest.chars();
        let sep = chars.next()?;
        if !matches!(sep, ':' | '.' | 'h') {
            return None;
        }
        let digits = chars.as_str();
        if digits.is_empty() && sep == 'h' {
            0
        } else if digits.len() == 2 && digits.chars().all(|c| c.is_ascii_digit()) {
            digits.parse().ok()?
        } else {
            return None;
        }
    };
    if minute > 59 {
        return None;
    }

    let hour = match meridiem {
        Some(pm) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            match (hour, pm) {
                (12, false) => 0,
                (12, true) => 12,
                (h, true) => h + 12,
                (h, false) => h,
            }
        }
        None if hour <= 23 => hour,
        None => return None,
    };

    Some(format!("{hour:02}:{minute:02}"))
}

/// Years as four digits: `"'98"` -> `"1998"`, `"24"` -> `"2024"`.
#[must_use]
pub fn normalize_year(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_start_matches(['\'', '’']);
    if !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match trimmed.len() {
        4 => Some(trimmed.to_string()),
        2 => {
            let yy: u32 = trimmed.parse().ok()?;
            let century = if yy < 50 { 2000 } else { 1900 };
            Some(format!("{}", century + yy))
        }
        _ => None,
    }
}
