//! Numeric pattern signatures.
//!
//! Values are matched by their digits only, so formatting differences
//! ("+1 (234) 567-8901" vs "12345678901") never break matching across
//! groups. The signature is the first four plus the last four digits.

/// Keep only the ASCII digits of `raw`.
pub fn extract_digits(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Comparable signature for a raw value: first four + last four digits.
///
/// Values with fewer than eight digits use the whole digit string; values
/// with no digits have no signature.
pub fn signature(raw: &str) -> Option<String> {
    let digits = extract_digits(raw);
    if digits.is_empty() {
        return None;
    }
    if digits.len() < 8 {
        return Some(digits);
    }
    let first = &digits[..4];
    let last = &digits[digits.len() - 4..];
    Some(format!("{first}{last}"))
}

/// Two signatures match when they are equal or one contains the other
/// (short values still match inside longer numbers).
pub fn signatures_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    a == b || a.contains(b) || b.contains(a)
}
