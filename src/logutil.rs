//! Helpers for logging raw modem traffic on a single line.
//!
//! AT replies are full of `\r\n` and the SMS body ends with Ctrl-Z; logged
//! verbatim they break log lines apart or vanish. Everything goes through
//! [`escape_log`] before reaching the logger.

use std::fmt::Write;

/// Longest preview written for a single exchange.
const MAX_PREVIEW: usize = 240;

/// Escape modem text for single-line logging:
/// - `\r`, `\n`, `\t` and backslash become their escape sequences
/// - Ctrl-Z (SMS end-of-body) becomes `^Z`, ESC becomes `^[`
/// - other control characters become `\xNN`
///
/// Output longer than the preview limit is cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{1a}' => out.push_str("^Z"),
            '\u{1b}' => out.push_str("^["),
            c if c.is_control() => {
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Mask all but the last four digits of a phone number for info-level logs.
pub fn mask_number(number: &str) -> String {
    let digits = number.chars().filter(|c| c.is_ascii_digit()).count();
    if digits <= 4 {
        return number.to_string();
    }
    let mut seen = 0;
    number
        .chars()
        .map(|c| {
            if c.is_ascii_digit() {
                seen += 1;
                if seen <= digits - 4 {
                    return '*';
                }
            }
            c
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_line_endings_and_ctrl_z() {
        assert_eq!(escape_log("hello\u{1a}"), "hello^Z");
        assert_eq!(escape_log("\r\nOK\r\n"), "\\r\\nOK\\r\\n");
        assert_eq!(escape_log("\u{7}"), "\\x07");
    }

    #[test]
    fn truncates_long_replies() {
        let long = "x".repeat(MAX_PREVIEW + 10);
        let esc = escape_log(&long);
        assert!(esc.ends_with('…'));
        assert_eq!(esc.chars().count(), MAX_PREVIEW + 1);
    }

    #[test]
    fn masks_all_but_last_four_digits() {
        assert_eq!(mask_number("+15551234567"), "+*******4567");
        assert_eq!(mask_number("1234"), "1234");
    }
}
