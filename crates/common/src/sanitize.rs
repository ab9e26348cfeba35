//! Message text sanitization
//!
//! Cleans up strings that were produced by reading UTF-16 terminal output as
//! UTF-8 (a Windows PowerShell artifact): U+FFFD replacement characters,
//! literal `\u0000` escape sequences interleaved with the real text, and
//! stray control characters. Applied to every message content string before
//! it is forwarded upstream; problems are reported as warnings, never as
//! failures, so the best-effort text always goes through.

/// Result of sanitizing one string. `warnings` is empty when the input was
/// already clean and was passed through untouched.
#[derive(Debug, Clone)]
pub struct SanitizeOutcome {
    pub text: String,
    pub warnings: Vec<String>,
}

impl SanitizeOutcome {
    /// True when no cleanup was necessary.
    pub fn success(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Marker left by lossy decoding when a UTF-16 byte sequence could not be
/// interpreted as UTF-8.
const REPLACEMENT: char = '\u{fffd}';

/// Literal escape text (backslash, `u`, four zeros) that shows up when a
/// UTF-16 code unit was serialized instead of decoded. The character that
/// follows the sequence is the one that was meant.
const NUL_ESCAPE: &str = "\\u0000";

fn is_stripped_control(c: char) -> bool {
    (c as u32) < 0x20 && c != '\n' && c != '\r'
}

/// Sanitize one message content string.
///
/// Removes replacement characters, collapses literal `\u0000X` escape
/// sequences to `X`, drops control characters other than `\n`/`\r`, and
/// trims surrounding whitespace. Clean input is returned unchanged with no
/// warnings.
pub fn sanitize(input: &str) -> SanitizeOutcome {
    let has_replacement = input.contains(REPLACEMENT);
    let has_escapes = input.contains(NUL_ESCAPE);
    let has_control = input.chars().any(is_stripped_control);

    if !has_replacement && !has_escapes && !has_control {
        return SanitizeOutcome {
            text: input.to_string(),
            warnings: Vec::new(),
        };
    }

    let mut warnings = Vec::new();

    let mut cleaned = input.to_string();
    if has_replacement {
        let count = cleaned.matches(REPLACEMENT).count();
        cleaned = cleaned.replace(REPLACEMENT, "");
        warnings.push(format!("removed {count} replacement character(s)"));
    }

    if has_escapes {
        let count = cleaned.matches(NUL_ESCAPE).count();
        cleaned = collapse_nul_escapes(&cleaned);
        warnings.push(format!("collapsed {count} \\u0000 escape sequence(s)"));
    }

    if cleaned.chars().any(is_stripped_control) {
        let count = cleaned.chars().filter(|&c| is_stripped_control(c)).count();
        cleaned.retain(|c| !is_stripped_control(c));
        warnings.push(format!("stripped {count} control character(s)"));
    }

    SanitizeOutcome {
        text: cleaned.trim().to_string(),
        warnings,
    }
}

/// Rewrite `\u0000X` (literal six-character escape followed by the intended
/// character) to `X`. A trailing escape with nothing after it is dropped.
fn collapse_nul_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find(NUL_ESCAPE) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + NUL_ESCAPE.len()..];
        // The character after the escape is the real one; keep it and move on.
        let mut chars = rest.char_indices();
        if let Some((_, c)) = chars.next() {
            out.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    out.push_str(rest);
    out
}
