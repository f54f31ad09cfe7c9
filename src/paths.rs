//! Translation between entry paths and XNAT labels.
//!
//! XNAT labels may only hold `[A-Za-z0-9_]`, so every other character of a
//! path is written as `__NAME__` where `NAME` is alphanumeric. Runs of two or
//! more literal underscores are escaped one underscore at a time (`__u__`) so
//! that a literal `__` can never be mistaken for the start of an escape.

use crate::domain::DERIVATIVE_MARKER;

/// Name given to a derivative group whose path ends in the bare marker.
pub const EMPTY_NAME: &str = "_";

const UNDERSCORE_ESCAPE: &str = "u";

const ESCAPED_MARKER: &str = "at";

const ESCAPES: &[(char, &str)] = &[
    ('/', "slash"),
    ('@', "at"),
    ('.', "dot"),
    ('-', "dash"),
    (' ', "space"),
    (',', "comma"),
    ('(', "lparen"),
    (')', "rparen"),
    ('+', "plus"),
    (':', "colon"),
    ('#', "hash"),
    ('~', "tilde"),
    ('=', "eq"),
    ('&', "amp"),
];

pub fn path_to_label(path: &str) -> String {
    if path.ends_with(DERIVATIVE_MARKER) {
        return format!("{}{EMPTY_NAME}", escape(path));
    }
    // a literal name equal to the sentinel is escaped so it stays distinct
    let literal_empty = format!("{DERIVATIVE_MARKER}{EMPTY_NAME}");
    if let Some(stem) = path.strip_suffix(EMPTY_NAME) {
        if path.ends_with(&literal_empty) {
            let mut label = escape(stem);
            push_escape(&mut label, UNDERSCORE_ESCAPE);
            return label;
        }
    }
    escape(path)
}

pub fn label_to_path(label: &str) -> String {
    let mut marker = String::new();
    push_escape(&mut marker, ESCAPED_MARKER);
    let sentinel = format!("{marker}{EMPTY_NAME}");
    match label.strip_suffix(EMPTY_NAME) {
        Some(stem) if label.ends_with(&sentinel) => unescape(stem),
        _ => unescape(label),
    }
}

pub fn escape(value: &str) -> String {
    let chars = value.chars().collect::<Vec<_>>();
    let mut escaped = String::with_capacity(value.len());
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '_' {
            let run = chars[i..].iter().take_while(|c| **c == '_').count();
            if run == 1 {
                escaped.push('_');
            } else {
                for _ in 0..run {
                    push_escape(&mut escaped, UNDERSCORE_ESCAPE);
                }
            }
            i += run;
            continue;
        }
        if ch.is_ascii_alphanumeric() {
            escaped.push(ch);
        } else if let Some((_, name)) = ESCAPES.iter().find(|(c, _)| *c == ch) {
            push_escape(&mut escaped, name);
        } else {
            push_escape(&mut escaped, &format!("x{:x}", ch as u32));
        }
        i += 1;
    }
    escaped
}

/// Reverses [`escape`]. Sequences that look like escapes but name nothing known
/// are kept verbatim, so labels created outside this crate pass through.
pub fn unescape(label: &str) -> String {
    let mut path = String::with_capacity(label.len());
    let mut rest = label;
    while !rest.is_empty() {
        if let Some((ch, consumed)) = decode_escape(rest) {
            path.push(ch);
            rest = &rest[consumed..];
            continue;
        }
        let mut chars = rest.chars();
        if let Some(ch) = chars.next() {
            path.push(ch);
        }
        rest = chars.as_str();
    }
    path
}

fn push_escape(out: &mut String, name: &str) {
    out.push_str("__");
    out.push_str(name);
    out.push_str("__");
}

fn decode_escape(input: &str) -> Option<(char, usize)> {
    let body = input.strip_prefix("__")?;
    let name_len = body
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric())
        .count();
    if name_len == 0 || !body[name_len..].starts_with("__") {
        return None;
    }
    let name = &body[..name_len];
    let ch = if name == UNDERSCORE_ESCAPE {
        '_'
    } else if let Some((ch, _)) = ESCAPES.iter().find(|(_, n)| *n == name) {
        *ch
    } else {
        let hex = name.strip_prefix('x')?;
        char::from_u32(u32::from_str_radix(hex, 16).ok()?)?
    };
    Some((ch, name_len + 4))
}
