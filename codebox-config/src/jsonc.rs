//! Comment and trailing-comma tolerant JSON.
//!
//! devcontainer.json is commonly written as "JSON with comments". [`normalize`]
//! rewrites such input into strict JSON so it can go through `serde_json`.
//! String literals are copied byte for byte; comments become whitespace and a
//! comma directly followed (modulo whitespace/comments) by `}` or `]` is
//! dropped.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum JsoncError {
    #[error("unterminated block comment starting at byte {0}")]
    UnterminatedComment(usize),

    #[error("unterminated string starting at byte {0}")]
    UnterminatedString(usize),
}

pub fn normalize(input: &str) -> Result<String, JsoncError> {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    // A comma plus the insignificant text that followed it, held back until we
    // know whether the comma was trailing.
    let mut pending: Option<String> = None;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];

        if c == b'/' && bytes.get(i + 1) == Some(&b'/') {
            let end = input[i..].find('\n').map(|n| i + n).unwrap_or(bytes.len());
            push_insignificant(&mut out, &mut pending, " ");
            i = end;
            continue;
        }

        if c == b'/' && bytes.get(i + 1) == Some(&b'*') {
            let end = input[i + 2..]
                .find("*/")
                .map(|n| i + 2 + n + 2)
                .ok_or(JsoncError::UnterminatedComment(i))?;
            push_insignificant(&mut out, &mut pending, " ");
            i = end;
            continue;
        }

        if c.is_ascii_whitespace() {
            let ch = c as char;
            push_insignificant(&mut out, &mut pending, ch.encode_utf8(&mut [0; 4]));
            i += 1;
            continue;
        }

        // Every branch below is a significant token, resolve the held comma.
        if let Some(held) = pending.take() {
            if c == b'}' || c == b']' {
                out.push_str(&held[1..]);
            } else {
                out.push_str(&held);
            }
        }

        match c {
            b',' => {
                pending = Some(",".to_string());
                i += 1;
            }
            b'"' => {
                let end = string_end(bytes, i).ok_or(JsoncError::UnterminatedString(i))?;
                out.push_str(&input[i..end]);
                i = end;
            }
            _ => {
                // Copy the whole UTF-8 sequence of non-ASCII characters.
                let len = input[i..].chars().next().map(char::len_utf8).unwrap_or(1);
                out.push_str(&input[i..i + len]);
                i += len;
            }
        }
    }

    if let Some(held) = pending {
        out.push_str(&held);
    }

    Ok(out)
}

fn push_insignificant(out: &mut String, pending: &mut Option<String>, text: &str) {
    match pending {
        Some(held) => held.push_str(text),
        None => out.push_str(text),
    }
}

/// Returns the index one past the closing quote of the string starting at `start`.
fn string_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}
