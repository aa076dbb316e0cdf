//! Recovery of a JSON document from free-form model output.
//!
//! `locate_json` cuts the first balanced JSON value out of surrounding prose
//! (closing it if the model was truncated mid-document). `repair_json` fixes
//! the syntax errors vision models commonly make: unquoted keys, single-quoted
//! strings, trailing commas, comments and Python-style literals.

/// Strips a ```json ... ``` or ``` ... ``` fence located anywhere in the text.
fn strip_code_fences(text: &str) -> &str {
    let Some(open) = text.find("```") else {
        return text;
    };
    let after = &text[open + 3..];
    // Skip an optional language tag on the fence line.
    let after = match after.find('\n') {
        Some(nl) if after[..nl].trim().chars().all(|c| c.is_ascii_alphanumeric()) => {
            &after[nl + 1..]
        }
        _ => after,
    };
    match after.find("```") {
        Some(close) => &after[..close],
        None => after,
    }
}

/// Returns the first JSON object or array embedded in `text`.
///
/// Brackets inside string literals are ignored. If the text ends before the
/// value is closed, the open string and brackets are closed so that a
/// truncated response still has a chance to parse.
pub fn locate_json(text: &str) -> Option<String> {
    let text = strip_code_fences(text);
    let start = text.find(['{', '['])?;
    let body = &text[start..];

    let mut closers: Vec<char> = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in body.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '{' => closers.push('}'),
            '[' => closers.push(']'),
            '}' | ']' => {
                let expected = closers.pop();
                if expected != Some(c) || closers.is_empty() {
                    return Some(body[..i + c.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }

    let mut closed = body.trim_end().to_string();
    if let Some(q) = quote {
        closed.push(q);
    }
    while let Some(closer) = closers.pop() {
        closed.push(closer);
    }
    Some(closed)
}

fn next_significant(chars: &[char], from: usize) -> Option<char> {
    chars[from.min(chars.len())..]
        .iter()
        .copied()
        .find(|c| !c.is_whitespace())
}

/// Copies a double-quoted string starting at `start`, escaping raw control
/// characters. Returns the index just past the closing quote.
fn copy_double_quoted(chars: &[char], start: usize, out: &mut String) -> usize {
    out.push('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                out.push(c);
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                }
                i += 2;
                continue;
            }
            '"' => {
                out.push('"');
                return i + 1;
            }
            '\n' => out.push_str("\\n"),
            '\r' => {}
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
        i += 1;
    }
    out.push('"');
    i
}

/// Converts a single-quoted string into a double-quoted one.
fn copy_single_quoted(chars: &[char], start: usize, out: &mut String) -> usize {
    out.push('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' if chars.get(i + 1) == Some(&'\'') => {
                out.push('\'');
                i += 2;
                continue;
            }
            '\\' => {
                out.push(c);
                if let Some(&next) = chars.get(i + 1) {
                    out.push(next);
                }
                i += 2;
                continue;
            }
            '\'' => {
                out.push('"');
                return i + 1;
            }
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
        i += 1;
    }
    out.push('"');
    i
}

fn bareword_literal(word: &str) -> Option<&'static str> {
    match word {
        "true" | "True" | "TRUE" => Some("true"),
        "false" | "False" | "FALSE" => Some("false"),
        "null" | "None" | "NULL" | "nil" | "undefined" | "NaN" | "Infinity" => Some("null"),
        _ => None,
    }
}

/// Rewrites near-JSON into JSON. Valid JSON passes through unchanged.
pub fn repair_json(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len() + 16);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => i = copy_double_quoted(&chars, i, &mut out),
            '\'' => i = copy_single_quoted(&chars, i, &mut out),
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            ',' => {
                if !matches!(next_significant(&chars, i + 1), Some('}') | Some(']') | None) {
                    out.push(',');
                }
                i += 1;
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' => {
                if c != '+' {
                    out.push(c);
                }
                i += 1;
                while i < chars.len() && matches!(chars[i], '0'..='9' | '.' | 'e' | 'E' | '+' | '-')
                {
                    out.push(chars[i]);
                    i += 1;
                }
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let end = chars[i..]
                    .iter()
                    .position(|ch| !(ch.is_alphanumeric() || *ch == '_' || *ch == '$'))
                    .map(|p| i + p)
                    .unwrap_or(chars.len());
                let word: String = chars[i..end].iter().collect();
                if next_significant(&chars, end) == Some(':') {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                } else if let Some(literal) = bareword_literal(&word) {
                    out.push_str(literal);
                } else {
                    out.push('"');
                    out.push_str(&word);
                    out.push('"');
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    out
}
