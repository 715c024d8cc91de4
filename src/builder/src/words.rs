//! Shell-style word processing for instruction arguments.
//!
//! Handles `$VAR`, `${VAR}`, `${VAR:-word}`, `${VAR:+word}` and
//! `${VAR:?message}` substitution together with single/double quoting and
//! backslash escapes, the way Dockerfile arguments are expanded before an
//! instruction runs.

use kiln_core::error::{BuildError, Result};

/// Expand variables in `word`, removing quotes.
///
/// `lookup` returns the value for a name, or `None` when it is unset.
pub fn expand_word(word: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let chars: Vec<char> = word.chars().collect();
    let mut out = String::with_capacity(word.len());
    let mut in_double = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' => {
                match chars.get(i + 1) {
                    Some(&next) if !in_double || matches!(next, '"' | '\\' | '$') => {
                        out.push(next);
                    }
                    Some(&next) => {
                        out.push('\\');
                        out.push(next);
                    }
                    None => out.push('\\'),
                }
                i += 2;
            }
            '\'' if !in_double => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == '\'')
                    .ok_or_else(|| {
                        BuildError::ResolveError(format!("unterminated single quote in {:?}", word))
                    })?;
                out.extend(&chars[i + 1..i + 1 + end]);
                i += end + 2;
            }
            '"' => {
                in_double = !in_double;
                i += 1;
            }
            '$' => {
                let (value, consumed) = expand_variable(&chars[i..], word, lookup)?;
                out.push_str(&value);
                i += consumed;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    if in_double {
        return Err(BuildError::ResolveError(format!(
            "unterminated double quote in {:?}",
            word
        )));
    }
    Ok(out)
}

/// Expand one `$...` reference at the start of `chars`.
///
/// Returns the substituted text and the number of characters consumed.
fn expand_variable(
    chars: &[char],
    word: &str,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<(String, usize)> {
    match chars.get(1) {
        Some('{') => {
            let close = matching_brace(chars, 1).ok_or_else(|| {
                BuildError::ResolveError(format!("missing '}}' in {:?}", word))
            })?;
            let body: String = chars[2..close].iter().collect();
            let value = expand_braced(&body, word, lookup)?;
            Ok((value, close + 1))
        }
        Some(&ch) if ch == '_' || ch.is_ascii_alphabetic() => {
            let len = chars[1..]
                .iter()
                .take_while(|c| **c == '_' || c.is_ascii_alphanumeric())
                .count();
            let name: String = chars[1..1 + len].iter().collect();
            Ok((lookup(&name).unwrap_or_default(), 1 + len))
        }
        _ => Ok(("$".to_string(), 1)),
    }
}

fn expand_braced(body: &str, word: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let name_len = body
        .chars()
        .take_while(|c| *c == '_' || c.is_ascii_alphanumeric())
        .count();
    let (name, rest) = body.split_at(name_len);
    if name.is_empty() {
        return Err(BuildError::ResolveError(format!(
            "bad substitution ${{{}}} in {:?}",
            body, word
        )));
    }

    let value = lookup(name).filter(|v| !v.is_empty());
    if rest.is_empty() {
        return Ok(value.unwrap_or_default());
    }

    let mut ops = rest.chars();
    let (Some(':'), Some(op)) = (ops.next(), ops.next()) else {
        return Err(BuildError::ResolveError(format!(
            "bad substitution ${{{}}} in {:?}",
            body, word
        )));
    };
    let operand = &rest[1 + op.len_utf8()..];

    match op {
        '-' => match value {
            Some(v) => Ok(v),
            None => expand_word(operand, lookup),
        },
        '+' => match value {
            Some(_) => expand_word(operand, lookup),
            None => Ok(String::new()),
        },
        '?' => match value {
            Some(v) => Ok(v),
            None => {
                let message = expand_word(operand, lookup)?;
                let message = if message.is_empty() {
                    "parameter not set".to_string()
                } else {
                    message
                };
                Err(BuildError::ResolveError(format!("{}: {}", name, message)))
            }
        },
        _ => Err(BuildError::ResolveError(format!(
            "unsupported modifier '{}' in ${{{}}}",
            op, body
        ))),
    }
}

/// Index of the `}` closing the `{` at `open`, honoring nesting.
fn matching_brace(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, ch) in chars.iter().enumerate().skip(open) {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split text on unquoted whitespace, keeping quotes and escapes intact.
pub fn split_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match (c, quote) {
            ('\\', _) => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ('\'' | '"', None) => {
                quote = Some(c);
                current.push(c);
            }
            (q, Some(open)) if q == open => {
                quote = None;
                current.push(c);
            }
            (ws, None) if ws.is_whitespace() => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
