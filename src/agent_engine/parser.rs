//! Turns one free-text model reply into a rationale and a validated [`Command`].
//!
//! The reply format is not schema-enforced, so extraction degrades through
//! three ordered attempts:
//!
//! 1. the `<answer>…</answer>` region,
//! 2. the first bare `do(…)` / `finish(…)` call found in the text (`do` wins),
//! 3. nothing, which yields `command = None`.
//!
//! A sub-field that fails to parse is left absent; it never fails the reply.
use regex::Regex;

use crate::agent_engine::state::{Command, Coords, ParseResult, Verb};

/// Upper bound of the model coordinate space.
pub const COORD_MAX: i32 = 1000;

pub fn parse(text: &str) -> ParseResult {
    let rationale = extract_rationale(text);
    let command = locate_call(text).and_then(parse_call);
    if command.is_none() {
        tracing::debug!(reply_len = text.len(), "no command recognized in reply");
    }
    ParseResult { rationale, command }
}

/// Contents of the first `<think>` block, trimmed. An unterminated block runs
/// up to `<answer>` or the end of the text.
pub fn extract_rationale(text: &str) -> Option<String> {
    let inner = tagged_region(text, "think")?;
    let trimmed = inner.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Contents of the first `<answer>` block, trimmed.
pub fn extract_answer(text: &str) -> Option<&str> {
    let inner = tagged_region(text, "answer")?.trim();
    (!inner.is_empty()).then_some(inner)
}

/// Text of the call to parse: the answer region, else a bare call in the reply.
pub fn locate_call(text: &str) -> Option<&str> {
    if let Some(answer) = extract_answer(text) {
        return Some(answer);
    }
    // Reasoning may quote calls it decided against; look outside it first.
    let outside = without_think(text);
    if let Some(call) = scan_bare_call(&outside) {
        let start = text.find(call)?;
        return Some(&text[start..start + call.len()]);
    }
    scan_bare_call(text)
}

/// First top-level `do(…)` call in the text, else the first top-level
/// `finish(…)` call. Calls nested inside another call's arguments are skipped.
pub fn scan_bare_call(text: &str) -> Option<&str> {
    let calls = top_level_calls(text);
    calls
        .iter()
        .find(|call| call.starts_with("do("))
        .or_else(|| calls.first())
        .copied()
}

/// Parses call text into a command. Unknown shapes yield `None`.
pub fn parse_call(call_text: &str) -> Option<Command> {
    let call_text = call_text.trim();
    let call = leading_call(call_text).or_else(|| scan_bare_call(call_text))?;
    if call.starts_with("finish") {
        let mut cmd = Command::new(Verb::Finish);
        cmd.message = string_arg(call, "message");
        return Some(cmd);
    }

    let action = string_arg(call, "action")?;
    let verb = Verb::parse(&action);
    let mut cmd = Command::new(verb);

    cmd.coords = match cmd.verb {
        Verb::Swipe => match (point_arg(call, "start"), point_arg(call, "end")) {
            (Some([x1, y1]), Some([x2, y2])) => Some(Coords::Span([x1, y1, x2, y2])),
            _ => None,
        },
        _ => point_arg(call, "element").map(Coords::Point),
    };
    cmd.text = ["text", "message", "app"]
        .iter()
        .find_map(|name| string_arg(call, name));
    cmd.message = string_arg(call, "message");
    cmd.duration_ms = duration_arg(call);
    cmd.instruction = string_arg(call, "instruction");
    Some(cmd)
}

fn tagged_region<'a>(text: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let rest = &text[start..];
    if let Some(end) = rest.find(&close) {
        return Some(&rest[..end]);
    }
    // Unterminated: stop at the next known tag.
    let end = ["<answer>", "<think>"]
        .iter()
        .filter_map(|t| rest.find(t))
        .min()
        .unwrap_or(rest.len());
    Some(&rest[..end])
}

fn without_think(text: &str) -> String {
    let Some(start) = text.find("<think>") else {
        return text.to_string();
    };
    match text[start..].find("</think>") {
        Some(rel) => {
            let end = start + rel + "</think>".len();
            format!("{}{}", &text[..start], &text[end..])
        }
        None => text[..start].to_string(),
    }
}

/// The call that opens the text, if it starts with `do(` or `finish(`.
fn leading_call(text: &str) -> Option<&str> {
    let name = CALL_NAMES.iter().find(|name| {
        text.strip_prefix(**name).is_some_and(|rest| rest.starts_with('('))
    })?;
    let end = matching_paren(text, name.len()).unwrap_or(text.len());
    Some(text[..end].trim_end())
}

const CALL_NAMES: [&str; 2] = ["do", "finish"];

/// Every `do(…)` / `finish(…)` call at an identifier boundary, in order,
/// excluding calls that sit inside an earlier call. Each runs to its matching
/// close paren, ignoring parens inside quoted strings; an unclosed call runs to
/// the end of the text.
fn top_level_calls(text: &str) -> Vec<&str> {
    let mut calls = Vec::new();
    let mut from = 0;
    while from < text.len() {
        let next = CALL_NAMES
            .iter()
            .filter_map(|name| call_start(text, from, name).map(|start| (start, *name)))
            .min_by_key(|(start, _)| *start);
        let Some((start, name)) = next else { break };
        let end = matching_paren(text, start + name.len()).unwrap_or(text.len());
        calls.push(text[start..end].trim_end());
        from = end;
    }
    calls
}

/// Byte index of the first `name(` at or after `from` that sits at an
/// identifier boundary.
fn call_start(text: &str, from: usize, name: &str) -> Option<usize> {
    let needle = format!("{name}(");
    let mut from = from;
    while let Some(rel) = text[from..].find(&needle) {
        let start = from + rel;
        let boundary = text[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_'));
        if boundary {
            return Some(start);
        }
        from = start + needle.len();
    }
    None
}

/// Byte index just past the paren closing the one at `open`.
fn matching_paren(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in text[open..].char_indices() {
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
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(open + i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn arg_regex(name: &str, value: &str) -> Option<Regex> {
    Regex::new(&format!(r#"(?:^|[\s,(]){}\s*=\s*{value}"#, regex::escape(name))).ok()
}

/// Quoted string argument (double or single quotes, backslash escapes).
fn string_arg(call: &str, name: &str) -> Option<String> {
    let re = arg_regex(name, r#"(?:"((?:[^"\\]|\\.)*)"|'((?:[^'\\]|\\.)*)')"#)?;
    let caps = re.captures(call)?;
    let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();
    Some(unescape(raw))
}

/// `name=[x,y]` with both values inside the model coordinate space.
fn point_arg(call: &str, name: &str) -> Option<[i32; 2]> {
    let re = arg_regex(name, r"\[\s*(-?\d+)\s*,\s*(-?\d+)\s*\]")?;
    let caps = re.captures(call)?;
    let x: i32 = caps[1].parse().ok()?;
    let y: i32 = caps[2].parse().ok()?;
    let valid = |v: i32| (0..=COORD_MAX).contains(&v);
    if valid(x) && valid(y) {
        Some([x, y])
    } else {
        tracing::warn!(arg = name, x, y, "coordinates outside model space, ignored");
        None
    }
}

/// `duration=N` in milliseconds, optionally quoted. A seconds unit
/// (`"2 seconds"`, `"2s"`) is converted.
fn duration_arg(call: &str) -> Option<u64> {
    let re = arg_regex(
        "duration",
        r#"["']?\s*(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?)?\s*["']?"#,
    )?;
    let caps = re.captures(call)?;
    let value: f64 = caps[1].parse().ok()?;
    let ms = match caps.get(2).map(|m| m.as_str()) {
        Some(unit) if unit.starts_with('s') => value * 1000.0,
        _ => value,
    };
    Some(ms.round() as u64)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
