//! Turn gateway chat messages into transcript lines.

use serde_json::Value;

const TOOL_CALL_PREFIX: &str = "[[tool]]";
const TOOL_RESULT_PREFIX: &str = "[[tool-result]]";
const HIDDEN_BLOCK_TAGS: [&str; 3] = ["thinking", "think", "analysis"];

fn role(message: &Value) -> &str {
    message.get("role").and_then(Value::as_str).unwrap_or_default()
}

/// Text parts of a message's content, which is either a string or a list
/// of typed parts.
fn raw_text(message: &Value) -> Option<String> {
    match message.get("content")? {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n"))
        }
        _ => None,
    }
}

/// Drop a channel envelope such as
/// `[Discord Guild #general channel id:123 +0s 2026-02-01 00:00 UTC] `.
fn strip_envelope(text: &str) -> &str {
    let Some(rest) = text.strip_prefix('[') else {
        return text;
    };
    let Some(end) = rest.find(']') else {
        return text;
    };
    let header = &rest[..end];
    let looks_like_envelope = !header.contains('\n')
        && header.contains(char::is_whitespace)
        && header.contains(|c: char| c.is_ascii_digit());
    if looks_like_envelope {
        rest[end + 1..].trim_start()
    } else {
        text
    }
}

fn strip_hidden_blocks(text: &str) -> String {
    let mut out = text.to_string();
    for tag in HIDDEN_BLOCK_TAGS {
        let open = format!("<{tag}>");
        let close = format!("</{tag}>");
        loop {
            // ASCII lowercasing keeps byte offsets aligned with `out`.
            let lower = out.to_ascii_lowercase();
            let Some(start) = lower.find(&open) else {
                break;
            };
            let end = lower[start..]
                .find(&close)
                .map(|offset| start + offset + close.len())
                .unwrap_or(out.len());
            out.replace_range(start..end, "");
        }
    }
    out
}

/// Visible text of a message: envelope stripped for user messages, hidden
/// reasoning removed for assistant messages. `None` when nothing is left.
pub fn extract_text(message: &Value) -> Option<String> {
    let text = raw_text(message)?;
    let text = match role(message) {
        "user" => strip_envelope(text.trim()).trim().to_string(),
        "assistant" => strip_hidden_blocks(&text).trim().to_string(),
        _ => text.trim().to_string(),
    };
    (!text.is_empty()).then_some(text)
}

fn str_field<'a>(value: &'a Value, keys: &[&str]) -> &'a str {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
}

fn tool_call_line(part: &Value) -> String {
    let name = str_field(part, &["name"]);
    let id = str_field(part, &["id", "toolCallId"]);
    let mut line = format!("{TOOL_CALL_PREFIX} {name} ({id})");
    if let Some(args) = part.get("arguments").or_else(|| part.get("input"))
        && !args.is_null()
    {
        let rendered = match args {
            Value::String(raw) => raw.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        };
        line.push('\n');
        line.push_str(&rendered);
    }
    line
}

fn tool_result_line(message: &Value) -> String {
    let name = str_field(message, &["toolName", "name"]);
    let id = str_field(message, &["toolCallId", "id"]);
    let mut line = format!("{TOOL_RESULT_PREFIX} {name} ({id})");

    let details = message.get("details");
    let status = details
        .and_then(|d| d.get("status"))
        .and_then(Value::as_str)
        .or_else(|| {
            message
                .get("isError")
                .and_then(Value::as_bool)
                .map(|is_error| if is_error { "error" } else { "ok" })
        });
    let exit_code = details
        .and_then(|d| d.get("exitCode"))
        .and_then(Value::as_i64);
    match (status, exit_code) {
        (Some(status), Some(code)) => line.push_str(&format!("\n{status} (exit {code})")),
        (Some(status), None) => line.push_str(&format!("\n{status}")),
        (None, Some(code)) => line.push_str(&format!("\nexit {code}")),
        (None, None) => {}
    }
    if let Some(text) = raw_text(message).map(|t| t.trim_end().to_string())
        && !text.is_empty()
    {
        line.push('\n');
        line.push_str(&text);
    }
    line
}

fn is_tool_call_part(part: &Value) -> bool {
    matches!(
        part.get("type").and_then(Value::as_str),
        Some("toolCall" | "tool_use" | "toolUse")
    )
}

fn is_tool_result(message: &Value) -> bool {
    matches!(role(message), "toolResult" | "tool")
}

/// Tool call lines of an assistant message, or the single result line of a
/// tool result message.
pub fn extract_tool_lines(message: &Value) -> Vec<String> {
    if is_tool_result(message) {
        return vec![tool_result_line(message)];
    }
    match message.get("content") {
        Some(Value::Array(parts)) => parts
            .iter()
            .filter(|part| is_tool_call_part(part))
            .map(tool_call_line)
            .collect(),
        _ => Vec::new(),
    }
}

/// Transcript lines plus the facts the final history patch needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryLines {
    pub lines: Vec<String>,
    pub last_assistant: Option<String>,
    pub last_assistant_at: Option<u64>,
    pub last_user: Option<String>,
}

pub fn build_history_lines(messages: &[Value]) -> HistoryLines {
    let mut out = HistoryLines::default();
    for message in messages {
        match role(message) {
            "user" => {
                if let Some(text) = extract_text(message) {
                    out.lines.push(format!("> {text}"));
                    out.last_user = Some(text);
                }
            }
            "assistant" => {
                out.lines.extend(extract_tool_lines(message));
                if let Some(text) = extract_text(message) {
                    out.lines.push(text.clone());
                    out.last_assistant = Some(text);
                    out.last_assistant_at = message
                        .get("timestamp")
                        .and_then(Value::as_u64)
                        .or(out.last_assistant_at);
                }
            }
            _ if is_tool_result(message) => out.lines.extend(extract_tool_lines(message)),
            _ => {}
        }
    }
    out
}
