//! NDJSON stream parsing for the CLI runtime.
//!
//! The runtime prints one JSON object per line.  We collect assistant text
//! blocks, the session id, and the final result's usage deltas.

use crew_core::agent::TurnUsage;
use serde_json::Value;

#[derive(Debug, Default)]
pub struct ParsedStream {
    pub text: String,
    pub session_id: Option<String>,
    pub usage: TurnUsage,
}

pub fn parse_stream(raw: &str) -> ParsedStream {
    let mut parsed = ParsedStream::default();
    let mut texts: Vec<String> = Vec::new();

    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if let Some(sid) = value.get("session_id").and_then(|v| v.as_str()) {
            parsed.session_id = Some(sid.to_string());
        }
        match value.get("type").and_then(|v| v.as_str()) {
            Some("assistant") => {
                let blocks = value
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_array());
                if let Some(blocks) = blocks {
                    for block in blocks {
                        if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                texts.push(text.to_string());
                            }
                        }
                    }
                }
            }
            Some("result") => {
                if let Some(usage) = value.get("usage") {
                    parsed.usage.input_tokens = u64_field(usage, "input_tokens");
                    parsed.usage.output_tokens = u64_field(usage, "output_tokens");
                    parsed.usage.cache_read_tokens = u64_field(usage, "cache_read_input_tokens");
                    parsed.usage.cache_write_tokens =
                        u64_field(usage, "cache_creation_input_tokens");
                }
                if let Some(cost) = value.get("total_cost_usd").and_then(|v| v.as_f64()) {
                    parsed.usage.cost_usd = cost;
                }
            }
            _ => {}
        }
    }

    parsed.text = texts.join("\n");
    parsed
}

fn u64_field(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}
