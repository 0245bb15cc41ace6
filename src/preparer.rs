//! Message Preparer: the single left-to-right pass every provider runs over a request's
//! messages before translating them into its own wire schema.
//!
//! Order matters. UTF-8 sanitation must run first since later steps compare strings by byte
//! content; error-assistant culling must run before orphan repair so that culled tool-call
//! IDs are not "repaired" a second time; ID normalization must run before orphan repair so
//! the repair pass matches against normalized IDs.

use std::collections::{HashMap, HashSet};

use crate::model::{Message, Role};

const ORPHAN_REPAIR_MESSAGE: &str = "Tool execution was interrupted — no result available.";

/// Returns the longest valid-UTF-8 projection of `s`. For `&str` input this is always `s`
/// itself (Rust strings are guaranteed valid UTF-8); the sanitation step earns its keep when
/// content originates from raw bytes (e.g. decoded from a lossy source upstream). Kept as an
/// explicit step so the pipeline matches the design even though Rust's type system already
/// enforces the invariant for in-memory `String`s.
fn sanitize_utf8(s: &str) -> String {
    s.chars().filter(|c| *c != '\u{FFFD}').collect()
}

fn normalize_tool_call_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.chars().take(64).collect()
}

/// Runs the four-step Message Preparer pass described in the component design and returns a
/// new, prepared message list. The input is left untouched.
pub fn prepare(messages: &[Message]) -> Vec<Message> {
    // Step 1: UTF-8 sanitation.
    let mut out: Vec<Message> = messages
        .iter()
        .map(|m| {
            let mut m = m.clone();
            m.content = sanitize_utf8(&m.content);
            if let Some(contents) = &mut m.contents {
                for c in contents.iter_mut() {
                    if let crate::model::MessageContent::Text { text } = c {
                        *text = sanitize_utf8(text);
                    }
                }
            }
            m
        })
        .collect();

    // Step 2: error-assistant culling. Drop IsError assistant messages and any subsequent
    // tool result referencing a tool-call ID they introduced.
    let mut culled_ids: HashSet<String> = HashSet::new();
    out.retain(|m| {
        if m.role == Role::Assistant && m.is_error {
            for tc in &m.tool_calls {
                culled_ids.insert(tc.id.clone());
            }
            return false;
        }
        if m.role == Role::Tool {
            if let Some(id) = &m.tool_call_id {
                if culled_ids.contains(id) {
                    return false;
                }
            }
        }
        true
    });

    // Step 3: tool-call-ID normalization, carrying an original→normalized map forward so
    // later tool-result messages reference the same normalized ID.
    let mut id_map: HashMap<String, String> = HashMap::new();
    for m in out.iter_mut() {
        if m.role == Role::Assistant {
            for tc in m.tool_calls.iter_mut() {
                let normalized = normalize_tool_call_id(&tc.id);
                id_map.insert(tc.id.clone(), normalized.clone());
                tc.id = normalized;
            }
        }
    }
    for m in out.iter_mut() {
        if m.role == Role::Tool {
            if let Some(id) = &m.tool_call_id {
                if let Some(normalized) = id_map.get(id) {
                    m.tool_call_id = Some(normalized.clone());
                } else {
                    m.tool_call_id = Some(normalize_tool_call_id(id));
                }
            }
        }
    }

    // Step 4: orphan repair. Walk forward tracking which tool-call IDs are still unmatched;
    // whenever the tool-call flow is interrupted by a non-tool message (or we reach the
    // end), insert a synthetic error tool message for each unmatched ID.
    let mut repaired = Vec::with_capacity(out.len());
    let mut pending: Vec<String> = Vec::new();

    for m in out.into_iter() {
        match m.role {
            Role::Assistant => {
                flush_orphans(&mut repaired, &mut pending);
                for tc in &m.tool_calls {
                    pending.push(tc.id.clone());
                }
                repaired.push(m);
            }
            Role::Tool => {
                if let Some(id) = &m.tool_call_id {
                    pending.retain(|p| p != id);
                }
                repaired.push(m);
            }
            Role::User | Role::System => {
                flush_orphans(&mut repaired, &mut pending);
                repaired.push(m);
            }
        }
    }
    flush_orphans(&mut repaired, &mut pending);

    repaired
}

fn flush_orphans(repaired: &mut Vec<Message>, pending: &mut Vec<String>) {
    for id in pending.drain(..) {
        repaired.push(Message {
            role: Role::Tool,
            content: ORPHAN_REPAIR_MESSAGE.to_string(),
            contents: None,
            tool_calls: Vec::new(),
            tool_call_id: Some(id),
            is_error: true,
            cache_control: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Message, ToolCall, ToolCallFunction};

    #[test]
    fn normalizes_and_repairs_orphaned_tool_call() {
        let messages = vec![
            Message::user("a"),
            Message {
                role: Role::Assistant,
                content: String::new(),
                contents: None,
                tool_calls: vec![ToolCall {
                    id: "x!".to_string(),
                    function: ToolCallFunction {
                        name: "f".to_string(),
                        arguments: "{}".to_string(),
                    },
                }],
                tool_call_id: None,
                is_error: false,
                cache_control: None,
            },
            Message::user("b"),
        ];

        let prepared = prepare(&messages);
        assert_eq!(prepared.len(), 4);
        assert_eq!(prepared[1].tool_calls[0].id, "x_");
        assert_eq!(prepared[2].role, Role::Tool);
        assert_eq!(prepared[2].tool_call_id.as_deref(), Some("x_"));
        assert!(prepared[2].is_error);
        assert!(prepared[2].content.contains("interrupted"));
        assert_eq!(prepared[3].role, Role::User);
    }

    #[test]
    fn matched_tool_result_is_not_repaired() {
        let messages = vec![
            Message {
                role: Role::Assistant,
                content: String::new(),
                contents: None,
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    function: ToolCallFunction {
                        name: "f".to_string(),
                        arguments: "{}".to_string(),
                    },
                }],
                tool_call_id: None,
                is_error: false,
                cache_control: None,
            },
            Message::tool_result("call_1", "42"),
        ];
        let prepared = prepare(&messages);
        assert_eq!(prepared.len(), 2);
        assert!(!prepared[1].is_error);
    }

    #[test]
    fn culls_error_assistant_and_its_tool_result() {
        let messages = vec![
            Message {
                role: Role::Assistant,
                content: String::new(),
                contents: None,
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    function: ToolCallFunction {
                        name: "f".to_string(),
                        arguments: "{}".to_string(),
                    },
                }],
                tool_call_id: None,
                is_error: true,
                cache_control: None,
            },
            Message::tool_result("call_1", "should be dropped"),
            Message::user("next"),
        ];
        let prepared = prepare(&messages);
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].role, Role::User);
    }

    #[test]
    fn every_tool_call_id_matches_allowed_pattern() {
        let messages = vec![Message {
            role: Role::Assistant,
            content: String::new(),
            contents: None,
            tool_calls: vec![ToolCall {
                id: "weird id! with/slashes".repeat(4),
                function: ToolCallFunction {
                    name: "f".to_string(),
                    arguments: "{}".to_string(),
                },
            }],
            tool_call_id: None,
            is_error: false,
            cache_control: None,
        }];
        let prepared = prepare(&messages);
        let id = &prepared[0].tool_calls[0].id;
        assert!(id.len() <= 64);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-'));
    }
}
