use serde::{Deserialize, Serialize};

/// A message in the conversation (provider-agnostic).
///
/// Content is an ordered list of blocks so a single assistant message can
/// carry text alongside tool invocations, and a single user message can
/// carry multiple tool results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One content block. Every adapter converts provider-specific content
/// to/from this tagged union.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        /// Typically a JSON document produced by the tool.
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// A user message carrying tool results back to the model.
    pub fn tool_results(blocks: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::User,
            content: blocks,
        }
    }

    /// Join all text blocks into one string. Non-text blocks are skipped.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ── Tool specifications ────────────────────────────────────────────

/// Tool definition exposed to the LLM, built from a registry schema by the
/// tool provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
}

/// A JSON-Schema object description. Unknown schema keys are preserved in
/// `extra` so registry-supplied schemas survive a round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    #[serde(rename = "type", default = "object_type")]
    pub kind: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn object_type() -> String {
    "object".into()
}

impl Default for InputSchema {
    fn default() -> Self {
        Self {
            kind: object_type(),
            properties: serde_json::Map::new(),
            required: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_json_round_trip_is_identity() {
        let msg = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text {
                    text: "checking".into(),
                },
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "echo".into(),
                    input: serde_json::json!({"x": 42}),
                },
                ContentBlock::ToolResult {
                    tool_use_id: "t1".into(),
                    content: "{\"y\":42}".into(),
                    is_error: false,
                },
            ],
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn tool_result_is_error_defaults_false() {
        let json = r#"{"type":"tool_result","tool_use_id":"t1","content":"ok"}"#;
        let block: ContentBlock = serde_json::from_str(json).unwrap();
        match block {
            ContentBlock::ToolResult { is_error, .. } => assert!(!is_error),
            _ => panic!("expected ToolResult"),
        }
    }

    #[test]
    fn text_joins_only_text_blocks() {
        let msg = Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::Text { text: "a".into() },
                ContentBlock::ToolUse {
                    id: "t".into(),
                    name: "n".into(),
                    input: serde_json::json!({}),
                },
                ContentBlock::Text { text: "b".into() },
            ],
        };
        assert_eq!(msg.text(), "a\nb");
    }

    #[test]
    fn input_schema_preserves_extra_keys() {
        let json = serde_json::json!({
            "type": "object",
            "properties": {"q": {"type": "string"}},
            "required": ["q"],
            "additionalProperties": false,
        });
        let schema: InputSchema = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(schema.required, vec!["q"]);
        assert!(schema.extra.contains_key("additionalProperties"));
        let back = serde_json::to_value(&schema).unwrap();
        assert_eq!(back, json);
    }

}
