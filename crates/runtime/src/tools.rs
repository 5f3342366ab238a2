//! Tool registry and pattern expansion.
//!
//! An agent declares tool-name patterns of the form `[server:]regex`.
//! The provider expands them against the registry into the concrete
//! [`ToolSpec`]s sent with every model call. Patterns that match nothing
//! and regexes that fail to compile are logged and dropped rather than
//! failing the agent.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use crewd_domain::message::{InputSchema, ToolSpec};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tool known to the runtime.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    /// Originating server, when the tool came from a remote catalogue.
    pub server: Option<String>,
    pub description: String,
    /// Raw JSON Schema for the tool's input.
    pub schema: Value,
}

/// Registry of available tools, name → schema.
///
/// A `BTreeMap` keeps enumeration deterministic, which fixes the order
/// of expanded specs for a given registry.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, tool: RegisteredTool) {
        self.tools.insert(name.into(), tool);
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Expand an agent's ordered pattern list into concrete tool specs.
    ///
    /// Each pattern splits on the first `:`; the left side is an optional
    /// server filter, the right a regex matched against the full tool
    /// name. Matches are deduplicated across patterns, keeping
    /// first-match order.
    pub fn expand_patterns(&self, patterns: &[String]) -> Vec<ToolSpec> {
        let mut specs = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();

        for pattern in patterns {
            let (server_filter, name_pattern) = match pattern.split_once(':') {
                Some((server, rest)) => (Some(server), rest),
                None => (None, pattern.as_str()),
            };

            // Full-name matching; a bare substring pattern would silently
            // over-match tool families.
            let regex = match regex::Regex::new(&format!("^(?:{name_pattern})$")) {
                Ok(re) => re,
                Err(e) => {
                    tracing::warn!(pattern = %pattern, error = %e, "invalid tool pattern regex");
                    continue;
                }
            };

            let mut matched_any = false;
            for (name, tool) in &self.tools {
                if let Some(server) = server_filter {
                    if tool.server.as_deref() != Some(server) {
                        continue;
                    }
                }
                if !regex.is_match(name) {
                    continue;
                }
                matched_any = true;
                if !seen.insert(name.as_str()) {
                    continue;
                }
                specs.push(build_spec(name, tool));
            }

            if !matched_any {
                tracing::warn!(pattern = %pattern, "tool pattern matched nothing, dropped");
            }
        }

        specs
    }
}

fn build_spec(name: &str, tool: &RegisteredTool) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: tool.description.clone(),
        input_schema: schema_from_value(&tool.schema),
    }
}

/// Build an [`InputSchema`] from a raw registry schema, tolerating the
/// shapes seen in the wild: `required` may be a string array, an
/// any-array with non-string entries mixed in, or absent entirely.
fn schema_from_value(schema: &Value) -> InputSchema {
    let kind = schema
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("object")
        .to_string();

    let properties = schema
        .get("properties")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    let required = match schema.get("required") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    let extra = schema
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter(|(k, _)| !matches!(k.as_str(), "type" | "properties" | "required"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();

    InputSchema {
        kind,
        properties,
        required,
        extra,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
