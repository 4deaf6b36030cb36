//! Tool schema offered to the model and strict parsing of its calls.

#![forbid(unsafe_code)]

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::ToolError;

pub const TOOL_SEARCH: &str = "search";
pub const TOOL_APPLY: &str = "apply_translations";
pub const TOOL_SKIP: &str = "skip";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchArgs {
    pub terms: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TranslationArg {
    pub index: usize,
    pub translated: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyArgs {
    pub translations: Vec<TranslationArg>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkipEntry {
    pub index: usize,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkipArgs {
    pub entries: Vec<SkipEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCall {
    Search(SearchArgs),
    Apply(ApplyArgs),
    Skip(SkipArgs),
}

impl ToolCall {
    /// Parse a call by tool name and its raw JSON arguments.
    pub fn parse(name: &str, arguments: &str) -> Result<Self, ToolError> {
        match name {
            TOOL_SEARCH => decode(name, arguments).map(ToolCall::Search),
            TOOL_APPLY => decode(name, arguments).map(ToolCall::Apply),
            TOOL_SKIP => decode(name, arguments).map(ToolCall::Skip),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::Search(_) => TOOL_SEARCH,
            ToolCall::Apply(_) => TOOL_APPLY,
            ToolCall::Skip(_) => TOOL_SKIP,
        }
    }
}

fn decode<T: DeserializeOwned>(tool: &str, arguments: &str) -> Result<T, ToolError> {
    let raw = if arguments.trim().is_empty() { "{}" } else { arguments };
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments { tool: tool.to_string(), reason: e.to_string() })
}

/// OpenAI-style `tools` array.
pub fn definitions() -> Value {
    json!([
        {
            "type": "function",
            "function": {
                "name": TOOL_SEARCH,
                "description": "Look up terms in the glossary and in earlier translations. Each term not already cached costs one unit of search budget.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "terms": { "type": "array", "items": { "type": "string" }, "minItems": 1 }
                    },
                    "required": ["terms"],
                    "additionalProperties": false
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": TOOL_APPLY,
                "description": "Commit translations for queued entries. All indices must be in the queue or the whole call is rejected. Entries with identical source text are filled automatically.",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "translations": {
                            "type": "array",
                            "minItems": 1,
                            "items": {
                                "type": "object",
                                "properties": {
                                    "index": { "type": "integer", "minimum": 0 },
                                    "translated": { "type": "string" }
                                },
                                "required": ["index", "translated"],
                                "additionalProperties": false
                            }
                        }
                    },
                    "required": ["translations"],
                    "additionalProperties": false
                }
            }
        },
        {
            "type": "function",
            "function": {
                "name": TOOL_SKIP,
                "description": "Remove queued entries that need no translation (numbers, symbols, text already in the target language).",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "entries": {
                            "type": "array",
                            "minItems": 1,
                            "items": {
                                "type": "object",
                                "properties": {
                                    "index": { "type": "integer", "minimum": 0 },
                                    "reason": { "type": "string" }
                                },
                                "required": ["index"],
                                "additionalProperties": false
                            }
                        }
                    },
                    "required": ["entries"],
                    "additionalProperties": false
                }
            }
        }
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_tool() {
        assert_eq!(
            ToolCall::parse("search", r#"{"terms":["Sothis"]}"#).unwrap(),
            ToolCall::Search(SearchArgs { terms: vec!["Sothis".into()] })
        );
        let apply = ToolCall::parse("apply_translations", r#"{"translations":[{"index":1,"translated":"剑"}]}"#).unwrap();
        assert_eq!(apply.name(), TOOL_APPLY);
        let skip = ToolCall::parse("skip", r#"{"entries":[{"index":4}]}"#).unwrap();
        assert_eq!(skip, ToolCall::Skip(SkipArgs { entries: vec![SkipEntry { index: 4, reason: None }] }));
    }

    #[test]
    fn rejects_unknown_fields_and_tools() {
        let err = ToolCall::parse("apply_translations", r#"{"translations":[{"index":1,"text":"剑"}]}"#).unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments { ref tool, .. } if tool == "apply_translations"));
        assert!(matches!(ToolCall::parse("skip", r#"{"entries":[{"index":-1}]}"#), Err(ToolError::InvalidArguments { .. })));
        assert_eq!(ToolCall::parse("finish", "{}"), Err(ToolError::UnknownTool("finish".into())));
    }

    #[test]
    fn definitions_cover_all_tools() {
        let defs = definitions();
        let names: Vec<&str> = defs
            .as_array()
            .unwrap()
            .iter()
            .map(|d| d["function"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec![TOOL_SEARCH, TOOL_APPLY, TOOL_SKIP]);
    }
}
