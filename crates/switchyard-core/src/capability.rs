//! Capability tags declared by agents and required by tasks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named skill. Well-known skills have dedicated variants; anything else
/// travels as [`Capability::Named`]. Serialized as a plain lowercase string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Capability {
    /// Web search and page retrieval.
    WebSearch,
    /// Multi-step reasoning over gathered material.
    Reasoning,
    /// Sandboxed code execution.
    CodeExec,
    /// Free-form text generation.
    TextGeneration,
    /// Any other skill, normalized to lowercase.
    Named(String),
}

impl Capability {
    /// The canonical tag string.
    pub fn as_str(&self) -> &str {
        match self {
            Capability::WebSearch => "web_search",
            Capability::Reasoning => "reasoning",
            Capability::CodeExec => "code_exec",
            Capability::TextGeneration => "text_generation",
            Capability::Named(name) => name,
        }
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        let tag = s.trim().to_lowercase();
        match tag.as_str() {
            "web_search" => Capability::WebSearch,
            "reasoning" => Capability::Reasoning,
            "code_exec" => Capability::CodeExec,
            "text_generation" => Capability::TextGeneration,
            _ => Capability::Named(tag),
        }
    }
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        Capability::from(s.as_str())
    }
}

impl From<Capability> for String {
    fn from(c: Capability) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
