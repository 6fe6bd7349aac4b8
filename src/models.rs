//! Data shared across the codec, services and lifecycle manager.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Outcome of a format request.
///
/// - `formatted_content == None && error == None`: the daemon made no change
/// - `formatted_content == Some(_)`: the new file text
/// - `error == Some(_)`: the daemon failed to format the file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatResult {
    pub formatted_content: Option<String>,
    pub error: Option<String>,
}

impl FormatResult {
    pub fn unchanged() -> Self {
        Self::default()
    }

    pub fn formatted(content: impl Into<String>) -> Self {
        Self {
            formatted_content: Some(content.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            formatted_content: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The text the document should hold after this result: the formatted
    /// content, or `original` when unchanged or on error.
    pub fn content_or<'a>(&'a self, original: &'a str) -> &'a str {
        match (&self.formatted_content, &self.error) {
            (Some(content), None) => content,
            _ => original,
        }
    }
}

/// A range of character offsets (UTF-16 code units) into file content.
pub type CharRange = Range<usize>;

/// Editor services either speak the schema 4 or the schema 5 protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    V4,
    V5,
}

impl ProtocolVersion {
    pub fn schema_version(&self) -> u32 {
        match self {
            ProtocolVersion::V4 => 4,
            ProtocolVersion::V5 => 5,
        }
    }
}
