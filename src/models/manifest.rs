//! Manifest rows and the locators derived from them.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::COPY_TOOL_REMOTE;

/// Where a manifest lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestLocation {
    pub container: String,
    pub key: String,
}

impl ManifestLocation {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ManifestLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.container, self.key)
    }
}

/// One object to copy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source_container: String,
    pub source_key: String,
}

impl ManifestEntry {
    pub fn new(source_container: impl Into<String>, source_key: impl Into<String>) -> Self {
        Self {
            source_container: source_container.into(),
            source_key: source_key.into(),
        }
    }

    /// Fully-qualified source in the copy tool's remote syntax (not a URL)
    pub fn source_locator(&self) -> String {
        format!(
            "{COPY_TOOL_REMOTE}:{}/{}",
            self.source_container, self.source_key
        )
    }
}

/// A manifest row that could not be parsed into an entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MalformedRow {
    /// 1-based line number in the manifest
    pub line_number: u64,
    pub raw: String,
    pub reason: String,
}

/// A manifest row as carried through batching
///
/// Malformed rows keep their position so the batch that contains them fails,
/// rather than the whole manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManifestRecord {
    Entry(ManifestEntry),
    Malformed(MalformedRow),
}

impl ManifestRecord {
    /// Parse one headerless `container,key` CSV row
    ///
    /// Returns `None` for blank lines.
    pub fn parse(line_number: u64, line: &str) -> Option<Self> {
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.trim().is_empty() {
            return None;
        }

        let record = match split_csv_fields(trimmed) {
            Ok(mut fields) if fields.len() == 2 => {
                // Object keys may legally begin or end with spaces; keep them
                let key = fields.pop().unwrap_or_default();
                let container = fields.pop().unwrap_or_default();
                if container.is_empty() || key.is_empty() {
                    Self::malformed(line_number, trimmed, "empty container or key")
                } else {
                    Self::Entry(ManifestEntry::new(container, key))
                }
            }
            Ok(fields) => Self::malformed(
                line_number,
                trimmed,
                format!("expected 2 columns, found {}", fields.len()),
            ),
            Err(reason) => Self::malformed(line_number, trimmed, reason),
        };
        Some(record)
    }

    /// Parse one raw manifest row
    ///
    /// A row that is not valid UTF-8 becomes a malformed record in place, so
    /// only the batch holding it fails.
    pub fn parse_bytes(line_number: u64, raw: &[u8]) -> Option<Self> {
        match std::str::from_utf8(raw) {
            Ok(line) => Self::parse(line_number, line),
            Err(e) => {
                let lossy = String::from_utf8_lossy(raw);
                let lossy = lossy.trim_end_matches(['\r', '\n']);
                Some(Self::malformed(
                    line_number,
                    lossy,
                    format!("invalid UTF-8 at byte {}", e.valid_up_to()),
                ))
            }
        }
    }

    fn malformed(line_number: u64, raw: &str, reason: impl Into<String>) -> Self {
        Self::Malformed(MalformedRow {
            line_number,
            raw: raw.to_string(),
            reason: reason.into(),
        })
    }

    pub fn entry(&self) -> Option<&ManifestEntry> {
        match self {
            Self::Entry(entry) => Some(entry),
            Self::Malformed(_) => None,
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::Malformed(_))
    }
}

impl From<ManifestEntry> for ManifestRecord {
    fn from(entry: ManifestEntry) -> Self {
        Self::Entry(entry)
    }
}

/// Split a CSV line into fields, honouring double quotes and `""` escapes
fn split_csv_fields(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            ('"', false) if current.trim().is_empty() => {
                current.clear();
                in_quotes = true;
            }
            (',', false) => fields.push(std::mem::take(&mut current)),
            (c, _) => current.push(c),
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    fields.push(current);
    Ok(fields)
}
