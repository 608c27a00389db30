//! Execution input accepted by `WorkflowController::start`.
//!
//! The wire form keeps the field names operators already submit:
//!
//! ```json
//! {
//!   "sourceFilesCsvBucket": "manifests",
//!   "sourceFilesCsvKey": "copy-out/manifest.csv",
//!   "destinationBucket": "partner-transfer-target",
//!   "maxItemsPerBatch": 10
//! }
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::manifest::ManifestLocation;
use crate::constants::COPY_TOOL_REMOTE;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("Missing required input field '{0}'")]
    MissingField(&'static str),

    #[error("maxItemsPerBatch must be at least 1, got {0}")]
    InvalidBatchSize(usize),

    #[error("Malformed execution input: {0}")]
    Malformed(String),
}

/// Immutable parameters of one workflow run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ExecutionInputDocument", into = "ExecutionInputDocument")]
pub struct ExecutionInput {
    pub source_manifest: ManifestLocation,
    pub destination: String,
    /// `None` means the deployment default applies
    pub max_items_per_batch: Option<usize>,
}

impl ExecutionInput {
    pub fn new(
        source_manifest: ManifestLocation,
        destination: impl Into<String>,
        max_items_per_batch: Option<usize>,
    ) -> Self {
        Self {
            source_manifest,
            destination: destination.into(),
            max_items_per_batch,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, InputError> {
        serde_json::from_str(json).map_err(|e| InputError::Malformed(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), InputError> {
        if self.source_manifest.container.trim().is_empty() {
            return Err(InputError::MissingField("sourceFilesCsvBucket"));
        }
        if self.source_manifest.key.trim().is_empty() {
            return Err(InputError::MissingField("sourceFilesCsvKey"));
        }
        if self.destination.trim().is_empty() {
            return Err(InputError::MissingField("destinationBucket"));
        }
        if let Some(0) = self.max_items_per_batch {
            return Err(InputError::InvalidBatchSize(0));
        }
        Ok(())
    }

    /// Batch size after merging the deployment default
    pub fn resolved_max_items_per_batch(&self, default: usize) -> usize {
        self.max_items_per_batch.unwrap_or(default)
    }

    /// Destination in the copy tool's remote syntax
    pub fn destination_locator(&self) -> String {
        format!("{COPY_TOOL_REMOTE}:{}", self.destination)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionInputDocument {
    #[serde(default)]
    source_files_csv_bucket: String,
    #[serde(default)]
    source_files_csv_key: String,
    #[serde(default)]
    destination_bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_items_per_batch: Option<usize>,
}

impl TryFrom<ExecutionInputDocument> for ExecutionInput {
    type Error = InputError;

    fn try_from(doc: ExecutionInputDocument) -> Result<Self, Self::Error> {
        let input = ExecutionInput {
            source_manifest: ManifestLocation::new(
                doc.source_files_csv_bucket,
                doc.source_files_csv_key,
            ),
            destination: doc.destination_bucket,
            max_items_per_batch: doc.max_items_per_batch,
        };
        input.validate()?;
        Ok(input)
    }
}

impl From<ExecutionInput> for ExecutionInputDocument {
    fn from(input: ExecutionInput) -> Self {
        Self {
            source_files_csv_bucket: input.source_manifest.container,
            source_files_csv_key: input.source_manifest.key,
            destination_bucket: input.destination,
            max_items_per_batch: input.max_items_per_batch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_wire_names_and_defaults_batch_size() {
        let input = ExecutionInput::from_json(
            r#"{
                "sourceFilesCsvBucket": "manifests",
                "sourceFilesCsvKey": "run-1.csv",
                "destinationBucket": "partner-target"
            }"#,
        )
        .unwrap();

        assert_eq!(input.source_manifest.container, "manifests");
        assert_eq!(input.source_manifest.key, "run-1.csv");
        assert_eq!(input.max_items_per_batch, None);
        assert_eq!(input.resolved_max_items_per_batch(1), 1);
        assert_eq!(input.destination_locator(), "s3:partner-target");
    }

    #[test]
    fn test_explicit_batch_size_wins() {
        let input = ExecutionInput::from_json(
            r#"{"sourceFilesCsvBucket":"m","sourceFilesCsvKey":"k",
                "destinationBucket":"d","maxItemsPerBatch":10}"#,
        )
        .unwrap();
        assert_eq!(input.resolved_max_items_per_batch(1), 10);
    }

    #[test]
    fn test_rejects_zero_batch_size_and_missing_fields() {
        let err = ExecutionInput::from_json(
            r#"{"sourceFilesCsvBucket":"m","sourceFilesCsvKey":"k",
                "destinationBucket":"d","maxItemsPerBatch":0}"#,
        )
        .unwrap_err();
        assert!(matches!(err, InputError::Malformed(_)));

        let input = ExecutionInput::new(ManifestLocation::new("m", "k"), "", None);
        assert_eq!(
            input.validate(),
            Err(InputError::MissingField("destinationBucket"))
        );
    }
}
