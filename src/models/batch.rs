use serde::{Deserialize, Serialize};

use super::manifest::{MalformedRow, ManifestRecord};

/// Parameters shared by every batch of a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedParameters {
    /// Destination in the copy tool's remote syntax
    pub destination_locator: String,
}

/// An ordered, non-empty slice of the manifest handed to one executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Position in batch creation order (0-based)
    pub index: u64,
    pub items: Vec<ManifestRecord>,
    pub shared: SharedParameters,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Source locators in manifest order, or the first malformed row
    pub fn source_locators(&self) -> Result<Vec<String>, &MalformedRow> {
        self.items
            .iter()
            .map(|record| match record {
                ManifestRecord::Entry(entry) => Ok(entry.source_locator()),
                ManifestRecord::Malformed(row) => Err(row),
            })
            .collect()
    }

    /// Locators of every parseable item, for reporting failed batches
    pub fn known_locators(&self) -> Vec<String> {
        self.items
            .iter()
            .filter_map(|record| record.entry().map(|e| e.source_locator()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ManifestEntry;

    fn batch(items: Vec<ManifestRecord>) -> Batch {
        Batch {
            index: 0,
            items,
            shared: SharedParameters {
                destination_locator: "s3:target".to_string(),
            },
        }
    }

    #[test]
    fn test_source_locators_preserve_order() {
        let b = batch(vec![
            ManifestEntry::new("a", "1").into(),
            ManifestEntry::new("b", "2").into(),
        ]);
        assert_eq!(b.source_locators().unwrap(), vec!["s3:a/1", "s3:b/2"]);
    }

    #[test]
    fn test_malformed_item_poisons_locators() {
        let b = batch(vec![
            ManifestEntry::new("a", "1").into(),
            ManifestRecord::parse(2, "broken").unwrap(),
        ]);
        let row = b.source_locators().unwrap_err();
        assert_eq!(row.line_number, 2);
        assert_eq!(b.known_locators(), vec!["s3:a/1"]);
    }
}
