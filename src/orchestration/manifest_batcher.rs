//! # Manifest Batcher
//!
//! Streams a headerless `container,key` manifest and groups its rows into
//! batches of at most `max_items_per_batch`. The manifest is never held in
//! memory: at most one batch worth of rows is buffered at a time, and the
//! dispatcher only pulls the next batch once it has a concurrency slot for it.
//!
//! Calling [`ManifestBatcher::batches`] again reopens the source and yields the
//! same sequence from the start.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, instrument};

use crate::models::{Batch, ManifestLocation, ManifestRecord, SharedParameters};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("Manifest {location} could not be opened: {message}")]
    Unreadable {
        location: ManifestLocation,
        message: String,
    },

    #[error("Manifest {location} failed after line {line_number}: {message}")]
    ReadFailed {
        location: ManifestLocation,
        line_number: u64,
        message: String,
    },
}

/// Raw manifest lines, in order, as undecoded bytes
///
/// Decoding happens per row in the batcher, so one undecodable row fails only
/// its own batch.
pub type ManifestLines = BoxStream<'static, Result<Vec<u8>, ManifestError>>;

/// Lazily produced batches, in manifest order
pub type BatchStream = BoxStream<'static, Result<Batch, ManifestError>>;

/// Read-only, row-oriented manifest boundary
#[async_trait]
pub trait ManifestSource: Send + Sync {
    async fn open(&self, location: &ManifestLocation) -> Result<ManifestLines, ManifestError>;
}

/// Manifests on the local filesystem: `{root}/{container}/{key}`
#[derive(Debug, Clone)]
pub struct LocalManifestSource {
    root: PathBuf,
}

impl LocalManifestSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ManifestSource for LocalManifestSource {
    async fn open(&self, location: &ManifestLocation) -> Result<ManifestLines, ManifestError> {
        let path = self.root.join(&location.container).join(&location.key);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| ManifestError::Unreadable {
                location: location.clone(),
                message: format!("{}: {e}", path.display()),
            })?;

        let reader = BufReader::new(file);
        let location = location.clone();

        let stream = stream::unfold(
            (reader, 0u64, false),
            move |(mut reader, read, failed)| {
                let location = location.clone();
                async move {
                    if failed {
                        return None;
                    }
                    let mut line = Vec::new();
                    match reader.read_until(b'\n', &mut line).await {
                        Ok(0) => None,
                        Ok(_) => {
                            if line.last() == Some(&b'\n') {
                                line.pop();
                            }
                            Some((Ok(line), (reader, read + 1, false)))
                        }
                        Err(e) => Some((
                            Err(ManifestError::ReadFailed {
                                location,
                                line_number: read,
                                message: e.to_string(),
                            }),
                            (reader, read, true),
                        )),
                    }
                }
            },
        );

        Ok(stream.boxed())
    }
}

struct BatchCursor {
    lines: ManifestLines,
    line_number: u64,
    next_index: u64,
    max_items: usize,
    shared: SharedParameters,
    exhausted: bool,
}

/// Partitions a manifest into ordered batches sharing one destination
#[derive(Clone)]
pub struct ManifestBatcher {
    source: Arc<dyn ManifestSource>,
    location: ManifestLocation,
    max_items_per_batch: usize,
    shared: SharedParameters,
}

impl ManifestBatcher {
    /// `max_items_per_batch` of zero is treated as one
    pub fn new(
        source: Arc<dyn ManifestSource>,
        location: ManifestLocation,
        max_items_per_batch: usize,
        shared: SharedParameters,
    ) -> Self {
        Self {
            source,
            location,
            max_items_per_batch: max_items_per_batch.max(1),
            shared,
        }
    }

    pub fn max_items_per_batch(&self) -> usize {
        self.max_items_per_batch
    }

    /// Open the manifest and return its batches as a lazy stream
    ///
    /// Fails only when the source cannot be opened at all. Malformed rows are
    /// carried into their batch; a read error mid-stream ends the stream with
    /// that error.
    #[instrument(
        skip(self),
        fields(manifest = %self.location, max_items = self.max_items_per_batch)
    )]
    pub async fn batches(&self) -> Result<BatchStream, ManifestError> {
        let lines = self.source.open(&self.location).await?;
        debug!("📄 BATCHER: Manifest opened");

        let cursor = BatchCursor {
            lines,
            line_number: 0,
            next_index: 0,
            max_items: self.max_items_per_batch,
            shared: self.shared.clone(),
            exhausted: false,
        };

        Ok(stream::unfold(cursor, next_batch).boxed())
    }
}

async fn next_batch(
    mut cursor: BatchCursor,
) -> Option<(Result<Batch, ManifestError>, BatchCursor)> {
    if cursor.exhausted {
        return None;
    }

    let mut items = Vec::with_capacity(cursor.max_items.min(1024));
    while items.len() < cursor.max_items {
        match cursor.lines.next().await {
            Some(Ok(line)) => {
                cursor.line_number += 1;
                if let Some(record) = ManifestRecord::parse_bytes(cursor.line_number, &line) {
                    items.push(record);
                }
            }
            Some(Err(error)) => {
                // Rows buffered before the failure are not dispatched
                cursor.exhausted = true;
                return Some((Err(error), cursor));
            }
            None => {
                cursor.exhausted = true;
                break;
            }
        }
    }

    if items.is_empty() {
        return None;
    }

    let batch = Batch {
        index: cursor.next_index,
        items,
        shared: cursor.shared.clone(),
    };
    cursor.next_index += 1;
    Some((Ok(batch), cursor))
}
