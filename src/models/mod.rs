//! # Data Model
//!
//! Value types that flow through a copy-out run: the execution input, manifest
//! rows and the batches built from them.

pub mod batch;
pub mod execution_input;
pub mod manifest;

pub use batch::{Batch, SharedParameters};
pub use execution_input::{ExecutionInput, InputError};
pub use manifest::{MalformedRow, ManifestEntry, ManifestLocation, ManifestRecord};
