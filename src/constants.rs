//! # System Constants
//!
//! Defaults and fixed names that define the operational boundaries of a
//! copy-out run.

/// Key of the marker object written by the destination probe
pub const MARKER_OBJECT_KEY: &str = "STARTED_TRANSFER.txt";

/// Body of the marker object written by the destination probe
pub const MARKER_OBJECT_BODY: &str =
    "A file created by copy out to ensure correct permissions";

/// Provider error code for a destination outside the client's region
pub const PROVIDER_CODE_PERMANENT_REDIRECT: &str = "PermanentRedirect";

/// Provider error code for a rejected write
pub const PROVIDER_CODE_ACCESS_DENIED: &str = "AccessDenied";

/// Environment parameter carrying the destination locator to the copy tool
pub const DESTINATION_ENV_NAME: &str = "destination";

/// Remote prefix understood by the copy tool
pub const COPY_TOOL_REMOTE: &str = "s3";

pub const DEFAULT_MAX_ITEMS_PER_BATCH: usize = 1;
pub const DEFAULT_MAX_CONCURRENCY: usize = 90;
pub const DEFAULT_TOLERATED_FAILURE_PERCENTAGE: f64 = 25.0;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_MAX_RETRY_DELAY_SECONDS: u64 = 300; // 5 minutes

/// Successful batch records kept per run for inspection
pub const BATCH_RECORD_HISTORY: usize = 256;

/// Lifecycle events emitted into the structured log
pub mod events {
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_SUCCEEDED: &str = "run.succeeded";
    pub const RUN_FAILED: &str = "run.failed";
    pub const PROBE_ATTEMPTED: &str = "probe.attempted";
    pub const PROBE_WAITING: &str = "probe.waiting";
    pub const BATCH_DISPATCHED: &str = "batch.dispatched";
    pub const BATCH_RETRYING: &str = "batch.retrying";
    pub const BATCH_SUCCEEDED: &str = "batch.succeeded";
    pub const BATCH_FAILED: &str = "batch.failed";
}
