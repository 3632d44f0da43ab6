//! Move a single video from a remote source into a bucket-addressed object
//! store: chunked, with progress accounting, metadata attached and committed
//! exactly once.

pub mod config;
pub mod errors;
pub mod models;
pub mod services;

pub use errors::{ErrorKind, TransferError};
pub use models::{location::Location, metadata::TransferMetadata};
pub use services::transfer::{TransferReport, TransferRequest, run_pipeline, transfer};
