//! Storage client seam used by the transfer session.
//!
//! A backend hands out a project for a parsed credential; the project ensures
//! buckets and opens upload sinks. Sinks are two-phase: bytes and metadata
//! stay invisible to readers until `commit` succeeds.

use crate::models::metadata::CustomMetadata;
use async_trait::async_trait;
use std::{future::Future, io};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("destination {destination} accepted {written} of {expected} bytes")]
    ShortWrite {
        destination: usize,
        expected: usize,
        written: usize,
    },
    #[error("{0}")]
    Backend(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("access grant is not valid base64")]
    Encoding,
    #[error("access grant is malformed: {0}")]
    Malformed(String),
    #[error("access grant version {0} is not supported")]
    UnsupportedVersion(u32),
    #[error("access grant does not name a project")]
    EmptyProject,
}

/// Outcome of a successful commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    /// Key the object became visible under. Differs from the requested key
    /// when the store picked a default name.
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

/// Anything a chunk of bytes can be written to.
#[async_trait]
pub trait ByteSink: Send {
    /// Write `buf`, returning how many bytes were accepted.
    async fn write(&mut self, buf: &[u8]) -> StorageResult<usize>;
}

/// A write sink bound to one (bucket, key).
#[async_trait]
pub trait UploadSink: ByteSink {
    async fn set_metadata(&mut self, metadata: CustomMetadata) -> StorageResult<()>;

    /// Make the object visible. Consumes the sink.
    async fn commit(self: Box<Self>) -> StorageResult<CommitInfo>;

    /// Discard everything written so far. Consumes the sink.
    async fn abort(self: Box<Self>) -> StorageResult<()>;
}

#[async_trait]
pub trait Project: Send + Sync {
    /// Create the bucket if it does not exist yet.
    async fn ensure_bucket(&self, bucket: &str, cancel: &CancellationToken) -> StorageResult<()>;

    async fn open_upload(&self, bucket: &str, key: &str) -> StorageResult<Box<dyn UploadSink>>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    type Access: Send + Sync;

    fn parse_credential(&self, grant: &str) -> Result<Self::Access, CredentialError>;

    async fn open_project(
        &self,
        access: &Self::Access,
        cancel: &CancellationToken,
    ) -> StorageResult<Box<dyn Project>>;
}

/// Race a storage call against the cancellation signal.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> StorageResult<T>
where
    F: Future<Output = StorageResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StorageError::Cancelled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancellable_passes_through_result() {
        let cancel = CancellationToken::new();
        let value = cancellable(&cancel, async { Ok::<_, StorageError>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn cancellable_aborts_pending_call() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let res = cancellable(&cancel, async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, StorageError>(())
        })
        .await;
        assert!(matches!(res, Err(StorageError::Cancelled)));
    }
}
