use crate::{
    models::location::ParseError,
    services::{
        extractor::ExtractionError,
        storage::{CredentialError, StorageError},
    },
};
use std::fmt;
use thiserror::Error;

/// Any failure of the transfer pipeline, tagged with its taxonomy kind.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid destination: {0}")]
    Parse(#[from] ParseError),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractionError),
    #[error("invalid access grant: {0}")]
    Credential(#[from] CredentialError),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    Extraction,
    Credential,
    Storage,
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse(_) => ErrorKind::Parse,
            Self::Extraction(_) => ErrorKind::Extraction,
            Self::Credential(_) => ErrorKind::Credential,
            Self::Storage(StorageError::Cancelled) => ErrorKind::Cancelled,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }
}

impl ErrorKind {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Parse => 2,
            Self::Extraction => 3,
            Self::Credential => 4,
            Self::Storage => 5,
            Self::Cancelled => 130,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parse => "ParseError",
            Self::Extraction => "ExtractionError",
            Self::Credential => "CredentialError",
            Self::Storage => "StorageError",
            Self::Cancelled => "Cancelled",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_distinct_exit_codes() {
        let cases: Vec<(TransferError, ErrorKind, u8)> = vec![
            (ParseError::EmptyBucket.into(), ErrorKind::Parse, 2),
            (
                ExtractionError::InvalidRequest("x".into()).into(),
                ErrorKind::Extraction,
                3,
            ),
            (CredentialError::Encoding.into(), ErrorKind::Credential, 4),
            (
                StorageError::BucketNotFound("b".into()).into(),
                ErrorKind::Storage,
                5,
            ),
            (StorageError::Cancelled.into(), ErrorKind::Cancelled, 130),
        ];
        for (err, kind, code) in cases {
            assert_eq!(err.kind(), kind);
            assert_eq!(err.exit_code(), code);
        }
    }

    #[test]
    fn display_includes_source_message() {
        let err = TransferError::from(ParseError::InvalidScheme("http://x".into()));
        assert!(err.to_string().contains("http://x"));
        assert_eq!(err.kind().to_string(), "ParseError");
    }
}
