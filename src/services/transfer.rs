//! Transfer session: credential → project → bucket → sink → metadata →
//! chunked copy → commit.
//!
//! Every step is fail-fast and nothing is retried. Any failure after the sink
//! is opened aborts the upload so no object becomes visible.

use crate::{
    errors::TransferError,
    models::{location::Location, metadata::CustomMetadata},
    services::{
        extractor::{ExtractionError, SourceMedia, VideoSource},
        multiplex::{MultiplexWriter, ProgressTap},
        progress::{LoggingProgress, ProgressInstrument, ProgressState},
        storage::{
            ByteSink, CommitInfo, ObjectStorage, StorageError, StorageResult, UploadSink,
            cancellable,
        },
    },
};
use async_trait::async_trait;
use bytes::BytesMut;
use std::{
    fmt,
    time::{Duration, Instant},
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Bytes read from the source per copy iteration. Peak buffer memory for a
/// transfer is this, whatever the media size.
pub const CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Accepting writes and metadata.
    Open,
    /// Terminal; the object is visible.
    Committed,
    /// Terminal; nothing is visible.
    Aborted,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// State machine around an upload sink. Once committed or aborted, every
/// further operation fails.
pub struct UploadSession {
    sink: Option<Box<dyn UploadSink>>,
    state: UploadState,
    bytes_written: u64,
}

impl UploadSession {
    pub fn open(sink: Box<dyn UploadSink>) -> Self {
        Self {
            sink: Some(sink),
            state: UploadState::Open,
            bytes_written: 0,
        }
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn open_sink(&mut self) -> StorageResult<&mut Box<dyn UploadSink>> {
        if self.state != UploadState::Open {
            return Err(StorageError::Backend(format!(
                "upload session is already {}",
                self.state
            )));
        }
        self.sink
            .as_mut()
            .ok_or_else(|| StorageError::Backend("upload session lost its sink".into()))
    }

    pub async fn set_metadata(&mut self, metadata: CustomMetadata) -> StorageResult<()> {
        self.open_sink()?.set_metadata(metadata).await
    }

    /// `Open → Committed` on success, `Open → Aborted` on failure.
    pub async fn commit(&mut self) -> StorageResult<CommitInfo> {
        self.open_sink()?;
        // an interrupted commit must not leave the session looking open
        self.state = UploadState::Aborted;
        let sink = self
            .sink
            .take()
            .ok_or_else(|| StorageError::Backend("upload session lost its sink".into()))?;
        let info = sink.commit().await?;
        self.state = UploadState::Committed;
        Ok(info)
    }

    /// `Open → Aborted`. A no-op on a session that is already terminal.
    pub async fn abort(&mut self) -> StorageResult<()> {
        if self.state != UploadState::Open {
            return Ok(());
        }
        self.state = UploadState::Aborted;
        match self.sink.take() {
            Some(sink) => sink.abort().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ByteSink for UploadSession {
    async fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
        let written = self.open_sink()?.write(buf).await?;
        self.bytes_written += written as u64;
        Ok(written)
    }
}

/// Outcome of a committed transfer.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub location: Location,
    /// Key the object is visible under.
    pub key: String,
    pub bytes: u64,
    pub etag: Option<String>,
    pub elapsed: Duration,
}

/// Run steps 1–8 of a transfer for an already fetched source.
pub async fn transfer<S>(
    storage: &S,
    grant: &str,
    location: &Location,
    media: SourceMedia,
    progress: &mut dyn ProgressInstrument,
    cancel: &CancellationToken,
) -> Result<TransferReport, TransferError>
where
    S: ObjectStorage,
{
    let started = Instant::now();

    let access = storage.parse_credential(grant)?;
    let project = storage.open_project(&access, cancel).await?;
    debug!("project opened");

    project.ensure_bucket(location.bucket(), cancel).await?;
    debug!(bucket = location.bucket(), "bucket ensured");

    let sink = cancellable(cancel, project.open_upload(location.bucket(), location.key())).await?;
    let mut session = UploadSession::open(sink);

    match stream_and_commit(&mut session, media, progress, cancel).await {
        Ok(info) => {
            info!(
                key = %info.key,
                bytes = info.size,
                state = %session.state(),
                "upload committed"
            );
            Ok(TransferReport {
                location: location.clone(),
                key: info.key,
                bytes: info.size,
                etag: info.etag,
                elapsed: started.elapsed(),
            })
        }
        Err(err) => {
            if let Err(abort_err) = session.abort().await {
                warn!("failed to abort upload after error: {}", abort_err);
            }
            warn!(
                bytes = session.bytes_written(),
                state = %session.state(),
                "transfer failed: {}",
                err
            );
            Err(err)
        }
    }
}

async fn stream_and_commit(
    session: &mut UploadSession,
    media: SourceMedia,
    progress: &mut dyn ProgressInstrument,
    cancel: &CancellationToken,
) -> Result<CommitInfo, TransferError> {
    let SourceMedia {
        mut stream,
        content_length,
        metadata,
    } = media;

    session.set_metadata(metadata.to_custom_metadata()).await?;

    let copied = copy_chunks(&mut *stream, session, progress, cancel).await?;
    if let Some(expected) = content_length {
        if copied != expected {
            return Err(ExtractionError::LengthMismatch {
                expected,
                actual: copied,
            }
            .into());
        }
    }
    progress.mark_complete();

    Ok(cancellable(cancel, session.commit()).await?)
}

/// Copy the source through `[session, progress]` one bounded chunk at a time,
/// checking for cancellation between chunks.
async fn copy_chunks(
    stream: &mut (dyn AsyncRead + Send + Unpin),
    session: &mut UploadSession,
    progress: &mut dyn ProgressInstrument,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    let mut tap = ProgressTap::new(progress);
    let destinations: Vec<&mut dyn ByteSink> = vec![session, &mut tap];
    let mut writer = MultiplexWriter::new(destinations);
    let mut copied: u64 = 0;

    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StorageError::Cancelled.into()),
            res = stream.read_buf(&mut buf) => res.map_err(ExtractionError::Stream)?,
        };
        if read == 0 {
            break;
        }
        writer.write_all(&buf[..read]).await?;
        copied += read as u64;
    }
    Ok(copied)
}

/// Everything a caller supplies for one run.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub source: String,
    pub destination: String,
    pub grant: String,
    pub quality: String,
}

/// Full pipeline: validate the destination, fetch the source, transfer.
pub async fn run_pipeline<S>(
    request: &TransferRequest,
    source: &dyn VideoSource,
    storage: &S,
    progress_interval: Duration,
    cancel: &CancellationToken,
) -> Result<TransferReport, TransferError>
where
    S: ObjectStorage,
{
    let location = Location::parse(&request.destination)?;
    let span = info_span!("transfer", destination = %location);

    fetch_and_transfer(request, &location, source, storage, progress_interval, cancel)
        .instrument(span)
        .await
}

async fn fetch_and_transfer<S>(
    request: &TransferRequest,
    location: &Location,
    source: &dyn VideoSource,
    storage: &S,
    progress_interval: Duration,
    cancel: &CancellationToken,
) -> Result<TransferReport, TransferError>
where
    S: ObjectStorage,
{
    info!(source = %request.source, quality = %request.quality, "fetching source");
    let media = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(StorageError::Cancelled.into()),
        res = source.fetch(&request.source, &request.quality) => res?,
    };
    info!(
        title = %media.metadata.title,
        content_length = ?media.content_length,
        "source ready"
    );

    let mut progress = LoggingProgress::new(
        ProgressState::new(media.content_length),
        progress_interval,
    );
    transfer(storage, &request.grant, location, media, &mut progress, cancel).await
}
