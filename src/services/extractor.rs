//! Video source extraction.
//!
//! [`YtDlpSource`] shells out to `yt-dlp`: one call probes the video as JSON,
//! a second streams the selected format to stdout. The binary location is
//! part of [`YtDlpConfig`], handed to the constructor.

use crate::models::metadata::TransferMetadata;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::{FutureExt, future::BoxFuture};
use serde::Deserialize;
use std::{
    io,
    path::PathBuf,
    pin::Pin,
    process::{ExitStatus, Stdio},
    task::{Context, Poll, ready},
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, ReadBuf},
    process::{Child, ChildStdout, Command},
};
use tracing::debug;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to launch `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },
    #[error("`{binary}` exited with {status}: {stderr}")]
    ProbeFailed {
        binary: String,
        status: String,
        stderr: String,
    },
    #[error("could not understand extractor output: {0}")]
    InvalidProbe(String),
    #[error("source stream failed: {0}")]
    Stream(#[source] io::Error),
    #[error("source delivered {actual} bytes, expected {expected}")]
    LengthMismatch { expected: u64, actual: u64 },
}

/// A fetched source: the byte stream, its declared length and description.
pub struct SourceMedia {
    pub stream: Box<dyn AsyncRead + Send + Unpin>,
    /// `None` when the source does not declare an exact size.
    pub content_length: Option<u64>,
    pub metadata: TransferMetadata,
}

#[async_trait]
pub trait VideoSource: Send + Sync {
    async fn fetch(&self, identifier: &str, quality: &str) -> Result<SourceMedia, ExtractionError>;
}

#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    pub binary: PathBuf,
    /// Placed before yt-dlp's own arguments, e.g. `["-m", "yt_dlp"]` when
    /// `binary` is a Python interpreter.
    pub base_args: Vec<String>,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("yt-dlp"),
            base_args: Vec::new(),
        }
    }
}

pub struct YtDlpSource {
    config: YtDlpConfig,
}

impl YtDlpSource {
    pub fn new(config: YtDlpConfig) -> Self {
        Self { config }
    }

    fn command(&self, quality: &str) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&self.config.base_args)
            .args(["--no-warnings", "--no-playlist", "-f"])
            .arg(format_selector(quality))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    fn binary_name(&self) -> String {
        self.config.binary.display().to_string()
    }

    async fn probe(
        &self,
        identifier: &str,
        quality: &str,
    ) -> Result<(TransferMetadata, Option<u64>), ExtractionError> {
        let output = self
            .command(quality)
            .args(["--dump-single-json", "--", identifier])
            .output()
            .await
            .map_err(|source| ExtractionError::Spawn {
                binary: self.binary_name(),
                source,
            })?;

        if !output.status.success() {
            return Err(ExtractionError::ProbeFailed {
                binary: self.binary_name(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_probe(&output.stdout, identifier)
    }
}

#[async_trait]
impl VideoSource for YtDlpSource {
    async fn fetch(&self, identifier: &str, quality: &str) -> Result<SourceMedia, ExtractionError> {
        if identifier.trim().is_empty() {
            return Err(ExtractionError::InvalidRequest("empty video identifier".into()));
        }
        if quality.trim().is_empty() {
            return Err(ExtractionError::InvalidRequest("empty quality selector".into()));
        }

        let (metadata, content_length) = self.probe(identifier, quality).await?;
        debug!(title = %metadata.title, ?content_length, "probed source");

        let mut child = self
            .command(quality)
            .args(["--quiet", "--no-progress", "-o", "-", "--", identifier])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ExtractionError::Spawn {
                binary: self.binary_name(),
                source,
            })?;
        let stdout = child.stdout.take().ok_or_else(|| ExtractionError::Spawn {
            binary: self.binary_name(),
            source: io::Error::other("stdout was not captured"),
        })?;

        Ok(SourceMedia {
            stream: Box::new(ChildStream::new(child, stdout)),
            content_length,
            metadata,
        })
    }
}

/// Turn a quality label into a yt-dlp format selector.
///
/// Named labels (`tiny`, `small`, `medium`, `large`, `hd720`, `hd1080`, ...)
/// and `<height>p` pick the best single file no taller than that height.
/// Anything else, `best` included, is handed to yt-dlp as a selector.
pub fn format_selector(quality: &str) -> String {
    let quality = quality.trim();
    let height = match quality {
        "tiny" => Some(144),
        "small" => Some(240),
        "medium" => Some(360),
        "large" => Some(480),
        "hd720" => Some(720),
        "hd1080" => Some(1080),
        "hd1440" => Some(1440),
        "hd2160" => Some(2160),
        other => other
            .strip_suffix('p')
            .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|digits| digits.parse::<u32>().ok()),
    };
    match height {
        Some(height) => format!("best[height<={height}]"),
        None => quality.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct ProbeInfo {
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    upload_date: Option<String>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    // exact size only; `filesize_approx` would make byte accounting lie
    filesize: Option<u64>,
}

/// Map yt-dlp's JSON description onto transfer metadata and a declared size.
fn parse_probe(
    json: &[u8],
    identifier: &str,
) -> Result<(TransferMetadata, Option<u64>), ExtractionError> {
    let info: ProbeInfo =
        serde_json::from_slice(json).map_err(|err| ExtractionError::InvalidProbe(err.to_string()))?;

    let publish_date = match info.upload_date {
        Some(raw) => NaiveDate::parse_from_str(&raw, "%Y%m%d")
            .map(|date| date.format("%Y-%m-%d").to_string())
            .unwrap_or(raw),
        None => String::new(),
    };

    let metadata = TransferMetadata {
        title: info.title.unwrap_or_default(),
        author: info.uploader.or(info.channel).unwrap_or_default(),
        publish_date,
        source_url: info
            .webpage_url
            .or(info.original_url)
            .unwrap_or_else(|| identifier.to_string()),
    };
    Ok((metadata, info.filesize))
}

/// Child stdout that reports a non-zero exit of the child as a read error
/// once the pipe is drained.
struct ChildStream {
    child: Option<Child>,
    stdout: ChildStdout,
    wait: Option<BoxFuture<'static, io::Result<ExitStatus>>>,
    finished: bool,
}

impl ChildStream {
    fn new(child: Child, stdout: ChildStdout) -> Self {
        Self {
            child: Some(child),
            stdout,
            wait: None,
            finished: false,
        }
    }
}

impl AsyncRead for ChildStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(wait) = this.wait.as_mut() {
                let status = ready!(wait.as_mut().poll(cx));
                this.wait = None;
                this.finished = true;
                return Poll::Ready(match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(io::Error::other(format!("extractor exited with {status}"))),
                    Err(err) => Err(err),
                });
            }
            if this.finished {
                return Poll::Ready(Ok(()));
            }

            let before = buf.filled().len();
            ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
            if buf.filled().len() > before || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            // EOF on stdout: reap the child before reporting end of stream
            match this.child.take() {
                Some(mut child) => this.wait = Some(async move { child.wait().await }.boxed()),
                None => this.finished = true,
            }
        }
    }
}
