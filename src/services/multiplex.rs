//! Fan-out writer: one logical write, dispatched to several sinks in order.

use crate::services::{
    progress::ProgressInstrument,
    storage::{ByteSink, StorageError, StorageResult},
};
use async_trait::async_trait;

/// Forwards each write to every destination, in list order.
///
/// A write succeeds only when every destination accepts the whole buffer. The
/// first error or short write stops the fan-out; destinations earlier in the
/// list keep what they already received, so callers must treat any failure as
/// fatal for the whole transfer.
pub struct MultiplexWriter<'a> {
    destinations: Vec<&'a mut dyn ByteSink>,
}

impl<'a> MultiplexWriter<'a> {
    pub fn new(destinations: Vec<&'a mut dyn ByteSink>) -> Self {
        Self { destinations }
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> StorageResult<()> {
        for (index, dest) in self.destinations.iter_mut().enumerate() {
            let written = dest.write(buf).await?;
            if written != buf.len() {
                return Err(StorageError::ShortWrite {
                    destination: index,
                    expected: buf.len(),
                    written,
                });
            }
        }
        Ok(())
    }
}

/// Lets a progress instrument take part in the fan-out.
pub struct ProgressTap<'a> {
    instrument: &'a mut dyn ProgressInstrument,
}

impl<'a> ProgressTap<'a> {
    pub fn new(instrument: &'a mut dyn ProgressInstrument) -> Self {
        Self { instrument }
    }
}

#[async_trait]
impl ByteSink for ProgressTap<'_> {
    async fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
        self.instrument.observe(buf.len() as u64);
        Ok(buf.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::progress::ProgressState;

    #[derive(Default)]
    struct VecSink {
        data: Vec<u8>,
    }

    #[async_trait]
    impl ByteSink for VecSink {
        async fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    /// Accepts at most `limit` bytes per call.
    struct StingySink {
        limit: usize,
    }

    #[async_trait]
    impl ByteSink for StingySink {
        async fn write(&mut self, buf: &[u8]) -> StorageResult<usize> {
            Ok(buf.len().min(self.limit))
        }
    }

    struct BrokenSink;

    #[async_trait]
    impl ByteSink for BrokenSink {
        async fn write(&mut self, _buf: &[u8]) -> StorageResult<usize> {
            Err(StorageError::Backend("disk on fire".into()))
        }
    }

    #[tokio::test]
    async fn every_sink_receives_identical_bytes_and_progress_counts_them() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut a = VecSink::default();
        let mut b = VecSink::default();
        let mut c = VecSink::default();
        let mut progress = ProgressState::new(Some(payload.len() as u64));

        {
            let mut tap = ProgressTap::new(&mut progress);
            let dests: Vec<&mut dyn ByteSink> = vec![&mut a, &mut b, &mut c, &mut tap];
            let mut mux = MultiplexWriter::new(dests);
            for chunk in payload.chunks(777) {
                mux.write_all(chunk).await.unwrap();
            }
        }

        assert_eq!(a.data, payload);
        assert_eq!(b.data, payload);
        assert_eq!(c.data, payload);
        assert_eq!(progress.bytes_written(), payload.len() as u64);
        assert_eq!(progress.percentage(), Some(100));
    }

    #[tokio::test]
    async fn short_write_stops_fan_out_without_rollback() {
        let mut first = VecSink::default();
        let mut stingy = StingySink { limit: 2 };
        let mut last = VecSink::default();

        let err = {
            let dests: Vec<&mut dyn ByteSink> = vec![&mut first, &mut stingy, &mut last];
            let mut mux = MultiplexWriter::new(dests);
            mux.write_all(b"hello").await.unwrap_err()
        };

        assert!(matches!(
            err,
            StorageError::ShortWrite {
                destination: 1,
                expected: 5,
                written: 2
            }
        ));
        // the first destination keeps its bytes, the last never saw them
        assert_eq!(first.data, b"hello");
        assert!(last.data.is_empty());
    }

    #[tokio::test]
    async fn error_from_a_destination_is_returned_unchanged() {
        let mut progress = ProgressState::new(None);
        let mut broken = BrokenSink;
        let err = {
            let mut tap = ProgressTap::new(&mut progress);
            let dests: Vec<&mut dyn ByteSink> = vec![&mut broken, &mut tap];
            let mut mux = MultiplexWriter::new(dests);
            mux.write_all(b"abc").await.unwrap_err()
        };
        assert!(matches!(err, StorageError::Backend(msg) if msg == "disk on fire"));
        assert_eq!(progress.bytes_written(), 0);
    }
}
