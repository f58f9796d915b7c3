//! Forwarding Loop
//!
//! Copies chunks from one endpoint half to the other until end-of-stream, a
//! transport error, or cancellation. Cancellation is checked at both
//! suspension points; once observed, no further I/O is issued.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::session::{Direction, RelaySession};
use crate::error::RelayError;
use crate::metrics::{Metrics, ThroughputSample};
use crate::transport::{EndpointReader, EndpointWriter};

/// How a forwarding loop ended
#[derive(Debug)]
pub enum ForwardOutcome {
    /// The reading side signalled end-of-stream
    Eof,
    /// The sibling direction finished first, or the session was cancelled
    Cancelled,
    /// Mid-stream transport failure; treated like end-of-stream by the session
    Failed(RelayError),
}

/// Everything a forwarding task needs besides its two halves
#[derive(Clone)]
pub struct ForwardContext {
    pub session: Arc<RelaySession>,
    pub cancel: CancellationToken,
    pub report_interval: Duration,
    pub track_chunks: bool,
    pub metrics: Option<Arc<Metrics>>,
}

/// Result of a finished forwarding loop; the halves are handed back for teardown
pub struct ForwardReport {
    pub direction: Direction,
    pub outcome: ForwardOutcome,
    pub sample: ThroughputSample,
    pub reader: EndpointReader,
    pub writer: EndpointWriter,
}

/// Forward `reader` into `writer` in read order
pub async fn forward(
    direction: Direction,
    mut reader: EndpointReader,
    mut writer: EndpointWriter,
    ctx: ForwardContext,
) -> ForwardReport {
    let mut sample = ThroughputSample::new(ctx.report_interval, ctx.track_chunks);
    debug!(direction = %direction, "Forwarding started");

    let outcome = loop {
        let read = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break ForwardOutcome::Cancelled,
            read = reader.read() => read,
        };

        let chunk = match read {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break ForwardOutcome::Eof,
            Err(e) => break ForwardOutcome::Failed(e),
        };

        let written = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break ForwardOutcome::Cancelled,
            written = writer.write(&chunk) => written,
        };

        if let Err(e) = written {
            break ForwardOutcome::Failed(e);
        }

        let len = chunk.len();
        trace!(direction = %direction, len, "Forwarded chunk");
        ctx.session.add_chunk(direction, len);
        if let Some(metrics) = &ctx.metrics {
            metrics.record_chunk(direction, len);
        }
        if let Some(report) = sample.record(len, Instant::now()) {
            report.log(direction.as_str());
        }
    };

    debug!(
        direction = %direction,
        outcome = ?outcome,
        bytes = sample.total_bytes(),
        chunks = sample.chunk_count(),
        "Forwarding stopped"
    );

    ForwardReport {
        direction,
        outcome,
        sample,
        reader,
        writer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::SessionId;
    use crate::transport::Endpoint;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    fn context(cancel: CancellationToken) -> ForwardContext {
        ForwardContext {
            session: Arc::new(RelaySession::new(
                SessionId(1),
                "test",
                CancellationToken::new(),
            )),
            cancel,
            report_interval: Duration::from_secs(1),
            track_chunks: true,
            metrics: None,
        }
    }

    #[tokio::test]
    async fn test_forward_until_eof() {
        let (mut src_peer, src) = UnixStream::pair().unwrap();
        let (dst, mut dst_peer) = UnixStream::pair().unwrap();
        let (reader, _src_writer) = Endpoint::Unix(src).split(8192);
        let (_dst_reader, writer) = Endpoint::Unix(dst).split(8192);

        let ctx = context(CancellationToken::new());
        let session = Arc::clone(&ctx.session);
        let task = tokio::spawn(forward(Direction::Upstream, reader, writer, ctx));

        src_peer.write_all(b"migration stream").await.unwrap();
        src_peer.shutdown().await.unwrap();

        let report = task.await.unwrap();
        assert!(matches!(report.outcome, ForwardOutcome::Eof));
        assert_eq!(report.sample.total_bytes(), 16);
        assert_eq!(session.bytes(Direction::Upstream), 16);

        drop(report);
        let mut received = Vec::new();
        dst_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"migration stream");
    }

    #[tokio::test]
    async fn test_cancel_stops_idle_loop() {
        let (_src_peer, src) = UnixStream::pair().unwrap();
        let (dst, _dst_peer) = UnixStream::pair().unwrap();
        let (reader, _src_writer) = Endpoint::Unix(src).split(8192);
        let (_dst_reader, writer) = Endpoint::Unix(dst).split(8192);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward(
            Direction::Downstream,
            reader,
            writer,
            context(cancel.clone()),
        ));

        cancel.cancel();
        let report = task.await.unwrap();
        assert!(matches!(report.outcome, ForwardOutcome::Cancelled));
        assert_eq!(report.sample.chunk_count(), 0);
    }
}
