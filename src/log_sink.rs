use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::{
    codec::{FramedRead, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};
use tracing::{debug, info};

use crate::{process::OutputReader, ServiceName};

/// Longest captured line; longer lines are discarded.
const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of captured child output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub service: ServiceName,
    pub stream: OutputStream,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// Destination for captured child output. Formatting and storage are up to the implementor.
pub trait LogSink: Send + Sync + 'static {
    fn write(&self, line: LogLine);
}

/// Forwards captured output as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write(&self, line: LogLine) {
        info!(
            target: "service_supervisor::output",
            service = %line.service,
            stream = %line.stream,
            timestamp = %line.timestamp.to_rfc3339(),
            "{}",
            line.line
        );
    }
}

/// Copies `reader` line by line into `sink` until EOF or cancellation.
pub(crate) fn pump(
    service: ServiceName,
    stream: OutputStream,
    reader: OutputReader,
    sink: Arc<dyn LogSink>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = lines.next() => next,
            };
            match next {
                Some(Ok(line)) => sink.write(LogLine {
                    service: service.clone(),
                    stream,
                    timestamp: Utc::now(),
                    line,
                }),
                // Over-long line: the codec already skipped it.
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    debug!(service = %service, %stream, "dropped over-long output line");
                }
                Some(Err(err)) => {
                    debug!(service = %service, %stream, error = %err, "stopped capturing output");
                    break;
                }
                None => break,
            }
        }
    });
}
