//! Line-fed broadcast producer.
//!
//! The producer is a single long-lived task that reads the input stream one
//! line at a time and fans each line out to every registered connection.
//!
//! # Broadcast Round
//!
//! For each line the producer:
//!
//! 1. wraps the text in an [`Envelope`] stamped with the current time,
//! 2. serializes it once,
//! 3. takes a [`snapshot`](ConnectionRegistry::snapshot) of the registry,
//! 4. emits the serialized envelope under [`EVENT_BROADCAST`] to each entry.
//!
//! A failed send is logged and counted; it never stops delivery to the
//! remaining connections. No lock is held while sending.
//!
//! # Termination
//!
//! The task ends at end of stream or on the first read error and is never
//! restarted. The returned [`ProducerExit`] tells the caller which happened.
//! A line longer than [`MAX_LINE_LENGTH`] bytes or one that is not valid
//! UTF-8 counts as a read error.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use pipecast_server::broadcast::{BroadcastProducer, ProducerExit};
//! use pipecast_server::registry::{ChannelHandle, ConnectionEntry, ConnectionRegistry};
//!
//! # tokio_test::block_on(async {
//! let registry = Arc::new(ConnectionRegistry::new());
//! let (handle, mut rx) = ChannelHandle::channel();
//! registry.insert(ConnectionEntry::new("conn-1", Arc::new(handle)));
//!
//! let producer = BroadcastProducer::new(Arc::clone(&registry));
//! let exit = producer.run(&b"hello\n"[..]).await;
//!
//! assert!(matches!(exit, ProducerExit::EndOfStream { lines: 1 }));
//! assert!(rx.try_recv().unwrap().data_text().contains("\"message\":\"hello\""));
//! # });
//! ```

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::registry::ConnectionRegistry;
use crate::types::{Envelope, EVENT_BROADCAST};

/// Longest accepted input line in bytes, excluding the terminator.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Outcome of one broadcast round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections in the snapshot.
    pub attempted: usize,
    /// Sends that were accepted by the connection handle.
    pub delivered: usize,
    /// Sends that failed.
    pub failed: usize,
}

/// Why the producer stopped.
#[derive(Debug)]
pub enum ProducerExit {
    /// The input stream was closed.
    EndOfStream {
        /// Lines broadcast before the stream ended.
        lines: u64,
    },
    /// Reading the input stream failed.
    ReadError {
        /// Lines broadcast before the failure.
        lines: u64,
        /// The read error.
        error: io::Error,
    },
}

impl ProducerExit {
    /// Returns the number of lines broadcast before the producer stopped.
    pub fn lines(&self) -> u64 {
        match self {
            Self::EndOfStream { lines } | Self::ReadError { lines, .. } => *lines,
        }
    }
}

/// Turns input lines into broadcast rounds over a shared registry.
#[derive(Debug, Clone)]
pub struct BroadcastProducer {
    registry: Arc<ConnectionRegistry>,
}

impl BroadcastProducer {
    /// Creates a producer that delivers to the connections in `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Reads `reader` to completion, broadcasting every line.
    pub async fn run<R>(&self, mut reader: R) -> ProducerExit
    where
        R: AsyncBufRead + Unpin,
    {
        let mut count: u64 = 0;

        loop {
            match next_line(&mut reader).await {
                Ok(Some(line)) => {
                    count += 1;
                    debug!(line = %line, "Input line received");
                    self.broadcast_line(&line);
                }
                Ok(None) => {
                    info!(lines = count, "Input stream closed, producer stopping");
                    return ProducerExit::EndOfStream { lines: count };
                }
                Err(err) => {
                    error!(lines = count, error = %err, "Could not read input stream, producer stopping");
                    return ProducerExit::ReadError {
                        lines: count,
                        error: err,
                    };
                }
            }
        }
    }

    /// Runs the producer on its own task.
    pub fn spawn<R>(self, reader: R) -> JoinHandle<ProducerExit>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        tokio::spawn(async move { self.run(reader).await })
    }

    /// Broadcasts `line` stamped with the current time.
    pub fn broadcast_line(&self, line: &str) -> BroadcastReport {
        self.broadcast(&Envelope::new(line))
    }

    /// Sends `envelope` to every connection in a fresh registry snapshot.
    pub fn broadcast(&self, envelope: &Envelope) -> BroadcastReport {
        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "Failed to serialize envelope");
                return BroadcastReport::default();
            }
        };

        let targets = self.registry.snapshot();
        let mut report = BroadcastReport {
            attempted: targets.len(),
            ..BroadcastReport::default()
        };

        for entry in &targets {
            match entry.emit(EVENT_BROADCAST, &payload) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    report.failed += 1;
                    debug!(connection_id = %entry.id, error = %err, "Failed to send envelope");
                }
            }
        }

        trace!(
            attempted = report.attempted,
            delivered = report.delivered,
            failed = report.failed,
            "Broadcast round complete"
        );
        report
    }
}

/// Reads one line without its `\n` or `\r\n` terminator.
///
/// At most `MAX_LINE_LENGTH + 1` bytes are buffered per call, so input that
/// never sends a newline cannot grow memory without bound.
async fn next_line<R>(reader: &mut R) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = MAX_LINE_LENGTH as u64 + 1;
    if (&mut *reader).take(limit).read_until(b'\n', &mut buf).await? == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if buf.len() > MAX_LINE_LENGTH {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("input line exceeds {MAX_LINE_LENGTH} bytes"),
        ));
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}
