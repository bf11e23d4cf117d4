//! Raw replication of one log pair over a byte stream.
//!
//! Each side owns one local log and holds a replica of the peer's log. The
//! wire is a sequence of frames, each a big-endian `u32` length followed by
//! a CBOR-encoded [`WireMessage`]:
//!
//! 1. Each side announces how much of the peer's log it already has
//!    (`Have { log: <peer's log>, length }`).
//! 2. On receiving a `Have` for its own log, a side pushes every entry past
//!    `length` in `Entries` frames and keeps pushing as its log grows.
//! 3. `Entries` for the replica are verified and ingested.
//!
//! Replication ends cleanly on EOF or when the shutdown future resolves.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};

use peervault_core::{LogEntry, LogIdentity};

use crate::error::{Result, StoreError};
use crate::traits::SharedLog;

/// Maximum encoded frame size.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Maximum entries per `Entries` frame.
pub const ENTRIES_PER_FRAME: usize = 64;

/// Frames buffered between the socket tasks and the replication loop.
const FRAME_QUEUE: usize = 16;

/// How long queued frames may take to drain once replication stops.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// One replication frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// The sender holds `length` entries of `log`.
    Have { log: LogIdentity, length: u64 },
    /// Entries of `log`, contiguous and in order.
    Entries {
        log: LogIdentity,
        entries: Vec<LogEntry>,
    },
}

/// Entry counts for one finished replication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicationReport {
    /// Entries of the local log queued for the peer.
    pub sent: u64,
    /// New entries ingested into the replica.
    pub received: u64,
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, message: &WireMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    if buf.len() > MAX_FRAME_LEN {
        return Err(StoreError::Protocol(format!(
            "frame of {} bytes exceeds limit",
            buf.len()
        )));
    }

    writer.write_u32(buf.len() as u32).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<WireMessage>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len > MAX_FRAME_LEN {
        return Err(StoreError::Protocol(format!(
            "frame of {len} bytes exceeds limit"
        )));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let message = ciborium::from_reader(&buf[..])
        .map_err(|e| StoreError::Protocol(format!("malformed frame: {e}")))?;
    Ok(Some(message))
}

/// Replicate `local` to the peer and the peer's log into `remote`.
///
/// Runs until the peer hangs up, `shutdown` resolves, or an error occurs.
/// Neither handle is closed here.
pub async fn replicate<S, F>(
    stream: S,
    local: SharedLog,
    remote: SharedLog,
    shutdown: F,
) -> Result<ReplicationReport>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    F: Future<Output = ()> + Send,
{
    let (read_half, write_half) = tokio::io::split(stream);

    // Reading and writing each get their own task. A half-read frame is
    // never lost to a dropped select branch, and a peer that stops reading
    // while it pushes its own backlog cannot stall ingest on this side.
    let (frame_tx, mut frames) = mpsc::channel(FRAME_QUEUE);
    let reader = tokio::spawn(read_frames(read_half, frame_tx));
    let (outgoing, queued) = mpsc::channel(FRAME_QUEUE);
    let mut writer = tokio::spawn(write_frames(write_half, queued));

    let mut pair = Pair {
        local,
        remote,
        next: None,
        backlog: VecDeque::new(),
        report: ReplicationReport::default(),
    };
    let outcome = pair.run(outgoing, &mut frames, shutdown).await;
    let report = pair.report;
    reader.abort();

    // `run` dropped the sender, so the writer ends once the queue is flushed.
    let written = match tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await {
        Ok(Ok(written)) => written,
        Ok(Err(e)) => Err(StoreError::Task(e.to_string())),
        Err(_) => {
            writer.abort();
            tracing::debug!("peer stopped reading, dropping queued frames");
            Ok(())
        }
    };

    outcome?;
    written?;
    Ok(report)
}

async fn read_frames<R>(mut reader: R, frames: mpsc::Sender<Result<WireMessage>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(message)) => {
                if frames.send(Ok(message)).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = frames.send(Err(e)).await;
                break;
            }
        }
    }
}

async fn write_frames<W>(mut writer: W, mut queued: mpsc::Receiver<WireMessage>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = queued.recv().await {
        write_frame(&mut writer, &message).await?;
    }
    let _ = writer.shutdown().await;
    Ok(())
}

struct Pair {
    local: SharedLog,
    remote: SharedLog,
    /// Index of the first local entry not yet queued, once the peer has
    /// announced what it holds.
    next: Option<u64>,
    /// Local entries read but not yet queued for the writer.
    backlog: VecDeque<LogEntry>,
    report: ReplicationReport,
}

impl Pair {
    async fn run<F>(
        &mut self,
        outgoing: mpsc::Sender<WireMessage>,
        frames: &mut mpsc::Receiver<Result<WireMessage>>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut local_events = self.local.subscribe();
        let mut events_open = true;

        let have = WireMessage::Have {
            log: self.remote.identity(),
            length: self.remote.len().await?,
        };
        if outgoing.send(have).await.is_err() {
            return Ok(());
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => return Ok(()),

                frame = frames.recv() => match frame {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(message)) => self.handle(message).await?,
                },

                // One chunk per turn, so incoming frames keep flowing.
                permit = outgoing.reserve(), if !self.backlog.is_empty() => match permit {
                    Ok(permit) => permit.send(self.next_chunk()),
                    Err(_) => return Ok(()),
                },

                event = local_events.recv(), if events_open && self.next.is_some() => {
                    match event {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => self.refill().await?,
                        Err(broadcast::error::RecvError::Closed) => events_open = false,
                    }
                }
            }
        }
    }

    async fn handle(&mut self, message: WireMessage) -> Result<()> {
        match message {
            WireMessage::Have { log, length } => {
                if log != self.local.identity() {
                    return Err(StoreError::Protocol(format!(
                        "peer asked for log {log}, which this side does not own"
                    )));
                }
                self.next = Some(length);
                self.backlog.clear();
                self.refill().await
            }
            WireMessage::Entries { log, entries } => {
                if log != self.remote.identity() {
                    return Err(StoreError::Protocol(format!(
                        "peer sent entries for unexpected log {log}"
                    )));
                }
                let added = self.remote.ingest(entries).await?;
                self.report.received += added as u64;
                Ok(())
            }
        }
    }

    /// Read every local entry past the backlog into it.
    async fn refill(&mut self) -> Result<()> {
        let Some(next) = self.next else {
            return Ok(());
        };
        let from = next + self.backlog.len() as u64;
        let entries = self.local.entries_since(from).await?;
        if !entries.is_empty() {
            tracing::trace!(log = %self.local.identity(), from, count = entries.len(), "queued entries");
        }
        self.backlog.extend(entries);
        Ok(())
    }

    /// Take the next frame's worth of entries off the backlog.
    fn next_chunk(&mut self) -> WireMessage {
        let take = self.backlog.len().min(ENTRIES_PER_FRAME);
        let entries: Vec<LogEntry> = self.backlog.drain(..take).collect();
        let sent = entries.len() as u64;
        self.next = self.next.map(|next| next + sent);
        self.report.sent += sent;
        WireMessage::Entries {
            log: self.local.identity(),
            entries,
        }
    }
}
