//! Line-oriented key exchange.
//!
//! Used when the overlay does not surface the peer's log identity itself.
//! Each side writes one JSON frame terminated by a newline:
//!
//! ```text
//! {"type":"identity","identity":"<64 hex chars>","logName":"vault"}
//! ```
//!
//! and reads lines until it sees a valid frame from the peer. Lines that do
//! not parse, carry an unknown `type`, name another log or exceed
//! [`MAX_LINE_LEN`] are dropped without closing the connection. The exchange
//! is one-shot: after the first valid frame the stream belongs to
//! replication.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use peervault_core::LogIdentity;

use crate::error::{Result, SyncError};

/// Longest line accepted as a frame, newline excluded.
pub const MAX_LINE_LEN: usize = 4096;

/// A key exchange frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HandshakeFrame {
    /// "My log is `identity`, and it is my `log_name` log."
    #[serde(rename = "identity", rename_all = "camelCase")]
    Identity { identity: String, log_name: String },

    /// Any other `type`.
    #[serde(other)]
    Unrecognized,
}

/// Where one connection's exchange stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    AwaitingHandshake,
    IdentityLearned(LogIdentity),
    Replicating(LogIdentity),
    /// The peer announced our own identity.
    Ignored,
}

/// Result of reading the peer's announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The peer owns this log.
    Peer(LogIdentity),
    /// The peer announced our own identity.
    SelfConnection,
    /// The stream ended before a valid frame arrived.
    Closed,
}

/// Per-connection key exchange state machine.
#[derive(Debug, Clone)]
pub struct KeyExchange {
    local: LogIdentity,
    log_name: String,
    state: ExchangeState,
}

impl KeyExchange {
    pub fn new(local: LogIdentity, log_name: impl Into<String>) -> Self {
        Self {
            local,
            log_name: log_name.into(),
            state: ExchangeState::AwaitingHandshake,
        }
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// The newline-terminated frame announcing the local identity.
    pub fn announcement(&self) -> Result<Vec<u8>> {
        let frame = HandshakeFrame::Identity {
            identity: self.local.to_hex(),
            log_name: self.log_name.clone(),
        };
        let mut line =
            serde_json::to_vec(&frame).map_err(|e| SyncError::Handshake(e.to_string()))?;
        line.push(b'\n');
        Ok(line)
    }

    /// Feed one complete line (without the newline).
    ///
    /// Returns an outcome for the first valid frame and `None` for anything
    /// dropped, including every line after the first valid one.
    pub fn receive_line(&mut self, line: &[u8]) -> Option<HandshakeOutcome> {
        if self.state != ExchangeState::AwaitingHandshake {
            return None;
        }

        let (identity, log_name) = match serde_json::from_slice::<HandshakeFrame>(line) {
            Ok(HandshakeFrame::Identity { identity, log_name }) => (identity, log_name),
            Ok(HandshakeFrame::Unrecognized) => {
                tracing::debug!("dropping unrecognized handshake frame");
                return None;
            }
            Err(e) => {
                tracing::debug!(error = %e, "dropping malformed handshake line");
                return None;
            }
        };

        if log_name != self.log_name {
            tracing::debug!(log_name = %log_name, "dropping handshake for another log");
            return None;
        }

        let identity = match LogIdentity::from_hex(&identity) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "dropping handshake with invalid identity");
                return None;
            }
        };

        if identity == self.local {
            self.state = ExchangeState::Ignored;
            Some(HandshakeOutcome::SelfConnection)
        } else {
            self.state = ExchangeState::IdentityLearned(identity);
            Some(HandshakeOutcome::Peer(identity))
        }
    }

    /// Hand the stream to replication. Returns the peer identity if one was
    /// learned.
    pub fn begin_replication(&mut self) -> Option<LogIdentity> {
        match self.state {
            ExchangeState::IdentityLearned(identity) => {
                self.state = ExchangeState::Replicating(identity);
                Some(identity)
            }
            _ => None,
        }
    }
}

/// Run the exchange on `stream`: announce, then read lines until the peer's
/// frame arrives or the stream ends.
///
/// Bytes after the peer's frame stay buffered in `stream` for replication.
pub async fn exchange<S>(stream: &mut BufReader<S>, state: &mut KeyExchange) -> Result<HandshakeOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let announcement = state.announcement()?;
    stream.get_mut().write_all(&announcement).await?;
    stream.get_mut().flush().await?;

    let mut line = Vec::new();
    let mut overlong = false;

    loop {
        let (consumed, complete) = {
            let available = stream.fill_buf().await?;
            if available.is_empty() {
                return Ok(HandshakeOutcome::Closed);
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(end) => {
                    if !overlong {
                        line.extend_from_slice(&available[..end]);
                    }
                    (end + 1, true)
                }
                None => {
                    if !overlong {
                        line.extend_from_slice(available);
                    }
                    (available.len(), false)
                }
            }
        };
        stream.consume(consumed);

        if line.len() > MAX_LINE_LEN {
            overlong = true;
            line.clear();
        }

        if complete {
            if overlong {
                tracing::debug!("dropping overlong handshake line");
            } else if let Some(outcome) = state.receive_line(&line) {
                return Ok(outcome);
            }
            overlong = false;
            line.clear();
        }
    }
}
