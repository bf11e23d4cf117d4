//! In-memory implementation of the log store.
//!
//! Same semantics as SQLite but nothing survives the store being dropped.
//! Handles opened on the same identity share the underlying entries, so a
//! replica closed by one session and reopened by the next keeps what it has.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, Mutex, RwLock};

use peervault_core::{materialize, IdentitySeed, Keypair, LogEntry, LogIdentity, LogOp};

use crate::error::{Result, StoreError};
use crate::traits::{admit_entries, AppendEvent, LogHandle, LogStore, SharedLog};

/// Capacity of each log's append notification channel.
pub(crate) const EVENT_CAPACITY: usize = 256;

/// In-memory log store.
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

struct MemoryStoreInner {
    /// Every log this store knows, local or replica.
    logs: HashMap<LogIdentity, Arc<LogData>>,

    /// Device nonce per local log name.
    local_nonces: HashMap<String, [u8; 32]>,
}

struct LogData {
    identity: LogIdentity,
    keypair: Option<Keypair>,
    entries: RwLock<Vec<LogEntry>>,
    events: broadcast::Sender<AppendEvent>,
}

impl LogData {
    fn new(identity: LogIdentity, keypair: Option<Keypair>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            identity,
            keypair,
            entries: RwLock::new(Vec::new()),
            events,
        })
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryStoreInner {
                logs: HashMap::new(),
                local_nonces: HashMap::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    async fn open_local(&self, name: &str, seed: &IdentitySeed) -> Result<SharedLog> {
        let mut inner = self.inner.lock().await;

        let nonce = *inner.local_nonces.entry(name.to_string()).or_insert_with(|| {
            use rand::Rng;
            rand::thread_rng().gen()
        });
        let keypair = Keypair::derive_device_log(seed, &nonce);
        let identity = keypair.identity();

        let data = inner
            .logs
            .entry(identity)
            .or_insert_with(|| LogData::new(identity, Some(keypair)))
            .clone();

        tracing::debug!(identity = %identity, name, "opened local log");
        Ok(Arc::new(MemoryLog::new(data)))
    }

    async fn open_remote(&self, identity: LogIdentity) -> Result<SharedLog> {
        let mut inner = self.inner.lock().await;
        let data = inner
            .logs
            .entry(identity)
            .or_insert_with(|| LogData::new(identity, None))
            .clone();

        Ok(Arc::new(MemoryLog::new(data)))
    }
}

/// Handle on an in-memory log.
pub struct MemoryLog {
    data: Arc<LogData>,
    closed: AtomicBool,
}

impl MemoryLog {
    fn new(data: Arc<LogData>) -> Self {
        Self {
            data,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed(self.data.identity))
        } else {
            Ok(())
        }
    }

    async fn write(&self, op: LogOp) -> Result<u64> {
        self.ensure_open()?;
        let keypair = self
            .data
            .keypair
            .as_ref()
            .ok_or(StoreError::NotWritable(self.data.identity))?;

        let seq = {
            let mut entries = self.data.entries.write().await;
            let seq = entries.len() as u64;
            entries.push(LogEntry::sign(keypair, seq, op));
            seq
        };

        let _ = self.data.events.send(AppendEvent {
            log: self.data.identity,
            length: seq + 1,
        });
        Ok(seq)
    }
}

#[async_trait]
impl LogHandle for MemoryLog {
    fn identity(&self) -> LogIdentity {
        self.data.identity
    }

    fn is_writable(&self) -> bool {
        self.data.keypair.is_some()
    }

    async fn append(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.write(LogOp::Put {
            key: key.to_string(),
            value: Bytes::copy_from_slice(value),
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.write(LogOp::Delete {
            key: key.to_string(),
        })
        .await
    }

    async fn scan(&self) -> Result<Vec<(String, Bytes)>> {
        self.ensure_open()?;
        let entries = self.data.entries.read().await;
        Ok(materialize(entries.iter()).into_iter().collect())
    }

    async fn len(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.data.entries.read().await.len() as u64)
    }

    async fn entries_since(&self, from: u64) -> Result<Vec<LogEntry>> {
        self.ensure_open()?;
        let entries = self.data.entries.read().await;
        let start = (from as usize).min(entries.len());
        Ok(entries[start..].to_vec())
    }

    async fn ingest(&self, batch: Vec<LogEntry>) -> Result<usize> {
        self.ensure_open()?;
        let (added, length) = {
            let mut entries = self.data.entries.write().await;
            let fresh = admit_entries(&self.data.identity, entries.len() as u64, batch)?;
            let added = fresh.len();
            entries.extend(fresh);
            (added, entries.len() as u64)
        };

        if added > 0 {
            let _ = self.data.events.send(AppendEvent {
                log: self.data.identity,
                length,
            });
        }
        Ok(added)
    }

    fn subscribe(&self) -> broadcast::Receiver<AppendEvent> {
        self.data.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
