//! SQLite implementation of the log store.
//!
//! This is the durable backend. It uses rusqlite with bundled SQLite, wrapped
//! in async via `tokio::task::spawn_blocking`. Every handle opened from one
//! store shares the same connection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::broadcast;

use peervault_core::{
    materialize, Ed25519Signature, IdentitySeed, Keypair, LogEntry, LogIdentity, LogOp, Timestamp,
};

use crate::error::{Result, StoreError};
use crate::memory::EVENT_CAPACITY;
use crate::migration;
use crate::traits::{admit_entries, AppendEvent, LogHandle, LogStore, SharedLog};

const OP_PUT: i64 = 0;
const OP_DELETE: i64 = 1;

/// SQLite-based log store.
///
/// Thread-safe via internal Mutex. All queries run under spawn_blocking.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,

    /// One append channel per log, shared by every handle on it.
    notifiers: tokio::sync::Mutex<HashMap<LogIdentity, broadcast::Sender<AppendEvent>>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            notifiers: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn notifier(&self, identity: LogIdentity) -> broadcast::Sender<AppendEvent> {
        self.notifiers
            .lock()
            .await
            .entry(identity)
            .or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0)
            .clone()
    }

    async fn open_handle(
        &self,
        identity: LogIdentity,
        keypair: Option<Keypair>,
    ) -> Result<SharedLog> {
        blocking(&self.conn, move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO logs (identity, created_at) VALUES (?1, ?2)",
                params![identity.as_bytes().as_slice(), Timestamp::now().as_millis()],
            )?;
            Ok(())
        })
        .await?;

        Ok(Arc::new(SqliteLog {
            identity,
            keypair,
            conn: self.conn.clone(),
            events: self.notifier(identity).await,
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl LogStore for SqliteStore {
    async fn open_local(&self, name: &str, seed: &IdentitySeed) -> Result<SharedLog> {
        let name = name.to_string();
        let nonce = blocking(&self.conn, move |conn| {
            let stored: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT device_nonce FROM local_logs WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?;

            match stored {
                Some(bytes) => <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| {
                    StoreError::InvalidData(format!("device nonce for {name} is not 32 bytes"))
                }),
                None => {
                    use rand::Rng;
                    let nonce: [u8; 32] = rand::thread_rng().gen();
                    conn.execute(
                        "INSERT INTO local_logs (name, device_nonce, created_at) VALUES (?1, ?2, ?3)",
                        params![name, nonce.as_slice(), Timestamp::now().as_millis()],
                    )?;
                    tracing::debug!(name = %name, "created local log");
                    Ok(nonce)
                }
            }
        })
        .await?;

        let keypair = Keypair::derive_device_log(seed, &nonce);
        self.open_handle(keypair.identity(), Some(keypair)).await
    }

    async fn open_remote(&self, identity: LogIdentity) -> Result<SharedLog> {
        self.open_handle(identity, None).await
    }
}

/// Handle on a log stored in SQLite.
pub struct SqliteLog {
    identity: LogIdentity,
    keypair: Option<Keypair>,
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<AppendEvent>,
    closed: AtomicBool,
}

impl SqliteLog {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed(self.identity))
        } else {
            Ok(())
        }
    }

    async fn write(&self, op: LogOp) -> Result<u64> {
        self.ensure_open()?;
        let keypair = self
            .keypair
            .clone()
            .ok_or(StoreError::NotWritable(self.identity))?;
        let identity = self.identity;

        let seq = blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let seq = count_entries(&tx, &identity)?;
            insert_entry(&tx, &identity, &LogEntry::sign(&keypair, seq, op))?;
            tx.commit()?;
            Ok(seq)
        })
        .await?;

        let _ = self.events.send(AppendEvent {
            log: self.identity,
            length: seq + 1,
        });
        Ok(seq)
    }

    async fn load_entries(&self, from: u64) -> Result<Vec<LogEntry>> {
        self.ensure_open()?;
        let identity = self.identity;

        blocking(&self.conn, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, op, key, value, signature FROM entries
                 WHERE identity = ?1 AND seq >= ?2 ORDER BY seq",
            )?;

            let rows = stmt
                .query_map(params![identity.as_bytes().as_slice(), from as i64], |row| {
                    Ok(EntryRow {
                        seq: row.get(0)?,
                        op: row.get(1)?,
                        key: row.get(2)?,
                        value: row.get(3)?,
                        signature: row.get(4)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            rows.into_iter().map(EntryRow::into_entry).collect()
        })
        .await
    }
}

#[async_trait]
impl LogHandle for SqliteLog {
    fn identity(&self) -> LogIdentity {
        self.identity
    }

    fn is_writable(&self) -> bool {
        self.keypair.is_some()
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
        let entries = self.load_entries(0).await?;
        Ok(materialize(&entries).into_iter().collect())
    }

    async fn len(&self) -> Result<u64> {
        self.ensure_open()?;
        let identity = self.identity;
        blocking(&self.conn, move |conn| count_entries(conn, &identity)).await
    }

    async fn entries_since(&self, from: u64) -> Result<Vec<LogEntry>> {
        self.load_entries(from).await
    }

    async fn ingest(&self, batch: Vec<LogEntry>) -> Result<usize> {
        self.ensure_open()?;
        let identity = self.identity;

        let (added, length) = blocking(&self.conn, move |conn| {
            let tx = conn.transaction()?;
            let length = count_entries(&tx, &identity)?;
            let fresh = admit_entries(&identity, length, batch)?;
            for entry in &fresh {
                insert_entry(&tx, &identity, entry)?;
            }
            tx.commit()?;
            Ok((fresh.len(), length + fresh.len() as u64))
        })
        .await?;

        if added > 0 {
            let _ = self.events.send(AppendEvent {
                log: self.identity,
                length,
            });
        }
        Ok(added)
    }

    fn subscribe(&self) -> broadcast::Receiver<AppendEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Run `f` against the connection on the blocking pool.
async fn blocking<F, T>(conn: &Arc<Mutex<Connection>>, f: F) -> Result<T>
where
    F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || {
        let mut guard = conn
            .lock()
            .map_err(|e| StoreError::Task(format!("connection mutex poisoned: {e}")))?;
        f(&mut guard)
    })
    .await
    .map_err(|e| StoreError::Task(format!("spawn_blocking failed: {e}")))?
}

fn count_entries(conn: &Connection, identity: &LogIdentity) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM entries WHERE identity = ?1",
        params![identity.as_bytes().as_slice()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

fn insert_entry(tx: &Transaction<'_>, identity: &LogIdentity, entry: &LogEntry) -> Result<()> {
    let (op, key, value): (i64, &str, &[u8]) = match &entry.op {
        LogOp::Put { key, value } => (OP_PUT, key.as_str(), &value[..]),
        LogOp::Delete { key } => (OP_DELETE, key.as_str(), &[][..]),
    };

    tx.execute(
        "INSERT INTO entries (identity, seq, op, key, value, signature)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            identity.as_bytes().as_slice(),
            entry.seq as i64,
            op,
            key,
            value,
            entry.signature.as_bytes().as_slice(),
        ],
    )?;
    Ok(())
}

struct EntryRow {
    seq: i64,
    op: i64,
    key: String,
    value: Vec<u8>,
    signature: Vec<u8>,
}

impl EntryRow {
    fn into_entry(self) -> Result<LogEntry> {
        let op = match self.op {
            OP_PUT => LogOp::Put {
                key: self.key,
                value: Bytes::from(self.value),
            },
            OP_DELETE => LogOp::Delete { key: self.key },
            other => {
                return Err(StoreError::InvalidData(format!(
                    "unknown op {other} at seq {}",
                    self.seq
                )))
            }
        };

        Ok(LogEntry {
            seq: self.seq as u64,
            op,
            signature: Ed25519Signature::try_from(self.signature.as_slice())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed() -> IdentitySeed {
        IdentitySeed::from_bytes([0x22; 32])
    }

    #[tokio::test]
    async fn test_sqlite_append_and_scan() {
        let store = SqliteStore::open_memory().unwrap();
        let log = store.open_local("vault", &seed()).await.unwrap();

        log.append("b", b"2").await.unwrap();
        log.append("a", b"1").await.unwrap();
        log.delete("b").await.unwrap();

        let scanned = log.scan().await.unwrap();
        assert_eq!(scanned.len(), 1);
        assert_eq!(scanned[0].0, "a");
        assert_eq!(log.len().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reopen_from_disk_keeps_identity_and_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vault.db");

        let identity = {
            let store = SqliteStore::open(&path).unwrap();
            let log = store.open_local("vault", &seed()).await.unwrap();
            log.append("a", b"1").await.unwrap();
            log.identity()
        };

        let store = SqliteStore::open(&path).unwrap();
        let log = store.open_local("vault", &seed()).await.unwrap();
        assert_eq!(log.identity(), identity);
        assert_eq!(log.len().await.unwrap(), 1);

        let seq = log.append("b", b"2").await.unwrap();
        assert_eq!(seq, 1);
        for entry in log.entries_since(0).await.unwrap() {
            entry.verify(&identity).unwrap();
        }
    }

    #[tokio::test]
    async fn test_replica_ingest_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replica.db");

        let owner = SqliteStore::open_memory()
            .unwrap()
            .open_local("vault", &seed())
            .await
            .unwrap();
        owner.append("a", b"1").await.unwrap();
        owner.append("b", b"2").await.unwrap();

        {
            let store = SqliteStore::open(&path).unwrap();
            let replica = store.open_remote(owner.identity()).await.unwrap();
            assert!(!replica.is_writable());

            let added = replica
                .ingest(owner.entries_since(0).await.unwrap())
                .await
                .unwrap();
            assert_eq!(added, 2);
        }

        let store = SqliteStore::open(&path).unwrap();
        let replica = store.open_remote(owner.identity()).await.unwrap();
        assert_eq!(replica.scan().await.unwrap().len(), 2);
        assert_eq!(replica.entries_since(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ingest_rejects_forged_entries() {
        let store = SqliteStore::open_memory().unwrap();
        let owner = Keypair::generate();
        let forger = Keypair::generate();
        let replica = store.open_remote(owner.identity()).await.unwrap();

        let forged = LogEntry::sign(
            &forger,
            0,
            LogOp::Put {
                key: "a".into(),
                value: Bytes::from_static(b"x"),
            },
        );
        assert!(replica.ingest(vec![forged]).await.is_err());
        assert_eq!(replica.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_handles_share_notifications() {
        let store = SqliteStore::open_memory().unwrap();
        let writer = store.open_local("vault", &seed()).await.unwrap();
        let reader = store.open_remote(writer.identity()).await.unwrap();
        let mut events = reader.subscribe();

        writer.append("a", b"1").await.unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event.log, writer.identity());
        assert_eq!(event.length, 1);
    }
}
