//! End-to-end replication between vaults on an in-memory overlay.
//!
//! Most tests drive full vaults through the testkit. The rest attach a raw
//! peer (a bare log plus key exchange and `replicate`) to feed a vault data
//! no well-behaved device would write.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use peervault::core::{
    IdentitySeed, LogIdentity, Record, RecordChanges, RecordId, StoredValue, Timestamp, Topic,
};
use peervault::store::replicate::write_frame;
use peervault::store::{
    replicate, LogStore, MemoryStore, ReplicationReport, SharedLog, SqliteStore, WireMessage,
};
use peervault::sync::overlay::memory::MemoryNetwork;
use peervault::sync::{exchange, AsyncStream, JoinOptions, KeyExchange, Overlay};
use peervault::{DeletePolicy, VaultState};
use peervault_testkit::{test_config, wait_for, wait_for_peers, TestNetwork};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn record_in(view: &peervault::MergedView, id: &RecordId) -> Option<Record> {
    view.get(id).cloned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Raw peers
// ─────────────────────────────────────────────────────────────────────────────

/// A device built from parts: a log of its own on `seed`, no vault.
struct RawPeer {
    store: MemoryStore,
    log: SharedLog,
    network: Arc<MemoryNetwork>,
    topic: Topic,
}

/// One raw connection running replication until stopped.
struct RawSession {
    stop: watch::Sender<bool>,
    task: JoinHandle<anyhow::Result<ReplicationReport>>,
}

impl RawSession {
    async fn close(self) -> anyhow::Result<ReplicationReport> {
        let _ = self.stop.send(true);
        tokio::time::timeout(Duration::from_secs(5), self.task).await??
    }
}

/// A connection past the key exchange, written by hand.
struct RawLink {
    stream: BufReader<Box<dyn AsyncStream>>,
}

impl RawLink {
    /// A frame whose body is not CBOR.
    async fn send_garbage(&mut self) -> anyhow::Result<()> {
        self.stream.write_u32(4).await?;
        self.stream.write_all(&[0xff; 4]).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Close our side and wait until the vault has closed its side too.
    async fn hang_up(mut self) -> anyhow::Result<()> {
        self.stream.shutdown().await?;
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), self.stream.read_to_end(&mut rest)).await??;
        Ok(())
    }
}

impl RawPeer {
    async fn new(network: Arc<MemoryNetwork>, seed: &IdentitySeed) -> anyhow::Result<Self> {
        let store = MemoryStore::new();
        let log = store.open_local("vault", seed).await?;
        Ok(Self {
            store,
            log,
            network,
            topic: Topic::derive(seed),
        })
    }

    /// Dial the first member on the topic and exchange identities.
    ///
    /// Raw peers only dial, so they never connect to each other.
    async fn handshake(&self) -> anyhow::Result<(BufReader<Box<dyn AsyncStream>>, LogIdentity)> {
        let swarm = self.network.swarm();
        let options = JoinOptions {
            server: false,
            ..JoinOptions::default()
        };
        let mut connections = swarm.join(self.topic, options).await?;
        let connection = connections.recv().await.context("no member on the topic")?;
        drop(connections);

        let mut stream = BufReader::new(connection.stream);
        let mut kx = KeyExchange::new(self.log.identity(), "vault");
        let outcome =
            tokio::time::timeout(Duration::from_secs(5), exchange(&mut stream, &mut kx)).await??;
        let peer = kx
            .begin_replication()
            .with_context(|| format!("no peer identity, got {outcome:?}"))?;
        Ok((stream, peer))
    }

    /// Replicate with the first member on the topic until closed.
    async fn connect(&self) -> anyhow::Result<RawSession> {
        let (stream, peer) = self.handshake().await?;
        let remote = self.store.open_remote(peer).await?;

        let (stop, mut stopped) = watch::channel(false);
        let local = self.log.clone();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = stopped.wait_for(|s| *s).await;
            };
            replicate(stream, local, remote, shutdown)
                .await
                .map_err(anyhow::Error::from)
        });
        Ok(RawSession { stop, task })
    }

    /// Push the whole log to the first member on the topic in one frame and
    /// hand back the connection for scripting.
    async fn attach(&self) -> anyhow::Result<RawLink> {
        let (mut stream, _) = self.handshake().await?;
        let entries = WireMessage::Entries {
            log: self.log.identity(),
            entries: self.log.entries_since(0).await?,
        };
        write_frame(&mut stream, &entries).await?;
        Ok(RawLink { stream })
    }

    /// Append `record` to the raw log.
    async fn write(&self, record: &Record) -> anyhow::Result<()> {
        let bytes = StoredValue::Record(record.clone()).to_bytes()?;
        self.log.append(&record.id.to_key(), &bytes).await?;
        Ok(())
    }
}

fn record(title: &str, millis: i64) -> Record {
    Record::new(
        RecordId::generate(),
        title,
        "user",
        "p1",
        Timestamp::from_millis(millis),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Vault behavior
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_local_write_is_visible_without_peers() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let a = net.device().await?;

    let id = a.vault.create("bank", "alice", "p1").await?;
    let view = a.vault.view().await?;
    let record = record_in(&view, &id).context("record missing")?;
    assert_eq!(
        (record.title.as_str(), record.username.as_str(), record.secret.as_str()),
        ("bank", "alice", "p1")
    );
    Ok(())
}

#[tokio::test]
async fn test_later_update_wins_on_both_devices() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let a = net.device().await?;
    let b = net.device().await?;

    let id = a.at(10).vault.create("bank", "alice", "p1").await?;
    wait_for(&b.vault, |view| view.contains(&id))
        .await
        .context("record never reached B")?;

    let updated = b
        .at(20)
        .vault
        .update(id, RecordChanges::default().secret("p2"))
        .await?;
    assert_eq!(updated.updated_at.as_millis(), 20);

    let on_a = wait_for(&a.vault, |view| {
        view.get(&id).map(|r| r.secret.as_str()) == Some("p2")
    })
    .await
    .context("update never reached A")?;
    let on_b = b.vault.view().await?;

    assert_eq!(record_in(&on_a, &id), Some(updated.clone()));
    assert_eq!(record_in(&on_b, &id), Some(updated));
    assert_eq!(on_a.digest(), on_b.digest());
    Ok(())
}

#[tokio::test]
async fn test_offline_creates_keep_distinct_ids() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let a = net.device().await?;

    // B starts on an unrelated network, so it cannot see A yet.
    let offline = TestNetwork {
        network: MemoryNetwork::new(),
        seed: net.seed.clone(),
    };
    let b = offline.device().await?;

    let from_a = a.vault.create("bank", "alice", "p1").await?;
    let from_b = b.vault.create("bank", "alice", "p1").await?;
    assert_ne!(from_a, from_b);

    let store = b.store.clone();
    b.vault.shutdown().await?;
    let b = net.device_on(store, test_config()).await?;

    for vault in [&a.vault, &b.vault] {
        let view = wait_for(vault, |view| view.contains(&from_a) && view.contains(&from_b))
            .await
            .context("devices never converged")?;
        assert_eq!(view.len(), 2);
    }
    Ok(())
}

#[tokio::test]
async fn test_peer_records_leave_with_the_peer() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let a = net.device().await?;
    let b = net.device().await?;

    let id = b.vault.create("mail", "bob", "p1").await?;
    wait_for(&a.vault, |view| view.contains(&id))
        .await
        .context("record never reached A")?;

    b.vault.shutdown().await?;
    assert_eq!(b.vault.state(), VaultState::Closed);

    wait_for(&a.vault, |view| !view.contains(&id))
        .await
        .context("record outlived its peer")?;
    assert!(a.vault.peers().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_tombstone_delete_reaches_peers() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let a = net.device().await?;
    let b = net.device().await?;

    let id = a.at(10).vault.create("bank", "alice", "p1").await?;
    wait_for(&b.vault, |view| view.contains(&id))
        .await
        .context("record never reached B")?;
    b.at(20)
        .vault
        .update(id, RecordChanges::default().title("bank (old)"))
        .await?;
    wait_for(&a.vault, |view| view.get(&id).map(|r| r.updated_at.as_millis()) == Some(20))
        .await
        .context("update never reached A")?;

    a.at(30).vault.delete(id).await?;
    assert!(a.vault.get(&id).await?.is_none());
    wait_for(&b.vault, |view| !view.contains(&id))
        .await
        .context("tombstone never reached B")?;
    Ok(())
}

#[tokio::test]
async fn test_lossy_delete_lets_peer_copy_reappear() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let config = test_config().with_delete_policy(DeletePolicy::Lossy);
    let a = net.device_with(config.clone()).await?;
    let b = net.device_with(config).await?;

    let id = a.at(10).vault.create("bank", "alice", "p1").await?;
    wait_for(&b.vault, |view| view.contains(&id))
        .await
        .context("record never reached B")?;
    b.at(20)
        .vault
        .update(id, RecordChanges::default().secret("p2"))
        .await?;
    wait_for(&a.vault, |view| view.get(&id).map(|r| r.updated_at.as_millis()) == Some(20))
        .await
        .context("update never reached A")?;

    // Only A's own copy goes; B's log still holds the record.
    a.at(30).vault.delete(id).await?;
    let record = a.vault.get(&id).await?.context("peer copy should reappear")?;
    assert_eq!(record.secret, "p2");
    Ok(())
}

#[tokio::test]
async fn test_sqlite_device_restarts_with_same_log() -> anyhow::Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("vault.db");
    let net = TestNetwork::new();

    let first = net
        .device_on(Arc::new(SqliteStore::open(&path)?), test_config())
        .await?;
    let id = first.vault.create("bank", "alice", "p1").await?;
    let identity = first.vault.identity().await?;
    first.vault.shutdown().await?;

    let second = net
        .device_on(Arc::new(SqliteStore::open(&path)?), test_config())
        .await?;
    assert_eq!(second.vault.identity().await?, identity);
    assert!(second.vault.get(&id).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_overlay_log_discovery_skips_key_exchange() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::with_log_discovery();
    let a = net.device().await?;
    let b = net.device().await?;

    let id = a.vault.create("bank", "alice", "p1").await?;
    wait_for(&b.vault, |view| view.contains(&id))
        .await
        .context("record never reached B")?;
    assert_eq!(b.vault.peers().await?, vec![a.vault.identity().await?]);
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Raw peer scenarios
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_malformed_entry_is_skipped() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let a = net.device().await?;
    let raw = RawPeer::new(net.network.clone(), &net.seed).await?;

    let good = record("mail", 5);
    raw.log.append("not-a-record", b"{ definitely not json").await?;
    raw.write(&good).await?;

    let session = raw.connect().await?;
    let view = wait_for(&a.vault, |view| view.contains(&good.id))
        .await
        .context("valid record never arrived")?;
    assert_eq!(view.len(), 1);
    assert_eq!(record_in(&view, &good.id), Some(good));

    session.close().await?;
    Ok(())
}

#[tokio::test]
async fn test_own_identity_is_never_a_peer() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let a = net.device().await?;
    let own = a.vault.identity().await?;

    let swarm = net.network.swarm();
    let mut connections = swarm
        .join(a.vault.topic().await?, JoinOptions::default())
        .await?;
    let mut connection = connections.recv().await.context("vault not on topic")?;

    let line = KeyExchange::new(own, "vault").announcement()?;
    connection.stream.write_all(&line).await?;

    // The vault announces itself, then drops the connection.
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), connection.stream.read_to_end(&mut received))
        .await??;
    assert!(received.ends_with(b"\n"));

    a.vault.refresh().await?;
    assert!(a.vault.peers().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_second_connection_keeps_peer_visible() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let a = net.device().await?;
    let raw = RawPeer::new(net.network.clone(), &net.seed).await?;
    let peer = raw.log.identity();

    let first = record("wifi", 5);
    raw.write(&first).await?;

    let link = raw.attach().await?;
    let session = raw.connect().await?;
    wait_for(&a.vault, |view| view.contains(&first.id))
        .await
        .context("record never arrived")?;
    assert!(wait_for_peers(&a.vault, 1).await);

    link.hang_up().await?;

    // Only the live connection can carry this one.
    let second = record("router", 6);
    raw.write(&second).await?;
    wait_for(&a.vault, |view| view.contains(&first.id) && view.contains(&second.id))
        .await
        .context("remaining connection stopped replicating")?;
    assert_eq!(a.vault.peers().await?, vec![peer]);

    session.close().await?;
    wait_for(&a.vault, |view| view.is_empty())
        .await
        .context("records outlived the last connection")?;
    assert!(wait_for_peers(&a.vault, 0).await);
    Ok(())
}

#[tokio::test]
async fn test_failed_session_drops_only_its_peer() -> anyhow::Result<()> {
    init_tracing();
    let net = TestNetwork::new();
    let a = net.device().await?;
    let faulty = RawPeer::new(net.network.clone(), &net.seed).await?;
    let steady = RawPeer::new(net.network.clone(), &net.seed).await?;
    assert_ne!(faulty.log.identity(), steady.log.identity());

    let lost = record("mail", 5);
    let kept = record("bank", 6);
    faulty.write(&lost).await?;
    steady.write(&kept).await?;

    let mut link = faulty.attach().await?;
    let session = steady.connect().await?;
    wait_for(&a.vault, |view| view.contains(&lost.id) && view.contains(&kept.id))
        .await
        .context("records never arrived")?;
    assert!(wait_for_peers(&a.vault, 2).await);

    link.send_garbage().await?;
    let view = wait_for(&a.vault, |view| !view.contains(&lost.id))
        .await
        .context("failed peer's records stayed visible")?;
    assert_eq!(record_in(&view, &kept.id), Some(kept.clone()));
    assert!(wait_for_peers(&a.vault, 1).await);
    assert_eq!(a.vault.peers().await?, vec![steady.log.identity()]);
    assert_eq!(a.vault.state(), VaultState::Active);

    session.close().await?;
    Ok(())
}
