//! Overlay network abstraction.
//!
//! The overlay finds other devices on a topic and hands back one duplex byte
//! stream per peer connection. Implementations may use a DHT, mDNS, a relay
//! or anything else; the sync engine only needs [`Overlay`].

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use peervault_core::{LogIdentity, Topic};

use crate::error::Result;

/// A duplex byte stream usable as a peer connection.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// One peer connection delivered by the overlay.
pub struct Connection {
    /// The byte stream to the peer.
    pub stream: Box<dyn AsyncStream>,
    /// The peer's log identity, when the overlay discovers it itself.
    /// `None` means the key exchange has to learn it.
    pub remote_log: Option<LogIdentity>,
    /// Whether this side opened the connection.
    pub initiator: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_log", &self.remote_log)
            .field("initiator", &self.initiator)
            .finish_non_exhaustive()
    }
}

/// How to take part in a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    /// Accept connections from peers.
    pub server: bool,
    /// Open connections to peers.
    pub client: bool,
    /// Log identity to advertise, for overlays that surface it to peers.
    pub announce: Option<LogIdentity>,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            server: true,
            client: true,
            announce: None,
        }
    }
}

impl JoinOptions {
    pub fn announce(mut self, identity: LogIdentity) -> Self {
        self.announce = Some(identity);
        self
    }
}

/// Overlay network session.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Overlay: Send + Sync {
    /// Join `topic`. Connections arrive on the returned channel until the
    /// overlay is destroyed.
    async fn join(&self, topic: Topic, options: JoinOptions) -> Result<mpsc::Receiver<Connection>>;

    /// Leave every topic and stop delivering connections.
    async fn destroy(&self) -> Result<()>;
}

/// A simple in-memory overlay for testing.
///
/// Every pair of members on the same topic is connected through a
/// `tokio::io::duplex` pipe as soon as the second one joins.
pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    use crate::error::SyncError;

    /// Buffer size of each simulated connection.
    const PIPE_CAPACITY: usize = 64 * 1024;

    struct Member {
        node: u64,
        options: JoinOptions,
        sender: mpsc::Sender<Connection>,
    }

    /// Shared state for the memory overlay network.
    pub struct MemoryNetwork {
        topics: Mutex<HashMap<Topic, Vec<Member>>>,
        next_node: AtomicU64,
        /// Whether connections carry the peer's announced log identity.
        log_discovery: bool,
    }

    impl MemoryNetwork {
        /// Create a network whose connections need a key exchange.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::build(false))
        }

        /// Create a network that surfaces peer log identities on connect.
        pub fn with_log_discovery() -> Arc<Self> {
            Arc::new(Self::build(true))
        }

        fn build(log_discovery: bool) -> Self {
            Self {
                topics: Mutex::new(HashMap::new()),
                next_node: AtomicU64::new(0),
                log_discovery,
            }
        }

        /// Create a node attached to this network.
        pub fn swarm(self: &Arc<Self>) -> MemorySwarm {
            MemorySwarm {
                node: self.next_node.fetch_add(1, Ordering::SeqCst),
                network: Arc::clone(self),
                destroyed: AtomicBool::new(false),
            }
        }

        /// Number of members currently joined to `topic`.
        pub async fn members(&self, topic: &Topic) -> usize {
            self.topics.lock().await.get(topic).map_or(0, Vec::len)
        }
    }

    impl Default for MemoryNetwork {
        fn default() -> Self {
            Self::build(false)
        }
    }

    /// One node on a [`MemoryNetwork`].
    pub struct MemorySwarm {
        node: u64,
        network: Arc<MemoryNetwork>,
        destroyed: AtomicBool,
    }

    #[async_trait]
    impl Overlay for MemorySwarm {
        async fn join(
            &self,
            topic: Topic,
            options: JoinOptions,
        ) -> Result<mpsc::Receiver<Connection>> {
            if self.destroyed.load(Ordering::SeqCst) {
                return Err(SyncError::Overlay("swarm destroyed".into()));
            }

            let (sender, receiver) = mpsc::channel(64);
            let mut deliveries = Vec::new();

            {
                let mut topics = self.network.topics.lock().await;
                let members = topics.entry(topic).or_default();
                members.retain(|m| m.node != self.node);

                for member in members.iter() {
                    let dial = options.client && member.options.server;
                    let accept = options.server && member.options.client;
                    if !dial && !accept {
                        continue;
                    }

                    let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
                    let discovery = self.network.log_discovery;
                    deliveries.push((
                        sender.clone(),
                        Connection {
                            stream: Box::new(ours),
                            remote_log: member.options.announce.filter(|_| discovery),
                            initiator: dial,
                        },
                    ));
                    deliveries.push((
                        member.sender.clone(),
                        Connection {
                            stream: Box::new(theirs),
                            remote_log: options.announce.filter(|_| discovery),
                            initiator: !dial,
                        },
                    ));
                }

                members.push(Member {
                    node: self.node,
                    options,
                    sender,
                });
            }

            for (sender, connection) in deliveries {
                // A member that stopped listening just misses the connection.
                let _ = sender.send(connection).await;
            }

            Ok(receiver)
        }

        async fn destroy(&self) -> Result<()> {
            self.destroyed.store(true, Ordering::SeqCst);
            let mut topics = self.network.topics.lock().await;
            for members in topics.values_mut() {
                members.retain(|m| m.node != self.node);
            }
            topics.retain(|_, members| !members.is_empty());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryNetwork;
    use super::*;
    use peervault_core::IdentitySeed;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn topic() -> Topic {
        Topic::derive(&IdentitySeed::from_bytes([0x44; 32]))
    }

    #[tokio::test]
    async fn test_members_get_connected() {
        let network = MemoryNetwork::new();
        let a = network.swarm();
        let b = network.swarm();

        let mut a_conns = a.join(topic(), JoinOptions::default()).await.unwrap();
        let mut b_conns = b.join(topic(), JoinOptions::default()).await.unwrap();

        let mut on_a = a_conns.recv().await.unwrap();
        let mut on_b = b_conns.recv().await.unwrap();
        assert!(on_b.initiator);
        assert!(!on_a.initiator);
        assert!(on_a.remote_log.is_none());

        on_b.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        on_a.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_log_discovery_surfaces_identity() {
        let network = MemoryNetwork::with_log_discovery();
        let a_log = LogIdentity::from_bytes([0xAA; 32]);
        let b_log = LogIdentity::from_bytes([0xBB; 32]);

        let mut a_conns = network
            .swarm()
            .join(topic(), JoinOptions::default().announce(a_log))
            .await
            .unwrap();
        let mut b_conns = network
            .swarm()
            .join(topic(), JoinOptions::default().announce(b_log))
            .await
            .unwrap();

        assert_eq!(a_conns.recv().await.unwrap().remote_log, Some(b_log));
        assert_eq!(b_conns.recv().await.unwrap().remote_log, Some(a_log));
    }

    #[tokio::test]
    async fn test_other_topics_stay_apart() {
        let network = MemoryNetwork::new();
        let other = Topic::derive(&IdentitySeed::from_bytes([0x55; 32]));

        let mut a_conns = network
            .swarm()
            .join(topic(), JoinOptions::default())
            .await
            .unwrap();
        let _b = network
            .swarm()
            .join(other, JoinOptions::default())
            .await
            .unwrap();

        assert!(a_conns.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_destroy_leaves_topic() {
        let network = MemoryNetwork::new();
        let a = network.swarm();
        let mut conns = a.join(topic(), JoinOptions::default()).await.unwrap();
        assert_eq!(network.members(&topic()).await, 1);

        a.destroy().await.unwrap();
        assert_eq!(network.members(&topic()).await, 0);
        assert!(conns.recv().await.is_none());
        assert!(a.join(topic(), JoinOptions::default()).await.is_err());
    }
}
