//! One-shot crawl of a single remote peer.
//!
//! A crawl dials the endpoint, runs the minimal version handshake, and asks
//! the peer for the addresses it knows. The whole session lives under one
//! end-to-end deadline; whatever happens, the worker reports back to its
//! seeder with a [`CrawlResult`] and never touches the node table itself.

use crate::node::unix_timestamp;
use crate::transport::{self, Transport, TransportError};
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::{Magic, ServiceFlags};
use log::debug;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Maximum wall-clock time for a whole crawl session, dial included. There
/// are no per-message timeouts; this deadline subsumes them.
pub const MAX_TO: Duration = Duration::from_secs(250);

/// Nonce sent in our `version` message. The seeder never listens for inbound
/// peers, so loop detection is moot and a fixed value is safe.
const VERSION_NONCE: u64 = 0x0539_a019_ca55_0825;

/// Messages to sift through waiting for the peer's `addr` reply.
const MAX_HARVEST_MESSAGES: usize = 25;

/// User agent advertised in our `version` message.
pub fn default_user_agent() -> String {
    format!("/{}:{}/", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// Ways a crawl can fail. Every variant renders to a short description that
/// ends up in the node's diagnostics string.
#[derive(Debug)]
pub enum CrawlError {
    /// TCP connect error or connect timeout.
    Dial(io::Error),
    /// The peer sent something else where a handshake message was required.
    Unexpected {
        expected: &'static str,
        received: String,
    },
    /// The peer chatted away without ever sending addresses.
    AddrMissing,
    /// Read or write failure mid-session.
    Io {
        location: &'static str,
        source: TransportError,
    },
    /// The end-to-end session deadline expired.
    Deadline,
}

impl fmt::Display for CrawlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrawlError::Dial(e) => write!(f, "dial: {e}"),
            CrawlError::Unexpected { expected, received } => {
                write!(f, "expected {expected} message but received {received}")
            }
            CrawlError::AddrMissing => {
                write!(
                    f,
                    "did not receive addresses in first {MAX_HARVEST_MESSAGES} messages"
                )
            }
            CrawlError::Io { location, source } => write!(f, "{location}: {source}"),
            CrawlError::Deadline => write!(f, "session deadline exceeded"),
        }
    }
}

impl std::error::Error for CrawlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CrawlError::Dial(e) => Some(e),
            CrawlError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// What the peer told us about itself during the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub version: u32,
    pub services: ServiceFlags,
    pub user_agent: String,
    pub last_block: i32,
}

/// Addresses harvested from the peer's `addr` reply, with the advertised
/// last-seen timestamps.
pub type Harvest = Vec<(u32, Address)>;

/// Outcome of one crawl, pushed onto the seeder's result channel.
#[derive(Debug)]
pub struct CrawlResult {
    /// Table key of the node that was crawled.
    pub node_key: String,
    pub outcome: Result<(PeerInfo, Harvest), CrawlError>,
}

/// Connection a crawl runs over. Abstracted so protocol tests can script
/// the remote side.
pub trait PeerConnection: Send {
    fn send(
        &mut self,
        message: NetworkMessage,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
    fn receive(
        &mut self,
    ) -> impl std::future::Future<Output = Result<NetworkMessage, TransportError>> + Send;
}

impl<R, W> PeerConnection for Transport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn send(
        &mut self,
        message: NetworkMessage,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send {
        self.write(message)
    }

    fn receive(
        &mut self,
    ) -> impl std::future::Future<Output = Result<NetworkMessage, TransportError>> + Send {
        self.read()
    }
}

fn io_err(location: &'static str) -> impl FnOnce(TransportError) -> CrawlError {
    move |source| CrawlError::Io { location, source }
}

/// Build the `version` message for an outbound crawl.
///
/// The sender address is the non-listening 0.0.0.0:0 so peers don't
/// advertise us, and the start height is zero since we follow no chain.
fn build_version(pver: u32, peer_addr: SocketAddr, user_agent: &str) -> VersionMessage {
    let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

    VersionMessage {
        version: pver,
        services: ServiceFlags::NONE,
        timestamp: unix_timestamp() as i64,
        receiver: Address::new(&peer_addr, ServiceFlags::NONE),
        sender: Address::new(&local, ServiceFlags::NONE),
        nonce: VERSION_NONCE,
        user_agent: user_agent.to_string(),
        start_height: 0,
        relay: false,
    }
}

/// Run the crawl protocol over an established connection.
///
/// Exchanges `version` and `verack` strictly, then requests addresses with
/// `getaddr` unless the caller's table is already full. Unrelated messages
/// are skipped while waiting for the `addr` reply, up to a bound.
pub async fn crawl_peer<C: PeerConnection>(
    conn: &mut C,
    pver: u32,
    peer_addr: SocketAddr,
    user_agent: &str,
    table_full: bool,
) -> Result<(PeerInfo, Harvest), CrawlError> {
    let version = build_version(pver, peer_addr, user_agent);
    conn.send(NetworkMessage::Version(version))
        .await
        .map_err(io_err("send version"))?;

    let info = match conn.receive().await.map_err(io_err("read version"))? {
        NetworkMessage::Version(v) => PeerInfo {
            version: v.version,
            services: v.services,
            user_agent: v.user_agent,
            last_block: v.start_height,
        },
        other => {
            return Err(CrawlError::Unexpected {
                expected: "version",
                received: other.cmd().to_string(),
            })
        }
    };
    debug!("{peer_addr} - remote version {}", info.version);

    conn.send(NetworkMessage::Verack)
        .await
        .map_err(io_err("send verack"))?;

    match conn.receive().await.map_err(io_err("read verack"))? {
        NetworkMessage::Verack => {}
        other => {
            return Err(CrawlError::Unexpected {
                expected: "verack",
                received: other.cmd().to_string(),
            })
        }
    }

    // A full table has no room for new addresses; the confirmed contact is
    // all we needed.
    if table_full {
        return Ok((info, Vec::new()));
    }

    conn.send(NetworkMessage::GetAddr)
        .await
        .map_err(io_err("send getaddr"))?;

    for _ in 0..MAX_HARVEST_MESSAGES {
        match conn.receive().await.map_err(io_err("read addr"))? {
            NetworkMessage::Addr(list) => {
                debug!("{peer_addr} - received {} addresses", list.len());
                return Ok((info, list));
            }
            other => {
                debug!("{peer_addr} - ignoring {} message", other.cmd());
            }
        }
    }

    Err(CrawlError::AddrMissing)
}

/// Crawl worker task: dial, run the protocol under the session deadline,
/// and report the outcome to the seeder.
pub async fn crawl_node(
    results: mpsc::Sender<CrawlResult>,
    node_key: String,
    addr: SocketAddr,
    magic: Magic,
    pver: u32,
    user_agent: String,
    table_full: bool,
) {
    let outcome = match timeout(MAX_TO, async {
        let mut conn = transport::connect(addr, magic)
            .await
            .map_err(CrawlError::Dial)?;
        crawl_peer(&mut conn, pver, addr, &user_agent, table_full).await
    })
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => Err(CrawlError::Deadline),
    };

    // Send failure means the seeder is shutting down; the result is moot.
    let _ = results.send(CrawlResult { node_key, outcome }).await;
}
