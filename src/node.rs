//! Per-endpoint state tracked by the crawler.
//!
//! A [`Node`] is one `host:port` endpoint the seeder knows about, along with
//! everything learned while trying to contact it. Nodes move through a small
//! status lifecycle driven by crawl outcomes, and carry the derived DNS
//! classification used when building answer sets.

use bitcoin::p2p::ServiceFlags;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Lifecycle status of a known endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Reported good. A remote peer advertised this address, but we have
    /// never completed a handshake with it.
    ReportedGood,
    /// Confirmed good. The last crawl completed a handshake.
    ConfirmedGood,
    /// Was good. Previously confirmed, now failing.
    WasGood,
    /// No good. Eligible for eviction by the auditor.
    NoGood,
}

/// Number of node statuses, used to size per-status arrays.
pub const STATUS_TYPES: usize = 4;

impl NodeStatus {
    /// Slot of this status in per-status arrays (start caps, retry delays,
    /// counters).
    pub fn index(self) -> usize {
        match self {
            NodeStatus::ReportedGood => 0,
            NodeStatus::ConfirmedGood => 1,
            NodeStatus::WasGood => 2,
            NodeStatus::NoGood => 3,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::ReportedGood => "RG",
            NodeStatus::ConfirmedGood => "CG",
            NodeStatus::WasGood => "WG",
            NodeStatus::NoGood => "NG",
        };
        write!(f, "{s}")
    }
}

/// DNS answer set an endpoint belongs to, derived from its address family
/// and whether it listens on the network's standard port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsRecordType {
    /// IPv4 on the standard port.
    V4Std,
    /// IPv4 on a non-standard port.
    V4Non,
    /// IPv6 on the standard port.
    V6Std,
    /// IPv6 on a non-standard port.
    V6Non,
}

/// Number of DNS record classifications, used to size per-type arrays.
pub const DNS_TYPES: usize = 4;

impl DnsRecordType {
    /// Slot of this type in per-type counter arrays.
    pub fn index(self) -> usize {
        match self {
            DnsRecordType::V4Std => 0,
            DnsRecordType::V4Non => 1,
            DnsRecordType::V6Std => 2,
            DnsRecordType::V6Non => 3,
        }
    }

    /// Classify an endpoint against the network's standard port.
    pub fn classify(addr: &SocketAddr, std_port: u16) -> Self {
        match (addr.ip(), addr.port() == std_port) {
            (IpAddr::V4(_), true) => DnsRecordType::V4Std,
            (IpAddr::V4(_), false) => DnsRecordType::V4Non,
            (IpAddr::V6(_), true) => DnsRecordType::V6Std,
            (IpAddr::V6(_), false) => DnsRecordType::V6Non,
        }
    }
}

impl fmt::Display for DnsRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DnsRecordType::V4Std => "v4 standard port",
            DnsRecordType::V4Non => "v4 non-standard port",
            DnsRecordType::V6Std => "v6 standard port",
            DnsRecordType::V6Non => "v6 non-standard port",
        };
        write!(f, "{s}")
    }
}

/// One known endpoint and everything learned about it.
#[derive(Debug, Clone)]
pub struct Node {
    /// Endpoint address. The node's table key is the text form of this.
    pub addr: SocketAddr,
    /// Lifecycle status.
    pub status: NodeStatus,
    /// Penalty accumulator. Failures raise it, a success resets it to zero.
    pub rating: u32,
    /// Total failed connection attempts.
    pub connect_fails: u32,
    /// True while a crawl worker owns this node.
    pub crawl_active: bool,
    /// When the in-flight crawl started, if any.
    pub crawl_start: Option<Instant>,
    /// Last connection attempt, successful or not.
    pub last_try: Option<Instant>,
    /// Last successful connection (or admission time before any contact).
    pub last_connect: Instant,
    /// Text of the last outcome, for the diagnostics surface.
    pub status_str: String,
    /// Remote protocol version from the peer's `version` message.
    pub version: u32,
    /// Services advertised by the peer.
    pub services: ServiceFlags,
    /// Remote user agent.
    pub user_agent: String,
    /// Last block height the peer reported.
    pub last_block: i32,
    /// Which DNS answer set this endpoint feeds.
    pub dns_type: DnsRecordType,
    /// Synthetic IPv4 carrying the checksum and real port, present iff the
    /// endpoint uses a non-standard port.
    pub nonstd_ip: Option<Ipv4Addr>,
}

impl Node {
    /// Create a freshly reported node for an endpoint, classifying it
    /// against the network's standard port.
    pub fn new(addr: SocketAddr, std_port: u16) -> Self {
        let dns_type = DnsRecordType::classify(&addr, std_port);
        let nonstd_ip = match dns_type {
            DnsRecordType::V4Non | DnsRecordType::V6Non => {
                Some(non_std_ip(addr.ip(), addr.port()))
            }
            _ => None,
        };

        Node {
            addr,
            status: NodeStatus::ReportedGood,
            rating: 0,
            connect_fails: 0,
            crawl_active: false,
            crawl_start: None,
            last_try: None,
            last_connect: Instant::now(),
            status_str: String::new(),
            version: 0,
            services: ServiceFlags::NONE,
            user_agent: String::new(),
            last_block: 0,
            dns_type,
            nonstd_ip,
        }
    }

    /// Table key for this node's address.
    pub fn key(&self) -> String {
        self.addr.to_string()
    }
}

/// Current Unix timestamp in seconds.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before the Unix epoch")
        .as_secs()
}

/// Encode a real endpoint into a synthetic IPv4 address.
///
/// The first two octets hold a CRC-16 of the real IPv4 address and the last
/// two hold the real port, so clients discovering the address over plain DNS
/// can recover the port and verify the pairing with the real-IP record.
pub fn non_std_ip(ip: IpAddr, port: u16) -> Ipv4Addr {
    let crc = match ip {
        IpAddr::V4(v4) => crc16(&v4.octets()),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => crc16(&v4.octets()),
            None => crc16(&[]),
        },
    };

    Ipv4Addr::new(
        (crc >> 8) as u8,
        (crc & 0xff) as u8,
        (port >> 8) as u8,
        (port & 0xff) as u8,
    )
}

/// CRC-16 over a byte slice, initial value 0xFFFF.
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xffff;

    for &v in bytes {
        let mut x = (crc >> 8) ^ u16::from(v);
        x ^= x >> 4;
        crc = (crc << 8) ^ (x << 12) ^ (x << 5) ^ x;
    }
    crc
}
