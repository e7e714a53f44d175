//! Authoritative DNS seeder for networks speaking the bitcoin wire protocol.
//!
//! For each configured network the seeder keeps a table of known peer
//! endpoints, continuously crawls them with a minimal
//! `version`/`verack`/`getaddr` handshake to confirm reachability and learn
//! new addresses, and serves the confirmed pool as A/AAAA records under the
//! network's hostname so new clients can bootstrap.
//!
//! The crate splits along those lines:
//!
//! * [`config`] - JSON network definition files.
//! * [`transport`] - plaintext wire framing for crawl sessions.
//! * [`crawl`] - the one-shot crawl worker.
//! * [`node`] / [`table`] - per-endpoint state and the keyed node table.
//! * [`seeder`] - the per-network supervisor tying it all together.
//! * [`dns`] - answer snapshots and the authoritative UDP front-end.

pub mod config;
pub mod crawl;
pub mod dns;
pub mod node;
pub mod seeder;
pub mod stats;
pub mod table;
pub mod transport;

pub use config::{ConfigError, NetworkFile, SeederConfig};
pub use crawl::{CrawlError, CrawlResult, PeerInfo};
pub use dns::{DnsServer, SharedAnswers};
pub use node::{DnsRecordType, Node, NodeStatus};
pub use seeder::Seeder;
pub use table::NodeTable;
pub use transport::{Transport, TransportError};
