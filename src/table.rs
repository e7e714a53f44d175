//! The node table: every endpoint a seeder currently knows about.
//!
//! The table owns admission control, the per-node status transitions applied
//! by the result processor, and the periodic audit that keeps the pool
//! bounded and fresh. It is a plain data structure; the seeder supervisor
//! wraps it in a lock.

use crate::crawl::PeerInfo;
use crate::node::{unix_timestamp, Node, NodeStatus};
use log::{debug, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

/// Connect failures tolerated on a no-good node before the audit deletes it.
/// Just over 24 hours of retries at the default cadence.
pub const MAX_FAILS: u32 = 58;

/// Address records older than this are not admitted.
const STALE_ADDR_SECS: u64 = 24 * 60 * 60;

/// A crawl still marked active after this long gets flagged by the audit.
const LONG_CRAWL_SECS: u64 = 300;

/// Keyed map of known endpoints for one network.
#[derive(Debug)]
pub struct NodeTable {
    nodes: HashMap<String, Node>,
    /// Soft capacity; admission stops once the table grows past it.
    max_size: usize,
    /// The network's standard port, used to classify new nodes.
    std_port: u16,
}

impl NodeTable {
    pub fn new(max_size: usize, std_port: u16) -> Self {
        NodeTable {
            nodes: HashMap::new(),
            max_size,
            std_port,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// True once the table has grown past its soft capacity.
    pub fn is_full(&self) -> bool {
        self.nodes.len() > self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn get(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.nodes.get_mut(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut Node)> {
        self.nodes.iter_mut()
    }

    /// Validate and admit a newly learned endpoint.
    ///
    /// Admission is refused when the table is over capacity, the key already
    /// exists, the port is 0 or 65535, or the advertised timestamp says the
    /// address has not been seen in the last 24 hours. The refusal is a
    /// result, not an error; callers just count it.
    pub fn add_node(&mut self, addr: SocketAddr, stamp_secs: u64) -> bool {
        if self.is_full() {
            return false;
        }

        let key = addr.to_string();
        if self.nodes.contains_key(&key) {
            return false;
        }

        if addr.port() == 0 || addr.port() == u16::MAX {
            return false;
        }

        if stamp_secs + STALE_ADDR_SECS < unix_timestamp() {
            return false;
        }

        self.nodes.insert(key, Node::new(addr, self.std_port));
        true
    }

    /// Release the crawl-active claim on a node so it can be rescheduled.
    pub fn clear_crawl(&mut self, key: &str) {
        if let Some(nd) = self.nodes.get_mut(key) {
            nd.crawl_active = false;
        }
    }

    /// Apply a failed crawl outcome to a node.
    ///
    /// Raises the rating and walks the status ladder: reported-good nodes
    /// degrade to was-good past rating 30 (or straight to no-good while the
    /// table is full), confirmed-good degrade at rating 50, was-good become
    /// no-good at rating 100.
    pub fn record_failure(&mut self, key: &str, reason: &str) {
        let full = self.is_full();

        let Some(nd) = self.nodes.get_mut(key) else {
            return;
        };

        nd.last_try = Some(Instant::now());
        nd.connect_fails += 1;
        nd.status_str = reason.to_string();

        match nd.status {
            NodeStatus::ReportedGood => {
                if full {
                    // No space to give an unproven address more chances.
                    nd.status = NodeStatus::NoGood;
                } else {
                    nd.rating += 25;
                    if nd.rating > 30 {
                        nd.status = NodeStatus::WasGood;
                    }
                }
            }
            NodeStatus::ConfirmedGood => {
                nd.rating += 25;
                if nd.rating >= 50 {
                    nd.status = NodeStatus::WasGood;
                }
            }
            NodeStatus::WasGood => {
                nd.rating += 15;
                if nd.rating >= 100 {
                    nd.status = NodeStatus::NoGood;
                }
            }
            NodeStatus::NoGood => {}
        }
    }

    /// Apply a successful crawl outcome: confirm the node and copy in what
    /// the handshake learned.
    pub fn record_success(&mut self, key: &str, info: &PeerInfo) {
        let Some(nd) = self.nodes.get_mut(key) else {
            return;
        };

        let now = Instant::now();
        nd.status = NodeStatus::ConfirmedGood;
        nd.rating = 0;
        nd.connect_fails = 0;
        nd.last_connect = now;
        nd.last_try = Some(now);
        nd.status_str = "ok: received remote address list".to_string();
        nd.version = info.version;
        nd.services = info.services;
        nd.user_agent = info.user_agent.clone();
        nd.last_block = info.last_block;
    }

    /// Periodic cleanup pass. Returns the number of nodes purged.
    ///
    /// Deletes no-good nodes past the failure limit, all no-good nodes while
    /// the table is over capacity, and confirmed-good nodes beyond
    /// `cg_goal` so the advertised set keeps rotating. The capacity decision
    /// is captured once up front and used for the whole pass.
    pub fn audit(&mut self, cg_goal: usize) -> usize {
        let full = self.is_full();
        let mut purged = 0;
        let mut cg_count = 0;

        self.nodes.retain(|key, nd| {
            if nd.crawl_active {
                if let Some(start) = nd.crawl_start {
                    if start.elapsed().as_secs() >= LONG_CRAWL_SECS {
                        warn!(
                            "long running crawl: {} status:rating:fails {}:{}:{} last status: {}",
                            key, nd.status, nd.rating, nd.connect_fails, nd.status_str
                        );
                    }
                }
            }

            if nd.status == NodeStatus::NoGood && nd.connect_fails > MAX_FAILS {
                debug!(
                    "purging node {key} after {} failed connections",
                    nd.connect_fails
                );
                purged += 1;
                return false;
            }

            if nd.status == NodeStatus::NoGood && full {
                debug!("table full, purging node {key}");
                purged += 1;
                return false;
            }

            if nd.status == NodeStatus::ConfirmedGood {
                cg_count += 1;
                if cg_count > cg_goal {
                    debug!("cycling confirmed-good pool, purging node {key}");
                    purged += 1;
                    return false;
                }
            }

            true
        });

        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::DnsRecordType;
    use bitcoin::p2p::ServiceFlags;

    fn table(max_size: usize) -> NodeTable {
        NodeTable::new(max_size, 28333)
    }

    fn info() -> PeerInfo {
        PeerInfo {
            version: 70016,
            services: ServiceFlags::NETWORK,
            user_agent: "/peer:1.0/".to_string(),
            last_block: 1000,
        }
    }

    fn add(t: &mut NodeTable, addr: &str) -> bool {
        t.add_node(addr.parse().unwrap(), unix_timestamp())
    }

    #[test]
    fn admission_scenario_at_capacity_one() {
        let mut t = table(1);

        assert!(add(&mut t, "1.2.3.4:28333"));
        assert_eq!(t.get("1.2.3.4:28333").unwrap().dns_type, DnsRecordType::V4Std);
        assert!(t.get("1.2.3.4:28333").unwrap().nonstd_ip.is_none());

        assert!(add(&mut t, "50.123.45.67:43210"));
        let nd = t.get("50.123.45.67:43210").unwrap();
        assert_eq!(nd.dns_type, DnsRecordType::V4Non);
        assert_eq!(nd.nonstd_ip.unwrap().to_string(), "101.165.168.202");

        // Over capacity now, and the first key is a duplicate either way.
        assert!(!add(&mut t, "127.0.0.1:1234"));
        assert!(!add(&mut t, "1.2.3.4:28333"));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn admission_rejects_port_bounds() {
        let mut t = table(10);

        assert!(!add(&mut t, "1.2.3.4:0"));
        assert!(!add(&mut t, "1.2.3.4:65535"));
        assert_eq!(t.len(), 0);

        assert!(add(&mut t, "1.2.3.4:65534"));
        assert!(add(&mut t, "1.2.3.4:1"));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn admission_rejects_stale_timestamp() {
        let mut t = table(10);
        let day = 24 * 60 * 60;

        let stale = unix_timestamp() - day - 60;
        assert!(!t.add_node("1.2.3.4:8333".parse().unwrap(), stale));
        assert_eq!(t.len(), 0);

        let fresh = unix_timestamp() - day + 60;
        assert!(t.add_node("1.2.3.4:8333".parse().unwrap(), fresh));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn keys_match_stored_addresses() {
        let mut t = table(10);
        add(&mut t, "1.2.3.4:8333");
        add(&mut t, "[2001:db8::1]:8444");

        for (key, nd) in t.iter() {
            assert_eq!(*key, nd.addr.to_string());
        }
    }

    #[test]
    fn success_resets_penalties() {
        let mut t = table(10);
        add(&mut t, "1.2.3.4:8333");

        t.record_failure("1.2.3.4:8333", "dial: refused");
        t.record_success("1.2.3.4:8333", &info());

        let nd = t.get("1.2.3.4:8333").unwrap();
        assert_eq!(nd.status, NodeStatus::ConfirmedGood);
        assert_eq!(nd.rating, 0);
        assert_eq!(nd.connect_fails, 0);
        assert_eq!(nd.version, 70016);
        assert_eq!(nd.user_agent, "/peer:1.0/");
    }

    #[test]
    fn confirmed_good_degrades_after_two_failures() {
        let mut t = table(10);
        add(&mut t, "1.2.3.4:8333");
        t.record_success("1.2.3.4:8333", &info());

        t.record_failure("1.2.3.4:8333", "dial: refused");
        assert_eq!(t.get("1.2.3.4:8333").unwrap().status, NodeStatus::ConfirmedGood);
        assert_eq!(t.get("1.2.3.4:8333").unwrap().rating, 25);

        t.record_failure("1.2.3.4:8333", "dial: refused");
        let nd = t.get("1.2.3.4:8333").unwrap();
        assert_eq!(nd.status, NodeStatus::WasGood);
        assert_eq!(nd.rating, 50);
        assert_eq!(nd.connect_fails, 2);
    }

    #[test]
    fn failure_ladder_reported_to_no_good() {
        let mut t = table(10);
        add(&mut t, "1.2.3.4:8333");

        // Two RG failures: 25, then 50 which passed the 30 threshold.
        t.record_failure("1.2.3.4:8333", "e");
        t.record_failure("1.2.3.4:8333", "e");
        let nd = t.get("1.2.3.4:8333").unwrap();
        assert_eq!(nd.status, NodeStatus::WasGood);
        assert_eq!(nd.rating, 50);

        // Two WG failures add 15 each.
        t.record_failure("1.2.3.4:8333", "e");
        t.record_failure("1.2.3.4:8333", "e");
        let nd = t.get("1.2.3.4:8333").unwrap();
        assert_eq!(nd.status, NodeStatus::WasGood);
        assert_eq!(nd.rating, 80);

        t.record_failure("1.2.3.4:8333", "e");
        let nd = t.get("1.2.3.4:8333").unwrap();
        assert_eq!(nd.status, NodeStatus::WasGood);
        assert_eq!(nd.rating, 95);

        // 110 crosses the no-good threshold.
        t.record_failure("1.2.3.4:8333", "e");
        let nd = t.get("1.2.3.4:8333").unwrap();
        assert_eq!(nd.status, NodeStatus::NoGood);
        assert_eq!(nd.rating, 110);
    }

    #[test]
    fn was_good_needs_full_ladder_to_no_good() {
        let mut t = table(10);
        add(&mut t, "1.2.3.4:8333");
        t.get_mut("1.2.3.4:8333").unwrap().status = NodeStatus::WasGood;

        // From rating 0, four +15 steps stay below 100.
        for _ in 0..4 {
            t.record_failure("1.2.3.4:8333", "e");
        }
        assert_eq!(t.get("1.2.3.4:8333").unwrap().status, NodeStatus::WasGood);
        assert_eq!(t.get("1.2.3.4:8333").unwrap().rating, 60);
    }

    #[test]
    fn reported_good_fails_straight_to_no_good_when_full() {
        let mut t = table(1);
        add(&mut t, "1.2.3.4:8333");
        add(&mut t, "5.6.7.8:8333");
        assert!(t.is_full());

        t.record_failure("1.2.3.4:8333", "e");
        assert_eq!(t.get("1.2.3.4:8333").unwrap().status, NodeStatus::NoGood);
    }

    #[test]
    fn no_good_failures_only_count() {
        let mut t = table(10);
        add(&mut t, "1.2.3.4:8333");
        t.get_mut("1.2.3.4:8333").unwrap().status = NodeStatus::NoGood;

        t.record_failure("1.2.3.4:8333", "e");
        t.record_failure("1.2.3.4:8333", "e");

        let nd = t.get("1.2.3.4:8333").unwrap();
        assert_eq!(nd.status, NodeStatus::NoGood);
        assert_eq!(nd.connect_fails, 2);
    }

    #[test]
    fn audit_purges_failed_no_good_nodes() {
        let mut t = table(100);

        for i in 0..5u8 {
            add(&mut t, &format!("1.2.3.{i}:8333"));
            let key = format!("1.2.3.{i}:8333");
            let nd = t.get_mut(&key).unwrap();
            nd.status = NodeStatus::NoGood;
            nd.connect_fails = MAX_FAILS + 1;
        }
        for i in 0..3u8 {
            add(&mut t, &format!("4.5.6.{i}:8333"));
            t.get_mut(&format!("4.5.6.{i}:8333")).unwrap().status = NodeStatus::NoGood;
        }

        // Not full, so only the over-the-limit nodes go.
        let purged = t.audit(1000);
        assert_eq!(purged, 5);
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn audit_purges_all_no_good_when_full() {
        let mut t = table(3);
        for i in 0..4u8 {
            add(&mut t, &format!("1.2.3.{i}:8333"));
            t.get_mut(&format!("1.2.3.{i}:8333")).unwrap().status = NodeStatus::NoGood;
        }
        assert!(t.is_full());

        let purged = t.audit(1000);
        assert_eq!(purged, 4);
        assert!(t.is_empty());
    }

    #[test]
    fn audit_cycles_excess_confirmed_good() {
        let mut t = table(100);
        for i in 0..10u8 {
            add(&mut t, &format!("1.2.3.{i}:8333"));
            t.get_mut(&format!("1.2.3.{i}:8333")).unwrap().status =
                NodeStatus::ConfirmedGood;
        }

        let purged = t.audit(6);
        assert_eq!(purged, 4);

        let remaining = t
            .iter()
            .filter(|(_, nd)| nd.status == NodeStatus::ConfirmedGood)
            .count();
        assert_eq!(remaining, 6);
    }
}
