//! DNS answer sets and the authoritative UDP front-end.
//!
//! Every seeder periodically snapshots its node table into four record
//! lists (A/AAAA, standard/non-standard port) and publishes them into a
//! process-wide answer map. The front-end serves queries straight out of
//! that map, so responses never wait on crawl locks and are at most one
//! snapshot interval stale.

use crate::node::{DnsRecordType, NodeStatus};
use crate::stats::NodeCounts;
use crate::table::NodeTable;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use log::{debug, warn};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};

/// Record cap for each of the four answer lists.
const RECORDS_PER_SET: usize = 25;

/// Shared map of currently served answers, keyed by
/// `"<fqdn><record type>"` (e.g. `"seed.example.com.A"`).
pub type SharedAnswers = Arc<RwLock<HashMap<String, Vec<Record>>>>;

/// Key into the answer map for a name and query type.
pub fn answer_key(fqdn: &str, rtype: RecordType) -> String {
    format!("{fqdn}{rtype}")
}

/// The four record lists a snapshot produces.
#[derive(Debug, Default)]
pub struct AnswerSets {
    pub v4_std: Vec<Record>,
    pub v4_non: Vec<Record>,
    pub v6_std: Vec<Record>,
    pub v6_non: Vec<Record>,
}

/// Derive the answer sets from the current table state.
///
/// Only confirmed-good nodes contribute. Standard-port endpoints produce one
/// record under the seeder's hostname; non-standard endpoints produce a pair
/// under the `nonstd.` label: the real address plus the synthetic address
/// that encodes the port.
pub fn build_answers(table: &NodeTable, dns_host: &str, ttl: u32) -> AnswerSets {
    let (std_name, non_name) = match (
        Name::from_ascii(format!("{dns_host}.")),
        Name::from_ascii(format!("nonstd.{dns_host}.")),
    ) {
        (Ok(s), Ok(n)) => (s, n),
        _ => {
            warn!("cannot build answers for invalid host {dns_host}");
            return AnswerSets::default();
        }
    };

    let mut sets = AnswerSets::default();

    for (_, nd) in table.iter() {
        if nd.status != NodeStatus::ConfirmedGood {
            continue;
        }

        match (nd.dns_type, nd.addr.ip()) {
            (DnsRecordType::V4Std, IpAddr::V4(ip)) => {
                if sets.v4_std.len() < RECORDS_PER_SET {
                    sets.v4_std
                        .push(Record::from_rdata(std_name.clone(), ttl, RData::A(A(ip))));
                }
            }
            (DnsRecordType::V6Std, IpAddr::V6(ip)) => {
                if sets.v6_std.len() < RECORDS_PER_SET {
                    sets.v6_std.push(Record::from_rdata(
                        std_name.clone(),
                        ttl,
                        RData::AAAA(AAAA(ip)),
                    ));
                }
            }
            (DnsRecordType::V4Non, IpAddr::V4(ip)) => {
                let Some(enc) = nd.nonstd_ip else { continue };
                // The pair travels together or not at all.
                if sets.v4_non.len() + 2 <= RECORDS_PER_SET {
                    sets.v4_non
                        .push(Record::from_rdata(non_name.clone(), ttl, RData::A(A(ip))));
                    sets.v4_non
                        .push(Record::from_rdata(non_name.clone(), ttl, RData::A(A(enc))));
                }
            }
            (DnsRecordType::V6Non, IpAddr::V6(ip)) => {
                let Some(enc) = nd.nonstd_ip else { continue };
                if sets.v6_non.len() + 2 <= RECORDS_PER_SET {
                    sets.v6_non.push(Record::from_rdata(
                        non_name.clone(),
                        ttl,
                        RData::AAAA(AAAA(ip)),
                    ));
                    sets.v6_non.push(Record::from_rdata(
                        non_name.clone(),
                        ttl,
                        RData::AAAA(AAAA(enc.to_ipv6_mapped())),
                    ));
                }
            }
            _ => {}
        }
    }

    sets
}

/// Publish freshly built answer sets into the shared map.
pub async fn publish(answers: &SharedAnswers, dns_host: &str, sets: AnswerSets) {
    let std_fqdn = format!("{dns_host}.");
    let non_fqdn = format!("nonstd.{dns_host}.");

    let mut map = answers.write().await;
    map.insert(answer_key(&std_fqdn, RecordType::A), sets.v4_std);
    map.insert(answer_key(&non_fqdn, RecordType::A), sets.v4_non);
    map.insert(answer_key(&std_fqdn, RecordType::AAAA), sets.v6_std);
    map.insert(answer_key(&non_fqdn, RecordType::AAAA), sets.v6_non);
}

/// Work out which seeder and counter slot a query name belongs to.
///
/// Returns the bare host (prefix and trailing dot stripped) and the record
/// classification, or `None` for query types we never serve.
fn classify_query(name: &str, rtype: RecordType) -> Option<(&str, DnsRecordType)> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    let (host, nonstd) = match trimmed.strip_prefix("nonstd.") {
        Some(rest) => (rest, true),
        None => (trimmed, false),
    };

    let dns_type = match (rtype, nonstd) {
        (RecordType::A, false) => DnsRecordType::V4Std,
        (RecordType::A, true) => DnsRecordType::V4Non,
        (RecordType::AAAA, false) => DnsRecordType::V6Std,
        (RecordType::AAAA, true) => DnsRecordType::V6Non,
        _ => return None,
    };

    Some((host, dns_type))
}

/// Build the authoritative reply for one request.
fn make_response(request: &Message, answers: Vec<Record>) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_authoritative(true);
    response.set_recursion_available(false);
    response.set_response_code(ResponseCode::NoError);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    response.add_answers(answers);
    response
}

/// Authoritative UDP server answering from the shared map.
pub struct DnsServer {
    answers: SharedAnswers,
    /// Per-seeder counters, keyed by bare hostname.
    counters: Vec<(String, Arc<std::sync::RwLock<NodeCounts>>)>,
    /// Queries for names no seeder is configured for.
    unknown: AtomicU64,
}

impl DnsServer {
    pub fn new(
        answers: SharedAnswers,
        counters: Vec<(String, Arc<std::sync::RwLock<NodeCounts>>)>,
    ) -> Self {
        DnsServer {
            answers,
            counters,
            unknown: AtomicU64::new(0),
        }
    }

    /// Count an answered query against its seeder, or the unknown bucket.
    fn count_query(&self, host: &str, dns_type: DnsRecordType) {
        for (name, counts) in &self.counters {
            if name == host {
                if let Ok(mut counts) = counts.write() {
                    counts.record_dns(dns_type);
                }
                return;
            }
        }
        self.unknown.fetch_add(1, Ordering::Relaxed);
    }

    /// Answer queries until shutdown is signaled.
    pub async fn serve(self, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) {
        let mut buf = [0u8; 512];

        loop {
            let (len, from) = tokio::select! {
                _ = shutdown.changed() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("DNS receive error: {e}");
                        continue;
                    }
                },
            };

            let request = match Message::from_vec(&buf[..len]) {
                Ok(m) => m,
                Err(e) => {
                    debug!("dropping malformed DNS query from {from}: {e}");
                    continue;
                }
            };

            let Some(query) = request.queries().first() else {
                continue;
            };
            let qname = query.name().to_ascii().to_lowercase();
            let qtype = query.query_type();

            let records = match classify_query(&qname, qtype) {
                Some((host, dns_type)) => {
                    self.count_query(host, dns_type);
                    self.answers
                        .read()
                        .await
                        .get(&answer_key(&qname, qtype))
                        .cloned()
                        .unwrap_or_default()
                }
                // Unhandled query type: reply with no answers.
                None => Vec::new(),
            };

            debug!(
                "DNS response to {from} name: {qname} type: {qtype} answers: {}",
                records.len()
            );

            let response = make_response(&request, records);
            match response.to_vec() {
                Ok(bytes) => {
                    if let Err(e) = socket.send_to(&bytes, from).await {
                        warn!("DNS send error to {from}: {e}");
                    }
                }
                Err(e) => warn!("failed to encode DNS response: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawl::PeerInfo;
    use crate::node::unix_timestamp;
    use bitcoin::p2p::ServiceFlags;
    use hickory_proto::op::Query;
    use std::net::SocketAddr;

    const STD_PORT: u16 = 28333;
    const HOST: &str = "seed.example.com";

    fn confirmed_table(addrs: &[&str]) -> NodeTable {
        let mut table = NodeTable::new(1250, STD_PORT);
        let info = PeerInfo {
            version: 70016,
            services: ServiceFlags::NETWORK,
            user_agent: "/peer:1.0/".to_string(),
            last_block: 0,
        };

        for addr in addrs {
            let sa: SocketAddr = addr.parse().unwrap();
            assert!(table.add_node(sa, unix_timestamp()));
            table.record_success(&sa.to_string(), &info);
        }
        table
    }

    #[test]
    fn only_confirmed_good_contributes() {
        let mut table = confirmed_table(&["1.2.3.4:28333", "5.6.7.8:28333"]);
        table.add_node("9.9.9.9:28333".parse().unwrap(), unix_timestamp());

        let sets = build_answers(&table, HOST, 60);
        assert_eq!(sets.v4_std.len(), 2);
        assert!(sets.v4_non.is_empty());
        assert!(sets.v6_std.is_empty());
        assert!(sets.v6_non.is_empty());
    }

    #[test]
    fn nonstd_nodes_emit_real_and_encoded_pair() {
        let table = confirmed_table(&["50.123.45.67:43210"]);

        let sets = build_answers(&table, HOST, 60);
        assert_eq!(sets.v4_non.len(), 2);

        let ips: Vec<String> = sets
            .v4_non
            .iter()
            .map(|r| match r.data() {
                Some(RData::A(a)) => a.0.to_string(),
                other => panic!("expected A record, got {other:?}"),
            })
            .collect();
        assert!(ips.contains(&"50.123.45.67".to_string()));
        assert!(ips.contains(&"101.165.168.202".to_string()));

        for record in &sets.v4_non {
            assert_eq!(record.name().to_ascii(), format!("nonstd.{HOST}."));
            assert_eq!(record.ttl(), 60);
        }
    }

    #[test]
    fn v6_answers_use_aaaa() {
        let table = confirmed_table(&["[2001:db8::1]:28333", "[2001:db8::2]:9999"]);

        let sets = build_answers(&table, HOST, 120);
        assert_eq!(sets.v6_std.len(), 1);
        assert_eq!(sets.v6_non.len(), 2);
        assert!(sets.v4_std.is_empty());
    }

    #[test]
    fn answer_sets_are_capped() {
        let addrs: Vec<String> = (0..40).map(|i| format!("10.0.{i}.1:28333")).collect();
        let refs: Vec<&str> = addrs.iter().map(String::as_str).collect();
        let table = confirmed_table(&refs);

        let sets = build_answers(&table, HOST, 60);
        assert_eq!(sets.v4_std.len(), RECORDS_PER_SET);
    }

    #[tokio::test]
    async fn published_answers_are_stale_until_next_build() {
        let answers: SharedAnswers = Arc::new(RwLock::new(HashMap::new()));
        let mut table = confirmed_table(&["1.2.3.4:28333"]);

        publish(&answers, HOST, build_answers(&table, HOST, 60)).await;

        let key = answer_key(&format!("{HOST}."), RecordType::A);
        assert_eq!(answers.read().await.get(&key).unwrap().len(), 1);

        // The node goes bad, but the published snapshot still serves it.
        table.get_mut("1.2.3.4:28333").unwrap().status = NodeStatus::NoGood;
        assert_eq!(answers.read().await.get(&key).unwrap().len(), 1);

        // The next build drops it.
        publish(&answers, HOST, build_answers(&table, HOST, 60)).await;
        assert!(answers.read().await.get(&key).unwrap().is_empty());
    }

    #[test]
    fn classify_query_maps_prefix_and_type() {
        assert_eq!(
            classify_query("seed.example.com.", RecordType::A),
            Some(("seed.example.com", DnsRecordType::V4Std))
        );
        assert_eq!(
            classify_query("nonstd.seed.example.com.", RecordType::A),
            Some(("seed.example.com", DnsRecordType::V4Non))
        );
        assert_eq!(
            classify_query("seed.example.com.", RecordType::AAAA),
            Some(("seed.example.com", DnsRecordType::V6Std))
        );
        assert_eq!(
            classify_query("nonstd.seed.example.com.", RecordType::AAAA),
            Some(("seed.example.com", DnsRecordType::V6Non))
        );
        assert_eq!(classify_query("seed.example.com.", RecordType::TXT), None);
    }

    #[test]
    fn response_echoes_request_and_sets_authority() {
        let mut request = Message::new();
        request.set_id(4242);
        request.add_query(Query::query(
            Name::from_ascii("seed.example.com.").unwrap(),
            RecordType::A,
        ));

        let table = confirmed_table(&["1.2.3.4:28333"]);
        let sets = build_answers(&table, HOST, 60);
        let response = make_response(&request, sets.v4_std);

        assert_eq!(response.id(), 4242);
        assert_eq!(response.message_type(), MessageType::Response);
        assert!(response.authoritative());
        assert!(!response.recursion_available());
        assert_eq!(response.answers().len(), 1);
        assert_eq!(response.queries().len(), 1);
    }
}
