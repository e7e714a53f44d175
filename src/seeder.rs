//! Per-network seeder supervisor.
//!
//! One seeder task owns the node table for its network and serializes all
//! lifecycle work: it bootstraps the table from the configured seeder
//! hostnames, fans out crawl workers on a timer under per-status limits,
//! folds worker results back into the table, audits the table to keep it
//! bounded and fresh, and periodically publishes DNS answer snapshots.

use crate::config::SeederConfig;
use crate::crawl::{self, CrawlResult};
use crate::dns::{self, SharedAnswers};
use crate::node::{unix_timestamp, NodeStatus, STATUS_TYPES};
use crate::stats::NodeCounts;
use crate::table::NodeTable;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};

/// Seconds between scheduler ticks.
pub const CRAWL_DELAY: Duration = Duration::from_secs(22);
/// Seconds between DNS snapshot rebuilds.
pub const DNS_DELAY: Duration = Duration::from_secs(57);
/// Minutes between table audits.
pub const AUDIT_DELAY: Duration = Duration::from_secs(22 * 60);

/// Result channel backlog. Kept small so a burst of finished workers
/// throttles itself against the supervisor instead of piling up.
const RESULT_BACKLOG: usize = 1;

/// Crawl/state engine for one configured network.
pub struct Seeder {
    config: SeederConfig,
    /// User agent sent in our `version` messages.
    user_agent: String,
    table: Arc<RwLock<NodeTable>>,
    counts: Arc<std::sync::RwLock<NodeCounts>>,
    answers: SharedAnswers,
}

impl Seeder {
    pub fn new(
        config: SeederConfig,
        answers: SharedAnswers,
        counts: Arc<std::sync::RwLock<NodeCounts>>,
    ) -> Self {
        let table = NodeTable::new(config.max_size, config.port);
        Seeder {
            user_agent: crawl::default_user_agent(),
            table: Arc::new(RwLock::new(table)),
            counts,
            answers,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Seed the table by resolving the bootstrap hostnames and admitting
    /// every returned address, plus the configured initial IP.
    async fn bootstrap(&self) {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(r) => r,
            Err(e) => {
                debug!("system resolver config unavailable ({e}), using defaults");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };

        for host in &self.config.seeders {
            let lookup = match resolver.lookup_ip(host.as_str()).await {
                Ok(lookup) => lookup,
                Err(e) => {
                    warn!(
                        "{}: unable to do initial lookup to seeder {host}: {e}",
                        self.config.name
                    );
                    continue;
                }
            };

            let mut added = 0;
            {
                let mut table = self.table.write().await;
                let now = unix_timestamp();
                for ip in lookup.iter() {
                    if table.add_node(SocketAddr::new(ip, self.config.port), now) {
                        added += 1;
                    }
                }
            }
            info!(
                "{}: completed import of {added} addresses from {host}",
                self.config.name
            );
        }

        let mut table = self.table.write().await;
        if let Some(ip) = self.config.initial_ip {
            if table.add_node(SocketAddr::new(ip, self.config.port), unix_timestamp()) {
                info!("{}: crawling with initial IP {ip}", self.config.name);
            }
        }

        if table.is_empty() {
            warn!(
                "{}: no ip addresses from seeders so there is nothing to crawl",
                self.config.name
            );
            for host in &self.config.seeders {
                warn!("{}: seeder: {host}", self.config.name);
            }
        }
    }

    /// One scheduler tick: fan out crawl workers for eligible nodes.
    ///
    /// A node is passed over while a worker owns it, once its status has hit
    /// the per-tick start cap, or while it was tried more recently than the
    /// per-status retry delay. Map iteration order is arbitrary, so each
    /// tick samples a different subset of a large table.
    async fn start_crawlers(&self, results: &mpsc::Sender<CrawlResult>) {
        let mut table = self.table.write().await;
        let tcount = table.len();
        if tcount == 0 {
            debug!("{}: no nodes available to crawl", self.config.name);
            return;
        }

        let full = table.is_full();
        let mut started = [0u32; STATUS_TYPES];
        let mut totals = [0u32; STATUS_TYPES];

        for (key, nd) in table.iter_mut() {
            let st = nd.status.index();
            totals[st] += 1;

            if nd.crawl_active {
                continue;
            }
            if started[st] >= self.config.max_start[st] {
                continue;
            }
            if let Some(last) = nd.last_try {
                if last.elapsed().as_secs() <= self.config.delay[st] {
                    continue;
                }
            }

            nd.crawl_active = true;
            nd.crawl_start = Some(Instant::now());
            started[st] += 1;

            tokio::spawn(crawl::crawl_node(
                results.clone(),
                key.clone(),
                nd.addr,
                self.config.magic,
                self.config.pver,
                self.user_agent.clone(),
                full,
            ));
        }
        drop(table);

        // Publish the counters off the supervisor task.
        let counts = Arc::clone(&self.counts);
        let name = self.config.name.clone();
        tokio::spawn(async move {
            if let Ok(mut counts) = counts.write() {
                counts.update_crawl(totals, started);
            }
            info!(
                "{name}: crawlers started, total nodes: {tcount} started: {}",
                started.iter().sum::<u32>()
            );
        });
    }

    /// Fold one worker outcome back into the table.
    async fn process_result(&self, result: CrawlResult) {
        let mut table = self.table.write().await;

        if !table.contains(&result.node_key) {
            warn!(
                "{}: ignoring results from unknown node: {}",
                self.config.name, result.node_key
            );
            return;
        }

        // Whatever happened, the node is schedulable again.
        table.clear_crawl(&result.node_key);

        match result.outcome {
            Err(e) => {
                table.record_failure(&result.node_key, &e.to_string());
                if let Some(nd) = table.get(&result.node_key) {
                    debug!(
                        "{}: failed crawl node: {} s:r:f: {}:{}:{} {}",
                        self.config.name,
                        result.node_key,
                        nd.status,
                        nd.rating,
                        nd.connect_fails,
                        nd.status_str
                    );
                }
            }
            Ok((info, harvest)) => {
                table.record_success(&result.node_key, &info);

                let mut added = 0usize;
                if !table.is_full() {
                    // A single peer never fills more than a third of the
                    // table in one reply.
                    let one_third = table.max_size() / 3;
                    let now = unix_timestamp();

                    for (stamp, addr) in &harvest {
                        if added >= one_third {
                            break;
                        }
                        let Ok(sock_addr) = addr.socket_addr() else {
                            continue;
                        };
                        let stamp = u64::from(*stamp).min(now);
                        if table.add_node(sock_addr, stamp) {
                            added += 1;
                        }
                    }
                }

                debug!(
                    "{}: crawl done: node: {} addr: {}:{added}",
                    self.config.name,
                    result.node_key,
                    harvest.len()
                );
            }
        }
    }

    /// Periodic audit pass over the table.
    async fn audit_nodes(&self) {
        let cg = NodeStatus::ConfirmedGood.index();

        // 75% of the confirmed-good pool the current delay and start limits
        // can sustain; retaining fewer keeps the advertised set rotating.
        let cg_goal = ((self.config.delay[cg] / CRAWL_DELAY.as_secs()) as f64
            * f64::from(self.config.max_start[cg])
            * 0.75) as usize;

        info!(
            "{}: audit start, confirmed-good goal: {cg_goal}",
            self.config.name
        );

        let purged = self.table.write().await.audit(cg_goal);

        info!("{}: audit complete, {purged} nodes purged", self.config.name);
    }

    /// Rebuild and publish the DNS answer snapshot.
    async fn load_dns(&self) {
        let sets = {
            let table = self.table.read().await;
            dns::build_answers(&table, &self.config.dns_host, self.config.ttl)
        };

        debug!(
            "{}: DNS update - v4std: {} v4non: {} v6std: {} v6non: {}",
            self.config.name,
            sets.v4_std.len(),
            sets.v4_non.len(),
            sets.v6_std.len(),
            sets.v6_non.len()
        );

        dns::publish(&self.answers, &self.config.dns_host, sets).await;
    }

    /// Run the seeder until shutdown is signaled.
    ///
    /// All timer events and worker results are serialized through this one
    /// task. On shutdown no new workers are scheduled; in-flight workers
    /// drain against their own session deadlines.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (results_tx, mut results_rx) = mpsc::channel(RESULT_BACKLOG);

        self.bootstrap().await;

        // First scan right away instead of waiting out the first tick.
        self.start_crawlers(&results_tx).await;

        let start = tokio::time::Instant::now();
        let mut crawl_tick = tokio::time::interval_at(start + CRAWL_DELAY, CRAWL_DELAY);
        let mut dns_tick = tokio::time::interval_at(start + DNS_DELAY, DNS_DELAY);
        let mut audit_tick = tokio::time::interval_at(start + AUDIT_DELAY, AUDIT_DELAY);

        loop {
            tokio::select! {
                Some(result) = results_rx.recv() => self.process_result(result).await,
                _ = crawl_tick.tick() => self.start_crawlers(&results_tx).await,
                _ = dns_tick.tick() => self.load_dns().await,
                _ = audit_tick.tick() => self.audit_nodes().await,
                _ = shutdown.changed() => break,
            }
        }

        info!("shutting down seeder: {}", self.config.name);
    }
}
