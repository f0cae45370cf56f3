//! The manager: owns the indexing nodes and the metadata sink, deduplicates
//! observations, enforces the address policy, and exposes the single output
//! stream of verified results.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

use crate::config::Config;
use crate::dedup::BoundedSet;
use crate::krpc::InfoHash;
use crate::leech::{self, IndexingResult, MetadataRequest, SinkConfig};
use crate::node::{IndexingNode, Observation};
use crate::output::ResultChannel;
use crate::policy::AddrPolicy;
use crate::stats::Stats;
use crate::transport::KrpcSocket;

const OBSERVATION_BACKLOG: usize = 256;
const RESULT_BACKLOG: usize = 64;
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(30);

pub struct Manager {
    output: Arc<ResultChannel>,
    stats: Arc<Stats>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    terminated: AtomicBool,
    local_addrs: Vec<SocketAddr>,
}

impl Manager {
    /// Binds one indexing node per configured address and starts crawling.
    /// A bind failure at startup is fatal; everything after that is
    /// best-effort.
    pub async fn new(config: Config) -> anyhow::Result<Manager> {
        let policy = Arc::new(
            AddrPolicy::parse(config.ip_family, &config.cidr_denylist)
                .context("parse cidr denylist")?,
        );
        let stats = Arc::new(Stats::default());
        let output = Arc::new(ResultChannel::new(config.chan_size));

        let bootstrap = resolve_bootstrap(&config.bootstrap_hosts, &policy).await;
        if bootstrap.is_empty() && !config.bootstrap_hosts.is_empty() {
            tracing::warn!("no bootstrap host resolved; relying on inbound traffic");
        }

        let (observation_tx, observation_rx) = mpsc::channel(OBSERVATION_BACKLOG);
        let (request_tx, request_rx) = mpsc::channel(OBSERVATION_BACKLOG);
        let (result_tx, result_rx) = mpsc::channel(RESULT_BACKLOG);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();
        let mut local_addrs = Vec::new();
        for bind in &config.bind_addresses {
            let socket = KrpcSocket::bind(bind, policy.clone(), stats.clone())
                .await
                .with_context(|| format!("bind indexing node to {bind}"))?;
            local_addrs.push(socket.local_addr().context("local addr")?);
            let node = IndexingNode::new(
                socket,
                bootstrap.clone(),
                config.max_neighbours,
                observation_tx.clone(),
                stats.clone(),
            );
            tasks.push(tokio::spawn(node.run(shutdown_rx.clone())));
        }
        drop(observation_tx);

        tasks.push(tokio::spawn(leech::run(
            request_rx,
            result_tx,
            SinkConfig {
                max_leeches: config.max_leeches,
                completed_lru: config.completed_lru,
            },
            stats.clone(),
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(supervise(
            observation_rx,
            result_rx,
            request_tx,
            output.clone(),
            policy,
            config.dedup_capacity,
            stats.clone(),
            shutdown_rx,
        )));

        tracing::info!(
            nodes = local_addrs.len(),
            bootstrap = bootstrap.len(),
            "crawler started"
        );

        Ok(Manager {
            output,
            stats,
            shutdown: shutdown_tx,
            tasks: Mutex::new(tasks),
            terminated: AtomicBool::new(false),
            local_addrs,
        })
    }

    /// Next verified result, or `None` once terminated and drained. Distinct
    /// infohashes arrive in completion order; duplicates within the dedup
    /// window are never delivered twice.
    pub async fn recv(&self) -> Option<IndexingResult> {
        self.output.recv().await
    }

    /// The bound addresses of the indexing nodes, in configuration order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Stops every node and leech, waits for them, then closes the output
    /// channel so pending results can still be drained. Idempotent.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        self.output.close();
        tracing::info!("crawler terminated");
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        self.output.close();
    }
}

async fn resolve_bootstrap(hosts: &[String], policy: &AddrPolicy) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for host in hosts {
        match tokio::net::lookup_host(host).await {
            Ok(addrs) => out.extend(addrs.filter(|addr| policy.allows(*addr))),
            Err(err) => {
                tracing::debug!(%err, host = %host, "bootstrap resolve failed");
            }
        }
    }
    out
}

/// Fan-in loop between the nodes, the sink and the output channel. The dedup
/// window is updated on emission only, so a failed leech leaves its infohash
/// eligible for the next announce.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    mut observations: mpsc::Receiver<Observation>,
    mut results: mpsc::Receiver<IndexingResult>,
    requests: mpsc::Sender<MetadataRequest>,
    output: Arc<ResultChannel>,
    policy: Arc<AddrPolicy>,
    dedup_capacity: usize,
    stats: Arc<Stats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut emitted: BoundedSet<InfoHash> = BoundedSet::new(dedup_capacity);
    let mut housekeeping = interval(HOUSEKEEPING_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = housekeeping.tick() => {
                stats
                    .results_dropped
                    .store(output.dropped(), Ordering::Relaxed);
                stats.log_summary();
            }
            observation = observations.recv() => {
                let Some(observation) = observation else { break };
                handle_observation(observation, &emitted, &policy, &requests, &stats);
            }
            result = results.recv() => {
                let Some(result) = result else { break };
                if !emitted.insert(result.info_hash) {
                    Stats::bump(&stats.dedup_drops);
                    continue;
                }
                Stats::bump(&stats.results_emitted);
                if !output.push(result) {
                    break;
                }
            }
        }
    }
}

fn handle_observation(
    observation: Observation,
    emitted: &BoundedSet<InfoHash>,
    policy: &AddrPolicy,
    requests: &mpsc::Sender<MetadataRequest>,
    stats: &Stats,
) {
    match observation {
        Observation::Interest { info_hash } => {
            if !emitted.contains(&info_hash) {
                tracing::trace!(hash = %info_hash, "infohash sighted");
            }
        }
        Observation::Announce { info_hash, peer } => {
            if emitted.contains(&info_hash) {
                Stats::bump(&stats.dedup_drops);
                return;
            }
            if !policy.allows_announce(peer) {
                Stats::bump(&stats.policy_drops);
                return;
            }
            // The supervisor must never suspend on the sink: shed instead.
            match requests.try_send(MetadataRequest { info_hash, peer }) {
                Ok(()) => {
                    tracing::debug!(hash = %info_hash, peer = %peer, "leech scheduled");
                }
                Err(_) => Stats::bump(&stats.leeches_shed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            bind_addresses: vec!["127.0.0.1:0".to_string()],
            bootstrap_hosts: Vec::new(),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn starts_and_terminates() {
        let manager = Manager::new(test_config()).await.unwrap();
        assert_eq!(manager.local_addrs().len(), 1);
        manager.terminate().await;
        assert!(manager.recv().await.is_none());
        // Idempotent.
        manager.terminate().await;
    }

    #[tokio::test]
    async fn bind_failure_is_fatal() {
        let config = Config {
            bind_addresses: vec!["127.0.0.1:99999".to_string()],
            bootstrap_hosts: Vec::new(),
            ..Config::default()
        };
        assert!(Manager::new(config).await.is_err());
    }

    #[tokio::test]
    async fn bad_denylist_is_fatal() {
        let config = Config {
            cidr_denylist: vec!["10.0.0.0/64".to_string()],
            bootstrap_hosts: Vec::new(),
            ..test_config()
        };
        assert!(Manager::new(config).await.is_err());
    }

    #[tokio::test]
    async fn denylisted_announce_never_reaches_the_sink() {
        let policy = AddrPolicy::parse(
            crate::policy::IpFamily::Both,
            &["10.0.0.0/8".to_string()],
        )
        .unwrap();
        let emitted = BoundedSet::new(16);
        let stats = Stats::default();
        let (request_tx, mut request_rx) = mpsc::channel(4);

        handle_observation(
            Observation::Announce {
                info_hash: InfoHash([0xbb; 20]),
                peer: "10.1.2.3:6881".parse().unwrap(),
            },
            &emitted,
            &policy,
            &request_tx,
            &stats,
        );

        assert!(request_rx.try_recv().is_err());
        assert_eq!(Stats::get(&stats.policy_drops), 1);
    }

    #[tokio::test]
    async fn emitted_infohash_suppresses_new_leeches() {
        let policy = AddrPolicy::default();
        let mut emitted = BoundedSet::new(16);
        emitted.insert(InfoHash([0xaa; 20]));
        let stats = Stats::default();
        let (request_tx, mut request_rx) = mpsc::channel(4);

        handle_observation(
            Observation::Announce {
                info_hash: InfoHash([0xaa; 20]),
                peer: "192.0.2.5:6881".parse().unwrap(),
            },
            &emitted,
            &policy,
            &request_tx,
            &stats,
        );
        assert!(request_rx.try_recv().is_err());
        assert_eq!(Stats::get(&stats.dedup_drops), 1);

        // A fresh infohash from the same peer passes.
        handle_observation(
            Observation::Announce {
                info_hash: InfoHash([0xab; 20]),
                peer: "192.0.2.5:6881".parse().unwrap(),
            },
            &emitted,
            &policy,
            &request_tx,
            &stats,
        );
        assert_eq!(
            request_rx.try_recv().unwrap(),
            MetadataRequest {
                info_hash: InfoHash([0xab; 20]),
                peer: "192.0.2.5:6881".parse().unwrap(),
            }
        );
    }
}
