//! Crawler configuration.
//!
//! Everything has a code default so `Config::default()` is usable directly
//! from tests and embedding code; `Config::load()` layers `DRIFTNET_*`
//! environment variables (and a `.env` file, if present) on top.

use crate::policy::IpFamily;

#[derive(Debug, Clone)]
pub struct Config {
    /// One UDP bind per indexing node.
    pub bind_addresses: Vec<String>,
    /// Per-node neighbour pool bound.
    pub max_neighbours: usize,
    /// Hostnames resolved at startup to join the DHT.
    pub bootstrap_hosts: Vec<String>,
    /// Subnets whose traffic and announces are ignored.
    pub cidr_denylist: Vec<String>,
    /// v4-only / v6-only / both.
    pub ip_family: IpFamily,
    /// Initial output channel capacity (it grows under pressure).
    pub chan_size: usize,
    /// Emitted-infohash dedup window.
    pub dedup_capacity: usize,
    /// Hard cap on concurrently running metadata leeches.
    pub max_leeches: usize,
    /// Recently-completed window in the metadata sink.
    pub completed_lru: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addresses: vec!["0.0.0.0:0".to_string()],
            max_neighbours: 10,
            bootstrap_hosts: vec![
                "router.bittorrent.com:6881".to_string(),
                "dht.transmissionbt.com:6881".to_string(),
                "router.utorrent.com:6881".to_string(),
            ],
            cidr_denylist: Vec::new(),
            ip_family: IpFamily::Both,
            chan_size: 20,
            dedup_capacity: 1 << 14,
            max_leeches: 1000,
            completed_lru: 1024,
        }
    }
}

impl Config {
    /// Process env > `.env` file > code defaults.
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_env()
    }

    fn from_env() -> anyhow::Result<Self> {
        let defaults = Config::default();

        let ip_family = match env_opt_string("DRIFTNET_IP_FAMILY") {
            Some(raw) => raw
                .parse::<IpFamily>()
                .map_err(|err| anyhow::anyhow!("parse DRIFTNET_IP_FAMILY: {err}"))?,
            None => defaults.ip_family,
        };

        Ok(Config {
            bind_addresses: env_csv_strings("DRIFTNET_BIND", &defaults.bind_addresses),
            max_neighbours: env_usize("DRIFTNET_MAX_NEIGHBOURS", defaults.max_neighbours),
            bootstrap_hosts: env_csv_strings("DRIFTNET_BOOTSTRAP", &defaults.bootstrap_hosts),
            cidr_denylist: env_csv_strings("DRIFTNET_CIDR_DENYLIST", &[]),
            ip_family,
            chan_size: env_usize("DRIFTNET_CHAN_SIZE", defaults.chan_size),
            dedup_capacity: env_usize("DRIFTNET_DEDUP_CAPACITY", defaults.dedup_capacity),
            max_leeches: env_usize("DRIFTNET_MAX_LEECHES", defaults.max_leeches),
            completed_lru: env_usize("DRIFTNET_COMPLETED_LRU", defaults.completed_lru),
        })
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_csv_strings(name: &str, defaults: &[String]) -> Vec<String> {
    if let Some(s) = env_opt_string(name) {
        let values: Vec<String> = s
            .split(',')
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect();
        if !values.is_empty() {
            return values;
        }
    }
    defaults.to_vec()
}
