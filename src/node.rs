//! The neighbour-harvesting indexing node.
//!
//! One node owns one UDP socket and runs a continuous FIND_NODE storm over a
//! bounded pool of recently-seen peers. For every packet it sends, the sender
//! id is forged to sit next to the addressee in XOR space, which makes remote
//! nodes route their get_peers and announce_peer traffic here. Those queries
//! are the harvest: every one discloses an infohash.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use rand::RngCore;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::krpc::{InfoHash, NodeId, NodeInfo, Query, Reply};
use crate::stats::Stats;
use crate::transport::{Inbound, KrpcSocket};

const STORM_INTERVAL: Duration = Duration::from_secs(1);

/// How many pooled nodes a get_peers reply discloses.
const K_CLOSEST: usize = 8;

/// What a node hands to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Someone asked us for peers: the infohash exists and is being looked up.
    Interest { info_hash: InfoHash },
    /// Someone claims to be downloading this torrent at `peer`.
    Announce {
        info_hash: InfoHash,
        peer: SocketAddr,
    },
}

/// Insertion-ordered pool of DHT nodes learned from reply payloads,
/// evict-oldest at the configured bound. No k-buckets: the storm does not
/// need routing correctness, only a steady supply of fresh addresses.
struct NeighbourRing {
    order: VecDeque<NodeInfo>,
    seen: HashSet<SocketAddr>,
    capacity: usize,
}

impl NeighbourRing {
    fn new(capacity: usize) -> Self {
        NeighbourRing {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, node: NodeInfo) {
        if !self.seen.insert(node.addr) {
            return;
        }
        self.order.push_back(node);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old.addr);
            }
        }
    }

    /// Rotates the next node to the back and returns a copy of it.
    fn rotate(&mut self) -> Option<NodeInfo> {
        let node = self.order.pop_front()?;
        self.order.push_back(node);
        Some(node)
    }

    /// Up to `limit` pooled nodes, nearest to `target` first.
    fn closest_to(&self, target: &NodeId, limit: usize) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.order.iter().copied().collect();
        nodes.sort_by_key(|node| node.id.xor_distance(target));
        nodes.truncate(limit);
        nodes
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub struct IndexingNode {
    socket: KrpcSocket,
    neighbours: NeighbourRing,
    bootstrap: Vec<SocketAddr>,
    observations: mpsc::Sender<Observation>,
    stats: Arc<Stats>,
}

impl IndexingNode {
    pub fn new(
        socket: KrpcSocket,
        bootstrap: Vec<SocketAddr>,
        max_neighbours: usize,
        observations: mpsc::Sender<Observation>,
        stats: Arc<Stats>,
    ) -> Self {
        IndexingNode {
            socket,
            neighbours: NeighbourRing::new(max_neighbours),
            bootstrap,
            observations,
            stats,
        }
    }

    /// Drives the node until shutdown or a fatal socket error. All
    /// suspension happens on the ticker, the socket, and the observation
    /// channel.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        if let Ok(addr) = self.socket.local_addr() {
            tracing::info!(bind = %addr, "indexing node up");
        }

        let mut ticker = interval(STORM_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            enum Event {
                Storm,
                Inbound(Option<Inbound>),
                Shutdown,
            }

            let event = tokio::select! {
                _ = ticker.tick() => Event::Storm,
                inbound = self.socket.recv() => Event::Inbound(inbound),
                _ = shutdown.changed() => Event::Shutdown,
            };

            match event {
                Event::Storm => self.storm_tick().await,
                Event::Inbound(Some(inbound)) => {
                    if !self.handle_inbound(inbound).await {
                        break;
                    }
                }
                Event::Inbound(None) => {
                    tracing::warn!("indexing node socket closed");
                    break;
                }
                Event::Shutdown => break,
            }
        }

        tracing::debug!("indexing node stopped");
    }

    /// One burst of FIND_NODEs. With an empty pool we fall back to the
    /// bootstrap addresses, which also covers re-joining after the pool
    /// drains (bootstrap replies refill it).
    async fn storm_tick(&mut self) {
        if self.neighbours.is_empty() {
            for &addr in &self.bootstrap {
                let target = NodeId::random();
                let query = Query::FindNode {
                    id: target.forge_neighbour(),
                    target,
                };
                if let Err(err) = self.socket.send_query(query, addr).await {
                    tracing::debug!(%err, %addr, "bootstrap find_node failed");
                }
            }
            return;
        }

        let burst = self.neighbours.len();
        for _ in 0..burst {
            let Some(node) = self.neighbours.rotate() else {
                break;
            };
            let query = Query::FindNode {
                id: node.id.forge_neighbour(),
                target: NodeId::random(),
            };
            if let Err(err) = self.socket.send_query(query, node.addr).await {
                tracing::debug!(%err, addr = %node.addr, "find_node failed");
            }
        }
    }

    /// Returns false when the node should stop (observation channel gone).
    async fn handle_inbound(&mut self, inbound: Inbound) -> bool {
        match inbound {
            Inbound::Reply { reply, .. } => {
                for node in reply.nodes.into_iter().chain(reply.nodes6) {
                    if self.socket.policy().allows(node.addr) {
                        self.neighbours.push(node);
                    }
                }
                true
            }
            Inbound::Query { t, query, from } => self.handle_query(&t, query, from).await,
        }
    }

    async fn handle_query(&mut self, t: &[u8], query: Query, from: SocketAddr) -> bool {
        match query {
            Query::Ping { id } => {
                self.reply(t, Reply::with_id(id.forge_neighbour()), from).await;
            }
            Query::FindNode { id, .. } => {
                // We are not here to serve lookups; an empty nodes list is a
                // legal reply and keeps the conversation going.
                self.reply(t, Reply::with_id(id.forge_neighbour()), from).await;
            }
            Query::GetPeers { id, info_hash } => {
                // No peers to serve, but a token and a few close nodes keep
                // the asker engaged (and announcing back to us).
                let mut reply = Reply::with_id(id.forge_neighbour());
                reply.token = Some(random_token());
                let close = self
                    .neighbours
                    .closest_to(&NodeId(info_hash.0), K_CLOSEST);
                for node in close {
                    if node.addr.is_ipv4() {
                        reply.nodes.push(node);
                    } else {
                        reply.nodes6.push(node);
                    }
                }
                self.reply(t, reply, from).await;
                return self
                    .observe(Observation::Interest { info_hash })
                    .await;
            }
            Query::AnnouncePeer {
                id,
                info_hash,
                port,
                implied_port,
                token,
            } => {
                // Deliberately permissive: any non-empty token is accepted.
                // Harvesting wants maximum announce volume, and we never
                // handed out state worth protecting with a real token.
                if token.is_empty() {
                    Stats::bump(&self.stats.benign_drops);
                    return true;
                }
                self.reply(t, Reply::with_id(id.forge_neighbour()), from).await;

                let peer_port = if implied_port { from.port() } else { port };
                let peer = SocketAddr::new(from.ip(), peer_port);
                if !self.socket.policy().allows_announce(peer) {
                    Stats::bump(&self.stats.policy_drops);
                    return true;
                }
                return self
                    .observe(Observation::Announce { info_hash, peer })
                    .await;
            }
            Query::Unknown { .. } => {
                // The transport filters these; nothing to do if one slips by.
                Stats::bump(&self.stats.benign_drops);
            }
        }
        true
    }

    async fn reply(&self, t: &[u8], reply: Reply, to: SocketAddr) {
        if let Err(err) = self.socket.send_reply(t, reply, to).await {
            tracing::debug!(%err, %to, "reply failed");
        }
    }

    async fn observe(&self, observation: Observation) -> bool {
        self.observations.send(observation).await.is_ok()
    }
}

fn random_token() -> Vec<u8> {
    let mut token = vec![0u8; 4];
    rand::thread_rng().fill_bytes(&mut token);
    token
}
