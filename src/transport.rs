//! UDP transport for one indexing node: frames outgoing KRPC messages,
//! demultiplexes inbound replies by transaction id, applies the address
//! policy in both directions.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::time::Instant;

use crate::krpc::{Message, Query, Reply};
use crate::policy::AddrPolicy;
use crate::stats::Stats;

/// A pending query expires when its reply has not arrived within this window.
pub const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// Outstanding-query bound; at the storm rate this is minutes of backlog.
const MAX_PENDING: usize = 1024;

const RECV_BUF: usize = 4096;

/// Outgoing transaction ids are two random bytes, matched byte-exact on the
/// way back.
pub type TxId = [u8; 2];

#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub addr: SocketAddr,
    pub sent_at: Instant,
}

#[derive(Debug)]
pub enum Inbound {
    Query {
        t: Vec<u8>,
        query: Query,
        from: SocketAddr,
    },
    Reply {
        reply: Reply,
        pending: PendingQuery,
        from: SocketAddr,
    },
}

pub struct KrpcSocket {
    socket: UdpSocket,
    policy: Arc<AddrPolicy>,
    pending: Mutex<HashMap<TxId, PendingQuery>>,
    stats: Arc<Stats>,
}

impl KrpcSocket {
    pub async fn bind(
        addr: &str,
        policy: Arc<AddrPolicy>,
        stats: Arc<Stats>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(KrpcSocket {
            socket,
            policy,
            pending: Mutex::new(HashMap::new()),
            stats,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn policy(&self) -> &AddrPolicy {
        &self.policy
    }

    /// Sends a query under a fresh random transaction id, registering it for
    /// reply matching.
    pub async fn send_query(&self, query: Query, to: SocketAddr) -> io::Result<()> {
        if !self.policy.allows(to) {
            Stats::bump(&self.stats.policy_drops);
            return Ok(());
        }
        let t = self.register(to);
        let wire = Message::Query {
            t: t.to_vec(),
            query,
        }
        .encode();
        self.socket.send_to(&wire, to).await?;
        Ok(())
    }

    /// Sends a reply echoing the query's transaction id.
    pub async fn send_reply(&self, t: &[u8], reply: Reply, to: SocketAddr) -> io::Result<()> {
        if !self.policy.allows(to) {
            Stats::bump(&self.stats.policy_drops);
            return Ok(());
        }
        let wire = Message::Reply {
            t: t.to_vec(),
            reply,
        }
        .encode();
        self.socket.send_to(&wire, to).await?;
        Ok(())
    }

    /// Receives the next dispatchable message. Malformed packets, policy
    /// violations, KRPC errors and unmatched replies are counted and
    /// swallowed. `None` means the socket is gone and the node should stop.
    pub async fn recv(&self) -> Option<Inbound> {
        let mut buf = [0u8; RECV_BUF];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                // ICMP port-unreachable surfaces as a read error on some
                // platforms; the socket itself is still usable.
                Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {
                    Stats::bump(&self.stats.benign_drops);
                    continue;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => {
                    tracing::warn!(%err, "krpc socket read failed; stopping node");
                    return None;
                }
            };

            if !self.policy.allows(from) {
                Stats::bump(&self.stats.policy_drops);
                continue;
            }

            let message = match Message::decode(&buf[..len]) {
                Ok(message) => message,
                Err(err) => {
                    tracing::trace!(%err, %from, "dropping malformed packet");
                    Stats::bump(&self.stats.benign_drops);
                    continue;
                }
            };

            match message {
                Message::Query { t, query } => {
                    if let Query::Unknown { method } = &query {
                        tracing::trace!(method = %String::from_utf8_lossy(method), %from, "unknown query method");
                        Stats::bump(&self.stats.benign_drops);
                        continue;
                    }
                    return Some(Inbound::Query { t, query, from });
                }
                Message::Reply { t, reply } => {
                    let Some(pending) = self.take_pending(&t, from) else {
                        Stats::bump(&self.stats.benign_drops);
                        continue;
                    };
                    return Some(Inbound::Reply {
                        reply,
                        pending,
                        from,
                    });
                }
                Message::Error { t, code, message } => {
                    if self.take_pending(&t, from).is_some() {
                        tracing::trace!(code, message = %message, %from, "krpc error reply");
                    }
                    Stats::bump(&self.stats.benign_drops);
                    continue;
                }
            }
        }
    }

    fn register(&self, addr: SocketAddr) -> TxId {
        let mut pending = self.pending.lock().unwrap();
        let now = Instant::now();
        pending.retain(|_, query| now.duration_since(query.sent_at) <= QUERY_TIMEOUT);
        if pending.len() >= MAX_PENDING {
            if let Some(oldest) = pending
                .iter()
                .min_by_key(|(_, query)| query.sent_at)
                .map(|(t, _)| *t)
            {
                pending.remove(&oldest);
                Stats::bump(&self.stats.timeouts);
            }
        }

        let mut rng = rand::thread_rng();
        loop {
            let mut t = [0u8; 2];
            rng.fill_bytes(&mut t);
            if !pending.contains_key(&t) {
                pending.insert(t, PendingQuery { addr, sent_at: now });
                return t;
            }
        }
    }

    /// Matches a reply against its pending query. Expired or unknown
    /// transaction ids, and replies arriving from a different address than
    /// the query went to, do not match.
    fn take_pending(&self, t: &[u8], from: SocketAddr) -> Option<PendingQuery> {
        let t: TxId = t.try_into().ok()?;
        let mut pending = self.pending.lock().unwrap();
        let query = pending.get(&t)?;
        if Instant::now().duration_since(query.sent_at) > QUERY_TIMEOUT {
            pending.remove(&t);
            Stats::bump(&self.stats.timeouts);
            return None;
        }
        if query.addr != from {
            return None;
        }
        pending.remove(&t)
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
