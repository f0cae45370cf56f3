//! KRPC message model and wire codec (BEP-5).
//!
//! Queries, replies and errors are bencoded dictionaries over UDP. This
//! module is pure data: the socket handling lives in [`crate::transport`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use rand::RngCore;

use crate::bencode::{self, BencodeError, Value};

pub const ID_LEN: usize = 20;

/// v4 compact node info: 20-byte id + 4-byte address + 2-byte port.
const COMPACT_NODE_V4: usize = 26;
/// v6 compact node info: 20-byte id + 16-byte address + 2-byte port.
const COMPACT_NODE_V6: usize = 38;

/// A 20-byte DHT node identifier. Proximity is XOR distance.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub [u8; ID_LEN]);

impl NodeId {
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    /// Derives an id that sits right next to `self` in XOR space: the first
    /// 15 bytes are copied, the last 5 are random. Sending with such an id
    /// makes the remote treat us as one of its closest neighbours, which is
    /// what draws get_peers and announce_peer traffic our way.
    pub fn forge_neighbour(&self) -> Self {
        let mut bytes = self.0;
        rand::thread_rng().fill_bytes(&mut bytes[15..]);
        NodeId(bytes)
    }

    pub fn xor_distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(self.0))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId([0u8; ID_LEN])
    }
}

/// SHA-1 of a torrent's bencoded `info` dictionary.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; ID_LEN]);

impl InfoHash {
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; ID_LEN] = bytes.try_into().ok()?;
        Some(InfoHash(bytes))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", hex::encode(self.0))
    }
}

/// One entry of a compact node list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: InfoHash,
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: InfoHash,
        port: u16,
        implied_port: bool,
        token: Vec<u8>,
    },
    /// A method we do not serve. Kept so the transport can count-and-drop
    /// instead of treating it as a malformed packet.
    Unknown {
        method: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    pub id: NodeId,
    pub nodes: Vec<NodeInfo>,
    pub nodes6: Vec<NodeInfo>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

impl Reply {
    pub fn with_id(id: NodeId) -> Self {
        Reply {
            id,
            ..Reply::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Query { t: Vec<u8>, query: Query },
    Reply { t: Vec<u8>, reply: Reply },
    Error { t: Vec<u8>, code: i64, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KrpcError {
    #[error("bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("message is not a dictionary")]
    NotADict,
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("invalid field: {0}")]
    InvalidField(&'static str),
    #[error("unknown message type")]
    UnknownType,
    #[error("compact node blob has a truncated tail")]
    TruncatedCompact,
}

impl Message {
    pub fn decode(raw: &[u8]) -> Result<Message, KrpcError> {
        let value = bencode::decode(raw)?;
        if value.as_dict().is_none() {
            return Err(KrpcError::NotADict);
        }
        let t = value
            .dict_get_bytes(b"t")
            .ok_or(KrpcError::MissingField("t"))?
            .to_vec();
        match value.dict_get_bytes(b"y") {
            Some(b"q") => decode_query(&value).map(|query| Message::Query { t, query }),
            Some(b"r") => decode_reply(&value).map(|reply| Message::Reply { t, reply }),
            Some(b"e") => {
                let list = value
                    .dict_get(b"e")
                    .and_then(Value::as_list)
                    .ok_or(KrpcError::MissingField("e"))?;
                let code = list
                    .first()
                    .and_then(Value::as_int)
                    .ok_or(KrpcError::InvalidField("e"))?;
                let message = list
                    .get(1)
                    .and_then(Value::as_bytes)
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                    .unwrap_or_default();
                Ok(Message::Error { t, code, message })
            }
            _ => Err(KrpcError::UnknownType),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let value = match self {
            Message::Query { t, query } => encode_query(t, query),
            Message::Reply { t, reply } => encode_reply(t, reply),
            Message::Error { t, code, message } => Value::Dict(vec![
                (
                    b"e".to_vec(),
                    Value::List(vec![
                        Value::Int(*code),
                        Value::Bytes(message.as_bytes().to_vec()),
                    ]),
                ),
                (b"t".to_vec(), Value::Bytes(t.clone())),
                (b"y".to_vec(), Value::Bytes(b"e".to_vec())),
            ]),
        };
        bencode::encode(&value)
    }
}

fn decode_query(value: &Value) -> Result<Query, KrpcError> {
    let method = value
        .dict_get_bytes(b"q")
        .ok_or(KrpcError::MissingField("q"))?;
    let args = value
        .dict_get(b"a")
        .ok_or(KrpcError::MissingField("a"))?;
    let id = node_id(args, b"id")?;

    match method {
        b"ping" => Ok(Query::Ping { id }),
        b"find_node" => Ok(Query::FindNode {
            id,
            target: node_id(args, b"target")?,
        }),
        b"get_peers" => Ok(Query::GetPeers {
            id,
            info_hash: info_hash(args)?,
        }),
        b"announce_peer" => {
            let port = args
                .dict_get_int(b"port")
                .ok_or(KrpcError::MissingField("port"))?;
            if !(0..=u16::MAX as i64).contains(&port) {
                return Err(KrpcError::InvalidField("port"));
            }
            let implied_port = args.dict_get_int(b"implied_port").unwrap_or(0) != 0;
            let token = args
                .dict_get_bytes(b"token")
                .ok_or(KrpcError::MissingField("token"))?
                .to_vec();
            Ok(Query::AnnouncePeer {
                id,
                info_hash: info_hash(args)?,
                port: port as u16,
                implied_port,
                token,
            })
        }
        other => Ok(Query::Unknown {
            method: other.to_vec(),
        }),
    }
}

fn decode_reply(value: &Value) -> Result<Reply, KrpcError> {
    let body = value
        .dict_get(b"r")
        .ok_or(KrpcError::MissingField("r"))?;
    let id = node_id(body, b"id")?;

    let nodes = match body.dict_get_bytes(b"nodes") {
        Some(blob) => parse_compact_nodes(blob, false)?,
        None => Vec::new(),
    };
    let nodes6 = match body.dict_get_bytes(b"nodes6") {
        Some(blob) => parse_compact_nodes(blob, true)?,
        None => Vec::new(),
    };

    let mut values = Vec::new();
    if let Some(list) = body.dict_get(b"values").and_then(Value::as_list) {
        for entry in list {
            // Mixed-quality peers lists are common in the wild; skip entries
            // of the wrong width instead of refusing the reply.
            if let Some(peer) = entry.as_bytes().and_then(parse_compact_peer) {
                values.push(peer);
            }
        }
    }

    Ok(Reply {
        id,
        nodes,
        nodes6,
        values,
        token: body.dict_get_bytes(b"token").map(<[u8]>::to_vec),
    })
}

fn encode_query(t: &[u8], query: &Query) -> Value {
    let (method, args): (&[u8], Vec<(Vec<u8>, Value)>) = match query {
        Query::Ping { id } => (b"ping", vec![(b"id".to_vec(), bytes20(&id.0))]),
        Query::FindNode { id, target } => (
            b"find_node",
            vec![
                (b"id".to_vec(), bytes20(&id.0)),
                (b"target".to_vec(), bytes20(&target.0)),
            ],
        ),
        Query::GetPeers { id, info_hash } => (
            b"get_peers",
            vec![
                (b"id".to_vec(), bytes20(&id.0)),
                (b"info_hash".to_vec(), bytes20(&info_hash.0)),
            ],
        ),
        Query::AnnouncePeer {
            id,
            info_hash,
            port,
            implied_port,
            token,
        } => (
            b"announce_peer",
            vec![
                (b"id".to_vec(), bytes20(&id.0)),
                (b"implied_port".to_vec(), Value::Int(*implied_port as i64)),
                (b"info_hash".to_vec(), bytes20(&info_hash.0)),
                (b"port".to_vec(), Value::Int(*port as i64)),
                (b"token".to_vec(), Value::Bytes(token.clone())),
            ],
        ),
        Query::Unknown { method } => (method.as_slice(), Vec::new()),
    };

    Value::Dict(vec![
        (b"a".to_vec(), Value::Dict(args)),
        (b"q".to_vec(), Value::Bytes(method.to_vec())),
        (b"t".to_vec(), Value::Bytes(t.to_vec())),
        (b"y".to_vec(), Value::Bytes(b"q".to_vec())),
    ])
}

fn encode_reply(t: &[u8], reply: &Reply) -> Value {
    let mut body = vec![(b"id".to_vec(), bytes20(&reply.id.0))];
    if !reply.nodes.is_empty() {
        body.push((b"nodes".to_vec(), Value::Bytes(encode_compact_nodes(&reply.nodes))));
    }
    if !reply.nodes6.is_empty() {
        body.push((
            b"nodes6".to_vec(),
            Value::Bytes(encode_compact_nodes(&reply.nodes6)),
        ));
    }
    if let Some(token) = &reply.token {
        body.push((b"token".to_vec(), Value::Bytes(token.clone())));
    }
    if !reply.values.is_empty() {
        body.push((
            b"values".to_vec(),
            Value::List(
                reply
                    .values
                    .iter()
                    .map(|peer| Value::Bytes(encode_compact_peer(peer)))
                    .collect(),
            ),
        ));
    }

    Value::Dict(vec![
        (b"r".to_vec(), Value::Dict(body)),
        (b"t".to_vec(), Value::Bytes(t.to_vec())),
        (b"y".to_vec(), Value::Bytes(b"r".to_vec())),
    ])
}

/// Parses a concatenation of fixed-width compact node entries. A blob whose
/// length is not a multiple of the entry width is rejected outright: a
/// truncated tail means the sender framed the message wrong, and keeping the
/// leading entries would hide that.
pub fn parse_compact_nodes(blob: &[u8], v6: bool) -> Result<Vec<NodeInfo>, KrpcError> {
    let width = if v6 { COMPACT_NODE_V6 } else { COMPACT_NODE_V4 };
    if blob.len() % width != 0 {
        return Err(KrpcError::TruncatedCompact);
    }
    let mut out = Vec::with_capacity(blob.len() / width);
    for entry in blob.chunks_exact(width) {
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&entry[..ID_LEN]);
        let ip: IpAddr = if v6 {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&entry[ID_LEN..ID_LEN + 16]);
            Ipv6Addr::from(octets).into()
        } else {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&entry[ID_LEN..ID_LEN + 4]);
            Ipv4Addr::from(octets).into()
        };
        let port = u16::from_be_bytes([entry[width - 2], entry[width - 1]]);
        out.push(NodeInfo {
            id: NodeId(id),
            addr: SocketAddr::new(ip, port),
        });
    }
    Ok(out)
}

pub fn encode_compact_nodes(nodes: &[NodeInfo]) -> Vec<u8> {
    let mut out = Vec::new();
    for node in nodes {
        out.extend_from_slice(&node.id.0);
        match node.addr.ip() {
            IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
        }
        out.extend_from_slice(&node.addr.port().to_be_bytes());
    }
    out
}

/// A compact peer is 6 bytes (v4) or 18 bytes (v6).
pub fn parse_compact_peer(bytes: &[u8]) -> Option<SocketAddr> {
    match bytes.len() {
        6 => {
            let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
            let port = u16::from_be_bytes([bytes[4], bytes[5]]);
            Some(SocketAddr::new(IpAddr::V4(ip), port))
        }
        18 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            let port = u16::from_be_bytes([bytes[16], bytes[17]]);
            Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

pub fn encode_compact_peer(addr: &SocketAddr) -> Vec<u8> {
    let mut out = Vec::new();
    match addr.ip() {
        IpAddr::V4(ip) => out.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => out.extend_from_slice(&ip.octets()),
    }
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

fn node_id(args: &Value, key: &'static [u8]) -> Result<NodeId, KrpcError> {
    let bytes = args.dict_get_bytes(key).ok_or(KrpcError::MissingField("id"))?;
    let bytes: [u8; ID_LEN] = bytes
        .try_into()
        .map_err(|_| KrpcError::InvalidField("id"))?;
    Ok(NodeId(bytes))
}

fn info_hash(args: &Value) -> Result<InfoHash, KrpcError> {
    let bytes = args
        .dict_get_bytes(b"info_hash")
        .ok_or(KrpcError::MissingField("info_hash"))?;
    InfoHash::from_slice(bytes).ok_or(KrpcError::InvalidField("info_hash"))
}

fn bytes20(bytes: &[u8; ID_LEN]) -> Value {
    Value::Bytes(bytes.to_vec())
}
