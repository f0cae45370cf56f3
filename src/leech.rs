//! The metadata sink: one-shot BitTorrent sessions that fetch the bencoded
//! `info` dictionary for an announced infohash (BEP-9 over BEP-10) and emit
//! verified [`IndexingResult`]s.
//!
//! Each admitted `(infohash, peer)` pair becomes its own task; a failure is
//! confined to that task and the peer is not blacklisted. At most one leech
//! runs per infohash at any time.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{timeout, Duration};

use crate::bencode::{self, BencodeError, Value};
use crate::dedup::BoundedSet;
use crate::krpc::InfoHash;
use crate::metainfo::{self, FileEntry, MetainfoError};
use crate::stats::Stats;

/// Peers declaring a bigger info dict than this are lying or hostile.
pub const MAX_METADATA_SIZE: usize = 10 * 1024 * 1024;
/// Fixed ut_metadata piece size (BEP-9).
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_PIPELINED: usize = 4;
/// Frames above this are not a plausible BitTorrent message in this exchange.
const MAX_FRAME: usize = 2 * 1024 * 1024;

const PSTR: &[u8; 19] = b"BitTorrent protocol";
const HANDSHAKE_LEN: usize = 68;
const EXTENSION_BIT: u8 = 0x10;
const MSG_EXTENDED: u8 = 20;
const EXT_HANDSHAKE: u8 = 0;
/// The ut_metadata id we advertise; peers address their piece messages to it.
const LOCAL_UT_METADATA: u8 = 1;

const MSG_TYPE_REQUEST: i64 = 0;
const MSG_TYPE_DATA: i64 = 1;
const MSG_TYPE_REJECT: i64 = 2;

/// A leechable observation forwarded by the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataRequest {
    pub info_hash: InfoHash,
    pub peer: SocketAddr,
}

/// The crawler's output record: a verified torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexingResult {
    pub info_hash: InfoHash,
    pub name: String,
    pub files: Vec<FileEntry>,
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub max_leeches: usize,
    pub completed_lru: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            max_leeches: 1000,
            completed_lru: 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeechError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("malformed handshake")]
    BadHandshake,
    #[error("peer does not support the extension protocol")]
    NoExtensionSupport,
    #[error("peer answered for a different infohash")]
    WrongInfoHash,
    #[error("peer does not support ut_metadata")]
    NoUtMetadata,
    #[error("peer declared metadata size {0}")]
    BadMetadataSize(i64),
    #[error("frame of {0} bytes exceeds the message cap")]
    FrameTooLarge(usize),
    #[error("metadata piece {0} out of range or repeated")]
    BadPiece(usize),
    #[error("metadata piece {0} has the wrong length")]
    BadPieceLength(usize),
    #[error("assembled metadata does not hash to the requested infohash")]
    HashMismatch,
    #[error("metadata is not valid bencode: {0}")]
    Bencode(#[from] BencodeError),
    #[error("metadata is not a usable info dict: {0}")]
    Metainfo(#[from] MetainfoError),
}

/// Runs the sink until the request channel closes or shutdown fires.
///
/// Admission: an infohash already being leeched is dropped silently, as is
/// one completed within the recent-completion window. Failed leeches leave
/// no trace, so the same infohash can be retried from a later announce.
pub async fn run(
    mut requests: mpsc::Receiver<MetadataRequest>,
    results: mpsc::Sender<IndexingResult>,
    config: SinkConfig,
    stats: Arc<Stats>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut in_flight: HashSet<InfoHash> = HashSet::new();
    let mut completed: BoundedSet<InfoHash> = BoundedSet::new(config.completed_lru.max(1));
    let mut leeches: JoinSet<(MetadataRequest, Result<IndexingResult, LeechError>)> =
        JoinSet::new();

    loop {
        enum Event {
            Shutdown,
            Request(Option<MetadataRequest>),
            Finished(MetadataRequest, Result<IndexingResult, LeechError>),
            LeechDied,
        }

        let event = tokio::select! {
            _ = shutdown.changed() => Event::Shutdown,
            request = requests.recv() => Event::Request(request),
            Some(joined) = leeches.join_next() => match joined {
                Ok((request, outcome)) => Event::Finished(request, outcome),
                Err(_) => Event::LeechDied,
            },
        };

        match event {
            Event::Shutdown => break,
            Event::Request(None) => break,
            Event::Request(Some(request)) => {
                if in_flight.contains(&request.info_hash)
                    || completed.contains(&request.info_hash)
                {
                    Stats::bump(&stats.dedup_drops);
                    continue;
                }
                if leeches.len() >= config.max_leeches {
                    Stats::bump(&stats.leeches_shed);
                    continue;
                }
                in_flight.insert(request.info_hash);
                leeches.spawn(async move {
                    let outcome = leech_one(&request).await;
                    (request, outcome)
                });
            }
            Event::Finished(request, outcome) => {
                in_flight.remove(&request.info_hash);
                match outcome {
                    Ok(result) => {
                        completed.insert(request.info_hash);
                        tracing::info!(
                            hash = %result.info_hash,
                            name = %result.name,
                            files = result.files.len(),
                            "metadata fetched"
                        );
                        if results.send(result).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        if matches!(err, LeechError::Timeout(_)) {
                            Stats::bump(&stats.timeouts);
                        }
                        Stats::bump(&stats.leech_failures);
                        tracing::debug!(
                            hash = %request.info_hash,
                            peer = %request.peer,
                            %err,
                            "leech failed"
                        );
                    }
                }
            }
            Event::LeechDied => {
                tracing::warn!("a leech task aborted abnormally");
            }
        }
    }

    // Outstanding sessions hold TCP connections we no longer want.
    leeches.shutdown().await;
}

async fn leech_one(request: &MetadataRequest) -> Result<IndexingResult, LeechError> {
    let info_bytes = fetch_metadata(request.peer, request.info_hash).await?;

    let digest: [u8; 20] = Sha1::digest(&info_bytes).into();
    if digest != request.info_hash.0 {
        return Err(LeechError::HashMismatch);
    }

    let value = bencode::decode(&info_bytes)?;
    let meta = metainfo::parse_info(&value)?;

    Ok(IndexingResult {
        info_hash: request.info_hash,
        name: meta.name,
        files: meta.files,
        peers: vec![request.peer],
    })
}

/// Downloads the raw bencoded info dict from one peer. Connect and the full
/// exchange run under their own deadlines.
pub async fn fetch_metadata(
    peer: SocketAddr,
    info_hash: InfoHash,
) -> Result<Vec<u8>, LeechError> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
        .await
        .map_err(|_| LeechError::Timeout("connect"))??;

    timeout(EXCHANGE_TIMEOUT, exchange(stream, info_hash))
        .await
        .map_err(|_| LeechError::Timeout("metadata exchange"))?
}

async fn exchange(mut stream: TcpStream, info_hash: InfoHash) -> Result<Vec<u8>, LeechError> {
    // 68-byte handshake with the extension-protocol bit set.
    let mut handshake = [0u8; HANDSHAKE_LEN];
    handshake[0] = PSTR.len() as u8;
    handshake[1..20].copy_from_slice(PSTR);
    handshake[25] |= EXTENSION_BIT;
    handshake[28..48].copy_from_slice(&info_hash.0);
    handshake[48..68].copy_from_slice(&generate_peer_id());
    stream.write_all(&handshake).await?;

    let mut theirs = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut theirs).await?;
    if theirs[0] as usize != PSTR.len() || &theirs[1..20] != PSTR {
        return Err(LeechError::BadHandshake);
    }
    if theirs[25] & EXTENSION_BIT == 0 {
        return Err(LeechError::NoExtensionSupport);
    }
    if theirs[28..48] != info_hash.0 {
        return Err(LeechError::WrongInfoHash);
    }

    // Extension handshake: advertise ut_metadata under our local id.
    let ext_handshake = Value::Dict(vec![(
        b"m".to_vec(),
        Value::Dict(vec![(
            b"ut_metadata".to_vec(),
            Value::Int(LOCAL_UT_METADATA as i64),
        )]),
    )]);
    write_extended(&mut stream, EXT_HANDSHAKE, &bencode::encode(&ext_handshake)).await?;

    let (remote_ut_metadata, metadata_size) = recv_ext_handshake(&mut stream).await?;
    let piece_count = (metadata_size + METADATA_PIECE_SIZE - 1) / METADATA_PIECE_SIZE;

    let mut assembled = BytesMut::zeroed(metadata_size);
    let mut received = vec![false; piece_count];
    let mut missing = piece_count;
    let mut next_request = 0usize;

    while next_request < piece_count.min(MAX_PIPELINED) {
        request_piece(&mut stream, remote_ut_metadata, next_request).await?;
        next_request += 1;
    }

    while missing > 0 {
        let Some((ext_id, payload)) = read_frame(&mut stream).await? else {
            continue;
        };
        if ext_id == EXT_HANDSHAKE {
            // Some clients re-send their handshake; harmless.
            continue;
        }
        let (header, body_start) = bencode::decode_prefix(&payload, 0)?;
        match header.dict_get_int(b"msg_type") {
            Some(MSG_TYPE_DATA) => {}
            Some(MSG_TYPE_REJECT) | Some(MSG_TYPE_REQUEST) => continue,
            _ => continue,
        }
        let piece = header
            .dict_get_int(b"piece")
            .and_then(|p| usize::try_from(p).ok())
            .ok_or(LeechError::BadPiece(usize::MAX))?;
        if piece >= piece_count || received[piece] {
            return Err(LeechError::BadPiece(piece));
        }

        let data = &payload[body_start..];
        let offset = piece * METADATA_PIECE_SIZE;
        let expected = METADATA_PIECE_SIZE.min(metadata_size - offset);
        if data.len() != expected {
            return Err(LeechError::BadPieceLength(piece));
        }
        assembled[offset..offset + expected].copy_from_slice(data);
        received[piece] = true;
        missing -= 1;

        if next_request < piece_count {
            request_piece(&mut stream, remote_ut_metadata, next_request).await?;
            next_request += 1;
        }
    }

    Ok(assembled.to_vec())
}

/// Reads frames until the peer's extension handshake arrives, then validates
/// its ut_metadata mapping and declared size.
async fn recv_ext_handshake(stream: &mut TcpStream) -> Result<(u8, usize), LeechError> {
    loop {
        let Some((ext_id, payload)) = read_frame(stream).await? else {
            continue;
        };
        if ext_id != EXT_HANDSHAKE {
            continue;
        }

        let value = bencode::decode(&payload)?;
        let remote_id = value
            .dict_get(b"m")
            .and_then(|m| m.dict_get_int(b"ut_metadata"))
            .and_then(|id| u8::try_from(id).ok())
            .filter(|&id| id != 0)
            .ok_or(LeechError::NoUtMetadata)?;

        let size = value
            .dict_get_int(b"metadata_size")
            .ok_or(LeechError::BadMetadataSize(0))?;
        if size <= 0 || size as usize > MAX_METADATA_SIZE {
            return Err(LeechError::BadMetadataSize(size));
        }

        return Ok((remote_id, size as usize));
    }
}

/// Reads one length-prefixed message and returns extended-protocol frames as
/// `(extension id, payload)`. Keep-alives and non-extended messages come
/// back as `None`.
async fn read_frame(stream: &mut TcpStream) -> Result<Option<(u8, Bytes)>, LeechError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME {
        return Err(LeechError::FrameTooLarge(len));
    }

    let mut payload = BytesMut::zeroed(len);
    stream.read_exact(&mut payload).await?;

    if payload[0] != MSG_EXTENDED || len < 2 {
        return Ok(None);
    }
    let ext_id = payload[1];
    let mut payload = payload.freeze();
    let _ = payload.split_to(2);
    Ok(Some((ext_id, payload)))
}

async fn write_extended(
    stream: &mut TcpStream,
    ext_id: u8,
    payload: &[u8],
) -> Result<(), LeechError> {
    let mut frame = Vec::with_capacity(6 + payload.len());
    frame.extend_from_slice(&((payload.len() as u32 + 2).to_be_bytes()));
    frame.push(MSG_EXTENDED);
    frame.push(ext_id);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    Ok(())
}

async fn request_piece(
    stream: &mut TcpStream,
    remote_ut_metadata: u8,
    piece: usize,
) -> Result<(), LeechError> {
    let request = Value::Dict(vec![
        (b"msg_type".to_vec(), Value::Int(MSG_TYPE_REQUEST)),
        (b"piece".to_vec(), Value::Int(piece as i64)),
    ]);
    write_extended(stream, remote_ut_metadata, &bencode::encode(&request)).await
}

/// Azureus-style peer id: client tag plus random digits.
fn generate_peer_id() -> [u8; 20] {
    let mut id = *b"-DN0100-000000000000";
    let mut rng = rand::thread_rng();
    for byte in id[8..].iter_mut() {
        *byte = rng.gen_range(b'0'..=b'9');
    }
    id
}
