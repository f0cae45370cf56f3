//! End-to-end: a KRPC announce_peer hitting an indexing node leads to a
//! metadata exchange with the announced peer and one verified result on the
//! manager's output stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::{timeout, Duration};

use driftnet::bencode::{self, Value};
use driftnet::{Config, InfoHash, Manager};

const PSTR: &[u8; 19] = b"BitTorrent protocol";
const EXTENSION_BIT: u8 = 0x10;
const MSG_EXTENDED: u8 = 20;
const PIECE_SIZE: usize = 16 * 1024;

fn test_config() -> Config {
    Config {
        bind_addresses: vec!["127.0.0.1:0".to_string()],
        bootstrap_hosts: Vec::new(),
        ..Config::default()
    }
}

fn sample_info() -> (Vec<u8>, InfoHash) {
    let info = Value::Dict(vec![
        (b"length".to_vec(), Value::Int(2048)),
        (b"name".to_vec(), Value::Bytes(b"harvested.bin".to_vec())),
        (b"piece length".to_vec(), Value::Int(16384)),
    ]);
    let bytes = bencode::encode(&info);
    let hash = InfoHash(Sha1::digest(&bytes).into());
    (bytes, hash)
}

fn announce_packet(info_hash: InfoHash, port: u16) -> Vec<u8> {
    let args = Value::Dict(vec![
        (b"id".to_vec(), Value::Bytes(vec![0x11; 20])),
        (b"implied_port".to_vec(), Value::Int(0)),
        (b"info_hash".to_vec(), Value::Bytes(info_hash.0.to_vec())),
        (b"port".to_vec(), Value::Int(port as i64)),
        (b"token".to_vec(), Value::Bytes(b"x".to_vec())),
    ]);
    bencode::encode(&Value::Dict(vec![
        (b"a".to_vec(), args),
        (b"q".to_vec(), Value::Bytes(b"announce_peer".to_vec())),
        (b"t".to_vec(), Value::Bytes(b"aa".to_vec())),
        (b"y".to_vec(), Value::Bytes(b"q".to_vec())),
    ]))
}

async fn write_extended(stream: &mut TcpStream, ext_id: u8, payload: &[u8]) {
    let mut frame = Vec::with_capacity(6 + payload.len());
    frame.extend_from_slice(&((payload.len() as u32 + 2).to_be_bytes()));
    frame.push(MSG_EXTENDED);
    frame.push(ext_id);
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await.unwrap();
}

async fn read_extended(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    loop {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.ok()?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            continue;
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.ok()?;
        if len >= 2 && payload[0] == MSG_EXTENDED {
            return Some((payload[1], payload[2..].to_vec()));
        }
    }
}

/// One-connection-at-a-time seeder for `info_bytes`.
async fn run_seeder(listener: TcpListener, info_bytes: Vec<u8>, served: Arc<AtomicUsize>) {
    loop {
        let Ok((mut stream, _)) = listener.accept().await else {
            return;
        };
        served.fetch_add(1, Ordering::SeqCst);

        let mut leech_handshake = [0u8; 68];
        if stream.read_exact(&mut leech_handshake).await.is_err() {
            continue;
        }
        assert_eq!(leech_handshake[0] as usize, PSTR.len());
        assert_eq!(&leech_handshake[1..20], PSTR);
        assert_ne!(leech_handshake[25] & EXTENSION_BIT, 0);

        let mut handshake = [0u8; 68];
        handshake[0] = PSTR.len() as u8;
        handshake[1..20].copy_from_slice(PSTR);
        handshake[25] |= EXTENSION_BIT;
        handshake[28..48].copy_from_slice(&leech_handshake[28..48]);
        handshake[48..68].copy_from_slice(b"-SD0001-aaaaaaaaaaaa");
        stream.write_all(&handshake).await.unwrap();

        let ext_handshake = Value::Dict(vec![
            (
                b"m".to_vec(),
                Value::Dict(vec![(b"ut_metadata".to_vec(), Value::Int(7))]),
            ),
            (
                b"metadata_size".to_vec(),
                Value::Int(info_bytes.len() as i64),
            ),
        ]);
        write_extended(&mut stream, 0, &bencode::encode(&ext_handshake)).await;

        while let Some((ext_id, payload)) = read_extended(&mut stream).await {
            if ext_id != 7 {
                continue;
            }
            let (header, _) = bencode::decode_prefix(&payload, 0).unwrap();
            if header.dict_get_int(b"msg_type") != Some(0) {
                continue;
            }
            let piece = header.dict_get_int(b"piece").unwrap() as usize;
            let start = (piece * PIECE_SIZE).min(info_bytes.len());
            let end = (start + PIECE_SIZE).min(info_bytes.len());

            let mut reply = bencode::encode(&Value::Dict(vec![
                (b"msg_type".to_vec(), Value::Int(1)),
                (b"piece".to_vec(), Value::Int(piece as i64)),
                (b"total_size".to_vec(), Value::Int(info_bytes.len() as i64)),
            ]));
            reply.extend_from_slice(&info_bytes[start..end]);
            write_extended(&mut stream, 1, &reply).await;
        }
    }
}

#[tokio::test]
async fn announce_leads_to_one_verified_result() {
    let (info_bytes, info_hash) = sample_info();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seeder_addr = listener.local_addr().unwrap();
    let served = Arc::new(AtomicUsize::new(0));
    tokio::spawn(run_seeder(listener, info_bytes, served.clone()));

    let manager = Manager::new(test_config()).await.unwrap();
    let node_addr = manager.local_addrs()[0];

    let querier = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    querier
        .send_to(&announce_packet(info_hash, seeder_addr.port()), node_addr)
        .await
        .unwrap();

    // The node must ack the announce.
    let mut buf = [0u8; 4096];
    let (len, _) = timeout(Duration::from_secs(5), querier.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let ack = bencode::decode(&buf[..len]).unwrap();
    assert_eq!(ack.dict_get_bytes(b"y"), Some(&b"r"[..]));
    assert_eq!(ack.dict_get_bytes(b"t"), Some(&b"aa"[..]));

    let result = timeout(Duration::from_secs(10), manager.recv())
        .await
        .expect("result before timeout")
        .expect("channel open");
    assert_eq!(result.info_hash, info_hash);
    assert_eq!(result.name, "harvested.bin");
    assert_eq!(result.files.len(), 1);
    assert_eq!(result.files[0].path, vec!["harvested.bin".to_string()]);
    assert_eq!(result.files[0].length, 2048);
    assert_eq!(
        result.peers,
        vec![SocketAddr::new("127.0.0.1".parse().unwrap(), seeder_addr.port())]
    );

    // A repeat announce for the same infohash is deduplicated: no further
    // result and no second metadata connection.
    querier
        .send_to(&announce_packet(info_hash, seeder_addr.port()), node_addr)
        .await
        .unwrap();
    assert!(
        timeout(Duration::from_millis(500), manager.recv())
            .await
            .is_err(),
        "duplicate infohash must not be emitted again"
    );
    assert_eq!(served.load(Ordering::SeqCst), 1);

    manager.terminate().await;
    assert!(manager.recv().await.is_none());
}

#[tokio::test]
async fn denylisted_source_is_ignored() {
    // Loopback traffic is droppable like any other subnet; an announce from
    // a denylisted source must produce neither an ack nor a leech.
    let config = Config {
        cidr_denylist: vec!["127.0.0.0/8".to_string()],
        ..test_config()
    };
    let manager = Manager::new(config).await.unwrap();
    let node_addr = manager.local_addrs()[0];

    let querier = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    querier
        .send_to(&announce_packet(InfoHash([0xbb; 20]), 6881), node_addr)
        .await
        .unwrap();

    let mut buf = [0u8; 4096];
    assert!(
        timeout(Duration::from_millis(500), querier.recv_from(&mut buf))
            .await
            .is_err(),
        "denylisted source must not be answered"
    );

    manager.terminate().await;
}
