use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use async_trait::async_trait;

use super::*;
use crate::config::SessionConfig;
use crate::metadata::TorrentMetadata;
use crate::piece::{PieceManager, BLOCK_SIZE};
use crate::session::SessionEvent;
use crate::storage::{MemorySink, PieceSink, StorageError};

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1.0, id2.0);
    assert_eq!(id1.client_id(), Some("BR0001"));
}

#[test]
fn test_bitfield() {
    let mut bf = Bitfield::new(100);
    assert!(!bf.has(0));

    bf.set(0);
    assert!(bf.has(0));

    bf.set(99);
    assert!(bf.has(99));

    assert_eq!(bf.count(), 2);
    assert!(!bf.has(100));
}

#[test]
fn test_bitfield_from_bytes() {
    let bytes = Bytes::from_static(&[0x80, 0x00]);
    let bf = Bitfield::from_bytes(bytes, 16);

    assert!(bf.has(0));
    assert!(!bf.has(1));
}

#[test]
fn test_bitfield_clears_spare_bits() {
    // 10 pieces leaves 6 spare bits in the second byte.
    let bf = Bitfield::from_bytes(Bytes::from_static(&[0xFF, 0xFF]), 10);
    assert_eq!(bf.count(), 10);

    let full = Bitfield::full(10);
    assert_eq!(full.count(), 10);
    assert_eq!(full.to_bytes().as_ref(), &[0xFF, 0xC0]);
}

#[test]
fn test_handshake_encode_decode() {
    let info_hash = [1u8; 20];
    let peer_id = [2u8; 20];

    let handshake = Handshake::new(info_hash, peer_id);
    let encoded = handshake.encode();
    assert_eq!(encoded.len(), 68);

    let decoded = Handshake::decode(&encoded).unwrap();
    assert_eq!(decoded.info_hash, info_hash);
    assert_eq!(decoded.peer_id, peer_id);
    assert_eq!(decoded.reserved, [0u8; 8]);
}

#[test]
fn test_handshake_rejects_bad_protocol() {
    let mut encoded = Handshake::new([1u8; 20], [2u8; 20]).encode().to_vec();
    encoded[5] ^= 0xFF;
    assert!(matches!(
        Handshake::decode(&encoded),
        Err(PeerError::InvalidHandshake)
    ));

    assert!(matches!(
        Handshake::decode(&encoded[..67]),
        Err(PeerError::InvalidHandshake)
    ));
}

#[test]
fn test_message_encode_decode() {
    let messages = vec![
        Message::KeepAlive,
        Message::Choke,
        Message::Unchoke,
        Message::Interested,
        Message::NotInterested,
        Message::Have { piece: 42 },
        Message::Request {
            index: 1,
            begin: 0,
            length: 16384,
        },
        Message::Cancel {
            index: 1,
            begin: 16384,
            length: 16384,
        },
    ];

    for msg in messages {
        let encoded = msg.encode();
        let decoded = Message::decode(encoded).unwrap();

        match (&msg, &decoded) {
            (Message::KeepAlive, Message::KeepAlive) => {}
            (Message::Choke, Message::Choke) => {}
            (Message::Unchoke, Message::Unchoke) => {}
            (Message::Interested, Message::Interested) => {}
            (Message::NotInterested, Message::NotInterested) => {}
            (Message::Have { piece: p1 }, Message::Have { piece: p2 }) => {
                assert_eq!(p1, p2);
            }
            (
                Message::Request {
                    index: i1,
                    begin: b1,
                    length: l1,
                },
                Message::Request {
                    index: i2,
                    begin: b2,
                    length: l2,
                },
            )
            | (
                Message::Cancel {
                    index: i1,
                    begin: b1,
                    length: l1,
                },
                Message::Cancel {
                    index: i2,
                    begin: b2,
                    length: l2,
                },
            ) => {
                assert_eq!((i1, b1, l1), (i2, b2, l2));
            }
            _ => panic!("message mismatch"),
        }
    }
}

#[test]
fn test_piece_message_round_trip() {
    let data = Bytes::from_static(b"hello world");
    let msg = Message::Piece {
        index: 3,
        begin: 16384,
        data: data.clone(),
    };

    let decoded = Message::decode(msg.encode()).unwrap();
    match decoded {
        Message::Piece {
            index,
            begin,
            data: decoded_data,
        } => {
            assert_eq!(index, 3);
            assert_eq!(begin, 16384);
            assert_eq!(decoded_data, data);
        }
        other => panic!("expected piece message, got {:?}", other),
    }
}

#[test]
fn test_unknown_message_id_rejected() {
    // Fast-extension id, which this client does not advertise.
    let frame = Bytes::from_static(&[0, 0, 0, 1, 14]);
    assert!(matches!(
        Message::decode(frame),
        Err(PeerError::InvalidMessageId(14))
    ));
}

#[test]
fn test_truncated_messages_rejected() {
    for frame in [
        &[0u8, 0, 0][..],             // short length prefix
        &[0u8, 0, 0, 5, 4, 0][..],    // declared length exceeds payload
        &[0u8, 0, 0, 1, 7][..],       // piece with no body
        &[0u8, 0, 0, 5, 6, 0, 0][..], // request too short
    ] {
        assert!(Message::decode(Bytes::copy_from_slice(frame)).is_err());
    }
}

fn test_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(2),
        keep_alive_interval: Duration::from_millis(200),
        idle_timeout: Duration::from_secs(2),
        request_pipeline_depth: 3,
        ..SessionConfig::default()
    }
}

/// One-piece torrent whose data is deterministic.
fn one_piece_metadata(piece_len: usize, blocks: u32) -> (TorrentMetadata, Vec<u8>) {
    let total = piece_len as u64 * blocks as u64;
    let data: Vec<u8> = (0..total).map(|i| i as u8).collect();
    let metadata = TorrentMetadata::new(
        [9u8; 20],
        total,
        vec![Sha1::digest(&data).into()],
        total,
        "udp://tracker.test:1337".into(),
    )
    .unwrap();
    (metadata, data)
}

async fn accept_with_handshake(listener: &TcpListener, info_hash: [u8; 20]) -> TcpStream {
    let (mut stream, _) = listener.accept().await.unwrap();

    let mut theirs = [0u8; 68];
    stream.read_exact(&mut theirs).await.unwrap();

    let ours = Handshake::new(info_hash, [b'X'; 20]).encode();
    stream.write_all(&ours).await.unwrap();
    stream
}

async fn read_request(stream: &mut TcpStream) -> (u32, u32, u32) {
    let mut frame = [0u8; 17];
    stream.read_exact(&mut frame).await.unwrap();
    assert_eq!(&frame[..5], &[0, 0, 0, 13, 6]);
    (
        u32::from_be_bytes([frame[5], frame[6], frame[7], frame[8]]),
        u32::from_be_bytes([frame[9], frame[10], frame[11], frame[12]]),
        u32::from_be_bytes([frame[13], frame[14], frame[15], frame[16]]),
    )
}

#[tokio::test]
async fn test_connect_verifies_info_hash() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = tokio::spawn(async move {
        // Answer with a different info hash.
        let mut stream = accept_with_handshake(&listener, [0xAA; 20]).await;

        // The client must close without any wire message.
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "client sent {} bytes after a bad handshake", n);
    });

    let result =
        PeerConnection::connect(addr, [0xBB; 20], *PeerId::generate().as_bytes(), 4, &test_config())
            .await;
    assert!(matches!(result, Err(PeerError::InfoHashMismatch)));

    peer.await.unwrap();
}

#[tokio::test]
async fn test_pipeline_depth_never_exceeded() {
    let config = test_config();
    let depth = config.request_pipeline_depth;

    // Eight blocks available, pipeline capped at three.
    let (metadata, data) = one_piece_metadata(BLOCK_SIZE as usize, 8);
    let info_hash = metadata.info_hash;
    let manager = Arc::new(PieceManager::new(metadata, Arc::new(MemorySink::new())));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = tokio::spawn(async move {
        let mut stream = accept_with_handshake(&listener, info_hash).await;

        stream
            .write_all(&Message::Bitfield(Bitfield::full(1).to_bytes()).encode())
            .await
            .unwrap();

        // Interested arrives before any request.
        let mut interested = [0u8; 5];
        stream.read_exact(&mut interested).await.unwrap();
        assert_eq!(interested, [0, 0, 0, 1, 2]);

        stream.write_all(&Message::Unchoke.encode()).await.unwrap();

        // The client may pipeline at most `depth` requests before we
        // serve anything.
        let mut outstanding = Vec::new();
        for _ in 0..depth {
            outstanding.push(read_request(&mut stream).await);
        }

        let extra = timeout(Duration::from_millis(300), read_request(&mut stream)).await;
        assert!(extra.is_err(), "client exceeded pipeline depth");

        // Serve one block; exactly one replacement request should follow.
        let (index, begin, length) = outstanding.remove(0);
        let chunk = &data[begin as usize..(begin + length) as usize];
        let piece = Message::Piece {
            index,
            begin,
            data: Bytes::copy_from_slice(chunk),
        };
        stream.write_all(&piece.encode()).await.unwrap();

        let replacement = read_request(&mut stream).await;
        assert_ne!(replacement.1, begin);

        let extra = timeout(Duration::from_millis(300), read_request(&mut stream)).await;
        assert!(extra.is_err(), "client sent more than one replacement");
    });

    let connection = PeerConnection::connect(
        addr,
        info_hash,
        *PeerId::generate().as_bytes(),
        1,
        &config,
    )
    .await
    .unwrap();

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run = tokio::spawn(connection.run(
        manager.clone(),
        events_tx,
        shutdown_rx,
        config,
    ));

    peer.await.unwrap();

    // The fake peer hangs up as its task ends, so the loop may observe
    // either the shutdown signal or the closed socket first.
    shutdown_tx.send(true).unwrap();
    let result = run.await.unwrap();
    assert!(matches!(result, Ok(()) | Err(PeerError::ConnectionClosed)));
    while events_rx.try_recv().is_ok() {}
}

#[tokio::test]
async fn test_download_single_piece_from_peer() {
    let config = test_config();
    let (metadata, data) = one_piece_metadata(BLOCK_SIZE as usize, 2);
    let info_hash = metadata.info_hash;
    let sink = Arc::new(MemorySink::new());
    let manager = Arc::new(PieceManager::new(metadata, sink.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let served = data.clone();
    let peer = tokio::spawn(async move {
        let mut stream = accept_with_handshake(&listener, info_hash).await;

        stream
            .write_all(&Message::Bitfield(Bitfield::full(1).to_bytes()).encode())
            .await
            .unwrap();

        let mut interested = [0u8; 5];
        stream.read_exact(&mut interested).await.unwrap();

        stream.write_all(&Message::Unchoke.encode()).await.unwrap();

        for _ in 0..2 {
            let (index, begin, length) = read_request(&mut stream).await;
            let chunk = &served[begin as usize..(begin + length) as usize];
            let piece = Message::Piece {
                index,
                begin,
                data: Bytes::copy_from_slice(chunk),
            };
            stream.write_all(&piece.encode()).await.unwrap();
        }
    });

    let connection = PeerConnection::connect(
        addr,
        info_hash,
        *PeerId::generate().as_bytes(),
        1,
        &config,
    )
    .await
    .unwrap();

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    // The run loop exits on its own once the download is complete.
    connection
        .run(manager.clone(), events_tx, shutdown_rx, config)
        .await
        .unwrap();

    peer.await.unwrap();

    assert!(manager.is_complete());
    assert_eq!(sink.assembled(), data);

    let mut saw_verified = false;
    while let Ok(event) = events_rx.try_recv() {
        if matches!(event, SessionEvent::PieceVerified { piece: 0, .. }) {
            saw_verified = true;
        }
    }
    assert!(saw_verified);
}

#[tokio::test]
async fn test_requests_follow_unchoke_before_bitfield() {
    let config = test_config();
    let (metadata, data) = one_piece_metadata(BLOCK_SIZE as usize, 2);
    let info_hash = metadata.info_hash;
    let sink = Arc::new(MemorySink::new());
    let manager = Arc::new(PieceManager::new(metadata, sink.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let served = data.clone();
    let peer = tokio::spawn(async move {
        let mut stream = accept_with_handshake(&listener, info_hash).await;

        // Unchoke before the bitfield is legal ordering; the client must
        // still start requesting once it learns what we have.
        stream.write_all(&Message::Unchoke.encode()).await.unwrap();
        stream
            .write_all(&Message::Bitfield(Bitfield::full(1).to_bytes()).encode())
            .await
            .unwrap();

        let mut interested = [0u8; 5];
        stream.read_exact(&mut interested).await.unwrap();
        assert_eq!(interested, [0, 0, 0, 1, 2]);

        for _ in 0..2 {
            let (index, begin, length) = read_request(&mut stream).await;
            let chunk = &served[begin as usize..(begin + length) as usize];
            let piece = Message::Piece {
                index,
                begin,
                data: Bytes::copy_from_slice(chunk),
            };
            stream.write_all(&piece.encode()).await.unwrap();
        }
    });

    let connection = PeerConnection::connect(
        addr,
        info_hash,
        *PeerId::generate().as_bytes(),
        1,
        &config,
    )
    .await
    .unwrap();

    let (events_tx, _events_rx) = mpsc::channel(64);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    connection
        .run(manager.clone(), events_tx, shutdown_rx, config)
        .await
        .unwrap();

    peer.await.unwrap();

    assert!(manager.is_complete());
    assert_eq!(sink.assembled(), data);
}

/// A sink whose writes never finish within test time.
struct StallingSink;

#[async_trait]
impl PieceSink for StallingSink {
    async fn write_piece(&self, _piece: u32, _data: Bytes) -> Result<(), StorageError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

#[tokio::test]
async fn test_shutdown_unblocks_stalled_sink_write() {
    let config = test_config();
    let (metadata, data) = one_piece_metadata(BLOCK_SIZE as usize, 1);
    let info_hash = metadata.info_hash;
    let manager = Arc::new(PieceManager::new(metadata, Arc::new(StallingSink)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = tokio::spawn(async move {
        let mut stream = accept_with_handshake(&listener, info_hash).await;

        stream
            .write_all(&Message::Bitfield(Bitfield::full(1).to_bytes()).encode())
            .await
            .unwrap();

        let mut interested = [0u8; 5];
        stream.read_exact(&mut interested).await.unwrap();

        stream.write_all(&Message::Unchoke.encode()).await.unwrap();

        let (index, begin, length) = read_request(&mut stream).await;
        let chunk = &data[begin as usize..(begin + length) as usize];
        let piece = Message::Piece {
            index,
            begin,
            data: Bytes::copy_from_slice(chunk),
        };
        stream.write_all(&piece.encode()).await.unwrap();

        // Keep the socket open; the client is now stuck in the sink.
        let mut buf = [0u8; 16];
        while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
    });

    let connection = PeerConnection::connect(
        addr,
        info_hash,
        *PeerId::generate().as_bytes(),
        1,
        &config,
    )
    .await
    .unwrap();

    let (events_tx, _events_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run = tokio::spawn(connection.run(manager, events_tx, shutdown_rx, config));

    // Give the client time to receive the block and enter the write.
    tokio::time::sleep(Duration::from_millis(300)).await;
    shutdown_tx.send(true).unwrap();

    let result = timeout(Duration::from_secs(2), run)
        .await
        .expect("shutdown did not unblock the connection")
        .unwrap();
    assert!(result.is_ok());

    peer.await.unwrap();
}

#[tokio::test]
async fn test_idle_peer_times_out() {
    let mut config = test_config();
    config.keep_alive_interval = Duration::from_millis(100);
    config.idle_timeout = Duration::from_millis(350);

    let (metadata, _) = one_piece_metadata(BLOCK_SIZE as usize, 1);
    let info_hash = metadata.info_hash;
    let manager = Arc::new(PieceManager::new(metadata, Arc::new(MemorySink::new())));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = tokio::spawn(async move {
        let mut stream = accept_with_handshake(&listener, info_hash).await;

        // Stay silent but keep the socket open; expect at least one
        // keep-alive from the client before it gives up.
        let mut frame = [0u8; 4];
        stream.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [0, 0, 0, 0]);

        let mut buf = [0u8; 16];
        while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
    });

    let connection = PeerConnection::connect(
        addr,
        info_hash,
        *PeerId::generate().as_bytes(),
        1,
        &config,
    )
    .await
    .unwrap();

    let (events_tx, _events_rx) = mpsc::channel(64);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = connection
        .run(manager, events_tx, shutdown_rx, config)
        .await;
    assert!(matches!(result, Err(PeerError::Timeout)));

    peer.await.unwrap();
}
