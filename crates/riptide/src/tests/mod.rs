// Engine-level tests: scripted remote peers over real sockets, plus direct
// exercises of the choke and protocol-violation paths.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use riptide_core::constants::BLOCK_LEN;
use riptide_core::metainfo::{MetaFile, Metainfo};
use riptide_core::{Bitfield, Id20};
use riptide_peer_protocol::{HANDSHAKE_LEN, Handshake, Message, PieceData, Request};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::chunks::MemoryChunkSource;
use crate::config::Config;
use crate::download::Download;
use crate::error::{Error, ProtocolViolation};
use crate::hash::sha1_digest;
use crate::session::WriterRequest;

fn test_config() -> Config {
    Config {
        listen_port: 0,
        ..Default::default()
    }
}

fn metainfo_for(chunks: &[Vec<u8>], piece_length: u32, name: &str) -> Metainfo {
    let total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
    let mut pieces = Vec::with_capacity(chunks.len() * 20);
    for c in chunks {
        pieces.extend_from_slice(&sha1_digest(c));
    }
    Metainfo {
        info_hash: Id20::new([0x42; 20]),
        name: name.to_owned(),
        piece_length,
        pieces,
        files: vec![MetaFile {
            length: total,
            path: vec![],
        }],
        announce: None,
        announce_list: Vec::new(),
    }
}

/// Owned mirror of the wire messages for script-side assertions.
#[derive(Debug, PartialEq, Eq)]
enum ScriptMsg {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request(Request),
    Piece { index: u32, begin: u32, data: Vec<u8> },
    Cancel(Request),
}

struct ScriptPeer {
    stream: TcpStream,
    buf: BytesMut,
}

impl ScriptPeer {
    async fn accept(listener: &TcpListener, info_hash: Id20) -> anyhow::Result<Self> {
        let (mut stream, _) = listener.accept().await?;
        let mut hs = [0u8; HANDSHAKE_LEN];
        stream.read_exact(&mut hs).await?;
        let (theirs, _) = Handshake::deserialize(&hs)?;
        anyhow::ensure!(theirs.info_hash == info_hash, "wrong info hash");

        let mut out = Vec::new();
        Handshake::new(info_hash, Id20::new([0x77; 20])).serialize(&mut out);
        stream.write_all(&out).await?;
        Ok(ScriptPeer {
            stream,
            buf: BytesMut::new(),
        })
    }

    async fn send(&mut self, msg: Message<'_>) -> anyhow::Result<()> {
        let mut out = Vec::new();
        msg.serialize(&mut out);
        self.stream.write_all(&out).await?;
        Ok(())
    }

    async fn recv(&mut self) -> anyhow::Result<ScriptMsg> {
        loop {
            match Message::deserialize(&self.buf) {
                Ok((msg, consumed)) => {
                    let owned = match msg {
                        Message::KeepAlive => ScriptMsg::KeepAlive,
                        Message::Choke => ScriptMsg::Choke,
                        Message::Unchoke => ScriptMsg::Unchoke,
                        Message::Interested => ScriptMsg::Interested,
                        Message::NotInterested => ScriptMsg::NotInterested,
                        Message::Have(i) => ScriptMsg::Have(i),
                        Message::Bitfield(b) => ScriptMsg::Bitfield(b.to_vec()),
                        Message::Request(r) => ScriptMsg::Request(r),
                        Message::Piece(p) => ScriptMsg::Piece {
                            index: p.index,
                            begin: p.begin,
                            data: p.data.to_vec(),
                        },
                        Message::Cancel(r) => ScriptMsg::Cancel(r),
                    };
                    self.buf.advance(consumed);
                    return Ok(owned);
                }
                Err(e) if e.is_incomplete() => {}
                Err(e) => return Err(e.into()),
            }
            let n = self.stream.read_buf(&mut self.buf).await?;
            anyhow::ensure!(n > 0, "script peer: connection closed");
        }
    }

    /// Skips keep-alives, which can interleave anywhere.
    async fn recv_significant(&mut self) -> anyhow::Result<ScriptMsg> {
        loop {
            let msg = self.recv().await?;
            if msg != ScriptMsg::KeepAlive {
                return Ok(msg);
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn single_peer_single_chunk_download() {
    let data: Vec<u8> = (0..BLOCK_LEN).map(|i| (i * 31 % 251) as u8).collect();
    let meta = metainfo_for(&[data.clone()], BLOCK_LEN, "single.bin");
    let info_hash = meta.info_hash;

    let dir = tempfile::tempdir().unwrap();
    let layout = meta.layout().unwrap();
    let source = crate::chunks::FileChunkSource::open(
        dir.path(),
        layout,
        vec![(std::path::PathBuf::from("single.bin"), data.len() as u64)],
    )
    .unwrap();
    let download = Download::new(meta, test_config(), Box::new(source), None).unwrap();

    download.open().await.unwrap();
    assert_eq!(download.completed_bytes(), 0);
    download.start();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seed_addr = listener.local_addr().unwrap();
    download.add_peer(seed_addr);

    let expected = data.clone();
    let script = tokio::spawn(async move {
        let mut peer = ScriptPeer::accept(&listener, info_hash).await?;
        peer.send(Message::Bitfield(&[0b1000_0000])).await?;

        // Handshake -> BITFIELD -> INTERESTED.
        assert_eq!(peer.recv_significant().await?, ScriptMsg::Interested);

        peer.send(Message::Unchoke).await?;
        let req = match peer.recv_significant().await? {
            ScriptMsg::Request(r) => r,
            other => anyhow::bail!("expected request, got {other:?}"),
        };
        assert_eq!((req.index, req.begin, req.length), (0, 0, BLOCK_LEN));

        peer.send(Message::Piece(PieceData {
            index: 0,
            begin: 0,
            data: &expected,
        }))
        .await?;

        // Hash success -> HAVE -> NOT_INTERESTED.
        assert_eq!(peer.recv_significant().await?, ScriptMsg::Have(0));
        assert_eq!(peer.recv_significant().await?, ScriptMsg::NotInterested);
        Ok::<_, anyhow::Error>(())
    });

    tokio::time::timeout(Duration::from_secs(15), script)
        .await
        .expect("script timed out")
        .unwrap()
        .unwrap();

    // The engine may still be flushing; poll briefly.
    for _ in 0..50 {
        if download.is_done() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(download.is_done());
    download.stop();

    let on_disk = std::fs::read(dir.path().join("single.bin")).unwrap();
    assert_eq!(on_disk, data);
    download.close();
}

fn memory_download(chunks: &[Vec<u8>], piece_length: u32) -> Arc<Download> {
    let meta = metainfo_for(chunks, piece_length, "mem.bin");
    Download::new(
        meta,
        test_config(),
        Box::new(MemoryChunkSource::new()),
        None,
    )
    .unwrap()
}

async fn opened_memory_download(chunks: &[Vec<u8>], piece_length: u32) -> Arc<Download> {
    let d = memory_download(chunks, piece_length);
    d.open().await.unwrap();
    d
}

fn register(
    d: &Arc<Download>,
    n: u8,
) -> (
    SocketAddr,
    Arc<crate::connections::PeerConnection>,
    tokio::sync::mpsc::UnboundedReceiver<WriterRequest>,
) {
    let addr: SocketAddr = format!("10.0.0.{n}:6881").parse().unwrap();
    let (conn, rx) = d
        .register_connection(addr, Id20::new([n; 20]), false)
        .unwrap();
    (addr, conn, rx)
}

#[tokio::test(start_paused = true)]
async fn choke_flap_is_deferred_through_the_scheduler() {
    let d = opened_memory_download(&[vec![1u8; 16384], vec![2u8; 16384]], 16384).await;
    let (addr, conn, mut rx) = register(&d, 1);

    // Interested peer with free slots gets unchoked immediately.
    d.handle_message(&addr, &Message::Interested).unwrap();
    match rx.try_recv() {
        Ok(WriterRequest::Choke(false)) => {}
        other => panic!("expected immediate unchoke, got {other:?}"),
    }

    tokio::time::advance(Duration::from_secs(3)).await;

    // A re-choke 3 s later falls inside the 10 s anti-oscillation gap: no
    // wire message, but a delayed-choke entry at now + 7 s.
    d.set_choke(&conn, true);
    assert!(rx.try_recv().is_err());
    let at = d.delayed_choke_at(&addr).expect("delayed choke queued");
    assert_eq!(
        at.saturating_duration_since(tokio::time::Instant::now()),
        Duration::from_secs(7)
    );
    assert!(!conn.state.lock().up_choked);
    assert_eq!(conn.state.lock().pending_choke, Some(true));
}

#[tokio::test(start_paused = true)]
async fn bitfield_after_other_messages_is_a_violation() {
    let d = opened_memory_download(&[vec![1u8; 16384]], 16384).await;
    let (addr, _conn, _rx) = register(&d, 1);

    d.handle_message(&addr, &Message::Have(0)).unwrap();
    let err = d
        .handle_message(&addr, &Message::Bitfield(&[0b1000_0000]))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolViolation::LateBitfield)
    ));
}

#[tokio::test(start_paused = true)]
async fn request_validation_rules() {
    let data = vec![9u8; 16384];
    let d = opened_memory_download(&[data], 16384).await;
    let (addr, _conn, _rx) = register(&d, 1);

    // Zero-length requests are dropped as no-ops.
    d.handle_message(&addr, &Message::Request(Request::new(0, 0, 0)))
        .unwrap();

    // Oversized requests are violations.
    let err = d
        .handle_message(&addr, &Message::Request(Request::new(0, 0, 128 * 1024 + 1)))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolViolation::RequestTooLong(_))
    ));

    // Requests for chunks we don't have are violations too.
    let err = d
        .handle_message(&addr, &Message::Request(Request::new(0, 0, 16384)))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolViolation::BadRequest { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn have_out_of_range_is_a_violation() {
    let d = opened_memory_download(&[vec![0u8; 16384]], 16384).await;
    let (addr, _conn, _rx) = register(&d, 1);
    let err = d.handle_message(&addr, &Message::Have(1)).unwrap_err();
    assert!(matches!(
        err,
        Error::Protocol(ProtocolViolation::BadChunkIndex(1))
    ));
}

#[tokio::test(start_paused = true)]
async fn interesting_bitfield_triggers_interest_and_requests() {
    let chunk = vec![5u8; 16384];
    let d = opened_memory_download(&[chunk.clone()], 16384).await;
    let (addr, _conn, mut rx) = register(&d, 1);

    d.handle_message(&addr, &Message::Bitfield(&[0b1000_0000]))
        .unwrap();
    match rx.try_recv() {
        Ok(WriterRequest::Interested(true)) => {}
        other => panic!("expected interested, got {other:?}"),
    }

    // Unchoke opens the pipeline.
    d.handle_message(&addr, &Message::Unchoke).unwrap();
    let reqs = match rx.try_recv() {
        Ok(WriterRequest::Requests(r)) => r,
        other => panic!("expected requests, got {other:?}"),
    };
    assert_eq!(reqs, vec![Request::new(0, 0, 16384)]);

    // Delivering the block completes the chunk; HAVE goes out after the
    // hash verifies, which needs the engine loop; here we just confirm the
    // transfer accounting took the bytes.
    let bf = Bitfield::from_bytes(&[0b1000_0000], 1).unwrap();
    assert!(bf.is_all_set());
    d.handle_message(
        &addr,
        &Message::Piece(PieceData {
            index: 0,
            begin: 0,
            data: &chunk,
        }),
    )
    .unwrap();
    assert_eq!(d.completed_bytes(), 0);
}
