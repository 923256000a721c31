use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use riptide_peer_protocol::{HANDSHAKE_LEN, Handshake, Message, Request};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::download::Download;
use crate::error::{Error, ProtocolViolation, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Work for a session's writer half, queued by the engine. Message-bearing
/// variants are emitted in queue order, so e.g. two HAVEs stay ordered.
#[derive(Debug)]
pub enum WriterRequest {
    Choke(bool),
    Interested(bool),
    Have(u32),
    Bitfield(Vec<u8>),
    Requests(Vec<Request>),
    Cancel(Request),

    /// Nudges the writer to look at the peer's send queue.
    Poke,

    /// Ends the session, carrying the reason so the close path can score
    /// the peer.
    Disconnect(Result<()>),
}

/// Drives one outgoing peer session to completion over TCP. Alternative
/// transports go through [`run_incoming`] with their own connected stream.
pub async fn run_outgoing(download: Arc<Download>, addr: SocketAddr) {
    let result = async {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout("connect"))?
            .map_err(Error::Connect)?;
        let _ = stream.set_nodelay(true);
        session(download.clone(), stream, addr, false).await
    }
    .await;
    finish(&download, addr, result);
}

/// Drives one already-connected peer session to completion; the stream may
/// be any transport the embedder produced.
pub async fn run_incoming<S>(download: Arc<Download>, stream: S, addr: SocketAddr)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let result = session(download.clone(), stream, addr, true).await;
    finish(&download, addr, result);
}

fn finish(download: &Download, addr: SocketAddr, result: Result<()>) {
    match &result {
        Ok(()) => debug!(%addr, "session closed"),
        Err(e) => debug!(%addr, "session closed: {e}"),
    }
    download.connection_closed(&addr, result.err());
}

async fn session<S>(
    download: Arc<Download>,
    mut stream: S,
    addr: SocketAddr,
    incoming: bool,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    // Handshakes first: ours, then theirs (the incoming side answers in
    // the same order; BEP 3 allows it and it keeps the flow uniform).
    let mut hs_buf = Vec::with_capacity(HANDSHAKE_LEN);
    Handshake::new(download.info_hash(), download.our_peer_id()).serialize(&mut hs_buf);
    timeout(HANDSHAKE_TIMEOUT, stream.write_all(&hs_buf))
        .await
        .map_err(|_| Error::Timeout("handshake write"))?
        .map_err(Error::Write)?;

    let mut their_hs = [0u8; HANDSHAKE_LEN];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut their_hs))
        .await
        .map_err(|_| Error::Timeout("handshake read"))?
        .map_err(Error::Read)?;
    let (handshake, _) = Handshake::deserialize(&their_hs)
        .map_err(|e| Error::Protocol(ProtocolViolation::Framing(e)))?;

    if handshake.info_hash != download.info_hash() {
        return Err(ProtocolViolation::WrongInfoHash.into());
    }
    if handshake.peer_id == download.our_peer_id() {
        return Err(ProtocolViolation::ConnectedToOurselves.into());
    }
    trace!(%addr, peer_id = %handshake.peer_id, "handshake complete");

    let (_conn, rx) = download.register_connection(addr, handshake.peer_id, incoming)?;

    let (read_half, write_half) = tokio::io::split(stream);
    let reader = reader_loop(&download, addr, read_half);
    let writer = writer_loop(&download, addr, write_half, rx);

    // Either half finishing (or failing) ends the session.
    tokio::select! {
        r = reader => r,
        r = writer => r,
    }
}

async fn reader_loop<R: AsyncRead + Unpin>(
    download: &Arc<Download>,
    addr: SocketAddr,
    mut read: R,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    loop {
        // Drain every complete frame in the buffer before reading more.
        loop {
            let consumed = match Message::deserialize(&buf) {
                Ok((msg, consumed)) => {
                    if let Message::Piece(p) = &msg {
                        // Backpressure: no quota, no processing. The bytes
                        // are already ours, but accounting happens before
                        // the next read can pile more on.
                        download
                            .acquire_download_quota(&addr, p.data.len() as u64)
                            .await;
                    }
                    download.handle_message(&addr, &msg)?;
                    consumed
                }
                Err(e) if e.is_incomplete() => break,
                Err(e) => return Err(ProtocolViolation::Framing(e).into()),
            };
            buf.advance(consumed);
        }

        buf.reserve(16 * 1024);
        let n = read.read_buf(&mut buf).await.map_err(Error::Read)?;
        if n == 0 {
            return Err(Error::PeerDisconnected);
        }
    }
}

async fn writer_loop<W: AsyncWrite + Unpin>(
    download: &Arc<Download>,
    addr: SocketAddr,
    mut write: W,
    mut rx: UnboundedReceiver<WriterRequest>,
) -> Result<()> {
    let keep_alive = download.config().keep_alive_interval();
    let mut out = Vec::with_capacity(32 * 1024);

    // The bitfield goes out first if we have anything at all.
    if let Some(bytes) = download.bitfield_message() {
        Message::Bitfield(&bytes).serialize(&mut out);
        flush(&mut write, &mut out).await?;
    }

    loop {
        let req = match timeout(keep_alive, rx.recv()).await {
            Ok(Some(req)) => req,
            Ok(None) => return Ok(()),
            Err(_) => {
                Message::KeepAlive.serialize(&mut out);
                flush(&mut write, &mut out).await?;
                continue;
            }
        };

        match req {
            WriterRequest::Choke(true) => {
                Message::Choke.serialize(&mut out);
            }
            WriterRequest::Choke(false) => {
                Message::Unchoke.serialize(&mut out);
            }
            WriterRequest::Interested(true) => {
                Message::Interested.serialize(&mut out);
            }
            WriterRequest::Interested(false) => {
                Message::NotInterested.serialize(&mut out);
            }
            WriterRequest::Have(index) => {
                Message::Have(index).serialize(&mut out);
            }
            WriterRequest::Bitfield(bytes) => {
                Message::Bitfield(&bytes).serialize(&mut out);
            }
            WriterRequest::Requests(reqs) => {
                for r in reqs {
                    Message::Request(r).serialize(&mut out);
                }
            }
            WriterRequest::Cancel(r) => {
                Message::Cancel(r).serialize(&mut out);
            }
            WriterRequest::Poke => {}
            WriterRequest::Disconnect(result) => return result,
        }
        if !out.is_empty() {
            flush(&mut write, &mut out).await?;
        }

        // Channel drained: one PIECE at a time, re-checking for fresh
        // control messages between blocks.
        while rx.is_empty()
            && let Some(request) = download.pop_send_queue(&addr)
        {
            download
                .acquire_upload_quota(&addr, request.length as u64)
                .await;
            match download.read_block(&request) {
                Ok(data) => {
                    Message::Piece(riptide_peer_protocol::PieceData {
                        index: request.index,
                        begin: request.begin,
                        data: &data,
                    })
                    .serialize(&mut out);
                    flush(&mut write, &mut out).await?;
                    download.on_uploaded(&addr, request.length);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn flush<W: AsyncWrite + Unpin>(write: &mut W, out: &mut Vec<u8>) -> Result<()> {
    let result = timeout(WRITE_TIMEOUT, write.write_all(out))
        .await
        .map_err(|_| Error::Timeout("write"))?
        .map_err(Error::Write);
    out.clear();
    result
}
