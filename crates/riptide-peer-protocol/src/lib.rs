// BitTorrent v1 peer wire protocol: handshake and message framing.
//
// Deserialization is incremental: callers keep a read buffer and retry once
// `NotEnoughData` tells them how many bytes are still missing. Framing
// violations are hard errors that callers route to disconnect.

use byteorder::{BE, ByteOrder};
use riptide_core::Id20;
use riptide_core::constants::MAX_PACKET_LEN;
use serde::{Deserialize, Serialize};

const PSTR: &[u8; 19] = b"BitTorrent protocol";

pub const HANDSHAKE_LEN: usize = 68;

const LEN_PREFIX_LEN: usize = 4;
const MSGID_LEN: usize = 1;
const PREAMBLE_LEN: usize = LEN_PREFIX_LEN + MSGID_LEN;

type MsgId = u8;

const MSGID_CHOKE: MsgId = 0;
const MSGID_UNCHOKE: MsgId = 1;
const MSGID_INTERESTED: MsgId = 2;
const MSGID_NOT_INTERESTED: MsgId = 3;
const MSGID_HAVE: MsgId = 4;
const MSGID_BITFIELD: MsgId = 5;
const MSGID_REQUEST: MsgId = 6;
const MSGID_PIECE: MsgId = 7;
const MSGID_CANCEL: MsgId = 8;

#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    #[error("need {0} more bytes")]
    NotEnoughData(usize),
    #[error("frame of {0} bytes exceeds the {MAX_PACKET_LEN} byte limit")]
    FrameTooLong(u32),
    #[error("unknown message id {0}")]
    UnknownMessageId(u8),
    #[error("message id {msg_id} with payload of {received} bytes, expected {expected}")]
    WrongMessageLength {
        msg_id: u8,
        received: u32,
        expected: u32,
    },
    #[error("handshake pstr length {0}, expected 19")]
    HandshakePstrLength(u8),
    #[error("handshake pstr is not \"BitTorrent protocol\"")]
    HandshakePstrContent,
}

impl MessageError {
    /// Incomplete input rather than a protocol violation.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, MessageError::NotEnoughData(_))
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Handshake {
    pub reserved: u64,
    pub info_hash: Id20,
    pub peer_id: Id20,
}

impl Handshake {
    pub fn new(info_hash: Id20, peer_id: Id20) -> Self {
        Handshake {
            reserved: 0,
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(PSTR.len() as u8);
        out.extend_from_slice(PSTR);
        out.extend_from_slice(&self.reserved.to_be_bytes());
        out.extend_from_slice(self.info_hash.as_bytes());
        out.extend_from_slice(self.peer_id.as_bytes());
    }

    pub fn deserialize(buf: &[u8]) -> Result<(Handshake, usize), MessageError> {
        if buf.len() < HANDSHAKE_LEN {
            return Err(MessageError::NotEnoughData(HANDSHAKE_LEN - buf.len()));
        }
        if buf[0] as usize != PSTR.len() {
            return Err(MessageError::HandshakePstrLength(buf[0]));
        }
        if &buf[1..20] != PSTR {
            return Err(MessageError::HandshakePstrContent);
        }
        let h = Handshake {
            reserved: BE::read_u64(&buf[20..28]),
            // Both slices are exactly 20 bytes.
            info_hash: Id20::try_from(&buf[28..48]).unwrap(),
            peer_id: Id20::try_from(&buf[48..68]).unwrap(),
        };
        Ok((h, HANDSHAKE_LEN))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Request {
            index,
            begin,
            length,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceData<'a> {
    pub index: u32,
    pub begin: u32,
    pub data: &'a [u8],
}

#[derive(Debug, PartialEq, Eq)]
pub enum Message<'a> {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(&'a [u8]),
    Request(Request),
    Piece(PieceData<'a>),
    Cancel(Request),
}

impl<'a> Message<'a> {
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep_alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not_interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request(_) => "request",
            Message::Piece(_) => "piece",
            Message::Cancel(_) => "cancel",
        }
    }

    /// Appends the framed message to `out`, returning the frame length.
    pub fn serialize(&self, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        match self {
            Message::KeepAlive => {
                out.extend_from_slice(&0u32.to_be_bytes());
            }
            Message::Choke => write_preamble(out, 0, MSGID_CHOKE),
            Message::Unchoke => write_preamble(out, 0, MSGID_UNCHOKE),
            Message::Interested => write_preamble(out, 0, MSGID_INTERESTED),
            Message::NotInterested => write_preamble(out, 0, MSGID_NOT_INTERESTED),
            Message::Have(index) => {
                write_preamble(out, 4, MSGID_HAVE);
                out.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bytes) => {
                write_preamble(out, bytes.len() as u32, MSGID_BITFIELD);
                out.extend_from_slice(bytes);
            }
            Message::Request(r) | Message::Cancel(r) => {
                let msg_id = if matches!(self, Message::Request(_)) {
                    MSGID_REQUEST
                } else {
                    MSGID_CANCEL
                };
                write_preamble(out, 12, msg_id);
                out.extend_from_slice(&r.index.to_be_bytes());
                out.extend_from_slice(&r.begin.to_be_bytes());
                out.extend_from_slice(&r.length.to_be_bytes());
            }
            Message::Piece(p) => {
                write_preamble(out, 8 + p.data.len() as u32, MSGID_PIECE);
                out.extend_from_slice(&p.index.to_be_bytes());
                out.extend_from_slice(&p.begin.to_be_bytes());
                out.extend_from_slice(p.data);
            }
        }
        out.len() - start
    }

    /// Parses one framed message from the head of `buf`, returning it and
    /// the number of bytes consumed.
    pub fn deserialize(buf: &'a [u8]) -> Result<(Message<'a>, usize), MessageError> {
        if buf.len() < LEN_PREFIX_LEN {
            return Err(MessageError::NotEnoughData(LEN_PREFIX_LEN - buf.len()));
        }
        let len_prefix = BE::read_u32(&buf[..4]);
        if len_prefix == 0 {
            return Ok((Message::KeepAlive, LEN_PREFIX_LEN));
        }
        if len_prefix > MAX_PACKET_LEN {
            return Err(MessageError::FrameTooLong(len_prefix));
        }
        let total_len = LEN_PREFIX_LEN + len_prefix as usize;
        if buf.len() < total_len {
            return Err(MessageError::NotEnoughData(total_len - buf.len()));
        }

        let msg_id = buf[4];
        let payload = &buf[PREAMBLE_LEN..total_len];
        let payload_len = len_prefix - 1;

        let check_len = |expected: u32| -> Result<(), MessageError> {
            if payload_len != expected {
                return Err(MessageError::WrongMessageLength {
                    msg_id,
                    received: payload_len,
                    expected,
                });
            }
            Ok(())
        };

        let msg = match msg_id {
            MSGID_CHOKE => {
                check_len(0)?;
                Message::Choke
            }
            MSGID_UNCHOKE => {
                check_len(0)?;
                Message::Unchoke
            }
            MSGID_INTERESTED => {
                check_len(0)?;
                Message::Interested
            }
            MSGID_NOT_INTERESTED => {
                check_len(0)?;
                Message::NotInterested
            }
            MSGID_HAVE => {
                check_len(4)?;
                Message::Have(BE::read_u32(payload))
            }
            MSGID_BITFIELD => Message::Bitfield(payload),
            MSGID_REQUEST | MSGID_CANCEL => {
                check_len(12)?;
                let r = Request {
                    index: BE::read_u32(&payload[0..4]),
                    begin: BE::read_u32(&payload[4..8]),
                    length: BE::read_u32(&payload[8..12]),
                };
                if msg_id == MSGID_REQUEST {
                    Message::Request(r)
                } else {
                    Message::Cancel(r)
                }
            }
            MSGID_PIECE => {
                if payload_len < 9 {
                    return Err(MessageError::WrongMessageLength {
                        msg_id,
                        received: payload_len,
                        expected: 9,
                    });
                }
                Message::Piece(PieceData {
                    index: BE::read_u32(&payload[0..4]),
                    begin: BE::read_u32(&payload[4..8]),
                    data: &payload[8..],
                })
            }
            other => return Err(MessageError::UnknownMessageId(other)),
        };
        Ok((msg, total_len))
    }
}

fn write_preamble(out: &mut Vec<u8>, payload_len: u32, msg_id: MsgId) {
    out.extend_from_slice(&(payload_len + 1).to_be_bytes());
    out.push(msg_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message<'_>) {
        let mut buf = Vec::new();
        let len = msg.serialize(&mut buf);
        assert_eq!(len, buf.len());
        let (back, consumed) = Message::deserialize(&buf).unwrap();
        assert_eq!(consumed, len);
        assert_eq!(back, msg);
    }

    #[test]
    fn handshake_round_trip() {
        let h = Handshake::new(Id20::new([7; 20]), Id20::new([9; 20]));
        let mut buf = Vec::new();
        h.serialize(&mut buf);
        assert_eq!(buf.len(), HANDSHAKE_LEN);
        assert_eq!(buf[0], 19);
        let (back, len) = Handshake::deserialize(&buf).unwrap();
        assert_eq!(len, HANDSHAKE_LEN);
        assert_eq!(back, h);
    }

    #[test]
    fn handshake_rejects_wrong_pstr() {
        let mut buf = Vec::new();
        Handshake::new(Id20::new([7; 20]), Id20::new([9; 20])).serialize(&mut buf);
        buf[1] = b'b';
        assert!(matches!(
            Handshake::deserialize(&buf),
            Err(MessageError::HandshakePstrContent)
        ));
        buf[0] = 18;
        assert!(matches!(
            Handshake::deserialize(&buf),
            Err(MessageError::HandshakePstrLength(18))
        ));
    }

    #[test]
    fn message_round_trips() {
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
        round_trip(Message::Have(42));
        round_trip(Message::Bitfield(&[0b1010_1010, 0b0100_0000]));
        round_trip(Message::Request(Request::new(1, 16384, 16384)));
        round_trip(Message::Cancel(Request::new(1, 16384, 16384)));
        round_trip(Message::Piece(PieceData {
            index: 3,
            begin: 32768,
            data: b"hello world",
        }));
    }

    #[test]
    fn keep_alive_is_four_zero_bytes() {
        let mut buf = Vec::new();
        assert_eq!(Message::KeepAlive.serialize(&mut buf), 4);
        assert_eq!(buf, [0, 0, 0, 0]);
        let (msg, len) = Message::deserialize(&buf).unwrap();
        assert_eq!(msg, Message::KeepAlive);
        assert_eq!(len, 4);
    }

    #[test]
    fn incremental_reads_report_missing_bytes() {
        let mut buf = Vec::new();
        Message::Have(7).serialize(&mut buf);
        for cut in 0..buf.len() {
            let expected = if cut < 4 { 4 - cut } else { buf.len() - cut };
            match Message::deserialize(&buf[..cut]) {
                Err(MessageError::NotEnoughData(n)) => assert_eq!(n, expected),
                other => panic!("expected NotEnoughData at cut={cut}, got {other:?}"),
            }
        }
    }

    #[test]
    fn oversized_frame_is_a_violation() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_PACKET_LEN + 1).to_be_bytes());
        buf.push(MSGID_PIECE);
        assert!(matches!(
            Message::deserialize(&buf),
            Err(MessageError::FrameTooLong(_))
        ));
        // The largest legal piece frame parses.
        let mut buf = Vec::new();
        let data = vec![0u8; 128 * 1024];
        Message::Piece(PieceData {
            index: 0,
            begin: 0,
            data: &data,
        })
        .serialize(&mut buf);
        assert!(Message::deserialize(&buf).is_ok());
    }

    #[test]
    fn unknown_id_and_bad_lengths() {
        let mut buf = Vec::new();
        write_preamble(&mut buf, 0, 14);
        assert!(matches!(
            Message::deserialize(&buf),
            Err(MessageError::UnknownMessageId(14))
        ));

        let mut buf = Vec::new();
        write_preamble(&mut buf, 3, MSGID_HAVE);
        buf.extend_from_slice(&[0, 0, 0]);
        assert!(matches!(
            Message::deserialize(&buf),
            Err(MessageError::WrongMessageLength {
                msg_id: MSGID_HAVE,
                received: 3,
                expected: 4,
            })
        ));
    }
}
