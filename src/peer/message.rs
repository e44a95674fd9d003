use crate::error::{PeerError, Result};
use crate::piece::{Bitfield, PieceLayout};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Messages exchanged between peers after the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Stop serving the receiver's requests
    Choke,
    /// Start serving the receiver's requests
    Unchoke,
    /// Sender wants pieces the receiver holds
    Interested,
    /// Sender wants nothing from the receiver
    NotInterested,
    /// Sender now holds a piece
    Have { piece_index: u32 },
    /// Every piece the sender holds, sent once right after the handshake
    Bitfield { bitfield: Bitfield },
    /// Ask for a whole piece
    Request { piece_index: u32 },
    /// A whole piece
    Piece { piece_index: u32, data: Bytes },
}

impl PeerMessage {
    /// Message type IDs
    const CHOKE: u8 = 0;
    const UNCHOKE: u8 = 1;
    const INTERESTED: u8 = 2;
    const NOT_INTERESTED: u8 = 3;
    const HAVE: u8 = 4;
    const BITFIELD: u8 = 5;
    const REQUEST: u8 = 6;
    const PIECE: u8 = 7;

    /// Serialize message to bytes
    /// Format: <length prefix><message ID><payload>
    /// The length prefix counts the ID and payload, never itself.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();

        match self {
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(Self::CHOKE);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(Self::UNCHOKE);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(Self::INTERESTED);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(Self::NOT_INTERESTED);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // length = 1 + 4
                buf.put_u8(Self::HAVE);
                buf.put_u32(*piece_index);
            }
            PeerMessage::Bitfield { bitfield } => {
                let bits = bitfield.as_bytes();
                buf.put_u32((1 + bits.len()) as u32);
                buf.put_u8(Self::BITFIELD);
                buf.put_slice(bits);
            }
            PeerMessage::Request { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(Self::REQUEST);
                buf.put_u32(*piece_index);
            }
            PeerMessage::Piece { piece_index, data } => {
                buf.put_u32((5 + data.len()) as u32);
                buf.put_u8(Self::PIECE);
                buf.put_u32(*piece_index);
                buf.put_slice(data);
            }
        }

        buf.to_vec()
    }

    /// Deserialize a full frame, length prefix included.
    ///
    /// Piece indices and piece lengths are checked against `layout`.
    pub fn from_bytes(mut data: &[u8], layout: &PieceLayout) -> Result<Self> {
        if data.len() < 5 {
            return Err(PeerError::MalformedMessage(format!(
                "frame of {} bytes is too short",
                data.len()
            )));
        }

        let length = data.get_u32() as usize;
        if length != data.len() {
            return Err(PeerError::MalformedMessage(format!(
                "declared length {} but {} bytes supplied",
                length,
                data.len()
            )));
        }

        let message_id = data.get_u8();
        let mut payload = data;

        match message_id {
            Self::CHOKE => expect_empty(payload, "choke").map(|_| PeerMessage::Choke),
            Self::UNCHOKE => expect_empty(payload, "unchoke").map(|_| PeerMessage::Unchoke),
            Self::INTERESTED => {
                expect_empty(payload, "interested").map(|_| PeerMessage::Interested)
            }
            Self::NOT_INTERESTED => {
                expect_empty(payload, "not interested").map(|_| PeerMessage::NotInterested)
            }
            Self::HAVE => {
                let piece_index = read_index(payload, "have", layout)?;
                Ok(PeerMessage::Have { piece_index })
            }
            Self::BITFIELD => {
                let bitfield = Bitfield::from_bytes(payload, layout.piece_count())
                    .ok_or_else(|| {
                        PeerError::MalformedMessage(format!(
                            "bitfield of {} bytes for {} pieces",
                            payload.len(),
                            layout.piece_count()
                        ))
                    })?;
                Ok(PeerMessage::Bitfield { bitfield })
            }
            Self::REQUEST => {
                let piece_index = read_index(payload, "request", layout)?;
                Ok(PeerMessage::Request { piece_index })
            }
            Self::PIECE => {
                if payload.len() < 4 {
                    return Err(PeerError::MalformedMessage(
                        "piece payload shorter than its index".to_string(),
                    ));
                }
                let piece_index = payload.get_u32();
                layout.check_index(piece_index)?;

                let expected = layout.piece_len(piece_index);
                if payload.len() != expected {
                    return Err(PeerError::PieceLengthMismatch {
                        index: piece_index,
                        expected,
                        actual: payload.len(),
                    });
                }

                Ok(PeerMessage::Piece {
                    piece_index,
                    data: Bytes::copy_from_slice(payload),
                })
            }
            _ => Err(PeerError::MalformedMessage(format!(
                "unknown message ID: {}",
                message_id
            ))),
        }
    }
}

fn expect_empty(payload: &[u8], name: &str) -> Result<()> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(PeerError::MalformedMessage(format!(
            "{} message carries {} payload bytes",
            name,
            payload.len()
        )))
    }
}

fn read_index(mut payload: &[u8], name: &str, layout: &PieceLayout) -> Result<u32> {
    if payload.len() != 4 {
        return Err(PeerError::MalformedMessage(format!(
            "{} payload must be 4 bytes, got {}",
            name,
            payload.len()
        )));
    }
    let piece_index = payload.get_u32();
    layout.check_index(piece_index)?;
    Ok(piece_index)
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerMessage::Choke => write!(f, "choke"),
            PeerMessage::Unchoke => write!(f, "unchoke"),
            PeerMessage::Interested => write!(f, "interested"),
            PeerMessage::NotInterested => write!(f, "not interested"),
            PeerMessage::Have { piece_index } => write!(f, "have {}", piece_index),
            PeerMessage::Bitfield { bitfield } => {
                write!(f, "bitfield ({}/{})", bitfield.count(), bitfield.len())
            }
            PeerMessage::Request { piece_index } => write!(f, "request {}", piece_index),
            PeerMessage::Piece { piece_index, data } => {
                write!(f, "piece {} ({} bytes)", piece_index, data.len())
            }
        }
    }
}
