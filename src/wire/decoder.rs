use std::io;

use bytes::{Buf, Bytes, BytesMut};
use itertools::Itertools;
use thiserror::Error;
use tokio_util::codec;

use super::protocol::{
    Packet, PacketType, HEADER_SIZE, MAGIC_REQ, MAGIC_RES, NULL_BYTE,
};
use crate::error::ProtocolError;

/// A decoder for one side of a Gearman connection.
///
/// Binary frames and admin text lines share the stream; a frame is binary
/// iff it opens with the NUL byte of a `\0REQ`/`\0RES` magic, so the first
/// byte of the buffer selects the parser. `is_response` states which magic
/// this side expects to receive: `true` for clients and workers talking to
/// a server.
#[derive(Clone, Debug)]
pub struct PacketDecoder {
    pub is_response: bool,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self { is_response: true }
    }
}

impl codec::Decoder for PacketDecoder {
    type Item = Packet;

    type Error = Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] == NULL_BYTE {
            parse_binary_packet(src, self.is_response).map_err(Into::into)
        } else {
            parse_text_packet(src).map_err(Into::into)
        }
    }
}

/// Consumes the longest prefix of `src` forming one complete binary frame.
///
/// Returns `Ok(None)` when the buffer holds less than a full header or less
/// payload than the header declares; the buffer is left untouched so more
/// bytes can be appended. On success exactly `HEADER_SIZE` plus the declared
/// payload size is consumed.
pub fn parse_binary_packet(
    src: &mut BytesMut,
    is_response: bool,
) -> Result<Option<Packet>, ProtocolError> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    match &src[0..4] {
        m if m == MAGIC_RES => {
            if !is_response {
                return Err(ProtocolError::UnexpectedMagic {
                    received: "RES",
                    expected: "REQ",
                });
            }
        },
        m if m == MAGIC_REQ => {
            if is_response {
                return Err(ProtocolError::UnexpectedMagic {
                    received: "REQ",
                    expected: "RES",
                });
            }
        },
        _ => return Err(ProtocolError::BadMagic),
    }

    // Panic safety: the length check above guarantees 12 header bytes.
    let opcode = u32::from_be_bytes(src[4..8].try_into().unwrap());
    let payload_len = u32::from_be_bytes(src[8..12].try_into().unwrap()) as usize;

    let kind = PacketType::from_opcode(opcode)
        .ok_or(ProtocolError::UnknownCommand(opcode))?;
    if kind == PacketType::TextCommand {
        // The synthetic text opcode has no binary encoding.
        return Err(ProtocolError::NotBinary(kind));
    }

    if src.len() < HEADER_SIZE + payload_len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    let params = kind.param_names();
    if params.is_empty() {
        if !payload.is_empty() {
            return Err(ProtocolError::WrongArgCount {
                kind,
                received: 1,
                expected: 0,
            });
        }
        return Ok(Some(Packet::empty(kind)));
    }

    let args = split_args(payload, params.len());
    if args.len() != params.len() {
        return Err(ProtocolError::WrongArgCount {
            kind,
            received: args.len(),
            expected: params.len(),
        });
    }

    Ok(Some(Packet::new(kind, args)))
}

/// Splits a payload on NUL into at most `arity` arguments; the final
/// argument keeps any further NUL bytes. Yields fewer than `arity` pieces
/// when the payload holds too few separators.
fn split_args(payload: Bytes, arity: usize) -> Vec<Bytes> {
    let mut args = Vec::with_capacity(arity);
    let mut rest = payload;

    for _ in 1..arity {
        match rest.iter().position(|&b| b == NULL_BYTE) {
            Some(idx) => {
                args.push(rest.slice(..idx));
                rest = rest.slice(idx + 1..);
            },
            None => break,
        }
    }

    args.push(rest);
    args
}

/// Consumes one admin protocol line, up to and including the first `\n`.
///
/// The resulting TEXT_COMMAND packet carries the line without its
/// terminator. Returns `Ok(None)` until a full line is buffered.
pub fn parse_text_packet(
    src: &mut BytesMut,
) -> Result<Option<Packet>, ProtocolError> {
    let Some((idx, _)) = src.iter().find_position(|&&b| b == b'\n') else {
        return Ok(None);
    };

    if src[..idx].contains(&NULL_BYTE) {
        return Err(ProtocolError::NullByteInTextCommand);
    }

    // Panic safety: find_position guarantees idx < src.len(), so both the
    // split and the one-byte advance are in bounds.
    let line = src.split_to(idx).freeze();
    src.advance(1);

    Ok(Some(Packet::text(line)))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
