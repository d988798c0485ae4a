use std::io;

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec;

use super::protocol::{
    Packet, PacketType, HEADER_SIZE, MAGIC_REQ, MAGIC_RES, NULL_BYTE,
};
use crate::error::ProtocolError;

/// An encoder for one side of a Gearman connection. `is_response` selects
/// the magic written on binary frames: `false` for clients and workers
/// talking to a server.
#[derive(Clone, Debug, Default)]
pub struct PacketEncoder {
    pub is_response: bool,
}

impl codec::Encoder<Packet> for PacketEncoder {
    type Error = Error;

    fn encode(
        &mut self,
        item: Packet,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        if item.kind == PacketType::TextCommand {
            pack_text_packet(&item, dst)?;
        } else {
            pack_binary_packet(&item, self.is_response, dst)?;
        }

        Ok(())
    }
}

/// Serialises one binary frame onto `dst`.
///
/// Validates that the command is a known binary command, that the argument
/// count matches the catalog signature, and that no argument except the
/// last declared one contains a NUL byte.
pub fn pack_binary_packet(
    packet: &Packet,
    is_response: bool,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    let kind = packet.kind;
    if kind == PacketType::TextCommand {
        return Err(ProtocolError::NotBinary(kind));
    }

    let params = kind.param_names();
    if packet.args.len() != params.len() {
        return Err(ProtocolError::WrongArgCount {
            kind,
            received: packet.args.len(),
            expected: params.len(),
        });
    }

    for (arg, &param) in
        packet.args.iter().zip(params).take(params.len().saturating_sub(1))
    {
        if arg.contains(&NULL_BYTE) {
            return Err(ProtocolError::NullByteInArg { kind, param });
        }
    }

    let payload_len = packet.args.iter().map(|a| a.len()).sum::<usize>()
        + packet.args.len().saturating_sub(1);

    dst.reserve(HEADER_SIZE + payload_len);
    dst.put_slice(if is_response { MAGIC_RES } else { MAGIC_REQ });
    dst.put_u32(kind.opcode());
    dst.put_u32(payload_len as u32);

    for (idx, arg) in packet.args.iter().enumerate() {
        if idx > 0 {
            dst.put_u8(NULL_BYTE);
        }
        dst.put_slice(arg);
    }

    Ok(())
}

/// Serialises one admin protocol line onto `dst`, unchanged: the caller
/// supplies the line terminator as part of `raw_text`.
pub fn pack_text_packet(
    packet: &Packet,
    dst: &mut BytesMut,
) -> Result<(), ProtocolError> {
    if packet.kind != PacketType::TextCommand {
        return Err(ProtocolError::NotText(packet.kind));
    }

    let [raw_text] = packet.expect_args::<1>()?;

    dst.reserve(raw_text.len());
    dst.put_slice(raw_text);

    Ok(())
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
