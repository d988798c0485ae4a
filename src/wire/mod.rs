use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{self, Decoder as _, Encoder as _, Framed};

use protocol::Packet;

pub mod decoder;
pub mod encoder;
pub mod protocol;

/// Wraps a stream in a client-side framed codec (expects response magic
/// inbound, writes request magic outbound).
///
/// ```
/// use gearman_rs::wire;
/// use tokio_test::block_on;
///
/// block_on(async {
///     let (stream, _server_half) = tokio::io::duplex(64);
///     let _framed = wire::framed(stream);
/// });
/// ```
pub fn framed<T: AsyncRead + AsyncWrite>(stream: T) -> Framed<T, Codec> {
    Framed::new(stream, Default::default())
}

/// The paired decoder and encoder for one side of a connection.
#[derive(Clone, Debug, Default)]
pub struct Codec {
    d: decoder::PacketDecoder,
    e: encoder::PacketEncoder,
}

impl Codec {
    /// A codec for the server side of the protocol, as used by loopback
    /// test fixtures: parses requests, emits responses.
    pub fn server_side() -> Self {
        Self {
            d: decoder::PacketDecoder { is_response: false },
            e: encoder::PacketEncoder { is_response: true },
        }
    }
}

impl codec::Decoder for Codec {
    type Item = Packet;

    type Error = decoder::Error;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        self.d.decode(src)
    }
}

impl codec::Encoder<Packet> for Codec {
    type Error = encoder::Error;

    fn encode(
        &mut self,
        item: Packet,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        self.e.encode(item, dst)
    }
}

#[cfg(test)]
mod tests {
    use bytes::{BufMut, Bytes, BytesMut};
    use tokio_stream::StreamExt;
    use tokio_util::codec::FramedRead;

    use super::protocol::{Packet, PacketType, MAGIC_RES};
    use super::*;

    // A stream mixing binary response frames and admin text lines decodes
    // in wire order, switching parser per frame.
    #[tokio::test]
    async fn test_mixed_stream() {
        let mut stream = BytesMut::new();
        stream.put_slice(MAGIC_RES);
        stream.put_u32(PacketType::JobCreated.opcode());
        stream.put_u32(7);
        stream.put_slice(b"H:lap:1");
        stream.put_slice(b"0.13\n");
        stream.put_slice(MAGIC_RES);
        stream.put_u32(PacketType::Noop.opcode());
        stream.put_u32(0);
        let stream = stream.freeze();

        let expect = [
            Packet::new(
                PacketType::JobCreated,
                vec![Bytes::from_static(b"H:lap:1")],
            ),
            Packet::text(Bytes::from_static(b"0.13")),
            Packet::empty(PacketType::Noop),
        ];

        let mut framed = FramedRead::new(stream.as_ref(), Codec::default());

        for packet in expect {
            let got = framed.next().await;
            assert_eq!(got.unwrap().unwrap(), packet);
        }

        // End of stream should be OK
        assert!(framed.next().await.is_none());
    }
}
