use anyhow::{bail, Result};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::packet::{parse_remaining_length, Packet, MAX_PACKET_SIZE};

/// Frame-level MQTT codec for use with `tokio_util::codec::Framed`.
#[derive(Debug, Default)]
pub struct MqttCodec;

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = anyhow::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Packet>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let Some((body_len, len_bytes)) = parse_remaining_length(buf, 1)? else {
            return Ok(None);
        };
        if body_len > MAX_PACKET_SIZE {
            bail!("Packet too large: {body_len} bytes");
        }

        let frame_len = 1 + len_bytes + body_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let first_byte = buf[0];
        buf.advance(1 + len_bytes);
        let body = buf.split_to(body_len).freeze();

        Packet::decode(first_byte, body).map(Some)
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, packet: Packet, buf: &mut BytesMut) -> Result<()> {
        packet.encode(buf)
    }
}
