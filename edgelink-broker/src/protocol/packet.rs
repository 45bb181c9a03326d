use anyhow::{anyhow, bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_LEVEL: u8 = 4;

/// Largest remaining length we accept. The driver protocol moves small
/// control packets and modest data payloads; anything beyond this is a
/// broken or hostile peer.
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck { packet_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Connect {
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<LastWill>,
    pub clean_session: bool,
    pub keep_alive: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0x00,
    UnacceptableProtocol = 0x01,
    IdentifierRejected = 0x02,
    ServerUnavailable = 0x03,
    BadCredentials = 0x04,
    NotAuthorized = 0x05,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
}

impl Publish {
    /// QoS 0 publish, the only kind the protocol emits.
    pub fn qos0(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: 0,
            retain: false,
            dup: false,
            packet_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Subscribe {
    pub packet_id: u16,
    /// `(filter, requested_qos)` pairs, in order.
    pub filters: Vec<(String, u8)>,
}

/// SUBACK return code for a denied filter.
pub const SUBACK_FAILURE: u8 = 0x80;

#[derive(Debug, Clone, PartialEq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

impl Packet {
    /// Parse one packet from a fixed header byte and its body.
    pub fn decode(first_byte: u8, mut body: Bytes) -> Result<Packet> {
        let packet_type = first_byte >> 4;
        let flags = first_byte & 0x0f;

        match packet_type {
            1 => decode_connect(&mut body),
            2 => decode_connack(&mut body),
            3 => decode_publish(flags, &mut body),
            8 => decode_subscribe(flags, &mut body),
            9 => decode_suback(&mut body),
            10 => decode_unsubscribe(flags, &mut body),
            11 => {
                let packet_id = take_u16(&mut body)?;
                Ok(Packet::UnsubAck { packet_id })
            }
            12 => Ok(Packet::PingReq),
            13 => Ok(Packet::PingResp),
            14 => Ok(Packet::Disconnect),
            other => bail!("Unsupported packet type: {other}"),
        }
    }

    /// Encode this packet, fixed header included, into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        let first_byte = match self {
            Packet::Connect(c) => {
                encode_connect(c, &mut body);
                0x10
            }
            Packet::ConnAck(a) => {
                body.put_u8(a.session_present as u8);
                body.put_u8(a.code as u8);
                0x20
            }
            Packet::Publish(p) => {
                put_string(&mut body, &p.topic);
                if p.qos > 0 {
                    body.put_u16(p.packet_id.unwrap_or(0));
                }
                body.extend_from_slice(&p.payload);
                0x30 | ((p.dup as u8) << 3) | (p.qos << 1) | (p.retain as u8)
            }
            Packet::Subscribe(s) => {
                body.put_u16(s.packet_id);
                for (filter, qos) in &s.filters {
                    put_string(&mut body, filter);
                    body.put_u8(*qos);
                }
                0x82
            }
            Packet::SubAck(s) => {
                body.put_u16(s.packet_id);
                for code in &s.return_codes {
                    body.put_u8(*code);
                }
                0x90
            }
            Packet::Unsubscribe(u) => {
                body.put_u16(u.packet_id);
                for filter in &u.filters {
                    put_string(&mut body, filter);
                }
                0xa2
            }
            Packet::UnsubAck { packet_id } => {
                body.put_u16(*packet_id);
                0xb0
            }
            Packet::PingReq => 0xc0,
            Packet::PingResp => 0xd0,
            Packet::Disconnect => 0xe0,
        };

        if body.len() > MAX_PACKET_SIZE {
            bail!("Packet too large: {} bytes", body.len());
        }

        buf.reserve(1 + 4 + body.len());
        buf.put_u8(first_byte);
        put_remaining_length(buf, body.len());
        buf.extend_from_slice(&body);
        Ok(())
    }
}

fn encode_connect(c: &Connect, body: &mut BytesMut) {
    put_string(body, PROTOCOL_NAME);
    body.put_u8(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if c.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &c.will {
        flags |= 0x04 | (will.qos << 3) | ((will.retain as u8) << 5);
    }
    if c.password.is_some() {
        flags |= 0x40;
    }
    if c.username.is_some() {
        flags |= 0x80;
    }
    body.put_u8(flags);
    body.put_u16(c.keep_alive);

    put_string(body, &c.client_id);
    if let Some(will) = &c.will {
        put_string(body, &will.topic);
        body.put_u16(will.payload.len() as u16);
        body.extend_from_slice(&will.payload);
    }
    if let Some(username) = &c.username {
        put_string(body, username);
    }
    if let Some(password) = &c.password {
        body.put_u16(password.len() as u16);
        body.extend_from_slice(password);
    }
}

fn decode_connect(body: &mut Bytes) -> Result<Packet> {
    let protocol = take_string(body)?;
    if protocol != PROTOCOL_NAME {
        bail!("Unknown protocol name: {protocol}");
    }
    let level = take_u8(body)?;
    if level != PROTOCOL_LEVEL {
        bail!("Unsupported protocol level: {level}");
    }

    let flags = take_u8(body)?;
    if flags & 0x01 != 0 {
        bail!("Reserved connect flag set");
    }
    let keep_alive = take_u16(body)?;

    let client_id = take_string(body)?;

    let will = if flags & 0x04 != 0 {
        let topic = take_string(body)?;
        let payload = take_bytes(body)?;
        Some(LastWill {
            topic,
            payload,
            qos: (flags >> 3) & 0x03,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };

    let username = if flags & 0x80 != 0 {
        Some(take_string(body)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(take_bytes(body)?)
    } else {
        None
    };

    Ok(Packet::Connect(Connect {
        client_id,
        username,
        password,
        will,
        clean_session: flags & 0x02 != 0,
        keep_alive,
    }))
}

fn decode_connack(body: &mut Bytes) -> Result<Packet> {
    let ack_flags = take_u8(body)?;
    let code = match take_u8(body)? {
        0x00 => ConnectReturnCode::Accepted,
        0x01 => ConnectReturnCode::UnacceptableProtocol,
        0x02 => ConnectReturnCode::IdentifierRejected,
        0x03 => ConnectReturnCode::ServerUnavailable,
        0x04 => ConnectReturnCode::BadCredentials,
        0x05 => ConnectReturnCode::NotAuthorized,
        other => bail!("Unknown CONNACK return code: {other}"),
    };
    Ok(Packet::ConnAck(ConnAck {
        session_present: ack_flags & 0x01 != 0,
        code,
    }))
}

fn decode_publish(flags: u8, body: &mut Bytes) -> Result<Packet> {
    let qos = (flags >> 1) & 0x03;
    if qos > 2 {
        bail!("Invalid publish QoS: {qos}");
    }
    let topic = take_string(body)?;
    let packet_id = if qos > 0 { Some(take_u16(body)?) } else { None };
    Ok(Packet::Publish(Publish {
        topic,
        payload: body.split_off(0),
        qos,
        retain: flags & 0x01 != 0,
        dup: flags & 0x08 != 0,
        packet_id,
    }))
}

fn decode_subscribe(flags: u8, body: &mut Bytes) -> Result<Packet> {
    if flags != 0x02 {
        bail!("Invalid SUBSCRIBE flags: {flags:#x}");
    }
    let packet_id = take_u16(body)?;
    let mut filters = Vec::new();
    while body.has_remaining() {
        let filter = take_string(body)?;
        let qos = take_u8(body)?;
        if qos > 2 {
            bail!("Invalid subscription QoS: {qos}");
        }
        filters.push((filter, qos));
    }
    if filters.is_empty() {
        bail!("SUBSCRIBE with no topic filters");
    }
    Ok(Packet::Subscribe(Subscribe { packet_id, filters }))
}

fn decode_suback(body: &mut Bytes) -> Result<Packet> {
    let packet_id = take_u16(body)?;
    let return_codes = body.split_off(0).to_vec();
    Ok(Packet::SubAck(SubAck {
        packet_id,
        return_codes,
    }))
}

fn decode_unsubscribe(flags: u8, body: &mut Bytes) -> Result<Packet> {
    if flags != 0x02 {
        bail!("Invalid UNSUBSCRIBE flags: {flags:#x}");
    }
    let packet_id = take_u16(body)?;
    let mut filters = Vec::new();
    while body.has_remaining() {
        filters.push(take_string(body)?);
    }
    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, filters }))
}

/// Encode a remaining-length value as the 7-bit continuation varint.
pub fn put_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

/// Decode a remaining-length varint from `buf[offset..]`.
///
/// Returns `(value, bytes_consumed)`, or None if more input is needed.
pub fn parse_remaining_length(buf: &[u8], offset: usize) -> Result<Option<(usize, usize)>> {
    let mut value: usize = 0;
    let mut shift = 0u32;
    for (i, byte) in buf[offset..].iter().enumerate() {
        if i >= 4 {
            bail!("Remaining length exceeds four bytes");
        }
        value |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        shift += 7;
    }
    Ok(None)
}

fn take_u8(body: &mut Bytes) -> Result<u8> {
    if body.remaining() < 1 {
        return Err(anyhow!("Truncated packet"));
    }
    Ok(body.get_u8())
}

fn take_u16(body: &mut Bytes) -> Result<u16> {
    if body.remaining() < 2 {
        return Err(anyhow!("Truncated packet"));
    }
    Ok(body.get_u16())
}

fn take_bytes(body: &mut Bytes) -> Result<Bytes> {
    let len = take_u16(body)? as usize;
    if body.remaining() < len {
        return Err(anyhow!("Truncated packet"));
    }
    Ok(body.split_to(len))
}

fn take_string(body: &mut Bytes) -> Result<String> {
    let raw = take_bytes(body)?;
    String::from_utf8(raw.to_vec()).map_err(|_| anyhow!("Invalid UTF-8 string in packet"))
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}
