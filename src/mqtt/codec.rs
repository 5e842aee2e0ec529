//! Wire codec for MQTT 3.1.1 control packets
//!
//! [`encode`] and [`decode`] work on plain buffers. [`MqttCodec`] wraps them as a
//! `tokio_util` codec so a `Framed` transport buffers partial frames between reads:
//! the decoder never consumes bytes until a whole packet is available, so a frame split
//! across any number of reads decodes exactly once.
//!
//! ```text
//! ┌────────────┬──────────────────────┬───────────────────────────┐
//! │ type|flags │ remaining length     │ variable header + payload │
//! │   1 byte   │ 1-4 bytes (7 bit/B)  │ remaining length bytes    │
//! └────────────┴──────────────────────┴───────────────────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::error::{MqttError, ProtocolError};
use super::packet::{
    ConnAck, Connect, ConnectReturnCode, Packet, PacketType, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe, Will, MAX_REMAINING_LENGTH, PROTOCOL_LEVEL, PROTOCOL_NAME,
};

/// Upper bound for a whole frame (fixed header included)
pub const MAX_PACKET_SIZE: usize = MAX_REMAINING_LENGTH + 5;

const CONNECT_USERNAME: u8 = 0x80;
const CONNECT_PASSWORD: u8 = 0x40;
const CONNECT_WILL_RETAIN: u8 = 0x20;
const CONNECT_WILL_QOS_SHIFT: u8 = 3;
const CONNECT_WILL_FLAG: u8 = 0x04;
const CONNECT_CLEAN_SESSION: u8 = 0x02;
const CONNECT_RESERVED: u8 = 0x01;

/// Writes `len` as a variable-length integer
pub fn encode_remaining_length(len: usize, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::PacketTooLarge {
            size: len,
            max: MAX_REMAINING_LENGTH,
        });
    }

    let mut remaining = len;
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if remaining == 0 {
            return Ok(());
        }
    }
}

/// Reads a variable-length integer from the start of `buf`
///
/// Returns the value and the number of bytes it occupied, or `None` when `buf` ends
/// before the last length byte. A fourth byte with the continuation bit set is malformed.
pub fn decode_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, ProtocolError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (index, byte) in buf.iter().enumerate() {
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        if index == 3 {
            return Err(ProtocolError::MalformedRemainingLength);
        }
        multiplier *= 128;
    }

    Ok(None)
}

/// Encodes a packet into a new buffer
pub fn encode(packet: &Packet) -> Result<Bytes, ProtocolError> {
    let mut dst = BytesMut::new();
    encode_into(packet, &mut dst)?;
    Ok(dst.freeze())
}

/// Appends the encoded packet to `dst`
pub fn encode_into(packet: &Packet, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let mut body = BytesMut::new();

    let header = match packet {
        Packet::Connect(connect) => {
            encode_connect(connect, &mut body)?;
            fixed_header(PacketType::Connect, 0)
        }
        Packet::ConnAck(connack) => {
            body.put_u8(u8::from(connack.session_present));
            body.put_u8(connack.code as u8);
            fixed_header(PacketType::ConnAck, 0)
        }
        Packet::Publish(publish) => {
            encode_publish(publish, &mut body)?;
            let mut flags = (publish.qos as u8) << 1;
            if publish.dup {
                flags |= 0x08;
            }
            if publish.retain {
                flags |= 0x01;
            }
            fixed_header(PacketType::Publish, flags)
        }
        Packet::PubAck(id) => simple_ack(PacketType::PubAck, *id, &mut body)?,
        Packet::PubRec(id) => simple_ack(PacketType::PubRec, *id, &mut body)?,
        Packet::PubRel(id) => simple_ack(PacketType::PubRel, *id, &mut body)?,
        Packet::PubComp(id) => simple_ack(PacketType::PubComp, *id, &mut body)?,
        Packet::Subscribe(subscribe) => {
            if subscribe.filters.is_empty() {
                return Err(ProtocolError::EmptyTopicList(PacketType::Subscribe));
            }
            put_packet_id(subscribe.packet_id, &mut body)?;
            for (filter, qos) in &subscribe.filters {
                put_string(filter, &mut body)?;
                body.put_u8(*qos as u8);
            }
            fixed_header(PacketType::Subscribe, 0b0010)
        }
        Packet::SubAck(suback) => {
            put_packet_id(suback.packet_id, &mut body)?;
            for code in &suback.return_codes {
                body.put_u8(code.to_byte());
            }
            fixed_header(PacketType::SubAck, 0)
        }
        Packet::Unsubscribe(unsubscribe) => {
            if unsubscribe.filters.is_empty() {
                return Err(ProtocolError::EmptyTopicList(PacketType::Unsubscribe));
            }
            put_packet_id(unsubscribe.packet_id, &mut body)?;
            for filter in &unsubscribe.filters {
                put_string(filter, &mut body)?;
            }
            fixed_header(PacketType::Unsubscribe, 0b0010)
        }
        Packet::UnsubAck(id) => simple_ack(PacketType::UnsubAck, *id, &mut body)?,
        Packet::PingReq => fixed_header(PacketType::PingReq, 0),
        Packet::PingResp => fixed_header(PacketType::PingResp, 0),
        Packet::Disconnect => fixed_header(PacketType::Disconnect, 0),
    };

    dst.reserve(5 + body.len());
    dst.put_u8(header);
    encode_remaining_length(body.len(), dst)?;
    dst.extend_from_slice(&body);
    Ok(())
}

/// Decodes one packet from the start of `buf`
///
/// `Ok(None)` means more bytes are needed; nothing should be discarded in that case.
pub fn decode(buf: &[u8]) -> Result<Option<(Packet, usize)>, ProtocolError> {
    decode_with_limit(buf, MAX_PACKET_SIZE)
}

/// Same as [`decode`] but rejects frames longer than `max_packet_size` as soon as the
/// remaining length is known.
pub fn decode_with_limit(
    buf: &[u8],
    max_packet_size: usize,
) -> Result<Option<(Packet, usize)>, ProtocolError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };

    let packet_type = PacketType::from_nibble(first >> 4)?;
    let flags = first & 0x0F;

    let Some((remaining, length_bytes)) = decode_remaining_length(&buf[1..])? else {
        return Ok(None);
    };

    let total = 1 + length_bytes + remaining;
    if total > max_packet_size {
        return Err(ProtocolError::PacketTooLarge {
            size: total,
            max: max_packet_size,
        });
    }
    if buf.len() < total {
        return Ok(None);
    }

    let packet = decode_body(packet_type, flags, &buf[1 + length_bytes..total])?;
    Ok(Some((packet, total)))
}

fn decode_body(packet_type: PacketType, flags: u8, body: &[u8]) -> Result<Packet, ProtocolError> {
    if let Some(required) = packet_type.required_flags() {
        if flags != required {
            return Err(ProtocolError::InvalidFlags { packet_type, flags });
        }
    }

    let mut reader = Reader::new(body);
    let packet = match packet_type {
        PacketType::Connect => Packet::Connect(decode_connect(&mut reader)?),
        PacketType::ConnAck => {
            let ack_flags = reader.u8("connack flags")?;
            if ack_flags & !0x01 != 0 {
                return Err(ProtocolError::InvalidFlags { packet_type, flags: ack_flags });
            }
            let code = ConnectReturnCode::try_from(reader.u8("connack return code")?)?;
            Packet::ConnAck(ConnAck {
                session_present: ack_flags & 0x01 != 0,
                code,
            })
        }
        PacketType::Publish => Packet::Publish(decode_publish(flags, &mut reader)?),
        PacketType::PubAck => Packet::PubAck(reader.packet_id()?),
        PacketType::PubRec => Packet::PubRec(reader.packet_id()?),
        PacketType::PubRel => Packet::PubRel(reader.packet_id()?),
        PacketType::PubComp => Packet::PubComp(reader.packet_id()?),
        PacketType::Subscribe => {
            let packet_id = reader.packet_id()?;
            let mut filters = Vec::new();
            while reader.remaining() > 0 {
                let filter = reader.string("subscribe filter")?;
                let qos = QoS::try_from(reader.u8("subscribe qos")?)?;
                filters.push((filter, qos));
            }
            if filters.is_empty() {
                return Err(ProtocolError::EmptyTopicList(packet_type));
            }
            Packet::Subscribe(Subscribe { packet_id, filters })
        }
        PacketType::SubAck => {
            let packet_id = reader.packet_id()?;
            let return_codes = reader
                .rest()
                .iter()
                .map(|byte| SubscribeReturnCode::from_byte(*byte))
                .collect::<Result<Vec<_>, _>>()?;
            if return_codes.is_empty() {
                return Err(ProtocolError::EmptyTopicList(packet_type));
            }
            Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            })
        }
        PacketType::Unsubscribe => {
            let packet_id = reader.packet_id()?;
            let mut filters = Vec::new();
            while reader.remaining() > 0 {
                filters.push(reader.string("unsubscribe filter")?);
            }
            if filters.is_empty() {
                return Err(ProtocolError::EmptyTopicList(packet_type));
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, filters })
        }
        PacketType::UnsubAck => Packet::UnsubAck(reader.packet_id()?),
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    };

    if reader.remaining() > 0 {
        return Err(ProtocolError::TrailingBytes(reader.remaining()));
    }
    Ok(packet)
}

fn decode_connect(reader: &mut Reader<'_>) -> Result<Connect, ProtocolError> {
    let name = reader.string("protocol name")?;
    let level = reader.u8("protocol level")?;
    if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
        return Err(ProtocolError::InvalidProtocol { name, level });
    }

    let flags = reader.u8("connect flags")?;
    let has_will = flags & CONNECT_WILL_FLAG != 0;
    let will_bits = flags & (CONNECT_WILL_RETAIN | (0b11 << CONNECT_WILL_QOS_SHIFT));
    let password_without_user = flags & CONNECT_PASSWORD != 0 && flags & CONNECT_USERNAME == 0;
    if flags & CONNECT_RESERVED != 0 || (!has_will && will_bits != 0) || password_without_user {
        return Err(ProtocolError::InvalidConnectFlags(flags));
    }

    let keep_alive = reader.u16("keep alive")?;
    let client_id = reader.string("client id")?;

    let will = if has_will {
        let topic = reader.string("will topic")?;
        let payload = reader.binary("will payload")?;
        Some(Will {
            topic,
            payload,
            qos: QoS::try_from((flags >> CONNECT_WILL_QOS_SHIFT) & 0b11)?,
            retain: flags & CONNECT_WILL_RETAIN != 0,
        })
    } else {
        None
    };

    let username = if flags & CONNECT_USERNAME != 0 {
        Some(reader.string("username")?)
    } else {
        None
    };
    let password = if flags & CONNECT_PASSWORD != 0 {
        Some(reader.binary("password")?)
    } else {
        None
    };

    Ok(Connect {
        client_id,
        clean_session: flags & CONNECT_CLEAN_SESSION != 0,
        keep_alive,
        will,
        username,
        password,
    })
}

fn decode_publish(flags: u8, reader: &mut Reader<'_>) -> Result<Publish, ProtocolError> {
    let qos = QoS::try_from((flags >> 1) & 0b11)?;
    let dup = flags & 0x08 != 0;
    if dup && qos == QoS::AtMostOnce {
        return Err(ProtocolError::InvalidFlags {
            packet_type: PacketType::Publish,
            flags,
        });
    }

    let topic = reader.string("topic name")?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        QoS::AtLeastOnce | QoS::ExactlyOnce => Some(reader.packet_id()?),
    };
    let payload = Bytes::copy_from_slice(reader.rest());

    Ok(Publish {
        dup,
        qos,
        retain: flags & 0x01 != 0,
        topic,
        packet_id,
        payload,
    })
}

fn encode_connect(connect: &Connect, body: &mut BytesMut) -> Result<(), ProtocolError> {
    put_string(PROTOCOL_NAME, body)?;
    body.put_u8(PROTOCOL_LEVEL);

    let mut flags = 0u8;
    if connect.clean_session {
        flags |= CONNECT_CLEAN_SESSION;
    }
    if let Some(will) = &connect.will {
        flags |= CONNECT_WILL_FLAG | ((will.qos as u8) << CONNECT_WILL_QOS_SHIFT);
        if will.retain {
            flags |= CONNECT_WILL_RETAIN;
        }
    }
    if connect.username.is_some() {
        flags |= CONNECT_USERNAME;
    }
    if connect.password.is_some() {
        flags |= CONNECT_PASSWORD;
    }
    body.put_u8(flags);
    body.put_u16(connect.keep_alive);

    put_string(&connect.client_id, body)?;
    if let Some(will) = &connect.will {
        put_string(&will.topic, body)?;
        put_binary(&will.payload, body)?;
    }
    if let Some(username) = &connect.username {
        put_string(username, body)?;
    }
    if let Some(password) = &connect.password {
        put_binary(password, body)?;
    }
    Ok(())
}

fn encode_publish(publish: &Publish, body: &mut BytesMut) -> Result<(), ProtocolError> {
    put_string(&publish.topic, body)?;
    if publish.qos != QoS::AtMostOnce {
        put_packet_id(publish.packet_id.unwrap_or(0), body)?;
    }
    body.extend_from_slice(&publish.payload);
    Ok(())
}

fn simple_ack(
    packet_type: PacketType,
    packet_id: u16,
    body: &mut BytesMut,
) -> Result<u8, ProtocolError> {
    put_packet_id(packet_id, body)?;
    Ok(fixed_header(packet_type, packet_type.required_flags().unwrap_or(0)))
}

fn fixed_header(packet_type: PacketType, flags: u8) -> u8 {
    ((packet_type as u8) << 4) | (flags & 0x0F)
}

fn put_packet_id(packet_id: u16, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    if packet_id == 0 {
        return Err(ProtocolError::ZeroPacketId);
    }
    dst.put_u16(packet_id);
    Ok(())
}

fn put_string(value: &str, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    put_binary(value.as_bytes(), dst)
}

fn put_binary(value: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError> {
    let len = u16::try_from(value.len()).map_err(|_| ProtocolError::FieldTooLong(value.len()))?;
    dst.put_u16(len);
    dst.extend_from_slice(value);
    Ok(())
}

/// Bounds-checked cursor over a packet body
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], ProtocolError> {
        if self.buf.len() < len {
            return Err(ProtocolError::Truncated(what));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ProtocolError> {
        let mut bytes = self.take(2, what)?;
        Ok(bytes.get_u16())
    }

    fn packet_id(&mut self) -> Result<u16, ProtocolError> {
        match self.u16("packet identifier")? {
            0 => Err(ProtocolError::ZeroPacketId),
            id => Ok(id),
        }
    }

    fn string(&mut self, what: &'static str) -> Result<String, ProtocolError> {
        let len = usize::from(self.u16(what)?);
        let bytes = self.take(len, what)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn binary(&mut self, what: &'static str) -> Result<Bytes, ProtocolError> {
        let len = usize::from(self.u16(what)?);
        Ok(Bytes::copy_from_slice(self.take(len, what)?))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

/// Streaming codec for `tokio_util::codec::Framed`
#[derive(Debug, Clone)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl MqttCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_PACKET_SIZE),
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = MqttError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode_with_limit(src, self.max_packet_size)? {
            Some((packet, consumed)) => {
                src.advance(consumed);
                trace!("Decoded {:?} ({} bytes)", packet.packet_type(), consumed);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = MqttError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_into(&item, dst)?;
        Ok(())
    }
}
