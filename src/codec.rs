//! VarInts, strings and packet framing for the Server List Ping protocol.
//!
//! Decoders work on a borrowed buffer and an offset, and return `Ok(None)`
//! when the buffer doesn't hold enough bytes yet. That's not an error, the
//! caller keeps the bytes around and tries again after the next read.

use crate::error::ProtocolError;

/// A decoded value along with the offset right after it, or `None` if more
/// data is needed.
pub type Decoded<T> = Result<Option<(T, usize)>, ProtocolError>;

pub const MAX_VARINT_LENGTH: usize = 5;
/// Maximum length for protocol strings.
pub const MAX_STRING_LENGTH: u32 = 32767;
/// The status json is allowed to be longer than normal strings since it
/// contains the favicon. Vanilla counts characters, we count bytes.
pub const MAX_STATUS_JSON_LENGTH: u32 = MAX_STRING_LENGTH * 4;
/// Largest frame a vanilla server will ever send (3 byte varint).
pub const MAX_PACKET_LENGTH: u32 = 2_097_151;

pub fn write_varint(writer: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0b0111_1111) as u8;
        value >>= 7;
        if value == 0 {
            writer.push(byte);
            return;
        }
        writer.push(byte | 0b1000_0000);
    }
}

pub fn encode_varint(value: u32) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(MAX_VARINT_LENGTH);
    write_varint(&mut buffer, value);
    buffer
}

pub fn decode_varint(buffer: &[u8], offset: usize) -> Decoded<u32> {
    let mut ans: u32 = 0;
    for i in 0..MAX_VARINT_LENGTH {
        let Some(&byte) = buffer.get(offset + i) else {
            return Ok(None);
        };
        ans |= ((byte & 0b0111_1111) as u32) << (7 * i);
        if byte & 0b1000_0000 == 0 {
            return Ok(Some((ans, offset + i + 1)));
        }
    }
    Err(ProtocolError::VarIntTooLarge)
}

pub fn write_string(writer: &mut Vec<u8>, value: &str) {
    write_varint(writer, value.len() as u32);
    writer.extend_from_slice(value.as_bytes());
}

pub fn encode_string(value: &str) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(value.len() + MAX_VARINT_LENGTH);
    write_string(&mut buffer, value);
    buffer
}

pub fn decode_string(buffer: &[u8], offset: usize) -> Decoded<String> {
    decode_string_with_limit(buffer, offset, MAX_STRING_LENGTH)
}

pub fn decode_string_with_limit(buffer: &[u8], offset: usize, max_length: u32) -> Decoded<String> {
    let Some((length, start)) = decode_varint(buffer, offset)? else {
        return Ok(None);
    };
    // varints are unsigned here, so a negative length shows up as a huge one
    if length > max_length {
        return Err(ProtocolError::InvalidStringLength(length));
    }
    let end = start + length as usize;
    if buffer.len() < end {
        return Ok(None);
    }
    let string =
        String::from_utf8(buffer[start..end].to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(Some((string, end)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u32,
    pub payload: Vec<u8>,
}

/// Frame a packet as `length | id | payload`, where the length covers the id
/// and the payload.
pub fn encode_packet(id: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = encode_varint(id);
    body.extend_from_slice(payload);

    let mut packet = Vec::with_capacity(body.len() + MAX_VARINT_LENGTH);
    write_varint(&mut packet, body.len() as u32);
    packet.append(&mut body);
    packet
}

/// Try to read one complete packet from the front of the buffer. The returned
/// offset is the number of bytes the packet took up.
pub fn read_packet(buffer: &[u8]) -> Decoded<Packet> {
    let Some((length, body_start)) = decode_varint(buffer, 0)? else {
        return Ok(None);
    };
    if length == 0 || length > MAX_PACKET_LENGTH {
        return Err(ProtocolError::InvalidPacketLength(length));
    }
    let end = body_start + length as usize;
    if buffer.len() < end {
        return Ok(None);
    }

    let body = &buffer[body_start..end];
    let Some((id, id_end)) = decode_varint(body, 0)? else {
        // the length said the id would fit but it didn't
        return Err(ProtocolError::InvalidPacketLength(length));
    };
    Ok(Some((
        Packet {
            id,
            payload: body[id_end..].to_vec(),
        },
        end,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_300() {
        assert_eq!(encode_varint(300), vec![0xAC, 0x02]);
    }

    #[test]
    fn test_varint_round_trip_edges() {
        for value in [0, 1, 127, 128, 255, 25565, 2_097_151, 2_097_152, i32::MAX as u32, u32::MAX] {
            let encoded = encode_varint(value);
            assert!(encoded.len() <= MAX_VARINT_LENGTH);
            assert_eq!(
                decode_varint(&encoded, 0).unwrap(),
                Some((value, encoded.len()))
            );
        }
    }

    #[test]
    fn test_negative_protocol_version_takes_five_bytes() {
        assert_eq!(encode_varint(-1i32 as u32), vec![0xff, 0xff, 0xff, 0xff, 0x0f]);
    }

    #[test]
    fn test_decode_at_offset() {
        let buffer = [0x00, 0x00, 0xAC, 0x02, 0x7f];
        assert_eq!(decode_varint(&buffer, 2).unwrap(), Some((300, 4)));
        assert_eq!(decode_varint(&buffer, 4).unwrap(), Some((127, 5)));
    }

    #[test]
    fn test_varint_needs_more_data() {
        assert_eq!(decode_varint(&[0xAC], 0).unwrap(), None);
        assert_eq!(decode_varint(&[], 0).unwrap(), None);
    }

    #[test]
    fn test_varint_too_large() {
        assert_eq!(
            decode_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01], 0),
            Err(ProtocolError::VarIntTooLarge)
        );
    }

    #[test]
    fn test_string_round_trip() {
        let encoded = encode_string("play.example.com");
        assert_eq!(encoded[0], 16);
        assert_eq!(
            decode_string(&encoded, 0).unwrap(),
            Some(("play.example.com".to_string(), encoded.len()))
        );
    }

    #[test]
    fn test_string_needs_more_data() {
        let encoded = encode_string("hello");
        assert_eq!(decode_string(&encoded[..3], 0).unwrap(), None);
    }

    #[test]
    fn test_string_too_long() {
        let mut buffer = Vec::new();
        write_varint(&mut buffer, 40000);
        assert_eq!(
            decode_string(&buffer, 0),
            Err(ProtocolError::InvalidStringLength(40000))
        );
        // a negative length is just a very large unsigned one
        let mut buffer = Vec::new();
        write_varint(&mut buffer, -5i32 as u32);
        assert!(matches!(
            decode_string(&buffer, 0),
            Err(ProtocolError::InvalidStringLength(_))
        ));
    }

    #[test]
    fn test_read_packet_partial_and_remainder() {
        let mut buffer = encode_packet(0x00, &encode_string("{}"));
        let first_len = buffer.len();
        buffer.extend(encode_packet(0x01, &[1, 2, 3, 4, 5, 6, 7, 8]));

        for cut in 0..first_len {
            assert_eq!(read_packet(&buffer[..cut]).unwrap(), None);
        }

        let (packet, consumed) = read_packet(&buffer).unwrap().unwrap();
        assert_eq!(consumed, first_len);
        assert_eq!(packet.id, 0x00);
        assert_eq!(packet.payload, encode_string("{}"));

        let (packet, _) = read_packet(&buffer[consumed..]).unwrap().unwrap();
        assert_eq!(packet.id, 0x01);
        assert_eq!(packet.payload, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_read_packet_rejects_zero_length() {
        assert_eq!(
            read_packet(&[0x00, 0x00]),
            Err(ProtocolError::InvalidPacketLength(0))
        );
    }
}
