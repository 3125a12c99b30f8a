use std::fmt;
use std::io::{Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::*;

/// 1 type + 3 length + 2 sequence + 3 fragment-offset + 3 fragment-length.
pub const HANDSHAKE_HEADER_LENGTH: usize = 12;

/// The MPS never interprets the handshake payload (spec §1 Non-goals: parsing
/// handshake payloads is out of scope), so the message type is carried as an
/// opaque byte rather than a closed enum of concrete handshake messages.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default, Hash)]
pub struct HandshakeType(pub u8);

impl fmt::Display for HandshakeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandshakeType({})", self.0)
    }
}

impl From<u8> for HandshakeType {
    fn from(val: u8) -> Self {
        HandshakeType(val)
    }
}

/// The 12-byte on-wire handshake header (spec §3 "Handshake message
/// (datagram)"): type, 24-bit total length, message sequence number
/// (independent of the record sequence number), 24-bit fragment offset and
/// 24-bit fragment length.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct HandshakeHeader {
    pub handshake_type: HandshakeType,
    pub length: u32,           // uint24 in spec
    pub message_sequence: u16,
    pub fragment_offset: u32,  // uint24 in spec
    pub fragment_length: u32,  // uint24 in spec
}

impl HandshakeHeader {
    pub fn size(&self) -> usize {
        HANDSHAKE_HEADER_LENGTH
    }

    pub fn marshal<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u8(self.handshake_type.0)?;
        writer.write_u24::<BigEndian>(self.length)?;
        writer.write_u16::<BigEndian>(self.message_sequence)?;
        writer.write_u24::<BigEndian>(self.fragment_offset)?;
        writer.write_u24::<BigEndian>(self.fragment_length)?;

        Ok(writer.flush()?)
    }

    pub fn unmarshal<R: Read>(reader: &mut R) -> Result<Self> {
        let handshake_type = reader.read_u8()?.into();
        let length = reader.read_u24::<BigEndian>()?;
        let message_sequence = reader.read_u16::<BigEndian>()?;
        let fragment_offset = reader.read_u24::<BigEndian>()?;
        let fragment_length = reader.read_u24::<BigEndian>()?;

        Ok(HandshakeHeader {
            handshake_type,
            length,
            message_sequence,
            fragment_offset,
            fragment_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let h = HandshakeHeader {
            handshake_type: HandshakeType(1),
            length: 2048,
            message_sequence: 7,
            fragment_offset: 1200,
            fragment_length: 848,
        };
        let mut buf = vec![];
        h.marshal(&mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_HEADER_LENGTH);
        let back = HandshakeHeader::unmarshal(&mut buf.as_slice()).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn handshake_type_is_opaque() {
        assert_eq!(HandshakeType::from(200), HandshakeType(200));
    }
}
