//! See [`PacketHeader`].

use octs::{BufError, BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write};

use crate::{crypto::NONCE_LEN, seq::SeqNum};

/// Length in bytes of an encoded [`PacketHeader`]. Also the length of the
/// AEAD additional authenticated data for every encrypted packet.
pub const HEADER_LEN: usize = 20;

/// Three-byte magic prefix shared by both directions.
const MAGIC_PREFIX: [u8; 3] = *b"FSO";

/// Direction a packet travels, which doubles as the fourth and final magic
/// byte (`'C'` for server→client, `'S'` for client→server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Server to client; full magic `FSOC`.
    ToClient,
    /// Client to server; full magic `FSOS`.
    ToServer,
}

impl Direction {
    const fn byte(self) -> u8 {
        match self {
            Self::ToClient => b'C',
            Self::ToServer => b'S',
        }
    }

    const fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'C' => Some(Self::ToClient),
            b'S' => Some(Self::ToServer),
            _ => None,
        }
    }
}

/// Wire-level packet type tag (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Step 1 of the handshake.
    ClientHello = 1,
    /// Step 2 of the handshake.
    ServerHello = 2,
    /// Step 3 of the handshake.
    ChallengeResp = 3,
    /// Keep-alive with no required payload.
    KeepAlive = 4,
    /// Graceful teardown notice.
    Disconnect = 5,
    /// One or more application messages.
    App = 6,
    /// One or more application message fragments.
    AppFragment = 7,
}

impl PacketType {
    /// Returns `true` for the three handshake types (1–3), which travel
    /// outside the session key.
    #[must_use]
    pub const fn is_handshake(self) -> bool {
        matches!(self, Self::ClientHello | Self::ServerHello | Self::ChallengeResp)
    }

    const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::ClientHello),
            2 => Some(Self::ServerHello),
            3 => Some(Self::ChallengeResp),
            4 => Some(Self::KeepAlive),
            5 => Some(Self::Disconnect),
            6 => Some(Self::App),
            7 => Some(Self::AppFragment),
            _ => None,
        }
    }
}

/// Reason a header failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// Fewer than [`HEADER_LEN`] bytes were available.
    #[error("datagram shorter than header")]
    TooShort,
    /// The 3-byte magic prefix did not match `FSO`.
    #[error("bad magic")]
    BadMagic,
    /// The direction byte did not match `'C'`/`'S'`, or did not match the
    /// direction expected for our role.
    #[error("bad or unexpected direction")]
    BadDirection,
    /// The packet type byte was not one of the seven known values.
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
}

impl BufError for HeaderError {}

/// Fixed 20-byte packet header (spec.md §3, §4.2).
///
/// The first 12 bytes (magic, direction, ctime, seq, ack) form the AEAD
/// nonce for this packet; the full 20 bytes form the AEAD associated data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Which direction this packet travels; encodes both the trailing magic
    /// byte and the role the receiver must be in to accept it.
    pub direction: Direction,
    /// Sender-local clock (milliseconds since connection start is a
    /// reasonable choice; the exact epoch doesn't matter, only that it is
    /// monotonic and never repeats a `(ctime, seq)` pair under one key).
    pub ctime: u32,
    /// This packet's own sequence number.
    pub seq: SeqNum,
    /// Last packet sequence number received from the peer.
    pub ack: SeqNum,
    /// Wire type of this packet.
    pub pkt_type: PacketType,
    /// Length in bytes of the body that follows the header, excluding the
    /// AEAD tag (or excluding the CRC/signature trailer for handshake
    /// packets).
    pub length: u16,
    /// Number of user messages packed into this packet's body (0 for
    /// handshake/keep-alive/disconnect packets).
    pub count: u8,
    /// Received-history bitfield relative to `ack`.
    pub ack_bits: u32,
}

impl PacketHeader {
    /// Decodes a header from the front of `buf` and validates its magic and
    /// direction against `expected_direction` (the direction packets
    /// addressed to *us* should carry).
    pub fn decode_expecting(
        buf: &[u8],
        expected_direction: Direction,
    ) -> Result<Self, HeaderError> {
        let header = Self::decode_any(buf)?;
        if header.direction != expected_direction {
            return Err(HeaderError::BadDirection);
        }
        Ok(header)
    }

    /// Decodes a header from the front of `buf` without checking which
    /// direction it claims to be — used by a server endpoint which must
    /// accept both directions' magics before it knows which connection (if
    /// any) a datagram belongs to is actually invalid.
    pub fn decode_any(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_LEN {
            return Err(HeaderError::TooShort);
        }
        if buf[0..3] != MAGIC_PREFIX {
            return Err(HeaderError::BadMagic);
        }
        let direction = Direction::from_byte(buf[3]).ok_or(HeaderError::BadDirection)?;
        let ctime = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let seq = SeqNum(u16::from_be_bytes([buf[8], buf[9]]));
        let ack = SeqNum(u16::from_be_bytes([buf[10], buf[11]]));
        let pkt_type =
            PacketType::from_u8(buf[12]).ok_or(HeaderError::UnknownPacketType(buf[12]))?;
        let length = u16::from_be_bytes([buf[13], buf[14]]);
        let count = buf[15];
        let ack_bits = u32::from_be_bytes([buf[16], buf[17], buf[18], buf[19]]);
        Ok(Self {
            direction,
            ctime,
            seq,
            ack,
            pkt_type,
            length,
            count,
            ack_bits,
        })
    }

    /// Encodes this header into exactly [`HEADER_LEN`] bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..3].copy_from_slice(&MAGIC_PREFIX);
        out[3] = self.direction.byte();
        out[4..8].copy_from_slice(&self.ctime.to_be_bytes());
        out[8..10].copy_from_slice(&self.seq.0.to_be_bytes());
        out[10..12].copy_from_slice(&self.ack.0.to_be_bytes());
        out[12] = self.pkt_type as u8;
        out[13..15].copy_from_slice(&self.length.to_be_bytes());
        out[15] = self.count;
        out[16..20].copy_from_slice(&self.ack_bits.to_be_bytes());
        out
    }

    /// The 96-bit AEAD nonce: the first 12 bytes of the encoded header.
    #[must_use]
    pub fn nonce(self) -> [u8; NONCE_LEN] {
        let bytes = self.to_bytes();
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[0..NONCE_LEN]);
        nonce
    }
}

impl FixedEncodeLen for PacketHeader {
    const ENCODE_LEN: usize = HEADER_LEN;
}

impl Encode for PacketHeader {
    type Error = std::convert::Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        for b in MAGIC_PREFIX {
            dst.write(&b)?;
        }
        dst.write(&self.direction.byte())?;
        dst.write(&self.ctime)?;
        dst.write(&self.seq.0)?;
        dst.write(&self.ack.0)?;
        dst.write(&(self.pkt_type as u8))?;
        dst.write(&self.length)?;
        dst.write(&self.count)?;
        dst.write(&self.ack_bits)?;
        Ok(())
    }
}

impl Decode for PacketHeader {
    type Error = HeaderError;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        let mut magic = [0u8; 3];
        for b in &mut magic {
            *b = src.read::<u8>()?;
        }
        if magic != MAGIC_PREFIX {
            return Err(BufTooShortOr::Or(HeaderError::BadMagic));
        }
        let direction_byte = src.read::<u8>()?;
        let direction =
            Direction::from_byte(direction_byte).ok_or(BufTooShortOr::Or(HeaderError::BadDirection))?;
        let ctime = src.read::<u32>()?;
        let seq = SeqNum(src.read::<u16>()?);
        let ack = SeqNum(src.read::<u16>()?);
        let pkt_type_byte = src.read::<u8>()?;
        let pkt_type = PacketType::from_u8(pkt_type_byte)
            .ok_or(BufTooShortOr::Or(HeaderError::UnknownPacketType(pkt_type_byte)))?;
        let length = src.read::<u16>()?;
        let count = src.read::<u8>()?;
        let ack_bits = src.read::<u32>()?;
        Ok(Self {
            direction,
            ctime,
            seq,
            ack,
            pkt_type,
            length,
            count,
            ack_bits,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PacketHeader {
        PacketHeader {
            direction: Direction::ToServer,
            ctime: 0x0102_0304,
            seq: SeqNum(42),
            ack: SeqNum(41),
            pkt_type: PacketType::App,
            length: 7,
            count: 1,
            ack_bits: 0b101,
        }
    }

    #[test]
    fn round_trip_is_exactly_20_bytes() {
        let h = sample();
        let bytes = h.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN);
        let decoded = PacketHeader::decode_any(&bytes).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn magic_matches_direction() {
        let to_client = PacketHeader {
            direction: Direction::ToClient,
            ..sample()
        };
        let bytes = to_client.to_bytes();
        assert_eq!(&bytes[0..4], b"FSOC");

        let to_server = sample();
        let bytes = to_server.to_bytes();
        assert_eq!(&bytes[0..4], b"FSOS");
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        assert_eq!(PacketHeader::decode_any(&bytes), Err(HeaderError::BadMagic));
    }

    #[test]
    fn wrong_direction_for_role_is_rejected() {
        let bytes = sample().to_bytes(); // ToServer
        assert_eq!(
            PacketHeader::decode_expecting(&bytes, Direction::ToClient),
            Err(HeaderError::BadDirection)
        );
    }

    #[test]
    fn too_short_is_rejected() {
        assert_eq!(
            PacketHeader::decode_any(&[0u8; HEADER_LEN - 1]),
            Err(HeaderError::TooShort)
        );
    }

    #[test]
    fn nonce_is_first_12_bytes() {
        let h = sample();
        assert_eq!(&h.nonce()[..], &h.to_bytes()[0..12]);
    }
}
