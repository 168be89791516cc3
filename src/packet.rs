//! Assembling an outgoing packet from message slots, and parsing an incoming
//! one back into slots. See spec.md §3 ("Packet") and §6 (MTU figures).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    crypto::{NONCE_LEN, TAG_LEN},
    header::{HeaderError, PacketType, HEADER_LEN},
    seq::SeqNum,
};

/// Default maximum transmission unit in bytes (spec.md §6).
pub const DEFAULT_MTU: usize = 1500;

/// Bytes of IPv4/UDP framing assumed to sit below every datagram.
pub const UDP_OVERHEAD: usize = 28;

/// Maximum encrypted-body length (post-header, including the AEAD tag) that
/// fits in a datagram of `mtu` bytes.
#[must_use]
pub const fn max_body_len(mtu: usize) -> usize {
    mtu - UDP_OVERHEAD - HEADER_LEN
}

/// Maximum plaintext payload bytes (post-header, pre-tag) that fit in a
/// datagram of `mtu` bytes. 1436 for the default 1500-byte MTU.
#[must_use]
pub const fn max_payload_len(mtu: usize) -> usize {
    max_body_len(mtu) - TAG_LEN
}

/// Maximum payload of a single user message slot (one message alone in a
/// packet, 2 bytes of per-message overhead). 1434 for the default MTU.
#[must_use]
pub const fn max_single_message_len(mtu: usize) -> usize {
    max_payload_len(mtu) - SINGLE_SLOT_OVERHEAD
}

/// Overhead, in bytes, of a message slot when it is the only message in the
/// packet: `msg_seq(u16)`.
pub const SINGLE_SLOT_OVERHEAD: usize = 2;

/// Overhead, in bytes, of a single message slot when two or more messages
/// share a packet: `len(u16) + msg_seq(u16) + type(u8)`.
pub const MULTI_SLOT_OVERHEAD: usize = 5;

/// One user message (or fragment) as it is packed into, or read out of, a
/// [`Packet`] body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSlot {
    /// Per-connection message sequence number (independent of the packet
    /// sequence number carried in the header).
    pub msg_seq: SeqNum,
    /// Whether this slot is a whole application message or one fragment of
    /// a larger one.
    pub kind: PacketType,
    /// Message (or fragment) payload bytes.
    pub payload: Bytes,
}

/// Errors produced while packing slots into a packet body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PackError {
    /// Adding this slot would exceed the packet's MTU budget.
    #[error("packet is full")]
    Full,
}

/// Errors produced while parsing a packet body back into message slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UnpackError {
    /// The body ended before `count` slots could be read.
    #[error("truncated message slot")]
    Truncated,
    /// A multi-slot entry carried a type byte that isn't a valid message
    /// type (only [`PacketType::App`] and [`PacketType::AppFragment`] are
    /// legal inside a slot).
    #[error("invalid slot type {0}")]
    InvalidSlotType(u8),
}

/// Incrementally packs [`MessageSlot`]s into a single outgoing packet body,
/// stopping once the next slot would not fit in the remaining MTU budget.
///
/// Mirrors the "pack messages until the next one doesn't fit" drain loop in
/// spec.md §4.4.
#[derive(Debug)]
pub struct PacketBuilder {
    budget: usize,
    slots: Vec<MessageSlot>,
}

impl PacketBuilder {
    /// Creates a builder with `max_payload_len(mtu)` bytes of budget.
    #[must_use]
    pub fn new(mtu: usize) -> Self {
        Self {
            budget: max_payload_len(mtu),
            slots: Vec::new(),
        }
    }

    /// Attempts to add `slot` to this packet.
    ///
    /// Overhead accounting follows spec.md §4.4: 2 bytes if this would be
    /// the only slot, 5 bytes per slot once there are two or more.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::Full`] (without mutating `self`) if the slot
    /// would not fit; the caller should stop draining and try again on the
    /// next packet.
    pub fn try_add(&mut self, slot: MessageSlot) -> Result<(), PackError> {
        let would_be_multi = !self.slots.is_empty();
        let this_overhead = if would_be_multi {
            MULTI_SLOT_OVERHEAD
        } else {
            SINGLE_SLOT_OVERHEAD
        };
        // if we're about to go from 1 slot to 2, the first slot's overhead
        // also grows from 2 to 5 bytes.
        let upgrade_overhead = if self.slots.len() == 1 {
            MULTI_SLOT_OVERHEAD - SINGLE_SLOT_OVERHEAD
        } else {
            0
        };
        let needed = this_overhead + slot.payload.len() + upgrade_overhead;
        if needed > self.budget {
            return Err(PackError::Full);
        }
        self.budget -= needed;
        self.slots.push(slot);
        Ok(())
    }

    /// Returns `true` if no slots have been added yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Finishes building, returning the packet's `count` and its encoded
    /// body bytes, ready to be placed after the header and before
    /// encryption.
    #[must_use]
    pub fn finish(self) -> (u8, Bytes) {
        let count = u8::try_from(self.slots.len()).expect("packet cannot hold more than 255 slots");
        let mut body = BytesMut::new();
        if self.slots.len() == 1 {
            let slot = &self.slots[0];
            body.put_u16(slot.msg_seq.0);
            body.extend_from_slice(&slot.payload);
        } else {
            for slot in &self.slots {
                let len = u16::try_from(slot.payload.len()).expect("slot payload too large");
                body.put_u16(len);
                body.put_u16(slot.msg_seq.0);
                body.put_u8(slot.kind as u8);
                body.extend_from_slice(&slot.payload);
            }
        }
        (count, body.freeze())
    }
}

/// Parses a packet body into its message slots.
///
/// * `count` and `single_slot_type` come from the packet's [`PacketHeader`]
///   (`count`, and `pkt_type` respectively — the header's type is only
///   meaningful as a slot type when `count == 1`).
///
/// [`PacketHeader`]: crate::header::PacketHeader
pub fn unpack(
    mut body: Bytes,
    count: u8,
    single_slot_type: PacketType,
) -> Result<Vec<MessageSlot>, UnpackError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if count == 1 {
        if body.len() < 2 {
            return Err(UnpackError::Truncated);
        }
        let msg_seq = SeqNum(body.get_u16());
        let payload = body;
        return Ok(vec![MessageSlot {
            msg_seq,
            kind: single_slot_type,
            payload,
        }]);
    }

    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if body.len() < MULTI_SLOT_OVERHEAD {
            return Err(UnpackError::Truncated);
        }
        let len = body.get_u16() as usize;
        let msg_seq = SeqNum(body.get_u16());
        let type_byte = body.get_u8();
        let kind = match type_byte {
            t if t == PacketType::App as u8 => PacketType::App,
            t if t == PacketType::AppFragment as u8 => PacketType::AppFragment,
            other => return Err(UnpackError::InvalidSlotType(other)),
        };
        if body.len() < len {
            return Err(UnpackError::Truncated);
        }
        let payload = body.split_to(len);
        out.push(MessageSlot {
            msg_seq,
            kind,
            payload,
        });
    }
    Ok(out)
}

/// Convenience re-export so callers don't need to import [`HeaderError`]
/// just to match on packet-level failures uniformly.
pub type HeaderDecodeError = HeaderError;

/// Sanity check used by the send path: does `nonce`'s length match what AES-GCM
/// expects? Exists purely so `NONCE_LEN` has a use-site near the packet
/// assembly code that reasons about header/body/tag layout.
#[must_use]
pub const fn nonce_len_matches() -> bool {
    NONCE_LEN == 12
}
