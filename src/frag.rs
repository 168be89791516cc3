//! Splitting oversized messages into fragments for sending, and reassembling
//! fragments back into whole messages on receipt. See spec.md §4.5.

use std::time::{Duration, Instant};

use ahash::AHashMap;

/// How long a partially-received fragment group is kept before being
/// evicted as abandoned.
pub const GROUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum number of fragment groups tracked per connection at once. Once
/// full, the oldest incomplete group is evicted to make room, per spec.md's
/// fragmentation Design Notes.
pub const MAX_GROUPS: usize = 64;

/// Splits `payload` into fragments of at most `chunk_len` bytes each,
/// tagged with a shared `group_id`.
///
/// # Panics
///
/// Panics if `payload` would require more than `u16::MAX` fragments, which
/// cannot happen for any payload size spec.md permits.
#[must_use]
pub fn split(payload: &[u8], chunk_len: usize, group_id: u16) -> Vec<Fragment> {
    assert!(chunk_len > 0, "chunk_len must be nonzero");
    let total_chunks = payload.chunks(chunk_len).count().max(1);
    let total = u16::try_from(total_chunks).expect("message too large to fragment");
    payload
        .chunks(chunk_len)
        .enumerate()
        .map(|(index, chunk)| Fragment {
            group_id,
            index: index as u16,
            total,
            bytes: chunk.to_vec(),
        })
        .collect()
}

/// A single fragment of a larger message, ready to be packed as an
/// `AppFragment` slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Group id shared by every fragment of the same original message.
    pub group_id: u16,
    /// Zero-based position of this fragment within the group.
    pub index: u16,
    /// Total fragment count in the group.
    pub total: u16,
    /// This fragment's slice of the original payload.
    pub bytes: Vec<u8>,
}

/// Byte length of a fragment's `group_id(u16) + index(u16) + total(u16)`
/// framing, prepended to its data when packed into an `AppFragment` slot.
pub const FRAGMENT_HEADER_LEN: usize = 6;

impl Fragment {
    /// Encodes this fragment's header and data for use as a message slot
    /// payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAGMENT_HEADER_LEN + self.bytes.len());
        out.extend_from_slice(&self.group_id.to_be_bytes());
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.total.to_be_bytes());
        out.extend_from_slice(&self.bytes);
        out
    }

    /// Decodes a fragment previously produced by [`Self::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, FragmentDecodeError> {
        if bytes.len() < FRAGMENT_HEADER_LEN {
            return Err(FragmentDecodeError::TooShort);
        }
        let group_id = u16::from_be_bytes([bytes[0], bytes[1]]);
        let index = u16::from_be_bytes([bytes[2], bytes[3]]);
        let total = u16::from_be_bytes([bytes[4], bytes[5]]);
        if total == 0 || index >= total {
            return Err(FragmentDecodeError::BadIndex);
        }
        Ok(Self {
            group_id,
            index,
            total,
            bytes: bytes[FRAGMENT_HEADER_LEN..].to_vec(),
        })
    }
}

/// Reason a fragment slot's payload failed to parse as a [`Fragment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FragmentDecodeError {
    /// Fewer than [`FRAGMENT_HEADER_LEN`] bytes were present.
    #[error("fragment header truncated")]
    TooShort,
    /// `index >= total`, or `total == 0`.
    #[error("fragment index out of range")]
    BadIndex,
}

struct Group {
    total: u16,
    received: Vec<Option<Vec<u8>>>,
    received_count: u16,
    last_update: Instant,
}

impl Group {
    fn new(total: u16, now: Instant) -> Self {
        Self {
            total,
            received: vec![None; total as usize],
            received_count: 0,
            last_update: now,
        }
    }

    fn insert(&mut self, index: u16, bytes: Vec<u8>, now: Instant) {
        self.last_update = now;
        let slot = &mut self.received[index as usize];
        if slot.is_none() {
            self.received_count += 1;
        }
        *slot = Some(bytes);
    }

    fn is_complete(&self) -> bool {
        self.received_count == self.total
    }

    fn reassemble(self) -> Vec<u8> {
        self.received.into_iter().flatten().flatten().collect()
    }
}

/// Reassembles incoming fragments into whole messages, one instance per
/// connection.
///
/// Uses a bounded, timeout-evicted reassembly table keyed by group id,
/// evicting the oldest incomplete group once the table is full.
#[derive(Default)]
pub struct FragmentAssembler {
    groups: AHashMap<u16, Group>,
    /// Insertion order, oldest first, used to evict when [`MAX_GROUPS`] is
    /// exceeded.
    order: Vec<u16>,
}

/// Outcome of feeding one fragment to a [`FragmentAssembler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedResult {
    /// The group is not yet complete.
    Pending,
    /// This was the last missing fragment; the reassembled message follows.
    Complete(Vec<u8>),
}

impl FragmentAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fragment in. Evicts the oldest incomplete group first if
    /// this would be a new group and the table is already at [`MAX_GROUPS`].
    pub fn feed(&mut self, fragment: Fragment, now: Instant) -> FeedResult {
        if !self.groups.contains_key(&fragment.group_id) && self.groups.len() >= MAX_GROUPS {
            if let Some(oldest) = self.order.first().copied() {
                self.groups.remove(&oldest);
                self.order.remove(0);
            }
        }

        let group_id = fragment.group_id;
        let group = self.groups.entry(group_id).or_insert_with(|| {
            self.order.push(group_id);
            Group::new(fragment.total, now)
        });
        group.insert(fragment.index, fragment.bytes, now);

        if group.is_complete() {
            let group = self.groups.remove(&group_id).expect("just inserted");
            self.order.retain(|&id| id != group_id);
            FeedResult::Complete(group.reassemble())
        } else {
            FeedResult::Pending
        }
    }

    /// Evicts every group that has not been updated within [`GROUP_TIMEOUT`]
    /// of `now`. Returns the number of groups evicted, for stats/logging.
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<u16> = self
            .groups
            .iter()
            .filter(|(_, g)| now.saturating_duration_since(g.last_update) >= GROUP_TIMEOUT)
            .map(|(&id, _)| id)
            .collect();
        for id in &expired {
            self.groups.remove(id);
            self.order.retain(|&g| g != *id);
        }
        expired.len()
    }

    /// Number of fragment groups currently being assembled.
    #[must_use]
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_then_reassemble_round_trip() {
        let payload: Vec<u8> = (0..250u16).map(|b| b as u8).collect();
        let fragments = split(&payload, 100, 7);
        assert_eq!(fragments.len(), 3);

        let now = Instant::now();
        let mut assembler = FragmentAssembler::new();
        let mut result = None;
        for fragment in fragments {
            result = Some(assembler.feed(fragment, now));
        }
        match result {
            Some(FeedResult::Complete(bytes)) => assert_eq!(bytes, payload),
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn out_of_order_fragments_still_reassemble() {
        let payload = b"abcdefghij".to_vec();
        let mut fragments = split(&payload, 3, 1);
        fragments.reverse();

        let now = Instant::now();
        let mut assembler = FragmentAssembler::new();
        let mut result = FeedResult::Pending;
        for fragment in fragments {
            result = assembler.feed(fragment, now);
        }
        assert_eq!(result, FeedResult::Complete(payload));
    }

    #[test]
    fn expired_group_is_evicted() {
        let now = Instant::now();
        let mut assembler = FragmentAssembler::new();
        let fragments = split(b"hello world", 3, 1);
        assembler.feed(fragments[0].clone(), now);
        assert_eq!(assembler.group_count(), 1);

        let later = now + GROUP_TIMEOUT;
        let evicted = assembler.evict_expired(later);
        assert_eq!(evicted, 1);
        assert_eq!(assembler.group_count(), 0);
    }

    #[test]
    fn overflow_evicts_oldest_group() {
        let now = Instant::now();
        let mut assembler = FragmentAssembler::new();
        for group_id in 0..MAX_GROUPS as u16 {
            let fragments = split(b"ab", 1, group_id);
            assembler.feed(fragments[0].clone(), now);
        }
        assert_eq!(assembler.group_count(), MAX_GROUPS);

        // one more group should evict group 0.
        let fragments = split(b"ab", 1, MAX_GROUPS as u16);
        assembler.feed(fragments[0].clone(), now);
        assert_eq!(assembler.group_count(), MAX_GROUPS);
    }

    #[test]
    fn fragment_encode_decode_round_trip() {
        let fragment = Fragment {
            group_id: 42,
            index: 1,
            total: 3,
            bytes: b"chunk".to_vec(),
        };
        let encoded = fragment.encode();
        let decoded = Fragment::decode(&encoded).unwrap();
        assert_eq!(decoded, fragment);
    }

    #[test]
    fn fragment_decode_rejects_bad_index() {
        let mut bytes = vec![0u8; FRAGMENT_HEADER_LEN];
        bytes[2..4].copy_from_slice(&5u16.to_be_bytes()); // index 5
        bytes[4..6].copy_from_slice(&3u16.to_be_bytes()); // total 3
        assert!(matches!(
            Fragment::decode(&bytes),
            Err(FragmentDecodeError::BadIndex)
        ));
    }
}
