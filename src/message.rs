//! Outbound message bookkeeping: [`RetryMode`], [`PendingMessage`], and the
//! [`PendingQueue`] that tracks which packets each message rode in on so an
//! incoming ack can retire it. See spec.md §4 ("Reliability").

use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::{header::PacketType, seq::SeqNum};

/// How a message behaves when the packet(s) carrying it are never acked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Fire-and-forget: dropped from the queue the moment it's been sent
    /// once, whether or not it's ever acked.
    None,
    /// Sent once; if the send fails outright it is dropped, but it is not
    /// retransmitted on ack timeout. Still tracked for ack/RTT purposes
    /// until acked or the connection closes.
    BestEffort,
    /// Retransmitted on a fresh packet sequence number every time its
    /// `message_timeout` elapses without being acked, until the connection
    /// gives up on it or it is acked.
    RetryOnTimeout,
}

/// An application message (or the fragments of one) still awaiting
/// acknowledgement.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    /// Connection-local message sequence number, distinct from any packet
    /// sequence number it has been carried in.
    pub msg_seq: SeqNum,
    /// Slot type this message is packed as ([`PacketType::App`] or
    /// [`PacketType::AppFragment`]).
    pub pkt_type: PacketType,
    /// Message (or single fragment) payload.
    pub payload: Vec<u8>,
    /// Retransmission behavior.
    pub retry_mode: RetryMode,
    /// When this message was first placed on the wire.
    pub first_send_time: Instant,
    /// When this message was most recently (re)sent.
    pub last_send_time: Instant,
    /// Packet sequence numbers this message currently rides on. A message
    /// can appear in more than one in-flight packet only while being
    /// retransmitted; once any of them is acked, the message is retired and
    /// the rest are left to expire naturally.
    pub packet_seqs: Vec<SeqNum>,
    /// If this is a fragment, which group/index/total it belongs to.
    pub fragment: Option<FragmentRef>,
}

/// Identifies a message's place within a fragmented original message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRef {
    /// Group id shared by every fragment of the same original message.
    pub group_id: u16,
    /// Zero-based index of this fragment within the group.
    pub index: u16,
    /// Total number of fragments in the group.
    pub total: u16,
}

impl PendingMessage {
    /// Whether `timeout` has elapsed since this message was last sent.
    #[must_use]
    pub fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_send_time) >= timeout
    }

    /// Records that this message has just been (re)sent as `packet_seq`.
    pub fn mark_sent(&mut self, packet_seq: SeqNum, now: Instant) {
        self.packet_seqs.push(packet_seq);
        self.last_send_time = now;
    }
}

/// Tracks every [`PendingMessage`] awaiting acknowledgement for one
/// connection, keyed by the packet sequence numbers it's riding on so an
/// incoming ack bit can look messages up in O(1).
///
/// An outgoing buffer keyed by packet seq, retired on ack, generalized here
/// to also carry each message's [`RetryMode`].
#[derive(Debug, Default)]
pub struct PendingQueue {
    by_msg_seq: AHashMap<SeqNum, PendingMessage>,
    by_packet_seq: AHashMap<SeqNum, Vec<SeqNum>>,
}

impl PendingQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages still awaiting acknowledgement or retirement.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_msg_seq.len()
    }

    /// Whether the queue holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_msg_seq.is_empty()
    }

    /// Looks up a still-pending message by its message sequence number
    /// without removing it.
    #[must_use]
    pub fn peek(&self, msg_seq: SeqNum) -> Option<PendingMessage> {
        self.by_msg_seq.get(&msg_seq).cloned()
    }

    /// Inserts a newly-sent message and indexes it under its first packet
    /// sequence number.
    pub fn insert(&mut self, message: PendingMessage) {
        let msg_seq = message.msg_seq;
        for &packet_seq in &message.packet_seqs {
            self.by_packet_seq.entry(packet_seq).or_default().push(msg_seq);
        }
        self.by_msg_seq.insert(msg_seq, message);
    }

    /// Records that `message` has been retransmitted under a new packet
    /// sequence number.
    pub fn record_retransmit(&mut self, msg_seq: SeqNum, packet_seq: SeqNum, now: Instant) {
        if let Some(message) = self.by_msg_seq.get_mut(&msg_seq) {
            message.mark_sent(packet_seq, now);
            self.by_packet_seq.entry(packet_seq).or_default().push(msg_seq);
        }
    }

    /// Removes and returns every message carried by `packet_seq` (an acked
    /// packet), dropping their other in-flight index entries along the way.
    pub fn retire_by_packet(&mut self, packet_seq: SeqNum) -> Vec<PendingMessage> {
        let Some(msg_seqs) = self.by_packet_seq.remove(&packet_seq) else {
            return Vec::new();
        };
        let mut retired = Vec::with_capacity(msg_seqs.len());
        for msg_seq in msg_seqs {
            if let Some(message) = self.by_msg_seq.remove(&msg_seq) {
                for &other_packet_seq in &message.packet_seqs {
                    if other_packet_seq != packet_seq {
                        if let Some(list) = self.by_packet_seq.get_mut(&other_packet_seq) {
                            list.retain(|&s| s != msg_seq);
                        }
                    }
                }
                retired.push(message);
            }
        }
        retired
    }

    /// Returns the message sequence numbers of every [`RetryMode::RetryOnTimeout`]
    /// message whose `message_timeout` has elapsed, without removing them —
    /// the caller retransmits and then calls [`Self::record_retransmit`].
    #[must_use]
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> Vec<SeqNum> {
        self.by_msg_seq
            .values()
            .filter(|m| m.retry_mode == RetryMode::RetryOnTimeout && m.is_timed_out(now, timeout))
            .map(|m| m.msg_seq)
            .collect()
    }

    /// Drops every [`RetryMode::None`] message once it has been sent at
    /// least once; called right after the send pass that put it on the
    /// wire.
    pub fn retire_fire_and_forget(&mut self) {
        let to_remove: Vec<SeqNum> = self
            .by_msg_seq
            .values()
            .filter(|m| m.retry_mode == RetryMode::None && !m.packet_seqs.is_empty())
            .map(|m| m.msg_seq)
            .collect();
        for msg_seq in to_remove {
            if let Some(message) = self.by_msg_seq.remove(&msg_seq) {
                for packet_seq in message.packet_seqs {
                    if let Some(list) = self.by_packet_seq.get_mut(&packet_seq) {
                        list.retain(|&s| s != msg_seq);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(msg_seq: u16, retry_mode: RetryMode, now: Instant) -> PendingMessage {
        PendingMessage {
            msg_seq: SeqNum(msg_seq),
            pkt_type: PacketType::App,
            payload: vec![1, 2, 3],
            retry_mode,
            first_send_time: now,
            last_send_time: now,
            packet_seqs: vec![SeqNum(msg_seq)],
            fragment: None,
        }
    }

    #[test]
    fn retire_by_packet_removes_message() {
        let now = Instant::now();
        let mut queue = PendingQueue::new();
        queue.insert(message(1, RetryMode::RetryOnTimeout, now));
        assert_eq!(queue.len(), 1);
        let retired = queue.retire_by_packet(SeqNum(1));
        assert_eq!(retired.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn retransmit_indexes_new_packet_seq() {
        let now = Instant::now();
        let mut queue = PendingQueue::new();
        queue.insert(message(1, RetryMode::RetryOnTimeout, now));
        queue.record_retransmit(SeqNum(1), SeqNum(2), now);
        // acking the retransmission's packet seq retires the message...
        let retired = queue.retire_by_packet(SeqNum(2));
        assert_eq!(retired.len(), 1);
        // ...and the original packet seq's index entry is now stale/empty.
        assert!(queue.retire_by_packet(SeqNum(1)).is_empty());
    }

    #[test]
    fn timed_out_only_flags_retry_on_timeout() {
        let now = Instant::now();
        let mut queue = PendingQueue::new();
        queue.insert(message(1, RetryMode::RetryOnTimeout, now));
        queue.insert(message(2, RetryMode::BestEffort, now));
        let later = now + Duration::from_secs(2);
        let timed_out = queue.timed_out(later, Duration::from_secs(1));
        assert_eq!(timed_out, vec![SeqNum(1)]);
    }

    #[test]
    fn fire_and_forget_is_retired_after_send() {
        let now = Instant::now();
        let mut queue = PendingQueue::new();
        queue.insert(message(1, RetryMode::None, now));
        queue.retire_fire_and_forget();
        assert!(queue.is_empty());
    }
}
