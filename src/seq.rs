//! See [`SeqNum`].

use std::{
    cmp::Ordering,
    convert::Infallible,
    fmt,
};

use octs::{BufTooShortOr, Decode, Encode, FixedEncodeLen, Read, Write};

/// 16-bit wrap-around sequence number identifying a packet or a message sent
/// across the transport.
///
/// `0` is reserved to mean "invalid / uninitialized" — a [`SeqNum`] is never
/// observed to hold `0` once a connection has sent or received anything.
/// Valid values wrap from `65535` back to `1`, skipping `0` entirely.
///
/// Comparisons and distances take wraparound into account, in the same way
/// as a [`Seq`]-like sliding window: see [`SeqNum::diff`] and
/// [`SeqNum::newer_than`].
///
/// [`Seq`]: https://gafferongames.com/post/reliable_ordered_messages/
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SeqNum(pub u16);

impl SeqNum {
    /// The reserved "invalid" value.
    pub const INVALID: Self = Self(0);

    /// The first valid sequence number.
    pub const FIRST: Self = Self(1);

    /// Returns `true` if this is the reserved invalid value.
    #[must_use]
    pub const fn is_invalid(self) -> bool {
        self.0 == 0
    }

    /// Advances this sequence number by one, wrapping `65535` to `1` so that
    /// `0` is never produced.
    #[must_use]
    pub const fn successor(self) -> Self {
        if self.0 == u16::MAX {
            Self(1)
        } else {
            Self(self.0 + 1)
        }
    }

    /// Computes the signed distance `self - other` modulo `65535`, treating
    /// the sequence number space as a ring with `0` excluded.
    ///
    /// A positive result means `self` is "newer" than `other`; see
    /// [`SeqNum::newer_than`]. No guarantee is made once the true distance
    /// exceeds `32767` in magnitude.
    #[must_use]
    pub const fn diff(self, other: Self) -> i32 {
        let a = self.0 as i32;
        let b = other.0 as i32;
        let raw = a - b;
        if raw > 32767 {
            raw - 65535
        } else if raw < -32767 {
            raw + 65535
        } else {
            raw
        }
    }

    /// Returns `true` iff `self` is strictly newer than `other`, i.e.
    /// `diff(self, other) > 0`.
    #[must_use]
    pub const fn newer_than(self, other: Self) -> bool {
        self.diff(other) > 0
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Ord for SeqNum {
    fn cmp(&self, other: &Self) -> Ordering {
        self.diff(*other).cmp(&0)
    }
}

impl PartialOrd for SeqNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FixedEncodeLen for SeqNum {
    const ENCODE_LEN: usize = u16::ENCODE_LEN;
}

impl Encode for SeqNum {
    type Error = Infallible;

    fn encode(&self, mut dst: impl Write) -> Result<(), BufTooShortOr<Self::Error>> {
        dst.write(&self.0)
    }
}

impl Decode for SeqNum {
    type Error = Infallible;

    fn decode(mut src: impl Read) -> Result<Self, BufTooShortOr<Self::Error>> {
        Ok(Self(src.read()?))
    }
}

#[cfg(test)]
mod tests {
    use octs::BytesMut;

    use super::*;

    #[test]
    fn encode_decode() {
        let v = SeqNum(1234);
        let mut buf = BytesMut::with_capacity(SeqNum::ENCODE_LEN);
        buf.write(&v).unwrap();
        assert_eq!(SeqNum::ENCODE_LEN, buf.len());
        assert_eq!(v, buf.freeze().read::<SeqNum>().unwrap());
    }

    #[test]
    fn successor_skips_zero() {
        assert_eq!(SeqNum(65535).successor(), SeqNum(1));
        assert_eq!(SeqNum(1).successor(), SeqNum(2));
    }

    #[test]
    fn diff_and_newer_than() {
        for s in [1u16, 100, 40000, 65535] {
            for d in [-1000i32, -1, 0, 1, 1000] {
                let advanced = advance(SeqNum(s), d);
                assert_eq!(advanced.diff(SeqNum(s)), d, "s={s} d={d}");
                assert_eq!(advanced.newer_than(SeqNum(s)), d > 0, "s={s} d={d}");
            }
        }
    }

    fn advance(s: SeqNum, d: i32) -> SeqNum {
        let raw = ((s.0 as i64) + (d as i64)).rem_euclid(65535);
        let raw = if raw == 0 { 65535 } else { raw };
        SeqNum(raw as u16)
    }

    #[test]
    fn ordering_respects_wraparound() {
        assert!(SeqNum(1) < SeqNum(2));
        assert!(SeqNum(65535) < SeqNum(1));
        assert!(SeqNum(65535) < SeqNum(100));
    }
}
