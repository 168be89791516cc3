//! Top-level error and drop-reason taxonomy (spec.md §7).
//!
//! Per spec.md §7, the application only ever observes two outcomes for a
//! connection: it's alive, or it's gone with a reason. Everything else —
//! a single dropped packet, a rejected duplicate, a failed decrypt — is an
//! internal event that is logged and counted (see [`crate::stats::Stats`])
//! but never propagated as an error the caller has to handle packet by
//! packet. [`DropReason`] exists for that internal bookkeeping; it is not
//! part of the public per-packet API.

use crate::{crypto::KeyError, handshake::HandshakeError, header::HeaderError};

/// Why a single incoming packet was silently discarded.
///
/// Never returned from a public send/receive call — only used internally
/// for `tracing` events and [`crate::stats::Stats`] counters, matching
/// spec.md §7's "fail closed, log, move on" policy for anything short of
/// connection loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DropReason {
    /// Header failed to parse.
    #[error("malformed header: {0}")]
    MalformedHeader(HeaderError),
    /// Packet body failed AEAD authentication.
    #[error("AEAD authentication failed")]
    DecryptFailed,
    /// Packet's sequence number was already seen.
    #[error("duplicate packet")]
    Duplicate,
    /// Packet's sequence number is older than the ack window can represent.
    #[error("packet too old")]
    TooOld,
    /// Message slot framing inside an otherwise-valid packet was malformed.
    #[error("malformed message body")]
    MalformedBody,
    /// A message's dedup entry was already present (already delivered).
    #[error("duplicate message")]
    DuplicateMessage,
}

impl From<HeaderError> for DropReason {
    fn from(err: HeaderError) -> Self {
        Self::MalformedHeader(err)
    }
}

/// Why a connection attempt failed or an established connection ended.
/// This is the one error type the application is expected to match on.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The server rejected our protocol version or malformed our hello.
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// Key material (pinned root key, generated ephemeral key) was invalid.
    #[error("key error: {0}")]
    Key(#[from] KeyError),
    /// No `SERVER_HELLO` arrived within the temporary-connection timeout.
    #[error("handshake timed out")]
    Timeout,
    /// The remote address is on the local block list.
    #[error("address is blocked")]
    Blocked,
}

/// Why an established connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DisconnectReason {
    /// The local side called disconnect.
    #[error("disconnected locally")]
    Local,
    /// A `DISCONNECT` packet arrived from the peer.
    #[error("disconnected by peer")]
    Remote,
    /// No packet was received from the peer within the connection timeout.
    #[error("connection timed out")]
    Timeout,
    /// A `RetryOnTimeout` message exceeded the connection's patience and the
    /// connection gave up on the whole session rather than leaving it in a
    /// half-delivered state.
    #[error("message retransmission exhausted")]
    MessageTimedOut,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_error_converts_to_drop_reason() {
        let reason: DropReason = HeaderError::BadMagic.into();
        assert_eq!(reason, DropReason::MalformedHeader(HeaderError::BadMagic));
    }
}
