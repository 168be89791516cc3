//! Tunable connection/endpoint parameters and their spec.md §6 defaults.

use std::time::Duration;

use ahash::AHashSet;
use std::net::IpAddr;

use crate::crypto::{RootSigningKey, RootVerifyingKey};

/// Default maximum transmission unit, in bytes (spec.md §6).
pub const DEFAULT_MTU: usize = crate::packet::DEFAULT_MTU;

/// Default time since the last received packet before a connection is
/// declared dead.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time a half-open (post-`CLIENT_HELLO`, pre-`CHALLENGE_RESP`)
/// connection attempt is kept before being dropped.
pub const DEFAULT_TEMP_CONNECTION_TIMEOUT: Duration = Duration::from_secs(2);

/// Default time an unacked [`RetryMode::RetryOnTimeout`](crate::message::RetryMode::RetryOnTimeout)
/// message is given before being retransmitted.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default tick interval for the connection/endpoint's periodic
/// housekeeping (retransmits, keep-alives, timeouts).
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_nanos(1_000_000_000 / 60);

/// Keep-alive packets are sent after this much silence on the send side;
/// defaults to half the message timeout so a keep-alive always reaches the
/// peer well before its connection timeout could fire.
#[must_use]
pub const fn default_keep_alive_interval(message_timeout: Duration) -> Duration {
    Duration::from_nanos((message_timeout.as_nanos() / 2) as u64)
}

/// Client-side connection configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Maximum UDP datagram size to send or accept.
    pub mtu: usize,
    /// Idle-time-since-last-receive before the connection is dropped.
    pub connection_timeout: Duration,
    /// Retry timeout for [`RetryMode::RetryOnTimeout`](crate::message::RetryMode::RetryOnTimeout) messages.
    pub message_timeout: Duration,
    /// Interval between keep-alives when nothing else is being sent.
    pub keep_alive_interval: Duration,
    /// Housekeeping tick interval.
    pub tick_interval: Duration,
    /// The server's pinned root public key, used to authenticate `SERVER_HELLO`.
    pub server_root_key: RootVerifyingKey,
}

impl ClientConfig {
    /// Builds a config with spec.md §6 defaults and the given pinned root key.
    #[must_use]
    pub fn new(server_root_key: RootVerifyingKey) -> Self {
        Self {
            mtu: DEFAULT_MTU,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            keep_alive_interval: default_keep_alive_interval(DEFAULT_MESSAGE_TIMEOUT),
            tick_interval: DEFAULT_TICK_INTERVAL,
            server_root_key,
        }
    }
}

/// Server-side endpoint configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Maximum UDP datagram size to send or accept.
    pub mtu: usize,
    /// Idle-time-since-last-receive before an established connection is dropped.
    pub connection_timeout: Duration,
    /// How long a half-open connection attempt is kept before being dropped.
    pub temp_connection_timeout: Duration,
    /// Retry timeout for [`RetryMode::RetryOnTimeout`](crate::message::RetryMode::RetryOnTimeout) messages.
    pub message_timeout: Duration,
    /// Interval between keep-alives when nothing else is being sent.
    pub keep_alive_interval: Duration,
    /// Housekeeping tick interval.
    pub tick_interval: Duration,
    /// The server's long-lived root signing key, used to authenticate
    /// `SERVER_HELLO` to clients.
    pub root_key: RootSigningKey,
    /// Source IPs rejected at the endpoint before any handshake state is
    /// allocated.
    pub block_list: AHashSet<IpAddr>,
    /// Maximum number of half-open connection attempts tracked at once,
    /// bounding memory used by a handshake flood.
    pub max_temp_connections: usize,
}

impl ServerConfig {
    /// Builds a config with spec.md §6 defaults and the given root signing key.
    #[must_use]
    pub fn new(root_key: RootSigningKey) -> Self {
        Self {
            mtu: DEFAULT_MTU,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            temp_connection_timeout: DEFAULT_TEMP_CONNECTION_TIMEOUT,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            keep_alive_interval: default_keep_alive_interval(DEFAULT_MESSAGE_TIMEOUT),
            tick_interval: DEFAULT_TICK_INTERVAL,
            root_key,
            block_list: AHashSet::new(),
            max_temp_connections: 4096,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUBLIC_PEM: &str = include_str!("../testdata/root_key_spki.pub.pem");
    const PRIVATE_PEM: &str = include_str!("../testdata/root_key_pkcs8.pem");

    #[test]
    fn keep_alive_is_half_message_timeout() {
        let interval = default_keep_alive_interval(Duration::from_secs(1));
        assert_eq!(interval, Duration::from_millis(500));
    }

    #[test]
    fn client_config_defaults() {
        let key = RootVerifyingKey::from_public_key_pem(PUBLIC_PEM).unwrap();
        let cfg = ClientConfig::new(key);
        assert_eq!(cfg.mtu, DEFAULT_MTU);
        assert_eq!(cfg.connection_timeout, DEFAULT_CONNECTION_TIMEOUT);
    }

    #[test]
    fn server_config_defaults() {
        let key = RootSigningKey::from_pkcs8_pem(PRIVATE_PEM).unwrap();
        let cfg = ServerConfig::new(key);
        assert_eq!(cfg.temp_connection_timeout, DEFAULT_TEMP_CONNECTION_TIMEOUT);
        assert!(cfg.block_list.is_empty());
    }
}
