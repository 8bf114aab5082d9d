//! Centralized configuration for Stagehand.
//!
//! All tunable timeouts, addresses and seeds live here so tests and the CLI
//! share the same defaults.

use std::net::SocketAddr;
use std::time::Duration;

/// Central configuration for all Stagehand components.
#[derive(Debug, Clone, Default)]
pub struct HarnessConfig {
    pub timeouts: TimeoutConfig,
    pub peer: PeerConfig,
    pub homeserver: HomeserverConfig,
}

/// Bounds used when a test waits on the peer emulator or on a probe.
///
/// These affect test behavior only; they are not protocol requirements.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// How long a test waits for the resync request to reach the peer
    pub request_received: Duration,
    /// How long a held peer handler waits before giving up on a release
    pub may_respond: Duration,
    /// How long a probe may take to complete once its blocker is released
    pub probe_completion: Duration,
    /// How long the initial join may take
    pub join: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_received: Duration::from_secs(5),
            may_respond: Duration::from_secs(60),
            probe_completion: Duration::from_secs(1),
            join: Duration::from_secs(30),
        }
    }
}

/// Peer emulator listener configuration.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Address the emulator binds to; port 0 picks a free port
    pub bind_address: SocketAddr,
    /// Seed for room identifiers generated by the emulator
    pub room_seed: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            room_seed: 42,
        }
    }
}

/// Simulated homeserver configuration.
#[derive(Debug, Clone)]
pub struct HomeserverConfig {
    /// Server name used in user identifiers, e.g. `@alice:hs1`
    pub server_name: String,
    /// Address the client API binds to; port 0 picks a free port
    pub bind_address: SocketAddr,
    /// Room version advertised through the capabilities endpoint
    pub default_room_version: String,
    /// Timeout for outbound federation requests
    pub federation_timeout: Duration,
}

impl Default for HomeserverConfig {
    fn default() -> Self {
        Self {
            server_name: "hs1".to_string(),
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            default_room_version: "10".to_string(),
            federation_timeout: Duration::from_secs(120),
        }
    }
}

impl HarnessConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(timeout) = env_millis("STAGEHAND_REQUEST_RECEIVED_TIMEOUT_MS") {
            config.timeouts.request_received = timeout;
        }

        if let Some(timeout) = env_millis("STAGEHAND_MAY_RESPOND_TIMEOUT_MS") {
            config.timeouts.may_respond = timeout;
        }

        if let Some(timeout) = env_millis("STAGEHAND_PROBE_TIMEOUT_MS") {
            config.timeouts.probe_completion = timeout;
        }

        if let Ok(address) = std::env::var("STAGEHAND_BIND_ADDRESS")
            && let Ok(address) = address.parse::<SocketAddr>()
        {
            config.peer.bind_address = address;
        }

        if let Ok(seed) = std::env::var("STAGEHAND_ROOM_SEED")
            && let Ok(seed) = seed.parse::<u64>()
        {
            config.peer.room_seed = seed;
        }

        config
    }

    /// Creates a configuration for in-process tests.
    ///
    /// The held handler bound is shortened so a broken teardown shows up as
    /// a failure within seconds instead of a minute.
    pub fn for_testing() -> Self {
        Self {
            timeouts: TimeoutConfig {
                may_respond: Duration::from_secs(10),
                join: Duration::from_secs(10),
                ..TimeoutConfig::default()
            },
            homeserver: HomeserverConfig {
                federation_timeout: Duration::from_secs(20),
                ..HomeserverConfig::default()
            },
            ..Default::default()
        }
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
}
