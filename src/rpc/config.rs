use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::common::MAX_BUCKET_SIZE_K;
use crate::{Error, Result};

/// Default request timeout before abandoning an inflight request to a non-responding node.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds
/// Default tolerated difference between a message timestamp and our clock.
pub const DEFAULT_MAX_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(5 * 60);
/// Default ceiling of a single frame on the wire.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MiB

#[derive(Debug, Clone)]
/// Dht node configurations
pub struct Config {
    /// Static bootstrap endpoints, `host:port`.
    ///
    /// Used when no [crate::BootstrapProvider] is set, and as the fallback of
    /// [crate::TrackerBootstrap].
    ///
    /// Defaults to an empty list, the node starts standalone.
    pub bootstrap: Vec<String>,
    /// Address to listen on.
    ///
    /// Defaults to `0.0.0.0`
    pub bind_address: IpAddr,
    /// Explicit port to listen on.
    ///
    /// Defaults to None, where an ephemeral port is picked.
    pub port: Option<u16>,
    /// Request timeout duration, including connecting to the peer.
    ///
    /// The longer this duration is, the longer lookups take to give up on dead peers.
    /// The shorter it is, the more responses from slow wide-area peers we miss.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Messages whose timestamp is further than this from our clock are dropped.
    ///
    /// Defaults to [DEFAULT_MAX_CLOCK_SKEW]
    pub max_clock_skew: Duration,
    /// Period of the maintenance loop.
    ///
    /// Defaults to [DEFAULT_MAINTENANCE_INTERVAL]
    pub maintenance_interval: Duration,
    /// Routing entries not heard from for this long are pinged by the maintenance loop.
    ///
    /// Defaults to [DEFAULT_STALE_AFTER]
    pub stale_after: Duration,
    /// Maximum peers pinged at once: stale entries per maintenance cycle,
    /// tracker peers, and bootstrap candidates per round.
    ///
    /// Defaults to `8`
    pub ping_sample_size: usize,
    /// Consecutive failed pings before an entry is evicted.
    ///
    /// Defaults to `2`
    pub max_failed_pings: u8,
    /// Rounds of pinging the bootstrap candidates before going standalone.
    ///
    /// Defaults to `3`
    pub bootstrap_rounds: usize,
    /// Pause between bootstrap rounds.
    ///
    /// Defaults to 1 second.
    pub bootstrap_round_delay: Duration,
    /// Time given to inflight handlers to finish on shutdown, before their
    /// connections are torn down.
    ///
    /// Defaults to 2 seconds.
    pub shutdown_grace: Duration,
    /// Frames announcing a larger body close the connection.
    ///
    /// Defaults to [DEFAULT_MAX_FRAME_SIZE]
    pub max_frame_size: usize,
    /// K, the capacity of each routing table bucket.
    ///
    /// Defaults to [MAX_BUCKET_SIZE_K]
    pub bucket_size: usize,
    /// Providers remembered per content hash.
    ///
    /// Defaults to `200`
    pub max_providers_per_hash: usize,
    /// Content hashes with remembered providers.
    ///
    /// Defaults to `2000`
    pub max_provided_hashes: usize,
    /// Local manifest hashes announced with STORE per maintenance cycle.
    ///
    /// Defaults to `32`
    pub announce_batch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_clock_skew: DEFAULT_MAX_CLOCK_SKEW,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
            ping_sample_size: 8,
            max_failed_pings: 2,
            bootstrap_rounds: 3,
            bootstrap_round_delay: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            bucket_size: MAX_BUCKET_SIZE_K,
            max_providers_per_hash: 200,
            max_provided_hashes: 2000,
            announce_batch: 32,
        }
    }
}

impl Config {
    /// Reject values the node can never work with.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidConfig("request_timeout must not be zero"));
        }
        if self.maintenance_interval.is_zero() {
            return Err(Error::InvalidConfig("maintenance_interval must not be zero"));
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(Error::InvalidConfig(
                "max_frame_size must fit a 4 byte length prefix",
            ));
        }
        if self.bucket_size == 0 {
            return Err(Error::InvalidConfig("bucket_size must not be zero"));
        }
        if self.ping_sample_size == 0 {
            return Err(Error::InvalidConfig("ping_sample_size must not be zero"));
        }
        if self.max_failed_pings == 0 {
            return Err(Error::InvalidConfig("max_failed_pings must not be zero"));
        }
        if self.max_providers_per_hash == 0 || self.max_provided_hashes == 0 {
            return Err(Error::InvalidConfig("provider store capacity must not be zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = Config {
            request_timeout: Duration::ZERO,
            ..Default::default()
        };

        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let config = Config {
            maintenance_interval: Duration::ZERO,
            ..Default::default()
        };

        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn zero_ping_sample_size_is_rejected() {
        let config = Config {
            ping_sample_size: 0,
            ..Default::default()
        };

        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
