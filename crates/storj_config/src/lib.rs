//! Startup configuration for the storage overlay node.
//!
//! Modeled on the workspace's config pattern (see the teacher's `apollo_config`): every
//! sub-config implements [`SerializeConfig`], producing a flattened `BTreeMap` of dotted
//! parameter paths to documented default values. [`StorjConfig::dump_to_file`] writes that
//! map as a JSON schema a deployment can check in and override; [`load_and_process_config`]
//! reads the schema back, layers CLI flags and environment variables on top, and validates
//! the result. This replaces the ad hoc numeric-constants module the source used (Design
//! Notes, "Global-ish constants").

pub mod converters;
pub mod dumping;
pub mod loading;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

pub use dumping::{ser_param, SerializeConfig, SerializedParam};
pub use loading::{load_and_process_config, ConfigError};

/// A dotted path identifying one flattened parameter, e.g. `"timeouts.response_timeout"`.
pub type ParamPath = String;
/// Human-readable documentation for a parameter, shown in `--help` and the dumped schema.
pub type Description = String;

/// Environment variable carrying the bridge server's base URL (§6 of the node spec).
pub const BRIDGE_URL_ENV: &str = "STORJ_BRIDGE";
/// Environment variable that, when set to a truthy value, allows loopback contacts into
/// the routing table (normally rejected by the cleaner).
pub const ALLOW_LOOPBACK_ENV: &str = "STORJ_ALLOW_LOOPBACK";

/// Top-level configuration for a node process. Constructed once at start-up and threaded
/// through every component that needs a timeout, limit, or feature flag, rather than each
/// crate reaching for a hardcoded constant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Validate)]
pub struct StorjConfig {
    #[validate(nested)]
    pub timeouts: TimeoutsConfig,
    #[validate(nested)]
    pub rate_limiter: RateLimiterConfig,
    #[validate(nested)]
    pub muxer: MuxerConfig,
    #[validate(nested)]
    pub tunnel: TunnelConfig,
    #[validate(nested)]
    pub network: NetworkConfig,
    #[validate(nested)]
    pub retry: RetryConfig,
}

impl Default for StorjConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutsConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            muxer: MuxerConfig::default(),
            tunnel: TunnelConfig::default(),
            network: NetworkConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl SerializeConfig for StorjConfig {
    fn dump(&self) -> std::collections::BTreeMap<ParamPath, SerializedParam> {
        let mut map = std::collections::BTreeMap::new();
        map.extend(dumping::prepend_sub_config_name(self.timeouts.dump(), "timeouts"));
        map.extend(dumping::prepend_sub_config_name(self.rate_limiter.dump(), "rate_limiter"));
        map.extend(dumping::prepend_sub_config_name(self.muxer.dump(), "muxer"));
        map.extend(dumping::prepend_sub_config_name(self.tunnel.dump(), "tunnel"));
        map.extend(dumping::prepend_sub_config_name(self.network.dump(), "network"));
        map.extend(dumping::prepend_sub_config_name(self.retry.dump(), "retry"));
        map
    }
}

/// Deadlines and periodic-task intervals (§5 of the node spec). All fields are seconds on
/// the wire/schema and `Duration` in memory via [`converters`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Validate)]
pub struct TimeoutsConfig {
    /// RPC response timeout.
    #[serde(with = "converters::seconds")]
    pub response_timeout: Duration,
    /// Maximum age of an RPC envelope's nonce before it is rejected as stale.
    #[serde(with = "converters::seconds")]
    pub nonce_expire: Duration,
    /// Time-to-live of a data-channel token (PUSH tokens are also single-use on top of this).
    #[serde(with = "converters::seconds")]
    pub token_ttl: Duration,
    /// Interval between tunneler availability re-announcements.
    #[serde(with = "converters::seconds")]
    pub tunnel_announce_interval: Duration,
    /// Interval on which the routing-table cleaner sweeps for stale/incompatible contacts.
    #[serde(with = "converters::seconds")]
    pub router_clean_interval: Duration,
    /// Idle duration after which the network facade re-runs the overlay join.
    #[serde(with = "converters::seconds")]
    pub reentry_idle: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(5),
            nonce_expire: Duration::from_secs(5 * 60),
            token_ttl: Duration::from_secs(5 * 60),
            tunnel_announce_interval: Duration::from_secs(5 * 60),
            router_clean_interval: Duration::from_secs(60 * 60),
            reentry_idle: Duration::from_secs(10 * 60),
        }
    }
}

impl SerializeConfig for TimeoutsConfig {
    fn dump(&self) -> std::collections::BTreeMap<ParamPath, SerializedParam> {
        std::collections::BTreeMap::from_iter([
            ser_param(
                "response_timeout",
                &self.response_timeout.as_secs(),
                "RPC response timeout, in seconds.",
            ),
            ser_param(
                "nonce_expire",
                &self.nonce_expire.as_secs(),
                "Maximum age of an RPC nonce, in seconds.",
            ),
            ser_param("token_ttl", &self.token_ttl.as_secs(), "Data-channel token TTL, in seconds."),
            ser_param(
                "tunnel_announce_interval",
                &self.tunnel_announce_interval.as_secs(),
                "Interval between tunneler availability announcements, in seconds.",
            ),
            ser_param(
                "router_clean_interval",
                &self.router_clean_interval.as_secs(),
                "Interval between routing-table cleaner sweeps, in seconds.",
            ),
            ser_param(
                "reentry_idle",
                &self.reentry_idle.as_secs(),
                "Idle duration before the node re-joins the overlay, in seconds.",
            ),
        ])
    }
}

/// Leaky-bucket rate limiter parameters (§4.6), applied per contact to inbound requests.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Validate)]
pub struct RateLimiterConfig {
    #[validate(range(min = 1))]
    pub bucket_capacity: u32,
    #[validate(range(min = 1))]
    pub refill_per_second: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self { bucket_capacity: 20, refill_per_second: 5 }
    }
}

impl SerializeConfig for RateLimiterConfig {
    fn dump(&self) -> std::collections::BTreeMap<ParamPath, SerializedParam> {
        std::collections::BTreeMap::from_iter([
            ser_param(
                "bucket_capacity",
                &self.bucket_capacity,
                "Maximum burst of requests admitted per contact before throttling.",
            ),
            ser_param(
                "refill_per_second",
                &self.refill_per_second,
                "Tokens returned to a contact's bucket every second.",
            ),
        ])
    }
}

/// File muxer/demuxer parameters (§4.5).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Validate)]
pub struct MuxerConfig {
    #[validate(range(min = 1))]
    pub shard_size: u64,
    /// Whether `Muxer::grow` may be called at all (Open Question #1 in the source spec is
    /// fixed here: disabled by default, no implicit field mutation).
    pub allow_grow: bool,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self { shard_size: 8 * 1024 * 1024, allow_grow: false }
    }
}

impl SerializeConfig for MuxerConfig {
    fn dump(&self) -> std::collections::BTreeMap<ParamPath, SerializedParam> {
        std::collections::BTreeMap::from_iter([
            ser_param("shard_size", &self.shard_size, "Default demuxer shard size, in bytes."),
            ser_param(
                "allow_grow",
                &self.allow_grow,
                "Whether a muxer may be grown past its declared shard count at runtime.",
            ),
        ])
    }
}

/// Tunnel subsystem parameters (§4.8).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Validate)]
pub struct TunnelConfig {
    /// Maximum number of concurrent relay slots this node offers others. A tunnel-client
    /// node (one that itself relays through someone else) sets this to 0.
    pub max_tunnels: u32,
    /// How many tunneler contacts `FIND_TUNNEL` returns at most.
    #[validate(range(min = 1))]
    pub find_tunnel_k: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self { max_tunnels: 3, find_tunnel_k: 3 }
    }
}

impl SerializeConfig for TunnelConfig {
    fn dump(&self) -> std::collections::BTreeMap<ParamPath, SerializedParam> {
        std::collections::BTreeMap::from_iter([
            ser_param("max_tunnels", &self.max_tunnels, "Relay slots offered to other nodes."),
            ser_param(
                "find_tunnel_k",
                &self.find_tunnel_k,
                "Maximum tunneler contacts returned by FIND_TUNNEL.",
            ),
        ])
    }
}

/// Network facade parameters (§4.9) and the two environment-variable inputs named in §6.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Validate)]
pub struct NetworkConfig {
    /// Whether loopback addresses are accepted into the routing table. Mirrors
    /// `STORJ_ALLOW_LOOPBACK`; the env var, when present, overrides this field at load time.
    pub allow_loopback: bool,
    /// Base URL of the bridge server this node's protocol handlers consult. Mirrors
    /// `STORJ_BRIDGE`. The bridge itself is out of scope (§1); the core only needs its URL.
    pub bridge_url: Option<String>,
    /// Seed contact URIs (`storj://host:port/nodeid`) tried in series on join.
    pub seeds: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { allow_loopback: false, bridge_url: None, seeds: Vec::new() }
    }
}

impl SerializeConfig for NetworkConfig {
    fn dump(&self) -> std::collections::BTreeMap<ParamPath, SerializedParam> {
        std::collections::BTreeMap::from_iter([
            ser_param(
                "allow_loopback",
                &self.allow_loopback,
                "Whether loopback contacts are allowed into the routing table.",
            ),
            ser_param(
                "bridge_url",
                &self.bridge_url.clone().unwrap_or_default(),
                "Base URL of the bridge server (empty if unset).",
            ),
            ser_param(
                "seeds",
                &self.seeds.join(","),
                "Comma-separated seed contact URIs tried in series on join.",
            ),
        ])
    }
}

/// Retry and fault-policy parameters (§7's fixed policy).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Validate)]
pub struct RetryConfig {
    /// Exponential back-off attempt cap for shard transfer before the caller excludes the
    /// farmer and re-contracts elsewhere.
    #[validate(range(min = 1))]
    pub shard_transfer_attempts: u32,
    /// Consecutive audit failures against the same farmer before it is marked faulty.
    #[validate(range(min = 1))]
    pub audit_fault_threshold: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { shard_transfer_attempts: 3, audit_fault_threshold: 3 }
    }
}

impl SerializeConfig for RetryConfig {
    fn dump(&self) -> std::collections::BTreeMap<ParamPath, SerializedParam> {
        std::collections::BTreeMap::from_iter([
            ser_param(
                "shard_transfer_attempts",
                &self.shard_transfer_attempts,
                "Retry cap for a single shard transfer before excluding the farmer.",
            ),
            ser_param(
                "audit_fault_threshold",
                &self.audit_fault_threshold,
                "Consecutive audit failures before a farmer is marked faulty.",
            ),
        ])
    }
}
