//! State manager configuration, loaded from TOML with `serde` (matching the
//! teacher's `export` configuration story) and overridable from a small
//! `clap`-derived CLI for standalone test binaries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_lease_duration() -> Duration {
    Duration::from_secs(90)
}

fn default_grace_duration() -> Duration {
    Duration::from_secs(90)
}

fn default_max_slots_per_table() -> u32 {
    64
}

fn default_max_connections_per_session() -> u32 {
    64
}

fn default_recently_recalled_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_callback_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_dialout_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delegations() -> usize {
    100_000
}

fn default_back_channel_queue_depth() -> usize {
    256
}

fn default_revocation_send_failure_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_dir_notify_batch_interval() -> Duration {
    Duration::from_secs(1)
}

/// Every tunable the state manager's components reference (§3a).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateManagerConfig {
    /// Lease duration granted to confirmed clients.
    #[serde(with = "humantime_secs", rename = "lease_duration_secs")]
    pub lease_duration: Duration,

    /// Duration of the post-restart grace window.
    #[serde(with = "humantime_secs", rename = "grace_duration_secs")]
    pub grace_duration: Duration,

    /// Implementation clamp on a session's negotiated slot table size.
    pub max_slots_per_table: u32,

    /// Per-session connection-binding limit; 0 = unlimited.
    pub max_connections_per_session: u32,

    /// Anti-storm TTL for the recently-recalled cache.
    #[serde(with = "humantime_secs", rename = "recently_recalled_ttl_secs")]
    pub recently_recalled_ttl: Duration,

    /// Timeout for one back-channel callback round trip.
    #[serde(with = "humantime_secs", rename = "callback_timeout_secs")]
    pub callback_timeout: Duration,

    /// Combined dial+I/O deadline for v4.0 dial-out callbacks.
    #[serde(with = "humantime_secs", rename = "dialout_timeout_secs")]
    pub dialout_timeout: Duration,

    /// Cap on non-revoked delegations tracked at once.
    pub max_delegations: usize,

    /// Bound on a back-channel sender's pending-callback queue.
    pub back_channel_queue_depth: usize,

    /// Shortened revocation timer started when a recall send fails.
    #[serde(with = "humantime_secs", rename = "revocation_send_failure_timeout_secs")]
    pub revocation_send_failure_timeout: Duration,

    /// Whether the delegation engine grants delegations at all.
    pub delegations_enabled: bool,

    /// How often a directory delegation's accumulated changes are flushed
    /// via `CB_NOTIFY` (§4.6 "Directory delegations").
    #[serde(with = "humantime_secs", rename = "dir_notify_batch_interval_secs")]
    pub dir_notify_batch_interval: Duration,
}

impl Default for StateManagerConfig {
    fn default() -> Self {
        Self {
            lease_duration: default_lease_duration(),
            grace_duration: default_grace_duration(),
            max_slots_per_table: default_max_slots_per_table(),
            max_connections_per_session: default_max_connections_per_session(),
            recently_recalled_ttl: default_recently_recalled_ttl(),
            callback_timeout: default_callback_timeout(),
            dialout_timeout: default_dialout_timeout(),
            max_delegations: default_max_delegations(),
            back_channel_queue_depth: default_back_channel_queue_depth(),
            revocation_send_failure_timeout: default_revocation_send_failure_timeout(),
            delegations_enabled: true,
            dir_notify_batch_interval: default_dir_notify_batch_interval(),
        }
    }
}

impl StateManagerConfig {
    /// Parses a config from TOML text.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        d.as_secs().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// CLI overrides for a handful of the above, used by standalone test/demo
/// binaries rather than the forward protocol surface.
#[derive(Debug, clap::Parser)]
#[command(name = "dittofs-state", about = "NFSv4 state manager test harness")]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,

    /// Overrides `lease_duration_secs`.
    #[arg(long)]
    pub lease_duration_secs: Option<u64>,

    /// Overrides `grace_duration_secs`.
    #[arg(long)]
    pub grace_duration_secs: Option<u64>,
}

impl Cli {
    /// Loads the config file (if given) and applies CLI overrides on top.
    pub fn resolve(&self) -> std::io::Result<StateManagerConfig> {
        let mut cfg = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                StateManagerConfig::from_toml(&text)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
            }
            None => StateManagerConfig::default(),
        };
        if let Some(secs) = self.lease_duration_secs {
            cfg.lease_duration = Duration::from_secs(secs);
        }
        if let Some(secs) = self.grace_duration_secs {
            cfg.grace_duration = Duration::from_secs(secs);
        }
        Ok(cfg)
    }
}
