use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Runtime knobs for the relay engine.
///
/// Every field has a default and can be overridden through the environment;
/// see [`RelayConfig::from_env_or_default`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Number of chunk slots in each coordinator's ring.
    pub shared_buffer_size: usize,

    /// Maximum bytes staged per ring chunk.
    pub chunk_size: usize,

    /// Upstream inactivity timeout. `None` means retry forever; reads are
    /// then guarded by a one-minute watchdog per attempt.
    pub stream_timeout: Option<Duration>,

    /// Full laps the load balancer makes over the source list before giving
    /// up. `0` means unbounded (the request's cancellation token is the only
    /// limit).
    pub max_retries: u32,

    /// Minimum average throughput in bytes/s over a 5 s window. `0`
    /// disables the check.
    pub minimum_throughput: u64,

    /// User agent presented to upstream servers.
    pub user_agent: String,

    /// Per-attempt connect timeout for upstream dials.
    pub connect_timeout: Duration,

    /// Interval between registry sweeps for idle coordinators.
    pub registry_sweep_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            shared_buffer_size: 8,
            chunk_size: 1024 * 1024,
            stream_timeout: Some(Duration::from_secs(3)),
            max_retries: 5,
            minimum_throughput: 0,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            connect_timeout: Duration::from_secs(10),
            registry_sweep_interval: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    /// Load the relay config from environment variables, falling back to
    /// defaults.
    ///
    /// Supported env vars:
    /// - `SHARED_BUFFER_SIZE` (slots, default 8)
    /// - `CHUNK_SIZE` (bytes, default 1048576)
    /// - `STREAM_TIMEOUT` (seconds, default 3; 0 = unlimited retry)
    /// - `MAX_RETRIES` (default 5; 0 = unlimited)
    /// - `MINIMUM_THROUGHPUT` (bytes/s, default 0 = disabled)
    /// - `USER_AGENT`
    pub fn from_env_or_default() -> Self {
        let mut config = Self::default();

        if let Some(size) = parse_env::<usize>("SHARED_BUFFER_SIZE") {
            config.shared_buffer_size = size.max(1);
        }

        if let Some(size) = parse_env::<usize>("CHUNK_SIZE") {
            config.chunk_size = size.max(1);
        }

        if let Some(secs) = parse_env::<u64>("STREAM_TIMEOUT") {
            config.stream_timeout = if secs == 0 {
                None
            } else {
                Some(Duration::from_secs(secs))
            };
        }

        if let Some(laps) = parse_env::<u32>("MAX_RETRIES") {
            config.max_retries = laps;
        }

        if let Some(rate) = parse_env::<u64>("MINIMUM_THROUGHPUT") {
            config.minimum_throughput = rate;
        }

        if let Ok(agent) = std::env::var("USER_AGENT")
            && !agent.trim().is_empty()
        {
            config.user_agent = agent;
        }

        config
    }

    /// Effective per-read watchdog for writer loops. With retries unlimited
    /// the upstream read is still bounded so a wedged socket cannot park the
    /// writer forever.
    pub fn read_deadline(&self) -> Duration {
        self.stream_timeout.unwrap_or(Duration::from_secs(60))
    }

    /// Whether writer-internal retries are enabled at all.
    pub fn unlimited_retries(&self) -> bool {
        self.stream_timeout.is_none()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse::<T>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RelayConfig::default();
        assert_eq!(config.shared_buffer_size, 8);
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.stream_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.minimum_throughput, 0);
    }

    #[test]
    fn zero_timeout_means_unlimited() {
        let config = RelayConfig {
            stream_timeout: None,
            ..Default::default()
        };
        assert!(config.unlimited_retries());
        assert_eq!(config.read_deadline(), Duration::from_secs(60));
    }
}
