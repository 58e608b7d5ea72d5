use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use hookshot_common::retry::RetryPolicy;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3300")]
    pub port: u16,

    /// Events, destinations and deliveries are kept in memory when unset.
    pub database_url: Option<String>,

    #[envconfig(default = "10")]
    pub max_pg_connections: u32,

    #[envconfig(default = "1048576")]
    pub max_payload_size: usize,

    #[envconfig(default = "30")]
    pub retention_days: u32,

    #[envconfig(default = "3600")]
    pub cleanup_interval_secs: u64,

    #[envconfig(default = "300")]
    pub retry_sweep_interval_secs: u64,

    #[envconfig(default = "100")]
    pub retry_sweep_batch_size: u32,

    #[envconfig(default = "10")]
    pub max_concurrent_dispatches: usize,

    /// JSON array of destinations inserted at startup.
    pub destinations_file: Option<String>,

    #[envconfig(default = "1000")]
    pub error_capture_buffer: usize,

    #[envconfig(nested = true)]
    pub immediate_retry: ImmediateRetryConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn retry_sweep_interval(&self) -> time::Duration {
        time::Duration::from_secs(self.retry_sweep_interval_secs)
    }

    pub fn cleanup_interval(&self) -> time::Duration {
        time::Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Backoff between resubmissions in the immediate retry phase.
#[derive(Envconfig, Clone)]
pub struct ImmediateRetryConfig {
    #[envconfig(from = "IMMEDIATE_RETRY_EXPONENT", default = "4")]
    pub exponent: u32,

    #[envconfig(from = "IMMEDIATE_RETRY_UNIT_MS", default = "1000")]
    pub unit: EnvMsDuration,

    #[envconfig(from = "IMMEDIATE_RETRY_BASE_MS", default = "2000")]
    pub base_interval: EnvMsDuration,

    #[envconfig(from = "IMMEDIATE_RETRY_MAXIMUM_MS", default = "600000")]
    pub maximum_interval: EnvMsDuration,
}

impl ImmediateRetryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(self.exponent, self.unit.0)
            .base_interval(self.base_interval.0)
            .maximum_interval(self.maximum_interval.0)
            .provide()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.bind(), "[::]:3300");
        assert!(config.database_url.is_none());
        assert_eq!(config.max_payload_size, 1_048_576);
        assert_eq!(config.max_concurrent_dispatches, 10);
        assert_eq!(config.retry_sweep_interval(), time::Duration::from_secs(300));
        assert_eq!(config.retry_sweep_batch_size, 100);
        assert_eq!(config.cleanup_interval(), time::Duration::from_secs(3600));

        let policy = config.immediate_retry.retry_policy();
        assert_eq!(policy.retry_interval(1), time::Duration::from_secs(3));
        assert_eq!(policy.retry_interval(2), time::Duration::from_secs(18));
        assert_eq!(policy.retry_interval(100), time::Duration::from_secs(600));
    }

    #[test]
    fn test_overrides() {
        let env = HashMap::from([
            ("BIND_HOST".to_owned(), "127.0.0.1".to_owned()),
            ("BIND_PORT".to_owned(), "8080".to_owned()),
            ("DATABASE_URL".to_owned(), "postgres://localhost/hookshot".to_owned()),
            ("IMMEDIATE_RETRY_EXPONENT".to_owned(), "1".to_owned()),
            ("IMMEDIATE_RETRY_BASE_MS".to_owned(), "0".to_owned()),
        ]);
        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.bind(), "127.0.0.1:8080");
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/hookshot")
        );
        assert_eq!(
            config.immediate_retry.retry_policy().retry_interval(3),
            time::Duration::from_secs(3)
        );
    }

    #[test]
    fn test_invalid_duration() {
        assert_eq!(
            "soon".parse::<EnvMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
    }
}
