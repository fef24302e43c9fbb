use crate::error::{Error, Result};
use crate::sd::SdTiming;
use crate::subscription::UnavailablePolicy;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Service Discovery endpoint
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SdConfig {
    pub multicast_ip: Ipv4Addr,
    pub port: u16,
}

impl Default for SdConfig {
    fn default() -> Self {
        SdConfig {
            multicast_ip: Ipv4Addr::new(224, 224, 224, 245),
            port: 30490,
        }
    }
}

/// Runtime configuration, usually read from a JSON file.
/// Every field is optional; timing values are in milliseconds unless the
/// name says otherwise.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Client ID stamped on outgoing requests
    pub client_id: u16,
    /// Handler worker threads (default: 4)
    pub worker_pool_size: usize,
    /// Jobs queued per worker before dispatch fails with `QueueFull` (default: 256)
    pub dispatch_queue_bound: usize,
    /// Cyclic offer/find delay in the main phase (default: 1000)
    pub announce_interval_ms: u64,
    /// First repetition delay, doubled each time (default: 100)
    pub repetition_base_delay_ms: u64,
    pub repetition_max: u32,
    /// Upper bound on how long a remote offer stays valid without refresh (default: 5000)
    pub liveness_timeout_ms: u64,
    /// TTL of our offers in seconds
    pub offer_ttl: u32,
    /// TTL of our eventgroup subscriptions in seconds
    pub subscribe_ttl: u32,
    /// Receive threads wake up at least this often to check for shutdown
    pub receive_timeout_ms: u64,
    /// Discovery timer resolution
    pub tick_interval_ms: u64,
    pub unavailable_policy: UnavailablePolicy,
    pub sd: SdConfig,
    /// Address the data socket binds to and advertises
    pub unicast: IpAddr,
    /// Data port, 0 for an ephemeral one
    pub port: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            client_id: 0x0001,
            worker_pool_size: 4,
            dispatch_queue_bound: 256,
            announce_interval_ms: 1000,
            repetition_base_delay_ms: 100,
            repetition_max: 3,
            liveness_timeout_ms: 5000,
            offer_ttl: 3,
            subscribe_ttl: 3,
            receive_timeout_ms: 100,
            tick_interval_ms: 10,
            unavailable_policy: UnavailablePolicy::Suppress,
            sd: SdConfig::default(),
            unicast: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        }
    }
}

impl RuntimeConfig {
    /// Read and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        log::info!(target: "runtime", "Loading config from {}", path.display());
        let file = File::open(path)?;
        let config: RuntimeConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: RuntimeConfig =
            serde_json::from_str(json).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(Error::config("worker_pool_size must be at least 1"));
        }
        if self.dispatch_queue_bound == 0 {
            return Err(Error::config("dispatch_queue_bound must be at least 1"));
        }
        if self.liveness_timeout_ms <= self.announce_interval_ms {
            return Err(Error::config(format!(
                "liveness_timeout_ms ({}) must exceed announce_interval_ms ({})",
                self.liveness_timeout_ms, self.announce_interval_ms
            )));
        }
        if self.receive_timeout_ms == 0 || self.tick_interval_ms == 0 {
            return Err(Error::config("receive_timeout_ms and tick_interval_ms must be non-zero"));
        }
        Ok(())
    }

    pub fn sd_timing(&self) -> SdTiming {
        SdTiming {
            repetition_base_delay: Duration::from_millis(self.repetition_base_delay_ms),
            repetition_max: self.repetition_max,
            announce_interval: Duration::from_millis(self.announce_interval_ms),
            liveness_timeout: Duration::from_millis(self.liveness_timeout_ms),
            offer_ttl: self.offer_ttl,
            subscribe_ttl: self.subscribe_ttl,
        }
    }

    pub fn multicast_group(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.sd.multicast_ip), self.sd.port)
    }

    pub fn unicast_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.unicast, self.port)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.client_id, 1);
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.dispatch_queue_bound, 256);
        assert_eq!(config.multicast_group(), "224.224.224.245:30490".parse().unwrap());
        assert_eq!(config.unavailable_policy, UnavailablePolicy::Suppress);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_json_gives_defaults() {
        assert_eq!(RuntimeConfig::from_json("{}").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_partial_json() {
        let config = RuntimeConfig::from_json(
            r#"{
                "client_id": 4660,
                "worker_pool_size": 2,
                "unavailable_policy": "reject",
                "sd": { "port": 30491 },
                "unicast": "10.0.0.7"
            }"#,
        )
        .unwrap();

        assert_eq!(config.client_id, 0x1234);
        assert_eq!(config.worker_pool_size, 2);
        assert_eq!(config.unavailable_policy, UnavailablePolicy::Reject);
        assert_eq!(config.sd.multicast_ip, Ipv4Addr::new(224, 224, 224, 245));
        assert_eq!(config.sd.port, 30491);
        assert_eq!(config.unicast_endpoint(), "10.0.0.7:0".parse().unwrap());
        assert_eq!(config.dispatch_queue_bound, 256);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        for json in [
            r#"{"worker_pool_size": 0}"#,
            r#"{"dispatch_queue_bound": 0}"#,
            r#"{"liveness_timeout_ms": 1000, "announce_interval_ms": 1000}"#,
        ] {
            let err = RuntimeConfig::from_json(json).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{json}");
        }
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(RuntimeConfig::from_json("{ not json"), Err(Error::Config(_))));
        let queue_policy = RuntimeConfig::from_json(r#"{"unavailable_policy": "queue"}"#);
        assert!(matches!(queue_policy, Err(Error::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let err = RuntimeConfig::load("/nonexistent/someip.json").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_sd_timing() {
        let timing = RuntimeConfig::default().sd_timing();
        assert_eq!(timing.repetition_base_delay, Duration::from_millis(100));
        assert_eq!(timing.announce_interval, Duration::from_secs(1));
        assert_eq!(timing.liveness_timeout, Duration::from_secs(5));
        assert_eq!(timing.offer_ttl, 3);
    }
}
