//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Worker pool configuration
    #[serde(default)]
    pub pool: PoolConfig,
    /// Deadline scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Multiplexer configuration
    #[serde(default)]
    pub mux: MuxConfig,
    /// Connect request configuration
    #[serde(default)]
    pub connect: ConnectConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }

    /// Reject values the runtime cannot honor
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.pool.max_workers == 0 {
            return Err(crate::Error::Config("pool.max_workers must be at least 1".into()));
        }
        if self.pool.min_workers > self.pool.max_workers {
            return Err(crate::Error::Config(format!(
                "pool.min_workers ({}) exceeds pool.max_workers ({})",
                self.pool.min_workers, self.pool.max_workers
            )));
        }
        if self.scheduler.interval_ms == 0 {
            return Err(crate::Error::Config("scheduler.interval_ms must be non-zero".into()));
        }
        if self.mux.max_channels == 0 || self.mux.max_channels > crate::tunnel::MAX_CHANNELS {
            return Err(crate::Error::Config(format!(
                "mux.max_channels must be within 1..={}",
                crate::tunnel::MAX_CHANNELS
            )));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// Pre-shared key (base64, 32 bytes)
    #[serde(default)]
    pub psk: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8443".to_string(),
            psk: String::new(),
            max_connections: 1000,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Workers kept warm even when idle
    pub min_workers: usize,
    /// Upper bound on concurrently running jobs
    pub max_workers: usize,
    /// Idle time after which a worker above the floor retires (milliseconds)
    pub max_worker_idle_ms: u64,
    /// Longest a submission waits for a free worker (milliseconds)
    pub job_receive_timeout_ms: u64,
}

impl PoolConfig {
    pub fn max_worker_idle(&self) -> Duration {
        Duration::from_millis(self.max_worker_idle_ms)
    }

    pub fn job_receive_timeout(&self) -> Duration {
        Duration::from_millis(self.job_receive_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 16,
            max_workers: 256,
            max_worker_idle_ms: 10_000,
            job_receive_timeout_ms: 3_000,
        }
    }
}

/// Deadline scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scan interval (milliseconds)
    pub interval_ms: u64,
    /// Requests accepted before the scan task picks them up
    pub queue_depth: usize,
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: crate::deadline::DEFAULT_INTERVAL.as_millis() as u64,
            queue_depth: crate::deadline::DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Multiplexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxConfig {
    /// Default virtual channel read timeout (milliseconds, 0 = none)
    pub read_timeout_ms: u64,
    /// Number of virtual channels per connection
    pub max_channels: usize,
}

impl MuxConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: 60_000,
            max_channels: crate::tunnel::DEFAULT_MAX_CHANNELS,
        }
    }
}

/// IPv4 connect request configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Upper bound for the dial timeout a client may ask for (seconds)
    pub dial_timeout_secs: u64,
    /// Upstream inactivity after which a relay is torn down (seconds)
    pub connection_timeout_secs: u64,
    /// Refuse loopback, private and link-local destinations
    pub no_local_access: bool,
}

impl ConnectConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            dial_timeout_secs: 10,
            connection_timeout_secs: 120,
            no_local_access: true,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config::default()
}
