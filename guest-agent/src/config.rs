use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use guestctl_protocol::{HOST_CID, HOST_SERVICE_PORT};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the guest agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub channel: ChannelConfig,
    pub control: ControlConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.channel.port != 0, "channel.port must not be 0");
        if self.channel.transport == Transport::Tcp {
            anyhow::ensure!(
                self.channel.tcp_addr.parse::<SocketAddr>().is_ok(),
                "channel.tcp_addr is not a valid socket address: {}",
                self.channel.tcp_addr
            );
        }
        anyhow::ensure!(
            self.control.poll_interval_ms >= 10,
            "control.poll_interval_ms must be >= 10"
        );
        anyhow::ensure!(
            self.control.read_timeout_ms <= 10_000,
            "control.read_timeout_ms must be <= 10000"
        );
        anyhow::ensure!(
            self.control.request_timeout_secs >= 1,
            "control.request_timeout_secs must be >= 1"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Vsock,
    /// Plain TCP, for development without a vsock-capable hypervisor.
    Tcp,
}

/// Where the host-side control service lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub transport: Transport,
    /// vsock CID of the host (2 = VMADDR_CID_HOST).
    pub host_cid: u32,
    pub port: u32,
    /// Host address used when `transport = "tcp"`.
    pub tcp_addr: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Vsock,
            host_cid: HOST_CID,
            port: HOST_SERVICE_PORT,
            tcp_addr: format!("127.0.0.1:{HOST_SERVICE_PORT}"),
        }
    }
}

/// Process supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Maximum concurrently running guest processes (0 = unbounded).
    pub max_processes: u32,
    /// How often a supervisor checks its process for exit when idle.
    pub poll_interval_ms: u64,
    /// Upper bound on how long one output read waits for data.
    pub read_timeout_ms: u64,
    /// How long a handler waits for a supervisor to fulfil a request.
    pub request_timeout_secs: u64,
    /// Per-entry wait when reaping stopped supervisors.
    pub reap_wait_secs: u64,
    /// Overall bound on waiting for supervisors to stop at shutdown.
    pub shutdown_wait_secs: u64,
    /// Pause after a failed channel poll.
    pub retry_delay_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            max_processes: 5,
            poll_interval_ms: 250,
            read_timeout_ms: 100,
            request_timeout_secs: 30,
            reap_wait_secs: 30,
            shutdown_wait_secs: 30,
            retry_delay_ms: 1000,
        }
    }
}

impl ControlConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reap_wait(&self) -> Duration {
        Duration::from_secs(self.reap_wait_secs)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.shutdown_wait_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
