//! Client configuration
//!
//! One immutable value injected at construction; nothing here is global.
//! All fields have defaults, so a minimal embedder only names the bucket
//! and the seed nodes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::delay::Delay;
use crate::error::ClientError;

/// Default flow-control buffer advertised per connection (20MB)
pub const DEFAULT_FLOW_CONTROL_BUFFER: u32 = 20 * 1024 * 1024;

/// Default buffer-ack watermark (percent of the buffer)
pub const DEFAULT_ACK_WATERMARK_PERCENT: u8 = 60;

/// How node addresses from the cluster map are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkResolution {
    /// Use the cluster-internal addresses as published
    #[default]
    Default,
    /// Prefer the alternate (external) addresses when published
    External,
}

/// TLS settings, carried for the transport layer
///
/// The key-store plumbing itself lives outside the core; these fields are
/// validated and handed through untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SslConfig {
    pub enabled: bool,
    pub keystore: Option<PathBuf>,
    pub keystore_password: Option<String>,
    pub truststore: Option<PathBuf>,
    pub truststore_password: Option<String>,
}

/// Configuration for the streaming client
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bucket to stream from
    pub bucket: String,

    /// Collection ids to filter the stream to (empty = whole bucket)
    pub cids: Vec<u32>,

    /// Seed KV node addresses used for bootstrap
    pub cluster_seeds: Vec<SocketAddr>,

    /// DCP connection name; generated when unset
    pub connection_name: Option<String>,

    /// Address-resolution mode for the cluster map
    pub network_resolution: NetworkResolution,

    /// TLS settings
    pub ssl: SslConfig,

    /// Port for bootstrap over HTTP
    pub bootstrap_http_port: u16,

    /// Port for bootstrap over HTTPS
    pub bootstrap_https_port: u16,

    /// Subset of vbuckets to stream (empty = all partitions)
    pub vbuckets: Vec<u16>,

    /// Percent of the flow-control buffer that triggers a BUFFER_ACK
    pub buffer_ack_watermark_percent: u8,

    /// Reuse read buffers across frames
    pub pool_buffers: bool,

    /// Flow-control buffer advertised at negotiation; 0 disables flow control
    pub flow_control_buffer_size: u32,

    /// Per-attempt timeout for config fetches
    pub config_provider_attempt_timeout: Duration,

    /// Total budget for config fetch retries; zero means a single attempt
    pub config_provider_total_timeout: Duration,

    /// Pause between config fetch attempts
    pub config_provider_reconnect_delay: Delay,

    /// Per-attempt timeout for channel connects
    pub dcp_channel_attempt_timeout: Duration,

    /// Total budget for channel connect retries; zero means a single attempt
    pub dcp_channel_total_timeout: Duration,

    /// Pause between channel connect attempts
    pub dcp_channels_reconnect_delay: Delay,

    /// Probe period for dead connections; zero disables detection
    pub dead_connection_detection_interval: Duration,

    /// Extra DCP control parameters sent verbatim at negotiation
    pub control_params: HashMap<String, String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            cids: Vec::new(),
            cluster_seeds: Vec::new(),
            connection_name: None,
            network_resolution: NetworkResolution::Default,
            ssl: SslConfig::default(),
            bootstrap_http_port: 8091,
            bootstrap_https_port: 18091,
            vbuckets: Vec::new(),
            buffer_ack_watermark_percent: DEFAULT_ACK_WATERMARK_PERCENT,
            pool_buffers: true,
            flow_control_buffer_size: DEFAULT_FLOW_CONTROL_BUFFER,
            config_provider_attempt_timeout: Duration::from_secs(5),
            config_provider_total_timeout: Duration::from_secs(30),
            config_provider_reconnect_delay: Delay::fixed(Duration::from_secs(1)),
            dcp_channel_attempt_timeout: Duration::from_secs(10),
            dcp_channel_total_timeout: Duration::from_secs(60),
            dcp_channels_reconnect_delay: Delay::fixed(Duration::from_secs(1)),
            dead_connection_detection_interval: Duration::ZERO,
            control_params: HashMap::new(),
        }
    }
}

impl ClientConfig {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Whether buffer-ack flow control is negotiated
    pub fn flow_control_enabled(&self) -> bool {
        self.flow_control_buffer_size > 0
    }

    #[must_use]
    pub fn with_cluster_seeds(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.cluster_seeds = seeds;
        self
    }

    #[must_use]
    pub fn with_cids(mut self, cids: Vec<u32>) -> Self {
        self.cids = cids;
        self
    }

    #[must_use]
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_vbuckets(mut self, vbuckets: Vec<u16>) -> Self {
        self.vbuckets = vbuckets;
        self
    }

    #[must_use]
    pub fn with_flow_control(mut self, buffer_size: u32, watermark_percent: u8) -> Self {
        self.flow_control_buffer_size = buffer_size;
        self.buffer_ack_watermark_percent = watermark_percent;
        self
    }

    #[must_use]
    pub fn with_channel_timeouts(
        mut self,
        attempt_timeout: Duration,
        total_timeout: Duration,
        reconnect_delay: Delay,
    ) -> Self {
        self.dcp_channel_attempt_timeout = attempt_timeout;
        self.dcp_channel_total_timeout = total_timeout;
        self.dcp_channels_reconnect_delay = reconnect_delay;
        self
    }

    #[must_use]
    pub fn with_config_provider_timeouts(
        mut self,
        attempt_timeout: Duration,
        total_timeout: Duration,
        reconnect_delay: Delay,
    ) -> Self {
        self.config_provider_attempt_timeout = attempt_timeout;
        self.config_provider_total_timeout = total_timeout;
        self.config_provider_reconnect_delay = reconnect_delay;
        self
    }

    #[must_use]
    pub fn with_dead_connection_detection(mut self, interval: Duration) -> Self {
        self.dead_connection_detection_interval = interval;
        self
    }

    #[must_use]
    pub fn with_control_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.control_params.insert(key.into(), value.into());
        self
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.bucket.is_empty() {
            return Err(ClientError::InvalidConfig("bucket name is empty".into()));
        }
        if self.buffer_ack_watermark_percent > 100 {
            return Err(ClientError::InvalidConfig(format!(
                "buffer_ack_watermark_percent must be within 0..=100, got {}",
                self.buffer_ack_watermark_percent
            )));
        }
        if self.flow_control_enabled() && self.buffer_ack_watermark_percent == 0 {
            return Err(ClientError::InvalidConfig(
                "buffer_ack_watermark_percent must be set when flow control is enabled".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
