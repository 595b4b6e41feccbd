//! Bridge configuration and builder.
//!
//! [`BridgeConfig`] holds every tunable of the bridge and can be loaded from
//! JSON; fields left out keep their defaults. [`BridgeBuilder`] offers the
//! same knobs fluently and assembles the [`BridgeController`].
//!
//! # Example
//!
//! ```ignore
//! use ble_http_bridge::BridgeController;
//!
//! let bridge = BridgeController::builder()
//!     .trusted_host("lichess.org")
//!     .token_store(tokens.clone())
//!     .max_chunk_size(180)
//!     .build()?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bridge::BridgeController;
use crate::error::{BridgeError, Result};
use crate::executor::{AuthPolicy, HttpClient, ReqwestClient, RequestExecutor, TokenStore};
use crate::multiplexer::{DuplicateIdPolicy, MultiplexerConfig, DEFAULT_MAX_CONCURRENT_REQUESTS};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::transport::WriteMode;
use crate::writer::{WriterConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_CHUNK_SIZE};

/// Largest value a BLE attribute can hold.
pub const MAX_ATTRIBUTE_SIZE: usize = 512;

/// Default acknowledgment timeout in milliseconds.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 10_000;

/// Default teardown grace period in milliseconds.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;

/// Bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Upstream host that receives the bearer token.
    pub trusted_host: Option<String>,
    /// Largest chunk written to the characteristic.
    pub max_chunk_size: usize,
    pub write_mode: WriteMode,
    /// Per-chunk acknowledgment timeout.
    pub ack_timeout_ms: u64,
    /// Outgoing frame queue capacity.
    pub writer_queue_capacity: usize,
    pub max_concurrent_requests: usize,
    /// Longest partial frame the reassembler keeps.
    pub max_frame_size: usize,
    pub duplicate_id_policy: DuplicateIdPolicy,
    pub ping_enabled: bool,
    /// How long teardown waits for handlers before aborting them.
    pub shutdown_grace_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            trusted_host: None,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            write_mode: WriteMode::WithResponse,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
            writer_queue_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            duplicate_id_policy: DuplicateIdPolicy::Shadow,
            ping_enabled: true,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl BridgeConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 || self.max_chunk_size > MAX_ATTRIBUTE_SIZE {
            return Err(BridgeError::Config(format!(
                "max_chunk_size must be between 1 and {}, got {}",
                MAX_ATTRIBUTE_SIZE, self.max_chunk_size
            )));
        }
        if self.ack_timeout_ms == 0 {
            return Err(BridgeError::Config("ack_timeout_ms must be positive".into()));
        }
        if self.writer_queue_capacity == 0 {
            return Err(BridgeError::Config(
                "writer_queue_capacity must be positive".into(),
            ));
        }
        if self.max_concurrent_requests == 0 {
            return Err(BridgeError::Config(
                "max_concurrent_requests must be positive".into(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(BridgeError::Config("max_frame_size must be positive".into()));
        }
        if let Some(host) = &self.trusted_host {
            if host.is_empty() || host.contains(&['/', ':', ' '][..]) {
                return Err(BridgeError::Config(format!(
                    "trusted_host must be a bare host name, got {:?}",
                    host
                )));
            }
        }
        Ok(())
    }

    /// Acknowledgment timeout.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Teardown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Settings for a connection's writer task.
    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            max_chunk_size: self.max_chunk_size,
            write_mode: self.write_mode,
            ack_timeout: self.ack_timeout(),
            channel_capacity: self.writer_queue_capacity,
        }
    }

    /// Settings for a connection's multiplexer.
    pub fn multiplexer_config(&self) -> MultiplexerConfig {
        MultiplexerConfig {
            max_concurrent_requests: self.max_concurrent_requests,
            duplicate_id_policy: self.duplicate_id_policy,
            ping_enabled: self.ping_enabled,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Builder for configuring and creating a [`BridgeController`].
pub struct BridgeBuilder {
    config: BridgeConfig,
    client: Option<Arc<dyn HttpClient>>,
    tokens: Option<Arc<dyn TokenStore>>,
}

impl BridgeBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::from_config(BridgeConfig::default())
    }

    /// Start from a loaded configuration.
    pub fn from_config(config: BridgeConfig) -> Self {
        Self {
            config,
            client: None,
            tokens: None,
        }
    }

    /// Set the host that receives the bearer token.
    pub fn trusted_host(mut self, host: impl Into<String>) -> Self {
        self.config.trusted_host = Some(host.into());
        self
    }

    /// Set the source of the bearer token.
    pub fn token_store(mut self, tokens: Arc<dyn TokenStore>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Use a custom upstream client.
    ///
    /// Default: [`ReqwestClient`]
    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Set the largest chunk written to the characteristic.
    ///
    /// Default: 20
    pub fn max_chunk_size(mut self, size: usize) -> Self {
        self.config.max_chunk_size = size;
        self
    }

    /// Set the characteristic write mode.
    ///
    /// Default: [`WriteMode::WithResponse`]
    pub fn write_mode(mut self, mode: WriteMode) -> Self {
        self.config.write_mode = mode;
        self
    }

    /// Set the per-chunk acknowledgment timeout.
    ///
    /// Default: 10 seconds
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout_ms = millis(timeout);
        self
    }

    /// Set the outgoing frame queue capacity.
    ///
    /// Default: 64
    pub fn writer_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.writer_queue_capacity = capacity;
        self
    }

    /// Set the maximum number of concurrently running requests.
    ///
    /// Requests beyond the limit are answered with an `Error` frame.
    /// Default: 16
    pub fn max_concurrent_requests(mut self, limit: usize) -> Self {
        self.config.max_concurrent_requests = limit;
        self
    }

    /// Set the longest partial frame the reassembler keeps.
    ///
    /// Default: 64 KiB
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the duplicate request id policy.
    ///
    /// Default: [`DuplicateIdPolicy::Shadow`]
    pub fn duplicate_id_policy(mut self, policy: DuplicateIdPolicy) -> Self {
        self.config.duplicate_id_policy = policy;
        self
    }

    /// Enable or disable answering `Ping`.
    ///
    /// Default: enabled
    pub fn ping_enabled(mut self, enabled: bool) -> Self {
        self.config.ping_enabled = enabled;
        self
    }

    /// Set how long teardown waits for handlers before aborting them.
    ///
    /// Default: 2 seconds
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.config.shutdown_grace_ms = millis(grace);
        self
    }

    /// Validate the settings and build the controller.
    pub fn build(self) -> Result<BridgeController> {
        self.config.validate()?;

        let client = self
            .client
            .unwrap_or_else(|| Arc::new(ReqwestClient::new()) as Arc<dyn HttpClient>);

        let auth = match (self.tokens, &self.config.trusted_host) {
            (Some(tokens), Some(host)) => AuthPolicy::new(tokens, host.clone()),
            (Some(_), None) => {
                warn!("Token store configured without a trusted host, tokens will not be sent");
                AuthPolicy::none()
            }
            (None, _) => AuthPolicy::none(),
        };

        Ok(BridgeController::new(
            self.config,
            RequestExecutor::new(client, auth),
        ))
    }
}

impl Default for BridgeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
