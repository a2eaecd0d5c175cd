// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Delivery configuration.
//!
//! Supports both programmatic and file-based (TOML) configuration. Interval
//! options are stored as integer milliseconds and exposed as [`Duration`]
//! accessors.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Per-controller delivery options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Fixed delay of the first-message resend timer (milliseconds).
    ///
    /// The earliest unconfirmed message is re-emitted at this cadence until
    /// the consumer answers with its initial `Request`.
    #[serde(default = "default_resend_first_interval_ms")]
    pub resend_first_interval_ms: u64,

    /// Initial resend-support hint, effective until the first `Request`
    /// declares the consumer's actual capability.
    #[serde(default = "default_true")]
    pub support_resend: bool,

    /// Safety-net timeout for blocking confirmation waits (milliseconds).
    #[serde(default = "default_unexpected_ask_timeout_ms")]
    pub unexpected_ask_timeout_ms: u64,
}

fn default_resend_first_interval_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_unexpected_ask_timeout_ms() -> u64 {
    20_000
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            resend_first_interval_ms: default_resend_first_interval_ms(),
            support_resend: true,
            unexpected_ask_timeout_ms: default_unexpected_ask_timeout_ms(),
        }
    }
}

impl DeliveryConfig {
    /// First-message resend cadence.
    #[must_use]
    pub fn resend_first_interval(&self) -> Duration {
        Duration::from_millis(self.resend_first_interval_ms)
    }

    /// Blocking-ask safety net.
    #[must_use]
    pub fn unexpected_ask_timeout(&self) -> Duration {
        Duration::from_millis(self.unexpected_ask_timeout_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resend_first_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "resend_first_interval_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Work-pulling router options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPullingConfig {
    /// Maximum messages queued while no worker has demand.
    ///
    /// Once the buffer is full the router withholds `RequestNext`, which
    /// backpressures the producer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Polling cadence for service-discovery snapshots (milliseconds).
    #[serde(default = "default_registry_poll_interval_ms")]
    pub registry_poll_interval_ms: u64,

    /// Options applied to each per-worker controller.
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

fn default_buffer_size() -> usize {
    1_000
}

fn default_registry_poll_interval_ms() -> u64 {
    1_000
}

impl Default for WorkPullingConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            registry_poll_interval_ms: default_registry_poll_interval_ms(),
            delivery: DeliveryConfig::default(),
        }
    }
}

impl WorkPullingConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Registry snapshot cadence.
    #[must_use]
    pub fn registry_poll_interval(&self) -> Duration {
        Duration::from_millis(self.registry_poll_interval_ms)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be >= 1".into()));
        }
        if self.registry_poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "registry_poll_interval_ms must be > 0".into(),
            ));
        }
        self.delivery.validate()
    }
}

// ============================================================================
// TESTS
// ============================================================================
