//! Session configuration.
//!
//! The retransmit bound and the timing thresholds depend on the radio hardware,
//! so they are tunable rather than part of the wire protocol.

use std::time::Duration;

use super::constants::{
    DEFAULT_EXCHANGE_TIMEOUT, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_RETRANSMITS,
    DEFAULT_POLLING_TIMEOUT, DEFAULT_RESUME_THRESHOLD, MAX_FRAME_SIZE_LIMIT, MIN_FRAME_SIZE,
};
use super::error::{ProtocolError, Result};

/// Tunables shared by both roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Largest frame (header + payload) sent per exchange.
    pub max_frame_size: usize,

    /// Retransmissions allowed per exchange before the session fails.
    pub max_retransmits: u32,

    /// Inactivity threshold of the watchdog; also bounds the resume window.
    pub resume_threshold: Duration,

    /// Upper bound for one channel exchange.
    pub exchange_timeout: Duration,

    /// How long a deferred response may be polled for.
    pub polling_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_retransmits: DEFAULT_MAX_RETRANSMITS,
            resume_threshold: DEFAULT_RESUME_THRESHOLD,
            exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
            polling_timeout: DEFAULT_POLLING_TIMEOUT,
        }
    }
}

impl SessionConfig {
    /// Check that the configuration can drive a session.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&self.max_frame_size) {
            return Err(ProtocolError::Config(format!(
                "max_frame_size {} outside {}..={}",
                self.max_frame_size, MIN_FRAME_SIZE, MAX_FRAME_SIZE_LIMIT
            )));
        }
        if self.resume_threshold.is_zero() {
            return Err(ProtocolError::Config("resume_threshold must be non-zero".into()));
        }
        if self.exchange_timeout.is_zero() {
            return Err(ProtocolError::Config("exchange_timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Initiator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatorConfig {
    /// Identity announced in the SESSION_ID handshake.
    pub session_id: u64,

    /// Shared session tunables.
    pub session: SessionConfig,
}

impl InitiatorConfig {
    /// Create a configuration with default tunables.
    pub fn new(session_id: u64) -> Self {
        Self {
            session_id,
            session: SessionConfig::default(),
        }
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum frame size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the retransmit bound.
    pub fn max_retransmits(mut self, max: u32) -> Self {
        self.config.max_retransmits = max;
        self
    }

    /// Set the watchdog / resume threshold.
    pub fn resume_threshold(mut self, threshold: Duration) -> Self {
        self.config.resume_threshold = threshold;
        self
    }

    /// Set the single-exchange timeout.
    pub fn exchange_timeout(mut self, timeout: Duration) -> Self {
        self.config.exchange_timeout = timeout;
        self
    }

    /// Set the deferred-response polling timeout.
    pub fn polling_timeout(mut self, timeout: Duration) -> Self {
        self.config.polling_timeout = timeout;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
