//! Pool configuration.
//!
//! The configuration is fixed when the pool is built. It names the envelope
//! algorithm and the shared password; leaving the algorithm out disables
//! encryption and gives the transport the full [`BASE_MTU`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::{BASE_MTU, ConfigError};
use crate::crypto::Algorithm;

/// Construction-time options for a [`Pool`](crate::transport::Pool).
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Envelope algorithm; `None` sends datagrams in the clear.
    pub algorithm: Option<Algorithm>,

    /// Shared secret the envelope key is derived from.
    pub password: Option<String>,
}

impl PoolConfig {
    /// Create a configuration builder.
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::new()
    }

    /// Check that the options can be used to build a pool.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (self.algorithm, &self.password) {
            (Some(alg), None) => Err(ConfigError::MissingPassword(alg.name().to_string())),
            _ => Ok(()),
        }
    }

    /// Payload size left for the transport after envelope overhead.
    pub fn mtu(&self) -> usize {
        match self.algorithm {
            Some(alg) => BASE_MTU - alg.overhead(),
            None => BASE_MTU,
        }
    }
}

impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("algorithm", &self.algorithm)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Builder for creating a [`PoolConfig`].
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Create a new builder with encryption disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the envelope algorithm.
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.config.algorithm = Some(algorithm);
        self
    }

    /// Set the shared password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.config.password = Some(password.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> PoolConfig {
        self.config
    }
}
