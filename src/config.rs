//! # Configuration
//!
//! Tunables for the protocol engine. See SPEC_FULL.md §6 for the full
//! surface and defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for a running Z-Mesh engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Maximum bytes of pre-encoding chunk payload per DATA frame.
    pub chunk_payload_max: usize,
    /// Per-chunk watchdog deadline.
    pub chunk_timeout: Duration,
    /// Maximum retransmissions for a single chunk (or BEGIN) before failing.
    pub max_retries: u8,
    /// How long the sender waits for the first ACK after BEGIN.
    pub negotiate_timeout: Duration,
    /// How long the sender waits for FIN after sending END.
    pub final_timeout: Duration,
    /// How long the receiver tolerates silence before aborting.
    pub recv_idle_timeout: Duration,
    /// Interval between discovery PING broadcasts.
    pub discovery_interval: Duration,
    /// Window after which a node is no longer considered active.
    pub node_active_window: Duration,
    /// Token bucket burst capacity for outbound frames.
    pub tx_burst: u32,
    /// Token bucket refill rate, in tokens per second.
    pub tx_rate_hz: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_payload_max: 120,
            chunk_timeout: Duration::from_secs(30),
            max_retries: 5,
            negotiate_timeout: Duration::from_secs(30),
            final_timeout: Duration::from_secs(60),
            recv_idle_timeout: Duration::from_secs(120),
            discovery_interval: Duration::from_secs(60),
            node_active_window: Duration::from_secs(600),
            tx_burst: 3,
            tx_rate_hz: 1,
        }
    }
}

impl Config {
    /// Validate the configuration, rejecting out-of-range values rather than
    /// letting them surface as confusing panics deep inside the engine.
    pub fn validate(&self) -> Result<()> {
        if !(16..=200).contains(&self.chunk_payload_max) {
            return Err(Error::InvalidConfig(format!(
                "chunk_payload_max must be in 16..=200, got {}",
                self.chunk_payload_max
            )));
        }
        if self.max_retries == 0 {
            return Err(Error::InvalidConfig(
                "max_retries must be at least 1".into(),
            ));
        }
        if self.tx_burst == 0 {
            return Err(Error::InvalidConfig("tx_burst must be at least 1".into()));
        }
        if self.tx_rate_hz == 0 {
            return Err(Error::InvalidConfig(
                "tx_rate_hz must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
