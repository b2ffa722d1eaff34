//! Centralized Configuration Management
//!
//! Every tunable of the session layer lives here, grouped by the component
//! that consumes it.

use crate::{DroplineError, DroplineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Connection Configuration
// ----------------------------------------------------------------------------

/// Configuration for opening data sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Budget for a session to report open before it is discarded
    pub connect_timeout: Duration,
    /// Ask the transport for a reliable, ordered data channel
    pub reliable: bool,
    /// Number of audit entries kept by the state machine
    pub audit_trail_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            reliable: true,
            audit_trail_capacity: 1000,
        }
    }
}

impl ConnectionConfig {
    /// Short timeouts for tests
    pub fn testing() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            reliable: true,
            audit_trail_capacity: 100,
        }
    }

    /// Generous timeout for slow NAT traversal
    pub fn patient() -> Self {
        Self {
            connect_timeout: Duration::from_secs(60),
            ..Self::default()
        }
    }
}

// ----------------------------------------------------------------------------
// Reconnection Configuration
// ----------------------------------------------------------------------------

/// Configuration for broker-disconnect recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Attempts allowed before recovery gives up
    pub max_attempts: u32,
    /// Delay before the first attempt, doubled for each following one
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl ReconnectConfig {
    /// Fast retries for tests
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
        }
    }

    /// More attempts with a longer ceiling
    pub fn patient() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_secs(30),
        }
    }
}

// ----------------------------------------------------------------------------
// Transport Configuration
// ----------------------------------------------------------------------------

/// Settings handed to the transport when an endpoint is created
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// STUN/TURN server URLs used for ICE negotiation
    pub ice_servers: Vec<String>,
    /// Number of ICE candidates gathered ahead of time
    pub ice_candidate_pool_size: u8,
    /// Verbosity requested from the transport library (0-3)
    pub debug_level: u8,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
                "stun:stun3.l.google.com:19302".to_string(),
                "stun:stun4.l.google.com:19302".to_string(),
                "stun:global.stun.twilio.com:3478".to_string(),
                "stun:stun.stunprotocol.org:3478".to_string(),
            ],
            ice_candidate_pool_size: 10,
            debug_level: 2,
        }
    }
}

impl TransportConfig {
    /// No ICE servers; for in-memory transports
    pub fn testing() -> Self {
        Self {
            ice_servers: Vec::new(),
            ice_candidate_pool_size: 0,
            debug_level: 0,
        }
    }
}

// ----------------------------------------------------------------------------
// Channel Configuration
// ----------------------------------------------------------------------------

/// Buffer sizes for the channels between the handle and the driver task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Commands from the UI handle
    pub command_buffer_size: usize,
    /// Events broadcast to subscribers
    pub event_buffer_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            command_buffer_size: 32,
            event_buffer_size: 128,
        }
    }
}

impl ChannelConfig {
    pub fn testing() -> Self {
        Self {
            command_buffer_size: 100,
            event_buffer_size: 512,
        }
    }
}

// ----------------------------------------------------------------------------
// Top-level Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for a Dropline runtime
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DroplineConfig {
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectConfig,
    pub transport: TransportConfig,
    pub channels: ChannelConfig,
}

impl DroplineConfig {
    /// Configuration optimized for testing
    pub fn testing() -> Self {
        Self {
            connection: ConnectionConfig::testing(),
            reconnect: ReconnectConfig::testing(),
            transport: TransportConfig::testing(),
            channels: ChannelConfig::testing(),
        }
    }

    /// Configuration for unreliable networks
    pub fn patient() -> Self {
        Self {
            connection: ConnectionConfig::patient(),
            reconnect: ReconnectConfig::patient(),
            ..Self::default()
        }
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_channels(mut self, channels: ChannelConfig) -> Self {
        self.channels = channels;
        self
    }

    /// Validate the configuration for consistency
    pub fn validate(&self) -> DroplineResult<()> {
        if self.connection.connect_timeout.is_zero() {
            return Err(DroplineError::config_error("Connect timeout cannot be zero"));
        }
        if self.connection.audit_trail_capacity == 0 {
            return Err(DroplineError::config_error(
                "Audit trail capacity cannot be zero",
            ));
        }
        if self.reconnect.base_delay.is_zero() {
            return Err(DroplineError::config_error(
                "Reconnect base delay cannot be zero",
            ));
        }
        if self.reconnect.base_delay > self.reconnect.max_delay {
            return Err(DroplineError::config_error(
                "Reconnect base delay cannot exceed the maximum delay",
            ));
        }
        if self.channels.command_buffer_size == 0 {
            return Err(DroplineError::config_error(
                "Command buffer size cannot be zero",
            ));
        }
        if self.channels.event_buffer_size == 0 {
            return Err(DroplineError::config_error("Event buffer size cannot be zero"));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> DroplineResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json_string(&self) -> DroplineResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load and validate a JSON configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> DroplineResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn into_shared(self) -> SharedDroplineConfig {
        Arc::new(self)
    }
}

/// Arc-wrapped configuration for sharing between the handle and tasks
pub type SharedDroplineConfig = Arc<DroplineConfig>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
