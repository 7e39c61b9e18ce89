//! Error types for desync-core
//!
//! Centralized error handling using `thiserror`. Packet-path errors
//! (`PacketParse`, `PacketTooSmall`, `StrategyPrecondition`) never reach the
//! network peer: the caller fails open and passes the original packet through.

use thiserror::Error;

/// Main error type for desync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Packet parsing failed
    #[error("Packet parsing error: {message}")]
    PacketParse {
        /// Detailed error message
        message: String,
        /// Offset in packet where error occurred
        offset: Option<usize>,
    },

    /// Packet is too small to process
    #[error("Packet too small: expected at least {expected} bytes, got {actual}")]
    PacketTooSmall {
        /// Minimum expected size
        expected: usize,
        /// Actual packet size
        actual: usize,
    },

    /// A strategy could not be applied to this packet
    #[error("Strategy '{strategy}' precondition failed: {message}")]
    StrategyPrecondition {
        /// Name of the strategy that refused the packet
        strategy: &'static str,
        /// Error message
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        /// Path to the missing config file
        path: String,
    },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    ConfigValue {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },

    /// QUIC Initial protection could not be removed
    #[error("QUIC decryption failed: {0}")]
    QuicDecrypt(&'static str),

    /// Flow table or reassembly bound exceeded
    #[error("Reassembly limit exceeded: {0}")]
    ReassemblyLimit(String),

    /// I/O error wrapper
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// Hex decoding error
    #[error("Hex decoding error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a packet parse error
    pub fn packet_parse(message: impl Into<String>) -> Self {
        Self::PacketParse {
            message: message.into(),
            offset: None,
        }
    }

    /// Create a packet parse error with offset
    pub fn packet_parse_at(message: impl Into<String>, offset: usize) -> Self {
        Self::PacketParse {
            message: message.into(),
            offset: Some(offset),
        }
    }

    /// Create a strategy precondition error
    pub fn precondition(strategy: &'static str, message: impl Into<String>) -> Self {
        Self::StrategyPrecondition {
            strategy,
            message: message.into(),
        }
    }

    /// Create a config value error
    pub fn config_value(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValue {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Whether this error belongs to the configuration family
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ConfigNotFound { .. }
                | Self::ConfigValue { .. }
                | Self::TomlParse(_)
                | Self::TomlSerialize(_)
                | Self::HexDecode(_)
        )
    }
}
