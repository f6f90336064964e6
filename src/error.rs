//! Error types and handling for the convoy crate

use thiserror::Error;

/// Result type alias for convoy operations
pub type Result<T> = std::result::Result<T, ConvoyError>;

/// Main error type for the convoy crate
#[derive(Error, Debug)]
pub enum ConvoyError {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message describing the configuration issue
        message: String,
    },

    /// A consumer description could not be resolved against the game key
    /// table (missing key, no `last_` fallback, type mismatch). Fatal at
    /// registration time.
    #[error("Spec error: {message}")]
    Spec {
        /// Error message describing the resolution failure
        message: String,
    },

    /// A runtime contract between consumer and collector was broken
    /// (reply wider than the dispatched batch, missing reply key, stepping a
    /// slot that is not in flight). Treated as a bug in the caller.
    #[error("Contract violation: {message}")]
    Contract {
        /// Error message describing the violated contract
        message: String,
    },

    /// A per-simulator history ring rejected a push because it is full
    #[error("History ring is full")]
    HistoryFull,

    /// A requested history window reaches past the buffered events
    #[error("History window out of range: start {start} + len {len} > {available} buffered")]
    OutOfRange {
        /// Requested window start offset
        start: usize,
        /// Requested window length
        len: usize,
        /// Events currently buffered
        available: usize,
    },

    /// The shared done flag tripped while an operation was blocked
    #[error("Context is stopping")]
    Stopped,

    /// A bounded wait expired
    #[error("Operation timed out")]
    Timeout,

    /// Memory allocation errors
    #[error("Memory allocation error: {message}")]
    Memory {
        /// Error message describing the memory issue
        message: String,
    },

    /// CPU affinity errors
    #[error("CPU affinity error: {0}")]
    CpuAffinity(#[from] nix::Error),

    /// A simulator failed to produce or apply a key
    #[error("Simulator error: {message}")]
    Simulator {
        /// Error message describing the simulator failure
        message: String,
    },
}

impl ConvoyError {
    /// Create a new configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a new spec resolution error
    pub fn spec(message: impl Into<String>) -> Self {
        Self::Spec {
            message: message.into(),
        }
    }

    /// Create a new contract violation error
    pub fn contract(message: impl Into<String>) -> Self {
        Self::Contract {
            message: message.into(),
        }
    }

    /// Create a new memory allocation error
    pub fn memory(message: impl Into<String>) -> Self {
        Self::Memory {
            message: message.into(),
        }
    }

    /// Create a new simulator error
    pub fn simulator(message: impl Into<String>) -> Self {
        Self::Simulator {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable by retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout | Self::HistoryFull)
    }

    /// Check if this error signals cooperative shutdown
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Check if this error indicates a bug that should abort the run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Spec { .. } | Self::Contract { .. } | Self::InvalidConfig { .. })
    }
}

/// Convenience macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::error::ConvoyError::config(format!($($arg)*))
    };
}

/// Convenience macro for creating spec resolution errors
#[macro_export]
macro_rules! spec_error {
    ($($arg:tt)*) => {
        $crate::error::ConvoyError::spec(format!($($arg)*))
    };
}

/// Convenience macro for creating contract violation errors
#[macro_export]
macro_rules! contract_error {
    ($($arg:tt)*) => {
        $crate::error::ConvoyError::contract(format!($($arg)*))
    };
}
