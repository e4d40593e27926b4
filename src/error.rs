//! # Error Handling
//!
//! Error types for the Z-Mesh protocol engine.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Framing Errors (100-199)                                          │
//! │  │   ├── MalformedFrame   - unparseable inbound frame                  │
//! │  │   ├── OversizeFrame    - outbound frame exceeds the payload budget  │
//! │  │   ├── BadBase64        - chunk payload failed base64 decode         │
//! │  │   └── BadUtf8          - frame bytes were not valid UTF-8           │
//! │  │                                                                      │
//! │  ├── Session/Protocol Errors (200-299)                                 │
//! │  │   ├── PeerBusy         - start requested with a session already live│
//! │  │   ├── NoResponse       - BEGIN unanswered after retries             │
//! │  │   ├── ChunkExhausted   - a chunk exceeded MAX_RETRIES               │
//! │  │   ├── IdleTimeout      - receiver saw no activity in time           │
//! │  │   └── ProtocolError    - semantically invalid frame                 │
//! │  │                                                                      │
//! │  ├── Mesh Device Errors (300-399)                                      │
//! │  │   ├── DeviceTransient  - device busy / radio not ready              │
//! │  │   └── DeviceFatal      - device disconnected                       │
//! │  │                                                                      │
//! │  ├── External Collaborator Errors (400-499)                           │
//! │  │   ├── SinkError        - file sink could not persist                │
//! │  │   └── SourceError      - file source could not be read              │
//! │  │                                                                      │
//! │  └── Engine Lifecycle Errors (900-999)                                 │
//! │      ├── AlreadyInitialized - initialize() called twice               │
//! │      └── NotInitialized     - used before initialize()                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

/// Result type alias for Z-Mesh operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the Z-Mesh protocol engine.
///
/// Errors are grouped by the numeric code band their `code()` falls into,
/// mirroring the taxonomy in SPEC_FULL.md §7.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // ========================================================================
    // Framing Errors (100-199)
    // ========================================================================

    /// An inbound frame could not be parsed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// An outbound frame would exceed the mesh payload budget.
    #[error("frame of {actual} bytes exceeds the {limit}-byte budget")]
    OversizeFrame {
        /// Encoded size of the frame that was rejected.
        actual: usize,
        /// The configured budget it was checked against.
        limit: usize,
    },

    /// A base64-encoded chunk payload failed to decode.
    #[error("invalid base64 chunk payload: {0}")]
    BadBase64(String),

    /// Frame bytes were not valid UTF-8.
    #[error("frame bytes are not valid UTF-8: {0}")]
    BadUtf8(String),

    // ========================================================================
    // Session / Protocol Errors (200-299)
    // ========================================================================

    /// A transfer was requested to a peer that already has one in flight.
    #[error("a transfer session with this peer is already active")]
    PeerBusy,

    /// BEGIN went unanswered after all retries.
    #[error("no response to BEGIN after retries")]
    NoResponse,

    /// A single chunk exceeded its retry budget.
    #[error("chunk {0} exhausted its retry budget")]
    ChunkExhausted(u16),

    /// The receiver observed no activity within the idle window.
    #[error("receiver idle timeout")]
    IdleTimeout,

    /// A frame was semantically invalid (bad index, bad transfer id, oversize payload).
    #[error("protocol error: {0}")]
    ProtocolError(String),

    // ========================================================================
    // Mesh Device Errors (300-399)
    // ========================================================================

    /// The Mesh Port reported a transient failure (device busy, radio not ready).
    #[error("mesh device transient error: {0}")]
    DeviceTransient(String),

    /// The Mesh Port reported a fatal failure (device disconnected).
    #[error("mesh device fatal error: {0}")]
    DeviceFatal(String),

    // ========================================================================
    // External Collaborator Errors (400-499)
    // ========================================================================

    /// The file sink could not persist the reassembled bytes.
    #[error("file sink error: {0}")]
    SinkError(String),

    /// The file source could not be read.
    #[error("file source error: {0}")]
    SourceError(String),

    // ========================================================================
    // Configuration Errors (800-899)
    // ========================================================================

    /// A configuration value was out of its allowed range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ========================================================================
    // Engine Lifecycle Errors (900-999)
    // ========================================================================

    /// `Engine::initialize` was called a second time.
    #[error("engine already initialized")]
    AlreadyInitialized,

    /// The engine was used before `Engine::initialize` was called.
    #[error("engine not initialized")]
    NotInitialized,
}

impl Error {
    /// Get the numeric error code.
    ///
    /// Codes are organized by category:
    /// - 100-199: framing
    /// - 200-299: session/protocol
    /// - 300-399: mesh device
    /// - 400-499: external collaborators
    /// - 800-899: configuration
    pub fn code(&self) -> u32 {
        match self {
            Error::MalformedFrame(_) => 100,
            Error::OversizeFrame { .. } => 101,
            Error::BadBase64(_) => 102,
            Error::BadUtf8(_) => 103,

            Error::PeerBusy => 200,
            Error::NoResponse => 201,
            Error::ChunkExhausted(_) => 202,
            Error::IdleTimeout => 203,
            Error::ProtocolError(_) => 204,

            Error::DeviceTransient(_) => 300,
            Error::DeviceFatal(_) => 301,

            Error::SinkError(_) => 400,
            Error::SourceError(_) => 401,

            Error::InvalidConfig(_) => 800,

            Error::AlreadyInitialized => 900,
            Error::NotInitialized => 901,
        }
    }

    /// Whether a session can reasonably retry after this error rather than
    /// terminating outright.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::DeviceTransient(_) | Error::MalformedFrame(_) | Error::BadBase64(_)
        )
    }
}

impl From<base64::DecodeError> for Error {
    fn from(err: base64::DecodeError) -> Self {
        Error::BadBase64(err.to_string())
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::BadUtf8(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::MalformedFrame("x".into()).code(), 100);
        assert_eq!(Error::OversizeFrame { actual: 300, limit: 200 }.code(), 101);
        assert_eq!(Error::PeerBusy.code(), 200);
        assert_eq!(Error::ChunkExhausted(2).code(), 202);
        assert_eq!(Error::DeviceTransient("busy".into()).code(), 300);
        assert_eq!(Error::SinkError("disk full".into()).code(), 400);
        assert_eq!(Error::InvalidConfig("bad".into()).code(), 800);
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(Error::DeviceTransient("busy".into()).is_recoverable());
        assert!(!Error::DeviceFatal("gone".into()).is_recoverable());
        assert!(!Error::ChunkExhausted(0).is_recoverable());
    }

    #[test]
    fn test_base64_conversion() {
        let decode_err = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            "not valid base64!!",
        )
        .unwrap_err();
        let err: Error = decode_err.into();
        assert_eq!(err.code(), 102);
    }
}
