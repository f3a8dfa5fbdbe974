//! Error handling for the RoundLink protocol
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! is [`ProtocolError`]. Errors convert automatically from the underlying I/O,
//! JSON and OpenSSL errors through `thiserror`.
//!
//! ## Error Categories
//!
//! [`ProtocolError::category`] sorts an error into one of the buckets that
//! decide how the connection layer reacts to it:
//!
//! - [`ErrorCategory::Format`]: a malformed frame. The frame is dropped and the
//!   link keeps running.
//! - [`ErrorCategory::Transport`]: socket reset, timeout or TLS failure. The
//!   link is closed and the device becomes unreachable. Nothing is retried
//!   inside the link.
//! - [`ErrorCategory::TrustViolation`]: the peer presented a certificate that
//!   differs from the pinned one. The link is closed and the device drops back
//!   to `NotPaired`.
//! - [`ErrorCategory::Handshake`]: the peer speaks an incompatible protocol or
//!   announced an inconsistent identity.
//! - [`ErrorCategory::Local`]: misuse of the local API (unknown device, wrong
//!   pairing state, plugin failure, configuration).
//!
//! ```rust
//! use roundlink_protocol::{ErrorCategory, ProtocolError};
//!
//! let error = ProtocolError::InvalidPacket("missing type field".to_string());
//! assert_eq!(error.category(), ErrorCategory::Format);
//! ```

use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// How the connection layer reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed frame; drop it and keep the connection
    Format,
    /// Connection-level failure; close the link
    Transport,
    /// Certificate does not match the pinned identity
    TrustViolation,
    /// Incompatible or inconsistent peer during the handshake
    Handshake,
    /// Local API misuse or local failure
    Local,
}

/// Everything that can go wrong in the connection layer
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Socket or file system failure without a more specific mapping
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame or store contents are not valid JSON for the expected shape
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS error raised while establishing or using a secure stream
    #[error("TLS error: {0}")]
    Tls(#[from] openssl::ssl::Error),

    /// Certificate generation or parsing error
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// Certificate could not be validated or stored
    #[error("Certificate validation error: {0}")]
    CertificateValidation(String),

    /// The peer presented a certificate that differs from the pinned one
    ///
    /// This is never retried. The device loses its pairing and the user is
    /// expected to re-pair after checking what happened.
    #[error("Trust violation for device {device_id}: expected {expected}, presented {presented}")]
    TrustViolation {
        /// Device whose pin was violated
        device_id: String,
        /// Fingerprint of the pinned certificate
        expected: String,
        /// Fingerprint of the certificate presented this session
        presented: String,
    },

    /// The peer failed the identity handshake
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Peer speaks a protocol version outside the supported range
    #[error("Protocol version mismatch: {0}")]
    ProtocolVersionMismatch(String),

    /// No device with this id is known to the registry
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device is not paired
    #[error("Not paired")]
    NotPaired,

    /// Device has no authenticated link
    #[error("Device not connected: {0}")]
    NotConnected(String),

    /// Pairing operation is not valid in the current pairing state
    #[error("Invalid pairing state: {0}")]
    InvalidPairingState(String),

    /// Frame is JSON but not a usable packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// A plugin failed to start or handle a packet
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Connection dropped mid-stream
    #[error("Network error: {0}")]
    NetworkError(String),

    /// A connect, handshake or transfer step ran out of time
    #[error("Connection timeout: {0}")]
    Timeout(String),

    /// Nothing listens on the peer port
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// No route to the peer
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Unusable configuration or persisted state
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Resource exhausted (no free port, disk full, ...)
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The OS refused access to a file or port
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A transfer or device call was cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Frame longer than the configured limit
    ///
    /// Oversized frames are discarded without closing the link.
    #[error("Packet size exceeded: {0} bytes (max: {1})")]
    PacketSizeExceeded(usize, usize),
}

impl ProtocolError {
    /// Map an I/O error onto the variant that matches its kind
    ///
    /// `context` names the step that failed and is prefixed to the message.
    ///
    /// ```rust
    /// use roundlink_protocol::ProtocolError;
    /// use std::io::{Error, ErrorKind};
    ///
    /// let error = ProtocolError::from_io_error(
    ///     Error::new(ErrorKind::TimedOut, "no answer"),
    ///     "dialing peer",
    /// );
    ///
    /// assert!(matches!(error, ProtocolError::Timeout(_)));
    /// ```
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{}: {}", context, error)),
            ErrorKind::ConnectionRefused => {
                ProtocolError::ConnectionRefused(format!("{}: {}", context, error))
            }
            ErrorKind::NetworkUnreachable => {
                ProtocolError::NetworkUnreachable(format!("{}: {}", context, error))
            }
            ErrorKind::PermissionDenied => {
                ProtocolError::PermissionDenied(format!("{}: {}", context, error))
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::NetworkError(format!(
                "{}: connection interrupted ({})",
                context, error
            )),
            _ => ProtocolError::Io(error),
        }
    }

    /// Sort the error into the bucket that decides how a link reacts to it
    pub fn category(&self) -> ErrorCategory {
        match self {
            ProtocolError::Json(_)
            | ProtocolError::InvalidPacket(_)
            | ProtocolError::PacketSizeExceeded(_, _) => ErrorCategory::Format,
            ProtocolError::Io(_)
            | ProtocolError::Tls(_)
            | ProtocolError::NetworkError(_)
            | ProtocolError::Timeout(_)
            | ProtocolError::ConnectionRefused(_)
            | ProtocolError::NetworkUnreachable(_) => ErrorCategory::Transport,
            ProtocolError::TrustViolation { .. } => ErrorCategory::TrustViolation,
            ProtocolError::Handshake(_)
            | ProtocolError::ProtocolVersionMismatch(_)
            | ProtocolError::CertificateValidation(_) => ErrorCategory::Handshake,
            ProtocolError::Certificate(_)
            | ProtocolError::DeviceNotFound(_)
            | ProtocolError::NotPaired
            | ProtocolError::NotConnected(_)
            | ProtocolError::InvalidPairingState(_)
            | ProtocolError::Plugin(_)
            | ProtocolError::Configuration(_)
            | ProtocolError::ResourceExhausted(_)
            | ProtocolError::PermissionDenied(_)
            | ProtocolError::Cancelled(_) => ErrorCategory::Local,
        }
    }

    /// Whether the failure is transient, e.g. worth another connection attempt
    /// after the next discovery announcement
    ///
    /// ```rust
    /// use roundlink_protocol::ProtocolError;
    ///
    /// assert!(ProtocolError::Timeout("handshake".to_string()).is_recoverable());
    /// assert!(!ProtocolError::NotPaired.is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Timeout(_)
                | ProtocolError::NetworkError(_)
                | ProtocolError::NetworkUnreachable(_)
                | ProtocolError::ConnectionRefused(_)
                | ProtocolError::NotConnected(_)
                | ProtocolError::Io(_)
        )
    }

    /// Whether only the user can resolve the failure
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::NotPaired
                | ProtocolError::TrustViolation { .. }
                | ProtocolError::Certificate(_)
                | ProtocolError::CertificateValidation(_)
                | ProtocolError::PermissionDenied(_)
                | ProtocolError::Configuration(_)
                | ProtocolError::ProtocolVersionMismatch(_)
        )
    }

    /// Message meant for people rather than logs
    ///
    /// ```rust
    /// use roundlink_protocol::ProtocolError;
    ///
    /// assert_eq!(
    ///     ProtocolError::NotPaired.user_message(),
    ///     "This device is not paired yet. Pair it first."
    /// );
    /// ```
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::NotPaired => {
                "This device is not paired yet. Pair it first.".to_string()
            }
            ProtocolError::NotConnected(id) => {
                format!("Device '{}' is not reachable right now.", id)
            }
            ProtocolError::DeviceNotFound(id) => {
                format!("No device with id '{}' is known.", id)
            }
            ProtocolError::TrustViolation { device_id, .. } => format!(
                "Device '{}' presented an unexpected certificate. Pairing was revoked; \
                 verify the device before pairing again.",
                device_id
            ),
            ProtocolError::Handshake(msg) => {
                format!("Could not establish a session: {}.", msg)
            }
            ProtocolError::InvalidPairingState(msg) => {
                format!("Pairing not possible: {}.", msg)
            }
            ProtocolError::Timeout(msg) => {
                format!("Timed out while {}.", msg)
            }
            ProtocolError::ConnectionRefused(_) => {
                "The other device refused the connection. Is its application running?".to_string()
            }
            ProtocolError::NetworkUnreachable(_) => {
                "The other device cannot be reached. Both devices must share a network.".to_string()
            }
            ProtocolError::NetworkError(msg) => {
                format!("The connection dropped: {}.", msg)
            }
            ProtocolError::PermissionDenied(msg) => {
                format!("Access was denied: {}.", msg)
            }
            ProtocolError::ResourceExhausted(msg) => {
                format!("Out of resources: {}.", msg)
            }
            ProtocolError::Configuration(msg) => {
                format!("The configuration is not usable: {}.", msg)
            }
            ProtocolError::ProtocolVersionMismatch(msg) => {
                format!("The other device speaks an unsupported protocol version ({}).", msg)
            }
            ProtocolError::CertificateValidation(msg) => {
                format!("The other device's certificate was not accepted: {}.", msg)
            }
            ProtocolError::PacketSizeExceeded(size, max) => {
                format!("Packet too large ({} bytes, max {} bytes).", size, max)
            }
            ProtocolError::InvalidPacket(msg) => format!("Invalid data received: {}.", msg),
            ProtocolError::Plugin(msg) => format!("Plugin error: {}.", msg),
            ProtocolError::Cancelled(msg) => format!("Operation cancelled: {}.", msg),
            ProtocolError::Io(e) => format!("I/O error: {}.", e),
            ProtocolError::Json(e) => format!("Data format error: {}.", e),
            ProtocolError::Tls(e) => format!("Secure connection error: {}.", e),
            ProtocolError::Certificate(e) => {
                format!("The local certificate could not be used: {}.", e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            ProtocolError::DeviceNotFound("phone_1".to_string()).to_string(),
            "Device not found: phone_1"
        );
        assert_eq!(ProtocolError::NotPaired.to_string(), "Not paired");
        assert_eq!(
            ProtocolError::InvalidPacket("no type".to_string()).to_string(),
            "Invalid packet: no type"
        );

        let error = ProtocolError::TrustViolation {
            device_id: "abc".to_string(),
            expected: "AA".to_string(),
            presented: "BB".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Trust violation for device abc: expected AA, presented BB"
        );
    }

    #[test]
    fn test_unmapped_io_error_stays_io() {
        use std::io::{Error, ErrorKind};

        let error = ProtocolError::from_io_error(
            Error::new(ErrorKind::NotFound, "no such store"),
            "opening store",
        );
        assert!(matches!(error, ProtocolError::Io(_)));
        assert!(error.to_string().contains("no such store"));
    }

    #[test]
    fn test_from_io_error_reset_is_transport() {
        use std::io::{Error, ErrorKind};

        let error = ProtocolError::from_io_error(
            Error::new(ErrorKind::ConnectionReset, "reset by peer"),
            "reading frame",
        );
        assert!(matches!(error, ProtocolError::NetworkError(_)));
        assert_eq!(error.category(), ErrorCategory::Transport);
    }

    #[test]
    fn test_json_error_is_format() {
        let error: ProtocolError = serde_json::from_str::<serde_json::Value>("{\"id\": ")
            .unwrap_err()
            .into();

        assert!(matches!(error, ProtocolError::Json(_)));
        assert_eq!(error.category(), ErrorCategory::Format);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            ProtocolError::PacketSizeExceeded(20, 10).category(),
            ErrorCategory::Format
        );
        assert_eq!(
            ProtocolError::Handshake("identity mismatch".to_string()).category(),
            ErrorCategory::Handshake
        );
        assert_eq!(
            ProtocolError::ProtocolVersionMismatch("5 < 7".to_string()).category(),
            ErrorCategory::Handshake
        );
        assert_eq!(
            ProtocolError::NotConnected("dev".to_string()).category(),
            ErrorCategory::Local
        );
    }

    #[test]
    fn test_trust_violation_requires_user_action() {
        let error = ProtocolError::TrustViolation {
            device_id: "abc".to_string(),
            expected: "AA".to_string(),
            presented: "BB".to_string(),
        };
        assert!(error.requires_user_action());
        assert!(!error.is_recoverable());
        assert!(error.user_message().contains("abc"));
    }
}
