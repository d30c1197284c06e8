use thiserror::Error;

/// Errors that can occur when working with a WalkingPad
#[derive(Error, Debug)]
pub enum WalkingPadError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is available to scan with
    #[error("No bluetooth scanner detected")]
    NoAdapter,

    /// Device not found during scanning
    #[error("Could not find WalkingPad with address {address}")]
    DeviceNotFound {
        /// Address that was searched for
        address: String,
    },

    /// Establishing or tearing down the transport session failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// A device command was rejected or failed in flight
    #[error("Command {command} failed: {reason}")]
    Command {
        /// Command that failed
        command: &'static str,
        /// Failure reported by the transport
        reason: String,
    },

    /// Generic failure reported by the transport collaborator
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed Bluetooth address
    #[error("Invalid device address: {0}")]
    InvalidAddress(String),

    /// Invalid command parameters
    #[error("Invalid command parameters: {0}")]
    InvalidParameters(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type for WalkingPad operations
pub type Result<T> = std::result::Result<T, WalkingPadError>;

impl WalkingPadError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::NoAdapter
                | Self::ConnectionFailed(_)
                | Self::DeviceNotFound { .. }
        )
    }

    /// Check if this error is recoverable by retrying on the next poll
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::Command { .. } | Self::Transport(_)
        )
    }

    /// Wrap a transport failure as a failure of the named command.
    ///
    /// Connection failures keep their own variant.
    #[must_use]
    pub fn for_command(self, command: &'static str) -> Self {
        match self {
            e @ Self::ConnectionFailed(_) => e,
            Self::Command { reason, .. } => Self::Command { command, reason },
            other => Self::Command {
                command,
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = WalkingPadError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(connection_error.is_recoverable());

        let not_found = WalkingPadError::DeviceNotFound {
            address: "aa:bb:cc:dd:ee:ff".to_string(),
        };
        assert!(not_found.is_connection_error());
        assert!(!not_found.is_recoverable());

        let invalid = WalkingPadError::InvalidParameters("speed".to_string());
        assert!(!invalid.is_connection_error());
        assert!(!invalid.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = WalkingPadError::Command {
            command: "start_belt",
            reason: "gatt write failed".to_string(),
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("start_belt"));
        assert!(error_string.contains("gatt write failed"));

        let not_found = WalkingPadError::DeviceNotFound {
            address: "aa:bb:cc:dd:ee:ff".to_string(),
        };
        assert!(not_found.to_string().contains("aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn test_for_command_keeps_connection_failures() {
        let wrapped = WalkingPadError::Transport("timeout".to_string()).for_command("ask_stats");
        assert!(matches!(
            wrapped,
            WalkingPadError::Command { command: "ask_stats", ref reason } if reason.contains("timeout")
        ));

        let kept = WalkingPadError::ConnectionFailed("link lost".to_string()).for_command("ask_stats");
        assert!(matches!(kept, WalkingPadError::ConnectionFailed(_)));
    }
}
