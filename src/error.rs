//! Error taxonomy for the bridge
//!
//! Every failure the bridge can hit falls into one of five classes, and the
//! class decides who pays for it:
//!
//! - [`BridgeError::ProtocolViolation`]: the guest connection that caused it is
//!   disconnected, the bridge keeps running.
//! - [`BridgeError::AllocationFatal`]: a buffer or channel allocation failed
//!   after a driver was selected. There is no fallback, the process exits.
//! - [`BridgeError::TransferIo`]: a selection transfer descriptor failed. Only
//!   that transfer is aborted.
//! - [`BridgeError::XConnectionLost`]: the window manager connection is gone,
//!   the process exits.
//! - [`BridgeError::MalformedHint`]: an X property had the wrong size. Callers
//!   treat the hint as absent.

use std::io;
use thiserror::Error;

/// Exit status used when the process dies on an allocation failure.
pub const ALLOCATION_EXIT_CODE: i32 = 1;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("protocol violation on {object}: {message}")]
    ProtocolViolation { object: String, message: String },

    #[error("{driver} allocation failed: {source}")]
    AllocationFatal {
        driver: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("selection transfer failed: {0}")]
    TransferIo(#[from] io::Error),

    #[error("lost connection to the X server: {0}")]
    XConnectionLost(String),

    #[error("malformed {property} property ({len} bytes)")]
    MalformedHint { property: &'static str, len: usize },
}

impl BridgeError {
    pub fn protocol(object: impl Into<String>, message: impl Into<String>) -> Self {
        BridgeError::ProtocolViolation {
            object: object.into(),
            message: message.into(),
        }
    }

    pub fn allocation(driver: &'static str, source: io::Error) -> Self {
        BridgeError::AllocationFatal { driver, source }
    }

    /// Whether this error must take the whole process down.
    pub fn is_fatal_to_process(&self) -> bool {
        matches!(
            self,
            BridgeError::AllocationFatal { .. } | BridgeError::XConnectionLost(_)
        )
    }

    /// Exit status to use when [`is_fatal_to_process`](Self::is_fatal_to_process) holds.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            BridgeError::AllocationFatal { .. } => Some(ALLOCATION_EXIT_CODE),
            BridgeError::XConnectionLost(_) => Some(1),
            _ => None,
        }
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality_classes() {
        let violation = BridgeError::protocol("wl_registry@2", "unknown global 7");
        assert!(!violation.is_fatal_to_process());
        assert_eq!(violation.exit_code(), None);

        let alloc = BridgeError::allocation("virtwl-dmabuf", io::Error::from_raw_os_error(12));
        assert!(alloc.is_fatal_to_process());
        assert_eq!(alloc.exit_code(), Some(ALLOCATION_EXIT_CODE));

        let transfer: BridgeError = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(!transfer.is_fatal_to_process());

        let hint = BridgeError::MalformedHint {
            property: "WM_NORMAL_HINTS",
            len: 12,
        };
        assert!(!hint.is_fatal_to_process());
        assert!(hint.to_string().contains("WM_NORMAL_HINTS"));
    }

    #[test]
    fn test_x_connection_loss_is_fatal() {
        let err = BridgeError::XConnectionLost("connection reset".into());
        assert!(err.is_fatal_to_process());
        assert_eq!(err.exit_code(), Some(1));
    }
}
