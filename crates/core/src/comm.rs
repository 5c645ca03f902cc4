//! Device communication layer with error classification and write retries.
//!
//! Only single outbound writes are retried. A correlated wait is never
//! re-issued automatically, since a late answer to the first attempt would be
//! indistinguishable from the answer to the second.

use crate::error::{Error, Result};
use crate::transport::{write_report, Transport};
use std::time::Duration;
use tracing::{debug, warn};

/// Maximum retry attempts for transient errors.
pub const MAX_RETRIES: u32 = 3;

/// Pause between write attempts.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// How a failed exchange should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed if the same write is issued again.
    Transient,
    /// The device is gone; the connector tears the handle down.
    Disconnected,
    /// The request itself was refused or could not be encoded.
    Protocol,
    /// The device answered with bytes we could not decode.
    InvalidResponse,
}

impl ErrorClass {
    pub fn classify(err: &Error) -> Self {
        match err {
            Error::Timeout { .. } => Self::Transient,
            Error::DeviceNotFound(_)
            | Error::DeviceDisconnected(_)
            | Error::TransportNotOpen(_) => Self::Disconnected,
            Error::UnsupportedDevice { .. } | Error::OutOfRange { .. } => Self::Protocol,
            Error::MalformedResponse(_) => Self::InvalidResponse,
            Error::Hid(msg) | Error::WriteFailed(msg) => {
                let lower = msg.to_lowercase();
                if lower.contains("disconnect")
                    || lower.contains("not found")
                    || lower.contains("no such device")
                {
                    Self::Disconnected
                } else if lower.contains("timeout")
                    || lower.contains("timed out")
                    || lower.contains("busy")
                    || lower.contains("temporarily unavailable")
                {
                    Self::Transient
                } else {
                    Self::Protocol
                }
            }
        }
    }

    /// Only transient failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Write a report, retrying transient failures.
///
/// Returns the last error after exhausting retries.
pub async fn write_with_retry(
    transport: &dyn Transport,
    report_id: u8,
    data: &[u8],
    max_retries: u32,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        match write_report(transport, report_id, data).await {
            Ok(()) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "Write succeeded after retry");
                }
                return Ok(());
            }
            Err(e) => {
                let class = ErrorClass::classify(&e);
                if !class.is_retryable() || attempt == max_retries {
                    warn!(
                        transport = transport.id(),
                        ?class,
                        attempts = attempt + 1,
                        error = %e,
                        "Write failed"
                    );
                    return Err(e);
                }
                debug!(
                    transport = transport.id(),
                    attempt = attempt + 1,
                    error = %e,
                    "Transient write error, retrying"
                );
                attempt += 1;
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn classify_timeout_as_transient() {
        let err = Error::Timeout {
            operation: "filter count",
            waited_ms: 5000,
        };
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Transient);
        assert!(ErrorClass::classify(&err).is_retryable());
    }

    #[test]
    fn classify_disconnect() {
        let err = Error::DeviceDisconnected("hid-0".into());
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Disconnected);
        let err = Error::TransportNotOpen("hid-0".into());
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Disconnected);
        assert!(!ErrorClass::classify(&err).is_retryable());
    }

    #[test]
    fn classify_write_failure_messages() {
        let err = Error::WriteFailed("device busy".into());
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Transient);
        let err = Error::Hid("No such device".into());
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Disconnected);
        let err = Error::WriteFailed("pipe error".into());
        assert_eq!(ErrorClass::classify(&err), ErrorClass::Protocol);
    }

    #[test]
    fn classify_malformed_response() {
        let err = Error::MalformedResponse("bad header".into());
        assert_eq!(ErrorClass::classify(&err), ErrorClass::InvalidResponse);
    }

    #[tokio::test]
    async fn write_with_retry_succeeds_immediately() {
        let mock = MockTransport::new("hid-0");
        mock.open().await.unwrap();
        write_with_retry(&mock, 0x07, &[0x01], MAX_RETRIES)
            .await
            .unwrap();
        assert_eq!(mock.sent_count(), 1);
    }

    #[tokio::test]
    async fn write_with_retry_fails_non_retryable() {
        let mock = MockTransport::new("hid-0");
        mock.open().await.unwrap();
        mock.set_fail_writes(true);
        let result = write_with_retry(&mock, 0x07, &[0x01], MAX_RETRIES).await;
        assert!(matches!(result, Err(Error::WriteFailed(_))));
    }

    #[tokio::test]
    async fn write_with_retry_stops_on_closed_transport() {
        let mock = MockTransport::new("hid-0");
        let result = write_with_retry(&mock, 0x07, &[0x01], MAX_RETRIES).await;
        assert!(matches!(result, Err(Error::TransportNotOpen(_))));
    }
}
