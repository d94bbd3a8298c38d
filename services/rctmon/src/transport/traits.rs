//! Transport trait and error types

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::protocol::{DecodeError, Frame};

/// Transport layer error types
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Connection could not be established
    #[error("Connection to {endpoint} failed: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// Established connection broke (EOF or socket error)
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Request issued without a connection
    #[error("Not connected")]
    NotConnected,

    /// No usable response in time
    #[error("No response for 0x{oid:08X} within {after:?}")]
    Timeout { oid: u32, after: Duration },

    /// Only malformed frames arrived for the outstanding request
    #[error("Decode error: {0}")]
    Decode(DecodeError),
}

impl TransportError {
    /// Errors after which the connection is unusable
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionFailed { .. }
                | TransportError::ConnectionLost(_)
                | TransportError::NotConnected
        )
    }
}

impl From<TransportError> for errors::RctmonError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::ConnectionFailed { endpoint, reason } => {
                errors::RctmonError::ConnectionFailed { endpoint, reason }
            },
            TransportError::Timeout { .. } => errors::RctmonError::Timeout(err.to_string()),
            TransportError::Decode(e) => errors::RctmonError::Protocol {
                protocol: "rct".to_string(),
                message: e.to_string(),
            },
            other => errors::RctmonError::Communication(other.to_string()),
        }
    }
}

/// Half-duplex request/response link to one device
///
/// At most one request is outstanding: `request` writes one read frame and
/// returns only once the matching response, a timeout or an error is in.
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// `host:port` or another human readable endpoint description
    fn endpoint(&self) -> String;

    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Read `oid`, waiting at most `timeout` for the answer
    async fn request(&mut self, oid: u32, timeout: Duration) -> Result<Frame, TransportError>;

    /// Drop the connection; safe to call when already closed
    async fn close(&mut self);

    fn is_connected(&self) -> bool;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    fn endpoint(&self) -> String {
        self.as_ref().endpoint()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        self.as_mut().connect().await
    }

    async fn request(&mut self, oid: u32, timeout: Duration) -> Result<Frame, TransportError> {
        self.as_mut().request(oid, timeout).await
    }

    async fn close(&mut self) {
        self.as_mut().close().await
    }

    fn is_connected(&self) -> bool {
        self.as_ref().is_connected()
    }
}
