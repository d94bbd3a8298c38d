//! Mock transport for testing
//!
//! Answers every request from an in-memory object table, falling back to the
//! zero value of the identifier's catalog kind. One-shot replies can be queued
//! per identifier to inject timeouts, disconnects or malformed frames. Clones
//! share state, so a test keeps one handle while the code under test owns the
//! other.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::traits::{Transport, TransportError};
use crate::catalog;
use crate::protocol::{DecodeError, DecodeErrorKind, Frame, Value};

/// One scripted answer
#[derive(Debug, Clone)]
pub enum MockReply {
    Value(Value),
    /// Raw data part of the response, for payload errors
    Raw(Vec<u8>),
    Timeout,
    ConnectionLost,
    Decode(DecodeErrorKind),
    /// Never answer; the request only ends when its future is dropped
    Hang,
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    values: HashMap<u32, Value>,
    scripted: HashMap<u32, VecDeque<MockReply>>,
    requests: Vec<u32>,
    connects: u32,
    failing_connects: u32,
}

/// Mock transport implementation
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value returned for `oid` until changed
    pub fn set_value(&self, oid: u32, value: Value) {
        self.state.lock().values.insert(oid, value);
    }

    /// Queue a one-shot reply for `oid`, used before the standing value
    pub fn push_reply(&self, oid: u32, reply: MockReply) {
        self.state
            .lock()
            .scripted
            .entry(oid)
            .or_default()
            .push_back(reply);
    }

    /// Let the next `count` connection attempts fail
    pub fn fail_next_connects(&self, count: u32) {
        self.state.lock().failing_connects = count;
    }

    /// Drop the connection as if the device went away
    pub fn disconnect(&self) {
        self.state.lock().connected = false;
    }

    /// Identifiers requested so far, in order
    pub fn requests(&self) -> Vec<u32> {
        self.state.lock().requests.clone()
    }

    /// Successful connects so far
    pub fn connect_count(&self) -> u32 {
        self.state.lock().connects
    }

    fn answer(oid: u32, value: &Value) -> Result<Frame, TransportError> {
        let Some(info) = catalog::object(oid) else {
            return Err(TransportError::Timeout {
                oid,
                after: Duration::ZERO,
            });
        };
        let data = info.kind.encode(value).unwrap_or_default();
        Ok(Frame::response(oid, data))
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn endpoint(&self) -> String {
        "mock".to_string()
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(TransportError::ConnectionFailed {
                endpoint: "mock".to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        state.connected = true;
        state.connects += 1;
        debug!("Mock transport connected");
        Ok(())
    }

    async fn request(&mut self, oid: u32, timeout: Duration) -> Result<Frame, TransportError> {
        let reply = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            state.requests.push(oid);

            match state.scripted.get_mut(&oid).and_then(VecDeque::pop_front) {
                Some(reply) => reply,
                None => {
                    let value = match state.values.get(&oid) {
                        Some(value) => value.clone(),
                        None => match catalog::kind_of(oid) {
                            Some(kind) => kind.default_value(),
                            None => {
                                return Err(TransportError::Timeout {
                                    oid,
                                    after: timeout,
                                })
                            },
                        },
                    };
                    MockReply::Value(value)
                },
            }
        };

        match reply {
            MockReply::Value(value) => Self::answer(oid, &value),
            MockReply::Raw(data) => Ok(Frame::response(oid, data)),
            MockReply::Timeout => Err(TransportError::Timeout {
                oid,
                after: timeout,
            }),
            MockReply::ConnectionLost => {
                self.state.lock().connected = false;
                Err(TransportError::ConnectionLost("scripted disconnect".to_string()))
            },
            MockReply::Decode(kind) => Err(TransportError::Decode(DecodeError {
                kind,
                oid: Some(oid),
                message: "scripted decode error".to_string(),
            })),
            MockReply::Hang => {
                std::future::pending::<()>().await;
                Err(TransportError::NotConnected)
            },
        }
    }

    async fn close(&mut self) {
        self.state.lock().connected = false;
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}
