//! Transport layer
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │      Discovery Engine / Poll Scheduler        │
//! └───────────────────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌───────────────────────────────────────────────┐
//! │   Transport trait: connect(), request(), close│
//! └───────────────────────────────────────────────┘
//!           │                          │
//!           ▼                          ▼
//!    ┌─────────────┐           ┌───────────────┐
//!    │TcpTransport │           │ MockTransport │
//!    └─────────────┘           └───────────────┘
//! ```

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod reconnect;
pub mod tcp;
pub mod traits;

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockReply, MockTransport};
pub use reconnect::{ReconnectError, ReconnectHelper, ReconnectPolicy};
pub use tcp::{TcpTransport, TcpTransportConfig};
pub use traits::{Transport, TransportError};
