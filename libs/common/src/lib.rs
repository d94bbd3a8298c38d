//! rctmon basic library
//!
//! Shared by the service crate and its binary:
//! - logging bootstrap
//! - shutdown signal handling
//! - hex helpers for wire dumps

pub mod hex;
pub mod logging;
pub mod shutdown;

pub use logging::{init_with_config, LogConfig, FRAME_TARGET};
pub use shutdown::{cancel_on_shutdown, wait_for_shutdown, ShutdownSignal};

// Re-export common dependencies
pub use tokio;
pub use tokio_util::sync::CancellationToken;
