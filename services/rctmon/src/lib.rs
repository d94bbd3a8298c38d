//! rctmon - collector for RCT Power inverters
//!
//! ```text
//! TcpTransport ── PollScheduler ──┬── MetricStore ─┬─ /metrics (pull)
//!   (RctCodec)    (Discovery)     │                └─ MQTT (periodic push)
//!                                 └── PushQueue ──── InfluxDB (push)
//! ```

pub mod catalog;
pub mod config;
pub mod counters;
pub mod daemon;
pub mod discovery;
pub mod dispatcher;
pub mod protocol;
pub mod scheduler;
pub mod sinks;
pub mod store;
pub mod transport;

pub use config::Config;
pub use counters::Counters;
pub use discovery::Inventory;
pub use scheduler::{PollScheduler, SchedulerState};
pub use store::{LabelSet, MetricStore, Reading};
