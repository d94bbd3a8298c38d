//! Reading consumers
//!
//! - `exposition`: Prometheus scrape endpoint reading the metric store
//! - `influx`: background writer draining the push queue into InfluxDB
//! - `mqtt`: periodic publisher of the metric store to an MQTT broker

pub mod exposition;
pub mod influx;
pub mod line_protocol;
pub mod mqtt;

pub use exposition::{ExpositionServer, ExpositionState};
pub use influx::{InfluxConfig, InfluxWriter};
pub use mqtt::{qos_from_level, MqttPublisher, MqttSinkConfig, MqttTls};
