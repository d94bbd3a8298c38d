//! Capability discovery
//!
//! A fixed query sequence run once per connection. Every query is retried
//! with backoff until it yields a value; only a lost connection or
//! cancellation ends discovery early.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::catalog::objects::{
    BATTERY_TYPE, BMS_SERIAL, DEVICE_NAME, GENERATOR_A_ENABLED, GENERATOR_B_ENABLED,
    MODULE_SERIALS, POWER_SWITCH_AVAILABLE,
};
use crate::counters::Counters;
use crate::protocol::{DataKind, Value};
use crate::transport::{ReconnectHelper, ReconnectPolicy, Transport, TransportError};

/// Name used when the device reports an empty one
pub const UNKNOWN_NAME: &str = "UNKNOWN";

/// Discovered device shape; replaced wholesale on every discovery run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub name: String,
    pub generator_a: bool,
    pub generator_b: bool,
    pub battery: bool,
    pub battery_modules: usize,
    pub power_switch: bool,
    pub bms: bool,
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Device disconnected during discovery: {0}")]
    Disconnected(TransportError),

    #[error("Discovery cancelled")]
    Cancelled,
}

/// Trim the device name, substituting [`UNKNOWN_NAME`] for an empty one
pub fn normalize_name(raw: &str) -> String {
    let name = raw.trim();
    if name.is_empty() {
        UNKNOWN_NAME.to_string()
    } else {
        name.to_string()
    }
}

pub struct DiscoveryEngine<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    counters: Arc<Counters>,
    request_timeout: Duration,
    retry: ReconnectPolicy,
    cancel: CancellationToken,
}

impl<'a, T: Transport + ?Sized> DiscoveryEngine<'a, T> {
    pub fn new(
        transport: &'a mut T,
        counters: Arc<Counters>,
        request_timeout: Duration,
        retry: ReconnectPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            counters,
            request_timeout,
            retry,
            cancel,
        }
    }

    /// Run all queries in order and return the inventory
    pub async fn run(mut self) -> Result<Inventory, DiscoveryError> {
        let raw_name = self.query(DEVICE_NAME, DataKind::String).await?;
        let name = normalize_name(raw_name.as_str().unwrap_or_default());
        info!("Device name: {}", name);

        let generator_a = self.query_flag(GENERATOR_A_ENABLED).await?;
        let generator_b = self.query_flag(GENERATOR_B_ENABLED).await?;

        let battery_type = self.query(BATTERY_TYPE, DataKind::U8).await?;
        let battery = battery_type.as_int().unwrap_or(0) > 0;

        let mut battery_modules = 0;
        if battery {
            for oid in MODULE_SERIALS {
                let serial = self.query(oid, DataKind::String).await?;
                if serial.as_str().map_or(true, |s| s.trim().is_empty()) {
                    break;
                }
                battery_modules += 1;
            }
        }

        let power_switch = self.query_flag(POWER_SWITCH_AVAILABLE).await?;

        let bms = if battery {
            let serial = self.query(BMS_SERIAL, DataKind::String).await?;
            serial.as_str().is_some_and(|s| !s.trim().is_empty())
        } else {
            false
        };

        let inventory = Inventory {
            name,
            generator_a,
            generator_b,
            battery,
            battery_modules,
            power_switch,
            bms,
        };
        info!(
            "Inventory: generator_a={} generator_b={} battery={} modules={} power_switch={} bms={}",
            inventory.generator_a,
            inventory.generator_b,
            inventory.battery,
            inventory.battery_modules,
            inventory.power_switch,
            inventory.bms
        );
        Ok(inventory)
    }

    async fn query_flag(&mut self, oid: u32) -> Result<bool, DiscoveryError> {
        let value = self.query(oid, DataKind::Bool).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Read one identifier, retrying timeouts and malformed answers
    async fn query(&mut self, oid: u32, kind: DataKind) -> Result<Value, DiscoveryError> {
        let mut backoff = ReconnectHelper::new(self.retry.clone());

        loop {
            backoff
                .wait_before_attempt(&self.cancel)
                .await
                .map_err(|_| DiscoveryError::Cancelled)?;

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(DiscoveryError::Cancelled),
                result = self.transport.request(oid, self.request_timeout) => result,
            };

            let failure = match result {
                Ok(frame) => match frame.value(kind) {
                    Ok(value) => {
                        debug!(oid = %common::hex::oid(oid), %value, "Discovery query answered");
                        return Ok(value);
                    },
                    Err(error) => {
                        self.counters.record_decode_error(error.kind);
                        error.to_string()
                    },
                },
                Err(error) if error.is_connection_error() => {
                    return Err(DiscoveryError::Disconnected(error));
                },
                Err(error) => error.to_string(),
            };

            backoff.record_failure(&format!("query {}: {}", common::hex::oid(oid), failure));
        }
    }
}
