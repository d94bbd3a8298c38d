//! Process-scoped monitoring counters
//!
//! Registered in an owned [`Registry`] handed to the exposition server; the
//! protocol path gets an `Arc<Counters>` at construction time.

use errors::RctmonResult;
use prometheus::{opts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry};
use std::fmt;

use crate::protocol::DecodeErrorKind;

/// Why a request produced no usable answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostKind {
    /// Nothing arrived before the request deadline
    Timeout,
    /// A response for a different identifier arrived
    Mismatch,
    /// A frame that is not a response arrived (request echo, plant frame)
    Ignored,
}

impl LostKind {
    pub const ALL: [LostKind; 3] = [LostKind::Timeout, LostKind::Mismatch, LostKind::Ignored];

    pub fn as_str(self) -> &'static str {
        match self {
            LostKind::Timeout => "timeout",
            LostKind::Mismatch => "mismatch",
            LostKind::Ignored => "ignored",
        }
    }
}

/// Handles the push queue updates on every offer
#[derive(Debug, Clone)]
pub struct QueueCounters {
    pub offered: IntCounter,
    pub coalesced: IntCounter,
    pub dropped: IntCounter,
}

#[derive(Clone)]
pub struct Counters {
    registry: Registry,
    pub bytes_received: IntCounter,
    pub bytes_sent: IntCounter,
    pub frames_received: IntCounter,
    pub frames_sent: IntCounter,
    pub decode_errors: IntCounterVec,
    pub frames_lost: IntCounterVec,
    pub device_up: IntGauge,
    pub push_queue_offered: IntCounter,
    pub push_queue_coalesced: IntCounter,
    pub push_queue_dropped: IntCounter,
    pub influx_points_written: IntCounter,
    pub influx_write_errors: IntCounter,
    pub mqtt_messages_published: IntCounter,
    pub mqtt_publish_errors: IntCounter,
}

impl Counters {
    pub fn new() -> RctmonResult<Self> {
        let registry = Registry::new();

        let bytes_received = IntCounter::new(
            "rctmon_bytes_received",
            "Amount of bytes received since the start of the application",
        )?;
        let bytes_sent = IntCounter::new(
            "rctmon_bytes_sent",
            "Amount of bytes sent since the start of the application",
        )?;
        let frames_received = IntCounter::new(
            "rctmon_frames_received",
            "Amount of frames received since the start of the application",
        )?;
        let frames_sent = IntCounter::new(
            "rctmon_frames_sent",
            "Amount of frames sent since the start of the application",
        )?;
        let decode_errors = IntCounterVec::new(
            opts!("rctmon_decode_error", "Amount of times the decoding of data failed"),
            &["kind"],
        )?;
        let frames_lost = IntCounterVec::new(
            opts!(
                "rctmon_frames_lost",
                "Amount of frames that were sent but not answered in time"
            ),
            &["kind"],
        )?;
        let device_up = IntGauge::new(
            "rctmon_device_up",
            "Whether the connection to the device is established",
        )?;
        let push_queue_offered = IntCounter::new(
            "rctmon_push_queue_offered",
            "Readings offered to the push queue",
        )?;
        let push_queue_coalesced = IntCounter::new(
            "rctmon_push_queue_coalesced",
            "Readings that replaced a queued reading of the same series",
        )?;
        let push_queue_dropped = IntCounter::new(
            "rctmon_push_queue_dropped",
            "Readings evicted from the push queue because it was full",
        )?;
        let influx_points_written = IntCounter::new(
            "rctmon_influx_points_written",
            "Points successfully written to InfluxDB",
        )?;
        let influx_write_errors = IntCounter::new(
            "rctmon_influx_write_errors",
            "Failed InfluxDB write requests",
        )?;
        let mqtt_messages_published = IntCounter::new(
            "rctmon_mqtt_messages_published",
            "Messages handed to the MQTT client",
        )?;
        let mqtt_publish_errors = IntCounter::new(
            "rctmon_mqtt_publish_errors",
            "Messages the MQTT client refused because its request queue was full",
        )?;
        let info = IntGaugeVec::new(
            opts!("rctmon_info", "Information about the application"),
            &["version"],
        )?;

        // Pre-create every label value so all families show up from the first scrape
        for kind in DecodeErrorKind::ALL {
            decode_errors.with_label_values(&[kind.as_str()]);
        }
        for kind in LostKind::ALL {
            frames_lost.with_label_values(&[kind.as_str()]);
        }
        info.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1);

        registry.register(Box::new(bytes_received.clone()))?;
        registry.register(Box::new(bytes_sent.clone()))?;
        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(frames_sent.clone()))?;
        registry.register(Box::new(decode_errors.clone()))?;
        registry.register(Box::new(frames_lost.clone()))?;
        registry.register(Box::new(device_up.clone()))?;
        registry.register(Box::new(push_queue_offered.clone()))?;
        registry.register(Box::new(push_queue_coalesced.clone()))?;
        registry.register(Box::new(push_queue_dropped.clone()))?;
        registry.register(Box::new(influx_points_written.clone()))?;
        registry.register(Box::new(influx_write_errors.clone()))?;
        registry.register(Box::new(mqtt_messages_published.clone()))?;
        registry.register(Box::new(mqtt_publish_errors.clone()))?;
        registry.register(Box::new(info))?;

        Ok(Self {
            registry,
            bytes_received,
            bytes_sent,
            frames_received,
            frames_sent,
            decode_errors,
            frames_lost,
            device_up,
            push_queue_offered,
            push_queue_coalesced,
            push_queue_dropped,
            influx_points_written,
            influx_write_errors,
            mqtt_messages_published,
            mqtt_publish_errors,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_decode_error(&self, kind: DecodeErrorKind) {
        self.decode_errors.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn decode_error_count(&self, kind: DecodeErrorKind) -> u64 {
        self.decode_errors.with_label_values(&[kind.as_str()]).get()
    }

    pub fn record_lost(&self, kind: LostKind) {
        self.frames_lost.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn lost_count(&self, kind: LostKind) -> u64 {
        self.frames_lost.with_label_values(&[kind.as_str()]).get()
    }

    pub fn push_queue(&self) -> QueueCounters {
        QueueCounters {
            offered: self.push_queue_offered.clone(),
            coalesced: self.push_queue_coalesced.clone(),
            dropped: self.push_queue_dropped.clone(),
        }
    }

    pub fn set_device_up(&self, up: bool) {
        self.device_up.set(i64::from(up));
    }

    pub fn is_device_up(&self) -> bool {
        self.device_up.get() == 1
    }
}

impl fmt::Debug for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counters")
            .field("bytes_received", &self.bytes_received.get())
            .field("bytes_sent", &self.bytes_sent.get())
            .field("frames_received", &self.frames_received.get())
            .field("frames_sent", &self.frames_sent.get())
            .field("device_up", &self.device_up.get())
            .finish_non_exhaustive()
    }
}
