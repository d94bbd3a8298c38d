//! Push sink: MQTT publisher
//!
//! Publishes the whole metric store on every flush, one message per reading.
//! The metric name becomes the topic path (`rctmon_battery_soc` under prefix
//! `home` is `home/battery/soc`), followed by one `<label>_<value>` segment per
//! label except the inverter name. The payload is the numeric value; string
//! readings publish `1` with the text as a `value_<text>` segment.
//!
//! Flushes are skipped while the broker is unreachable; the event loop
//! reconnects with the same backoff as the device connection.

use errors::{RctmonError, RctmonResult};
use rumqttc::{
    AsyncClient, Event, EventLoop, Key, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration,
    Transport,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::exposition::STRING_VALUE_LABEL;
use crate::catalog::INVERTER_LABEL;
use crate::counters::Counters;
use crate::store::{MetricStore, Reading};
use crate::transport::{ReconnectHelper, ReconnectPolicy};

/// Requests the client buffers before `try_publish` refuses more
const REQUEST_CAPACITY: usize = 1024;

/// Time the event loop gets to send DISCONNECT on shutdown
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MqttSinkConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub qos: QoS,
    pub retain: bool,
    pub flush_interval: Duration,
    pub keep_alive: Duration,
    pub tls: Option<MqttTls>,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttTls {
    pub ca_cert: PathBuf,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

impl MqttSinkConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Client options; reads the TLS material from disk
    pub fn options(&self) -> RctmonResult<MqttOptions> {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);

        if let Some(username) = &self.username {
            options.set_credentials(username.as_str(), self.password.as_deref().unwrap_or_default());
        }

        if let Some(tls) = &self.tls {
            let ca = read_pem(&tls.ca_cert)?;
            let client_auth = match (&tls.client_cert, &tls.client_key) {
                (Some(cert), Some(key)) => Some((read_pem(cert)?, private_key(read_pem(key)?))),
                _ => None,
            };
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Simple {
                ca,
                alpn: None,
                client_auth,
            }));
        }

        Ok(options)
    }
}

/// Map a configured level to the client's QoS; anything above 2 is level 0
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

fn read_pem(path: &Path) -> RctmonResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        RctmonError::StartupFailed(format!("Failed to read {}: {}", path.display(), e))
    })
}

/// PKCS#1 keys need the RSA reader, PKCS#8 and SEC1 keys the other one
fn private_key(pem: Vec<u8>) -> Key {
    let rsa = pem
        .windows(b"BEGIN RSA PRIVATE KEY".len())
        .any(|window| window == b"BEGIN RSA PRIVATE KEY");
    if rsa {
        Key::RSA(pem)
    } else {
        Key::ECC(pem)
    }
}

/// Topic levels cannot contain separators or wildcards
fn segment(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '/' | '+' | '#' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

pub fn topic(prefix: &str, reading: &Reading) -> String {
    let mut levels: Vec<String> = Vec::new();

    let prefix = prefix.trim_matches('/');
    if !prefix.is_empty() {
        levels.push(prefix.to_string());
    }
    levels.extend(reading.metric.split('_').skip(1).map(str::to_string));

    for (name, value) in reading.labels.iter() {
        if name != INVERTER_LABEL {
            levels.push(format!("{}_{}", name, segment(value)));
        }
    }
    if let Some(text) = reading.value.as_str() {
        levels.push(format!("{}_{}", STRING_VALUE_LABEL, segment(text)));
    }

    levels.join("/")
}

/// `None` for values a subscriber could not parse as a number
pub fn payload(reading: &Reading) -> Option<String> {
    let value = match reading.value.as_str() {
        Some(_) => 1.0,
        None => reading.value.as_f64()?,
    };
    value.is_finite().then(|| value.to_string())
}

pub struct MqttPublisher {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttSinkConfig,
    store: Arc<MetricStore>,
    counters: Arc<Counters>,
}

impl MqttPublisher {
    pub fn new(
        config: MqttSinkConfig,
        store: Arc<MetricStore>,
        counters: Arc<Counters>,
    ) -> RctmonResult<Self> {
        let (client, eventloop) = AsyncClient::new(config.options()?, REQUEST_CAPACITY);
        Ok(Self {
            client,
            eventloop,
            config,
            store,
            counters,
        })
    }

    /// Publish every stored reading until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let Self {
            client,
            eventloop,
            config,
            store,
            counters,
        } = self;
        info!("MQTT publisher started for {}", config.endpoint());

        let connected = Arc::new(AtomicBool::new(false));
        let driver = tokio::spawn(drive_event_loop(
            eventloop,
            client.clone(),
            config.clone(),
            Arc::clone(&connected),
            cancel.clone(),
        ));

        let mut ticker = tokio::time::interval(config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if connected.load(Ordering::Acquire) {
                        publish_snapshot(&client, &config, &store, &counters);
                    } else {
                        debug!("MQTT broker not connected, skipping flush");
                    }
                },
            }
        }

        if let Err(e) = driver.await {
            warn!("MQTT event loop task failed: {}", e);
        }
        info!("MQTT publisher stopped");
    }
}

/// Queue one message per reading
fn publish_snapshot(
    client: &AsyncClient,
    config: &MqttSinkConfig,
    store: &MetricStore,
    counters: &Counters,
) {
    let mut published: u64 = 0;
    let mut refused: u64 = 0;

    for reading in store.snapshot() {
        let Some(payload) = payload(&reading) else {
            continue;
        };
        let topic = topic(&config.topic_prefix, &reading);
        match client.try_publish(topic, config.qos, config.retain, payload) {
            Ok(()) => published += 1,
            Err(e) => {
                refused += 1;
                debug!("MQTT publish refused: {}", e);
            },
        }
    }

    counters.mqtt_messages_published.inc_by(published);
    if refused > 0 {
        counters.mqtt_publish_errors.inc_by(refused);
        warn!("MQTT client refused {} messages", refused);
    }
    debug!("Published {} readings to MQTT", published);
}

/// Poll the connection, reconnecting with backoff, until cancelled
async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    config: MqttSinkConfig,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let endpoint = config.endpoint();
    let mut backoff = ReconnectHelper::new(config.reconnect);
    if backoff.wait_before_attempt(&cancel).await.is_err() {
        return;
    }

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::Release);
                backoff.mark_connected();
                info!("Connected to MQTT broker {}", endpoint);
            },
            Ok(_) => {},
            Err(e) => {
                if connected.swap(false, Ordering::AcqRel) {
                    warn!("Lost connection to MQTT broker {}: {}", endpoint, e);
                }
                backoff.record_failure(&e.to_string());
                if backoff.wait_before_attempt(&cancel).await.is_err() {
                    break;
                }
            },
        }
    }

    if connected.swap(false, Ordering::AcqRel) && client.try_disconnect().is_ok() {
        let sent = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {},
                }
            }
        })
        .await;
        if sent.is_err() {
            debug!("MQTT disconnect timed out");
        }
    }
}
