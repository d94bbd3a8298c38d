//! Configuration
//!
//! Defaults, then the YAML file, then `RCTMON_*` environment variables
//! (`RCTMON_DEVICE__HOST` sets `device.host`). A missing file is fine.

use errors::{invalid_config, RctmonResult};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::catalog::Cadences;
use crate::scheduler::SchedulerConfig;
use crate::sinks::{qos_from_level, InfluxConfig, MqttSinkConfig, MqttTls};
use crate::transport::{ReconnectPolicy, TcpTransportConfig};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rctmon.yml";
pub const ENV_PREFIX: &str = "RCTMON_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub reconnect: ReconnectConfig,
    pub polling: PollingConfig,
    pub prometheus: PrometheusConfig,
    pub influxdb: InfluxdbConfig,
    pub mqtt: MqttConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_ms: u64,
    pub max_consecutive_timeouts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8899,
            request_timeout_ms: 2000,
            max_consecutive_timeouts: 3,
            connect_timeout_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub fast_interval_secs: u64,
    pub slow_interval_secs: u64,
    pub static_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            fast_interval_secs: 10,
            slow_interval_secs: 60,
            static_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    pub enable: bool,
    /// Export device readings, not just the collector's own counters
    pub exposition: bool,
    pub bind_address: String,
    pub bind_port: u16,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enable: true,
            exposition: false,
            bind_address: "127.0.0.1".to_string(),
            bind_port: 9831,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfluxdbConfig {
    pub enable: bool,
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    pub write_timeout_ms: u64,
    pub shutdown_flush_timeout_ms: u64,
}

impl Default for InfluxdbConfig {
    fn default() -> Self {
        Self {
            enable: false,
            url: "http://localhost:8086".to_string(),
            token: String::new(),
            org: "rctmon".to_string(),
            bucket: "rctmon".to_string(),
            queue_capacity: 1024,
            batch_size: 500,
            flush_interval_secs: 5,
            write_timeout_ms: 5000,
            shutdown_flush_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enable: bool,
    pub host: String,
    pub port: u16,
    pub client_name: String,
    /// Topics are `<topic_prefix>/<metric path>/<label>_<value>...`
    pub topic_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub retain: bool,
    /// 0, 1 or 2
    pub qos: u8,
    pub flush_interval_secs: u64,
    pub keep_alive_secs: u64,
    pub tls: MqttTlsConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enable: false,
            host: "localhost".to_string(),
            port: 1883,
            client_name: "rctmon".to_string(),
            topic_prefix: "rctmon".to_string(),
            username: None,
            password: None,
            retain: false,
            qos: 0,
            flush_interval_secs: 30,
            keep_alive_secs: 30,
            tls: MqttTlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttTlsConfig {
    pub enable: bool,
    pub ca_cert: Option<PathBuf>,
    /// Client certificate and key go together
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Daily rolling log files go here; console only when unset
    pub directory: Option<PathBuf>,
    pub json: bool,
}

impl Config {
    /// Load from `path` and the process environment, then validate
    pub fn load(path: &Path) -> RctmonResult<Self> {
        Self::load_with_env_prefix(path, ENV_PREFIX)
    }

    fn load_with_env_prefix(path: &Path, prefix: &str) -> RctmonResult<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(prefix).split("__"));

        let mut config: Config = figment.extract()?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Settings implied by other settings
    pub fn normalize(&mut self) {
        if self.prometheus.exposition {
            self.prometheus.enable = true;
        }
    }

    pub fn validate(&self) -> RctmonResult<()> {
        if self.device.host.trim().is_empty() {
            return Err(invalid_config!("device.host", "must not be empty"));
        }
        if self.device.port == 0 {
            return Err(invalid_config!("device.port", "must not be zero"));
        }
        if self.device.request_timeout_ms == 0 {
            return Err(invalid_config!("device.request_timeout_ms", "must not be zero"));
        }

        let reconnect = &self.reconnect;
        if reconnect.initial_delay_ms == 0 {
            return Err(invalid_config!("reconnect.initial_delay_ms", "must not be zero"));
        }
        if reconnect.max_delay_ms < reconnect.initial_delay_ms {
            return Err(invalid_config!(
                "reconnect.max_delay_ms",
                "must not be smaller than reconnect.initial_delay_ms"
            ));
        }
        if !reconnect.backoff_multiplier.is_finite() || reconnect.backoff_multiplier < 1.0 {
            return Err(invalid_config!(
                "reconnect.backoff_multiplier",
                "must be a finite number of at least 1.0"
            ));
        }

        let polling = &self.polling;
        for (field, value) in [
            ("polling.fast_interval_secs", polling.fast_interval_secs),
            ("polling.slow_interval_secs", polling.slow_interval_secs),
            ("polling.static_interval_secs", polling.static_interval_secs),
        ] {
            if value == 0 {
                return Err(invalid_config!(field, "must not be zero"));
            }
        }
        if polling.fast_interval_secs >= polling.slow_interval_secs {
            return Err(invalid_config!(
                "polling.fast_interval_secs",
                "must be smaller than polling.slow_interval_secs"
            ));
        }

        if self.prometheus.enable {
            self.metrics_addr()?;
        }

        let influx = &self.influxdb;
        if influx.queue_capacity == 0 {
            return Err(invalid_config!("influxdb.queue_capacity", "must not be zero"));
        }
        if influx.enable {
            if influx.url.trim().is_empty() {
                return Err(invalid_config!("influxdb.url", "required when influxdb is enabled"));
            }
            if influx.org.trim().is_empty() {
                return Err(invalid_config!("influxdb.org", "required when influxdb is enabled"));
            }
            if influx.bucket.trim().is_empty() {
                return Err(invalid_config!(
                    "influxdb.bucket",
                    "required when influxdb is enabled"
                ));
            }
            if influx.batch_size == 0 {
                return Err(invalid_config!("influxdb.batch_size", "must not be zero"));
            }
            self.influx_config().write_url()?;
        }

        let mqtt = &self.mqtt;
        if mqtt.enable {
            if mqtt.host.trim().is_empty() {
                return Err(invalid_config!("mqtt.host", "required when mqtt is enabled"));
            }
            if mqtt.port == 0 {
                return Err(invalid_config!("mqtt.port", "must not be zero"));
            }
            if mqtt.client_name.is_empty() || mqtt.client_name.starts_with(char::is_whitespace) {
                return Err(invalid_config!(
                    "mqtt.client_name",
                    "must not be empty or start with whitespace"
                ));
            }
            if mqtt.qos > 2 {
                return Err(invalid_config!("mqtt.qos", "must be 0, 1 or 2"));
            }
            if mqtt.flush_interval_secs == 0 {
                return Err(invalid_config!("mqtt.flush_interval_secs", "must not be zero"));
            }
            // The client rejects keep-alive intervals below five seconds
            if mqtt.keep_alive_secs < 5 {
                return Err(invalid_config!("mqtt.keep_alive_secs", "must be at least 5"));
            }
            if mqtt.password.is_some() && mqtt.username.is_none() {
                return Err(invalid_config!("mqtt.username", "required when a password is set"));
            }
            if mqtt.tls.enable && mqtt.tls.ca_cert.is_none() {
                return Err(invalid_config!("mqtt.tls.ca_cert", "required when tls is enabled"));
            }
            if mqtt.tls.client_cert.is_some() != mqtt.tls.client_key.is_some() {
                return Err(invalid_config!(
                    "mqtt.tls.client_key",
                    "client_cert and client_key must be set together"
                ));
            }
        }

        Ok(())
    }

    /// Copy safe to print
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.influxdb.token.is_empty() {
            config.influxdb.token = "********".to_string();
        }
        if config.mqtt.password.is_some() {
            config.mqtt.password = Some("********".to_string());
        }
        config
    }

    pub fn to_yaml(&self) -> RctmonResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn metrics_addr(&self) -> RctmonResult<SocketAddr> {
        let ip = self
            .prometheus
            .bind_address
            .parse::<IpAddr>()
            .map_err(|e| invalid_config!("prometheus.bind_address", e))?;
        Ok(SocketAddr::new(ip, self.prometheus.bind_port))
    }

    pub fn tcp_config(&self) -> TcpTransportConfig {
        TcpTransportConfig {
            host: self.device.host.clone(),
            port: self.device.port,
            connect_timeout: Duration::from_millis(self.device.connect_timeout_ms),
            max_consecutive_timeouts: self.device.max_consecutive_timeouts,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::from_config(
            self.reconnect.initial_delay_ms,
            self.reconnect.max_delay_ms,
            self.reconnect.backoff_multiplier,
            self.reconnect.jitter,
        )
    }

    pub fn cadences(&self) -> Cadences {
        Cadences {
            fast: Duration::from_secs(self.polling.fast_interval_secs),
            slow: Duration::from_secs(self.polling.slow_interval_secs),
            static_tier: Duration::from_secs(self.polling.static_interval_secs),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            request_timeout: Duration::from_millis(self.device.request_timeout_ms),
            cadences: self.cadences(),
            reconnect: self.reconnect_policy(),
        }
    }

    pub fn influx_config(&self) -> InfluxConfig {
        let influx = &self.influxdb;
        InfluxConfig {
            url: influx.url.clone(),
            token: influx.token.clone(),
            org: influx.org.clone(),
            bucket: influx.bucket.clone(),
            batch_size: influx.batch_size,
            flush_interval: Duration::from_secs(influx.flush_interval_secs.max(1)),
            write_timeout: Duration::from_millis(influx.write_timeout_ms),
            shutdown_flush_timeout: Duration::from_millis(influx.shutdown_flush_timeout_ms),
        }
    }

    pub fn mqtt_config(&self) -> MqttSinkConfig {
        let mqtt = &self.mqtt;
        let tls = match (mqtt.tls.enable, &mqtt.tls.ca_cert) {
            (true, Some(ca_cert)) => Some(MqttTls {
                ca_cert: ca_cert.clone(),
                client_cert: mqtt.tls.client_cert.clone(),
                client_key: mqtt.tls.client_key.clone(),
            }),
            _ => None,
        };
        MqttSinkConfig {
            host: mqtt.host.clone(),
            port: mqtt.port,
            client_id: mqtt.client_name.clone(),
            username: mqtt.username.clone(),
            password: mqtt.password.clone(),
            topic_prefix: mqtt.topic_prefix.clone(),
            qos: qos_from_level(mqtt.qos),
            retain: mqtt.retain,
            flush_interval: Duration::from_secs(mqtt.flush_interval_secs.max(1)),
            keep_alive: Duration::from_secs(mqtt.keep_alive_secs.max(5)),
            tls,
            reconnect: self.reconnect_policy(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn yaml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // Prefix nothing else in the test process sets
    const NO_ENV: &str = "RCTMON_CONFIG_TEST_UNSET_";

    #[test]
    fn test_missing_file_gives_defaults() {
        let config =
            Config::load_with_env_prefix(Path::new("/nonexistent/rctmon.yml"), NO_ENV).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.device.port, 8899);
        assert_eq!(config.cadences(), Cadences::default());
        assert_eq!(config.metrics_addr().unwrap(), "127.0.0.1:9831".parse().unwrap());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let file = yaml(
            "device:\n  host: 192.168.1.20\npolling:\n  fast_interval_secs: 5\nprometheus:\n  exposition: true\n  enable: false\n",
        );
        let config = Config::load_with_env_prefix(file.path(), NO_ENV).unwrap();

        assert_eq!(config.device.host, "192.168.1.20");
        assert_eq!(config.device.port, 8899);
        assert_eq!(config.polling.fast_interval_secs, 5);
        assert_eq!(config.polling.slow_interval_secs, 60);
        // exposition implies enable
        assert!(config.prometheus.enable);
    }

    #[test]
    fn test_shipped_sample_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/rctmon.yml");
        let config = Config::load_with_env_prefix(&path, NO_ENV).unwrap();
        assert_eq!(config.device.host, "192.168.1.50");
        assert!(config.prometheus.exposition);
        assert!(!config.influxdb.enable);
        assert!(!config.mqtt.enable);
        assert_eq!(config.mqtt.topic_prefix, "rctmon");
        assert!(config.logging.directory.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let prefix = "RCTMON_CONFIG_TEST_ENV_";
        std::env::set_var(format!("{}DEVICE__PORT", prefix), "9000");
        std::env::set_var(format!("{}INFLUXDB__BUCKET", prefix), "solar");

        let file = yaml("device:\n  port: 8000\n");
        let config = Config::load_with_env_prefix(file.path(), prefix).unwrap();
        assert_eq!(config.device.port, 9000);
        assert_eq!(config.influxdb.bucket, "solar");

        std::env::remove_var(format!("{}DEVICE__PORT", prefix));
        std::env::remove_var(format!("{}INFLUXDB__BUCKET", prefix));
    }

    #[test]
    fn test_validation_rules() {
        let mut config = Config::default();
        config.device.port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.polling.fast_interval_secs = 60;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.polling.static_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.influxdb.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.influxdb.enable = true;
        config.influxdb.bucket = String::new();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.prometheus.bind_address = "not-an-ip".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.prometheus.bind_address = "::1".to_string();
        assert_eq!(config.metrics_addr().unwrap(), "[::1]:9831".parse().unwrap());

        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_reconnect_policy_rules() {
        for multiplier in [-2.0, 0.5, f64::NAN, f64::INFINITY] {
            let mut config = Config::default();
            config.reconnect.backoff_multiplier = multiplier;
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains("reconnect.backoff_multiplier"), "{}", err);
        }

        let mut config = Config::default();
        config.reconnect.initial_delay_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.reconnect.initial_delay_ms = 5000;
        config.reconnect.max_delay_ms = 1000;
        assert!(config.validate().is_err());

        // A constant delay is allowed
        let mut config = Config::default();
        config.reconnect.backoff_multiplier = 1.0;
        config.reconnect.max_delay_ms = config.reconnect.initial_delay_ms;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_negative_multiplier_in_file_is_rejected() {
        let file = yaml("reconnect:\n  backoff_multiplier: -2.0\n");
        assert!(Config::load_with_env_prefix(file.path(), NO_ENV).is_err());
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let file = yaml("device:\n  port: seventy\n");
        assert!(Config::load_with_env_prefix(file.path(), NO_ENV).is_err());
    }

    #[test]
    fn test_redacted_and_printable() {
        let mut config = Config::default();
        config.influxdb.token = "secret".to_string();
        config.mqtt.username = Some("rctmon".to_string());
        config.mqtt.password = Some("hunter2".to_string());
        let printed = config.redacted().to_yaml().unwrap();
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("********"));
        assert!(!printed.contains("secret"));
        assert!(printed.contains("port: 8899"));
    }

    #[test]
    fn test_conversions() {
        let config = Config::default();
        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.request_timeout, Duration::from_secs(2));
        assert_eq!(scheduler.reconnect.max_delay, Duration::from_secs(60));
        assert_eq!(config.tcp_config().connect_timeout, Duration::from_secs(5));
        assert_eq!(config.influx_config().batch_size, 500);

        let mqtt = config.mqtt_config();
        assert_eq!(mqtt.port, 1883);
        assert_eq!(mqtt.client_id, "rctmon");
        assert_eq!(mqtt.qos, rumqttc::QoS::AtMostOnce);
        assert_eq!(mqtt.flush_interval, Duration::from_secs(30));
        assert!(mqtt.tls.is_none());
    }

    #[test]
    fn test_mqtt_rules_apply_only_when_enabled() {
        let mut config = Config::default();
        config.mqtt.qos = 7;
        config.mqtt.host = String::new();
        assert!(config.validate().is_ok());

        let enabled = || {
            let mut config = Config::default();
            config.mqtt.enable = true;
            config
        };
        assert!(enabled().validate().is_ok());

        let mut config = enabled();
        config.mqtt.qos = 3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("mqtt.qos"), "{}", err);

        let mut config = enabled();
        config.mqtt.client_name = " rctmon".to_string();
        assert!(config.validate().is_err());

        let mut config = enabled();
        config.mqtt.keep_alive_secs = 1;
        assert!(config.validate().is_err());

        let mut config = enabled();
        config.mqtt.flush_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = enabled();
        config.mqtt.password = Some("secret".to_string());
        assert!(config.validate().is_err());

        let mut config = enabled();
        config.mqtt.tls.enable = true;
        assert!(config.validate().is_err());
        config.mqtt.tls.ca_cert = Some(PathBuf::from("/etc/ssl/ca.pem"));
        assert!(config.validate().is_ok());
        config.mqtt.tls.client_cert = Some(PathBuf::from("/etc/ssl/client.pem"));
        assert!(config.validate().is_err());
        config.mqtt.tls.client_key = Some(PathBuf::from("/etc/ssl/client.key"));
        assert!(config.validate().is_ok());

        let mqtt = config.mqtt_config();
        assert_eq!(mqtt.tls.unwrap().ca_cert, PathBuf::from("/etc/ssl/ca.pem"));
    }

    #[test]
    fn test_mqtt_section_from_file() {
        let file = yaml(
            "mqtt:\n  enable: true\n  host: broker.lan\n  qos: 1\n  retain: true\n  topic_prefix: /home/solar/\n",
        );
        let config = Config::load_with_env_prefix(file.path(), NO_ENV).unwrap();
        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 1883);

        let mqtt = config.mqtt_config();
        assert_eq!(mqtt.qos, rumqttc::QoS::AtLeastOnce);
        assert!(mqtt.retain);
        assert_eq!(mqtt.topic_prefix, "/home/solar/");
    }
}
