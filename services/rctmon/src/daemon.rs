//! Daemon assembly
//!
//! Builds the shared pieces once, spawns one task per activity and ties them
//! to a single cancellation token.

use errors::{RctmonErrorTrait, RctmonResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::counters::Counters;
use crate::dispatcher::{PushQueue, SinkDispatcher};
use crate::scheduler::{PollScheduler, SchedulerState};
use crate::sinks::{ExpositionServer, ExpositionState, InfluxWriter, MqttPublisher};
use crate::store::MetricStore;
use crate::transport::{TcpTransport, Transport};

/// Running daemon
pub struct DaemonHandle {
    cancel: CancellationToken,
    metrics_addr: Option<SocketAddr>,
    state: watch::Receiver<SchedulerState>,
    store: Arc<MetricStore>,
    counters: Arc<Counters>,
    push_queue: Option<Arc<PushQueue>>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl DaemonHandle {
    /// Address the metrics server actually bound to
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub fn state(&self) -> watch::Receiver<SchedulerState> {
        self.state.clone()
    }

    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    pub fn push_queue(&self) -> Option<&Arc<PushQueue>> {
        self.push_queue.as_ref()
    }

    /// Cancel everything and wait for the tasks to finish
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Wait for the tasks without cancelling them
    pub async fn join(self) {
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!("{} task ended abnormally: {}", name, e);
            }
        }
    }
}

/// Start the collector against the TCP device in `config`
pub async fn start(config: &Config, cancel: CancellationToken) -> RctmonResult<DaemonHandle> {
    let counters = Arc::new(Counters::new()?);
    let transport = TcpTransport::new(config.tcp_config(), Arc::clone(&counters));
    start_with_transport(config, transport, counters, cancel).await
}

/// Start the collector with any transport
pub async fn start_with_transport<T>(
    config: &Config,
    transport: T,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) -> RctmonResult<DaemonHandle>
where
    T: Transport + 'static,
{
    let store = Arc::new(MetricStore::new());
    let mut dispatcher = SinkDispatcher::new(Arc::clone(&store));
    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    // Sinks first so no reading is produced before they can take it
    let mut metrics_addr = None;
    if config.prometheus.enable {
        let exposed = config.prometheus.exposition.then(|| Arc::clone(&store));
        let state = ExpositionState::new(Arc::clone(&counters), exposed);
        let server = ExpositionServer::bind(config.metrics_addr()?, state).await?;
        metrics_addr = Some(server.local_addr()?);

        let token = cancel.clone();
        tasks.push((
            "metrics server",
            tokio::spawn(async move {
                if let Err(e) = server.serve(token).await {
                    error!(code = e.error_code(), "Metrics server failed: {}", e);
                }
            }),
        ));
    }

    let mut push_queue = None;
    if config.influxdb.enable {
        let queue = Arc::new(PushQueue::new(
            config.influxdb.queue_capacity,
            counters.push_queue(),
        ));
        let writer = InfluxWriter::new(
            config.influx_config(),
            Arc::clone(&queue),
            Arc::clone(&counters),
        )?;
        tasks.push(("influxdb writer", tokio::spawn(writer.run(cancel.clone()))));
        dispatcher = dispatcher.with_push_queue(Arc::clone(&queue));
        push_queue = Some(queue);
    }

    if config.mqtt.enable {
        let publisher = MqttPublisher::new(
            config.mqtt_config(),
            Arc::clone(&store),
            Arc::clone(&counters),
        )?;
        tasks.push(("mqtt publisher", tokio::spawn(publisher.run(cancel.clone()))));
    }

    let scheduler = PollScheduler::new(
        transport,
        config.scheduler_config(),
        dispatcher,
        Arc::clone(&counters),
        cancel.clone(),
    );
    let state = scheduler.subscribe();
    tasks.push(("scheduler", tokio::spawn(scheduler.run())));

    info!(
        "rctmon {} collecting from {}:{}",
        env!("CARGO_PKG_VERSION"),
        config.device.host,
        config.device.port
    );

    Ok(DaemonHandle {
        cancel,
        metrics_addr,
        state,
        store,
        counters,
        push_queue,
        tasks,
    })
}

/// Run until a shutdown signal, then stop every task
pub async fn run(config: Config) -> RctmonResult<()> {
    let cancel = CancellationToken::new();
    let handle = start(&config, cancel.clone()).await?;
    let signals = common::cancel_on_shutdown(cancel.clone());

    cancel.cancelled().await;
    info!("Shutting down");
    if tokio::time::timeout(Duration::from_secs(10), handle.shutdown())
        .await
        .is_err()
    {
        warn!("Tasks did not stop within 10s");
    }
    let _ = signals.await;
    info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::protocol::Value;
    use crate::transport::MockTransport;

    fn config() -> Config {
        let mut config = Config::default();
        config.prometheus.bind_port = 0;
        config.prometheus.exposition = true;
        config.normalize();
        config
    }

    #[tokio::test]
    async fn test_start_and_shutdown_with_mock_device() {
        let device = MockTransport::new();
        device.set_value(0xEBC62737, Value::Str("Garage".to_string()));
        let counters = Arc::new(Counters::new().unwrap());
        let handle = start_with_transport(&config(), device, counters, CancellationToken::new())
            .await
            .unwrap();

        let addr = handle.metrics_addr().unwrap();
        let mut state = handle.state();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == SchedulerState::Polling),
        )
        .await
        .unwrap()
        .unwrap();

        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains(r#"inverter="Garage""#));
        assert!(body.contains("rctmon_device_up 1"));

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
        assert_eq!(*state.borrow(), SchedulerState::Stopped);
    }

    #[tokio::test]
    async fn test_push_queue_only_when_influx_enabled() {
        let counters = Arc::new(Counters::new().unwrap());
        let mut config = config();
        config.prometheus.enable = false;
        config.prometheus.exposition = false;
        let handle = start_with_transport(&config, MockTransport::new(), counters, CancellationToken::new())
            .await
            .unwrap();
        assert!(handle.push_queue().is_none());
        assert!(handle.metrics_addr().is_none());
        handle.shutdown().await;

        let counters = Arc::new(Counters::new().unwrap());
        let mut config = config;
        config.influxdb.enable = true;
        config.influxdb.queue_capacity = 4;
        let handle = start_with_transport(&config, MockTransport::new(), counters, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handle.push_queue().unwrap().capacity(), 4);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_mqtt_publisher_without_broker_shuts_down() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = config();
        config.mqtt.enable = true;
        config.mqtt.host = "127.0.0.1".to_string();
        config.mqtt.port = port;
        config.reconnect.initial_delay_ms = 20;
        config.reconnect.max_delay_ms = 100;

        let counters = Arc::new(Counters::new().unwrap());
        let handle = start_with_transport(&config, MockTransport::new(), counters, CancellationToken::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_mqtt_missing_ca_fails_startup() {
        let mut config = config();
        config.mqtt.enable = true;
        config.mqtt.tls.enable = true;
        config.mqtt.tls.ca_cert = Some("/nonexistent/rctmon-ca.pem".into());

        let counters = Arc::new(Counters::new().unwrap());
        let result =
            start_with_transport(&config, MockTransport::new(), counters, CancellationToken::new())
                .await;
        assert!(result.is_err());
    }
}
