//! Push sink: InfluxDB v2 writer
//!
//! Drains the push queue in batches. A failed write drops its batch, so an
//! unreachable database costs at most the queue's worth of memory.

use errors::{RctmonError, RctmonErrorTrait, RctmonResult};
use reqwest::{header, Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::line_protocol;
use crate::counters::Counters;
use crate::dispatcher::PushQueue;
use crate::store::Reading;

#[derive(Debug, Clone)]
pub struct InfluxConfig {
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub write_timeout: Duration,
    pub shutdown_flush_timeout: Duration,
}

impl Default for InfluxConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8086".to_string(),
            token: String::new(),
            org: "rctmon".to_string(),
            bucket: "rctmon".to_string(),
            batch_size: 500,
            flush_interval: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            shutdown_flush_timeout: Duration::from_secs(2),
        }
    }
}

impl InfluxConfig {
    /// `{url}/api/v2/write` with org, bucket and second precision
    pub fn write_url(&self) -> RctmonResult<Url> {
        let base = format!("{}/api/v2/write", self.url.trim_end_matches('/'));
        Url::parse_with_params(
            &base,
            &[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", "s"),
            ],
        )
        .map_err(|e| RctmonError::InvalidConfig {
            field: "influxdb.url".to_string(),
            reason: e.to_string(),
        })
    }
}

pub struct InfluxWriter {
    client: Client,
    write_url: Url,
    config: InfluxConfig,
    queue: Arc<PushQueue>,
    counters: Arc<Counters>,
}

impl InfluxWriter {
    pub fn new(
        config: InfluxConfig,
        queue: Arc<PushQueue>,
        counters: Arc<Counters>,
    ) -> RctmonResult<Self> {
        let write_url = config.write_url()?;
        let client = Client::builder().timeout(config.write_timeout).build()?;
        Ok(Self {
            client,
            write_url,
            config,
            queue,
            counters,
        })
    }

    /// POST one batch; returns the number of points written
    pub async fn write_batch(&self, batch: &[Arc<Reading>]) -> RctmonResult<usize> {
        let body = line_protocol::lines(batch.iter().map(Arc::as_ref));
        let points = body.lines().count();
        if points == 0 {
            return Ok(0);
        }

        let mut request = self
            .client
            .post(self.write_url.clone())
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(body);
        if !self.config.token.is_empty() {
            request = request.header(header::AUTHORIZATION, format!("Token {}", self.config.token));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RctmonError::ExternalService {
                service: "influxdb".to_string(),
                message: format!("{}: {}", status, message.trim()),
            });
        }

        Ok(points)
    }

    /// Write whatever is queued right now, batch by batch
    pub async fn flush(&self) {
        let mut remaining = self.queue.len();
        while remaining > 0 {
            let batch = self.queue.drain(self.config.batch_size.min(remaining));
            if batch.is_empty() {
                break;
            }
            remaining = remaining.saturating_sub(batch.len());

            match self.write_batch(&batch).await {
                Ok(points) => {
                    self.counters.influx_points_written.inc_by(points as u64);
                    debug!("Wrote {} points to InfluxDB", points);
                },
                Err(e) => {
                    self.counters.influx_write_errors.inc();
                    if e.is_retryable() {
                        warn!(
                            code = e.error_code(),
                            "InfluxDB write failed, dropping {} readings: {}",
                            batch.len(),
                            e
                        );
                    } else {
                        error!(
                            code = e.error_code(),
                            "InfluxDB write failed, dropping {} readings: {}",
                            batch.len(),
                            e
                        );
                    }
                },
            }
        }
    }

    /// Drain until cancelled, then flush once more within the shutdown bound
    pub async fn run(self, cancel: CancellationToken) {
        info!("InfluxDB writer started for {}", self.config.url);
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flush_now = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => true,
                _ = self.queue.notified() => self.queue.len() >= self.config.batch_size,
            };
            if flush_now {
                // A write in flight at cancellation is abandoned with its batch
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.flush() => {},
                }
            }
        }

        if tokio::time::timeout(self.config.shutdown_flush_timeout, self.flush())
            .await
            .is_err()
        {
            warn!("Final InfluxDB flush timed out");
        }
        let dropped = self.queue.drain(usize::MAX).len();
        if dropped > 0 {
            warn!("Dropping {} unsent readings", dropped);
        }
        info!("InfluxDB writer stopped");
    }
}
