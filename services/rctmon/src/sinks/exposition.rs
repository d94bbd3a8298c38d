//! Pull sink: Prometheus text exposition over HTTP

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use errors::{RctmonError, RctmonResult};
use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::catalog::metric_help;
use crate::counters::Counters;
use crate::store::{MetricStore, Reading};

/// Label carrying the text of a string reading
pub const STRING_VALUE_LABEL: &str = "value";

#[derive(Debug, Clone)]
pub struct ExpositionState {
    counters: Arc<Counters>,
    /// `None` exports the monitoring counters only
    store: Option<Arc<MetricStore>>,
}

impl ExpositionState {
    pub fn new(counters: Arc<Counters>, store: Option<Arc<MetricStore>>) -> Self {
        Self { counters, store }
    }

    /// Render the full scrape body
    pub fn render(&self) -> RctmonResult<String> {
        let mut families = self.counters.registry().gather();
        if let Some(store) = &self.store {
            families.extend(reading_families(store));
        }

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| RctmonError::Serialization(e.to_string()))
    }
}

/// One gauge family per metric name, built from the current store contents
///
/// Families without samples are left out.
pub fn reading_families(store: &MetricStore) -> Vec<MetricFamily> {
    let mut families: Vec<MetricFamily> = Vec::new();

    // Snapshot is ordered by metric name, so each family is one contiguous run
    for reading in store.snapshot() {
        let Some(metric) = sample(&reading) else {
            continue;
        };

        match families.last_mut() {
            Some(family) if family.get_name() == reading.metric => {
                family.mut_metric().push(metric);
            },
            _ => {
                let mut family = MetricFamily::default();
                family.set_name(reading.metric.to_string());
                family.set_help(metric_help(reading.metric).to_string());
                family.set_field_type(MetricType::GAUGE);
                family.mut_metric().push(metric);
                families.push(family);
            },
        }
    }

    families
}

fn sample(reading: &Reading) -> Option<Metric> {
    let mut metric = Metric::default();
    for (name, value) in reading.labels.iter() {
        metric.mut_label().push(label(name, value));
    }

    let value = match reading.value.as_str() {
        Some(text) => {
            metric.mut_label().push(label(STRING_VALUE_LABEL, text));
            1.0
        },
        None => reading.value.as_f64()?,
    };

    let mut gauge = Gauge::default();
    gauge.set_value(value);
    metric.set_gauge(gauge);
    Some(metric)
}

fn label(name: &str, value: &str) -> LabelPair {
    let mut pair = LabelPair::default();
    pair.set_name(name.to_string());
    pair.set_value(value.to_string());
    pair
}

pub fn router(state: ExpositionState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn metrics_handler(State(state): State<Arc<ExpositionState>>) -> Response {
    match state.render() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        },
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Bound listener, serving once [`serve`](Self::serve) is awaited
pub struct ExpositionServer {
    listener: TcpListener,
    router: Router,
}

impl ExpositionServer {
    pub async fn bind(addr: SocketAddr, state: ExpositionState) -> RctmonResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            RctmonError::StartupFailed(format!("Failed to bind metrics server to {}: {}", addr, e))
        })?;
        Ok(Self {
            listener,
            router: router(state),
        })
    }

    pub fn local_addr(&self) -> RctmonResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `cancel` fires, then finish in-flight scrapes
    pub async fn serve(self, cancel: CancellationToken) -> RctmonResult<()> {
        let addr = self.local_addr()?;
        info!("Metrics server listening on http://{}/metrics", addr);

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        info!("Metrics server stopped");
        Ok(())
    }
}
