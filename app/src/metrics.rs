//! Acknowledgment metrics
//!
//! [`AcknowledgmentMetrics`] is a pure fold over [`MetricEvent`]s: the same
//! event sequence always yields the same counters. Every event is also
//! mirrored into process-wide Prometheus collectors registered under the
//! `snapsync` registry, which the binary can expose over HTTP.

use crate::error::AckErrorCode;
use crate::types::AckPriority;
use chrono::{DateTime, Utc};
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, Encoder, Histogram,
    IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

lazy_static! {
    pub static ref SNAPSYNC_REGISTRY: Registry =
        Registry::new_custom(Some("snapsync".to_string()), None).unwrap();
}

lazy_static! {
    pub static ref ACK_SENT_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "ack_sent_total",
        "Acknowledged pushes handed to the transport",
        &["priority"],
        SNAPSYNC_REGISTRY
    )
    .unwrap();
    pub static ref ACK_RECEIVED_TOTAL: IntCounter = register_int_counter_with_registry!(
        "ack_received_total",
        "Acknowledgment replies matched to an outstanding request",
        SNAPSYNC_REGISTRY
    )
    .unwrap();
    pub static ref ACK_SUCCESSFUL_TOTAL: IntCounter = register_int_counter_with_registry!(
        "ack_successful_total",
        "Exchanges resolved as applied",
        SNAPSYNC_REGISTRY
    )
    .unwrap();
    pub static ref ACK_FAILED_TOTAL: IntCounterVec = register_int_counter_vec_with_registry!(
        "ack_failed_total",
        "Exchanges that ended in failure, by error code",
        &["code"],
        SNAPSYNC_REGISTRY
    )
    .unwrap();
    pub static ref ACK_RETRIED_TOTAL: IntCounter = register_int_counter_with_registry!(
        "ack_retried_total",
        "Retries scheduled after a failed send",
        SNAPSYNC_REGISTRY
    )
    .unwrap();
    pub static ref ACK_TIMEOUTS_TOTAL: IntCounter = register_int_counter_with_registry!(
        "ack_timeouts_total",
        "Outstanding acknowledgments that passed their deadline",
        SNAPSYNC_REGISTRY
    )
    .unwrap();
    pub static ref ACK_RESPONSE_TIME: Histogram = register_histogram_with_registry!(
        "ack_response_time_seconds",
        "Time from send to acknowledgment",
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0],
        SNAPSYNC_REGISTRY
    )
    .unwrap();
    pub static ref ACK_PENDING: IntGauge = register_int_gauge_with_registry!(
        "ack_pending",
        "Acknowledgments currently awaited",
        SNAPSYNC_REGISTRY
    )
    .unwrap();
    pub static ref SELF_HEAL_REAPPLIES_TOTAL: IntCounter = register_int_counter_with_registry!(
        "self_heal_reapplies_total",
        "Forced re-applications triggered by stale hashes",
        SNAPSYNC_REGISTRY
    )
    .unwrap();
}

/// Everything that moves a counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricEvent {
    Sent(AckPriority),
    Received,
    Succeeded { response_time: Duration },
    Failed(AckErrorCode),
    Retried,
    TimedOut,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AcknowledgmentMetrics {
    pub total_sent: u64,
    pub total_received: u64,
    pub total_successful: u64,
    pub total_failed: u64,
    pub total_retried: u64,
    pub total_timeouts: u64,
    /// Running mean over successful exchanges
    pub average_response_time_ms: f64,
    pub errors_by_code: BTreeMap<AckErrorCode, u64>,
    pub sent_by_priority: BTreeMap<AckPriority, u64>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl AcknowledgmentMetrics {
    pub fn from_events<I: IntoIterator<Item = MetricEvent>>(events: I) -> Self {
        let mut metrics = Self::default();
        for event in events {
            metrics.apply(event);
        }
        metrics
    }

    /// Folds a single event into the counters. Pure; no exporter side effects.
    pub fn apply(&mut self, event: MetricEvent) {
        match event {
            MetricEvent::Sent(priority) => {
                self.total_sent += 1;
                *self.sent_by_priority.entry(priority).or_default() += 1;
            }
            MetricEvent::Received => self.total_received += 1,
            MetricEvent::Succeeded { response_time } => {
                self.total_successful += 1;
                let sample = response_time.as_secs_f64() * 1000.0;
                self.average_response_time_ms +=
                    (sample - self.average_response_time_ms) / self.total_successful as f64;
            }
            MetricEvent::Failed(code) => {
                self.total_failed += 1;
                *self.errors_by_code.entry(code).or_default() += 1;
            }
            MetricEvent::Retried => self.total_retried += 1,
            MetricEvent::TimedOut => self.total_timeouts += 1,
        }
    }

    /// Applies the event and mirrors it to the Prometheus collectors.
    pub fn record(&mut self, event: MetricEvent, at: DateTime<Utc>) {
        self.apply(event);
        self.last_updated = Some(at);
        export(event);
    }

    pub fn success_rate(&self) -> f64 {
        let finished = self.total_successful + self.total_failed;
        if finished == 0 {
            return 1.0;
        }
        self.total_successful as f64 / finished as f64
    }
}

fn export(event: MetricEvent) {
    match event {
        MetricEvent::Sent(priority) => ACK_SENT_TOTAL.with_label_values(&[priority.as_ref()]).inc(),
        MetricEvent::Received => ACK_RECEIVED_TOTAL.inc(),
        MetricEvent::Succeeded { response_time } => {
            ACK_SUCCESSFUL_TOTAL.inc();
            ACK_RESPONSE_TIME.observe(response_time.as_secs_f64());
        }
        MetricEvent::Failed(code) => ACK_FAILED_TOTAL.with_label_values(&[code.as_ref()]).inc(),
        MetricEvent::Retried => ACK_RETRIED_TOTAL.inc(),
        MetricEvent::TimedOut => ACK_TIMEOUTS_TOTAL.inc(),
    }
}

fn encode_registry() -> Result<Vec<u8>, prometheus::Error> {
    let mut metric_families = SNAPSYNC_REGISTRY.gather();
    metric_families.extend(prometheus::gather());

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

async fn handle_request(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let mut response = Response::new(Body::empty());
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => match encode_registry() {
            Ok(buffer) => {
                if let Ok(content_type) = TextEncoder::new().format_type().parse() {
                    response
                        .headers_mut()
                        .insert(hyper::header::CONTENT_TYPE, content_type);
                }
                *response.body_mut() = Body::from(buffer);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode metrics");
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            }
        },
        (&Method::GET, "/health") => {
            *response.body_mut() = Body::from("ok");
        }
        _ => {
            *response.body_mut() = Body::from("Not Found");
            *response.status_mut() = StatusCode::NOT_FOUND;
        }
    }
    Ok(response)
}

/// Serves `/metrics` and `/health` until `shutdown` fires.
pub async fn start_server(port_number: Option<u16>, shutdown: CancellationToken) {
    const DEFAULT_PORT: u16 = 9001;

    let addr = SocketAddr::from(([0, 0, 0, 0], port_number.unwrap_or(DEFAULT_PORT)));
    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle_request)) });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder
            .serve(make_svc)
            .with_graceful_shutdown(async move { shutdown.cancelled().await }),
        Err(e) => {
            tracing::error!(%addr, error = %e, "Could not bind metrics server");
            return;
        }
    };

    tokio::spawn(async move {
        tracing::info!("Starting metrics server on {}", addr);

        if let Err(e) = server.await {
            tracing::error!("Metrics server error: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_mean_matches_arithmetic_mean() {
        let metrics = AcknowledgmentMetrics::from_events([
            MetricEvent::Succeeded {
                response_time: Duration::from_millis(100),
            },
            MetricEvent::Succeeded {
                response_time: Duration::from_millis(200),
            },
            MetricEvent::Succeeded {
                response_time: Duration::from_millis(600),
            },
        ]);
        assert_eq!(metrics.total_successful, 3);
        assert!((metrics.average_response_time_ms - 300.0).abs() < 1e-9);
    }

    #[test]
    fn tallies_by_code_and_priority() {
        let metrics = AcknowledgmentMetrics::from_events([
            MetricEvent::Sent(AckPriority::High),
            MetricEvent::Sent(AckPriority::High),
            MetricEvent::Sent(AckPriority::Low),
            MetricEvent::Failed(AckErrorCode::NetworkError),
            MetricEvent::Failed(AckErrorCode::NetworkError),
            MetricEvent::Failed(AckErrorCode::DataCorrupted),
            MetricEvent::Retried,
        ]);
        assert_eq!(metrics.total_sent, 3);
        assert_eq!(metrics.sent_by_priority[&AckPriority::High], 2);
        assert_eq!(metrics.sent_by_priority[&AckPriority::Low], 1);
        assert_eq!(metrics.total_failed, 3);
        assert_eq!(metrics.errors_by_code[&AckErrorCode::NetworkError], 2);
        assert_eq!(metrics.total_retried, 1);
    }

    #[test]
    fn same_events_same_counters() {
        let events = vec![
            MetricEvent::Sent(AckPriority::Medium),
            MetricEvent::Received,
            MetricEvent::Succeeded {
                response_time: Duration::from_millis(42),
            },
            MetricEvent::TimedOut,
        ];
        assert_eq!(
            AcknowledgmentMetrics::from_events(events.clone()),
            AcknowledgmentMetrics::from_events(events)
        );
    }

    #[test]
    fn success_rate_without_outcomes_is_one() {
        assert_eq!(AcknowledgmentMetrics::default().success_rate(), 1.0);
    }
}
