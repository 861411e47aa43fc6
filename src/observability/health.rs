//! Health check HTTP server
//!
//! Exposes connection state and metrics for operators and orchestrators:
//!
//! - `GET /health`: overall status plus one check and one record per connection
//! - `GET /metrics`: the global metrics snapshot
//! - `GET /ready`: 200 once at least one connection is established
//! - `GET /live`: always 200 while the process serves requests

use crate::coordinator::{ConnectionRecord, ConnectionState};
use crate::network::Reachability;
use crate::observability::metrics::metrics;
use crate::service::MqttService;
use serde::Serialize;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    app_id: String,
    port: u16,
    service: Arc<MqttService>,
}

impl HealthServer {
    pub fn new(app_id: String, port: u16, service: Arc<MqttService>) -> Self {
        Self {
            app_id,
            port,
            service,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// All routes, without binding a socket
    pub fn routes(
        self: Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let with_server = {
            let server = self.clone();
            warp::any().map(move || server.clone())
        };

        let health_route = warp::path("health")
            .and(warp::get())
            .and(with_server.clone())
            .and_then(|server: Arc<Self>| async move {
                let status = server.get_health_status().await;
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            });

        let metrics_route = warp::path("metrics").and(warp::get()).map(|| {
            let snapshot = metrics().get_metrics();
            warp::reply::json(&snapshot)
        });

        let ready_route = warp::path("ready")
            .and(warp::get())
            .and(with_server)
            .and_then(|server: Arc<Self>| async move {
                let connected = server
                    .service
                    .connection_records()
                    .await
                    .iter()
                    .filter(|record| record.state == ConnectionState::Connected)
                    .count();
                let response = ReadinessResponse {
                    ready: connected > 0,
                    connected,
                    timestamp: current_timestamp(),
                };
                let code = if response.ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&response),
                    code,
                ))
            });

        let live_route = warp::path("live").and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Serve until the process exits
    pub async fn start(self: Arc<Self>) {
        let port = self.port;
        tracing::info!("Starting health server on port {}", port);
        warp::serve(self.routes()).run(([0, 0, 0, 0], port)).await;
    }

    async fn get_health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let connections = self.service.connection_records().await;

        let checks: BTreeMap<String, HealthCheck> = connections
            .iter()
            .map(|record| (record.handle.to_string(), check_connection(record, now)))
            .collect();
        let healthy = checks.values().all(|check| check.status == "healthy");

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            app_id: self.app_id.clone(),
            uptime_seconds: metrics().get_metrics().uptime_seconds,
            reachability: self.service.reachability(),
            checks,
            connections,
        }
    }
}

fn check_connection(record: &ConnectionRecord, now: u64) -> HealthCheck {
    let status = match record.state {
        ConnectionState::Connected => "healthy",
        // a persistent session being re-established is expected to recover
        ConnectionState::Connecting | ConnectionState::None => "starting",
        _ => "unhealthy",
    };
    HealthCheck {
        status: status.to_string(),
        message: Some(format!("{:?}", record.state)),
        last_check: now,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    app_id: String,
    uptime_seconds: u64,
    reachability: Reachability,
    checks: BTreeMap<String, HealthCheck>,
    connections: Vec<ConnectionRecord>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    connected: usize,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ConnectOptions;
    use crate::ping::NoopWakeLock;
    use crate::store::SqliteMessageStore;
    use crate::testing::MockEngineFactory;
    use tokio::sync::mpsc;

    fn health_server() -> Arc<HealthServer> {
        let service = Arc::new(MqttService::new(
            Arc::new(SqliteMessageStore::in_memory().unwrap()),
            Arc::new(MockEngineFactory::new()),
            Arc::new(NoopWakeLock),
        ));
        Arc::new(HealthServer::new("health-tests".to_string(), 8080, service))
    }

    #[tokio::test]
    async fn test_live_always_ok() {
        let server = health_server();
        let response = warp::test::request()
            .path("/live")
            .reply(&server.routes())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ready_requires_a_connection() {
        let server = health_server();
        let routes = server.clone().routes();

        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let (sink, _events) = mpsc::unbounded_channel();
        let handle = server
            .service
            .get_client("tcp://localhost:1883", "c1", "health-tests", sink)
            .await
            .unwrap();
        server
            .service
            .connect(&handle, crate::message::ActivityToken(1), ConnectOptions::default())
            .await
            .unwrap();

        let response = warp::test::request().path("/ready").reply(&routes).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_each_connection() {
        let server = health_server();
        let (sink, _events) = mpsc::unbounded_channel();
        server
            .service
            .get_client("tcp://localhost:1883", "idle", "health-tests", sink)
            .await
            .unwrap();

        let response = warp::test::request()
            .path("/health")
            .reply(&server.routes())
            .await;
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();

        assert_eq!(body["app_id"], "health-tests");
        assert_eq!(body["connections"].as_array().unwrap().len(), 1);
        assert_eq!(body["connections"][0]["client_id"], "idle");
    }
}
