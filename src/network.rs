//! Network reachability monitoring
//!
//! [`NetworkMonitor`] watches a [`Reachability`] feed and drives recovery across
//! every registered connection: regaining the network reconnects dropped
//! persistent sessions, losing it marks connected persistent sessions as lost
//! right away. [`TcpProbe`] produces that feed on hosts without a platform
//! connectivity notification by periodically opening a TCP connection to the
//! broker.

use crate::engine::rumqttc_engine::BrokerAddress;
use crate::engine::EngineError;
use crate::registry::ConnectionRegistry;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Connectivity as last reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reachability {
    Reachable,
    Unreachable,
}

/// Reacts to reachability transitions for every registered connection
pub struct NetworkMonitor {
    task: JoinHandle<()>,
}

impl NetworkMonitor {
    /// Start watching `reachability`. Only transitions after this call are acted on.
    pub fn spawn(
        registry: Arc<ConnectionRegistry>,
        mut reachability: watch::Receiver<Reachability>,
    ) -> Self {
        reachability.borrow_and_update();
        let task = tokio::spawn(async move {
            while reachability.changed().await.is_ok() {
                let current = *reachability.borrow_and_update();
                Self::apply(&registry, current).await;
            }
            debug!("Reachability feed closed, network monitor exiting");
        });
        Self { task }
    }

    /// Apply one reachability state to every registered connection.
    ///
    /// Returns how many connections started recovery (a reconnect attempt on
    /// `Reachable`, an early loss notification on `Unreachable`).
    pub async fn apply(registry: &ConnectionRegistry, reachability: Reachability) -> usize {
        let coordinators = registry.all().await;
        info!(
            ?reachability,
            connections = coordinators.len(),
            "Network reachability changed"
        );

        match reachability {
            Reachability::Reachable => {
                let mut attempts = JoinSet::new();
                for coordinator in coordinators {
                    attempts.spawn(async move { coordinator.reconnect().await });
                }

                let mut started = 0;
                while let Some(result) = attempts.join_next().await {
                    match result {
                        Ok(true) => started += 1,
                        Ok(false) => {}
                        Err(e) => warn!("Reconnect task failed: {}", e),
                    }
                }
                started
            }
            Reachability::Unreachable => {
                let mut affected = 0;
                for coordinator in coordinators {
                    let was_connected = coordinator.is_connected();
                    coordinator.offline().await;
                    if was_connected && !coordinator.is_connected() {
                        affected += 1;
                    }
                }
                affected
            }
        }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Periodic TCP reachability check against the broker
#[derive(Debug, Clone)]
pub struct TcpProbe {
    address: String,
    interval: Duration,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(address: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            interval,
            timeout,
        }
    }

    /// Probe the host and port of a broker URL
    pub fn for_broker(
        server_uri: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let address = BrokerAddress::parse(server_uri)?;
        Ok(Self::new(
            format!("{}:{}", address.host, address.port),
            interval,
            timeout,
        ))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// One reachability check
    pub async fn probe(&self) -> Reachability {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(_)) => Reachability::Reachable,
            Ok(Err(e)) => {
                debug!(address = %self.address, "Probe failed: {}", e);
                Reachability::Unreachable
            }
            Err(_) => {
                debug!(address = %self.address, "Probe timed out");
                Reachability::Unreachable
            }
        }
    }

    /// Probe every `interval` and hand each result to `report`
    pub fn spawn<F>(self, report: F) -> JoinHandle<()>
    where
        F: Fn(Reachability) + Send + Sync + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                report(self.probe().await);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_probe_for_broker_uses_default_port() {
        let probe = TcpProbe::for_broker(
            "mqtt://broker.local",
            Duration::from_secs(5),
            Duration::from_millis(500),
        )
        .unwrap();
        assert_eq!(probe.address(), "broker.local:1883");

        assert!(TcpProbe::for_broker("http://x", Duration::ZERO, Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn test_probe_reports_listener_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let probe = TcpProbe::new(address, Duration::from_secs(1), Duration::from_secs(1));

        assert_eq!(probe.probe().await, Reachability::Reachable);
    }

    #[tokio::test]
    async fn test_probe_reports_closed_port_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let probe = TcpProbe::new(address, Duration::from_secs(1), Duration::from_secs(1));

        assert_eq!(probe.probe().await, Reachability::Unreachable);
    }
}
