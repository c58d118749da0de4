//! Network connectivity notifications.
//!
//! The listener only needs to know when connectivity comes back so it can
//! rebind. [`PollingNetworkMonitor`] derives that from a periodic route probe:
//! connecting a UDP socket resolves a route without sending any traffic.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkChange {
    Up,
    Down,
}

/// Source of connectivity transitions.
pub trait NetworkMonitor: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<NetworkChange>;
}

const CHANNEL_CAPACITY: usize = 16;

/// Emits a transition whenever the probe result flips.
pub struct PollingNetworkMonitor {
    sender: broadcast::Sender<NetworkChange>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingNetworkMonitor {
    /// Start probing `probe_address` every `interval` until `cancel` fires.
    pub fn start(probe_address: SocketAddr, interval: Duration, cancel: CancellationToken) -> Arc<Self> {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        let monitor = Arc::new(Self {
            sender: sender.clone(),
            cancel: cancel.clone(),
            task: Mutex::new(None),
        });

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut previous: Option<bool> = None;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let reachable = probe(probe_address).await;
                if let Some(change) = transition(previous, reachable) {
                    info!(?change, probe = %probe_address, "Network connectivity changed");
                    // No receivers is fine; nobody is listening yet.
                    let _ = sender.send(change);
                }
                previous = Some(reachable);
            }
            debug!("Network monitor stopped");
        });
        *monitor.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        monitor
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl Drop for PollingNetworkMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl NetworkMonitor for PollingNetworkMonitor {
    fn subscribe(&self) -> broadcast::Receiver<NetworkChange> {
        self.sender.subscribe()
    }
}

/// Only flips are reported; the first observation sets the baseline.
fn transition(previous: Option<bool>, reachable: bool) -> Option<NetworkChange> {
    match (previous, reachable) {
        (Some(false), true) => Some(NetworkChange::Up),
        (Some(true), false) => Some(NetworkChange::Down),
        _ => None,
    }
}

async fn probe(target: SocketAddr) -> bool {
    let local: SocketAddr = if target.is_ipv6() {
        SocketAddr::from(([0u16; 8], 0))
    } else {
        SocketAddr::from(([0u8; 4], 0))
    };
    match UdpSocket::bind(local).await {
        Ok(socket) => socket.connect(target).await.is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_only_on_flip() {
        assert_eq!(transition(None, true), None);
        assert_eq!(transition(None, false), None);
        assert_eq!(transition(Some(true), true), None);
        assert_eq!(transition(Some(false), true), Some(NetworkChange::Up));
        assert_eq!(transition(Some(true), false), Some(NetworkChange::Down));
    }

    #[tokio::test]
    async fn test_loopback_probe_is_reachable() {
        assert!(probe("127.0.0.1:9".parse().unwrap()).await);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let monitor = PollingNetworkMonitor::start(
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(10),
            cancel.clone(),
        );
        let _rx = monitor.subscribe();
        monitor.stop();

        let handle = monitor.task.lock().unwrap().take().unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
