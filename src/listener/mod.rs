//! UDP ingestion listener.
//!
//! Owns one UDP socket, turns every datagram into a classified
//! [`RawPacket`] and publishes it on the relay bus. The receive loop never
//! exits on error; it stops on cancellation or disposal only. Socket
//! replacement (rebind) happens under a single gate shared with the receive
//! loop, so the loop never reads from a half-replaced socket.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod binder;
mod config;
mod network;

pub use binder::{bind_with_fallback, is_bind_conflict, SocketBinder, TokioBinder};
pub use config::{ListenerConfig, DEFAULT_PREFERRED_PORT};
pub use network::{NetworkChange, NetworkMonitor, PollingNetworkMonitor};

use crate::bus::{RelayBus, SubscriptionId};
use crate::config::paths;
use crate::packet::RawPacket;
use crate::utils::retry::error_delay;

/// Result type for listener operations.
pub type Result<T> = std::result::Result<T, ListenerError>;

/// Errors that can occur while binding or initializing the listener.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),

    #[error("Failed to bind UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("No UDP port available in {first}..={last}")]
    NoPortAvailable { first: u16, last: u16 },

    #[error("Listener is already running")]
    AlreadyInitialized,

    #[error("Listener has been disposed")]
    Disposed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Largest payload a UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_507;

/// Socket errors that indicate the network underneath changed.
pub fn is_topology_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NetworkDown
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::AddrNotAvailable
    )
}

/// Point-in-time listener counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerStats {
    pub bound_port: Option<u16>,
    pub total_received: u64,
    /// Datagrams dropped because they could not be classified.
    pub dropped: u64,
    pub consecutive_errors: u32,
    pub last_packet_at: Option<DateTime<Utc>>,
    pub rebinds: u64,
    pub healthy: bool,
}

/// Rate limiter for "no packets" warnings.
#[derive(Debug)]
pub(crate) struct SilenceTracker {
    window: Duration,
    last_activity: Instant,
    last_warning: Option<Instant>,
}

impl SilenceTracker {
    pub(crate) fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            last_activity: now,
            last_warning: None,
        }
    }

    pub(crate) fn on_packet(&mut self, now: Instant) {
        self.last_activity = now;
        self.last_warning = None;
    }

    /// Returns the silence duration when a warning is due.
    pub(crate) fn on_timeout(&mut self, now: Instant) -> Option<Duration> {
        let silent_for = now.saturating_duration_since(self.last_activity);
        if silent_for < self.window {
            return None;
        }
        if let Some(last) = self.last_warning {
            if now.saturating_duration_since(last) < self.window {
                return None;
            }
        }
        self.last_warning = Some(now);
        Some(silent_for)
    }
}

/// UDP listener publishing [`RawPacket`]s on the relay bus.
pub struct UdpListener {
    config: ListenerConfig,
    bus: Arc<RelayBus>,
    binder: Arc<dyn SocketBinder>,
    monitor: Option<Arc<dyn NetworkMonitor>>,
    cancel: CancellationToken,

    socket: tokio::sync::Mutex<Option<Arc<UdpSocket>>>,
    replaced: Notify,

    preferred_port: AtomicU16,
    bound_port: AtomicU16,
    total_received: AtomicU64,
    dropped: AtomicU64,
    consecutive_errors: AtomicU32,
    last_packet_at: AtomicI64,
    rebinds: AtomicU64,
    healthy: AtomicBool,
    rebinding: AtomicBool,
    initialized: AtomicBool,
    disposed: AtomicBool,

    tasks: Mutex<Vec<JoinHandle<()>>>,
    port_subscription: Mutex<Option<SubscriptionId>>,
}

impl UdpListener {
    /// Create a listener whose background work stops when `parent` is cancelled.
    pub fn new(config: ListenerConfig, bus: Arc<RelayBus>, parent: &CancellationToken) -> Self {
        let preferred = config.preferred_port;
        Self {
            config,
            bus,
            binder: Arc::new(TokioBinder),
            monitor: None,
            cancel: parent.child_token(),
            socket: tokio::sync::Mutex::new(None),
            replaced: Notify::new(),
            preferred_port: AtomicU16::new(preferred),
            bound_port: AtomicU16::new(0),
            total_received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            last_packet_at: AtomicI64::new(i64::MIN),
            rebinds: AtomicU64::new(0),
            healthy: AtomicBool::new(false),
            rebinding: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            port_subscription: Mutex::new(None),
        }
    }

    pub fn with_binder(mut self, binder: Arc<dyn SocketBinder>) -> Self {
        self.binder = binder;
        self
    }

    pub fn with_network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Bind and start receiving. Returns the bound port.
    pub async fn initialize(self: &Arc<Self>, preferred_port: u16) -> Result<u16> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ListenerError::Disposed);
        }
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(ListenerError::AlreadyInitialized);
        }

        self.preferred_port.store(preferred_port, Ordering::SeqCst);
        let bound = match self.rebind(preferred_port).await {
            Ok(port) => port,
            Err(e) => {
                self.initialized.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        // The first bind is not a rebind.
        self.rebinds.store(0, Ordering::Relaxed);

        self.track(tokio::spawn(receive_loop(Arc::downgrade(self))));

        if let Some(monitor) = &self.monitor {
            let changes = monitor.subscribe();
            self.track(tokio::spawn(watch_network(Arc::downgrade(self), changes)));
        }

        let weak = Arc::downgrade(self);
        let id = self
            .bus
            .register_path(paths::UDP_LISTENER_PREFERRED_PORT, move |value| {
                let Some(listener) = weak.upgrade() else {
                    return;
                };
                match value.value.trim().parse::<u16>() {
                    Ok(port) => listener.set_preferred_port(port),
                    Err(e) => warn!(value = %value.value, error = %e, "Ignoring invalid preferred port"),
                }
            });
        *self
            .port_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);

        info!(preferred_port, bound_port = bound, "UDP listener started");
        Ok(bound)
    }

    /// Switch to a new preferred port, rebinding in the background.
    pub fn set_preferred_port(self: &Arc<Self>, port: u16) {
        let previous = self.preferred_port.swap(port, Ordering::SeqCst);
        if previous == port && self.bound_port() == Some(port) {
            return;
        }
        info!(previous, port, "Preferred port changed");
        self.spawn_rebind("preferred port changed");
    }

    pub fn preferred_port(&self) -> u16 {
        self.preferred_port.load(Ordering::SeqCst)
    }

    pub fn bound_port(&self) -> Option<u16> {
        match self.bound_port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    pub fn stats(&self) -> ListenerStats {
        let last = self.last_packet_at.load(Ordering::Relaxed);
        ListenerStats {
            bound_port: self.bound_port(),
            total_received: self.total_received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
            last_packet_at: (last != i64::MIN)
                .then(|| DateTime::from_timestamp(last, 0))
                .flatten(),
            rebinds: self.rebinds.load(Ordering::Relaxed),
            healthy: self.healthy.load(Ordering::Relaxed),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Stop receiving and release the socket.
    ///
    /// Each step is bounded by the dispose timeout, so this never hangs.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let id = self
            .port_subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = id {
            self.bus.unregister_path(id);
        }

        let timeout = self.config.dispose_timeout();
        match tokio::time::timeout(timeout, self.socket.lock()).await {
            Ok(mut gate) => {
                gate.take();
                self.replaced.notify_waiters();
            }
            Err(_) => warn!(?timeout, "Timed out acquiring socket gate during dispose"),
        }
        self.bound_port.store(0, Ordering::SeqCst);
        self.healthy.store(false, Ordering::SeqCst);

        let handles: Vec<_> = std::mem::take(
            &mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(?timeout, "Listener tasks did not stop in time");
        }

        info!("UDP listener disposed");
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    fn bind_ip(&self) -> Result<IpAddr> {
        self.config
            .bind_address
            .parse()
            .map_err(|_| ListenerError::InvalidAddress(self.config.bind_address.clone()))
    }

    /// Rebind in the background unless one is already running.
    fn spawn_rebind(self: &Arc<Self>, reason: &'static str) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self
            .rebinding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(reason, "Rebind already in progress");
            return;
        }

        let this = Arc::clone(self);
        self.track(tokio::spawn(async move {
            loop {
                let port = this.preferred_port();
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    result = this.rebind(port) => match result {
                        Ok(bound) => info!(reason, port = bound, "Rebound UDP listener"),
                        Err(e) => error!(reason, port, error = %e, "Rebind failed"),
                    },
                }
                // Pick up a preferred-port change that raced with this rebind.
                if this.preferred_port() == port {
                    break;
                }
            }
            this.rebinding.store(false, Ordering::SeqCst);
        }));
    }

    /// Replace the socket under the gate.
    ///
    /// The old socket is closed before binding, so a rebind to the same
    /// port does not conflict with itself.
    async fn rebind(&self, port: u16) -> Result<u16> {
        let ip = self.bind_ip()?;
        let mut gate = self.socket.lock().await;

        if let Some(old) = gate.take() {
            self.bound_port.store(0, Ordering::SeqCst);
            self.replaced.notify_waiters();
            release(old, self.config.receive_timeout()).await;
        }

        let socket = bind_with_fallback(&*self.binder, ip, port, &self.config).await?;
        let bound = socket.local_addr()?.port();
        *gate = Some(Arc::new(socket));

        self.bound_port.store(bound, Ordering::SeqCst);
        self.rebinds.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.healthy.store(true, Ordering::SeqCst);
        Ok(bound)
    }

    fn on_datagram(&self, bytes: &[u8], from: SocketAddr) {
        let now = Utc::now().timestamp();
        self.total_received.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
        self.last_packet_at.store(now, Ordering::Relaxed);
        self.healthy.store(true, Ordering::Relaxed);

        match RawPacket::from_datagram(bytes, Some(from), now) {
            Ok(packet) => {
                let delivered = self.bus.send(&packet);
                debug!(
                    packet_id = %packet.id,
                    kind = %packet.kind,
                    source = %from,
                    delivered,
                    "Published packet"
                );
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(source = %from, len = bytes.len(), error = %e, "Dropping malformed packet");
            }
        }
    }

    /// Record a receive failure and return how long to back off.
    fn on_receive_error(self: &Arc<Self>, error: &io::Error) -> Duration {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1;

        if is_topology_error(error) {
            warn!(error = %error, errors, "Network error on UDP socket, rebinding");
            self.healthy.store(false, Ordering::SeqCst);
            self.spawn_rebind("network error");
        } else if errors >= self.config.error_threshold {
            error!(error = %error, errors, "Repeated UDP receive errors");
        } else {
            warn!(error = %error, errors, "UDP receive error");
        }

        error_delay(
            errors,
            self.config.error_threshold,
            self.config.error_delay(),
            self.config.error_backoff(),
        )
    }
}

impl Drop for UdpListener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Wait until the receive loop has let go of `socket`, closing its port.
async fn release(socket: Arc<UdpSocket>, limit: Duration) {
    let deadline = Instant::now() + limit;
    while Arc::strong_count(&socket) > 1 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn receive_loop(weak: Weak<UdpListener>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut silence = match weak.upgrade() {
        Some(listener) => SilenceTracker::new(listener.config.silence_window(), Instant::now()),
        None => return,
    };

    loop {
        let Some(listener) = weak.upgrade() else {
            break;
        };
        let cancel = listener.cancel.clone();

        // Armed under the gate so a rebind between here and the receive is not missed.
        let mut replaced = Box::pin(listener.replaced.notified());
        let socket = tokio::select! {
            _ = cancel.cancelled() => break,
            gate = listener.socket.lock() => {
                replaced.as_mut().enable();
                gate.clone()
            }
        };

        let Some(socket) = socket else {
            // Previous rebind failed; keep trying at the long backoff.
            drop(replaced);
            listener.spawn_rebind("no bound socket");
            let delay = listener.config.error_backoff();
            drop(listener);
            if !pause(&cancel, delay).await {
                break;
            }
            continue;
        };

        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut replaced => continue,
            r = tokio::time::timeout(listener.config.receive_timeout(), socket.recv_from(&mut buf)) => r,
        };
        drop(socket);
        drop(replaced);

        match received {
            Err(_elapsed) => {
                if let Some(silent_for) = silence.on_timeout(Instant::now()) {
                    warn!(
                        silent_secs = silent_for.as_secs(),
                        port = ?listener.bound_port(),
                        "No UDP packets received"
                    );
                }
            }
            Ok(Ok((len, from))) => {
                silence.on_packet(Instant::now());
                listener.on_datagram(&buf[..len], from);
            }
            Ok(Err(e)) => {
                let delay = listener.on_receive_error(&e);
                drop(listener);
                if !pause(&cancel, delay).await {
                    break;
                }
            }
        }
    }
    debug!("UDP receive loop stopped");
}

async fn watch_network(weak: Weak<UdpListener>, mut changes: broadcast::Receiver<NetworkChange>) {
    let Some(cancel) = weak.upgrade().map(|l| l.cancel.clone()) else {
        return;
    };

    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = changes.recv() => change,
        };
        let Some(listener) = weak.upgrade() else {
            break;
        };

        match change {
            Ok(NetworkChange::Up) => {
                if listener.healthy.load(Ordering::SeqCst) {
                    debug!("Network restored, socket already healthy");
                } else {
                    info!("Network restored, rebinding");
                    listener.spawn_rebind("network restored");
                }
            }
            Ok(NetworkChange::Down) => {
                warn!("Network connectivity lost");
                listener.healthy.store(false, Ordering::SeqCst);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Missed network notifications");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Network watcher stopped");
}
