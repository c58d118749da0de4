//! Socket binding with same-port retry and forward port sweep.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use backon::Retryable;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::{ListenerConfig, ListenerError, Result};
use crate::utils::retry::bind_backoff;

/// Opens UDP sockets. Swappable so bind failures can be simulated.
#[async_trait]
pub trait SocketBinder: Send + Sync {
    async fn bind(&self, addr: SocketAddr) -> io::Result<UdpSocket>;
}

/// Binds real sockets through tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioBinder;

#[async_trait]
impl SocketBinder for TokioBinder {
    async fn bind(&self, addr: SocketAddr) -> io::Result<UdpSocket> {
        UdpSocket::bind(addr).await
    }
}

/// "Address in use" or "access denied": worth retrying or moving on.
pub fn is_bind_conflict(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
    )
}

/// Bind `preferred`, retrying conflicts on the same port, then sweep forward.
///
/// Any error other than a bind conflict fails immediately.
pub async fn bind_with_fallback(
    binder: &dyn SocketBinder,
    ip: IpAddr,
    preferred: u16,
    config: &ListenerConfig,
) -> Result<UdpSocket> {
    let addr = SocketAddr::new(ip, preferred);

    let first = (|| async { binder.bind(addr).await })
        .retry(bind_backoff(config.bind_attempts, config.bind_retry_delay()))
        .when(is_bind_conflict)
        .notify(|err: &io::Error, dur: Duration| {
            warn!(port = preferred, error = %err, delay = ?dur, "Preferred port busy, retrying");
        })
        .await;

    match first {
        Ok(socket) => return Ok(socket),
        Err(e) if is_bind_conflict(&e) => {
            info!(
                port = preferred,
                sweep = config.port_sweep,
                "Preferred port unavailable, sweeping forward"
            );
        }
        Err(source) => {
            return Err(ListenerError::Bind {
                port: preferred,
                source,
            })
        }
    }

    let mut last = preferred;
    for offset in 1..=config.port_sweep {
        let Some(port) = preferred.checked_add(offset) else {
            break;
        };
        last = port;
        match binder.bind(SocketAddr::new(ip, port)).await {
            Ok(socket) => {
                info!(preferred, port, "Bound fallback port");
                return Ok(socket);
            }
            Err(e) if is_bind_conflict(&e) => {
                debug!(port, error = %e, "Fallback port unavailable");
            }
            Err(source) => return Err(ListenerError::Bind { port, source }),
        }
    }

    Err(ListenerError::NoPortAvailable {
        first: preferred,
        last,
    })
}
