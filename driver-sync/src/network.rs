//! Network availability signal
//!
//! [`NetworkStatus`] is the single source the scheduler consults before a
//! sync attempt. It is fed either by the embedding application (which knows
//! the platform's connectivity state) or by [`spawn_reachability_monitor`].

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct NetworkStatus {
    tx: Arc<watch::Sender<bool>>,
}

impl NetworkStatus {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    pub fn online() -> Self {
        Self::new(true)
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the current connectivity. Returns `true` if it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });

        if changed {
            tracing::info!(online, "Network availability changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::online()
    }
}

/// Whether a TCP connection to `addr` can be opened within `timeout`
pub async fn is_reachable(addr: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Periodically check `addr` and feed the result into `status`.
///
/// Runs until the returned handle is aborted.
pub fn spawn_reachability_monitor(
    status: NetworkStatus,
    addr: String,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let online = is_reachable(&addr, timeout).await;
            tracing::trace!(addr = %addr, online, "Connectivity check");
            status.set_online(online);
        }
    })
}
