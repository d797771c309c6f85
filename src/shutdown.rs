//! Graceful shutdown coordination shared by the listener and every handler.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

/// Broadcasts a cancellation signal and tracks in-flight handlers so the
/// listener can wait for them to drain before the process exits.
#[derive(Clone)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
    in_flight: Arc<Semaphore>,
}

/// Permit held by a running `ConnectionHandler`; dropping it signals
/// completion to `Shutdown::drain`.
pub struct HandlerGuard(tokio::sync::OwnedSemaphorePermit);

impl Shutdown {
    /// Semaphore capacity this large is never exhausted by real concurrency;
    /// it exists purely so `drain` can observe "how many permits are out".
    const MAX_IN_FLIGHT: u32 = 1 << 20;

    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                tx,
                in_flight: Arc::new(Semaphore::new(Self::MAX_IN_FLIGHT as usize)),
            },
            rx,
        )
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Registers one in-flight handler; hold the guard for the handler's
    /// lifetime.
    pub fn track(&self) -> HandlerGuard {
        HandlerGuard(
            self.in_flight
                .clone()
                .try_acquire_owned()
                .expect("in-flight permit pool exhausted"),
        )
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    /// Waits for all tracked handlers to finish, up to `grace`. Returns once
    /// the grace period elapses even if handlers are still running.
    pub async fn drain(&self, grace: Duration) {
        let wait_all = async {
            let _ = self
                .in_flight
                .clone()
                .acquire_many_owned(Self::MAX_IN_FLIGHT)
                .await;
        };
        tokio::select! {
            _ = wait_all => info!("all handlers drained"),
            _ = tokio::time::sleep(grace) => warn!("shutdown grace period elapsed with handlers still running"),
        }
    }
}

/// Installs a Ctrl-C listener that triggers `shutdown` once.
pub fn spawn_ctrl_c_trigger(shutdown: Shutdown) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown.trigger();
        }
    });
}
