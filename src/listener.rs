//! Accept loop: binds the listening socket, spawns one `ConnectionHandler`
//! per accepted connection, and drains in-flight handlers on shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use crate::connection::ConnectionHandler;
use crate::shutdown::Shutdown;
use crate::state::ProxyState;

pub struct ProxyListener {
    listener: TcpListener,
    state: Arc<ProxyState>,
}

impl ProxyListener {
    pub async fn bind(host: &str, port: u16, state: Arc<ProxyState>) -> Result<Self> {
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding proxy listener on {addr}"))?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown_rx` observes a cancellation,
    /// spawning a handler per connection. Each handler is tracked by
    /// `shutdown` so the caller can drain them afterward.
    pub async fn run(self, shutdown: Shutdown, mut shutdown_rx: watch::Receiver<bool>) {
        info!(addr = ?self.local_addr().ok(), "proxy listening");
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, peer_addr)) => {
                            let state = self.state.clone();
                            let guard = shutdown.track();
                            tokio::spawn(async move {
                                let handler = ConnectionHandler::new(state);
                                handler.run(socket, peer_addr).await;
                                drop(guard);
                            });
                        }
                        Err(e) => {
                            error!("accept failed: {e}");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("listener shutting down, no longer accepting connections");
                        break;
                    }
                }
            }
        }
    }
}

/// Runs the listener to completion, then waits up to `grace` for in-flight
/// handlers to drain before returning.
pub async fn serve(listener: ProxyListener, shutdown: Shutdown, grace: Duration) {
    let shutdown_rx = shutdown.subscribe();
    let drain_shutdown = shutdown.clone();
    listener.run(shutdown, shutdown_rx).await;
    drain_shutdown.drain(grace).await;
}
