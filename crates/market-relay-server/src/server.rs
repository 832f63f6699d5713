/*
[INPUT]:  RelayServerConfig + shutdown token
[OUTPUT]: Bound WebSocket listener spawning one session task per subscriber
[POS]:    Server layer - accept loop and hub ownership
[UPDATE]: When changing listener setup or session spawning
*/

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayServerConfig;
use crate::hub::RelayHub;
use crate::session::run_session;

/// Relay server with a bound listener and a running hub
#[derive(Debug)]
pub struct RelayServer {
    listener: TcpListener,
    hub: RelayHub,
    hub_handle: JoinHandle<()>,
    welcome_message: String,
    shutdown: CancellationToken,
}

impl RelayServer {
    /// Bind the listener and start the hub
    pub async fn bind(config: RelayServerConfig, shutdown: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .with_context(|| format!("bind relay listener on {}", config.listen_addr))?;
        let (hub, hub_handle) = RelayHub::spawn(config.upstream, shutdown.clone());

        Ok(Self {
            listener,
            hub,
            hub_handle,
            welcome_message: config.welcome_message,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().context("read listener address")
    }

    pub fn hub(&self) -> RelayHub {
        self.hub.clone()
    }

    /// Accept subscribers until the shutdown token fires, then stop the hub
    pub async fn run(self) -> Result<()> {
        let local_addr = self.local_addr()?;
        info!(%local_addr, "relay listening");

        serve(
            self.listener,
            self.hub.clone(),
            self.welcome_message,
            self.shutdown.clone(),
        )
        .await;

        self.hub.shutdown();
        if let Err(err) = self.hub_handle.await {
            warn!(error = %err, "relay hub task failed");
        }
        info!("relay stopped");
        Ok(())
    }
}

/// Accept loop; each connection runs as its own session task
pub async fn serve(listener: TcpListener, hub: RelayHub, welcome_message: String, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("accept loop stopping");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let hub = hub.clone();
                        let welcome_message = welcome_message.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(err) = run_session(stream, peer, hub, welcome_message, shutdown).await {
                                debug!(%peer, error = %err, "session failed");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to accept connection");
                    }
                }
            }
        }
    }
}
