//! The forwarding server: accepts authenticated shim connections and replays
//! their requests against a token provider.

pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod provider;
pub mod provision;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rsc_core::codec::DEFAULT_MAX_FRAME_LEN;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

pub use auth::ClientRegistry;
use connection::Service;
use dispatch::Dispatcher;
use provider::{ProviderGate, TokenProvider};
use state::SharedState;

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Server {
    listener: TcpListener,
    service: Arc<Service>,
    shared: Arc<SharedState>,
}

impl Server {
    pub async fn bind(
        addr: &str,
        tls: rustls::ServerConfig,
        registry: ClientRegistry,
        provider: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let gate = Arc::new(ProviderGate::new(provider));
        if gate.serialized() {
            info!("provider calls are serialized");
        }
        let shared = Arc::new(SharedState::default());
        let service = Arc::new(Service {
            acceptor: TlsAcceptor::from(Arc::new(tls)),
            registry: Arc::new(registry),
            dispatcher: Dispatcher::new(gate, shared.clone()),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        });
        Ok(Self {
            listener,
            service,
            shared,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shared(&self) -> Arc<SharedState> {
        self.shared.clone()
    }

    /// Serves until `shutdown` resolves. Open connections are dropped on
    /// shutdown.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, clients = self.service.registry.len(), "listening");
        tokio::pin!(shutdown);
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp, peer)) => {
                        connections.spawn(connection::serve(self.service.clone(), tcp, peer));
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        info!(open = connections.len(), "shutting down");
        connections.shutdown().await;
        Ok(())
    }
}
