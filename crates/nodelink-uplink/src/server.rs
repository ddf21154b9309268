//! TCP acceptor for uplink clients.

use crate::error::UplinkResult;
use crate::relay::{RelaySession, UplinkRelayService};
use crate::server_session::ServerSideUplinkSession;

use dashmap::DashMap;
use nodelink_types::config::UplinkConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Accepts connections and runs one [`ServerSideUplinkSession`] per client
/// on a shared relay.
pub struct UplinkServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    relay: Arc<UplinkRelayService>,
    config: Arc<UplinkConfig>,
    sessions: Arc<DashMap<String, Arc<ServerSideUplinkSession>>>,
}

impl UplinkServer {
    pub async fn bind(
        addr: &str,
        relay: Arc<UplinkRelayService>,
        config: UplinkConfig,
    ) -> UplinkResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Uplink: relay listening");
        Ok(Self {
            listener,
            local_addr,
            relay,
            config: Arc::new(config),
            sessions: Arc::new(DashMap::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn relay(&self) -> &Arc<UplinkRelayService> {
        &self.relay
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Accept clients until `shutdown` turns true, then close all sessions.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(client = %addr, "Uplink: accepted connection");
                        let _ = stream.set_nodelay(true);
                        self.spawn_session(stream, addr.to_string());
                    }
                    Err(e) => {
                        error!(error = %e, "Uplink: accept error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
                _ = async { shutdown.wait_for(|stop| *stop).await.map(|_| ()) } => break,
            }
        }

        info!(sessions = self.sessions.len(), "Uplink: relay shutting down");
        let sessions: Vec<_> = self.sessions.iter().map(|e| Arc::clone(e.value())).collect();
        for session in sessions {
            session.close().await;
        }
    }

    fn spawn_session(&self, stream: tokio::net::TcpStream, client_info: String) {
        let (session, task) = ServerSideUplinkSession::accept(
            stream,
            client_info,
            None,
            Arc::clone(&self.relay),
            Arc::clone(&self.config),
        );
        let session_id = session.session_id().to_string();
        self.sessions.insert(session_id.clone(), session);
        let sessions = Arc::clone(&self.sessions);
        tokio::spawn(async move {
            let _ = task.await;
            sessions.remove(&session_id);
        });
    }
}
