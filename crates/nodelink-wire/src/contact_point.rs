//! Server contact points: inbound connection acceptance.
//!
//! A [`ServerContactPoint`] binds one [`NetworkContactPoint`] through its
//! transport provider, runs the accept loop, and performs the server side
//! of the handshake for every accepted connection. The
//! [`MessageChannelEndpointHandler`] decides whether a remote node is
//! admitted and receives the resulting channel.

use crate::channel::{ChannelId, ChannelParams, MessageChannel, RawRequestHandler};
use crate::error::WireError;
use crate::handshake::{self, HandshakeSettings};
use crate::transport::{AcceptedConnection, NetworkContactPoint, NetworkTransportProvider};

use nodelink_types::{InitialNodeInformation, ResultCode};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Decides about a connection before any handshake bytes are read.
pub trait ConnectionFilter: Send + Sync {
    /// `peer` is `None` for transports without socket addresses.
    fn is_allowed(&self, peer: Option<&SocketAddr>) -> bool;
}

/// Exact-match list of allowed remote IPs. An empty list accepts everyone.
#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    allowed: HashSet<IpAddr>,
}

impl IpAllowList {
    pub fn new(allowed: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    /// Parse textual IPs; invalid entries are skipped with a warning.
    pub fn from_strings<S: AsRef<str>>(entries: &[S]) -> Self {
        let allowed = entries
            .iter()
            .filter_map(|entry| match entry.as_ref().trim().parse::<IpAddr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    warn!(entry = entry.as_ref(), "Filter: ignoring invalid IP allow-list entry");
                    None
                }
            })
            .collect();
        Self { allowed }
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }
}

impl ConnectionFilter for IpAllowList {
    fn is_allowed(&self, peer: Option<&SocketAddr>) -> bool {
        if self.allowed.is_empty() {
            return true;
        }
        match peer {
            Some(addr) => self.allowed.contains(&addr.ip()),
            // in-process connections never leave the process
            None => true,
        }
    }
}

/// Receiver of inbound channels, usually the channel service.
pub trait MessageChannelEndpointHandler: Send + Sync + 'static {
    /// Validate the remote node information. `Err(reason)` refuses the
    /// connection with that reason.
    fn exchange_node_information(&self, remote: &InitialNodeInformation) -> Result<(), String>;

    /// A fresh local channel id.
    fn allocate_channel_id(&self) -> ChannelId;

    /// Handler for requests arriving on inbound channels.
    fn request_handler(&self) -> Arc<dyn RawRequestHandler>;

    /// Called once the channel is running. `duplex` is true when the remote
    /// side asked us to use the connection for our own requests as well.
    fn on_remote_initiated_channel_established(&self, channel: Arc<MessageChannel>, duplex: bool);
}

struct AcceptContext {
    endpoint: Arc<dyn MessageChannelEndpointHandler>,
    settings: HandshakeSettings,
    filter: Option<Arc<dyn ConnectionFilter>>,
    accepting: Arc<AtomicBool>,
}

/// A listening endpoint for one contact point.
pub struct ServerContactPoint {
    requested: NetworkContactPoint,
    bound: RwLock<Option<NetworkContactPoint>>,
    transport: Arc<dyn NetworkTransportProvider>,
    context: Arc<AcceptContext>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerContactPoint {
    pub fn new(
        contact_point: NetworkContactPoint,
        transport: Arc<dyn NetworkTransportProvider>,
        endpoint: Arc<dyn MessageChannelEndpointHandler>,
        settings: HandshakeSettings,
        filter: Option<Arc<dyn ConnectionFilter>>,
    ) -> Self {
        Self {
            requested: contact_point,
            bound: RwLock::new(None),
            transport,
            context: Arc::new(AcceptContext {
                endpoint,
                settings,
                filter,
                accepting: Arc::new(AtomicBool::new(false)),
            }),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind and start accepting. Returns the contact point actually bound.
    pub async fn start(&self) -> Result<NetworkContactPoint, WireError> {
        if let Some(bound) = self.contact_point() {
            if self.is_accepting_messages() {
                return Ok(bound);
            }
        }
        let listener = self.transport.bind(&self.requested).await?;
        let bound = listener.local_contact_point();
        *self.bound.write().unwrap_or_else(|e| e.into_inner()) = Some(bound.clone());
        self.context.accepting.store(true, Ordering::SeqCst);

        let context = Arc::clone(&self.context);
        let task = tokio::spawn(accept_loop(listener, context));
        if let Some(old) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task)
        {
            old.abort();
        }
        info!(contact_point = %bound, "Contact point: accepting connections");
        Ok(bound)
    }

    /// Stop accepting new connections. Established channels stay open.
    pub fn shut_down(&self) {
        self.context.accepting.store(false, Ordering::SeqCst);
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
            info!(contact_point = %self.requested, "Contact point: shut down");
        }
    }

    pub fn is_accepting_messages(&self) -> bool {
        self.context.accepting.load(Ordering::SeqCst)
    }

    /// The bound contact point, once started.
    pub fn contact_point(&self) -> Option<NetworkContactPoint> {
        self.bound.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Drop for ServerContactPoint {
    fn drop(&mut self) {
        self.shut_down();
    }
}

async fn accept_loop(mut listener: Box<dyn crate::transport::TransportListener>, context: Arc<AcceptContext>) {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                if !context.accepting.load(Ordering::SeqCst) {
                    debug!(origin = %conn.origin, "Contact point: dropping connection while shut down");
                    continue;
                }
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    let origin = conn.origin.clone();
                    if let Err(e) = handle_inbound(conn, &context).await {
                        debug!(origin = %origin, error = %e, "Contact point: inbound connection ended");
                    }
                });
            }
            Err(WireError::ConnectionClosed) => {
                debug!("Contact point: listener closed");
                return;
            }
            Err(e) => {
                error!(error = %e, "Contact point: accept error");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}

async fn handle_inbound(conn: AcceptedConnection, context: &AcceptContext) -> Result<(), WireError> {
    let AcceptedConnection {
        mut stream,
        peer_addr,
        origin,
    } = conn;

    if let Some(filter) = &context.filter {
        if !filter.is_allowed(peer_addr.as_ref()) {
            warn!(origin = %origin, "Contact point: connection rejected by filter");
            return Err(WireError::ConnectionRejected(origin));
        }
    }

    let hs = handshake::receive(&mut stream, &context.settings, &origin).await?;

    if let Err(reason) = context.endpoint.exchange_node_information(&hs.node) {
        warn!(origin = %origin, remote = %hs.node, reason = %reason, "Contact point: refusing node");
        handshake::refuse(&mut stream, ResultCode::HandshakeRefused, &reason).await?;
        return Err(WireError::ConnectionRejected(reason));
    }

    let channel_id = context.endpoint.allocate_channel_id();
    handshake::acknowledge(&mut stream, &context.settings, &channel_id).await?;

    let channel = MessageChannel::spawn(
        stream,
        ChannelParams {
            channel_id,
            mirror_channel_id: hs.channel_id,
            remote: hs.node,
            initiated_by_remote: true,
        },
        context.endpoint.request_handler(),
    );
    info!(
        origin = %origin,
        remote = %channel.remote_node(),
        channel = %channel.channel_id(),
        "Contact point: inbound channel established"
    );
    context
        .endpoint
        .on_remote_initiated_channel_established(channel, hs.duplex);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        InProcessTransport, TcpTransport, IN_PROCESS_TRANSPORT_ID, TCP_TRANSPORT_ID,
    };
    use async_trait::async_trait;
    use nodelink_types::{InstanceNodeSessionId, NetworkRequest, NetworkResponse};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    struct Acceptor {
        refuse: bool,
        counter: AtomicUsize,
        exchanges: AtomicUsize,
        channels: Mutex<Vec<Arc<MessageChannel>>>,
    }

    struct Nothing;

    #[async_trait]
    impl RawRequestHandler for Nothing {
        async fn handle_raw_request(
            &self,
            request: NetworkRequest,
            _source: &Arc<MessageChannel>,
        ) -> NetworkResponse {
            NetworkResponse::success(&request, Vec::new())
        }
    }

    impl MessageChannelEndpointHandler for Acceptor {
        fn exchange_node_information(&self, _remote: &InitialNodeInformation) -> Result<(), String> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                Err("not welcome".into())
            } else {
                Ok(())
            }
        }

        fn allocate_channel_id(&self) -> ChannelId {
            format!("srv-{}", self.counter.fetch_add(1, Ordering::SeqCst))
        }

        fn request_handler(&self) -> Arc<dyn RawRequestHandler> {
            Arc::new(Nothing)
        }

        fn on_remote_initiated_channel_established(&self, channel: Arc<MessageChannel>, _duplex: bool) {
            self.channels.lock().unwrap().push(channel);
        }
    }

    fn settings(name: &str) -> HandshakeSettings {
        HandshakeSettings {
            local: InitialNodeInformation::new(InstanceNodeSessionId::new(name, "1"), name),
            shared_secret: None,
            timeout: Duration::from_secs(2),
        }
    }

    fn acceptor(refuse: bool) -> Arc<Acceptor> {
        Arc::new(Acceptor {
            refuse,
            counter: AtomicUsize::new(0),
            exchanges: AtomicUsize::new(0),
            channels: Mutex::new(Vec::new()),
        })
    }

    fn server(transport: &InProcessTransport, refuse: bool) -> (ServerContactPoint, Arc<Acceptor>) {
        let acceptor = acceptor(refuse);
        let scp = ServerContactPoint::new(
            NetworkContactPoint::new(IN_PROCESS_TRANSPORT_ID, "server"),
            Arc::new(transport.clone()),
            acceptor.clone(),
            settings("server"),
            None,
        );
        (scp, acceptor)
    }

    #[test]
    fn test_ip_allow_list() {
        let list = IpAllowList::from_strings(&["127.0.0.1", "not-an-ip"]);
        let local: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let other: SocketAddr = "10.1.2.3:5000".parse().unwrap();
        assert!(list.is_allowed(Some(&local)));
        assert!(!list.is_allowed(Some(&other)));
        assert!(list.is_allowed(None));
        assert!(IpAllowList::default().is_allowed(Some(&other)));
    }

    #[tokio::test]
    async fn test_start_and_shut_down_toggle_accepting() {
        let transport = InProcessTransport::new();
        let (scp, _acceptor) = server(&transport, false);
        assert!(!scp.is_accepting_messages());
        scp.start().await.unwrap();
        assert!(scp.is_accepting_messages());
        scp.shut_down();
        assert!(!scp.is_accepting_messages());
    }

    #[tokio::test]
    async fn test_accepts_handshake_and_creates_channel() {
        let transport = InProcessTransport::new();
        let (scp, acceptor) = server(&transport, false);
        let cp = scp.start().await.unwrap();

        let mut stream = transport.connect(&cp).await.unwrap();
        let ack = handshake::initiate(&mut stream, &settings("client"), "cli-0", true)
            .await
            .unwrap();
        assert_eq!(ack.channel_id, "srv-0");

        tokio::time::sleep(Duration::from_millis(50)).await;
        let channels = acceptor.channels.lock().unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].mirror_channel_id(), "cli-0");
        assert!(channels[0].initiated_by_remote());
    }

    #[tokio::test]
    async fn test_endpoint_refusal_reaches_client() {
        let transport = InProcessTransport::new();
        let (scp, acceptor) = server(&transport, true);
        let cp = scp.start().await.unwrap();

        let mut stream = transport.connect(&cp).await.unwrap();
        let err = handshake::initiate(&mut stream, &settings("client"), "cli-0", false)
            .await
            .unwrap_err();
        match err {
            WireError::HandshakeRefused { code, reason } => {
                assert_eq!(code, ResultCode::HandshakeRefused);
                assert_eq!(reason, "not welcome");
            }
            other => panic!("Expected refusal, got {other:?}"),
        }
        assert!(acceptor.channels.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_filtered_peer_is_dropped_before_handshake() {
        let acceptor = acceptor(false);
        let only_remote: Arc<dyn ConnectionFilter> =
            Arc::new(IpAllowList::from_strings(&["10.9.9.9"]));
        let scp = ServerContactPoint::new(
            NetworkContactPoint::new(TCP_TRANSPORT_ID, "127.0.0.1:0"),
            Arc::new(TcpTransport),
            acceptor.clone(),
            settings("server"),
            Some(only_remote),
        );
        let cp = scp.start().await.unwrap();

        let mut stream = TcpTransport.connect(&cp).await.unwrap();
        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .unwrap();
        // closed without a single byte: no handshake answer, no refusal frame
        assert!(matches!(read, Ok(0) | Err(_)), "{read:?}");

        assert_eq!(acceptor.exchanges.load(Ordering::SeqCst), 0);
        assert!(acceptor.channels.lock().unwrap().is_empty());
        assert!(scp.is_accepting_messages());
    }
}
