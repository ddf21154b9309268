//! Message channel service: owns transports, contact points and channels.
//!
//! The service is the single place where channels come into existence:
//! outgoing ones through [`MessageChannelService::connect`], inbound ones
//! through the contact points it started. Every established channel is
//! checked against the [`NodeRegistry`] before it becomes usable, and
//! lifecycle listeners (routing table, health checker, connection setups)
//! learn about outgoing channels as they come and go.
//!
//! Requests arriving on any channel are answered here for `health_check`
//! and otherwise passed to the installed request handler, normally the
//! routing service.

use crate::channel::{
    BrokenMessageChannelListener, ChannelClosedListener, ChannelId, ChannelParams,
    MessageChannel, RawRequestHandler,
};
use crate::contact_point::{ConnectionFilter, MessageChannelEndpointHandler, ServerContactPoint};
use crate::error::{WireError, WireResult};
use crate::handshake::{self, HandshakeSettings};
use crate::registry::{NodeEntry, NodeRegistry, RegistrationOutcome};
use crate::transport::{NetworkContactPoint, NetworkTransportProvider};

use async_trait::async_trait;
use dashmap::DashMap;
use nodelink_types::message::message_type;
use nodelink_types::{
    InitialNodeInformation, InstanceNodeSessionId, NetworkRequest, NetworkResponse, ResultCode,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tracing::{debug, info, warn};

/// Observer of outgoing channels.
pub trait MessageChannelLifecycleListener: Send + Sync {
    fn on_outgoing_channel_established(&self, channel: &Arc<MessageChannel>);

    fn on_outgoing_channel_terminated(&self, channel: &Arc<MessageChannel>);
}

pub struct MessageChannelService {
    self_ref: Weak<MessageChannelService>,
    settings: HandshakeSettings,
    registry: NodeRegistry,
    transports: DashMap<String, Arc<dyn NetworkTransportProvider>>,
    /// Every established channel, keyed by local channel id.
    channels: DashMap<ChannelId, Arc<MessageChannel>>,
    /// Channel used for requests to a directly connected node.
    outgoing: DashMap<InstanceNodeSessionId, ChannelId>,
    listeners: RwLock<Vec<Arc<dyn MessageChannelLifecycleListener>>>,
    request_handler: RwLock<Option<Arc<dyn RawRequestHandler>>>,
    contact_points: Mutex<Vec<Arc<ServerContactPoint>>>,
    channel_counter: AtomicU64,
}

impl MessageChannelService {
    pub fn new(settings: HandshakeSettings, registry: NodeRegistry) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            settings,
            registry,
            transports: DashMap::new(),
            channels: DashMap::new(),
            outgoing: DashMap::new(),
            listeners: RwLock::new(Vec::new()),
            request_handler: RwLock::new(None),
            contact_points: Mutex::new(Vec::new()),
            channel_counter: AtomicU64::new(0),
        })
    }

    pub fn local_node(&self) -> &InitialNodeInformation {
        &self.settings.local
    }

    pub fn local_node_id(&self) -> &InstanceNodeSessionId {
        &self.settings.local.node_id
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn add_transport(&self, transport: Arc<dyn NetworkTransportProvider>) {
        debug!(transport = transport.transport_id(), "Channels: transport registered");
        self.transports
            .insert(transport.transport_id().to_string(), transport);
    }

    fn transport_for(
        &self,
        contact_point: &NetworkContactPoint,
    ) -> WireResult<Arc<dyn NetworkTransportProvider>> {
        self.transports
            .get(&contact_point.transport_id)
            .map(|t| Arc::clone(t.value()))
            .ok_or_else(|| WireError::UnknownTransport(contact_point.transport_id.clone()))
    }

    pub fn add_lifecycle_listener(&self, listener: Arc<dyn MessageChannelLifecycleListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Install the handler for every request that is not a health check.
    pub fn set_request_handler(&self, handler: Arc<dyn RawRequestHandler>) {
        *self
            .request_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Bind a contact point and start accepting connections on it.
    pub async fn add_server_contact_point(
        &self,
        contact_point: NetworkContactPoint,
        filter: Option<Arc<dyn ConnectionFilter>>,
    ) -> WireResult<Arc<ServerContactPoint>> {
        let transport = self.transport_for(&contact_point)?;
        let scp = Arc::new(ServerContactPoint::new(
            contact_point,
            transport,
            Arc::new(ServiceLink(self.self_ref.clone())),
            self.settings.clone(),
            filter,
        ));
        scp.start().await?;
        self.contact_points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&scp));
        Ok(scp)
    }

    pub fn server_contact_points(&self) -> Vec<Arc<ServerContactPoint>> {
        self.contact_points
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_channel_id(&self) -> ChannelId {
        let n = self.channel_counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.settings.local.node_id.session_part, n)
    }

    /// Connect, handshake and register an outgoing channel.
    ///
    /// With `allow_duplex` the remote side may use the same connection for
    /// its own requests to us.
    pub async fn connect(
        &self,
        contact_point: &NetworkContactPoint,
        allow_duplex: bool,
    ) -> WireResult<Arc<MessageChannel>> {
        let transport = self.transport_for(contact_point)?;
        info!(contact_point = %contact_point, "Channels: connecting");
        let mut stream = transport.connect(contact_point).await?;

        let channel_id = self.next_channel_id();
        let ack = handshake::initiate(&mut stream, &self.settings, &channel_id, allow_duplex).await?;
        if ack.node.node_id == self.settings.local.node_id {
            return Err(WireError::HandshakeFailed(format!(
                "{contact_point} leads back to the local node"
            )));
        }

        let channel = MessageChannel::spawn(
            stream,
            ChannelParams {
                channel_id,
                mirror_channel_id: ack.channel_id,
                remote: ack.node,
                initiated_by_remote: false,
            },
            self.link_handler(),
        );
        self.register_channel(&channel, true)?;
        info!(
            remote = %channel.remote_node(),
            channel = %channel.channel_id(),
            mirror = %channel.mirror_channel_id(),
            "Channels: outgoing channel established"
        );
        Ok(channel)
    }

    fn link_handler(&self) -> Arc<dyn RawRequestHandler> {
        Arc::new(ServiceLink(self.self_ref.clone()))
    }

    /// Admit an established channel. `outgoing` makes it the channel used
    /// for our own requests to its remote node.
    fn register_channel(&self, channel: &Arc<MessageChannel>, outgoing: bool) -> WireResult<()> {
        let remote = channel.remote_node().clone();
        match self
            .registry
            .register(NodeEntry::new(remote.clone(), channel.channel_id()))
        {
            RegistrationOutcome::Rejected { existing } => {
                channel.close();
                return Err(WireError::NodeIdCollision(format!(
                    "{} is already connected as {}",
                    remote.node_id,
                    existing.node_id()
                )));
            }
            RegistrationOutcome::Replaced { previous } => {
                self.close_channels_to(previous.node_id());
            }
            RegistrationOutcome::Added | RegistrationOutcome::Updated => {}
        }

        let link = Arc::new(ServiceLink(self.self_ref.clone()));
        channel.set_broken_listener(link.clone());
        channel.set_closed_listener(link);
        self.channels
            .insert(channel.channel_id().to_string(), Arc::clone(channel));

        if !channel.is_established() {
            // lost before the listeners were installed
            self.on_channel_terminated(channel);
            return Err(WireError::ChannelNotEstablished(
                channel.channel_id().to_string(),
            ));
        }

        if outgoing {
            let replaced = self
                .outgoing
                .insert(remote.node_id.clone(), channel.channel_id().to_string());
            if let Some(old_id) = replaced {
                if let Some(old) = self.channels.get(&old_id).map(|c| Arc::clone(c.value())) {
                    debug!(channel = %old_id, "Channels: superseded outgoing channel");
                    old.close();
                }
            }
            self.notify(|l| l.on_outgoing_channel_established(channel));
        }
        Ok(())
    }

    fn close_channels_to(&self, node_id: &InstanceNodeSessionId) {
        let stale: Vec<Arc<MessageChannel>> = self
            .channels
            .iter()
            .filter(|c| &c.value().remote_node().node_id == node_id)
            .map(|c| Arc::clone(c.value()))
            .collect();
        for channel in stale {
            info!(
                remote = %node_id,
                channel = %channel.channel_id(),
                "Channels: closing channel of replaced session"
            );
            channel.close();
        }
    }

    fn notify(&self, f: impl Fn(&Arc<dyn MessageChannelLifecycleListener>)) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in &listeners {
            f(listener);
        }
    }

    fn on_channel_terminated(&self, channel: &Arc<MessageChannel>) {
        if self.channels.remove(channel.channel_id()).is_none() {
            return;
        }
        let remote = &channel.remote_node().node_id;
        if let Some(entry) = self.registry.get(&remote.instance_id) {
            if entry.channel_id == channel.channel_id() {
                self.registry.mark_disconnected(remote);
            }
        }
        let was_outgoing = self
            .outgoing
            .remove_if(remote, |_, id| id == channel.channel_id())
            .is_some();
        if was_outgoing {
            self.notify(|l| l.on_outgoing_channel_terminated(channel));
        }
        debug!(
            channel = %channel.channel_id(),
            reason = ?channel.close_reason(),
            "Channels: channel removed"
        );
    }

    /// The established channel used to send requests to `node`.
    pub fn outgoing_channel_to(&self, node: &InstanceNodeSessionId) -> Option<Arc<MessageChannel>> {
        let channel_id = self.outgoing.get(node)?.value().clone();
        self.channels
            .get(&channel_id)
            .map(|c| Arc::clone(c.value()))
            .filter(|c| c.is_established())
    }

    /// Nodes with an established outgoing channel.
    pub fn directly_connected_nodes(&self) -> Vec<InstanceNodeSessionId> {
        self.outgoing.iter().map(|e| e.key().clone()).collect()
    }

    pub fn channel(&self, channel_id: &str) -> Option<Arc<MessageChannel>> {
        self.channels.get(channel_id).map(|c| Arc::clone(c.value()))
    }

    pub fn established_channels(&self) -> Vec<Arc<MessageChannel>> {
        self.channels.iter().map(|c| Arc::clone(c.value())).collect()
    }

    /// Gracefully close an outgoing channel (and its mirror).
    pub fn close_outgoing_channel(&self, channel: &Arc<MessageChannel>) {
        channel.close();
    }

    /// Stop all contact points and close every channel.
    pub fn close_all(&self) {
        for scp in self.server_contact_points() {
            scp.shut_down();
        }
        for channel in self.established_channels() {
            channel.close();
        }
    }

    async fn handle_raw(&self, request: NetworkRequest, source: &Arc<MessageChannel>) -> NetworkResponse {
        if request.message_type == message_type::HEALTH_CHECK {
            return NetworkResponse::success(&request, request.body.clone());
        }
        let handler = self
            .request_handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(handler) => handler.handle_raw_request(request, source).await,
            None => NetworkResponse::failure(
                &request.request_id,
                ResultCode::NoMatchingHandler,
                "No request handler installed",
            ),
        }
    }
}

/// Weak back-reference handed to channels and contact points so that they
/// do not keep the service alive.
struct ServiceLink(Weak<MessageChannelService>);

#[async_trait]
impl RawRequestHandler for ServiceLink {
    async fn handle_raw_request(
        &self,
        request: NetworkRequest,
        source: &Arc<MessageChannel>,
    ) -> NetworkResponse {
        match self.0.upgrade() {
            Some(service) => service.handle_raw(request, source).await,
            None => NetworkResponse::failure(
                &request.request_id,
                ResultCode::ExceptionAtDestination,
                "Node is shutting down",
            ),
        }
    }
}

impl BrokenMessageChannelListener for ServiceLink {
    fn on_channel_broken(&self, channel: &Arc<MessageChannel>) {
        warn!(
            channel = %channel.channel_id(),
            remote = %channel.remote_node(),
            "Channels: channel broken"
        );
        if let Some(service) = self.0.upgrade() {
            service.on_channel_terminated(channel);
        }
    }
}

impl ChannelClosedListener for ServiceLink {
    fn on_channel_closed(&self, channel: &Arc<MessageChannel>, by_mirror: bool) {
        debug!(
            channel = %channel.channel_id(),
            by_mirror,
            "Channels: channel closed"
        );
        if let Some(service) = self.0.upgrade() {
            service.on_channel_terminated(channel);
        }
    }
}

impl MessageChannelEndpointHandler for ServiceLink {
    fn exchange_node_information(&self, remote: &InitialNodeInformation) -> Result<(), String> {
        let service = self.0.upgrade().ok_or("Node is shutting down")?;
        if remote.node_id == service.settings.local.node_id {
            return Err("Connection to self refused".into());
        }
        if !service.registry.would_accept(remote) {
            return Err(format!(
                "Another session of instance {} is already connected",
                remote.node_id.instance_id
            ));
        }
        Ok(())
    }

    fn allocate_channel_id(&self) -> ChannelId {
        match self.0.upgrade() {
            Some(service) => service.next_channel_id(),
            None => uuid::Uuid::new_v4().to_string(),
        }
    }

    fn request_handler(&self) -> Arc<dyn RawRequestHandler> {
        Arc::new(ServiceLink(self.0.clone()))
    }

    fn on_remote_initiated_channel_established(&self, channel: Arc<MessageChannel>, duplex: bool) {
        let Some(service) = self.0.upgrade() else {
            channel.close();
            return;
        };
        if let Err(e) = service.register_channel(&channel, duplex) {
            warn!(
                channel = %channel.channel_id(),
                error = %e,
                "Channels: inbound channel not admitted"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::KeepExistingSession;
    use crate::transport::{InProcessTransport, IN_PROCESS_TRANSPORT_ID};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        established: AtomicUsize,
        terminated: AtomicUsize,
    }

    impl MessageChannelLifecycleListener for Counter {
        fn on_outgoing_channel_established(&self, _channel: &Arc<MessageChannel>) {
            self.established.fetch_add(1, Ordering::SeqCst);
        }

        fn on_outgoing_channel_terminated(&self, _channel: &Arc<MessageChannel>) {
            self.terminated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn service(
        transport: &InProcessTransport,
        instance: &str,
        registry: NodeRegistry,
    ) -> Arc<MessageChannelService> {
        let settings = HandshakeSettings {
            local: InitialNodeInformation::new(InstanceNodeSessionId::generate(instance), instance),
            shared_secret: None,
            timeout: Duration::from_secs(2),
        };
        let service = MessageChannelService::new(settings, registry);
        service.add_transport(Arc::new(transport.clone()));
        service
    }

    async fn listen(service: &Arc<MessageChannelService>, name: &str) -> NetworkContactPoint {
        service
            .add_server_contact_point(NetworkContactPoint::new(IN_PROCESS_TRANSPORT_ID, name), None)
            .await
            .unwrap()
            .contact_point()
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_registers_duplex_channels() {
        let transport = InProcessTransport::new();
        let a = service(&transport, "a", NodeRegistry::default());
        let b = service(&transport, "b", NodeRegistry::default());
        let b_listener = Arc::new(Counter::default());
        b.add_lifecycle_listener(b_listener.clone());
        let cp = listen(&b, "b").await;

        let channel = a.connect(&cp, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let back = b.outgoing_channel_to(a.local_node_id()).unwrap();
        assert_eq!(back.mirror_channel_id(), channel.channel_id());
        assert_eq!(b_listener.established.load(Ordering::SeqCst), 1);

        let resp = channel
            .send_request(
                NetworkRequest::new(
                    message_type::HEALTH_CHECK,
                    b"token".to_vec(),
                    a.local_node_id().clone(),
                    b.local_node_id().clone(),
                ),
                Duration::from_secs(2),
            )
            .await;
        assert!(resp.is_success());
        assert_eq!(resp.body, b"token");
    }

    #[tokio::test]
    async fn test_non_duplex_inbound_channel_is_not_outgoing() {
        let transport = InProcessTransport::new();
        let a = service(&transport, "a", NodeRegistry::default());
        let b = service(&transport, "b", NodeRegistry::default());
        let cp = listen(&b, "b").await;
        a.connect(&cp, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b.outgoing_channel_to(a.local_node_id()).is_none());
        assert_eq!(b.established_channels().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_transport() {
        let transport = InProcessTransport::new();
        let a = service(&transport, "a", NodeRegistry::default());
        let err = a
            .connect(&NetworkContactPoint::new("carrier-pigeon", "x"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::UnknownTransport(_)));
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_mirror_close_terminates_both_outgoing_entries() {
        let transport = InProcessTransport::new();
        let a = service(&transport, "a", NodeRegistry::default());
        let b = service(&transport, "b", NodeRegistry::default());
        let a_listener = Arc::new(Counter::default());
        a.add_lifecycle_listener(a_listener.clone());
        let cp = listen(&b, "b").await;

        let channel = a.connect(&cp, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let back = b.outgoing_channel_to(a.local_node_id()).unwrap();
        back.close();
        tokio::time::timeout(Duration::from_secs(2), channel.closed())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(a.outgoing_channel_to(b.local_node_id()).is_none());
        assert_eq!(a_listener.terminated.load(Ordering::SeqCst), 1);
        assert_eq!(a.registry().connected_count(), 0);
    }

    #[tokio::test]
    async fn test_keep_existing_refuses_second_session() {
        let transport = InProcessTransport::new();
        let server = service(
            &transport,
            "server",
            NodeRegistry::new(Arc::new(KeepExistingSession)),
        );
        let cp = listen(&server, "server").await;
        let first = service(&transport, "twin", NodeRegistry::default());
        let second = service(&transport, "twin", NodeRegistry::default());

        first.connect(&cp, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = second.connect(&cp, true).await.unwrap_err();
        assert!(matches!(err, WireError::HandshakeRefused { .. }));
    }

    #[tokio::test]
    async fn test_prefer_newest_replaces_old_session_channels() {
        let transport = InProcessTransport::new();
        let server = service(&transport, "server", NodeRegistry::default());
        let cp = listen(&server, "server").await;
        let first = service(&transport, "twin", NodeRegistry::default());
        let second = service(&transport, "twin", NodeRegistry::default());

        let old = first.connect(&cp, true).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        second.connect(&cp, true).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), old.closed())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.outgoing_channel_to(second.local_node_id()).is_some());
        assert!(server.outgoing_channel_to(first.local_node_id()).is_none());
    }
}
