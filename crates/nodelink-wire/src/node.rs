//! Node runtime: assembles the communication stack from configuration.

use crate::channel_service::MessageChannelService;
use crate::connection_setup::{
    ConnectionSetup, ConnectionSetupService, ConnectionSetupState, RetryPolicy,
};
use crate::contact_point::{ConnectionFilter, IpAllowList};
use crate::error::{WireError, WireResult};
use crate::handshake::HandshakeSettings;
use crate::health::ChannelHealthChecker;
use crate::registry::{KeepExistingSession, NodeIdCollisionPolicy, NodeRegistry, PreferNewestSession};
use crate::routing::{RoutingService, RoutingTable};
use crate::rpc::{RpcService, ServiceInstance};
use crate::transport::{NetworkContactPoint, NetworkTransportProvider, TcpTransport};

use nodelink_types::config::{CollisionPolicyKind, NodeLinkConfig};
use nodelink_types::{InitialNodeInformation, InstanceNodeSessionId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct NodeRuntime {
    config: NodeLinkConfig,
    channels: Arc<MessageChannelService>,
    routing_table: Arc<RoutingTable>,
    routing: Arc<RoutingService>,
    rpc: Arc<RpcService>,
    setups: ConnectionSetupService,
}

fn collision_policy(kind: CollisionPolicyKind) -> Arc<dyn NodeIdCollisionPolicy> {
    match kind {
        CollisionPolicyKind::PreferNewest => Arc::new(PreferNewestSession),
        CollisionPolicyKind::KeepExisting => Arc::new(KeepExistingSession),
    }
}

impl NodeRuntime {
    /// Build a node with the TCP transport.
    pub fn new(config: NodeLinkConfig) -> WireResult<Self> {
        Self::with_transports(config, vec![Arc::new(TcpTransport)])
    }

    /// Build a node with the given transports. Nothing is bound or
    /// connected until [`start`](Self::start).
    pub fn with_transports(
        config: NodeLinkConfig,
        transports: Vec<Arc<dyn NetworkTransportProvider>>,
    ) -> WireResult<Self> {
        let local = InitialNodeInformation::new(
            InstanceNodeSessionId::generate(config.node.instance_id.clone()),
            config.node.display_name.clone(),
        )
        .with_relay(config.node.is_relay);

        let settings = HandshakeSettings {
            local: local.clone(),
            shared_secret: config.node.shared_secret.clone(),
            timeout: Duration::from_millis(config.node.handshake_timeout_ms),
        };
        let registry = NodeRegistry::new(collision_policy(config.routing.collision_policy));
        let channels = MessageChannelService::new(settings, registry);
        for transport in transports {
            channels.add_transport(transport);
        }

        let routing_table = RoutingTable::new();
        for route in &config.routing.static_routes {
            let destination: InstanceNodeSessionId = route.destination.parse()?;
            let via: InstanceNodeSessionId = route.via.parse()?;
            routing_table.set_route(destination, via);
        }
        channels.add_lifecycle_listener(Arc::clone(&routing_table) as _);
        channels.add_lifecycle_listener(
            ChannelHealthChecker::new(local.node_id.clone(), config.health.clone()) as _,
        );

        let routing = RoutingService::new(
            Arc::clone(&channels),
            Arc::clone(&routing_table) as _,
            Duration::from_millis(config.node.request_timeout_ms),
            Duration::from_millis(config.node.forwarding_timeout_ms),
        );
        channels.set_request_handler(Arc::clone(&routing) as _);

        let rpc = RpcService::new(Arc::clone(&routing), &config.rpc);
        let setups = ConnectionSetupService::new(Arc::clone(&channels));

        info!(
            node = %local.node_id,
            name = %local.display_name,
            relay = local.is_relay,
            collision_policy = channels.registry().policy_name(),
            "Node: created"
        );
        Ok(Self {
            config,
            channels,
            routing_table,
            routing,
            rpc,
            setups,
        })
    }

    /// Bind the configured contact points, start background jobs and the
    /// auto-start connections. Returns the bound contact points.
    pub async fn start(&self) -> WireResult<Vec<NetworkContactPoint>> {
        let allow_list = IpAllowList::from_strings(&self.config.node.allowed_ips);
        let filter: Option<Arc<dyn ConnectionFilter>> = if allow_list.is_empty() {
            None
        } else {
            Some(Arc::new(allow_list))
        };

        let mut bound = Vec::new();
        for address in &self.config.node.listen {
            let contact_point: NetworkContactPoint = address.parse()?;
            let scp = self
                .channels
                .add_server_contact_point(contact_point, filter.clone())
                .await?;
            if let Some(cp) = scp.contact_point() {
                info!(contact_point = %cp, "Node: listening");
                bound.push(cp);
            }
        }

        self.rpc.start_sweeper();

        for connection in &self.config.node.connections {
            match self.setups.create_from_config(connection) {
                Ok(setup) => info!(
                    setup = setup.id(),
                    contact_point = %setup.contact_point(),
                    auto_start = connection.auto_start,
                    "Node: connection configured"
                ),
                Err(e) => warn!(
                    contact_point = %connection.contact_point,
                    error = %e,
                    "Node: ignoring invalid connection"
                ),
            }
        }
        Ok(bound)
    }

    /// Connect once, without retries, and wait for the result.
    pub async fn connect_to(
        &self,
        contact_point: NetworkContactPoint,
        timeout: Duration,
    ) -> WireResult<Arc<ConnectionSetup>> {
        let setup = self
            .setups
            .create(contact_point.clone(), contact_point.to_string(), RetryPolicy::never());
        setup.signal_start_intent();
        let status = setup
            .await_status(
                |s| {
                    s.state == ConnectionSetupState::Connected
                        || s.disconnect_reason.is_some()
                },
                timeout,
            )
            .await;
        match status {
            Some(s) if s.state == ConnectionSetupState::Connected => Ok(setup),
            Some(s) => {
                let _ = self.setups.dispose(setup.id());
                Err(WireError::ConnectionRejected(format!(
                    "{contact_point}: {}",
                    s.last_error.unwrap_or_else(|| format!("{:?}", s.disconnect_reason))
                )))
            }
            None => {
                let _ = self.setups.dispose(setup.id());
                Err(WireError::Timeout(format!("connecting to {contact_point}")))
            }
        }
    }

    pub fn local_node(&self) -> &InitialNodeInformation {
        self.channels.local_node()
    }

    pub fn local_node_id(&self) -> &InstanceNodeSessionId {
        self.channels.local_node_id()
    }

    pub fn config(&self) -> &NodeLinkConfig {
        &self.config
    }

    pub fn channels(&self) -> &Arc<MessageChannelService> {
        &self.channels
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing_table
    }

    pub fn routing(&self) -> &Arc<RoutingService> {
        &self.routing
    }

    pub fn rpc(&self) -> &Arc<RpcService> {
        &self.rpc
    }

    pub fn connection_setups(&self) -> &ConnectionSetupService {
        &self.setups
    }

    pub fn register_service(&self, service: Arc<ServiceInstance>) {
        self.rpc.register_service(service);
    }

    /// Stop connections, background jobs and listeners.
    pub fn shutdown(&self) {
        info!(node = %self.local_node_id(), "Node: shutting down");
        self.setups.dispose_all();
        self.rpc.stop_sweeper();
        self.channels.close_all();
    }
}
