//! Request routing.
//!
//! [`RoutingService::perform_routed_request`] delivers a request to any node
//! id: the local node is served directly, every other destination goes to
//! the next hop named by the [`ReachabilityProvider`]. Relays forward
//! requests that are not addressed to them; every forward increments the hop
//! count and requests beyond [`MAX_HOP_COUNT`] fail instead of circling.
//!
//! The failure codes tell where a route was missing:
//! `NO_ROUTE_TO_DESTINATION_AT_SENDER` is produced locally without any
//! network traffic, `NO_ROUTE_TO_DESTINATION_WHILE_FORWARDING` comes back
//! from a relay on the way.

use crate::channel::{MessageChannel, RawRequestHandler};
use crate::channel_service::{MessageChannelLifecycleListener, MessageChannelService};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use nodelink_types::message::METADATA_KEY_ELAPSED_MS;
use nodelink_types::{
    InitialNodeInformation, InstanceNodeSessionId, NetworkRequest, NetworkResponse, ResultCode,
};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Maximum number of forwards before a request is dropped.
pub const MAX_HOP_COUNT: u32 = 15;

/// Source of next-hop decisions.
pub trait ReachabilityProvider: Send + Sync {
    /// The directly connected node to hand a request for `destination` to.
    fn next_hop(&self, destination: &InstanceNodeSessionId) -> Option<InstanceNodeSessionId>;
}

/// Next-hop table from direct links plus explicitly configured routes.
#[derive(Default)]
pub struct RoutingTable {
    direct: DashMap<InstanceNodeSessionId, usize>,
    routes: RwLock<HashMap<InstanceNodeSessionId, InstanceNodeSessionId>>,
}

impl RoutingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Route requests for `destination` via the directly connected `via`.
    pub fn set_route(&self, destination: InstanceNodeSessionId, via: InstanceNodeSessionId) {
        debug!(destination = %destination, via = %via, "Routing: route set");
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(destination, via);
    }

    pub fn remove_route(&self, destination: &InstanceNodeSessionId) {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(destination);
    }

    pub fn is_directly_connected(&self, node: &InstanceNodeSessionId) -> bool {
        self.direct.contains_key(node)
    }

    /// Every destination with a usable next hop.
    pub fn reachable_nodes(&self) -> Vec<InstanceNodeSessionId> {
        let mut nodes: Vec<_> = self.direct.iter().map(|e| e.key().clone()).collect();
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        nodes.extend(
            routes
                .iter()
                .filter(|(_, via)| self.direct.contains_key(*via))
                .map(|(dest, _)| dest.clone()),
        );
        nodes.sort();
        nodes.dedup();
        nodes
    }
}

impl ReachabilityProvider for RoutingTable {
    fn next_hop(&self, destination: &InstanceNodeSessionId) -> Option<InstanceNodeSessionId> {
        if self.direct.contains_key(destination) {
            return Some(destination.clone());
        }
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        routes
            .get(destination)
            .filter(|via| self.direct.contains_key(*via))
            .cloned()
    }
}

impl MessageChannelLifecycleListener for RoutingTable {
    fn on_outgoing_channel_established(&self, channel: &Arc<MessageChannel>) {
        *self
            .direct
            .entry(channel.remote_node().node_id.clone())
            .or_insert(0) += 1;
    }

    fn on_outgoing_channel_terminated(&self, channel: &Arc<MessageChannel>) {
        let node = &channel.remote_node().node_id;
        if let Some(mut count) = self.direct.get_mut(node) {
            *count = count.saturating_sub(1);
        }
        self.direct.remove_if(node, |_, count| *count == 0);
    }
}

/// Handler for requests of one message type addressed to this node.
#[async_trait]
pub trait NetworkRequestHandler: Send + Sync {
    async fn handle_request(&self, request: NetworkRequest) -> NetworkResponse;
}

pub struct RoutingService {
    local: InitialNodeInformation,
    channels: Arc<MessageChannelService>,
    reachability: Arc<dyn ReachabilityProvider>,
    handlers: DashMap<String, Arc<dyn NetworkRequestHandler>>,
    request_timeout: Duration,
    forwarding_timeout: Duration,
}

impl RoutingService {
    pub fn new(
        channels: Arc<MessageChannelService>,
        reachability: Arc<dyn ReachabilityProvider>,
        request_timeout: Duration,
        forwarding_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            local: channels.local_node().clone(),
            channels,
            reachability,
            handlers: DashMap::new(),
            request_timeout,
            forwarding_timeout,
        })
    }

    pub fn local_node_id(&self) -> &InstanceNodeSessionId {
        &self.local.node_id
    }

    /// Register the local handler for `message_type`, replacing any previous one.
    pub fn register_handler(&self, message_type: &str, handler: Arc<dyn NetworkRequestHandler>) {
        self.handlers.insert(message_type.to_string(), handler);
    }

    /// Send a request from this node to `destination`.
    pub async fn perform_routed_request(
        &self,
        message_type: &str,
        body: Vec<u8>,
        destination: &InstanceNodeSessionId,
    ) -> NetworkResponse {
        let request = NetworkRequest::new(
            message_type,
            body,
            self.local.node_id.clone(),
            destination.clone(),
        );
        self.send_request(request).await
    }

    /// Send an already built request originating at this node.
    pub async fn send_request(&self, request: NetworkRequest) -> NetworkResponse {
        self.send_request_with_timeout(request, self.request_timeout)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        request: NetworkRequest,
        timeout: Duration,
    ) -> NetworkResponse {
        if request.receiver == self.local.node_id {
            return self.dispatch_locally(request).await;
        }
        self.send_to_next_hop(request, ResultCode::NoRouteToDestinationAtSender, timeout)
            .await
    }

    async fn send_to_next_hop(
        &self,
        request: NetworkRequest,
        no_route: ResultCode,
        timeout: Duration,
    ) -> NetworkResponse {
        if request.hop_count > MAX_HOP_COUNT {
            warn!(
                request = %request.request_id,
                destination = %request.receiver,
                hops = request.hop_count,
                "Routing: maximum hop count exceeded"
            );
            return NetworkResponse::failure(
                &request.request_id,
                ResultCode::MaxHopCountExceeded,
                format!(
                    "Request to {} exceeded the maximum of {} hops",
                    request.receiver, MAX_HOP_COUNT
                ),
            );
        }

        let channel = self
            .reachability
            .next_hop(&request.receiver)
            .and_then(|hop| self.channels.outgoing_channel_to(&hop));
        let Some(channel) = channel else {
            debug!(
                destination = %request.receiver,
                code = %no_route,
                "Routing: no route"
            );
            return NetworkResponse::failure(
                &request.request_id,
                no_route,
                format!(
                    "No route from {} to {}",
                    self.local.node_id, request.receiver
                ),
            );
        };

        let started = Instant::now();
        let response = channel.send_request(request, timeout).await;
        response.with_metadata(
            METADATA_KEY_ELAPSED_MS,
            started.elapsed().as_millis().to_string(),
        )
    }

    async fn dispatch_locally(&self, request: NetworkRequest) -> NetworkResponse {
        let handler = self
            .handlers
            .get(&request.message_type)
            .map(|h| Arc::clone(h.value()));
        let Some(handler) = handler else {
            return NetworkResponse::failure(
                &request.request_id,
                ResultCode::NoMatchingHandler,
                format!("No handler for message type '{}'", request.message_type),
            );
        };

        let request_id = request.request_id.clone();
        let message_type = request.message_type.clone();
        match AssertUnwindSafe(handler.handle_request(request))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(_) => {
                let error_id = uuid::Uuid::new_v4();
                warn!(
                    request = %request_id,
                    message_type = %message_type,
                    error_id = %error_id,
                    "Routing: request handler panicked"
                );
                NetworkResponse::failure(
                    request_id,
                    ResultCode::ExceptionAtDestination,
                    format!("Uncaught error at destination (remote error id: {error_id})"),
                )
            }
        }
    }

    async fn forward(&self, request: NetworkRequest) -> NetworkResponse {
        if !self.local.is_relay {
            return NetworkResponse::failure(
                &request.request_id,
                ResultCode::NoRouteToDestinationWhileForwarding,
                format!(
                    "{} received a request for {} but does not forward",
                    self.local.node_id, request.receiver
                ),
            );
        }
        let forwarded = request.forwarded(&self.local.node_id);
        debug!(
            request = %forwarded.request_id,
            destination = %forwarded.receiver,
            hops = forwarded.hop_count,
            "Routing: forwarding"
        );
        self.send_to_next_hop(
            forwarded,
            ResultCode::NoRouteToDestinationWhileForwarding,
            self.forwarding_timeout,
        )
        .await
    }
}

#[async_trait]
impl RawRequestHandler for RoutingService {
    async fn handle_raw_request(
        &self,
        request: NetworkRequest,
        _source: &Arc<MessageChannel>,
    ) -> NetworkResponse {
        if request.receiver == self.local.node_id {
            self.dispatch_locally(request).await
        } else {
            self.forward(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelParams;
    use crate::handshake::HandshakeSettings;
    use crate::registry::NodeRegistry;

    struct Upper;

    #[async_trait]
    impl NetworkRequestHandler for Upper {
        async fn handle_request(&self, request: NetworkRequest) -> NetworkResponse {
            NetworkResponse::success(&request, request.body.to_ascii_uppercase())
        }
    }

    struct Panics;

    #[async_trait]
    impl NetworkRequestHandler for Panics {
        async fn handle_request(&self, _request: NetworkRequest) -> NetworkResponse {
            panic!("handler bug")
        }
    }

    fn id(name: &str) -> InstanceNodeSessionId {
        InstanceNodeSessionId::new(name, "1")
    }

    fn routing(name: &str, relay: bool) -> Arc<RoutingService> {
        let settings = HandshakeSettings {
            local: InitialNodeInformation::new(id(name), name).with_relay(relay),
            shared_secret: None,
            timeout: Duration::from_secs(1),
        };
        let channels = MessageChannelService::new(settings, NodeRegistry::default());
        RoutingService::new(
            channels,
            RoutingTable::new(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
    }

    fn dummy_channel(remote: &str) -> Arc<MessageChannel> {
        let (a, _b) = tokio::io::duplex(1024);
        MessageChannel::spawn(
            Box::new(a),
            ChannelParams {
                channel_id: format!("to-{remote}"),
                mirror_channel_id: "m".into(),
                remote: InitialNodeInformation::new(id(remote), remote),
                initiated_by_remote: false,
            },
            routing("x", false),
        )
    }

    #[tokio::test]
    async fn test_local_dispatch_and_missing_handler() {
        let service = routing("a", false);
        service.register_handler("upper", Arc::new(Upper));
        let resp = service
            .perform_routed_request("upper", b"abc".to_vec(), &id("a"))
            .await;
        assert!(resp.is_success());
        assert_eq!(resp.body, b"ABC");

        let resp = service
            .perform_routed_request("other", Vec::new(), &id("a"))
            .await;
        assert_eq!(resp.result_code, ResultCode::NoMatchingHandler);
    }

    #[tokio::test]
    async fn test_no_route_at_sender() {
        let service = routing("a", false);
        let resp = service
            .perform_routed_request("upper", Vec::new(), &id("nowhere"))
            .await;
        assert_eq!(resp.result_code, ResultCode::NoRouteToDestinationAtSender);
    }

    #[tokio::test]
    async fn test_non_relay_refuses_to_forward() {
        let service = routing("b", false);
        let request = NetworkRequest::new("upper", Vec::new(), id("a"), id("c"));
        let resp = service.handle_raw_request(request, &dummy_channel("a")).await;
        assert_eq!(
            resp.result_code,
            ResultCode::NoRouteToDestinationWhileForwarding
        );
    }

    #[tokio::test]
    async fn test_relay_without_route_reports_while_forwarding() {
        let service = routing("b", true);
        let request = NetworkRequest::new("upper", Vec::new(), id("a"), id("c"));
        let resp = service.handle_raw_request(request, &dummy_channel("a")).await;
        assert_eq!(
            resp.result_code,
            ResultCode::NoRouteToDestinationWhileForwarding
        );
    }

    #[tokio::test]
    async fn test_hop_limit() {
        let service = routing("b", true);
        let mut request = NetworkRequest::new("upper", Vec::new(), id("a"), id("c"));
        request.hop_count = MAX_HOP_COUNT;
        let resp = service.handle_raw_request(request, &dummy_channel("a")).await;
        assert_eq!(resp.result_code, ResultCode::MaxHopCountExceeded);
    }

    #[tokio::test]
    async fn test_panicking_handler_yields_exception_response() {
        let service = routing("a", false);
        service.register_handler("boom", Arc::new(Panics));
        let resp = service
            .perform_routed_request("boom", Vec::new(), &id("a"))
            .await;
        assert_eq!(resp.result_code, ResultCode::ExceptionAtDestination);
        assert!(resp.failure_description().contains("remote error id"));
    }

    #[test]
    fn test_table_next_hop() {
        let table = RoutingTable::default();
        table.direct.insert(id("b"), 1);
        table.set_route(id("c"), id("b"));
        table.set_route(id("d"), id("unknown"));
        assert_eq!(table.next_hop(&id("b")), Some(id("b")));
        assert_eq!(table.next_hop(&id("c")), Some(id("b")));
        assert_eq!(table.next_hop(&id("d")), None);
        assert_eq!(table.reachable_nodes(), vec![id("b"), id("c")]);
        table.remove_route(&id("c"));
        assert_eq!(table.next_hop(&id("c")), None);
    }
}
