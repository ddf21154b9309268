//! nodelink node protocol: message channels, routing and remote calls.
//!
//! Nodes connect over pluggable transports, authenticate each other in a
//! handshake and exchange JSON-framed requests and responses on
//! [`MessageChannel`]s. Requests are routed hop by hop to any reachable node
//! and every request yields exactly one response.
//!
//! ## Architecture
//!
//! - **Transports**: TCP and in-process byte streams behind [`NetworkTransportProvider`]
//! - **MessageChannel**: one directed leg of a connection with request correlation
//! - **ServerContactPoint**: accepts inbound connections and runs the server handshake
//! - **MessageChannelService**: owns channels, contact points and the node registry
//! - **RoutingService**: local dispatch, next-hop sending and relay forwarding
//! - **RpcService**: remote service calls with callback objects
//! - **ConnectionSetupService**: configured outgoing connections with reconnects
//! - **NodeRuntime**: wires everything together from a `NodeLinkConfig`

pub mod channel;
pub mod channel_service;
pub mod connection_setup;
pub mod contact_point;
pub mod error;
pub mod handshake;
pub mod health;
pub mod message;
pub mod node;
pub mod registry;
pub mod routing;
pub mod rpc;
pub mod transport;

pub use channel::{ChannelCloseReason, ChannelId, MessageChannel, MessageChannelState};
pub use channel_service::{MessageChannelLifecycleListener, MessageChannelService};
pub use connection_setup::{
    ConnectionSetup, ConnectionSetupListener, ConnectionSetupService, ConnectionSetupState,
    DisconnectReason, RetryPolicy,
};
pub use contact_point::{ConnectionFilter, IpAllowList, ServerContactPoint};
pub use error::{WireError, WireResult};
pub use handshake::HandshakeSettings;
pub use health::ChannelHealthChecker;
pub use message::{WireMessage, WireMessageKind, PROTOCOL_VERSION};
pub use node::NodeRuntime;
pub use registry::{NodeEntry, NodeRegistry, NodeState};
pub use routing::{
    NetworkRequestHandler, ReachabilityProvider, RoutingService, RoutingTable, MAX_HOP_COUNT,
};
pub use transport::{
    InProcessTransport, NetworkContactPoint, NetworkTransportProvider, TcpTransport,
};
