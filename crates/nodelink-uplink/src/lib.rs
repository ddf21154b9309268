//! nodelink uplink: a relay that lets clients publish tools and open data
//! channels to each other.
//!
//! Every client session owns a namespace derived from its account name and
//! session qualifier. Destinations a client announces must live inside that
//! namespace. The relay caches the announced tool lists, pushes them to all
//! other clients and relays channel setup and channel data between them.
//!
//! ## Architecture
//!
//! - **codec**: handshake header and `channel id | length | type | data` framing
//! - **ServerSideUplinkSession**: handshake, heartbeats and ordered dispatch per client
//! - **UplinkRelayService**: namespaces, descriptor cache, channel bindings
//! - **ClientSideUplinkSession**: the client end, with channel requests and offers
//! - **UplinkServer**: TCP acceptor feeding sessions into one relay

pub mod client_session;
pub mod codec;
pub mod converter;
pub mod entities;
pub mod error;
pub mod heartbeat;
pub mod namespace;
pub mod outbox;
pub mod permissions;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod server_session;

pub use client_session::{
    ChannelOfferHandler, ClientSessionEventHandler, ClientSessionParameters,
    ClientSideUplinkSession, NoopSessionEvents, UplinkChannel,
};
pub use entities::{
    ChannelCreationRequest, ChannelCreationResponse, ToolDescriptor, ToolDescriptorListUpdate,
};
pub use error::{UplinkError, UplinkResult};
pub use permissions::{
    AuthorizationProvider, PermissionSet, StaticGroupAuthorization, ToolPublication,
};
pub use protocol::{MessageBlock, MessageType, UplinkErrorType, UplinkSessionState};
pub use relay::{RelaySession, UplinkRelayService};
pub use server::UplinkServer;
pub use server_session::ServerSideUplinkSession;
