//! Client side of an uplink session.
//!
//! [`ClientSideUplinkSession::connect`] performs the handshake and returns
//! an active session. The session then publishes tool descriptors, opens
//! channels to other clients' destinations, accepts channels offered by
//! the relay and answers heartbeats.

use crate::codec::{read_block, write_block, write_handshake_header};
use crate::converter::{
    decode_channel_creation_request, decode_channel_creation_response, decode_handshake_data,
    decode_tool_descriptor_list_update, encode_channel_creation_request,
    encode_channel_creation_response, encode_handshake_data, encode_tool_descriptor_list_update,
    goodbye_error_message, HandshakeData,
};
use crate::entities::{ChannelCreationRequest, ChannelCreationResponse, ToolDescriptorListUpdate};
use crate::error::{UplinkError, UplinkResult};
use crate::outbox::{Outbox, OUTBOX_CAPACITY};
use crate::permissions::{publishable_descriptors, AuthorizationProvider, ToolPublication};
use crate::protocol::{
    handshake_keys, MessageBlock, MessageType, UplinkErrorType, UplinkSessionState,
    CHANNEL_REQUEST_TIMEOUT, DEFAULT_CHANNEL_ID, HANDSHAKE_RESPONSE_TIMEOUT,
    MISSING_ERROR_MESSAGE, PROTOCOL_VERSION, SESSION_QUALIFIER_DEFAULT, UNDEFINED_CHANNEL_ID,
};

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Queue length of each data channel.
const CHANNEL_QUEUE_CAPACITY: usize = 64;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct ClientSessionParameters {
    pub account_name: String,
    /// Distinguishes parallel sessions of one account.
    pub session_qualifier: Option<String>,
    pub client_version_info: Option<String>,
    /// Extra handshake entries, mostly for tests.
    pub custom_handshake_data: HandshakeData,
    pub handshake_timeout: Duration,
    pub channel_request_timeout: Duration,
}

impl ClientSessionParameters {
    pub fn new(account_name: impl Into<String>) -> Self {
        Self {
            account_name: account_name.into(),
            session_qualifier: None,
            client_version_info: Some(format!("nodelink {}", env!("CARGO_PKG_VERSION"))),
            custom_handshake_data: HandshakeData::new(),
            handshake_timeout: HANDSHAKE_RESPONSE_TIMEOUT,
            channel_request_timeout: CHANNEL_REQUEST_TIMEOUT,
        }
    }

    pub fn with_session_qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.session_qualifier = Some(qualifier.into());
        self
    }

    fn handshake_data(&self) -> HandshakeData {
        let mut data = HandshakeData::new();
        data.insert(handshake_keys::PROTOCOL_VERSION_OFFER.into(), PROTOCOL_VERSION.into());
        if let Some(version) = &self.client_version_info {
            data.insert(handshake_keys::CLIENT_VERSION_INFO.into(), version.clone());
        }
        data.insert(handshake_keys::ACCOUNT_NAME.into(), self.account_name.clone());
        data.insert(
            handshake_keys::SESSION_QUALIFIER.into(),
            self.session_qualifier
                .clone()
                .unwrap_or_else(|| SESSION_QUALIFIER_DEFAULT.to_string()),
        );
        data.extend(self.custom_handshake_data.clone());
        data
    }
}

/// Session events. All methods default to doing nothing.
pub trait ClientSessionEventHandler: Send + Sync {
    fn on_session_active(&self, _namespace_id: &str) {}

    /// Tools published or retracted by another client.
    fn on_tool_descriptor_list_update(&self, _update: ToolDescriptorListUpdate) {}

    /// A default-channel message the session does not handle itself.
    fn on_default_channel_message(&self, _block: MessageBlock) {}

    fn on_fatal_session_error(&self, _error_type: UplinkErrorType, _message: &str) {}

    fn on_session_terminated(&self, _state: UplinkSessionState) {}
}

/// Ignores all events.
pub struct NoopSessionEvents;

impl ClientSessionEventHandler for NoopSessionEvents {}

/// Decides on channels other clients open to this one.
pub trait ChannelOfferHandler: Send + Sync {
    fn accepts(&self, channel_type: &str) -> bool;

    fn on_channel_opened(&self, offer: ChannelCreationRequest, channel: UplinkChannel);
}

/// One end of a relayed data channel.
pub struct UplinkChannel {
    channel_id: i64,
    incoming: mpsc::Receiver<MessageBlock>,
    outbox: Outbox,
    channels: Arc<DashMap<i64, mpsc::Sender<MessageBlock>>>,
}

impl UplinkChannel {
    pub fn channel_id(&self) -> i64 {
        self.channel_id
    }

    pub async fn send(&self, block: MessageBlock) -> UplinkResult<()> {
        if self.outbox.enqueue(self.channel_id, block).await {
            Ok(())
        } else {
            Err(UplinkError::SessionClosed)
        }
    }

    /// `None` once the other side closed the channel or the session ended.
    pub async fn recv(&mut self) -> Option<MessageBlock> {
        self.incoming.recv().await
    }

    pub async fn close(self) {
        self.channels.remove(&self.channel_id);
        self.outbox
            .enqueue(self.channel_id, MessageBlock::empty(MessageType::ChannelClose))
            .await;
    }
}

type ChannelRequestOutcome = (ChannelCreationResponse, Option<UplinkChannel>);

pub struct ClientSideUplinkSession {
    local_session_id: String,
    namespace_id: String,
    state: watch::Sender<UplinkSessionState>,
    outbox: Outbox,
    channels: Arc<DashMap<i64, mpsc::Sender<MessageBlock>>>,
    pending_channel_requests: DashMap<String, oneshot::Sender<ChannelRequestOutcome>>,
    request_counter: AtomicU64,
    channel_request_timeout: Duration,
    events: Arc<dyn ClientSessionEventHandler>,
    offers: Option<Arc<dyn ChannelOfferHandler>>,
}

impl ClientSideUplinkSession {
    /// Connect over TCP.
    pub async fn connect_tcp(
        addr: &str,
        params: ClientSessionParameters,
        events: Arc<dyn ClientSessionEventHandler>,
        offers: Option<Arc<dyn ChannelOfferHandler>>,
    ) -> UplinkResult<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Self::connect(stream, params, events, offers).await
    }

    /// Run the handshake on `stream`. A refusal by the relay is returned as
    /// [`UplinkError::Refused`] and reported to `events`.
    pub async fn connect<S>(
        stream: S,
        params: ClientSessionParameters,
        events: Arc<dyn ClientSessionEventHandler>,
        offers: Option<Arc<dyn ChannelOfferHandler>>,
    ) -> UplinkResult<Arc<Self>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let local_session_id = format!("c{}", SESSION_COUNTER.fetch_add(1, Ordering::SeqCst) + 1);
        let (mut reader, mut writer) = tokio::io::split(stream);

        write_handshake_header(&mut writer).await?;
        write_block(
            &mut writer,
            DEFAULT_CHANNEL_ID,
            &encode_handshake_data(&params.handshake_data())?,
        )
        .await?;

        let response = match expect_handshake_response(&mut reader, params.handshake_timeout).await {
            Ok(response) => response,
            Err(e) => {
                if let UplinkError::Refused { error_type, message } = &e {
                    events.on_fatal_session_error(*error_type, message);
                }
                return Err(e);
            }
        };
        let namespace_id = response
            .get(handshake_keys::ASSIGNED_NAMESPACE_ID)
            .filter(|ns| !ns.is_empty())
            .cloned()
            .ok_or_else(|| UplinkError::protocol("Handshake response did not include a namespace id"))?;

        let (outbox, _writer) = Outbox::spawn(writer, OUTBOX_CAPACITY, local_session_id.clone());
        let (state, _) = watch::channel(UplinkSessionState::Active);
        let session = Arc::new(Self {
            local_session_id,
            namespace_id,
            state,
            outbox,
            channels: Arc::new(DashMap::new()),
            pending_channel_requests: DashMap::new(),
            request_counter: AtomicU64::new(0),
            channel_request_timeout: params.channel_request_timeout,
            events,
            offers,
        });
        info!(
            session = %session.local_session_id,
            namespace = %session.namespace_id,
            "Uplink: session active"
        );
        session.events.on_session_active(&session.namespace_id);

        let receiver = Arc::clone(&session);
        tokio::spawn(async move { receiver.receive_loop(reader).await });
        Ok(session)
    }

    pub fn local_session_id(&self) -> &str {
        &self.local_session_id
    }

    pub fn namespace_id(&self) -> &str {
        &self.namespace_id
    }

    /// Destination id for a local suffix, inside this session's namespace.
    pub fn destination_id(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.namespace_id)
    }

    pub fn state(&self) -> UplinkSessionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches a terminal state.
    pub async fn wait_terminated(&self, timeout: Duration) -> Option<UplinkSessionState> {
        let mut rx = self.state.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal()))
            .await
            .ok()?
            .ok()
            .map(|s| *s);
        reached
    }

    /// Announce the tools of one destination, filtered by `auth`. Returns
    /// the update that was sent.
    pub async fn publish_tool_descriptors(
        &self,
        destination_suffix: &str,
        display_name: &str,
        publications: &[ToolPublication],
        auth: &dyn AuthorizationProvider,
    ) -> UplinkResult<ToolDescriptorListUpdate> {
        let update = ToolDescriptorListUpdate {
            destination_id: self.destination_id(destination_suffix),
            display_name: display_name.to_string(),
            tool_descriptors: publishable_descriptors(auth, publications),
        };
        self.publish_tool_descriptor_list_update(&update).await?;
        Ok(update)
    }

    pub async fn publish_tool_descriptor_list_update(&self, update: &ToolDescriptorListUpdate) -> UplinkResult<()> {
        let block = encode_tool_descriptor_list_update(update)?;
        self.send_default_channel_message(block).await
    }

    pub async fn send_default_channel_message(&self, block: MessageBlock) -> UplinkResult<()> {
        if self.outbox.enqueue(DEFAULT_CHANNEL_ID, block).await {
            Ok(())
        } else {
            Err(UplinkError::SessionClosed)
        }
    }

    /// Send on an open channel by id, for callers not holding its [`UplinkChannel`].
    pub async fn send_on_channel(&self, channel_id: i64, block: MessageBlock) -> UplinkResult<()> {
        if channel_id == DEFAULT_CHANNEL_ID {
            return self.send_default_channel_message(block).await;
        }
        if !self.channels.contains_key(&channel_id) {
            return Err(UplinkError::protocol(format!("Channel {channel_id} is not open")));
        }
        if self.outbox.enqueue(channel_id, block).await {
            Ok(())
        } else {
            Err(UplinkError::SessionClosed)
        }
    }

    /// Open a channel of `channel_type` to the client owning `destination_id`.
    pub async fn request_channel(&self, destination_id: &str, channel_type: &str) -> UplinkResult<UplinkChannel> {
        if self.state() != UplinkSessionState::Active {
            return Err(UplinkError::SessionClosed);
        }
        let request_id = (self.request_counter.fetch_add(1, Ordering::SeqCst) + 1).to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_channel_requests.insert(request_id.clone(), tx);

        let request = ChannelCreationRequest {
            channel_type: channel_type.to_string(),
            destination_id: destination_id.to_string(),
            channel_id: UNDEFINED_CHANNEL_ID,
            request_id: request_id.clone(),
        };
        if let Err(e) = self
            .send_default_channel_message(encode_channel_creation_request(&request)?)
            .await
        {
            self.pending_channel_requests.remove(&request_id);
            return Err(e);
        }

        let (response, channel) = match tokio::time::timeout(self.channel_request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => return Err(UplinkError::SessionClosed),
            Err(_) => {
                self.pending_channel_requests.remove(&request_id);
                warn!(
                    session = %self.local_session_id,
                    destination = destination_id,
                    "Uplink: no response to channel request within the timeout"
                );
                return Err(UplinkError::Timeout(format!("channel request to {destination_id}")));
            }
        };
        match channel {
            Some(channel) if response.success => {
                debug!(session = %self.local_session_id, channel = channel.channel_id, "Uplink: channel opened");
                Ok(channel)
            }
            _ => {
                warn!(
                    session = %self.local_session_id,
                    destination = destination_id,
                    channel_type,
                    "Uplink: channel request declined"
                );
                Err(UplinkError::ChannelRequestFailed(destination_id.to_string()))
            }
        }
    }

    pub fn open_channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Send a regular goodbye. The session ends once the relay answers.
    pub async fn close(&self) {
        if self.state() == UplinkSessionState::Active {
            self.set_state(UplinkSessionState::PartiallyClosedByLocal);
        }
        self.outbox.close(None).await;
    }

    fn set_state(&self, new: UplinkSessionState) {
        self.state.send_if_modified(|current| {
            if *current == new {
                return false;
            }
            debug!(session = %self.local_session_id, old = %current, new = %new, "Uplink: session state changed");
            *current = new;
            true
        });
    }

    fn register_channel(&self, channel_id: i64) -> UplinkChannel {
        let (tx, rx) = mpsc::channel(CHANNEL_QUEUE_CAPACITY);
        self.channels.insert(channel_id, tx);
        UplinkChannel {
            channel_id,
            incoming: rx,
            outbox: self.outbox.clone(),
            channels: Arc::clone(&self.channels),
        }
    }

    async fn receive_loop<S>(self: Arc<Self>, mut reader: ReadHalf<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let final_state = loop {
            let (channel_id, block) = match read_block(&mut reader).await {
                Ok(next) => next,
                Err(UplinkError::ConnectionClosed) => {
                    if self.state() == UplinkSessionState::PartiallyClosedByLocal {
                        break UplinkSessionState::CleanShutdown;
                    }
                    warn!(session = %self.local_session_id, "Uplink: relay closed the connection without goodbye");
                    break UplinkSessionState::Terminated;
                }
                Err(e) => {
                    error!(session = %self.local_session_id, error = %e, "Uplink: error reading from the relay");
                    self.events
                        .on_fatal_session_error(UplinkErrorType::InternalServerError, &e.to_string());
                    let message = UplinkErrorType::InternalServerError.wrap(&e.to_string());
                    self.outbox.close(Some(&message)).await;
                    break UplinkSessionState::Terminated;
                }
            };

            if block.message_type == MessageType::Goodbye {
                match goodbye_error_message(&block) {
                    None => {
                        if self.state() != UplinkSessionState::PartiallyClosedByLocal {
                            self.set_state(UplinkSessionState::PartiallyClosedByRemote);
                        }
                        self.outbox.close(None).await;
                        break UplinkSessionState::CleanShutdown;
                    }
                    Some(wrapped) => {
                        let (error_type, message) = UplinkErrorType::unwrap_message(&wrapped);
                        self.events.on_fatal_session_error(
                            error_type,
                            &format!("Connection closed by the remote side: {message}"),
                        );
                        self.outbox.close(None).await;
                        break UplinkSessionState::Terminated;
                    }
                }
            }

            let message_type = block.message_type;
            if let Err(e) = self.dispatch(channel_id, block).await {
                error!(
                    session = %self.local_session_id,
                    message_type = %message_type,
                    error = %e,
                    "Uplink: error processing an incoming message"
                );
            }
        };

        self.set_state(final_state);
        self.pending_channel_requests.clear();
        self.channels.clear();
        info!(session = %self.local_session_id, state = %final_state, "Uplink: session ended");
        self.events.on_session_terminated(final_state);
    }

    async fn dispatch(&self, channel_id: i64, block: MessageBlock) -> UplinkResult<()> {
        if channel_id != DEFAULT_CHANNEL_ID {
            if block.message_type == MessageType::ChannelClose {
                self.channels.remove(&channel_id);
                debug!(session = %self.local_session_id, channel = channel_id, "Uplink: channel closed by peer");
                return Ok(());
            }
            let sender = self.channels.get(&channel_id).map(|e| e.value().clone());
            match sender {
                Some(tx) => {
                    if tx.send(block).await.is_err() {
                        self.channels.remove(&channel_id);
                    }
                }
                None => error!(
                    session = %self.local_session_id,
                    channel = channel_id,
                    message_type = %block.message_type,
                    "Uplink: message for a channel without endpoint"
                ),
            }
            return Ok(());
        }

        match block.message_type {
            MessageType::Heartbeat => {
                let response = MessageBlock {
                    message_type: MessageType::HeartbeatResponse,
                    data: block.data,
                };
                self.outbox.try_enqueue(DEFAULT_CHANNEL_ID, response);
            }
            MessageType::ToolDescriptorListUpdate => {
                let update = decode_tool_descriptor_list_update(&block)?;
                self.events.on_tool_descriptor_list_update(update);
            }
            MessageType::ChannelInit => {
                let offer = decode_channel_creation_request(&block)?;
                self.handle_channel_offer(offer).await?;
            }
            MessageType::ChannelInitResponse => {
                let response = decode_channel_creation_response(&block)?;
                match self.pending_channel_requests.remove(&response.request_id) {
                    Some((_, tx)) => {
                        let channel = response
                            .success
                            .then(|| self.register_channel(response.channel_id));
                        if let Err((_, Some(orphan))) = tx.send((response, channel)) {
                            orphan.close().await;
                        }
                    }
                    None => warn!(
                        session = %self.local_session_id,
                        request = %response.request_id,
                        "Uplink: channel response without a pending request"
                    ),
                }
            }
            _ => self.events.on_default_channel_message(block),
        }
        Ok(())
    }

    async fn handle_channel_offer(&self, offer: ChannelCreationRequest) -> UplinkResult<()> {
        let handler = self
            .offers
            .as_ref()
            .filter(|h| h.accepts(&offer.channel_type))
            .cloned();
        let accepted = handler.is_some();
        let channel = handler.as_ref().map(|_| self.register_channel(offer.channel_id));

        let response = ChannelCreationResponse {
            channel_id: offer.channel_id,
            request_id: offer.request_id.clone(),
            success: accepted,
        };
        if accepted {
            debug!(
                session = %self.local_session_id,
                channel = offer.channel_id,
                channel_type = %offer.channel_type,
                "Uplink: accepting offered channel"
            );
        } else {
            warn!(
                session = %self.local_session_id,
                channel_type = %offer.channel_type,
                "Uplink: declining channel of unsupported type"
            );
        }
        self.send_default_channel_message(encode_channel_creation_response(&response)?)
            .await?;
        if let (Some(handler), Some(channel)) = (handler, channel) {
            handler.on_channel_opened(offer, channel);
        }
        Ok(())
    }
}

async fn expect_handshake_response<R>(reader: &mut R, timeout: Duration) -> UplinkResult<HandshakeData>
where
    R: AsyncRead + Unpin,
{
    let (channel_id, block) = tokio::time::timeout(timeout, read_block(reader))
        .await
        .map_err(|_| UplinkError::Timeout("waiting for the handshake response".into()))??;
    if channel_id != DEFAULT_CHANNEL_ID {
        return Err(UplinkError::protocol(format!("Unexpected handshake channel id: {channel_id}")));
    }
    match block.message_type {
        MessageType::Handshake => decode_handshake_data(&block),
        MessageType::Goodbye => {
            let wrapped = goodbye_error_message(&block).unwrap_or_else(|| MISSING_ERROR_MESSAGE.to_string());
            let (error_type, message) = UplinkErrorType::unwrap_message(&wrapped);
            Err(UplinkError::Refused { error_type, message })
        }
        other => Err(UplinkError::protocol(format!(
            "Expected handshake data, but received message type {other}"
        ))),
    }
}
