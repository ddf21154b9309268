//! Relay side of one client connection.
//!
//! The session reads the handshake header and handshake map, claims a
//! namespace on the [`UplinkRelayService`], answers with its own map and
//! then feeds all received blocks to the relay in order. Heartbeats run
//! while the session is active.

use crate::codec::{expect_handshake_header, read_block};
use crate::converter::{decode_handshake_data, encode_handshake_data, goodbye_error_message, HandshakeData};
use crate::error::{UplinkError, UplinkResult};
use crate::heartbeat::{spawn_heartbeat, HeartbeatMonitor};
use crate::namespace::{derive_namespace_id, effective_account_name, effective_session_qualifier};
use crate::outbox::{Outbox, OUTBOX_CAPACITY};
use crate::protocol::{
    handshake_keys, MessageBlock, MessageType, UplinkErrorType, UplinkSessionState,
    DEFAULT_CHANNEL_ID, HANDSHAKE_RESPONSE_TIMEOUT, PROTOCOL_VERSION,
};
use crate::relay::{RelaySession, SessionRef, UplinkRelayService};

use async_trait::async_trait;
use nodelink_types::config::UplinkConfig;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

enum HandshakeFailure {
    /// Answered with an error goodbye.
    Refused(UplinkErrorType, String),
    /// Connection dropped without an answer.
    Protocol(String),
}

pub struct ServerSideUplinkSession {
    session_id: String,
    client_info: String,
    login_account: Option<String>,
    namespace: OnceLock<String>,
    state: watch::Sender<UplinkSessionState>,
    outbox: Outbox,
    relay: Arc<UplinkRelayService>,
    config: Arc<UplinkConfig>,
}

impl ServerSideUplinkSession {
    /// Start a session on an accepted stream.
    ///
    /// `login_account` is the account authenticated by the transport, if
    /// any; otherwise the account name from the handshake map is used.
    pub fn accept<S>(
        stream: S,
        client_info: String,
        login_account: Option<String>,
        relay: Arc<UplinkRelayService>,
        config: Arc<UplinkConfig>,
    ) -> (Arc<Self>, JoinHandle<UplinkResult<UplinkSessionState>>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let session_id = relay.assign_session_id();
        let (reader, writer) = tokio::io::split(stream);
        let (outbox, _writer) = Outbox::spawn(writer, OUTBOX_CAPACITY, session_id.clone());
        let (state, _) = watch::channel(UplinkSessionState::ClientHandshakeRequestReady);
        let session = Arc::new(Self {
            session_id,
            client_info,
            login_account,
            namespace: OnceLock::new(),
            state,
            outbox,
            relay,
            config,
        });
        let runner = Arc::clone(&session);
        let task = tokio::spawn(async move { runner.run(reader).await });
        (session, task)
    }

    pub fn client_info(&self) -> &str {
        &self.client_info
    }

    pub fn state(&self) -> UplinkSessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<UplinkSessionState> {
        self.state.subscribe()
    }

    /// Ask the client to end the session.
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
            debug!(session = %self.session_id, old = %current, new = %new, "Uplink: session state changed");
            *current = new;
            true
        });
    }

    async fn run<S>(self: Arc<Self>, mut reader: ReadHalf<S>) -> UplinkResult<UplinkSessionState>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        info!(session = %self.session_id, client = %self.client_info, "Uplink: handling session");
        let started = Instant::now();

        let result = match self.perform_handshake(&mut reader).await {
            Ok(true) => self.receive_loop(&mut reader).await,
            Ok(false) => Ok(self.state()),
            Err(e) => {
                self.set_state(UplinkSessionState::SessionRefusedOrHandshakeError);
                Err(e)
            }
        };

        let handle: SessionRef = Arc::clone(&self) as _;
        self.relay.deactivate_session(&handle);
        self.outbox.close(None).await;

        match &result {
            Ok(state) => debug!(
                session = %self.session_id,
                state = %state,
                duration_ms = started.elapsed().as_millis() as u64,
                "Uplink: session terminated"
            ),
            Err(UplinkError::Io(e)) => warn!(
                session = %self.session_id,
                client = %self.client_info,
                error = %e,
                "Uplink: I/O error, the client may have closed the connection"
            ),
            Err(e) => error!(
                session = %self.session_id,
                client = %self.client_info,
                error = %e,
                "Uplink: protocol error"
            ),
        }
        result
    }

    /// `Ok(true)` when the session is active, `Ok(false)` when it was
    /// refused with an error goodbye.
    async fn perform_handshake<S>(self: &Arc<Self>, reader: &mut ReadHalf<S>) -> UplinkResult<bool>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        expect_handshake_header(reader, HANDSHAKE_RESPONSE_TIMEOUT).await?;
        let (channel_id, block) = tokio::time::timeout(HANDSHAKE_RESPONSE_TIMEOUT, read_block(reader))
            .await
            .map_err(|_| UplinkError::Timeout("waiting for client handshake data".into()))??;
        if channel_id != DEFAULT_CHANNEL_ID {
            return Err(UplinkError::protocol(format!("Unexpected handshake channel id: {channel_id}")));
        }
        if block.message_type != MessageType::Handshake {
            return Err(UplinkError::protocol(format!(
                "Expected handshake data, but received message type {}",
                block.message_type
            )));
        }
        let incoming = decode_handshake_data(&block)?;

        match self.process_handshake(&incoming).await {
            Ok(response) => {
                if !self.outbox.enqueue(DEFAULT_CHANNEL_ID, encode_handshake_data(&response)?).await {
                    return Err(UplinkError::ConnectionClosed);
                }
                self.set_state(UplinkSessionState::Active);
                self.relay.activate_session(Arc::clone(self) as _);
                Ok(true)
            }
            Err(HandshakeFailure::Refused(error_type, message)) => {
                info!(
                    session = %self.session_id,
                    client = %self.client_info,
                    error_type = error_type.code(),
                    reason = %message,
                    "Uplink: refusing session"
                );
                self.set_state(UplinkSessionState::SessionRefusedOrHandshakeError);
                self.outbox.close(Some(&error_type.wrap(&message))).await;
                Ok(false)
            }
            Err(HandshakeFailure::Protocol(message)) => Err(UplinkError::Protocol(message)),
        }
    }

    async fn process_handshake(&self, incoming: &HandshakeData) -> Result<HandshakeData, HandshakeFailure> {
        // the client's entries come first so server entries override them
        let mut response = incoming.clone();

        let offered = incoming
            .get(handshake_keys::PROTOCOL_VERSION_OFFER)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                HandshakeFailure::Refused(
                    UplinkErrorType::InvalidHandshakeData,
                    "Missing handshake version information".into(),
                )
            })?;
        if offered != PROTOCOL_VERSION {
            return Err(HandshakeFailure::Refused(
                UplinkErrorType::ProtocolVersionMismatch,
                format!(
                    "The client and server are using incompatible versions of the Uplink protocol \
                     ({offered} vs. {PROTOCOL_VERSION}). Please use a client version matching the \
                     server you are connecting to."
                ),
            ));
        }
        response.insert(handshake_keys::PROTOCOL_VERSION.into(), PROTOCOL_VERSION.into());

        let invalid = |e: crate::namespace::NamespaceError| {
            HandshakeFailure::Refused(UplinkErrorType::InvalidHandshakeData, e.to_string())
        };
        let login_account = self
            .login_account
            .clone()
            .or_else(|| incoming.get(handshake_keys::ACCOUNT_NAME).cloned())
            .unwrap_or_default();
        let account_name = effective_account_name(&login_account).map_err(invalid)?;
        let qualifier = effective_session_qualifier(
            incoming.get(handshake_keys::SESSION_QUALIFIER).map(String::as_str),
        )
        .map_err(invalid)?;
        let namespace_id = derive_namespace_id(&account_name, &qualifier);
        if !self.relay.attempt_to_assign_namespace_id(&namespace_id, &self.session_id) {
            return Err(HandshakeFailure::Refused(
                UplinkErrorType::ClientNamespaceCollision,
                format!(
                    "The combination of account name \"{account_name}\" and client ID \"{qualifier}\" \
                     is already in use. To allow parallel logins, use a different client ID for each client."
                ),
            ));
        }
        let _ = self.namespace.set(namespace_id.clone());
        response.insert(handshake_keys::ASSIGNED_NAMESPACE_ID.into(), namespace_id);

        self.apply_test_flags(incoming).await?;
        Ok(response)
    }

    async fn apply_test_flags(&self, incoming: &HandshakeData) -> Result<(), HandshakeFailure> {
        let keys = [
            handshake_keys::SIMULATE_HANDSHAKE_FAILURE,
            handshake_keys::SIMULATE_REFUSED_CONNECTION,
            handshake_keys::SIMULATE_HANDSHAKE_RESPONSE_DELAY,
        ];
        if !self.config.allow_test_handshake_flags {
            if keys.iter().any(|k| incoming.contains_key(*k)) {
                debug!(session = %self.session_id, "Uplink: ignoring test handshake flags");
            }
            return Ok(());
        }
        if let Some(message) = incoming.get(handshake_keys::SIMULATE_HANDSHAKE_FAILURE) {
            return Err(HandshakeFailure::Protocol(message.clone()));
        }
        if let Some(message) = incoming.get(handshake_keys::SIMULATE_REFUSED_CONNECTION) {
            return Err(HandshakeFailure::Refused(
                UplinkErrorType::InternalServerError,
                message.clone(),
            ));
        }
        if incoming.contains_key(handshake_keys::SIMULATE_HANDSHAKE_RESPONSE_DELAY) {
            tokio::time::sleep(HANDSHAKE_RESPONSE_TIMEOUT * 2).await;
        }
        Ok(())
    }

    async fn receive_loop<S>(self: &Arc<Self>, reader: &mut ReadHalf<S>) -> UplinkResult<UplinkSessionState>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let monitor = Arc::new(HeartbeatMonitor::from_config(&self.config));
        let heartbeat = spawn_heartbeat(
            self.session_id.clone(),
            Arc::clone(&monitor),
            self.outbox.clone(),
            self.state.subscribe(),
        );
        let (dispatch_tx, dispatcher) = self.spawn_dispatcher();
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);

        let end_state = loop {
            let (channel_id, block) = match tokio::time::timeout(idle_timeout, read_block(reader)).await {
                Err(_) => {
                    warn!(
                        session = %self.session_id,
                        idle_ms = idle_timeout.as_millis() as u64,
                        "Uplink: no incoming messages, closing the session"
                    );
                    let message = UplinkErrorType::InternalServerError.wrap(&format!(
                        "Closing the session after {} msec without incoming messages",
                        idle_timeout.as_millis()
                    ));
                    self.outbox.close(Some(&message)).await;
                    break UplinkSessionState::Terminated;
                }
                Ok(Err(UplinkError::ConnectionClosed)) => {
                    if self.state() == UplinkSessionState::PartiallyClosedByLocal {
                        break UplinkSessionState::CleanShutdown;
                    }
                    warn!(session = %self.session_id, "Uplink: connection closed without goodbye");
                    break UplinkSessionState::Terminated;
                }
                Ok(Err(e)) => {
                    let marker = uuid::Uuid::new_v4().simple().to_string();
                    warn!(
                        session = %self.session_id,
                        marker = %marker,
                        error = %e,
                        "Uplink: error while receiving a message, closing the connection"
                    );
                    let message = UplinkErrorType::InternalServerError.wrap(&format!(
                        "Closing the connection after an error (internal error log marker {marker})"
                    ));
                    self.outbox.close(Some(&message)).await;
                    break UplinkSessionState::Terminated;
                }
                Ok(Ok(next)) => next,
            };

            match block.message_type {
                MessageType::Goodbye => {
                    let error = goodbye_error_message(&block);
                    if let Some(wrapped) = &error {
                        let (error_type, message) = UplinkErrorType::unwrap_message(wrapped);
                        info!(
                            session = %self.session_id,
                            client = %self.client_info,
                            error_type = error_type.code(),
                            reason = %message,
                            "Uplink: received a remote error message, closing the session"
                        );
                    }
                    if self.state() != UplinkSessionState::PartiallyClosedByLocal {
                        self.set_state(UplinkSessionState::PartiallyClosedByRemote);
                    }
                    self.outbox.close(None).await;
                    break if error.is_some() {
                        UplinkSessionState::Terminated
                    } else {
                        UplinkSessionState::CleanShutdown
                    };
                }
                MessageType::HeartbeatResponse if channel_id == DEFAULT_CHANNEL_ID => {
                    if let Some(rtt) = monitor.record_response(Instant::now()) {
                        debug!(session = %self.session_id, rtt_ms = rtt.as_millis() as u64, "Uplink: heartbeat answered");
                    }
                }
                _ => {
                    if dispatch_tx.send((channel_id, block)).await.is_err() {
                        break UplinkSessionState::Terminated;
                    }
                }
            }
        };

        drop(dispatch_tx);
        let _ = dispatcher.await;
        heartbeat.abort();
        self.set_state(end_state);
        Ok(end_state)
    }

    /// Blocks of one session are processed strictly in arrival order.
    fn spawn_dispatcher(self: &Arc<Self>) -> (mpsc::Sender<(i64, MessageBlock)>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<(i64, MessageBlock)>(OUTBOX_CAPACITY);
        let relay = Arc::clone(&self.relay);
        let handle: SessionRef = Arc::clone(self) as _;
        let task = tokio::spawn(async move {
            while let Some((channel_id, block)) = rx.recv().await {
                let message_type = block.message_type;
                if let Err(e) = relay.on_message_block(&handle, channel_id, block).await {
                    error!(
                        session = handle.session_id(),
                        channel = channel_id,
                        message_type = %message_type,
                        error = %e,
                        "Uplink: error processing a received message"
                    );
                }
            }
        });
        (tx, task)
    }
}

#[async_trait]
impl RelaySession for ServerSideUplinkSession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn namespace_id(&self) -> Option<String> {
        self.namespace.get().cloned()
    }

    fn enqueue(&self, channel_id: i64, block: MessageBlock) -> bool {
        if self.outbox.try_enqueue(channel_id, block) {
            return true;
        }
        if !self.outbox.is_closed() {
            warn!(session = %self.session_id, "Uplink: outgoing queue congested, closing the session");
            self.outbox.close_in_background(Some(
                UplinkErrorType::InternalServerError.wrap("Outgoing message queue overflow"),
            ));
        }
        false
    }

    async fn enqueue_blocking(&self, channel_id: i64, block: MessageBlock) -> bool {
        self.outbox.enqueue(channel_id, block).await
    }
}
