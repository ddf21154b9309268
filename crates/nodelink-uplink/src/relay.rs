//! The relay: connects client sessions by namespace.
//!
//! [`UplinkRelayService`] holds all cross-session state of one relay:
//!
//! - the active sessions
//! - namespace assignments
//! - channel bindings (channel id to initiator and destination session)
//! - the latest tool descriptor list per destination id
//!
//! Each structure has its own lock. Where two are needed, `active_sessions`
//! is taken before `tool_descriptor_cache`; `namespaces` and `channels` are
//! never held together with another lock. A deactivating session is removed
//! from `active_sessions` before its namespace is released, so a lookup
//! never resolves a destination to a session that is already going away.

use crate::converter::{
    decode_channel_creation_request, decode_channel_creation_response,
    decode_tool_descriptor_list_update, encode_channel_creation_request,
    encode_channel_creation_response, encode_tool_descriptor_list_update,
};
use crate::entities::{ChannelCreationRequest, ChannelCreationResponse, ToolDescriptorListUpdate};
use crate::error::UplinkResult;
use crate::namespace::owns_destination;
use crate::protocol::{MessageBlock, MessageType, DEFAULT_CHANNEL_ID, UNDEFINED_CHANNEL_ID};

use async_trait::async_trait;
use nodelink_types::config::{UnknownMessagePolicy, UplinkConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// A session as seen by the relay.
#[async_trait]
pub trait RelaySession: Send + Sync {
    fn session_id(&self) -> &str;

    /// Assigned during the handshake.
    fn namespace_id(&self) -> Option<String>;

    /// Queue a block without waiting. A session that cannot keep up is
    /// expected to close itself and return `false`.
    fn enqueue(&self, channel_id: i64, block: MessageBlock) -> bool;

    /// Queue a block, waiting for queue space.
    async fn enqueue_blocking(&self, channel_id: i64, block: MessageBlock) -> bool;
}

pub type SessionRef = Arc<dyn RelaySession>;

struct ChannelBinding {
    initiator: SessionRef,
    destination: SessionRef,
    channel_type: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct UplinkRelayService {
    unknown_message_policy: UnknownMessagePolicy,
    channel_init_attempts: u32,
    channel_init_retry_delay: Duration,
    session_counter: AtomicU64,
    channel_id_counter: AtomicI64,
    active_sessions: Mutex<HashMap<String, SessionRef>>,
    /// Namespace id to session id.
    namespaces: Mutex<HashMap<String, String>>,
    channels: Mutex<HashMap<i64, ChannelBinding>>,
    /// Latest non-empty update block per destination id.
    tool_descriptor_cache: Mutex<HashMap<String, MessageBlock>>,
}

impl UplinkRelayService {
    pub fn new(config: &UplinkConfig) -> Self {
        Self {
            unknown_message_policy: config.unknown_message_policy,
            channel_init_attempts: config.channel_init_attempts.max(1),
            channel_init_retry_delay: Duration::from_millis(config.channel_init_retry_delay_ms),
            session_counter: AtomicU64::new(0),
            channel_id_counter: AtomicI64::new(0),
            active_sessions: Mutex::new(HashMap::new()),
            namespaces: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            tool_descriptor_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn assign_session_id(&self) -> String {
        format!("s{}", self.session_counter.fetch_add(1, Ordering::SeqCst) + 1)
    }

    // -- namespaces ---------------------------------------------------------

    /// Bind `namespace_id` to the session unless another session holds it.
    pub fn attempt_to_assign_namespace_id(&self, namespace_id: &str, session_id: &str) -> bool {
        let mut namespaces = lock(&self.namespaces);
        if let Some(existing) = namespaces.get(namespace_id) {
            warn!(
                session = session_id,
                namespace = namespace_id,
                holder = %existing,
                "Relay: namespace already in use, refusing session"
            );
            return false;
        }
        namespaces.insert(namespace_id.to_string(), session_id.to_string());
        debug!(session = session_id, namespace = namespace_id, "Relay: namespace assigned");
        true
    }

    /// Release a namespace held by the session. Unknown namespaces and
    /// namespaces held by other sessions are left alone.
    pub fn release_namespace_id(&self, namespace_id: &str, session_id: &str) {
        let mut namespaces = lock(&self.namespaces);
        match namespaces.get(namespace_id) {
            None => debug!(
                session = session_id,
                namespace = namespace_id,
                "Relay: ignoring release of unassigned namespace"
            ),
            Some(holder) if holder != session_id => warn!(
                session = session_id,
                namespace = namespace_id,
                holder = %holder,
                "Relay: ignoring release of a namespace bound to another session"
            ),
            Some(_) => {
                namespaces.remove(namespace_id);
                debug!(session = session_id, namespace = namespace_id, "Relay: namespace released");
            }
        }
    }

    pub fn is_namespace_assigned(&self, namespace_id: &str) -> bool {
        lock(&self.namespaces).contains_key(namespace_id)
    }

    // -- session activity ---------------------------------------------------

    /// Register an active session and send it all cached tool descriptors.
    pub fn activate_session(&self, session: SessionRef) {
        let mut active = lock(&self.active_sessions);
        active.insert(session.session_id().to_string(), Arc::clone(&session));
        let cache = lock(&self.tool_descriptor_cache);
        for (destination_id, block) in cache.iter() {
            debug!(
                session = session.session_id(),
                destination = %destination_id,
                "Relay: sending cached tool descriptors to new session"
            );
            if !session.enqueue(DEFAULT_CHANNEL_ID, block.clone()) {
                warn!(session = session.session_id(), "Relay: failed to send cached tool descriptors");
                break;
            }
        }
        info!(
            session = session.session_id(),
            namespace = %session.namespace_id().unwrap_or_default(),
            active = active.len(),
            "Relay: session active"
        );
    }

    /// Tear down everything the session owned: its namespace, its tool
    /// descriptors (announced as retracted to all other sessions) and its
    /// channels (announced as closed to the other party).
    pub fn deactivate_session(&self, session: &SessionRef) {
        let session_id = session.session_id();
        let was_active = lock(&self.active_sessions).remove(session_id).is_some();
        if let Some(namespace_id) = session.namespace_id() {
            self.release_namespace_id(&namespace_id, session_id);
        }
        if !was_active {
            return;
        }
        self.retract_tool_descriptors_of(session);
        self.close_channels_of(session);
        info!(session = session_id, "Relay: session inactive");
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        lock(&self.active_sessions).contains_key(session_id)
    }

    pub fn active_session_count(&self) -> usize {
        lock(&self.active_sessions).len()
    }

    /// Destination ids with cached tool descriptors, sorted.
    pub fn cached_destination_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.tool_descriptor_cache).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }

    fn retract_tool_descriptors_of(&self, session: &SessionRef) {
        let Some(namespace_id) = session.namespace_id() else {
            return;
        };
        let active = lock(&self.active_sessions);
        let mut cache = lock(&self.tool_descriptor_cache);
        let owned: Vec<String> = cache
            .keys()
            .filter(|d| owns_destination(&namespace_id, d))
            .cloned()
            .collect();
        for destination_id in owned {
            cache.remove(&destination_id);
            debug!(
                session = session.session_id(),
                destination = %destination_id,
                "Relay: retracting tool descriptors of closed session"
            );
            let block = match encode_tool_descriptor_list_update(&ToolDescriptorListUpdate::retraction(
                destination_id.as_str(),
            )) {
                Ok(block) => block,
                Err(e) => {
                    error!(error = %e, "Relay: failed to encode tool retraction");
                    continue;
                }
            };
            for other in active.values() {
                if !other.enqueue(DEFAULT_CHANNEL_ID, block.clone()) {
                    warn!(session = other.session_id(), "Relay: failed to send tool retraction");
                }
            }
        }
    }

    fn close_channels_of(&self, session: &SessionRef) {
        let session_id = session.session_id();
        let orphaned: Vec<(i64, SessionRef)> = {
            let mut channels = lock(&self.channels);
            let ids: Vec<i64> = channels
                .iter()
                .filter(|(_, b)| {
                    b.initiator.session_id() == session_id || b.destination.session_id() == session_id
                })
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| {
                    let binding = channels.remove(&id)?;
                    let peer = if binding.initiator.session_id() == session_id {
                        binding.destination
                    } else {
                        binding.initiator
                    };
                    Some((id, peer))
                })
                .collect()
        };
        for (channel_id, peer) in orphaned {
            debug!(channel = channel_id, peer = peer.session_id(), "Relay: closing channel of closed session");
            peer.enqueue(channel_id, MessageBlock::empty(MessageType::ChannelClose));
        }
    }

    // -- message processing -------------------------------------------------

    /// Process a block received by `session`. Blocks from sessions that
    /// are no longer active are discarded.
    pub async fn on_message_block(
        &self,
        session: &SessionRef,
        channel_id: i64,
        block: MessageBlock,
    ) -> UplinkResult<()> {
        if !self.is_active(session.session_id()) {
            debug!(
                session = session.session_id(),
                message_type = %block.message_type,
                "Relay: discarding message from inactive session"
            );
            return Ok(());
        }
        if channel_id != DEFAULT_CHANNEL_ID {
            self.forward_channel_message(session, channel_id, block).await;
            return Ok(());
        }
        match block.message_type {
            MessageType::ToolDescriptorListUpdate => self.handle_tool_descriptor_list_update(session, block),
            MessageType::ChannelInit => self.handle_channel_init(session, block).await,
            MessageType::ChannelInitResponse => self.handle_channel_init_response(session, block),
            other => {
                match self.unknown_message_policy {
                    UnknownMessagePolicy::Echo => {
                        debug!(session = session.session_id(), message_type = %other, "Relay: echoing message");
                        session.enqueue(DEFAULT_CHANNEL_ID, block);
                    }
                    UnknownMessagePolicy::Reject => {
                        warn!(
                            session = session.session_id(),
                            message_type = %other,
                            "Relay: dropping unsupported message on the default channel"
                        );
                    }
                }
                Ok(())
            }
        }
    }

    fn handle_tool_descriptor_list_update(&self, session: &SessionRef, block: MessageBlock) -> UplinkResult<()> {
        let update = decode_tool_descriptor_list_update(&block)?;
        let owned = session
            .namespace_id()
            .is_some_and(|ns| owns_destination(&ns, &update.destination_id));
        if !owned {
            warn!(
                session = session.session_id(),
                destination = %update.destination_id,
                "Relay: dropping tool descriptor update for a destination outside the session's namespace"
            );
            return Ok(());
        }

        let active = lock(&self.active_sessions);
        {
            let mut cache = lock(&self.tool_descriptor_cache);
            if update.is_retraction() {
                if cache.remove(&update.destination_id).is_some() {
                    debug!(destination = %update.destination_id, "Relay: removed cached tool descriptors");
                } else {
                    warn!(
                        destination = %update.destination_id,
                        "Relay: empty tool descriptor update without a cached entry"
                    );
                }
            } else {
                cache.insert(update.destination_id.clone(), block.clone());
            }
        }
        debug!(
            session = session.session_id(),
            receivers = active.len().saturating_sub(1),
            "Relay: forwarding tool descriptor update"
        );
        for other in active.values() {
            if other.session_id() == session.session_id() {
                continue;
            }
            other.enqueue(DEFAULT_CHANNEL_ID, block.clone());
        }
        Ok(())
    }

    async fn handle_channel_init(&self, session: &SessionRef, block: MessageBlock) -> UplinkResult<()> {
        let request = decode_channel_creation_request(&block)?;
        let destination = match self.find_session_with_retry(&request.destination_id).await {
            None => {
                warn!(
                    session = session.session_id(),
                    destination = %request.destination_id,
                    "Relay: no session matches the requested destination"
                );
                return self.refuse_channel(session, &request.request_id);
            }
            Some(d) if d.session_id() == session.session_id() => {
                warn!(session = session.session_id(), "Relay: refusing a channel to the requesting session itself");
                return self.refuse_channel(session, &request.request_id);
            }
            Some(d) => d,
        };

        let channel_id = self.channel_id_counter.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            channel = channel_id,
            channel_type = %request.channel_type,
            initiator = session.session_id(),
            destination = destination.session_id(),
            "Relay: offering channel"
        );
        lock(&self.channels).insert(
            channel_id,
            ChannelBinding {
                initiator: Arc::clone(session),
                destination: Arc::clone(&destination),
                channel_type: request.channel_type.clone(),
            },
        );
        let offer = ChannelCreationRequest {
            channel_id,
            ..request
        };
        if !destination.enqueue(DEFAULT_CHANNEL_ID, encode_channel_creation_request(&offer)?) {
            lock(&self.channels).remove(&channel_id);
            return self.refuse_channel(session, &offer.request_id);
        }
        Ok(())
    }

    fn refuse_channel(&self, session: &SessionRef, request_id: &str) -> UplinkResult<()> {
        let response = ChannelCreationResponse {
            channel_id: UNDEFINED_CHANNEL_ID,
            request_id: request_id.to_string(),
            success: false,
        };
        session.enqueue(DEFAULT_CHANNEL_ID, encode_channel_creation_response(&response)?);
        Ok(())
    }

    fn handle_channel_init_response(&self, session: &SessionRef, block: MessageBlock) -> UplinkResult<()> {
        let response = decode_channel_creation_response(&block)?;
        let parties = lock(&self.channels)
            .get(&response.channel_id)
            .map(|b| (Arc::clone(&b.initiator), Arc::clone(&b.destination), b.channel_type.clone()));
        let Some((initiator, destination, channel_type)) = parties else {
            warn!(
                session = session.session_id(),
                channel = response.channel_id,
                "Relay: channel response for an unknown channel"
            );
            return Ok(());
        };
        if destination.session_id() != session.session_id() {
            error!(
                session = session.session_id(),
                expected = destination.session_id(),
                channel = response.channel_id,
                "Relay: channel response from an unexpected session, ignoring"
            );
            return Ok(());
        }

        let forwarded = if response.success {
            debug!(channel = response.channel_id, channel_type = %channel_type, "Relay: channel accepted");
            ChannelCreationResponse {
                success: true,
                ..response
            }
        } else {
            debug!(channel = response.channel_id, "Relay: channel declined");
            lock(&self.channels).remove(&response.channel_id);
            ChannelCreationResponse {
                channel_id: UNDEFINED_CHANNEL_ID,
                success: false,
                ..response
            }
        };
        initiator.enqueue(DEFAULT_CHANNEL_ID, encode_channel_creation_response(&forwarded)?);
        Ok(())
    }

    async fn find_session_with_retry(&self, destination_id: &str) -> Option<SessionRef> {
        for attempt in 1..=self.channel_init_attempts {
            if attempt > 1 {
                debug!(
                    attempt,
                    destination = destination_id,
                    delay_ms = self.channel_init_retry_delay.as_millis() as u64,
                    "Relay: retrying destination lookup"
                );
                tokio::time::sleep(self.channel_init_retry_delay).await;
            }
            if let Some(session) = self.find_session_for_destination(destination_id) {
                return Some(session);
            }
        }
        None
    }

    fn find_session_for_destination(&self, destination_id: &str) -> Option<SessionRef> {
        lock(&self.active_sessions)
            .values()
            .find(|s| {
                s.namespace_id()
                    .is_some_and(|ns| owns_destination(&ns, destination_id))
            })
            .cloned()
    }

    async fn forward_channel_message(&self, session: &SessionRef, channel_id: i64, block: MessageBlock) {
        let parties = lock(&self.channels)
            .get(&channel_id)
            .map(|b| (Arc::clone(&b.initiator), Arc::clone(&b.destination)));
        let Some((initiator, destination)) = parties else {
            warn!(
                session = session.session_id(),
                channel = channel_id,
                "Relay: message for a non-existing channel; it may have been closed"
            );
            return;
        };
        let source = session.session_id();
        let target = if source == initiator.session_id() {
            destination
        } else if source == destination.session_id() {
            initiator
        } else {
            error!(
                session = source,
                channel = channel_id,
                message_type = %block.message_type,
                "Relay: unauthorized message for a foreign channel, dropping"
            );
            return;
        };

        let closing = block.message_type == MessageType::ChannelClose;
        if !target.enqueue_blocking(channel_id, block).await {
            debug!(channel = channel_id, target = target.session_id(), "Relay: failed to forward channel message");
        }
        if closing {
            lock(&self.channels).remove(&channel_id);
            debug!(channel = channel_id, "Relay: channel closed");
        }
    }
}
