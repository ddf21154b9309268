//! MessageChannel: one directed logical connection leg between two nodes.
//!
//! A channel is created in [`MessageChannelState::Established`] once the
//! handshake on a physical connection succeeded. Both sides of a connection
//! own one channel object each; the id the remote side assigned is known
//! locally as the *mirror channel id*. Requests sent by either side travel
//! over the same stream and are correlated with their responses by request
//! id, so responses may arrive in any order.
//!
//! Termination happens exactly once and notifies exactly one listener:
//! the [`BrokenMessageChannelListener`] when the connection was lost, or the
//! [`ChannelClosedListener`] for a local `close()` or a goodbye from the
//! mirror channel.

use crate::message::{WireMessage, WireMessageKind};
use crate::transport::{read_message, write_message, BoxedStream};
use crate::error::WireError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nodelink_types::{InitialNodeInformation, NetworkRequest, NetworkResponse, ResultCode};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Channel ids are assigned by the local side and unique per node run.
pub type ChannelId = String;

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageChannelState {
    Established,
    Closed,
}

/// Why a channel reached [`MessageChannelState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelCloseReason {
    /// `close()` was called locally.
    ClosedLocally,
    /// The remote side closed its mirror channel.
    ClosedByMirror,
    /// The underlying connection failed.
    Broken,
}

/// Notified when a channel was lost unexpectedly.
pub trait BrokenMessageChannelListener: Send + Sync {
    fn on_channel_broken(&self, channel: &Arc<MessageChannel>);
}

/// Notified when a channel was shut down gracefully.
pub trait ChannelClosedListener: Send + Sync {
    /// `by_mirror` is true when the remote side initiated the close.
    fn on_channel_closed(&self, channel: &Arc<MessageChannel>, by_mirror: bool);
}

/// Handles requests that arrive on a channel.
#[async_trait]
pub trait RawRequestHandler: Send + Sync + 'static {
    async fn handle_raw_request(
        &self,
        request: NetworkRequest,
        source: &Arc<MessageChannel>,
    ) -> NetworkResponse;
}

/// Construction parameters gathered during the handshake.
#[derive(Debug, Clone)]
pub struct ChannelParams {
    pub channel_id: ChannelId,
    pub mirror_channel_id: ChannelId,
    pub remote: InitialNodeInformation,
    pub initiated_by_remote: bool,
}

enum Outbound {
    Frame(WireMessage),
    Shutdown { goodbye: bool },
}

pub struct MessageChannel {
    channel_id: ChannelId,
    mirror_channel_id: ChannelId,
    remote: InitialNodeInformation,
    initiated_by_remote: bool,
    created_at: DateTime<Utc>,
    state: watch::Sender<MessageChannelState>,
    close_reason: Mutex<Option<ChannelCloseReason>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: DashMap<String, oneshot::Sender<NetworkResponse>>,
    broken_listener: RwLock<Option<Arc<dyn BrokenMessageChannelListener>>>,
    closed_listener: RwLock<Option<Arc<dyn ChannelClosedListener>>>,
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("channel_id", &self.channel_id)
            .field("mirror_channel_id", &self.mirror_channel_id)
            .field("remote", &self.remote.node_id)
            .field("state", &self.state())
            .finish()
    }
}

impl MessageChannel {
    /// Wrap an already handshaked stream and start its I/O tasks.
    pub fn spawn(
        stream: BoxedStream,
        params: ChannelParams,
        handler: Arc<dyn RawRequestHandler>,
    ) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(MessageChannelState::Established);
        let channel = Arc::new(Self {
            channel_id: params.channel_id,
            mirror_channel_id: params.mirror_channel_id,
            remote: params.remote,
            initiated_by_remote: params.initiated_by_remote,
            created_at: Utc::now(),
            state: state_tx,
            close_reason: Mutex::new(None),
            outbound: outbound_tx,
            pending: DashMap::new(),
            broken_listener: RwLock::new(None),
            closed_listener: RwLock::new(None),
        });

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(writer_loop(Arc::downgrade(&channel), writer, outbound_rx));
        tokio::spawn(reader_loop(Arc::clone(&channel), reader, handler));

        debug!(
            channel = %channel.channel_id,
            mirror = %channel.mirror_channel_id,
            remote = %channel.remote.node_id,
            "Channel: established"
        );
        channel
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// The id the remote side assigned to the same connection.
    pub fn mirror_channel_id(&self) -> &str {
        &self.mirror_channel_id
    }

    pub fn remote_node(&self) -> &InitialNodeInformation {
        &self.remote
    }

    /// True for channels created by accepting an inbound connection.
    pub fn initiated_by_remote(&self) -> bool {
        self.initiated_by_remote
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> MessageChannelState {
        *self.state.borrow()
    }

    pub fn is_established(&self) -> bool {
        self.state() == MessageChannelState::Established
    }

    pub fn close_reason(&self) -> Option<ChannelCloseReason> {
        *self.close_reason.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Watch state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<MessageChannelState> {
        self.state.subscribe()
    }

    /// Resolve once the channel is closed.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == MessageChannelState::Closed).await;
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }

    pub fn set_broken_listener(&self, listener: Arc<dyn BrokenMessageChannelListener>) {
        *self
            .broken_listener
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    pub fn set_closed_listener(&self, listener: Arc<dyn ChannelClosedListener>) {
        *self
            .closed_listener
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(listener);
    }

    /// Send a request and wait for its response.
    ///
    /// Always yields exactly one response. A channel that is not established
    /// answers with `CHANNEL_CLOSED_OR_BROKEN_BEFORE_SENDING_REQUEST`; a
    /// missing reply turns into a synthetic `TIMEOUT_WAITING_FOR_RESPONSE`.
    pub async fn send_request(&self, request: NetworkRequest, timeout: Duration) -> NetworkResponse {
        let request_id = request.request_id.clone();
        if !self.is_established() {
            return self.not_established_response(&request_id);
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);
        if !self.is_established() {
            self.pending.remove(&request_id);
            return self.not_established_response(&request_id);
        }

        let frame = WireMessage::new(WireMessageKind::Request(request));
        if self.outbound.send(Outbound::Frame(frame)).is_err() {
            self.pending.remove(&request_id);
            return self.not_established_response(&request_id);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => NetworkResponse::failure(
                request_id,
                ResultCode::ChannelClosedWhileWaitingForResponse,
                format!("Channel {} closed while waiting for a response", self.channel_id),
            ),
            Err(_) => {
                self.pending.remove(&request_id);
                NetworkResponse::failure(
                    request_id,
                    ResultCode::TimeoutWaitingForResponse,
                    format!(
                        "No response from {} within {} ms",
                        self.remote.node_id,
                        timeout.as_millis()
                    ),
                )
            }
        }
    }

    /// Callback-style variant of [`send_request`](Self::send_request): the
    /// handler runs exactly once on a background task.
    pub fn send_request_with_handler<F>(
        self: &Arc<Self>,
        request: NetworkRequest,
        timeout: Duration,
        handler: F,
    ) where
        F: FnOnce(NetworkResponse) + Send + 'static,
    {
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            let response = channel.send_request(request, timeout).await;
            handler(response);
        });
    }

    /// Close this channel and, through a goodbye frame, its mirror.
    ///
    /// Idempotent; only the first call has an effect.
    pub fn close(self: &Arc<Self>) {
        if self.terminate(ChannelCloseReason::ClosedLocally) {
            info!(
                channel = %self.channel_id,
                remote = %self.remote.node_id,
                "Channel: closed"
            );
        }
    }

    /// Treat the connection as lost (e.g. after failed health checks).
    pub fn mark_broken(self: &Arc<Self>) {
        if self.terminate(ChannelCloseReason::Broken) {
            warn!(
                channel = %self.channel_id,
                remote = %self.remote.node_id,
                "Channel: marked as broken"
            );
        }
    }

    fn not_established_response(&self, request_id: &str) -> NetworkResponse {
        NetworkResponse::failure(
            request_id,
            ResultCode::ChannelClosedOrBrokenBeforeSendingRequest,
            format!("Channel {} is not established", self.channel_id),
        )
    }

    fn send_frame(&self, frame: WireMessage) {
        if self.outbound.send(Outbound::Frame(frame)).is_err() {
            debug!(channel = %self.channel_id, "Channel: dropped frame after shutdown");
        }
    }

    fn complete_pending(&self, response: NetworkResponse) {
        match self.pending.remove(&response.request_id) {
            Some((_, tx)) => {
                let _ = tx.send(response);
            }
            None => debug!(
                channel = %self.channel_id,
                request = %response.request_id,
                "Channel: response for unknown or timed out request"
            ),
        }
    }

    /// Handle a frame that exceeded the size limit before it was written.
    ///
    /// An outgoing request fails locally. An outgoing response is replaced
    /// by an `EXCEPTION_AT_DESTINATION` failure for the same request id,
    /// which is returned for the writer to send instead.
    fn reject_oversized(&self, frame: WireMessage, size: u32, max: u32) -> Option<WireMessage> {
        match frame.kind {
            WireMessageKind::Request(request) => {
                warn!(
                    channel = %self.channel_id,
                    request = %request.request_id,
                    size,
                    "Channel: request frame too large, not sent"
                );
                self.complete_pending(NetworkResponse::failure(
                    request.request_id,
                    ResultCode::Undefined,
                    format!("Request of {size} bytes exceeds the frame limit of {max} bytes"),
                ));
                None
            }
            WireMessageKind::Response(response) => {
                warn!(
                    channel = %self.channel_id,
                    request = %response.request_id,
                    size,
                    "Channel: response frame too large, sending failure instead"
                );
                Some(WireMessage::new(WireMessageKind::Response(
                    NetworkResponse::failure(
                        response.request_id,
                        ResultCode::ExceptionAtDestination,
                        format!("Response of {size} bytes exceeds the frame limit of {max} bytes"),
                    ),
                )))
            }
            other => {
                warn!(
                    channel = %self.channel_id,
                    size,
                    "Channel: dropped oversized frame {:?}",
                    other
                );
                None
            }
        }
    }

    /// Transition to closed. Returns false if the channel was already closed.
    fn terminate(self: &Arc<Self>, reason: ChannelCloseReason) -> bool {
        {
            let mut current = self.close_reason.lock().unwrap_or_else(|e| e.into_inner());
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
        }
        self.state.send_replace(MessageChannelState::Closed);
        let _ = self.outbound.send(Outbound::Shutdown {
            goodbye: reason == ChannelCloseReason::ClosedLocally,
        });

        let in_flight: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for request_id in in_flight {
            if let Some((_, tx)) = self.pending.remove(&request_id) {
                let _ = tx.send(NetworkResponse::failure(
                    request_id,
                    ResultCode::ChannelClosedWhileWaitingForResponse,
                    format!("Channel {} closed while waiting for a response", self.channel_id),
                ));
            }
        }

        match reason {
            ChannelCloseReason::Broken => {
                let listener = self
                    .broken_listener
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(listener) = listener {
                    listener.on_channel_broken(self);
                }
            }
            ChannelCloseReason::ClosedLocally | ChannelCloseReason::ClosedByMirror => {
                let listener = self
                    .closed_listener
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(listener) = listener {
                    listener
                        .on_channel_closed(self, reason == ChannelCloseReason::ClosedByMirror);
                }
            }
        }
        true
    }
}

async fn reader_loop(
    channel: Arc<MessageChannel>,
    mut reader: ReadHalf<BoxedStream>,
    handler: Arc<dyn RawRequestHandler>,
) {
    loop {
        let msg = match read_message(&mut reader).await {
            Ok(m) => m,
            Err(WireError::ConnectionClosed) => {
                channel.terminate(ChannelCloseReason::Broken);
                return;
            }
            Err(e) => {
                debug!(channel = %channel.channel_id, error = %e, "Channel: read failed");
                channel.terminate(ChannelCloseReason::Broken);
                return;
            }
        };

        match msg.kind {
            WireMessageKind::Request(request) => {
                let channel = Arc::clone(&channel);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let response = handler.handle_raw_request(request, &channel).await;
                    channel.send_frame(WireMessage::new(WireMessageKind::Response(response)));
                });
            }
            WireMessageKind::Response(response) => channel.complete_pending(response),
            WireMessageKind::Goodbye => {
                debug!(channel = %channel.channel_id, "Channel: mirror channel said goodbye");
                channel.terminate(ChannelCloseReason::ClosedByMirror);
                return;
            }
            other => {
                warn!(
                    channel = %channel.channel_id,
                    "Channel: unexpected frame after handshake: {:?}",
                    other
                );
            }
        }
    }
}

async fn writer_loop(
    channel: Weak<MessageChannel>,
    mut writer: WriteHalf<BoxedStream>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(frame) => match write_message(&mut writer, &frame).await {
                Ok(()) => {}
                // Nothing reached the stream, so the link stays usable.
                Err(WireError::MessageTooLarge { size, max }) => {
                    let Some(channel) = channel.upgrade() else {
                        return;
                    };
                    let Some(replacement) = channel.reject_oversized(frame, size, max) else {
                        continue;
                    };
                    if let Err(e) = write_message(&mut writer, &replacement).await {
                        debug!(channel = %channel.channel_id, error = %e, "Channel: write failed");
                        channel.terminate(ChannelCloseReason::Broken);
                        return;
                    }
                }
                Err(e) => {
                    if let Some(channel) = channel.upgrade() {
                        debug!(channel = %channel.channel_id, error = %e, "Channel: write failed");
                        channel.terminate(ChannelCloseReason::Broken);
                    }
                    return;
                }
            },
            Outbound::Shutdown { goodbye } => {
                if goodbye {
                    let _ = write_message(&mut writer, &WireMessage::new(WireMessageKind::Goodbye))
                        .await;
                }
                let _ = writer.shutdown().await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelink_types::message::message_type;
    use nodelink_types::InstanceNodeSessionId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler;

    #[async_trait]
    impl RawRequestHandler for EchoHandler {
        async fn handle_raw_request(
            &self,
            request: NetworkRequest,
            _source: &Arc<MessageChannel>,
        ) -> NetworkResponse {
            if request.body == b"slow" {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            if request.body == b"huge" {
                let body = vec![0u8; crate::transport::MAX_MESSAGE_SIZE as usize + 1];
                return NetworkResponse::success(&request, body);
            }
            NetworkResponse::success(&request, request.body.clone())
        }
    }

    #[derive(Default)]
    struct CountingListener {
        broken: AtomicUsize,
        closed: AtomicUsize,
        closed_by_mirror: AtomicUsize,
    }

    impl BrokenMessageChannelListener for CountingListener {
        fn on_channel_broken(&self, _channel: &Arc<MessageChannel>) {
            self.broken.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl ChannelClosedListener for CountingListener {
        fn on_channel_closed(&self, _channel: &Arc<MessageChannel>, by_mirror: bool) {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if by_mirror {
                self.closed_by_mirror.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn info(name: &str) -> InitialNodeInformation {
        InitialNodeInformation::new(InstanceNodeSessionId::new(name, "1"), name)
    }

    fn pair() -> (Arc<MessageChannel>, Arc<MessageChannel>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = MessageChannel::spawn(
            Box::new(a),
            ChannelParams {
                channel_id: "a-1".into(),
                mirror_channel_id: "b-1".into(),
                remote: info("b"),
                initiated_by_remote: false,
            },
            Arc::new(EchoHandler),
        );
        let right = MessageChannel::spawn(
            Box::new(b),
            ChannelParams {
                channel_id: "b-1".into(),
                mirror_channel_id: "a-1".into(),
                remote: info("a"),
                initiated_by_remote: true,
            },
            Arc::new(EchoHandler),
        );
        (left, right)
    }

    fn request(body: &[u8]) -> NetworkRequest {
        NetworkRequest::new(
            message_type::TEST,
            body.to_vec(),
            InstanceNodeSessionId::new("a", "1"),
            InstanceNodeSessionId::new("b", "1"),
        )
    }

    #[tokio::test]
    async fn test_request_response_both_directions() {
        let (left, right) = pair();
        let resp = left.send_request(request(b"ping"), Duration::from_secs(2)).await;
        assert!(resp.is_success());
        assert_eq!(resp.body, b"ping");
        let resp = right.send_request(request(b"pong"), Duration::from_secs(2)).await;
        assert_eq!(resp.body, b"pong");
        assert_eq!(left.mirror_channel_id(), right.channel_id());
        assert_eq!(right.mirror_channel_id(), left.channel_id());
    }

    #[tokio::test]
    async fn test_timeout_produces_synthetic_response() {
        let (left, _right) = pair();
        let resp = left
            .send_request(request(b"slow"), Duration::from_millis(50))
            .await;
        assert_eq!(resp.result_code, ResultCode::TimeoutWaitingForResponse);
        assert_eq!(left.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_invoked_exactly_once() {
        let (left, _right) = pair();
        let calls = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = oneshot::channel();
        let counter = Arc::clone(&calls);
        left.send_request_with_handler(request(b"x"), Duration::from_secs(2), move |resp| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(resp.result_code);
        });
        assert_eq!(done_rx.await.unwrap(), ResultCode::Success);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_notifies_closed_listener_on_both_sides() {
        let (left, right) = pair();
        let left_listener = Arc::new(CountingListener::default());
        let right_listener = Arc::new(CountingListener::default());
        left.set_broken_listener(left_listener.clone());
        left.set_closed_listener(left_listener.clone());
        right.set_broken_listener(right_listener.clone());
        right.set_closed_listener(right_listener.clone());

        left.close();
        left.close();
        tokio::time::timeout(Duration::from_secs(2), right.closed())
            .await
            .unwrap();

        assert_eq!(left.state(), MessageChannelState::Closed);
        assert_eq!(right.close_reason(), Some(ChannelCloseReason::ClosedByMirror));
        assert_eq!(left_listener.closed.load(Ordering::SeqCst), 1);
        assert_eq!(left_listener.broken.load(Ordering::SeqCst), 0);
        assert_eq!(right_listener.closed_by_mirror.load(Ordering::SeqCst), 1);
        assert_eq!(right_listener.broken.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_send_on_closed_channel_is_rejected() {
        let (left, _right) = pair();
        left.close();
        let resp = left.send_request(request(b"x"), Duration::from_secs(1)).await;
        assert_eq!(
            resp.result_code,
            ResultCode::ChannelClosedOrBrokenBeforeSendingRequest
        );
    }

    #[tokio::test]
    async fn test_broken_link_notifies_broken_listener_once() {
        let (a, b) = tokio::io::duplex(1024);
        let listener = Arc::new(CountingListener::default());
        let channel = MessageChannel::spawn(
            Box::new(a),
            ChannelParams {
                channel_id: "a-9".into(),
                mirror_channel_id: "b-9".into(),
                remote: info("b"),
                initiated_by_remote: false,
            },
            Arc::new(EchoHandler),
        );
        channel.set_broken_listener(listener.clone());
        channel.set_closed_listener(listener.clone());
        drop(b);
        tokio::time::timeout(Duration::from_secs(2), channel.closed())
            .await
            .unwrap();
        channel.close();
        assert_eq!(channel.close_reason(), Some(ChannelCloseReason::Broken));
        assert_eq!(listener.broken.load(Ordering::SeqCst), 1);
        assert_eq!(listener.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_in_flight_request_fails_when_mirror_closes() {
        let (left, right) = pair();
        let pending = {
            let left = Arc::clone(&left);
            tokio::spawn(async move { left.send_request(request(b"slow"), Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        right.close();
        let resp = pending.await.unwrap();
        assert_eq!(
            resp.result_code,
            ResultCode::ChannelClosedWhileWaitingForResponse
        );
    }

    #[tokio::test]
    async fn test_oversized_response_fails_only_that_request() {
        let (left, right) = pair();
        let listener = Arc::new(CountingListener::default());
        left.set_broken_listener(listener.clone());
        right.set_broken_listener(listener.clone());

        let resp = left.send_request(request(b"huge"), Duration::from_secs(10)).await;
        assert_eq!(resp.result_code, ResultCode::ExceptionAtDestination);
        assert!(resp.body.is_empty());

        assert!(left.is_established());
        assert!(right.is_established());
        let resp = left.send_request(request(b"after"), Duration::from_secs(2)).await;
        assert!(resp.is_success());
        assert_eq!(resp.body, b"after");
        assert_eq!(listener.broken.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_oversized_request_fails_locally() {
        let (left, right) = pair();
        let body = vec![1u8; crate::transport::MAX_MESSAGE_SIZE as usize + 1];
        let resp = left.send_request(request(&body), Duration::from_secs(10)).await;
        assert_eq!(resp.result_code, ResultCode::Undefined);
        assert_eq!(left.pending_request_count(), 0);

        let resp = right.send_request(request(b"still-up"), Duration::from_secs(2)).await;
        assert_eq!(resp.body, b"still-up");
    }
}
