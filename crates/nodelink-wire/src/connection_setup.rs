//! Configured outgoing connections.
//!
//! A [`ConnectionSetup`] is the user's intent to be connected to a contact
//! point. It outlives individual channels: every connect/disconnect cycle
//! passes through the same state machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnecting -> Disconnected
//!                     |             |
//!                     +-------------+--> WaitingToReconnect -> Connecting
//! ```
//!
//! Start and stop requests are intents processed by a driver task; callers
//! that need a particular state wait for it with a timeout. Each setup has
//! exactly one writer of its state, so listeners see transitions in order.

use crate::channel::{ChannelCloseReason, MessageChannel};
use crate::channel_service::MessageChannelService;
use crate::error::{WireError, WireResult};
use crate::transport::NetworkContactPoint;

use dashmap::DashMap;
use nodelink_types::config::ConnectionConfig;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionSetupState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    WaitingToReconnect,
}

impl fmt::Display for ConnectionSetupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionSetupState::Disconnected => "disconnected",
            ConnectionSetupState::Connecting => "connecting",
            ConnectionSetupState::Connected => "connected",
            ConnectionSetupState::Disconnecting => "disconnecting",
            ConnectionSetupState::WaitingToReconnect => "waiting to reconnect",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No channel could be established.
    FailedToConnect,
    /// The connection was stopped locally.
    ActiveShutdown,
    /// The connection was lost.
    Error,
    /// The remote node closed the connection.
    RemoteShutdown,
}

/// Snapshot of a setup's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupStatus {
    pub state: ConnectionSetupState,
    /// Why the last connection ended; cleared when a new attempt starts.
    pub disconnect_reason: Option<DisconnectReason>,
    pub last_error: Option<String>,
}

pub trait ConnectionSetupListener: Send + Sync {
    fn on_state_changed(
        &self,
        setup: &ConnectionSetup,
        old: ConnectionSetupState,
        new: ConnectionSetupState,
    );
}

/// Reconnect behaviour.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub auto_retry: bool,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn never() -> Self {
        Self {
            auto_retry: false,
            initial_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (starting at 0).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let delay = self.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

impl From<&ConnectionConfig> for RetryPolicy {
    fn from(config: &ConnectionConfig) -> Self {
        Self {
            auto_retry: config.auto_retry,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            multiplier: config.retry_delay_multiplier,
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }
}

enum Intent {
    Start,
    Stop,
    Dispose,
}

type ListenerList = Arc<RwLock<Vec<Arc<dyn ConnectionSetupListener>>>>;

pub struct ConnectionSetup {
    id: u64,
    contact_point: NetworkContactPoint,
    display_name: String,
    status: watch::Sender<SetupStatus>,
    intents: mpsc::UnboundedSender<Intent>,
    channel: Mutex<Option<Arc<MessageChannel>>>,
    listeners: ListenerList,
}

impl fmt::Debug for ConnectionSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSetup")
            .field("id", &self.id)
            .field("contact_point", &self.contact_point)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl ConnectionSetup {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn contact_point(&self) -> &NetworkContactPoint {
        &self.contact_point
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn status(&self) -> SetupStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionSetupState {
        self.status.borrow().state
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.status.borrow().disconnect_reason
    }

    pub fn subscribe(&self) -> watch::Receiver<SetupStatus> {
        self.status.subscribe()
    }

    /// The currently active channel, if connected.
    pub fn channel(&self) -> Option<Arc<MessageChannel>> {
        self.channel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Ask the setup to connect. Returns immediately.
    pub fn signal_start_intent(&self) {
        let _ = self.intents.send(Intent::Start);
    }

    /// Ask the setup to disconnect. Returns immediately.
    pub fn signal_stop_intent(&self) {
        let _ = self.intents.send(Intent::Stop);
    }

    /// Wait until the setup is in `target`. False on timeout.
    pub async fn await_state(&self, target: ConnectionSetupState, timeout: Duration) -> bool {
        self.await_status(|s| s.state == target, timeout)
            .await
            .is_some()
    }

    /// Wait for a status matching `predicate`.
    pub async fn await_status<F>(&self, predicate: F, timeout: Duration) -> Option<SetupStatus>
    where
        F: Fn(&SetupStatus) -> bool,
    {
        let mut rx = self.status.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| predicate(s)).await.map(|s| s.clone()).ok()
        })
        .await;
        waited.ok().flatten()
    }

    fn set_channel(&self, channel: Option<Arc<MessageChannel>>) {
        *self.channel.lock().unwrap_or_else(|e| e.into_inner()) = channel;
    }

    fn transition(
        &self,
        new: ConnectionSetupState,
        reason: Option<DisconnectReason>,
        error: Option<String>,
    ) {
        let mut old = new;
        self.status.send_modify(|status| {
            old = status.state;
            status.state = new;
            status.disconnect_reason = reason;
            if new == ConnectionSetupState::Connecting {
                status.last_error = None;
            } else if error.is_some() {
                status.last_error = error;
            }
        });
        if old == new {
            return;
        }
        info!(
            setup = self.id,
            contact_point = %self.contact_point,
            from = %old,
            to = %new,
            reason = ?reason,
            "Connections: setup state changed"
        );
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener.on_state_changed(self, old, new);
        }
    }
}

/// What ended a connected phase.
enum SessionEnd {
    Lost(DisconnectReason),
    Stopped,
    Disposed,
}

struct Driver {
    setup: Weak<ConnectionSetup>,
    channels: Arc<MessageChannelService>,
    retry: RetryPolicy,
    intents: mpsc::UnboundedReceiver<Intent>,
}

impl Driver {
    async fn run(mut self) {
        while let Some(intent) = self.intents.recv().await {
            match intent {
                Intent::Start => {
                    if !self.run_until_stopped().await {
                        break;
                    }
                }
                Intent::Stop => {}
                Intent::Dispose => break,
            }
        }
        if let Some(setup) = self.setup.upgrade() {
            if let Some(channel) = setup.channel() {
                self.channels.close_outgoing_channel(&channel);
                setup.set_channel(None);
            }
        }
        debug!("Connections: setup driver stopped");
    }

    /// Connect and keep reconnecting per the retry policy. Returns false
    /// when the setup is disposed.
    async fn run_until_stopped(&mut self) -> bool {
        let mut attempt = 0u32;
        loop {
            let Some(setup) = self.setup.upgrade() else {
                return false;
            };
            setup.transition(ConnectionSetupState::Connecting, None, None);

            let channels = Arc::clone(&self.channels);
            let contact_point = setup.contact_point.clone();
            let connect = channels.connect(&contact_point, true);
            tokio::pin!(connect);
            let connected = loop {
                tokio::select! {
                    result = &mut connect => break result,
                    intent = self.intents.recv() => match intent {
                        Some(Intent::Start) => continue,
                        Some(Intent::Stop) => {
                            setup.transition(
                                ConnectionSetupState::Disconnected,
                                Some(DisconnectReason::ActiveShutdown),
                                None,
                            );
                            return true;
                        }
                        Some(Intent::Dispose) | None => {
                            setup.transition(
                                ConnectionSetupState::Disconnected,
                                Some(DisconnectReason::ActiveShutdown),
                                None,
                            );
                            return false;
                        }
                    },
                }
            };

            let (reason, error, permanent) = match connected {
                Ok(channel) => {
                    attempt = 0;
                    setup.set_channel(Some(Arc::clone(&channel)));
                    setup.transition(ConnectionSetupState::Connected, None, None);
                    match self.wait_while_connected(&channel).await {
                        SessionEnd::Lost(reason) => {
                            setup.set_channel(None);
                            (reason, None, reason == DisconnectReason::ActiveShutdown)
                        }
                        end @ (SessionEnd::Stopped | SessionEnd::Disposed) => {
                            setup.transition(ConnectionSetupState::Disconnecting, None, None);
                            self.channels.close_outgoing_channel(&channel);
                            channel.closed().await;
                            setup.set_channel(None);
                            setup.transition(
                                ConnectionSetupState::Disconnected,
                                Some(DisconnectReason::ActiveShutdown),
                                None,
                            );
                            return matches!(end, SessionEnd::Stopped);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        setup = setup.id,
                        contact_point = %contact_point,
                        error = %e,
                        "Connections: failed to connect"
                    );
                    let permanent = e.is_permanent();
                    (DisconnectReason::FailedToConnect, Some(e.to_string()), permanent)
                }
            };

            if permanent || !self.retry.auto_retry {
                setup.transition(ConnectionSetupState::Disconnected, Some(reason), error);
                return true;
            }

            let delay = self.retry.delay(attempt);
            attempt = attempt.saturating_add(1);
            setup.transition(ConnectionSetupState::WaitingToReconnect, Some(reason), error);
            debug!(setup = setup.id, delay_ms = delay.as_millis() as u64, "Connections: reconnecting later");
            drop(setup);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                intent = self.intents.recv() => match intent {
                    Some(Intent::Start) => {}
                    Some(Intent::Stop) => {
                        if let Some(setup) = self.setup.upgrade() {
                            setup.transition(
                                ConnectionSetupState::Disconnected,
                                Some(DisconnectReason::ActiveShutdown),
                                None,
                            );
                        }
                        return true;
                    }
                    Some(Intent::Dispose) | None => return false,
                },
            }
        }
    }

    async fn wait_while_connected(&mut self, channel: &Arc<MessageChannel>) -> SessionEnd {
        loop {
            tokio::select! {
                _ = channel.closed() => {
                    let reason = match channel.close_reason() {
                        Some(ChannelCloseReason::ClosedByMirror) => DisconnectReason::RemoteShutdown,
                        Some(ChannelCloseReason::ClosedLocally) => DisconnectReason::ActiveShutdown,
                        _ => DisconnectReason::Error,
                    };
                    return SessionEnd::Lost(reason);
                }
                intent = self.intents.recv() => match intent {
                    Some(Intent::Start) => {}
                    Some(Intent::Stop) => return SessionEnd::Stopped,
                    Some(Intent::Dispose) | None => return SessionEnd::Disposed,
                },
            }
        }
    }
}

/// Owns all configured connections of a node.
pub struct ConnectionSetupService {
    channels: Arc<MessageChannelService>,
    setups: DashMap<u64, Arc<ConnectionSetup>>,
    listeners: ListenerList,
    next_id: AtomicU64,
}

impl ConnectionSetupService {
    pub fn new(channels: Arc<MessageChannelService>) -> Self {
        Self {
            channels,
            setups: DashMap::new(),
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Listeners are shared by all setups, including later ones.
    pub fn add_listener(&self, listener: Arc<dyn ConnectionSetupListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Create a setup in state `Disconnected`. Must be called within a
    /// tokio runtime.
    pub fn create(
        &self,
        contact_point: NetworkContactPoint,
        display_name: impl Into<String>,
        retry: RetryPolicy,
    ) -> Arc<ConnectionSetup> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (status, _) = watch::channel(SetupStatus {
            state: ConnectionSetupState::Disconnected,
            disconnect_reason: None,
            last_error: None,
        });
        let (intents, rx) = mpsc::unbounded_channel();
        let setup = Arc::new(ConnectionSetup {
            id,
            contact_point,
            display_name: display_name.into(),
            status,
            intents,
            channel: Mutex::new(None),
            listeners: Arc::clone(&self.listeners),
        });

        let driver = Driver {
            setup: Arc::downgrade(&setup),
            channels: Arc::clone(&self.channels),
            retry,
            intents: rx,
        };
        tokio::spawn(driver.run());

        self.setups.insert(id, Arc::clone(&setup));
        debug!(setup = id, contact_point = %setup.contact_point, "Connections: setup created");
        setup
    }

    /// Create a setup from configuration, starting it if `auto_start` is set.
    pub fn create_from_config(&self, config: &ConnectionConfig) -> WireResult<Arc<ConnectionSetup>> {
        let contact_point: NetworkContactPoint = config.contact_point.parse()?;
        let setup = self.create(
            contact_point.clone(),
            contact_point.to_string(),
            RetryPolicy::from(config),
        );
        if config.auto_start {
            setup.signal_start_intent();
        }
        Ok(setup)
    }

    pub fn get(&self, id: u64) -> Option<Arc<ConnectionSetup>> {
        self.setups.get(&id).map(|s| Arc::clone(s.value()))
    }

    pub fn setups(&self) -> Vec<Arc<ConnectionSetup>> {
        let mut setups: Vec<_> = self.setups.iter().map(|s| Arc::clone(s.value())).collect();
        setups.sort_by_key(|s| s.id);
        setups
    }

    /// Stop and forget a setup.
    pub fn dispose(&self, id: u64) -> WireResult<()> {
        let (_, setup) = self
            .setups
            .remove(&id)
            .ok_or_else(|| WireError::ConnectionRejected(format!("no connection setup {id}")))?;
        let _ = setup.intents.send(Intent::Dispose);
        Ok(())
    }

    pub fn dispose_all(&self) {
        let ids: Vec<u64> = self.setups.iter().map(|s| *s.key()).collect();
        for id in ids {
            let _ = self.dispose(id);
        }
    }
}
