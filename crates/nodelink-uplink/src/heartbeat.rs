//! Server-side heartbeats.
//!
//! While a session is active the server sends a `HEARTBEAT` at a jittered
//! interval and the client answers with `HEARTBEAT_RESPONSE`. Before each
//! send the previous beat must have been answered within the response
//! timeout; otherwise the chain stops and the session's idle timeout takes
//! over. A failed send stops the chain as well.

use crate::outbox::Outbox;
use crate::protocol::{MessageBlock, MessageType, UplinkSessionState, DEFAULT_CHANNEL_ID};

use nodelink_types::config::UplinkConfig;
use nodelink_types::timing::jittered;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatCheck {
    /// Nothing outstanding, send the next beat.
    Ready,
    /// The last beat is unanswered but still within its timeout.
    Pending,
    /// The last beat was not answered in time.
    Missed,
}

#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    jitter: Duration,
    response_timeout: Duration,
    outstanding: Mutex<Option<Instant>>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, jitter: Duration, response_timeout: Duration) -> Self {
        Self {
            interval,
            jitter,
            response_timeout,
            outstanding: Mutex::new(None),
        }
    }

    pub fn from_config(config: &UplinkConfig) -> Self {
        Self::new(
            Duration::from_millis(config.heartbeat_interval_ms),
            Duration::from_millis(config.heartbeat_jitter_ms),
            Duration::from_millis(config.heartbeat_response_timeout_ms),
        )
    }

    pub fn next_delay(&self) -> Duration {
        jittered(self.interval, self.jitter)
    }

    pub fn check(&self, now: Instant) -> HeartbeatCheck {
        match *self.outstanding.lock().unwrap_or_else(|e| e.into_inner()) {
            None => HeartbeatCheck::Ready,
            Some(sent) if now.saturating_duration_since(sent) < self.response_timeout => {
                HeartbeatCheck::Pending
            }
            Some(_) => HeartbeatCheck::Missed,
        }
    }

    pub fn record_sent(&self, now: Instant) {
        *self.outstanding.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
    }

    /// Returns the round trip time of the answered beat, if one was
    /// outstanding.
    pub fn record_response(&self, now: Instant) -> Option<Duration> {
        self.outstanding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .map(|sent| now.saturating_duration_since(sent))
    }
}

/// Run the heartbeat chain until the session leaves the active state or
/// the chain stops.
pub fn spawn_heartbeat(
    session: String,
    monitor: Arc<HeartbeatMonitor>,
    outbox: Outbox,
    mut state: watch::Receiver<UplinkSessionState>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let delay = monitor.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow() != UplinkSessionState::Active {
                        break;
                    }
                    continue;
                }
            }
            if *state.borrow() != UplinkSessionState::Active {
                break;
            }
            let now = Instant::now();
            match monitor.check(now) {
                HeartbeatCheck::Ready => {}
                HeartbeatCheck::Pending => continue,
                HeartbeatCheck::Missed => {
                    warn!(session = %session, "Uplink: heartbeat response missing, stopping heartbeats");
                    break;
                }
            }
            let data = chrono::Utc::now().timestamp_millis().to_string().into_bytes();
            let block = MessageBlock {
                message_type: MessageType::Heartbeat,
                data,
            };
            if !outbox.try_enqueue(DEFAULT_CHANNEL_ID, block) {
                debug!(session = %session, "Uplink: failed to queue heartbeat, stopping heartbeats");
                break;
            }
            monitor.record_sent(now);
        }
        debug!(session = %session, "Uplink: heartbeat chain ended");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            Duration::from_millis(100),
            Duration::from_millis(10),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn test_check_sequence() {
        let m = monitor();
        let t0 = Instant::now();
        assert_eq!(m.check(t0), HeartbeatCheck::Ready);
        m.record_sent(t0);
        assert_eq!(m.check(t0 + Duration::from_millis(10)), HeartbeatCheck::Pending);
        assert_eq!(m.check(t0 + Duration::from_millis(60)), HeartbeatCheck::Missed);
        assert_eq!(
            m.record_response(t0 + Duration::from_millis(20)),
            Some(Duration::from_millis(20))
        );
        assert_eq!(m.check(t0 + Duration::from_millis(60)), HeartbeatCheck::Ready);
        assert_eq!(m.record_response(t0), None);
    }

    #[test]
    fn test_delay_is_jittered_within_spread() {
        let m = monitor();
        for _ in 0..100 {
            let d = m.next_delay();
            assert!(d >= Duration::from_millis(90) && d <= Duration::from_millis(110));
        }
    }

    #[tokio::test]
    async fn test_chain_stops_without_responses() {
        let (a, mut b) = tokio::io::duplex(4096);
        let (outbox, _writer) = Outbox::spawn(a, 8, "t".into());
        let (_state_tx, state_rx) = watch::channel(UplinkSessionState::Active);
        let monitor = Arc::new(HeartbeatMonitor::new(
            Duration::from_millis(20),
            Duration::ZERO,
            Duration::from_millis(30),
        ));
        let chain = spawn_heartbeat("t".into(), monitor, outbox, state_rx);
        tokio::time::timeout(Duration::from_secs(2), chain)
            .await
            .unwrap()
            .unwrap();

        let (_, first) = crate::codec::read_block(&mut b).await.unwrap();
        assert_eq!(first.message_type, MessageType::Heartbeat);
    }
}
