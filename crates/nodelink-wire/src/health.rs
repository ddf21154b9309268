//! Periodic health checks on outgoing channels.
//!
//! Every outgoing channel gets a background task that sends a
//! `health_check` request carrying a random token at a jittered interval.
//! The remote channel service echoes the token. After
//! `max_consecutive_failures` failed or mismatching checks in a row the
//! channel is marked broken, which hands it to the normal broken-channel
//! path (routing table update, reconnect of its connection setup).

use crate::channel::MessageChannel;
use crate::channel_service::MessageChannelLifecycleListener;

use nodelink_types::config::HealthCheckConfig;
use nodelink_types::message::message_type;
use nodelink_types::timing::jittered;
use nodelink_types::{InstanceNodeSessionId, NetworkRequest};
use rand::RngCore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct ChannelHealthChecker {
    local: InstanceNodeSessionId,
    config: HealthCheckConfig,
}

impl ChannelHealthChecker {
    pub fn new(local: InstanceNodeSessionId, config: HealthCheckConfig) -> Arc<Self> {
        Arc::new(Self { local, config })
    }

    /// One check; true when the token came back.
    pub async fn check(&self, channel: &MessageChannel) -> bool {
        let mut token = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut token);
        let request = NetworkRequest::new(
            message_type::HEALTH_CHECK,
            token.clone(),
            self.local.clone(),
            channel.remote_node().node_id.clone(),
        );
        let response = channel
            .send_request(request, Duration::from_millis(self.config.timeout_ms))
            .await;
        if !response.is_success() {
            debug!(
                channel = %channel.channel_id(),
                failure = %response.failure_description(),
                "Health: check failed"
            );
            return false;
        }
        response.body == token
    }

    async fn run(self: Arc<Self>, channel: Arc<MessageChannel>) {
        let interval = Duration::from_millis(self.config.interval_ms);
        let jitter = Duration::from_millis(self.config.jitter_ms);
        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(jittered(interval, jitter)) => {}
                _ = channel.closed() => return,
            }
            if !channel.is_established() {
                return;
            }
            if self.check(&channel).await {
                failures = 0;
                continue;
            }
            failures += 1;
            warn!(
                channel = %channel.channel_id(),
                remote = %channel.remote_node(),
                failures,
                "Health: channel did not answer health check"
            );
            if failures >= self.config.max_consecutive_failures {
                channel.mark_broken();
                return;
            }
        }
    }
}

impl MessageChannelLifecycleListener for ChannelHealthChecker {
    fn on_outgoing_channel_established(&self, channel: &Arc<MessageChannel>) {
        if !self.config.enabled {
            return;
        }
        let checker = Arc::new(Self {
            local: self.local.clone(),
            config: self.config.clone(),
        });
        tokio::spawn(checker.run(Arc::clone(channel)));
    }

    fn on_outgoing_channel_terminated(&self, _channel: &Arc<MessageChannel>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelParams, RawRequestHandler};
    use async_trait::async_trait;
    use nodelink_types::{InitialNodeInformation, NetworkResponse};

    struct Silent;

    #[async_trait]
    impl RawRequestHandler for Silent {
        async fn handle_raw_request(
            &self,
            request: NetworkRequest,
            _source: &Arc<MessageChannel>,
        ) -> NetworkResponse {
            tokio::time::sleep(Duration::from_secs(5)).await;
            NetworkResponse::success(&request, Vec::new())
        }
    }

    struct Echo;

    #[async_trait]
    impl RawRequestHandler for Echo {
        async fn handle_raw_request(
            &self,
            request: NetworkRequest,
            _source: &Arc<MessageChannel>,
        ) -> NetworkResponse {
            NetworkResponse::success(&request, request.body.clone())
        }
    }

    fn pair(remote_handler: Arc<dyn RawRequestHandler>) -> (Arc<MessageChannel>, Arc<MessageChannel>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let info = |n: &str| InitialNodeInformation::new(InstanceNodeSessionId::new(n, "1"), n);
        let local = MessageChannel::spawn(
            Box::new(a),
            ChannelParams {
                channel_id: "l".into(),
                mirror_channel_id: "r".into(),
                remote: info("remote"),
                initiated_by_remote: false,
            },
            Arc::new(Echo),
        );
        let remote = MessageChannel::spawn(
            Box::new(b),
            ChannelParams {
                channel_id: "r".into(),
                mirror_channel_id: "l".into(),
                remote: info("local"),
                initiated_by_remote: true,
            },
            remote_handler,
        );
        (local, remote)
    }

    fn config() -> HealthCheckConfig {
        HealthCheckConfig {
            enabled: true,
            interval_ms: 20,
            jitter_ms: 5,
            timeout_ms: 30,
            max_consecutive_failures: 3,
        }
    }

    #[tokio::test]
    async fn test_check_succeeds_with_echo() {
        let (local, _remote) = pair(Arc::new(Echo));
        let checker = ChannelHealthChecker::new(InstanceNodeSessionId::new("local", "1"), config());
        assert!(checker.check(&local).await);
    }

    #[tokio::test]
    async fn test_unresponsive_channel_is_marked_broken() {
        let (local, _remote) = pair(Arc::new(Silent));
        let checker = ChannelHealthChecker::new(InstanceNodeSessionId::new("local", "1"), config());
        checker.on_outgoing_channel_established(&local);
        tokio::time::timeout(Duration::from_secs(2), local.closed())
            .await
            .unwrap();
        assert_eq!(
            local.close_reason(),
            Some(crate::channel::ChannelCloseReason::Broken)
        );
    }

    #[tokio::test]
    async fn test_disabled_checker_does_nothing() {
        let (local, _remote) = pair(Arc::new(Silent));
        let mut cfg = config();
        cfg.enabled = false;
        let checker = ChannelHealthChecker::new(InstanceNodeSessionId::new("local", "1"), cfg);
        checker.on_outgoing_channel_established(&local);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(local.is_established());
    }
}
