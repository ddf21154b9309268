//! End-to-end tests: client sessions talking to a relay over in-memory streams.

use nodelink_types::config::{UnknownMessagePolicy, UplinkConfig};
use nodelink_uplink::protocol::{channel_types, handshake_keys};
use nodelink_uplink::{
    ChannelCreationRequest, ChannelOfferHandler, ClientSessionEventHandler,
    ClientSessionParameters, ClientSideUplinkSession, MessageBlock, MessageType, PermissionSet,
    ServerSideUplinkSession, StaticGroupAuthorization, ToolDescriptor, ToolDescriptorListUpdate,
    ToolPublication, UplinkChannel, UplinkError, UplinkErrorType, UplinkRelayService,
    UplinkSessionState,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct RecordingEvents {
    updates: Mutex<Vec<ToolDescriptorListUpdate>>,
    default_messages: Mutex<Vec<MessageBlock>>,
    fatal_errors: Mutex<Vec<UplinkErrorType>>,
}

impl ClientSessionEventHandler for RecordingEvents {
    fn on_tool_descriptor_list_update(&self, update: ToolDescriptorListUpdate) {
        self.updates.lock().unwrap().push(update);
    }

    fn on_default_channel_message(&self, block: MessageBlock) {
        self.default_messages.lock().unwrap().push(block);
    }

    fn on_fatal_session_error(&self, error_type: UplinkErrorType, _message: &str) {
        self.fatal_errors.lock().unwrap().push(error_type);
    }
}

/// Accepts execution channels and echoes everything back.
struct EchoChannels;

impl ChannelOfferHandler for EchoChannels {
    fn accepts(&self, channel_type: &str) -> bool {
        channel_type == channel_types::TOOL_EXECUTION
    }

    fn on_channel_opened(&self, _offer: ChannelCreationRequest, mut channel: UplinkChannel) {
        tokio::spawn(async move {
            while let Some(block) = channel.recv().await {
                if channel.send(block).await.is_err() {
                    break;
                }
            }
        });
    }
}

struct Relay {
    relay: Arc<UplinkRelayService>,
    config: Arc<UplinkConfig>,
}

impl Relay {
    fn new(config: UplinkConfig) -> Self {
        Self {
            relay: Arc::new(UplinkRelayService::new(&config)),
            config: Arc::new(config),
        }
    }

    async fn connect(
        &self,
        params: ClientSessionParameters,
        events: Arc<RecordingEvents>,
        offers: Option<Arc<dyn ChannelOfferHandler>>,
    ) -> Result<Arc<ClientSideUplinkSession>, UplinkError> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let _ = ServerSideUplinkSession::accept(
            server_io,
            "in-memory".to_string(),
            None,
            Arc::clone(&self.relay),
            Arc::clone(&self.config),
        );
        ClientSideUplinkSession::connect(client_io, params, events, offers).await
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn exec_tool(id: &str) -> ToolPublication {
    ToolPublication {
        descriptor: ToolDescriptor::new(id, "1.0"),
        permissions: PermissionSet::public(),
    }
}

#[tokio::test]
async fn test_session_gets_padded_namespace() {
    let relay = Relay::new(UplinkConfig::default());
    let session = relay
        .connect(
            ClientSessionParameters::new("alice").with_session_qualifier("ws1"),
            Arc::new(RecordingEvents::default()),
            None,
        )
        .await
        .unwrap();

    assert_eq!(session.namespace_id(), "alice###########ws1#####");
    assert_eq!(session.destination_id("tools"), "alice###########ws1#####tools");
    assert_eq!(session.state(), UplinkSessionState::Active);
    wait_until(|| relay.relay.active_session_count() == 1).await;

    session.close().await;
    assert_eq!(
        session.wait_terminated(Duration::from_secs(2)).await,
        Some(UplinkSessionState::CleanShutdown)
    );
    wait_until(|| relay.relay.active_session_count() == 0).await;
    assert!(!relay.relay.is_namespace_assigned("alice###########ws1#####"));
}

#[tokio::test]
async fn test_duplicate_namespace_is_refused() {
    let relay = Relay::new(UplinkConfig::default());
    let _first = relay
        .connect(
            ClientSessionParameters::new("bob"),
            Arc::new(RecordingEvents::default()),
            None,
        )
        .await
        .unwrap();

    let events = Arc::new(RecordingEvents::default());
    let err = relay
        .connect(ClientSessionParameters::new("bob"), Arc::clone(&events), None)
        .await
        .err()
        .expect("second session must be refused");
    match err {
        UplinkError::Refused { error_type, message } => {
            assert_eq!(error_type, UplinkErrorType::ClientNamespaceCollision);
            assert!(message.contains("already in use"), "{message}");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(
        *events.fatal_errors.lock().unwrap(),
        vec![UplinkErrorType::ClientNamespaceCollision]
    );

    // a different qualifier is a different namespace
    relay
        .connect(
            ClientSessionParameters::new("bob").with_session_qualifier("laptop"),
            Arc::new(RecordingEvents::default()),
            None,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_protocol_version_mismatch_is_refused() {
    let relay = Relay::new(UplinkConfig::default());
    let mut params = ClientSessionParameters::new("carol");
    params
        .custom_handshake_data
        .insert(handshake_keys::PROTOCOL_VERSION_OFFER.into(), "0.0".into());

    let err = relay
        .connect(params, Arc::new(RecordingEvents::default()), None)
        .await
        .err()
        .expect("handshake must fail");
    assert!(matches!(
        err,
        UplinkError::Refused {
            error_type: UplinkErrorType::ProtocolVersionMismatch,
            ..
        }
    ));
    assert!(!relay.relay.is_namespace_assigned("carol###########default#"));
}

#[tokio::test]
async fn test_descriptors_propagate_and_retract() {
    let relay = Relay::new(UplinkConfig::default());
    let a_events = Arc::new(RecordingEvents::default());
    let a = relay
        .connect(ClientSessionParameters::new("alice"), Arc::clone(&a_events), None)
        .await
        .unwrap();
    let b_events = Arc::new(RecordingEvents::default());
    let b = relay
        .connect(ClientSessionParameters::new("bob"), Arc::clone(&b_events), None)
        .await
        .unwrap();
    wait_until(|| relay.relay.active_session_count() == 2).await;

    let auth = StaticGroupAuthorization::new(["team"]);
    let hidden = ToolPublication {
        descriptor: ToolDescriptor::new("secret", "1.0"),
        permissions: PermissionSet::groups(["other-team"]),
    };
    let update = a
        .publish_tool_descriptors("tools", "Alice's tools", &[exec_tool("grep"), hidden], &auth)
        .await
        .unwrap();
    assert_eq!(update.tool_descriptors.len(), 1);

    wait_until(|| b_events.updates.lock().unwrap().len() == 1).await;
    let received = b_events.updates.lock().unwrap()[0].clone();
    assert_eq!(received.destination_id, a.destination_id("tools"));
    assert_eq!(received.tool_descriptors[0].tool_id, "grep");
    assert_eq!(received.tool_descriptors[0].authorization_group_ids, vec!["public"]);
    // no echo to the publisher
    assert!(a_events.updates.lock().unwrap().is_empty());

    // a late joiner gets the cached list
    let c_events = Arc::new(RecordingEvents::default());
    let _c = relay
        .connect(ClientSessionParameters::new("carol"), Arc::clone(&c_events), None)
        .await
        .unwrap();
    wait_until(|| c_events.updates.lock().unwrap().len() == 1).await;

    a.close().await;
    a.wait_terminated(Duration::from_secs(2)).await;
    wait_until(|| b_events.updates.lock().unwrap().len() == 2).await;
    let retraction = b_events.updates.lock().unwrap()[1].clone();
    assert!(retraction.is_retraction());
    assert_eq!(retraction.destination_id, a.destination_id("tools"));
    assert!(relay.relay.cached_destination_ids().is_empty());
    b.close().await;
}

#[tokio::test]
async fn test_channel_roundtrip_between_clients() {
    let relay = Relay::new(UplinkConfig::default());
    let provider = relay
        .connect(
            ClientSessionParameters::new("provider"),
            Arc::new(RecordingEvents::default()),
            Some(Arc::new(EchoChannels)),
        )
        .await
        .unwrap();
    let consumer = relay
        .connect(
            ClientSessionParameters::new("consumer"),
            Arc::new(RecordingEvents::default()),
            None,
        )
        .await
        .unwrap();
    provider
        .publish_tool_descriptors(
            "exec",
            "Provider",
            &[exec_tool("run")],
            &StaticGroupAuthorization::default(),
        )
        .await
        .unwrap();
    wait_until(|| relay.relay.cached_destination_ids().len() == 1).await;

    let destination = provider.destination_id("exec");
    let mut channel = consumer
        .request_channel(&destination, channel_types::TOOL_EXECUTION)
        .await
        .unwrap();
    assert!(channel.channel_id() > 0);
    assert_eq!(relay.relay.channel_count(), 1);

    let payload = MessageBlock::new(MessageType::ToolExecutionEvents, b"line 1".to_vec()).unwrap();
    channel.send(payload.clone()).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(2), channel.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, payload);

    // documentation channels are not served by the provider
    let err = consumer
        .request_channel(&destination, channel_types::DOCUMENTATION)
        .await
        .err()
        .expect("unsupported channel type");
    assert!(matches!(err, UplinkError::ChannelRequestFailed(_)));

    channel.close().await;
    wait_until(|| relay.relay.channel_count() == 0).await;
    wait_until(|| provider.open_channel_count() == 0).await;
}

#[tokio::test]
async fn test_unknown_messages_echo_when_configured() {
    let relay = Relay::new(UplinkConfig {
        unknown_message_policy: UnknownMessagePolicy::Echo,
        ..UplinkConfig::default()
    });
    let events = Arc::new(RecordingEvents::default());
    let session = relay
        .connect(ClientSessionParameters::new("dave"), Arc::clone(&events), None)
        .await
        .unwrap();
    wait_until(|| relay.relay.active_session_count() == 1).await;

    let block = MessageBlock::new(MessageType::Test, b"ping".to_vec()).unwrap();
    session.send_default_channel_message(block.clone()).await.unwrap();
    wait_until(|| events.default_messages.lock().unwrap().len() == 1).await;
    assert_eq!(events.default_messages.lock().unwrap()[0], block);
}

fn with_test_flag(account: &str, key: &str, value: &str) -> ClientSessionParameters {
    let mut params = ClientSessionParameters::new(account);
    params.custom_handshake_data.insert(key.into(), value.into());
    params
}

fn relay_allowing_test_flags(allowed: bool) -> Relay {
    Relay::new(UplinkConfig {
        allow_test_handshake_flags: allowed,
        ..UplinkConfig::default()
    })
}

#[tokio::test]
async fn test_simulated_refusal_when_flags_allowed() {
    let relay = relay_allowing_test_flags(true);
    let events = Arc::new(RecordingEvents::default());
    let err = relay
        .connect(
            with_test_flag("erin", handshake_keys::SIMULATE_REFUSED_CONNECTION, "maintenance"),
            Arc::clone(&events),
            None,
        )
        .await
        .err()
        .expect("session must be refused");
    match err {
        UplinkError::Refused { error_type, message } => {
            assert_eq!(error_type, UplinkErrorType::InternalServerError);
            assert_eq!(message, "maintenance");
        }
        other => panic!("unexpected error {other:?}"),
    }
    wait_until(|| !relay.relay.is_namespace_assigned("erin############default#")).await;
    assert_eq!(relay.relay.active_session_count(), 0);
}

#[tokio::test]
async fn test_simulated_handshake_failure_sends_no_answer() {
    let relay = relay_allowing_test_flags(true);
    let err = relay
        .connect(
            with_test_flag("frank", handshake_keys::SIMULATE_HANDSHAKE_FAILURE, "boom"),
            Arc::new(RecordingEvents::default()),
            None,
        )
        .await
        .err()
        .expect("handshake must fail");
    match err {
        // the connection ends with a plain goodbye; the failure text stays on the server
        UplinkError::Refused { message, .. } => assert!(!message.contains("boom"), "{message}"),
        UplinkError::ConnectionClosed => {}
        other => panic!("unexpected error {other:?}"),
    }
    wait_until(|| !relay.relay.is_namespace_assigned("frank###########default#")).await;
    assert_eq!(relay.relay.active_session_count(), 0);
}

#[tokio::test]
async fn test_simulated_response_delay_times_out_client() {
    let relay = relay_allowing_test_flags(true);
    let mut params = with_test_flag("gina", handshake_keys::SIMULATE_HANDSHAKE_RESPONSE_DELAY, "");
    params.handshake_timeout = Duration::from_millis(200);
    let err = relay
        .connect(params, Arc::new(RecordingEvents::default()), None)
        .await
        .err()
        .expect("handshake response must be late");
    assert!(matches!(err, UplinkError::Timeout(_)), "{err:?}");
}

#[tokio::test]
async fn test_test_flags_ignored_by_default() {
    let relay = relay_allowing_test_flags(false);
    let keys = [
        handshake_keys::SIMULATE_REFUSED_CONNECTION,
        handshake_keys::SIMULATE_HANDSHAKE_FAILURE,
        handshake_keys::SIMULATE_HANDSHAKE_RESPONSE_DELAY,
    ];
    for (index, key) in keys.into_iter().enumerate() {
        let account = format!("user{index}");
        let mut params = with_test_flag(&account, key, "ignored");
        params.handshake_timeout = Duration::from_secs(2);
        let session = relay
            .connect(params, Arc::new(RecordingEvents::default()), None)
            .await
            .unwrap();
        assert_eq!(session.state(), UplinkSessionState::Active);

        let namespace_id = session.namespace_id().to_string();
        assert!(relay.relay.is_namespace_assigned(&namespace_id));
        session.close().await;
        session.wait_terminated(Duration::from_secs(2)).await;
        wait_until(|| !relay.relay.is_namespace_assigned(&namespace_id)).await;
    }
}
