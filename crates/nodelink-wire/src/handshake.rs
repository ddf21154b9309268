//! Connection handshake.
//!
//! The connecting side sends a [`Handshake`] carrying its node information,
//! protocol version and the id it assigned to its channel. The accepting side
//! checks the version (exact match or a listed legacy version), optionally
//! verifies an HMAC over a nonce and the node id, lets the endpoint handler
//! accept or refuse the node, and answers with a [`HandshakeAck`] carrying
//! its own node information and channel id, or with a refusal frame.
//!
//! Both directions are bounded by the handshake timeout.

use crate::error::WireError;
use crate::message::*;
use crate::transport::{read_message, write_message, BoxedStream};

use hmac::{Hmac, Mac};
use nodelink_types::{InitialNodeInformation, ResultCode};
use sha2::Sha256;
use std::time::Duration;
use tracing::{debug, warn};

type HmacSha256 = Hmac<Sha256>;

/// Settings shared by both handshake directions.
#[derive(Debug, Clone)]
pub struct HandshakeSettings {
    pub local: InitialNodeInformation,
    /// Pre-shared key; `None` disables authentication.
    pub shared_secret: Option<String>,
    pub timeout: Duration,
}

/// Generate HMAC-SHA256 signature for handshake authentication.
fn hmac_sign(secret: &str, data: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length
        Err(_) => return String::new(),
    };
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify HMAC-SHA256 signature using constant-time comparison.
fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

fn sign_identity(settings: &HandshakeSettings) -> (String, String) {
    match &settings.shared_secret {
        Some(secret) => {
            let nonce = uuid::Uuid::new_v4().to_string();
            let data = format!("{}{}", nonce, settings.local.node_id);
            let mac = hmac_sign(secret, data.as_bytes());
            (nonce, mac)
        }
        None => (String::new(), String::new()),
    }
}

fn verify_identity(
    settings: &HandshakeSettings,
    node: &InitialNodeInformation,
    nonce: &str,
    auth_hmac: &str,
) -> bool {
    match &settings.shared_secret {
        Some(secret) => {
            let data = format!("{}{}", nonce, node.node_id);
            hmac_verify(secret, data.as_bytes(), auth_hmac)
        }
        None => true,
    }
}

async fn read_with_timeout(
    stream: &mut BoxedStream,
    timeout: Duration,
) -> Result<WireMessage, WireError> {
    tokio::time::timeout(timeout, read_message(stream))
        .await
        .map_err(|_| {
            WireError::Timeout(format!(
                "no handshake data within {} ms",
                timeout.as_millis()
            ))
        })?
}

/// Client side: send our handshake and wait for the answer.
pub async fn initiate(
    stream: &mut BoxedStream,
    settings: &HandshakeSettings,
    channel_id: &str,
    duplex: bool,
) -> Result<HandshakeAck, WireError> {
    let (nonce, auth_hmac) = sign_identity(settings);
    let handshake = WireMessage::new(WireMessageKind::Handshake(Handshake {
        node: settings.local.clone(),
        protocol_version: PROTOCOL_VERSION,
        channel_id: channel_id.to_string(),
        duplex,
        nonce,
        auth_hmac,
    }));
    write_message(stream, &handshake).await?;

    let response = read_with_timeout(stream, settings.timeout).await?;
    match response.kind {
        WireMessageKind::HandshakeAck(ack) => {
            if !is_compatible_version(ack.protocol_version) {
                return Err(WireError::VersionMismatch {
                    local: PROTOCOL_VERSION,
                    remote: ack.protocol_version,
                });
            }
            if !verify_identity(settings, &ack.node, &ack.nonce, &ack.auth_hmac) {
                return Err(WireError::HandshakeFailed(
                    "HMAC verification failed on HandshakeAck".into(),
                ));
            }
            debug!(remote = %ack.node, "Handshake: completed as initiator");
            Ok(ack)
        }
        WireMessageKind::HandshakeRefused {
            result_code,
            reason,
        } => Err(WireError::HandshakeRefused {
            code: result_code,
            reason,
        }),
        _ => Err(WireError::HandshakeFailed(
            "Unexpected response to handshake".to_string(),
        )),
    }
}

/// Server side, first half: read and validate the incoming handshake.
///
/// Version and authentication failures are answered with a refusal frame
/// before the error is returned.
pub async fn receive(
    stream: &mut BoxedStream,
    settings: &HandshakeSettings,
    origin: &str,
) -> Result<Handshake, WireError> {
    let msg = read_with_timeout(stream, settings.timeout).await?;
    let handshake = match msg.kind {
        WireMessageKind::Handshake(hs) => hs,
        _ => {
            warn!(origin, "Handshake: rejected non-handshake initial frame");
            refuse(
                stream,
                ResultCode::HandshakeRefused,
                "Handshake required before any other message",
            )
            .await?;
            return Err(WireError::HandshakeFailed(
                "Rejected non-handshake initial frame".into(),
            ));
        }
    };

    if !is_compatible_version(handshake.protocol_version) {
        refuse(
            stream,
            ResultCode::IncompatibleProtocolVersion,
            &format!(
                "Protocol version mismatch: expected {}, got {}",
                PROTOCOL_VERSION, handshake.protocol_version
            ),
        )
        .await?;
        return Err(WireError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: handshake.protocol_version,
        });
    }

    if !verify_identity(
        settings,
        &handshake.node,
        &handshake.nonce,
        &handshake.auth_hmac,
    ) {
        refuse(stream, ResultCode::HandshakeRefused, "HMAC authentication failed").await?;
        return Err(WireError::HandshakeFailed(
            "HMAC verification failed on incoming Handshake".into(),
        ));
    }

    Ok(handshake)
}

/// Server side, second half: accept with our own identity and channel id.
pub async fn acknowledge(
    stream: &mut BoxedStream,
    settings: &HandshakeSettings,
    channel_id: &str,
) -> Result<(), WireError> {
    let (nonce, auth_hmac) = sign_identity(settings);
    let ack = WireMessage::new(WireMessageKind::HandshakeAck(HandshakeAck {
        node: settings.local.clone(),
        protocol_version: PROTOCOL_VERSION,
        channel_id: channel_id.to_string(),
        nonce,
        auth_hmac,
    }));
    write_message(stream, &ack).await
}

/// Send a refusal frame.
pub async fn refuse(
    stream: &mut BoxedStream,
    result_code: ResultCode,
    reason: &str,
) -> Result<(), WireError> {
    let msg = WireMessage::new(WireMessageKind::HandshakeRefused {
        result_code,
        reason: reason.to_string(),
    });
    write_message(stream, &msg).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodelink_types::InstanceNodeSessionId;

    fn settings(name: &str, secret: Option<&str>) -> HandshakeSettings {
        HandshakeSettings {
            local: InitialNodeInformation::new(InstanceNodeSessionId::new(name, "1"), name),
            shared_secret: secret.map(str::to_string),
            timeout: Duration::from_secs(2),
        }
    }

    fn pipe() -> (BoxedStream, BoxedStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Box::new(a), Box::new(b))
    }

    #[test]
    fn test_hmac_sign_verify() {
        let sig = hmac_sign("secret", b"data");
        assert!(hmac_verify("secret", b"data", &sig));
        assert!(!hmac_verify("other", b"data", &sig));
        assert!(!hmac_verify("secret", b"tampered", &sig));
    }

    #[tokio::test]
    async fn test_successful_exchange() {
        let (mut client, mut server) = pipe();
        let server_settings = settings("server", Some("k"));
        let server_task = tokio::spawn(async move {
            let hs = receive(&mut server, &server_settings, "test").await.unwrap();
            acknowledge(&mut server, &server_settings, "server-1")
                .await
                .unwrap();
            hs
        });
        let ack = initiate(&mut client, &settings("client", Some("k")), "client-1", true)
            .await
            .unwrap();
        let hs = server_task.await.unwrap();
        assert_eq!(ack.channel_id, "server-1");
        assert_eq!(ack.node.display_name, "server");
        assert_eq!(hs.channel_id, "client-1");
        assert!(hs.duplex);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_refused() {
        let (mut client, mut server) = pipe();
        let server_settings = settings("server", Some("right"));
        let server_task =
            tokio::spawn(async move { receive(&mut server, &server_settings, "test").await });
        let err = initiate(&mut client, &settings("client", Some("wrong")), "c-1", false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WireError::HandshakeRefused {
                code: ResultCode::HandshakeRefused,
                ..
            }
        ));
        assert!(server_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_incompatible_version_is_refused_with_code() {
        let (mut client, mut server) = pipe();
        let server_settings = settings("server", None);
        let server_task =
            tokio::spawn(async move { receive(&mut server, &server_settings, "test").await });

        let old = WireMessage::new(WireMessageKind::Handshake(Handshake {
            node: settings("old", None).local,
            protocol_version: 1,
            channel_id: "old-1".into(),
            duplex: false,
            nonce: String::new(),
            auth_hmac: String::new(),
        }));
        write_message(&mut client, &old).await.unwrap();
        let answer = read_message(&mut client).await.unwrap();
        assert!(matches!(
            answer.kind,
            WireMessageKind::HandshakeRefused {
                result_code: ResultCode::IncompatibleProtocolVersion,
                ..
            }
        ));
        assert!(matches!(
            server_task.await.unwrap(),
            Err(WireError::VersionMismatch { remote: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (mut client, _server) = pipe();
        let mut s = settings("client", None);
        s.timeout = Duration::from_millis(50);
        let err = initiate(&mut client, &s, "c-1", false).await.unwrap_err();
        assert!(matches!(err, WireError::Timeout(_)));
    }
}
