//! Transport providers: the byte streams underneath message channels.
//!
//! A [`NetworkTransportProvider`] knows how to connect to and listen on
//! [`NetworkContactPoint`]s of one transport type. Two providers ship with
//! the crate:
//!
//! - [`TcpTransport`] (`tcp:host:port`)
//! - [`InProcessTransport`] (`inproc:name`), an in-memory network whose
//!   connections are `tokio::io::duplex` pipes. Clones share the same
//!   namespace of listeners, so several nodes in one process can reach each
//!   other.

use crate::error::WireError;
use crate::message::{decode_frame_body, encode_frame, frame_length, WireMessage};

use async_trait::async_trait;
use dashmap::DashMap;
use nodelink_types::NodeLinkError;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::debug;

/// Maximum single message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Buffer size of in-process pipes.
const IN_PROCESS_PIPE_CAPACITY: usize = 64 * 1024;

/// Anything a channel can run on.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> ByteStream for T {}

pub type BoxedStream = Box<dyn ByteStream>;

/// Transport id plus transport-specific address, e.g. `tcp:127.0.0.1:21000`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkContactPoint {
    pub transport_id: String,
    pub address: String,
}

impl NetworkContactPoint {
    pub fn new(transport_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            transport_id: transport_id.into(),
            address: address.into(),
        }
    }
}

impl fmt::Display for NetworkContactPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transport_id, self.address)
    }
}

impl FromStr for NetworkContactPoint {
    type Err = NodeLinkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once(':') {
            Some((transport, address)) if !transport.is_empty() && !address.is_empty() => {
                Ok(Self::new(transport, address))
            }
            _ => Err(NodeLinkError::InvalidContactPoint(s.to_string())),
        }
    }
}

/// A freshly accepted transport connection.
pub struct AcceptedConnection {
    pub stream: BoxedStream,
    /// Remote socket address, when the transport has one.
    pub peer_addr: Option<SocketAddr>,
    /// Human-readable origin for log lines.
    pub origin: String,
}

/// A bound listener.
#[async_trait]
pub trait TransportListener: Send {
    async fn accept(&mut self) -> Result<AcceptedConnection, WireError>;

    /// The contact point actually bound (port 0 resolved).
    fn local_contact_point(&self) -> NetworkContactPoint;
}

/// Factory for connections of one transport type.
#[async_trait]
pub trait NetworkTransportProvider: Send + Sync + 'static {
    /// The id used in contact points, e.g. `tcp`.
    fn transport_id(&self) -> &'static str;

    async fn connect(&self, contact_point: &NetworkContactPoint)
        -> Result<BoxedStream, WireError>;

    async fn bind(
        &self,
        contact_point: &NetworkContactPoint,
    ) -> Result<Box<dyn TransportListener>, WireError>;
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TcpTransport;

pub const TCP_TRANSPORT_ID: &str = "tcp";

#[async_trait]
impl NetworkTransportProvider for TcpTransport {
    fn transport_id(&self) -> &'static str {
        TCP_TRANSPORT_ID
    }

    async fn connect(
        &self,
        contact_point: &NetworkContactPoint,
    ) -> Result<BoxedStream, WireError> {
        let stream = TcpStream::connect(contact_point.address.as_str()).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn bind(
        &self,
        contact_point: &NetworkContactPoint,
    ) -> Result<Box<dyn TransportListener>, WireError> {
        let listener = TcpListener::bind(contact_point.address.as_str()).await?;
        let local_addr = listener.local_addr()?;
        Ok(Box::new(TcpTransportListener {
            listener,
            local_addr,
        }))
    }
}

struct TcpTransportListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&mut self) -> Result<AcceptedConnection, WireError> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok(AcceptedConnection {
            stream: Box::new(stream),
            peer_addr: Some(addr),
            origin: addr.to_string(),
        })
    }

    fn local_contact_point(&self) -> NetworkContactPoint {
        NetworkContactPoint::new(TCP_TRANSPORT_ID, self.local_addr.to_string())
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

pub const IN_PROCESS_TRANSPORT_ID: &str = "inproc";

type PendingPipe = (DuplexStream, String);

/// In-memory transport; clones share one listener namespace.
#[derive(Clone, Default)]
pub struct InProcessTransport {
    listeners: Arc<DashMap<String, mpsc::UnboundedSender<PendingPipe>>>,
    connection_counter: Arc<std::sync::atomic::AtomicU64>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently bound in-process listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[async_trait]
impl NetworkTransportProvider for InProcessTransport {
    fn transport_id(&self) -> &'static str {
        IN_PROCESS_TRANSPORT_ID
    }

    async fn connect(
        &self,
        contact_point: &NetworkContactPoint,
    ) -> Result<BoxedStream, WireError> {
        let sender = self
            .listeners
            .get(&contact_point.address)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("no in-process listener named '{}'", contact_point.address),
                ))
            })?;
        let (client, server) = tokio::io::duplex(IN_PROCESS_PIPE_CAPACITY);
        let n = self
            .connection_counter
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        sender
            .send((server, format!("inproc-client-{n}")))
            .map_err(|_| {
                WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("in-process listener '{}' is gone", contact_point.address),
                ))
            })?;
        Ok(Box::new(client))
    }

    async fn bind(
        &self,
        contact_point: &NetworkContactPoint,
    ) -> Result<Box<dyn TransportListener>, WireError> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.listeners.entry(contact_point.address.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    format!("in-process name '{}' already bound", contact_point.address),
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(tx);
            }
        }
        debug!(name = %contact_point.address, "Transport: bound in-process listener");
        Ok(Box::new(InProcessListener {
            name: contact_point.address.clone(),
            incoming: rx,
            registry: Arc::clone(&self.listeners),
        }))
    }
}

struct InProcessListener {
    name: String,
    incoming: mpsc::UnboundedReceiver<PendingPipe>,
    registry: Arc<DashMap<String, mpsc::UnboundedSender<PendingPipe>>>,
}

#[async_trait]
impl TransportListener for InProcessListener {
    async fn accept(&mut self) -> Result<AcceptedConnection, WireError> {
        match self.incoming.recv().await {
            Some((stream, origin)) => Ok(AcceptedConnection {
                stream: Box::new(stream),
                peer_addr: None,
                origin,
            }),
            None => Err(WireError::ConnectionClosed),
        }
    }

    fn local_contact_point(&self) -> NetworkContactPoint {
        NetworkContactPoint::new(IN_PROCESS_TRANSPORT_ID, self.name.clone())
    }
}

impl Drop for InProcessListener {
    fn drop(&mut self) {
        self.registry.remove(&self.name);
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Write a framed message (4-byte length + JSON).
pub async fn write_message<W>(writer: &mut W, msg: &WireMessage) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message (4-byte length + JSON).
pub async fn read_message<R>(reader: &mut R) -> Result<WireMessage, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = frame_length(header);
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: len as u32,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(decode_frame_body(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::WireMessageKind;

    #[test]
    fn test_contact_point_parsing() {
        let cp: NetworkContactPoint = "tcp:127.0.0.1:21000".parse().unwrap();
        assert_eq!(cp.transport_id, "tcp");
        assert_eq!(cp.address, "127.0.0.1:21000");
        assert_eq!(cp.to_string(), "tcp:127.0.0.1:21000");
        assert!("no-separator".parse::<NetworkContactPoint>().is_err());
        assert!(":x".parse::<NetworkContactPoint>().is_err());
    }

    #[tokio::test]
    async fn test_in_process_connect_and_frame_exchange() {
        let transport = InProcessTransport::new();
        let cp = NetworkContactPoint::new(IN_PROCESS_TRANSPORT_ID, "node-a");
        let mut listener = transport.bind(&cp).await.unwrap();
        assert_eq!(transport.listener_count(), 1);

        let mut client = transport.connect(&cp).await.unwrap();
        let mut server = listener.accept().await.unwrap();

        let msg = WireMessage::new(WireMessageKind::Goodbye);
        write_message(&mut client, &msg).await.unwrap();
        let received = read_message(&mut server.stream).await.unwrap();
        assert_eq!(received.id, msg.id);
        assert!(server.peer_addr.is_none());
    }

    #[tokio::test]
    async fn test_in_process_name_in_use_and_release() {
        let transport = InProcessTransport::new();
        let cp = NetworkContactPoint::new(IN_PROCESS_TRANSPORT_ID, "dup");
        let listener = transport.bind(&cp).await.unwrap();
        assert!(transport.bind(&cp).await.is_err());
        drop(listener);
        assert_eq!(transport.listener_count(), 0);
        assert!(transport.connect(&cp).await.is_err());
    }

    #[tokio::test]
    async fn test_tcp_bind_resolves_port() {
        let listener = TcpTransport
            .bind(&NetworkContactPoint::new(TCP_TRANSPORT_ID, "127.0.0.1:0"))
            .await
            .unwrap();
        let cp = listener.local_contact_point();
        assert!(!cp.address.ends_with(":0"));
    }

    #[tokio::test]
    async fn test_read_rejects_oversized_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        match read_message(&mut b).await {
            Err(WireError::MessageTooLarge { size, .. }) => assert_eq!(size, MAX_MESSAGE_SIZE + 1),
            other => panic!("Expected MessageTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_eof_is_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_message(&mut b).await,
            Err(WireError::ConnectionClosed)
        ));
    }
}
