//! Uplink framing.
//!
//! A session starts with the 8-byte [`HANDSHAKE_HEADER`] sent by the
//! client. After that both directions carry blocks of the form
//!
//! ```text
//! i64 channel id | i32 data length | u8 type code | data
//! ```
//!
//! all integers big-endian.

use crate::error::{UplinkError, UplinkResult};
use crate::protocol::{
    MessageBlock, MessageType, HANDSHAKE_HEADER, MAX_MESSAGE_BLOCK_DATA_LENGTH,
};

use bytes::{BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BLOCK_HEADER_LEN: usize = 8 + 4 + 1;

pub async fn write_handshake_header<W>(writer: &mut W) -> UplinkResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(HANDSHAKE_HEADER).await?;
    Ok(())
}

/// Read the handshake header, failing if it does not arrive in time.
pub async fn expect_handshake_header<R>(reader: &mut R, timeout: Duration) -> UplinkResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HANDSHAKE_HEADER.len()];
    tokio::time::timeout(timeout, reader.read_exact(&mut header))
        .await
        .map_err(|_| {
            UplinkError::Timeout(format!(
                "expected {} bytes of handshake header within {} msec",
                header.len(),
                timeout.as_millis()
            ))
        })?
        .map_err(UplinkError::from_read)?;
    if &header != HANDSHAKE_HEADER {
        return Err(UplinkError::protocol(format!(
            "Received invalid handshake init: {}",
            String::from_utf8_lossy(&header)
        )));
    }
    Ok(())
}

pub fn encode_block(channel_id: i64, block: &MessageBlock) -> BytesMut {
    let mut buf = BytesMut::with_capacity(BLOCK_HEADER_LEN + block.data.len());
    buf.put_i64(channel_id);
    buf.put_i32(block.data.len() as i32);
    buf.put_u8(block.message_type.code());
    buf.put_slice(&block.data);
    buf
}

pub async fn write_block<W>(writer: &mut W, channel_id: i64, block: &MessageBlock) -> UplinkResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_block(channel_id, block)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next block. EOF before the first byte of a block is reported as
/// [`UplinkError::ConnectionClosed`].
pub async fn read_block<R>(reader: &mut R) -> UplinkResult<(i64, MessageBlock)>
where
    R: AsyncRead + Unpin,
{
    let channel_id = reader.read_i64().await.map_err(UplinkError::from_read)?;
    let length = reader.read_i32().await.map_err(UplinkError::from_read)?;
    if length < 0 || length as usize > MAX_MESSAGE_BLOCK_DATA_LENGTH {
        return Err(UplinkError::protocol(format!(
            "Incoming message block announced a size of {length} (valid range: 0-{MAX_MESSAGE_BLOCK_DATA_LENGTH})"
        )));
    }
    let message_type = MessageType::from_code(reader.read_u8().await.map_err(UplinkError::from_read)?)?;
    let mut data = vec![0u8; length as usize];
    reader
        .read_exact(&mut data)
        .await
        .map_err(UplinkError::from_read)?;
    Ok((channel_id, MessageBlock { message_type, data }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DEFAULT_CHANNEL_ID;

    #[tokio::test]
    async fn test_block_exchange() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let block = MessageBlock::new(MessageType::Test, b"hello".to_vec()).unwrap();
        write_block(&mut a, 7, &block).await.unwrap();
        let (channel, received) = read_block(&mut b).await.unwrap();
        assert_eq!(channel, 7);
        assert_eq!(received, block);
    }

    #[tokio::test]
    async fn test_header_checked() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_handshake_header(&mut a).await.unwrap();
        expect_handshake_header(&mut b, Duration::from_secs(1))
            .await
            .unwrap();

        a.write_all(b"NOTVALID").await.unwrap();
        let err = expect_handshake_header(&mut b, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, UplinkError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_missing_header_times_out() {
        let (_a, mut b) = tokio::io::duplex(64);
        let err = expect_handshake_header(&mut b, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, UplinkError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_rejects_announced_oversize() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let mut buf = BytesMut::new();
        buf.put_i64(DEFAULT_CHANNEL_ID);
        buf.put_i32(MAX_MESSAGE_BLOCK_DATA_LENGTH as i32 + 1);
        buf.put_u8(MessageType::Test.code());
        a.write_all(&buf).await.unwrap();
        assert!(matches!(
            read_block(&mut b).await.unwrap_err(),
            UplinkError::Protocol(_)
        ));
    }

    #[tokio::test]
    async fn test_block_split_across_reads() {
        let block = MessageBlock::new(MessageType::FileContent, vec![7u8; 300]).unwrap();
        let frame = encode_block(42, &block);
        let mut reader = tokio_test::io::Builder::new()
            .read(&frame[..5])
            .read(&frame[5..20])
            .read(&frame[20..])
            .build();
        let (channel, received) = read_block(&mut reader).await.unwrap();
        assert_eq!(channel, 42);
        assert_eq!(received, block);
    }

    #[tokio::test]
    async fn test_eof_is_connection_closed() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(matches!(
            read_block(&mut b).await.unwrap_err(),
            UplinkError::ConnectionClosed
        ));
    }
}
