//! Outgoing block queue of a session.
//!
//! Each session owns one writer task that drains its [`Outbox`] in order,
//! so blocks of all channels share one ordered stream. Closing enqueues a
//! final `GOODBYE` behind everything already queued.

use crate::codec::write_block;
use crate::converter::encode_error_goodbye;
use crate::protocol::{MessageBlock, MessageType, DEFAULT_CHANNEL_ID};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default queue length per session.
pub const OUTBOX_CAPACITY: usize = 256;

enum OutgoingFrame {
    Block { channel_id: i64, block: MessageBlock },
    Goodbye(MessageBlock),
}

#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<OutgoingFrame>,
    closed: Arc<AtomicBool>,
}

impl Outbox {
    /// Start the writer task for `writer`.
    pub fn spawn<W>(mut writer: W, capacity: usize, session: String) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<OutgoingFrame>(capacity);
        let closed = Arc::new(AtomicBool::new(false));
        let task_closed = Arc::clone(&closed);
        let handle = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    OutgoingFrame::Block { channel_id, block } => {
                        if let Err(e) = write_block(&mut writer, channel_id, &block).await {
                            debug!(session = %session, error = %e, "Uplink: write failed, stopping writer");
                            break;
                        }
                    }
                    OutgoingFrame::Goodbye(block) => {
                        if let Err(e) = write_block(&mut writer, DEFAULT_CHANNEL_ID, &block).await {
                            debug!(session = %session, error = %e, "Uplink: failed to send goodbye");
                        }
                        let _ = writer.shutdown().await;
                        break;
                    }
                }
            }
            task_closed.store(true, Ordering::SeqCst);
        });
        (Self { tx, closed }, handle)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue without waiting. `false` if the queue is full or closed.
    pub fn try_enqueue(&self, channel_id: i64, block: MessageBlock) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx
            .try_send(OutgoingFrame::Block { channel_id, block })
            .is_ok()
    }

    /// Queue, waiting for space. `false` once the outbox is closed.
    pub async fn enqueue(&self, channel_id: i64, block: MessageBlock) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx
            .send(OutgoingFrame::Block { channel_id, block })
            .await
            .is_ok()
    }

    /// Send a regular goodbye (`None`) or an error goodbye with a wrapped
    /// message, then stop accepting blocks. Later calls do nothing.
    pub async fn close(&self, wrapped_error: Option<&str>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let goodbye = match wrapped_error {
            Some(message) => encode_error_goodbye(message),
            None => MessageBlock::empty(MessageType::Goodbye),
        };
        let _ = self.tx.send(OutgoingFrame::Goodbye(goodbye)).await;
    }

    /// [`close`](Self::close) from synchronous code.
    pub fn close_in_background(&self, wrapped_error: Option<String>) {
        let outbox = self.clone();
        tokio::spawn(async move {
            outbox.close(wrapped_error.as_deref()).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_block;
    use crate::error::UplinkError;

    #[tokio::test]
    async fn test_blocks_then_goodbye() {
        let (a, mut b) = tokio::io::duplex(4096);
        let (outbox, writer) = Outbox::spawn(a, 8, "t".into());
        assert!(outbox.try_enqueue(3, MessageBlock::empty(MessageType::Test)));
        outbox.close(None).await;
        assert!(!outbox.try_enqueue(3, MessageBlock::empty(MessageType::Test)));
        writer.await.unwrap();

        let (channel, block) = read_block(&mut b).await.unwrap();
        assert_eq!((channel, block.message_type), (3, MessageType::Test));
        let (channel, block) = read_block(&mut b).await.unwrap();
        assert_eq!((channel, block.message_type), (DEFAULT_CHANNEL_ID, MessageType::Goodbye));
        assert!(block.data.is_empty());
        assert!(matches!(read_block(&mut b).await, Err(UplinkError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_error_goodbye_carries_message() {
        let (a, mut b) = tokio::io::duplex(4096);
        let (outbox, _writer) = Outbox::spawn(a, 8, "t".into());
        outbox.close(Some("E99: boom")).await;
        outbox.close(None).await;
        let (_, block) = read_block(&mut b).await.unwrap();
        assert_eq!(block.data, b"E99: boom");
    }
}
