//! In-process transport pair over tokio channels.
//!
//! Each side owns the sending half of one unbounded channel and the
//! receiving half of the other. Frames can be pushed in arbitrary segments
//! with [`MemoryTransport::send_segment`], which lets tests exercise the
//! partial-receive path without a socket.
//!
//! # Example
//!
//! ```
//! use wsrpc::transport::{pair, MessageType, Transport};
//!
//! # tokio_test_block(async {
//! let (client, server) = pair();
//! client.send(&[1, 0, 0, 0], MessageType::Binary).await.unwrap();
//!
//! let mut buf = [0u8; 16];
//! let result = server.receive(&mut buf).await.unwrap();
//! assert_eq!(result.count, 4);
//! assert!(result.end_of_message);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{MessageType, ReceiveResult, Transport, TransportState};
use crate::error::{Result, RpcError};

#[derive(Debug)]
enum Segment {
    Data {
        bytes: Vec<u8>,
        message_type: MessageType,
        end_of_message: bool,
    },
    Close,
}

/// Part of a segment not yet copied out by `receive`.
#[derive(Debug)]
struct Pending {
    bytes: Vec<u8>,
    offset: usize,
    message_type: MessageType,
    end_of_message: bool,
}

#[derive(Debug)]
struct Incoming {
    rx: mpsc::UnboundedReceiver<Segment>,
    pending: Option<Pending>,
}

/// One end of an in-memory transport pair. Create with [`pair`].
#[derive(Debug)]
pub struct MemoryTransport {
    outgoing: Mutex<Option<mpsc::UnboundedSender<Segment>>>,
    incoming: tokio::sync::Mutex<Incoming>,
    state: Mutex<TransportState>,
    aborted: CancellationToken,
}

/// Create two connected in-memory transports.
pub fn pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (MemoryTransport::new(a_tx, b_rx), MemoryTransport::new(b_tx, a_rx))
}

impl MemoryTransport {
    fn new(tx: mpsc::UnboundedSender<Segment>, rx: mpsc::UnboundedReceiver<Segment>) -> Self {
        Self {
            outgoing: Mutex::new(Some(tx)),
            incoming: tokio::sync::Mutex::new(Incoming { rx, pending: None }),
            state: Mutex::new(TransportState::Open),
            aborted: CancellationToken::new(),
        }
    }

    /// Send part of a binary frame. The peer sees the frame complete once a
    /// segment with `end_of_message` set arrives.
    pub fn send_segment(&self, data: &[u8], end_of_message: bool) -> Result<()> {
        self.ensure_can_send()?;
        self.push(Segment::Data {
            bytes: data.to_vec(),
            message_type: MessageType::Binary,
            end_of_message,
        })
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn ensure_can_send(&self) -> Result<()> {
        match self.state() {
            TransportState::Open | TransportState::CloseReceived => Ok(()),
            _ => Err(RpcError::TransportClosed),
        }
    }

    fn push(&self, segment: Segment) -> Result<()> {
        let outgoing = self.outgoing.lock().unwrap_or_else(PoisonError::into_inner);
        outgoing
            .as_ref()
            .ok_or(RpcError::TransportClosed)?
            .send(segment)
            .map_err(|_| RpcError::TransportClosed)
    }

    async fn next_segment(&self, incoming: &mut Incoming) -> Result<Option<Segment>> {
        tokio::select! {
            biased;
            _ = self.aborted.cancelled() => Err(RpcError::TransportClosed),
            segment = incoming.rx.recv() => Ok(segment),
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<ReceiveResult> {
        if self.state() == TransportState::Aborted {
            return Err(RpcError::TransportClosed);
        }

        let mut incoming = self.incoming.lock().await;
        let mut pending = match incoming.pending.take() {
            Some(pending) => pending,
            None => match self.next_segment(&mut incoming).await? {
                Some(Segment::Data {
                    bytes,
                    message_type,
                    end_of_message,
                }) => Pending {
                    bytes,
                    offset: 0,
                    message_type,
                    end_of_message,
                },
                Some(Segment::Close) => {
                    let next = match self.state() {
                        TransportState::CloseSent => TransportState::Closed,
                        _ => TransportState::CloseReceived,
                    };
                    self.set_state(next);
                    return Ok(ReceiveResult::close());
                }
                None => {
                    // Peer went away without a close handshake
                    self.set_state(TransportState::Aborted);
                    return Err(RpcError::TransportClosed);
                }
            },
        };

        let remaining = pending.bytes.len() - pending.offset;
        let count = remaining.min(buf.len());
        buf[..count].copy_from_slice(&pending.bytes[pending.offset..pending.offset + count]);
        pending.offset += count;

        let result = ReceiveResult {
            count,
            message_type: pending.message_type,
            end_of_message: pending.end_of_message && pending.offset == pending.bytes.len(),
        };
        if pending.offset < pending.bytes.len() {
            incoming.pending = Some(pending);
        }
        Ok(result)
    }

    async fn send(&self, data: &[u8], message_type: MessageType) -> Result<()> {
        self.ensure_can_send()?;
        let segment = match message_type {
            MessageType::Close => Segment::Close,
            message_type => Segment::Data {
                bytes: data.to_vec(),
                message_type,
                end_of_message: true,
            },
        };
        self.push(segment)
    }

    async fn close_output(&self) -> Result<()> {
        let next = match self.state() {
            TransportState::Open => TransportState::CloseSent,
            TransportState::CloseReceived => TransportState::Closed,
            TransportState::CloseSent | TransportState::Closed => return Ok(()),
            TransportState::Aborted => return Err(RpcError::TransportClosed),
        };
        self.push(Segment::Close)?;
        self.set_state(next);
        Ok(())
    }

    fn abort(&self) {
        self.set_state(TransportState::Aborted);
        self.outgoing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.aborted.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_large_frame_is_received_in_chunks() {
        let (a, b) = pair();
        a.send(&[7u8; 10], MessageType::Binary).await.unwrap();

        let mut buf = [0u8; 4];
        let first = b.receive(&mut buf).await.unwrap();
        assert_eq!(first.count, 4);
        assert!(!first.end_of_message);

        let second = b.receive(&mut buf).await.unwrap();
        assert_eq!(second.count, 4);
        assert!(!second.end_of_message);

        let third = b.receive(&mut buf).await.unwrap();
        assert_eq!(third.count, 2);
        assert!(third.end_of_message);
    }

    #[tokio::test]
    async fn test_close_handshake() {
        let (a, b) = pair();
        a.close_output().await.unwrap();
        assert_eq!(a.state(), TransportState::CloseSent);

        let mut buf = [0u8; 4];
        let result = b.receive(&mut buf).await.unwrap();
        assert_eq!(result.message_type, MessageType::Close);
        assert_eq!(b.state(), TransportState::CloseReceived);

        b.close_output().await.unwrap();
        assert_eq!(b.state(), TransportState::Closed);

        let result = a.receive(&mut buf).await.unwrap();
        assert_eq!(result.message_type, MessageType::Close);
        assert_eq!(a.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (a, _b) = pair();
        a.close_output().await.unwrap();
        let err = a.send(&[0], MessageType::Binary).await.unwrap_err();
        assert!(matches!(err, RpcError::TransportClosed));
    }

    #[tokio::test]
    async fn test_abort_wakes_pending_receive() {
        let (_a, b) = pair();
        let b = std::sync::Arc::new(b);
        let task = {
            let b = b.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4];
                b.receive(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        b.abort();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(RpcError::TransportClosed)));
    }

    #[tokio::test]
    async fn test_peer_abort_is_reported() {
        let (a, b) = pair();
        a.abort();
        let mut buf = [0u8; 4];
        let err = b.receive(&mut buf).await.unwrap_err();
        assert!(matches!(err, RpcError::TransportClosed));
        assert_eq!(b.state(), TransportState::Aborted);
    }
}
