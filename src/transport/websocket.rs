//! WebSocket transport on top of `tokio-tungstenite`.
//!
//! tungstenite hands out whole messages while the processing loop reads
//! into a bounded buffer, so a received message is kept aside and copied
//! out chunk by chunk; only the last chunk reports `end_of_message`.
//! Ping, pong and raw frames are consumed here and never reach the loop.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use wsrpc::transport;
//!
//! let listener = TcpListener::bind("127.0.0.1:0").await?;
//! let (stream, _) = listener.accept().await?;
//! let transport = Arc::new(transport::accept(stream).await?);
//! ```

use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{MessageType, ReceiveResult, Transport, TransportState};
use crate::error::{Result, RpcError};

/// Message received from tungstenite but not yet fully copied out.
struct Pending {
    data: Vec<u8>,
    offset: usize,
    message_type: MessageType,
}

struct ReadHalf<S> {
    stream: SplitStream<WebSocketStream<S>>,
    pending: Option<Pending>,
}

/// A [`Transport`] over a tungstenite WebSocket stream.
pub struct WebSocketTransport<S> {
    sink: tokio::sync::Mutex<SplitSink<WebSocketStream<S>, Message>>,
    read: tokio::sync::Mutex<ReadHalf<S>>,
    state: Mutex<TransportState>,
    aborted: CancellationToken,
}

/// Perform the server side of the WebSocket handshake on an accepted stream.
///
/// # Errors
///
/// Returns [`RpcError::WebSocket`] if the handshake fails.
pub async fn accept<S>(stream: S) -> Result<WebSocketTransport<S>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws = tokio_tungstenite::accept_async(stream).await?;
    Ok(WebSocketTransport::new(ws))
}

/// Connect to a `ws://` or `wss://` URL.
///
/// # Errors
///
/// Returns [`RpcError::WebSocket`] if the URL is invalid or the handshake fails.
pub async fn connect(url: &str) -> Result<WebSocketTransport<MaybeTlsStream<TcpStream>>> {
    let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
    Ok(WebSocketTransport::new(ws))
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an established WebSocket stream.
    pub fn new(ws: WebSocketStream<S>) -> Self {
        let (sink, stream) = ws.split();
        Self {
            sink: tokio::sync::Mutex::new(sink),
            read: tokio::sync::Mutex::new(ReadHalf {
                stream,
                pending: None,
            }),
            state: Mutex::new(TransportState::Open),
            aborted: CancellationToken::new(),
        }
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Pull the next data message, handling control frames on the way.
    async fn next_data(&self, read: &mut ReadHalf<S>) -> Result<Option<Pending>> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.aborted.cancelled() => return Err(RpcError::TransportClosed),
                next = read.stream.next() => next,
            };

            let (data, message_type) = match next {
                Some(Ok(Message::Binary(data))) => (data, MessageType::Binary),
                Some(Ok(Message::Text(text))) => (text.into_bytes(), MessageType::Text),
                Some(Ok(Message::Close(frame))) => {
                    trace!(?frame, "WebSocket close frame received");
                    let next = match self.state() {
                        TransportState::CloseSent => TransportState::Closed,
                        _ => TransportState::CloseReceived,
                    };
                    self.set_state(next);
                    return Ok(None);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => {
                    self.set_state(TransportState::Aborted);
                    return Err(RpcError::TransportClosed);
                }
                Some(Err(e)) => {
                    self.set_state(TransportState::Aborted);
                    return Err(e.into());
                }
            };

            return Ok(Some(Pending {
                data,
                offset: 0,
                message_type,
            }));
        }
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        let mut sink = self.sink.lock().await;
        tokio::select! {
            biased;
            _ = self.aborted.cancelled() => Err(RpcError::TransportClosed),
            result = sink.send(message) => result.map_err(map_send_error),
        }
    }
}

fn map_send_error(error: tungstenite::Error) -> RpcError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            RpcError::TransportClosed
        }
        other => other.into(),
    }
}

#[async_trait]
impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn state(&self) -> TransportState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<ReceiveResult> {
        if self.state() == TransportState::Aborted {
            return Err(RpcError::TransportClosed);
        }

        let mut read = self.read.lock().await;
        let mut pending = match read.pending.take() {
            Some(pending) => pending,
            None => match self.next_data(&mut read).await? {
                Some(pending) => pending,
                None => return Ok(ReceiveResult::close()),
            },
        };

        let count = (pending.data.len() - pending.offset).min(buf.len());
        buf[..count].copy_from_slice(&pending.data[pending.offset..pending.offset + count]);
        pending.offset += count;

        let end_of_message = pending.offset == pending.data.len();
        let result = ReceiveResult {
            count,
            message_type: pending.message_type,
            end_of_message,
        };
        if !end_of_message {
            read.pending = Some(pending);
        }
        Ok(result)
    }

    async fn send(&self, data: &[u8], message_type: MessageType) -> Result<()> {
        match self.state() {
            TransportState::Open | TransportState::CloseReceived => {}
            _ => return Err(RpcError::TransportClosed),
        }
        let message = match message_type {
            MessageType::Binary => Message::Binary(data.to_vec()),
            MessageType::Text => Message::Text(String::from_utf8_lossy(data).into_owned()),
            MessageType::Close => return self.close_output().await,
        };
        self.send_message(message).await
    }

    async fn close_output(&self) -> Result<()> {
        match self.state() {
            TransportState::Open => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                };
                self.send_message(Message::Close(Some(frame))).await?;
                self.set_state(TransportState::CloseSent);
                Ok(())
            }
            TransportState::CloseReceived => {
                // tungstenite queued the close reply when the peer's frame was read
                let mut sink = self.sink.lock().await;
                match sink.flush().await {
                    Ok(()) | Err(tungstenite::Error::ConnectionClosed) => {}
                    Err(e) => return Err(map_send_error(e)),
                }
                self.set_state(TransportState::Closed);
                Ok(())
            }
            TransportState::CloseSent | TransportState::Closed => Ok(()),
            TransportState::Aborted => Err(RpcError::TransportClosed),
        }
    }

    fn abort(&self) {
        self.set_state(TransportState::Aborted);
        self.aborted.cancel();
    }
}

impl<S> fmt::Debug for WebSocketTransport<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field(
                "state",
                &*self.state.lock().unwrap_or_else(PoisonError::into_inner),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (
        WebSocketTransport<TcpStream>,
        WebSocketTransport<MaybeTlsStream<TcpStream>>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(stream).await.unwrap()
        });
        let client = connect(&format!("ws://{addr}")).await.unwrap();
        (server.await.unwrap(), client)
    }

    #[tokio::test]
    async fn test_binary_message_is_chunked() {
        let (server, client) = connected_pair().await;
        client.send(&[1, 2, 3, 4, 5], MessageType::Binary).await.unwrap();

        let mut buf = [0u8; 3];
        let first = server.receive(&mut buf).await.unwrap();
        assert_eq!(first.count, 3);
        assert!(!first.end_of_message);
        assert_eq!(&buf, &[1, 2, 3]);

        let second = server.receive(&mut buf).await.unwrap();
        assert_eq!(second.count, 2);
        assert!(second.end_of_message);
        assert_eq!(&buf[..2], &[4, 5]);
    }

    #[tokio::test]
    async fn test_text_message_type_is_preserved() {
        let (server, client) = connected_pair().await;
        client.send(b"hi", MessageType::Text).await.unwrap();

        let mut buf = [0u8; 16];
        let result = server.receive(&mut buf).await.unwrap();
        assert_eq!(result.message_type, MessageType::Text);
    }

    #[tokio::test]
    async fn test_close_handshake() {
        let (server, client) = connected_pair().await;
        client.close_output().await.unwrap();
        assert_eq!(client.state(), TransportState::CloseSent);

        let mut buf = [0u8; 16];
        let result = server.receive(&mut buf).await.unwrap();
        assert_eq!(result.message_type, MessageType::Close);
        assert_eq!(server.state(), TransportState::CloseReceived);
        server.close_output().await.unwrap();
        assert_eq!(server.state(), TransportState::Closed);

        let result = client.receive(&mut buf).await.unwrap();
        assert_eq!(result.message_type, MessageType::Close);
        assert_eq!(client.state(), TransportState::Closed);
    }
}
