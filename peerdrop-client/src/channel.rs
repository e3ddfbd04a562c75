//! Direct peer-to-peer channel over a WebSocket.
//!
//! Each WebSocket binary message carries exactly one encoded [`Frame`]. The
//! socket is driven by a reader task and a writer task; the runtime talks to
//! them only through queues. Outbound frames go through a bounded queue so a
//! sender can never get more than [`OUTBOUND_QUEUE_FRAMES`] chunks ahead of the
//! network.

use std::{net::SocketAddr, time::Duration};

use futures::{SinkExt, StreamExt};
use peerdrop_core::{
    ChannelEvent, CoreError, Frame, Hello, PeerIdentity, decode_frame, encode_frame,
    validate_identity,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::timeout,
};
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::ClientError;

pub const OUTBOUND_QUEUE_FRAMES: usize = 8;
const INBOUND_QUEUE_FRAMES: usize = 32;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PeerChannel {
    remote_identity: PeerIdentity,
    sender: FrameSender,
    events: ChannelEvents,
}

impl PeerChannel {
    /// Connects to a peer's listen address and introduces ourselves.
    ///
    /// The first event on the returned channel is [`ChannelEvent::Open`].
    pub async fn dial(
        listen_addr: &str,
        local_identity: &str,
        remote_identity: &str,
    ) -> Result<Self, ClientError> {
        let url = format!("ws://{listen_addr}/");
        info!(remote = %remote_identity, url = %url, "dialing peer");
        let (mut ws, _) = timeout(HANDSHAKE_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| ClientError::Timeout("peer handshake"))??;

        let hello = encode_frame(&Frame::Hello(Hello {
            identity: local_identity.to_owned(),
        }))?;
        ws.send(Message::Binary(hello.into())).await?;

        Ok(Self::spawn(ws, remote_identity.to_owned(), true))
    }

    /// Completes the WebSocket handshake on an accepted TCP stream and reads the
    /// caller's hello.
    pub async fn accept(stream: TcpStream) -> Result<Self, ClientError> {
        let mut ws = timeout(HANDSHAKE_TIMEOUT, accept_async(stream))
            .await
            .map_err(|_| ClientError::Timeout("peer handshake"))??;

        let remote_identity = timeout(HELLO_TIMEOUT, read_hello(&mut ws))
            .await
            .map_err(|_| ClientError::Timeout("peer hello"))??;
        debug!(remote = %remote_identity, "peer introduced itself");

        Ok(Self::spawn(ws, remote_identity, false))
    }

    pub fn remote_identity(&self) -> &str {
        &self.remote_identity
    }

    pub fn split(self) -> (FrameSender, ChannelEvents) {
        (self.sender, self.events)
    }

    fn spawn<S>(ws: WebSocketStream<S>, remote_identity: PeerIdentity, announce_open: bool) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (ws_write, ws_read) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE_FRAMES);
        let (inbound_tx, inbound_rx) = mpsc::channel::<ChannelEvent>(INBOUND_QUEUE_FRAMES);

        if announce_open {
            // fresh queue with spare capacity
            let _ = inbound_tx.try_send(ChannelEvent::Open);
        }

        let writer = tokio::spawn(writer_task(ws_write, outbound_rx, inbound_tx.clone()));
        let reader = tokio::spawn(reader_task(ws_read, inbound_tx));

        Self {
            remote_identity,
            sender: FrameSender {
                tx: outbound_tx,
                writer,
            },
            events: ChannelEvents {
                rx: inbound_rx,
                reader,
            },
        }
    }
}

/// Outbound half. Dropping it closes the socket; [`FrameSender::close`] also
/// waits for queued frames to reach the network.
pub struct FrameSender {
    tx: mpsc::Sender<Vec<u8>>,
    writer: JoinHandle<Result<(), String>>,
}

/// A reserved slot in the outbound queue.
pub struct FramePermit<'a> {
    permit: mpsc::Permit<'a, Vec<u8>>,
}

impl FramePermit<'_> {
    pub fn send(self, frame: &Frame) -> Result<(), ClientError> {
        self.permit.send(encode_frame(frame)?);
        Ok(())
    }
}

impl FrameSender {
    /// Waits for queue capacity. Fails once the writer has stopped.
    pub async fn reserve(&self) -> Result<FramePermit<'_>, ClientError> {
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| ClientError::ConnectionLost("peer channel writer stopped".to_owned()))?;
        Ok(FramePermit { permit })
    }

    pub async fn send(&self, frame: &Frame) -> Result<(), ClientError> {
        self.reserve().await?.send(frame)
    }

    /// Flushes every queued frame and closes the socket. Fails if any queued
    /// frame could not be written.
    pub async fn close(self) -> Result<(), ClientError> {
        let FrameSender { tx, writer } = self;
        drop(tx);
        match timeout(CLOSE_TIMEOUT, writer).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(ClientError::ConnectionLost(reason)),
            Ok(Err(err)) => Err(ClientError::ConnectionLost(format!(
                "peer channel writer stopped: {err}"
            ))),
            Err(_) => Err(ClientError::Timeout("peer channel flush")),
        }
    }
}

/// Inbound half: adapter events in arrival order.
pub struct ChannelEvents {
    rx: mpsc::Receiver<ChannelEvent>,
    reader: JoinHandle<()>,
}

impl ChannelEvents {
    /// Next adapter event. Reports `Closed` forever once both tasks are gone.
    pub async fn recv(&mut self) -> ChannelEvent {
        self.rx.recv().await.unwrap_or(ChannelEvent::Closed)
    }
}

impl Drop for ChannelEvents {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// TCP listener for inbound calls.
pub struct PeerListener {
    listener: TcpListener,
}

impl PeerListener {
    pub async fn bind(addr: &str) -> Result<Self, ClientError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.listener.local_addr()?)
    }

    /// Next raw TCP connection. Cancel-safe.
    pub async fn accept_stream(&self) -> Result<(TcpStream, SocketAddr), ClientError> {
        Ok(self.listener.accept().await?)
    }

    pub async fn accept(&self) -> Result<PeerChannel, ClientError> {
        let (stream, peer_addr) = self.accept_stream().await?;
        debug!(peer_addr = %peer_addr, "inbound connection");
        PeerChannel::accept(stream).await
    }
}

async fn read_hello<S>(ws: &mut WebSocketStream<S>) -> Result<PeerIdentity, ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Binary(data))) => {
                return match decode_frame(&data)? {
                    Frame::Hello(hello) => {
                        validate_identity(&hello.identity)?;
                        Ok(hello.identity)
                    }
                    other => Err(CoreError::ProtocolViolation(format!(
                        "first peer frame must be hello, got {}",
                        other.kind().name()
                    ))
                    .into()),
                };
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => {
                return Err(ClientError::ConnectionLost(
                    "peer disconnected before hello".to_owned(),
                ));
            }
            Some(Ok(_)) => {
                return Err(CoreError::ProtocolViolation(
                    "first peer message must be a binary hello frame".to_owned(),
                )
                .into());
            }
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

async fn writer_task<S>(
    mut ws_write: futures::stream::SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    inbound_tx: mpsc::Sender<ChannelEvent>,
) -> Result<(), String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(err) = ws_write.send(Message::Binary(frame.into())).await {
            warn!("peer channel write failed: {}", err);
            let reason = err.to_string();
            let _ = inbound_tx.try_send(ChannelEvent::Error(reason.clone()));
            return Err(reason);
        }
    }
    // every frame is flushed by now
    if let Err(err) = ws_write.close().await {
        debug!("peer channel close failed: {}", err);
    }
    Ok(())
}

async fn reader_task<S>(
    mut ws_read: futures::stream::SplitStream<WebSocketStream<S>>,
    inbound_tx: mpsc::Sender<ChannelEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let event = match ws_read.next().await {
            Some(Ok(Message::Binary(data))) => ChannelEvent::Data(data.to_vec()),
            Some(Ok(Message::Close(_))) | None => {
                let _ = inbound_tx.send(ChannelEvent::Closed).await;
                return;
            }
            Some(Ok(Message::Text(_))) => {
                warn!("ignoring text message on peer channel");
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                let _ = inbound_tx.send(ChannelEvent::Error(err.to_string())).await;
                return;
            }
        };
        if inbound_tx.send(event).await.is_err() {
            return;
        }
    }
}
