//! Client side of the rendezvous protocol.
//!
//! The registration lives as long as this handle: dropping it closes the socket
//! and the server releases the identity.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use peerdrop_core::{
    CoreError, PeerIdentity, SignalMessage, decode_signal, encode_signal, signal::Register,
};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const BACKOFF_BASE_MS: u64 = 200;
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SignalClient {
    identity: PeerIdentity,
    ws: WsStream,
}

impl SignalClient {
    /// Connects and registers. `listen_addr` is where this peer accepts calls;
    /// `None` registers a caller-only identity.
    pub async fn open(
        url: &Url,
        desired_identity: Option<&str>,
        listen_addr: Option<&str>,
    ) -> Result<Self, ClientError> {
        let mut ws = connect_with_retry(url).await?;

        let register = SignalMessage::Register(Register {
            desired_identity: desired_identity.map(str::to_owned),
            listen_addr: listen_addr.map(str::to_owned),
        });
        send(&mut ws, &register).await?;

        match recv(&mut ws).await? {
            SignalMessage::Registered { identity } => {
                info!(identity = %identity, signal_url = %url, "registered");
                Ok(Self { identity, ws })
            }
            SignalMessage::Error(err) => {
                warn!(kind = ?err.kind, "registration refused: {}", err.message);
                Err(err.into_core(desired_identity.unwrap_or_default()).into())
            }
            other => Err(unexpected_reply("register", &other)),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Resolves `remote` to the address it accepts calls on.
    pub async fn lookup(&mut self, remote: &str) -> Result<String, ClientError> {
        send(
            &mut self.ws,
            &SignalMessage::Lookup {
                identity: remote.to_owned(),
            },
        )
        .await?;

        match recv(&mut self.ws).await? {
            SignalMessage::PeerAddress(peer) if peer.identity == remote => {
                debug!(remote = %remote, listen_addr = %peer.listen_addr, "lookup resolved");
                Ok(peer.listen_addr)
            }
            SignalMessage::Error(err) => Err(err.into_core(remote).into()),
            other => Err(unexpected_reply("lookup", &other)),
        }
    }

    /// Completes when the signaling server drops this registration.
    pub async fn closed(&mut self) -> ClientError {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Close(_))) | None => {
                    return ClientError::ConnectionLost("signaling server closed".to_owned());
                }
                Some(Ok(Message::Binary(data))) => match decode_signal(&data) {
                    Ok(message) => warn!("unsolicited signal message: {:?}", message),
                    Err(err) => warn!("undecodable signal message: {}", err),
                },
                Some(Ok(_)) => {}
                Some(Err(err)) => return err.into(),
            }
        }
    }

    pub async fn close(mut self) {
        if let Err(err) = self.ws.close(None).await {
            debug!("signal socket close failed: {}", err);
        }
    }
}

async fn connect_with_retry(url: &Url) -> Result<WsStream, ClientError> {
    let mut attempt: u32 = 1;
    loop {
        info!(
            attempt,
            max_attempts = MAX_CONNECT_ATTEMPTS,
            signal_url = %url,
            "connecting"
        );

        let err = match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((ws, _))) => return Ok(ws),
            Ok(Err(err)) => {
                error!(attempt, signal_url = %url, "connect failed: {err}");
                ClientError::from(err)
            }
            Err(_) => {
                error!(attempt, signal_url = %url, "connect timed out after {:?}", CONNECT_TIMEOUT);
                ClientError::Timeout("signaling server")
            }
        };
        if attempt >= MAX_CONNECT_ATTEMPTS {
            return Err(err);
        }

        let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        attempt += 1;
    }
}

async fn send(ws: &mut WsStream, message: &SignalMessage) -> Result<(), ClientError> {
    let frame = encode_signal(message)?;
    ws.send(Message::Binary(frame.into())).await?;
    Ok(())
}

async fn recv(ws: &mut WsStream) -> Result<SignalMessage, ClientError> {
    loop {
        let next = timeout(REPLY_TIMEOUT, ws.next())
            .await
            .map_err(|_| ClientError::Timeout("signaling reply"))?;
        match next {
            Some(Ok(Message::Binary(data))) => return Ok(decode_signal(&data)?),
            Some(Ok(Message::Close(_))) | None => {
                return Err(ClientError::ConnectionLost(
                    "signaling server closed the connection".to_owned(),
                ));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

fn unexpected_reply(request: &str, reply: &SignalMessage) -> ClientError {
    CoreError::ProtocolViolation(format!("unexpected reply to {request}: {reply:?}")).into()
}
