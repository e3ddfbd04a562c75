//! Rendezvous server: hands out identities and tells dialers where to connect.
//!
//! A registration lives exactly as long as the WebSocket that created it. The
//! server never sees file data; peers connect to each other directly once a
//! lookup has resolved the callee's listen address.

use std::{collections::HashMap, sync::Arc, time::Duration, time::Instant};

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::Message},
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use peerdrop_core::{
    PeerIdentity, SignalError, SignalErrorKind, SignalMessage, decode_signal, encode_signal,
    signal::{PeerAddress, Register},
    validate_identity,
};
use rand::Rng;
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

pub const MAX_SIGNAL_MESSAGE_BYTES: usize = 16 * 1024;
const MAX_LISTEN_ADDR_LEN: usize = 255;
const PIN_ATTEMPTS: usize = 32;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
struct Registration {
    listen_addr: Option<String>,
}

#[derive(Debug, Default)]
struct Directory {
    registrations: HashMap<PeerIdentity, Registration>,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<Directory>>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Directory::default())),
        }
    }

    pub async fn is_registered(&self, identity: &str) -> bool {
        self.inner.read().await.registrations.contains_key(identity)
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "signal server listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_message_size(MAX_SIGNAL_MESSAGE_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("signal session ended with error: {}", err);
            }
        })
}

async fn handle_socket(
    state: AppState,
    socket: axum::extract::ws::WebSocket,
) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Pongs queued by the read half only go out when the write half sends, so
    // an idle registration still needs periodic writes to stay alive behind
    // proxies.
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let first_message = ws_receiver
        .next()
        .await
        .ok_or_else(|| "client disconnected before register".to_owned())
        .and_then(|result| result.map_err(|err| err.to_string()))?;

    let register = match parse_register_message(&first_message) {
        Ok(register) => register,
        Err(err) => {
            close_with_error(outbound_tx, send_task, SignalErrorKind::InvalidRequest, &err).await;
            return Err(err);
        }
    };

    let identity = match register_client(&state, register).await {
        Ok(identity) => identity,
        Err(err) => {
            let message = err.message.clone();
            close_with_error(outbound_tx, send_task, err.kind, &message).await;
            return Err(message);
        }
    };

    send_signal(
        &outbound_tx,
        &SignalMessage::Registered {
            identity: identity.clone(),
        },
    );
    info!(identity = %identity, "peer registered");

    let mut rate_limiter = TokenBucket::new(8.0, 4.0);

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!(identity = %identity, "websocket receive error: {}", err);
                break;
            }
        };

        match message {
            Message::Binary(data) => {
                let request = match decode_signal(&data) {
                    Ok(request) => request,
                    Err(err) => {
                        warn!(identity = %identity, "failed to decode signal message: {}", err);
                        continue;
                    }
                };

                let reply = match request {
                    SignalMessage::Lookup { identity: remote } => {
                        if rate_limiter.consume(1.0) {
                            lookup(&state, &identity, &remote).await
                        } else {
                            warn!(identity = %identity, "lookup rate limit exceeded");
                            error_message(SignalErrorKind::RateLimited, "too many lookups")
                        }
                    }
                    other => {
                        warn!(identity = %identity, "unexpected signal message after register: {:?}", other);
                        error_message(
                            SignalErrorKind::InvalidRequest,
                            "only lookups are accepted after register",
                        )
                    }
                };
                send_signal(&outbound_tx, &reply);
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
        }
    }

    unregister_client(&state, &identity).await;
    send_task.abort();
    info!(identity = %identity, "peer released");
    Ok(())
}

fn parse_register_message(message: &Message) -> Result<Register, String> {
    let data = match message {
        Message::Binary(data) => data,
        _ => return Err("first message must be a binary register frame".to_owned()),
    };

    match decode_signal(data).map_err(|err| format!("invalid register frame: {}", err))? {
        SignalMessage::Register(register) => {
            if let Some(desired) = register.desired_identity.as_deref() {
                validate_identity(desired).map_err(|err| err.to_string())?;
            }
            if let Some(listen_addr) = register.listen_addr.as_deref() {
                validate_listen_addr(listen_addr)?;
            }
            Ok(register)
        }
        _ => Err("first signal message must be Register".to_owned()),
    }
}

fn validate_listen_addr(listen_addr: &str) -> Result<(), String> {
    if listen_addr.is_empty() || listen_addr.len() > MAX_LISTEN_ADDR_LEN {
        return Err("listen_addr must be 1-255 characters".to_owned());
    }
    if listen_addr.chars().any(char::is_whitespace) || !listen_addr.contains(':') {
        return Err(format!("listen_addr {listen_addr:?} is not host:port"));
    }
    Ok(())
}

async fn register_client(state: &AppState, register: Register) -> Result<PeerIdentity, SignalError> {
    let mut directory = state.inner.write().await;
    let identity = match register.desired_identity {
        Some(desired) => {
            if directory.registrations.contains_key(&desired) {
                return Err(SignalError {
                    kind: SignalErrorKind::IdentityUnavailable,
                    message: format!("identity {desired} is already registered"),
                });
            }
            desired
        }
        None => assign_identity(&directory.registrations),
    };
    directory.registrations.insert(
        identity.clone(),
        Registration {
            listen_addr: register.listen_addr,
        },
    );
    debug!(registered = directory.registrations.len(), "directory size");
    Ok(identity)
}

/// Random 4-digit PIN; longer numeric ids once PINs keep colliding.
fn assign_identity(taken: &HashMap<PeerIdentity, Registration>) -> PeerIdentity {
    let mut rng = rand::rng();
    for _ in 0..PIN_ATTEMPTS {
        let pin = rng.random_range(1000..=9999_u32).to_string();
        if !taken.contains_key(&pin) {
            return pin;
        }
    }
    loop {
        let id = rng.random_range(10_000_000..=99_999_999_u32).to_string();
        if !taken.contains_key(&id) {
            return id;
        }
    }
}

async fn unregister_client(state: &AppState, identity: &str) {
    state.inner.write().await.registrations.remove(identity);
}

async fn lookup(state: &AppState, caller: &str, remote: &str) -> SignalMessage {
    if remote == caller {
        return error_message(SignalErrorKind::DialFailed, "cannot look up own identity");
    }
    let registration = state.inner.read().await.registrations.get(remote).cloned();
    match registration {
        Some(Registration {
            listen_addr: Some(listen_addr),
        }) => {
            debug!(caller = %caller, remote = %remote, "lookup resolved");
            SignalMessage::PeerAddress(PeerAddress {
                identity: remote.to_owned(),
                listen_addr,
            })
        }
        Some(Registration { listen_addr: None }) => error_message(
            SignalErrorKind::DialFailed,
            &format!("{remote} is not accepting calls"),
        ),
        None => error_message(
            SignalErrorKind::DialFailed,
            &format!("no peer registered as {remote}"),
        ),
    }
}

fn error_message(kind: SignalErrorKind, message: &str) -> SignalMessage {
    SignalMessage::Error(SignalError {
        kind,
        message: message.to_owned(),
    })
}

fn send_signal(tx: &mpsc::UnboundedSender<Message>, message: &SignalMessage) {
    match encode_signal(message) {
        Ok(frame) => {
            let _ = tx.send(Message::Binary(frame.into()));
        }
        Err(err) => error!("failed to serialize signal message: {}", err),
    }
}

/// Queues a final error, then lets the writer flush it and close the socket.
async fn close_with_error(
    outbound_tx: mpsc::UnboundedSender<Message>,
    send_task: JoinHandle<()>,
    kind: SignalErrorKind,
    message: &str,
) {
    send_signal(&outbound_tx, &error_message(kind, message));
    drop(outbound_tx);
    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, send_task).await.is_err() {
        warn!("timed out flushing signal error");
    }
}
