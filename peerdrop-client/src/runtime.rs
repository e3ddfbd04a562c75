//! Event loops that drive a [`Session`] for each role.
//!
//! One task owns the session, the channel halves and the file handle, so
//! channel events, user decisions and file reads are handled strictly one at a
//! time.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
};

use peerdrop_core::{
    CallRequest, CallState, ChannelEvent, CoreError, Role, Session, SessionEvent,
    TransferMetadata, format_file_size,
};
use tokio::{fs::File, io::AsyncReadExt, net::UdpSocket};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    ClientError,
    channel::{ChannelEvents, FrameSender, PeerChannel, PeerListener},
    files::{guess_mime, save_download},
    signal_client::SignalClient,
};

/// Hooks for whatever presents the session to a user.
pub trait TransferObserver {
    fn registered(&mut self, _identity: &str) {}

    /// Decides an inbound call. Blocking here holds the session loop.
    fn confirm_call(&mut self, _request: &CallRequest) -> bool {
        false
    }

    fn session_event(&mut self, _event: &SessionEvent) {}

    fn download_saved(&mut self, _file_name: &str, _path: &Path) {}
}

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub signal_url: Url,
    pub identity: Option<String>,
    pub remote: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendSummary {
    pub file_name: String,
    pub size: u64,
    pub chunks: u32,
    pub remote: String,
}

#[derive(Debug, Clone)]
pub struct ReceiveOptions {
    pub signal_url: Url,
    pub identity: Option<String>,
    pub listen: String,
    pub advertise: Option<String>,
    pub download_dir: PathBuf,
    /// Stop after the first call ends.
    pub once: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveSummary {
    pub calls: u32,
    pub saved: Vec<PathBuf>,
}

/// Registers, dials `remote`, waits for the callee to accept and streams one file.
pub async fn send_file<O: TransferObserver>(
    options: &SendOptions,
    observer: &mut O,
) -> Result<SendSummary, ClientError> {
    let file_name = options
        .path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| ClientError::Config(format!("{} is not a file", options.path.display())))?;
    let size = tokio::fs::metadata(&options.path).await?.len();
    let planned = TransferMetadata::new(file_name.as_str(), size, guess_mime(&options.path))?;

    let mut signal = SignalClient::open(&options.signal_url, options.identity.as_deref(), None).await?;
    observer.registered(signal.identity());

    let mut session = Session::new(signal.identity());
    session.dial(&options.remote)?;
    emit(observer, SessionEvent::StateChanged {
        from: CallState::Idle,
        to: CallState::Dialing,
    });

    let listen_addr = match signal.lookup(&options.remote).await {
        Ok(addr) => addr,
        Err(err) => {
            session.dial_failed()?;
            emit(observer, SessionEvent::StateChanged {
                from: CallState::Dialing,
                to: CallState::Idle,
            });
            return Err(err);
        }
    };

    let channel = match PeerChannel::dial(&listen_addr, session.local_identity(), &options.remote).await {
        Ok(channel) => channel,
        Err(err) => {
            let events = session.handle_channel_event(ChannelEvent::Error(err.to_string()));
            emit_all(observer, events);
            return Err(err);
        }
    };
    let (sender, mut events) = channel.split();

    let result = stream_file(&mut session, &sender, &mut events, observer, options, &planned).await;
    match result {
        Ok(()) => {
            if let Err(err) = sender.close().await {
                emit_all(observer, session.send_failed(err.to_string()));
                signal.close().await;
                return Err(ClientError::ConnectionLost(format!(
                    "{} did not receive the whole file: {err}",
                    options.remote
                )));
            }
            emit_all(observer, session.close()?);
            signal.close().await;
            info!(
                file = %file_name,
                size = %format_file_size(size),
                chunks = planned.total_chunks,
                remote = %options.remote,
                "file sent"
            );
            Ok(SendSummary {
                file_name,
                size,
                chunks: planned.total_chunks,
                remote: options.remote.clone(),
            })
        }
        Err(err) => {
            if !session.state().is_terminal() {
                emit_all(observer, session.close()?);
            }
            release(sender, &options.remote).await;
            signal.close().await;
            Err(err)
        }
    }
}

async fn stream_file<O: TransferObserver>(
    session: &mut Session,
    sender: &FrameSender,
    events: &mut ChannelEvents,
    observer: &mut O,
    options: &SendOptions,
    planned: &TransferMetadata,
) -> Result<(), ClientError> {
    while !session.peer_accepted() {
        let event = events.recv().await;
        pump(session, event, observer);
        if session.state().is_terminal() {
            return Err(ended_before_accept(session, &options.remote));
        }
    }

    let mut file = File::open(&options.path).await?;
    let metadata = session.begin_send(&planned.file_name, planned.total_size, planned.mime.clone())?;
    sender.send(&metadata).await?;
    emit(observer, SessionEvent::TransferStarted {
        role: Role::Initiator,
        metadata: planned.clone(),
    });

    while let Some(len) = session.next_chunk_len() {
        tokio::select! {
            biased;
            event = events.recv() => {
                pump(session, event, observer);
                if session.state().is_terminal() {
                    return Err(ClientError::ConnectionLost(format!(
                        "{} went away mid-transfer",
                        options.remote
                    )));
                }
            }
            permit = sender.reserve() => {
                let permit = match permit {
                    Ok(permit) => permit,
                    Err(err) => {
                        emit_all(observer, session.send_failed(err.to_string()));
                        return Err(err);
                    }
                };
                let mut buf = vec![0_u8; len];
                file.read_exact(&mut buf).await?;
                let (frame, fraction) = session.send_chunk(buf)?;
                permit.send(&frame)?;
                emit(observer, SessionEvent::Progress {
                    role: Role::Initiator,
                    fraction,
                });
            }
        }
    }

    let done = session.finish_send()?;
    sender.send(&done).await?;
    debug!(remote = %options.remote, "done frame queued");
    Ok(())
}

fn ended_before_accept(session: &Session, remote: &str) -> ClientError {
    match session.state() {
        CallState::Closed => ClientError::Rejected {
            remote: remote.to_owned(),
        },
        state => ClientError::ConnectionLost(format!("connection to {remote} {state}")),
    }
}

/// Registers as a callee and serves inbound calls until the signaling server
/// goes away, or after one call with `once`.
pub async fn receive<O: TransferObserver>(
    options: &ReceiveOptions,
    observer: &mut O,
) -> Result<ReceiveSummary, ClientError> {
    let listener = PeerListener::bind(&options.listen).await?;
    let local = listener.local_addr()?;
    let advertise = match options.advertise.clone() {
        Some(addr) => addr,
        None => advertise_addr(local, &options.signal_url).await.to_string(),
    };
    info!(listen = %local, advertise = %advertise, "accepting calls");

    let mut signal =
        SignalClient::open(&options.signal_url, options.identity.as_deref(), Some(&advertise)).await?;
    observer.registered(signal.identity());

    let mut session = Session::new(signal.identity());
    let mut summary = ReceiveSummary::default();

    loop {
        let channel = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(channel) => channel,
                Err(err) => {
                    warn!("inbound connection failed: {}", err);
                    continue;
                }
            },
            err = signal.closed() => return Err(err),
        };

        summary.calls += 1;
        serve_call(&mut session, channel, &listener, &mut signal, observer, options, &mut summary).await?;
        session.new_connection()?;

        if options.once {
            signal.close().await;
            return Ok(summary);
        }
    }
}

async fn serve_call<O: TransferObserver>(
    session: &mut Session,
    channel: PeerChannel,
    listener: &PeerListener,
    signal: &mut SignalClient,
    observer: &mut O,
    options: &ReceiveOptions,
    summary: &mut ReceiveSummary,
) -> Result<(), ClientError> {
    let remote = channel.remote_identity().to_owned();
    let (sender, mut events) = channel.split();

    let request = session.on_incoming(&remote)?;
    info!(remote = %remote, "incoming call");
    emit(observer, SessionEvent::StateChanged {
        from: CallState::Idle,
        to: CallState::AwaitingAccept,
    });
    emit(observer, SessionEvent::IncomingCall(request.clone()));

    if !observer.confirm_call(&request) {
        let events = session.reject()?;
        info!(remote = %remote, "call rejected");
        emit_all(observer, events);
        release(sender, &remote).await;
        return Ok(());
    }

    let accepted = session.accept()?;
    emit(observer, SessionEvent::StateChanged {
        from: CallState::AwaitingAccept,
        to: CallState::Open,
    });
    if let Err(err) = sender.send(&accepted).await {
        emit_all(observer, session.send_failed(err.to_string()));
        release(sender, &remote).await;
        return Ok(());
    }

    while !session.state().is_terminal() {
        tokio::select! {
            event = events.recv() => {
                for event in session.handle_channel_event(event) {
                    if let SessionEvent::DownloadReady { file_name, payload } = &event {
                        let path = save_download(&options.download_dir, file_name, payload).await?;
                        info!(file = %file_name, path = %path.display(), "download saved");
                        observer.download_saved(file_name, &path);
                        summary.saved.push(path);
                    }
                    log_event(&event);
                    observer.session_event(&event);
                }
            }
            extra = listener.accept_stream() => {
                if let Ok((stream, peer_addr)) = extra {
                    warn!(peer_addr = %peer_addr, "refusing second inbound connection while busy");
                    drop(stream);
                }
            }
            err = signal.closed() => {
                emit_all(observer, session.close()?);
                release(sender, &remote).await;
                return Err(err);
            }
        }
    }

    release(sender, &remote).await;
    Ok(())
}

/// Closes a channel whose outcome is already decided.
async fn release(sender: FrameSender, remote: &str) {
    if let Err(err) = sender.close().await {
        debug!(remote = %remote, "peer channel close: {}", err);
    }
}

/// Feeds one adapter event to the session and forwards the results.
fn pump<O: TransferObserver>(session: &mut Session, event: ChannelEvent, observer: &mut O) {
    emit_all(observer, session.handle_channel_event(event));
}

fn emit<O: TransferObserver>(observer: &mut O, event: SessionEvent) {
    log_event(&event);
    observer.session_event(&event);
}

fn emit_all<O: TransferObserver>(observer: &mut O, events: Vec<SessionEvent>) {
    for event in events {
        emit(observer, event);
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged { from, to } => info!(%from, %to, "connection state changed"),
        SessionEvent::PeerAccepted => info!("peer accepted the call"),
        SessionEvent::TransferStarted { role, metadata } => info!(
            %role,
            file = %metadata.file_name,
            size = %format_file_size(metadata.total_size),
            chunks = metadata.total_chunks,
            "transfer started"
        ),
        SessionEvent::TransferVerified { file_name } => info!(file = %file_name, "digest verified"),
        SessionEvent::FrameDropped { reason } => warn!("dropped frame: {}", reason),
        SessionEvent::TransferDiscarded { file_name } => {
            warn!(file = %file_name, "partial transfer discarded")
        }
        SessionEvent::TransportFailed { reason } => warn!("transport failed: {}", reason),
        SessionEvent::Stalled { received, expected } => {
            warn!("{}", CoreError::Stalled {
                received: *received,
                expected: *expected
            })
        }
        SessionEvent::IncomingCall(_)
        | SessionEvent::Progress { .. }
        | SessionEvent::DownloadReady { .. } => {}
    }
}

/// Address other peers should dial. A wildcard bind is replaced by the local
/// address that routes towards the signaling server.
async fn advertise_addr(local: SocketAddr, signal_url: &Url) -> SocketAddr {
    if !local.ip().is_unspecified() {
        return local;
    }
    let ip = route_ip(signal_url)
        .await
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    SocketAddr::new(ip, local.port())
}

async fn route_ip(signal_url: &Url) -> Option<IpAddr> {
    let host = signal_url.host_str()?;
    let port = signal_url.port_or_known_default()?;
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect((host, port)).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn concrete_bind_is_advertised_as_is() {
        let url = Url::parse("ws://127.0.0.1:8080/ws").unwrap();
        let local: SocketAddr = "192.168.1.9:4000".parse().unwrap();
        assert_eq!(advertise_addr(local, &url).await, local);
    }

    #[tokio::test]
    async fn wildcard_bind_uses_route_to_signal_server() {
        let url = Url::parse("ws://127.0.0.1:8080/ws").unwrap();
        let local: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        let advertised = advertise_addr(local, &url).await;
        assert_eq!(advertised.port(), 4000);
        assert!(advertised.ip().is_loopback());
    }

    #[test]
    fn closed_before_accept_is_a_rejection() {
        let mut session = Session::new("2222");
        session.dial("1111").unwrap();
        session.handle_channel_event(ChannelEvent::Open);
        session.handle_channel_event(ChannelEvent::Closed);
        assert!(matches!(
            ended_before_accept(&session, "1111"),
            ClientError::Rejected { remote } if remote == "1111"
        ));

        let mut errored = Session::new("2222");
        errored.dial("1111").unwrap();
        errored.handle_channel_event(ChannelEvent::Error("reset".to_owned()));
        assert!(matches!(
            ended_before_accept(&errored, "1111"),
            ClientError::ConnectionLost(_)
        ));
    }
}
