//! Composition root for one peer.
//!
//! A `Session` owns the local identity, the current connection's state machine and
//! at most one transfer component. It performs no I/O: callers feed it channel
//! events and user actions, and it answers with frames to send and
//! [`SessionEvent`]s to surface.

use bytes::Bytes;

use crate::{
    CoreError, PeerIdentity,
    call::{CallRequest, CallState, CallStateMachine, Role},
    decoder::{DecoderEvent, TransferDecoder},
    encoder::TransferEncoder,
    frame::{Frame, FrameKind, TransferMetadata, decode_frame},
};

/// What the channel adapter reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Data(Vec<u8>),
    Closed,
    Error(String),
}

impl ChannelEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelEvent::Closed | ChannelEvent::Error(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged { from: CallState, to: CallState },
    IncomingCall(CallRequest),
    PeerAccepted,
    TransferStarted { role: Role, metadata: TransferMetadata },
    Progress { role: Role, fraction: f64 },
    DownloadReady { file_name: String, payload: Bytes },
    TransferVerified { file_name: String },
    FrameDropped { reason: String },
    TransferDiscarded { file_name: String },
    TransportFailed { reason: String },
    Stalled { received: u32, expected: u32 },
}

#[derive(Debug)]
enum Transfer {
    Sending(TransferEncoder),
    Receiving(TransferDecoder),
}

/// Read-only view for the UI collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub local_identity: PeerIdentity,
    pub state: CallState,
    pub remote_identity: Option<PeerIdentity>,
    pub pending_call: Option<CallRequest>,
    pub role: Option<Role>,
    pub peer_accepted: bool,
    pub transfer_file_name: Option<String>,
    pub progress: Option<f64>,
    pub dropped_frames: u64,
}

#[derive(Debug)]
pub struct Session {
    local_identity: PeerIdentity,
    call: CallStateMachine,
    transfer: Option<Transfer>,
    peer_accepted: bool,
    dropped_frames: u64,
}

impl Session {
    pub fn new(local_identity: impl Into<PeerIdentity>) -> Self {
        Self {
            local_identity: local_identity.into(),
            call: CallStateMachine::new(),
            transfer: None,
            peer_accepted: false,
            dropped_frames: 0,
        }
    }

    pub fn local_identity(&self) -> &str {
        &self.local_identity
    }

    pub fn state(&self) -> CallState {
        self.call.state()
    }

    pub fn role(&self) -> Option<Role> {
        self.call.role()
    }

    pub fn remote_identity(&self) -> Option<&str> {
        self.call.remote_identity()
    }

    pub fn peer_accepted(&self) -> bool {
        self.peer_accepted
    }

    pub fn has_transfer(&self) -> bool {
        self.transfer.is_some()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let (transfer_file_name, progress) = match &self.transfer {
            Some(Transfer::Sending(encoder)) => (
                encoder.metadata().map(|m| m.file_name.clone()),
                encoder.metadata().map(|_| encoder.progress()),
            ),
            Some(Transfer::Receiving(decoder)) => {
                let metadata = decoder.state().metadata.as_ref();
                (
                    metadata.map(|m| m.file_name.clone()),
                    metadata.map(|_| decoder.progress()),
                )
            }
            None => (None, None),
        };
        SessionSnapshot {
            local_identity: self.local_identity.clone(),
            state: self.call.state(),
            remote_identity: self.call.remote_identity().map(str::to_owned),
            pending_call: self.call.pending_request().cloned(),
            role: self.call.role(),
            peer_accepted: self.peer_accepted,
            transfer_file_name,
            progress,
            dropped_frames: self.dropped_frames,
        }
    }

    /// Replaces a finished connection with a fresh idle one.
    pub fn new_connection(&mut self) -> Result<(), CoreError> {
        let state = self.call.state();
        if !state.is_terminal() && state != CallState::Idle {
            return Err(CoreError::InvalidState {
                operation: "new_connection",
                state,
            });
        }
        self.call = CallStateMachine::new();
        self.transfer = None;
        self.peer_accepted = false;
        Ok(())
    }

    pub fn dial(&mut self, remote_identity: &str) -> Result<(), CoreError> {
        if remote_identity == self.local_identity {
            return Err(CoreError::DialFailed {
                remote: remote_identity.to_owned(),
                reason: "cannot dial our own identity".to_owned(),
            });
        }
        self.call.dial(remote_identity)
    }

    pub fn dial_failed(&mut self) -> Result<(), CoreError> {
        self.call.dial_failed()
    }

    pub fn on_incoming(&mut self, remote_identity: &str) -> Result<CallRequest, CoreError> {
        self.call.on_incoming(remote_identity)
    }

    /// Accepts the pending call and returns the frame that tells the caller.
    pub fn accept(&mut self) -> Result<Frame, CoreError> {
        let role = self.call.accept()?;
        self.instantiate_transfer(role);
        Ok(Frame::Accepted)
    }

    /// Declines the pending call. No transfer is ever created for it.
    pub fn reject(&mut self) -> Result<Vec<SessionEvent>, CoreError> {
        let from = self.call.state();
        self.call.reject()?;
        Ok(vec![SessionEvent::StateChanged {
            from,
            to: CallState::Closed,
        }])
    }

    pub fn close(&mut self) -> Result<Vec<SessionEvent>, CoreError> {
        let from = self.call.state();
        self.call.close()?;
        let mut events = vec![SessionEvent::StateChanged {
            from,
            to: CallState::Closed,
        }];
        events.extend(self.discard_transfer());
        Ok(events)
    }

    pub fn handle_channel_event(&mut self, event: ChannelEvent) -> Vec<SessionEvent> {
        let from = self.call.state();
        match event {
            ChannelEvent::Open => match self.call.on_channel_open() {
                Some(role) => {
                    self.instantiate_transfer(role);
                    vec![SessionEvent::StateChanged {
                        from,
                        to: CallState::Open,
                    }]
                }
                None => Vec::new(),
            },
            ChannelEvent::Data(data) => self.handle_data(&data),
            ChannelEvent::Closed => {
                if !self.call.on_channel_closed() {
                    return Vec::new();
                }
                let mut events = vec![SessionEvent::StateChanged {
                    from,
                    to: CallState::Closed,
                }];
                events.extend(self.discard_transfer());
                events
            }
            ChannelEvent::Error(reason) => self.fail(from, reason),
        }
    }

    /// Starts sending a file. Returns the metadata frame to put on the channel.
    pub fn begin_send(
        &mut self,
        file_name: &str,
        total_size: u64,
        mime: Option<String>,
    ) -> Result<Frame, CoreError> {
        let encoder = self.encoder_mut("send")?;
        encoder.begin(file_name, total_size, mime)
    }

    pub fn next_chunk_len(&self) -> Option<usize> {
        match &self.transfer {
            Some(Transfer::Sending(encoder)) => encoder.next_chunk_len(),
            _ => None,
        }
    }

    /// Frames the next slice and reports the resulting send progress.
    pub fn send_chunk(&mut self, bytes: Vec<u8>) -> Result<(Frame, f64), CoreError> {
        let encoder = self.encoder_mut("send_chunk")?;
        let frame = encoder.encode_chunk(bytes)?;
        Ok((frame, encoder.progress()))
    }

    pub fn finish_send(&mut self) -> Result<Frame, CoreError> {
        self.encoder_mut("finish_send")?.finish()
    }

    /// The channel refused a frame mid-stream: the connection is lost.
    pub fn send_failed(&mut self, reason: impl Into<String>) -> Vec<SessionEvent> {
        let from = self.call.state();
        self.fail(from, reason.into())
    }

    fn fail(&mut self, from: CallState, reason: String) -> Vec<SessionEvent> {
        if !self.call.on_channel_error() {
            return Vec::new();
        }
        let mut events = vec![SessionEvent::StateChanged {
            from,
            to: CallState::Errored,
        }];
        events.extend(self.discard_transfer());
        events.push(SessionEvent::TransportFailed { reason });
        events
    }

    fn instantiate_transfer(&mut self, role: Role) {
        self.transfer = Some(match role {
            Role::Initiator => Transfer::Sending(TransferEncoder::new()),
            Role::Responder => Transfer::Receiving(TransferDecoder::new()),
        });
    }

    fn discard_transfer(&mut self) -> Option<SessionEvent> {
        let metadata = match self.transfer.take()? {
            Transfer::Sending(mut encoder) => encoder.abort(),
            Transfer::Receiving(mut decoder) => decoder.discard(),
        };
        metadata.map(|m| SessionEvent::TransferDiscarded {
            file_name: m.file_name,
        })
    }

    fn encoder_mut(&mut self, operation: &'static str) -> Result<&mut TransferEncoder, CoreError> {
        let state = self.call.state();
        match &mut self.transfer {
            Some(Transfer::Sending(encoder)) if state == CallState::Open => Ok(encoder),
            _ => Err(CoreError::InvalidState { operation, state }),
        }
    }

    fn drop_frame(&mut self, reason: String) -> Vec<SessionEvent> {
        self.dropped_frames += 1;
        vec![SessionEvent::FrameDropped { reason }]
    }

    fn unexpected_frame(&mut self, kind: FrameKind) -> Vec<SessionEvent> {
        let role = self
            .call
            .role()
            .map_or_else(|| "unknown".to_owned(), |role| role.to_string());
        self.drop_frame(format!("unexpected {} frame for {role} role", kind.name()))
    }

    fn handle_data(&mut self, data: &[u8]) -> Vec<SessionEvent> {
        let state = self.call.state();
        if state != CallState::Open {
            return self.drop_frame(format!("frame received while {state}"));
        }

        let frame = match decode_frame(data) {
            Ok(frame) => frame,
            Err(err) => {
                return self.drop_frame(CoreError::ProtocolViolation(err.to_string()).to_string());
            }
        };

        let kind = frame.kind();
        match (self.call.role(), frame) {
            (Some(Role::Initiator), Frame::Accepted) => {
                if self.peer_accepted {
                    return self.drop_frame("duplicate accepted frame".to_owned());
                }
                self.peer_accepted = true;
                vec![SessionEvent::PeerAccepted]
            }
            (
                Some(Role::Responder),
                frame @ (Frame::Metadata(_) | Frame::Chunk(_) | Frame::Done(_)),
            ) => {
                let result = if let Some(Transfer::Receiving(decoder)) = &mut self.transfer {
                    feed_decoder(decoder, frame)
                } else {
                    return self.unexpected_frame(kind);
                };
                self.decoder_outcome(result)
            }
            _ => self.unexpected_frame(kind),
        }
    }

    fn decoder_outcome(
        &mut self,
        result: Result<Vec<DecoderEvent>, CoreError>,
    ) -> Vec<SessionEvent> {
        match result {
            Ok(events) => events.into_iter().map(Self::lift).collect(),
            Err(CoreError::Stalled { received, expected }) => {
                vec![SessionEvent::Stalled { received, expected }]
            }
            Err(err) => self.drop_frame(err.to_string()),
        }
    }

    fn lift(event: DecoderEvent) -> SessionEvent {
        match event {
            DecoderEvent::Started(metadata) => SessionEvent::TransferStarted {
                role: Role::Responder,
                metadata,
            },
            DecoderEvent::Progress { received, total } => SessionEvent::Progress {
                role: Role::Responder,
                fraction: f64::from(received) / f64::from(total),
            },
            DecoderEvent::DownloadReady(download) => SessionEvent::DownloadReady {
                file_name: download.file_name,
                payload: download.payload,
            },
            DecoderEvent::Discarded { file_name, .. } => {
                SessionEvent::TransferDiscarded { file_name }
            }
            DecoderEvent::Verified { file_name } => SessionEvent::TransferVerified { file_name },
        }
    }
}

fn feed_decoder(
    decoder: &mut TransferDecoder,
    frame: Frame,
) -> Result<Vec<DecoderEvent>, CoreError> {
    match frame {
        Frame::Metadata(metadata) => decoder.on_metadata(metadata),
        Frame::Chunk(chunk) => decoder.on_chunk(chunk),
        Frame::Done(done) => decoder.on_done(done),
        other => Err(CoreError::ProtocolViolation(format!(
            "unexpected {} frame",
            other.kind().name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        CHUNK_SIZE,
        frame::{Chunk, encode_frame},
    };

    fn wire(frame: &Frame) -> ChannelEvent {
        ChannelEvent::Data(encode_frame(frame).unwrap())
    }

    fn open_responder() -> Session {
        let mut session = Session::new("1111");
        session.on_incoming("2222").unwrap();
        assert!(matches!(session.accept().unwrap(), Frame::Accepted));
        session
    }

    fn open_initiator() -> Session {
        let mut session = Session::new("2222");
        session.dial("1111").unwrap();
        let events = session.handle_channel_event(ChannelEvent::Open);
        assert_eq!(
            events,
            vec![SessionEvent::StateChanged {
                from: CallState::Dialing,
                to: CallState::Open
            }]
        );
        session
    }

    fn downloads(events: &[SessionEvent]) -> Vec<(String, Bytes)> {
        events
            .iter()
            .filter_map(|event| match event {
                SessionEvent::DownloadReady { file_name, payload } => {
                    Some((file_name.clone(), payload.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Streams `payload` from `sender` to `receiver`, returning receiver events.
    fn pump(sender: &mut Session, receiver: &mut Session, payload: &[u8]) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        let metadata = sender
            .begin_send("photo.jpg", payload.len() as u64, Some("image/jpeg".to_owned()))
            .unwrap();
        events.extend(receiver.handle_channel_event(wire(&metadata)));
        let mut offset = 0;
        while let Some(len) = sender.next_chunk_len() {
            let (frame, _) = sender.send_chunk(payload[offset..offset + len].to_vec()).unwrap();
            offset += len;
            events.extend(receiver.handle_channel_event(wire(&frame)));
        }
        let done = sender.finish_send().unwrap();
        events.extend(receiver.handle_channel_event(wire(&done)));
        events
    }

    #[test]
    fn initiator_learns_about_acceptance() {
        let mut responder_side = Session::new("1111");
        responder_side.on_incoming("2222").unwrap();
        let accepted = responder_side.accept().unwrap();

        let mut initiator = open_initiator();
        assert!(!initiator.peer_accepted());
        let events = initiator.handle_channel_event(wire(&accepted));
        assert_eq!(events, vec![SessionEvent::PeerAccepted]);
        assert!(initiator.snapshot().peer_accepted);
    }

    #[test]
    fn full_transfer_between_two_sessions() {
        let mut initiator = open_initiator();
        let mut responder = open_responder();
        let payload: Vec<u8> = (0..(2 * CHUNK_SIZE + 99)).map(|i| (i % 256) as u8).collect();

        let events = pump(&mut initiator, &mut responder, &payload);
        let ready = downloads(&events);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, "photo.jpg");
        assert_eq!(ready[0].1.as_ref(), payload.as_slice());
        assert!(events.contains(&SessionEvent::TransferVerified {
            file_name: "photo.jpg".to_owned()
        }));
        assert_eq!(responder.snapshot().progress, Some(1.0));
    }

    #[test]
    fn repeated_transfers_share_one_connection() {
        let mut initiator = open_initiator();
        let mut responder = open_responder();

        let first = pump(&mut initiator, &mut responder, b"first");
        let second = pump(&mut initiator, &mut responder, b"second payload");
        assert_eq!(downloads(&first)[0].1.as_ref(), b"first");
        assert_eq!(downloads(&second)[0].1.as_ref(), b"second payload");
        assert_eq!(initiator.state(), CallState::Open);
    }

    #[test]
    fn empty_file_scenario() {
        let mut initiator = open_initiator();
        let mut responder = open_responder();

        let metadata = initiator.begin_send("empty.txt", 0, None).unwrap();
        assert_eq!(initiator.next_chunk_len(), None);
        let events = responder.handle_channel_event(wire(&metadata));
        let ready = downloads(&events);
        assert_eq!(ready.len(), 1);
        assert!(ready[0].1.is_empty());
    }

    #[test]
    fn second_send_while_in_flight_is_busy() {
        let mut initiator = open_initiator();
        initiator.begin_send("a.bin", 10, None).unwrap();
        assert!(matches!(
            initiator.begin_send("b.bin", 10, None),
            Err(CoreError::Busy)
        ));
        assert_eq!(initiator.state(), CallState::Open);
    }

    #[test]
    fn send_requires_open_initiator() {
        let mut idle = Session::new("1111");
        assert!(matches!(
            idle.begin_send("a.bin", 1, None),
            Err(CoreError::InvalidState { .. })
        ));

        let mut responder = open_responder();
        assert!(matches!(
            responder.begin_send("a.bin", 1, None),
            Err(CoreError::InvalidState { .. })
        ));
    }

    #[test]
    fn reject_never_instantiates_a_transfer() {
        let mut session = Session::new("1111");
        session.on_incoming("2222").unwrap();
        assert_eq!(session.state(), CallState::AwaitingAccept);
        assert!(!session.has_transfer());

        let events = session.handle_channel_event(wire(&Frame::Metadata(
            TransferMetadata::new("early.bin", 4, None).unwrap(),
        )));
        assert!(matches!(events[0], SessionEvent::FrameDropped { .. }));

        assert_eq!(
            session.reject().unwrap(),
            vec![SessionEvent::StateChanged {
                from: CallState::AwaitingAccept,
                to: CallState::Closed
            }]
        );
        assert_eq!(session.state(), CallState::Closed);
        assert!(session.reject().is_err());
        assert!(!session.has_transfer());
        assert!(session.accept().is_err());
    }

    #[test]
    fn transport_error_mid_transfer_discards_receiver_state() {
        let mut initiator = open_initiator();
        let mut responder = open_responder();
        let payload = vec![3_u8; 10 * CHUNK_SIZE];

        let metadata = initiator.begin_send("big.bin", payload.len() as u64, None).unwrap();
        responder.handle_channel_event(wire(&metadata));
        for index in 0..4 {
            let start = index * CHUNK_SIZE;
            let (frame, _) = initiator
                .send_chunk(payload[start..start + CHUNK_SIZE].to_vec())
                .unwrap();
            let events = responder.handle_channel_event(wire(&frame));
            assert!(downloads(&events).is_empty());
        }

        let events = responder.handle_channel_event(ChannelEvent::Error("reset by peer".to_owned()));
        assert_eq!(responder.state(), CallState::Errored);
        assert!(!responder.has_transfer());
        assert!(downloads(&events).is_empty());
        assert!(events.contains(&SessionEvent::TransferDiscarded {
            file_name: "big.bin".to_owned()
        }));
        assert!(events.contains(&SessionEvent::TransportFailed {
            reason: "reset by peer".to_owned()
        }));

        let sender_events = initiator.send_failed("broken pipe");
        assert_eq!(initiator.state(), CallState::Errored);
        assert!(sender_events.contains(&SessionEvent::TransferDiscarded {
            file_name: "big.bin".to_owned()
        }));
        assert!(initiator.send_chunk(vec![0; CHUNK_SIZE]).is_err());
    }

    #[test]
    fn chunk_before_metadata_keeps_connection() {
        let mut responder = open_responder();
        let events = responder.handle_channel_event(wire(&Frame::Chunk(Chunk {
            index: 0,
            bytes: vec![1, 2, 3],
        })));
        assert!(matches!(events[0], SessionEvent::FrameDropped { .. }));
        assert_eq!(responder.state(), CallState::Open);
        assert_eq!(responder.snapshot().dropped_frames, 1);
    }

    #[test]
    fn unknown_frame_kind_is_dropped() {
        let mut responder = open_responder();
        let mut raw = encode_frame(&Frame::Accepted).unwrap();
        raw[4] = 99;
        let events = responder.handle_channel_event(ChannelEvent::Data(raw));
        match &events[0] {
            SessionEvent::FrameDropped { reason } => assert!(reason.contains("protocol violation")),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(responder.state(), CallState::Open);
    }

    #[test]
    fn close_then_new_connection() {
        let mut session = open_responder();
        let events = session.close().unwrap();
        assert_eq!(
            events[0],
            SessionEvent::StateChanged {
                from: CallState::Open,
                to: CallState::Closed
            }
        );
        assert!(session.dial("2222").is_err());

        session.new_connection().unwrap();
        assert_eq!(session.state(), CallState::Idle);
        session.dial("2222").unwrap();
        assert!(session.new_connection().is_err());
    }

    #[test]
    fn remote_close_is_ignored_once_terminal() {
        let mut session = open_initiator();
        assert_eq!(session.handle_channel_event(ChannelEvent::Closed).len(), 1);
        assert!(session.handle_channel_event(ChannelEvent::Closed).is_empty());
        assert!(session
            .handle_channel_event(ChannelEvent::Error("late".to_owned()))
            .is_empty());
        assert_eq!(session.state(), CallState::Closed);
    }

    #[test]
    fn dialing_ourselves_fails() {
        let mut session = Session::new("1111");
        assert!(matches!(
            session.dial("1111"),
            Err(CoreError::DialFailed { .. })
        ));
        assert_eq!(session.state(), CallState::Idle);
    }

    #[test]
    fn snapshot_reports_pending_call() {
        let mut session = Session::new("1111");
        session.on_incoming("2222").unwrap();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.state, CallState::AwaitingAccept);
        assert_eq!(
            snapshot.pending_call,
            Some(CallRequest {
                remote_identity: "2222".to_owned()
            })
        );
        assert_eq!(snapshot.role, None);
        assert_eq!(snapshot.progress, None);
    }
}
