//! # Bus Sessions
//!
//! One actor task owns each session: the socket, the stream table, the
//! state machine, and keep-alive accounting all live inside that task, and
//! everything else talks to it through a bounded command channel with
//! one-shot replies. Stream handlers (pattern-sync, reasoning, snapshot)
//! run as their own tasks fed by per-stream channels, so a slow store
//! write on one stream never stalls frames on another.
//!
//! State machine: `Handshake → Ready → Draining → Closed`; unrecoverable
//! errors jump straight to `Closed`.

mod handshake;
mod shared;
mod streams;

pub(crate) use handshake::{perform as perform_handshake, HandshakeParams};
pub use shared::SessionShared;
pub(crate) use streams::{HandlerRx, InboundEvent, OutboundTx};
pub use streams::StreamSender;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use bank_core::capability::{verify_capability_bounds, Keyring};
use bank_core::config::BusConfig;
use bank_core::storage::PatternStore;
use bank_core::types::wire::{
    CapabilityRotatePayload, CreditGrantPayload, FrameKind, GoodbyePayload, HelloPayload,
    PingPayload, ReasoningKind, ReasoningOpenPayload, SnapshotRequestPayload, StreamAbortPayload,
    StreamKind,
};
use bank_core::types::IntentCapability;

use crate::codec::{Frame, MuxCodec, MuxItem};
use crate::error::{BusError, Result};
use crate::reasoning::ReasoningEvent;
use crate::replay::ReplayGuard;
use crate::{reasoning, snapshot, sync};

/// Stream id of the control stream; always open, never counted against
/// the stream limit.
pub(crate) const CONTROL_STREAM_ID: u32 = 0;

/// Lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Hello exchange in progress
    Handshake,
    /// Ordinary operation
    Ready,
    /// Shutting down; existing streams may finish, no new ones
    Draining,
    /// All streams aborted, resources released
    Closed,
}

/// Point-in-time view of a session, for operators and tests.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Process-unique session number
    pub session_id: u64,
    /// Peer's long-term public key
    pub peer_key: [u8; 32],
    /// Current lifecycle state
    pub state: SessionState,
    /// Streams currently open (control excluded)
    pub open_streams: usize,
    /// High-cost units charged under the current capability
    pub observed_spend: u32,
}

/// External requests into the session actor.
pub(crate) enum SessionCommand {
    OpenPatternSync {
        reply: oneshot::Sender<Result<StreamSender>>,
    },
    OpenReasoning {
        sub_kind: ReasoningKind,
        label: String,
        reply: oneshot::Sender<Result<StreamSender>>,
    },
    RequestSnapshot {
        since: DateTime<Utc>,
        done: oneshot::Sender<Result<u64>>,
    },
    RotateCapability {
        capability: IntentCapability,
        reply: oneshot::Sender<Result<()>>,
    },
    Info {
        reply: oneshot::Sender<SessionInfo>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Notifications from stream handler tasks back into the actor.
pub(crate) enum InternalCmd {
    GrantCredit { stream_id: u32, credits: u32 },
    AbortStream {
        stream_id: u32,
        reason: String,
        notify_peer: bool,
    },
    StreamFinished { stream_id: u32 },
    OpenSyncStream {
        reply: oneshot::Sender<Result<StreamSender>>,
    },
}

/// Handle to a live session; cheap to clone, valid until `Closed`.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    /// Peer's long-term public key.
    #[must_use]
    pub fn peer_key(&self) -> [u8; 32] {
        self.shared.peer_key
    }

    /// Process-unique session number.
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.shared.session_id
    }

    /// True once the session actor has exited.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| BusError::SessionClosed("session actor gone".to_string()))?;
        rx.await
            .map_err(|_| BusError::SessionClosed("session actor gone".to_string()))
    }

    /// The outgoing pattern-sync stream, opened on first use.
    pub async fn open_pattern_sync(&self) -> Result<StreamSender> {
        self.request(|reply| SessionCommand::OpenPatternSync { reply })
            .await?
    }

    /// Open a reasoning stream of `sub_kind`; the opening frame is sent
    /// before this returns.
    pub async fn open_reasoning(
        &self,
        sub_kind: ReasoningKind,
        label: impl Into<String>,
    ) -> Result<StreamSender> {
        let label = label.into();
        self.request(|reply| SessionCommand::OpenReasoning {
            sub_kind,
            label,
            reply,
        })
        .await?
    }

    /// Pull a snapshot of the peer's store since `since`; resolves with
    /// the number of patterns received once the final chunk lands.
    pub async fn request_snapshot(&self, since: DateTime<Utc>) -> Result<u64> {
        self.request(|done| SessionCommand::RequestSnapshot { since, done })
            .await?
    }

    /// Present a fresh capability to the peer for subsequent frames.
    pub async fn rotate_capability(&self, capability: IntentCapability) -> Result<()> {
        self.request(|reply| SessionCommand::RotateCapability { capability, reply })
            .await?
    }

    /// Current state snapshot.
    pub async fn info(&self) -> Result<SessionInfo> {
        self.request(|reply| SessionCommand::Info { reply }).await
    }

    /// Orderly shutdown: `Goodbye`, drain, close.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| SessionCommand::Shutdown { reply }).await;
    }
}

/// Node-level context handed to every session.
pub(crate) struct SessionContext {
    pub store: Arc<dyn PatternStore>,
    pub keyring: Arc<Keyring>,
    pub replay: Arc<ReplayGuard>,
    pub bus_config: BusConfig,
    pub reasoning_sink: Option<mpsc::Sender<ReasoningEvent>>,
}

struct StreamEntry {
    kind: StreamKind,
    /// Delivery channel into the stream's handler task, when one exists
    to_handler: Option<mpsc::Sender<InboundEvent>>,
    /// Credit pool for our own sends on this stream
    send_credit: Option<Arc<Semaphore>>,
}

/// Spawn the actor for a session that has completed its handshake.
pub(crate) fn spawn_session(
    framed: Framed<TcpStream, MuxCodec>,
    peer_hello: &HelloPayload,
    session_id: u64,
    initiator: bool,
    ctx: SessionContext,
    cleanup: Box<dyn FnOnce() + Send>,
) -> SessionHandle {
    let shared = Arc::new(SessionShared::new(
        peer_hello.issuer_key,
        session_id,
        Arc::clone(&ctx.keyring),
        peer_hello.capability.clone(),
    ));

    let (commands_tx, commands_rx) = mpsc::channel(64);
    let (internal_tx, internal_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound_rx) = mpsc::channel(256);

    let actor = SessionActor {
        framed,
        state: SessionState::Ready,
        shared: Arc::clone(&shared),
        peer_credit: peer_hello.credit_per_stream,
        local_credit: ctx.bus_config.credit_per_stream.max(1),
        ctx,
        streams: HashMap::new(),
        next_stream_id: if initiator { 1 } else { 2 },
        commands_rx,
        internal_rx,
        internal_tx,
        outbound_rx,
        outbound_tx,
        sync_out: None,
        ping_seq: 0,
        missed_pongs: 0,
        drain_deadline: None,
        goodbye_sent: false,
        commands_closed: false,
        closed_streams: HashSet::new(),
    };

    tokio::spawn(async move {
        actor.run().await;
        cleanup();
    });

    SessionHandle {
        commands: commands_tx,
        shared,
    }
}

struct SessionActor {
    framed: Framed<TcpStream, MuxCodec>,
    state: SessionState,
    shared: Arc<SessionShared>,
    ctx: SessionContext,
    /// Per-stream credit the peer granted us
    peer_credit: u32,
    /// Per-stream credit we grant the peer
    local_credit: u32,
    streams: HashMap<u32, StreamEntry>,
    next_stream_id: u32,
    commands_rx: mpsc::Receiver<SessionCommand>,
    internal_rx: mpsc::UnboundedReceiver<InternalCmd>,
    internal_tx: mpsc::UnboundedSender<InternalCmd>,
    outbound_rx: mpsc::Receiver<(u32, Frame)>,
    outbound_tx: OutboundTx,
    /// Cached outgoing pattern-sync stream (at most one per direction)
    sync_out: Option<StreamSender>,
    ping_seq: u64,
    missed_pongs: u32,
    drain_deadline: Option<Instant>,
    goodbye_sent: bool,
    /// Every handle has been dropped; stop polling the command channel
    commands_closed: bool,
    /// Ids of released streams; late frames for them are dropped instead
    /// of being misread as new streams
    closed_streams: HashSet<u32>,
}

impl SessionActor {
    async fn run(mut self) {
        let session_id = self.shared.session_id;
        info!(session_id, "session ready");

        let keepalive = Duration::from_secs(self.ctx.bus_config.keepalive_interval_secs.max(1));
        let mut keepalive_timer = tokio::time::interval_at(Instant::now() + keepalive, keepalive);

        let reason = loop {
            if self.state == SessionState::Draining && self.streams.is_empty() {
                break "drained".to_string();
            }
            let drain_at = self
                .drain_deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400));

            tokio::select! {
                item = self.framed.next() => match item {
                    None => break "peer closed connection".to_string(),
                    Some(Ok(item)) => {
                        if let Err(e) = self.handle_inbound(item).await {
                            self.send_goodbye(e.reason_code()).await;
                            break format!("protocol failure: {}", e.reason_code());
                        }
                    }
                    Some(Err(e)) => {
                        self.send_goodbye(e.reason_code()).await;
                        break format!("framing failure: {}", e.reason_code());
                    }
                },
                cmd = self.commands_rx.recv(), if !self.commands_closed => match cmd {
                    Some(cmd) => {
                        if let Err(e) = self.handle_command(cmd).await {
                            self.send_goodbye(e.reason_code()).await;
                            break format!("command failure: {}", e.reason_code());
                        }
                    }
                    // Every handle dropped: nothing can reach this session
                    // any more, drain and go
                    None => {
                        self.commands_closed = true;
                        self.begin_drain().await;
                    }
                },
                Some(icmd) = self.internal_rx.recv() => {
                    if let Err(e) = self.handle_internal(icmd).await {
                        self.send_goodbye(e.reason_code()).await;
                        break format!("internal failure: {}", e.reason_code());
                    }
                },
                Some((stream_id, frame)) = self.outbound_rx.recv() => {
                    if let Err(e) = self.write_frame(stream_id, frame).await {
                        break format!("transport failure: {}", e.reason_code());
                    }
                },
                _ = keepalive_timer.tick() => {
                    if let Err(e) = self.keepalive_tick().await {
                        break format!("keepalive failure: {}", e.reason_code());
                    }
                },
                _ = tokio::time::sleep_until(drain_at), if self.drain_deadline.is_some() => {
                    break "drain timeout".to_string();
                },
            }
        };

        self.state = SessionState::Closed;
        for (_, entry) in self.streams.drain() {
            if let Some(credit) = entry.send_credit {
                credit.close();
            }
        }
        info!(session_id, %reason, "session closed");
    }

    // -----------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------

    async fn handle_inbound(&mut self, item: MuxItem) -> Result<()> {
        match item {
            MuxItem::Oversize { stream_id, len } => {
                warn!(stream_id, len, "oversize frame announced; aborting stream");
                self.abort_stream(stream_id, "frame_too_large", true).await
            }
            MuxItem::Frame { stream_id, frame } => {
                if stream_id == CONTROL_STREAM_ID {
                    self.handle_control(frame).await
                } else {
                    self.handle_stream_frame(stream_id, frame).await
                }
            }
        }
    }

    async fn handle_control(&mut self, frame: Frame) -> Result<()> {
        match FrameKind::from_code(frame.kind) {
            Some(FrameKind::Ping) => {
                let ping: PingPayload = frame.decode()?;
                let pong = Frame::new(FrameKind::Pong, &ping)?;
                self.write_frame(CONTROL_STREAM_ID, pong).await
            }
            Some(FrameKind::Pong) => {
                self.missed_pongs = 0;
                Ok(())
            }
            Some(FrameKind::Goodbye) => {
                let goodbye: GoodbyePayload = frame.decode()?;
                debug!(reason = %goodbye.reason, "peer said goodbye");
                self.begin_drain().await;
                Ok(())
            }
            Some(FrameKind::CapabilityRotate) => {
                let rotate: CapabilityRotatePayload = frame.decode()?;
                self.handle_rotation(rotate.capability);
                Ok(())
            }
            Some(FrameKind::CreditGrant) => {
                let grant: CreditGrantPayload = frame.decode()?;
                if let Some(credit) = self
                    .streams
                    .get(&grant.stream_id)
                    .and_then(|e| e.send_credit.as_ref())
                {
                    credit.add_permits(grant.credits as usize);
                }
                Ok(())
            }
            Some(FrameKind::StreamAbort) => {
                let abort: StreamAbortPayload = frame.decode()?;
                self.abort_stream(abort.stream_id, &abort.reason, false)
                    .await
            }
            Some(FrameKind::Hello) => Err(BusError::Protocol(
                "hello after handshake".to_string(),
            )),
            Some(other) => Err(BusError::Protocol(format!(
                "frame kind 0x{:04x} is not valid on the control stream",
                other.code()
            ))),
            None => Err(BusError::UnknownFrameKind(frame.kind)),
        }
    }

    /// An inbound capability rotation. A rotation that fails validation
    /// leaves the previous capability in force; the peer finds out when
    /// its next action is refused.
    fn handle_rotation(&mut self, capability: IntentCapability) {
        if capability.subject_key != self.shared.peer_key {
            warn!("capability rotation for a different subject; ignored");
            return;
        }
        if let Err(e) = verify_capability_bounds(&capability, Utc::now(), &self.ctx.keyring) {
            warn!(reason = e.reason_code(), "capability rotation refused");
            return;
        }
        if !self
            .ctx
            .replay
            .check_and_insert(capability.issuer_key, capability.nonce)
        {
            warn!("capability rotation replayed a nonce; ignored");
            return;
        }
        self.shared.rotate(capability);
        debug!("session capability rotated");
    }

    async fn handle_stream_frame(&mut self, stream_id: u32, frame: Frame) -> Result<()> {
        let Some(entry) = self.streams.get(&stream_id) else {
            return self.open_peer_stream(stream_id, frame).await;
        };
        let stream_kind = entry.kind;
        let to_handler = entry.to_handler.clone();

        if FrameKind::from_code(frame.kind).is_none() {
            if stream_kind.is_extensible() {
                // Skipped, not delivered; hand the credit straight back
                let grant = Frame::new(
                    FrameKind::CreditGrant,
                    &CreditGrantPayload { stream_id, credits: 1 },
                )?;
                return self.write_frame(CONTROL_STREAM_ID, grant).await;
            }
            return self.abort_stream(stream_id, "unknown_frame_kind", true).await;
        }

        match to_handler {
            Some(tx) => match tx.try_send(InboundEvent::Frame(frame)) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // The peer outran the credit we granted
                    self.abort_stream(stream_id, "backpressure_abort", true).await
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Handler already finished; late frames are noise
                    Ok(())
                }
            },
            // Frames arriving on a stream we opened for outbound-only
            // traffic break the stream contract
            None => self.abort_stream(stream_id, "protocol_error", true).await,
        }
    }

    /// First frame on an unknown stream id: classify and spawn a handler.
    async fn open_peer_stream(&mut self, stream_id: u32, frame: Frame) -> Result<()> {
        let local_parity = self.next_stream_id % 2;
        if stream_id % 2 == local_parity || self.closed_streams.contains(&stream_id) {
            // A stream already opened and released; drop late frames
            return Ok(());
        }
        if self.state != SessionState::Ready {
            return Ok(());
        }
        if self.streams.len() >= self.ctx.bus_config.max_streams_per_session {
            warn!(stream_id, "stream limit reached");
            return self.send_stream_abort(stream_id, "too_many_streams").await;
        }

        let Some(kind) = FrameKind::from_code(frame.kind) else {
            return self.send_stream_abort(stream_id, "unknown_frame_kind").await;
        };
        let Some(stream_kind) = kind.opens_stream() else {
            return self.send_stream_abort(stream_id, "protocol_error").await;
        };

        match stream_kind {
            StreamKind::Control => {
                return Err(BusError::Protocol("second control stream".to_string()));
            }
            StreamKind::PatternSync => {
                let rx = self.register_handler(stream_id, StreamKind::PatternSync, false);
                let store = Arc::clone(&self.ctx.store);
                let shared = Arc::clone(&self.shared);
                let internal = self.internal_tx.clone();
                tokio::spawn(sync::run_inbound(rx, store, shared, internal));
            }
            StreamKind::Reasoning => {
                let rx = self.register_handler(stream_id, StreamKind::Reasoning, false);
                let shared = Arc::clone(&self.shared);
                let sink = self.ctx.reasoning_sink.clone();
                tokio::spawn(reasoning::relay_inbound(rx, shared, sink));
            }
            StreamKind::Snapshot => {
                if kind != FrameKind::SnapshotRequest {
                    return self.send_stream_abort(stream_id, "protocol_error").await;
                }
                let rx = self.register_handler(stream_id, StreamKind::Snapshot, true);
                let sender = self.sender_for(stream_id);
                let store = Arc::clone(&self.ctx.store);
                let shared = Arc::clone(&self.shared);
                let timeout =
                    Duration::from_secs(self.ctx.bus_config.snapshot_chunk_timeout_secs.max(1));
                tokio::spawn(snapshot::serve(rx, sender, store, shared, timeout));
            }
        }

        if let Some(tx) = self.streams.get(&stream_id).and_then(|e| e.to_handler.clone()) {
            let _ = tx.try_send(InboundEvent::Frame(frame));
        }
        Ok(())
    }

    /// Insert a stream entry with an inbound handler channel; optionally
    /// with a credit pool for our own sends on the same stream.
    fn register_handler(
        &mut self,
        stream_id: u32,
        kind: StreamKind,
        with_send_credit: bool,
    ) -> HandlerRx {
        let (tx, rx) = mpsc::channel(self.local_credit as usize);
        let send_credit =
            with_send_credit.then(|| Arc::new(Semaphore::new(self.peer_credit as usize)));
        self.streams.insert(
            stream_id,
            StreamEntry {
                kind,
                to_handler: Some(tx),
                send_credit,
            },
        );
        HandlerRx::new(stream_id, rx, self.internal_tx.clone())
    }

    fn sender_for(&self, stream_id: u32) -> StreamSender {
        let credit = self
            .streams
            .get(&stream_id)
            .and_then(|e| e.send_credit.clone())
            .unwrap_or_else(|| Arc::new(Semaphore::new(self.peer_credit as usize)));
        StreamSender::new(stream_id, credit, self.outbound_tx.clone())
    }

    // -----------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------

    async fn handle_command(&mut self, cmd: SessionCommand) -> Result<()> {
        match cmd {
            SessionCommand::OpenPatternSync { reply } => {
                let result = self.get_sync_out();
                let _ = reply.send(result);
                Ok(())
            }
            SessionCommand::OpenReasoning { sub_kind, label, reply } => {
                match self.open_local_stream(StreamKind::Reasoning) {
                    Ok(sender) => {
                        let open = Frame::new(
                            FrameKind::ReasoningOpen,
                            &ReasoningOpenPayload { sub_kind, label },
                        )?;
                        // Write the declaration here, ahead of anything
                        // the caller queues on the returned sender. A
                        // fresh stream always has credit for it.
                        if sender.try_reserve() {
                            self.write_frame(sender.stream_id(), open).await?;
                            let _ = reply.send(Ok(sender));
                        } else {
                            let _ = reply.send(Err(BusError::BackpressureAbort));
                        }
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
                Ok(())
            }
            SessionCommand::RequestSnapshot { since, done } => {
                match self.open_local_stream(StreamKind::Snapshot) {
                    Ok(sender) => {
                        let stream_id = sender.stream_id();
                        let (tx, rx) = mpsc::channel(self.local_credit as usize);
                        if let Some(entry) = self.streams.get_mut(&stream_id) {
                            entry.to_handler = Some(tx);
                        }
                        let hrx = HandlerRx::new(stream_id, rx, self.internal_tx.clone());
                        let store = Arc::clone(&self.ctx.store);
                        let timeout = Duration::from_secs(
                            self.ctx.bus_config.snapshot_chunk_timeout_secs.max(1),
                        );
                        let request = Frame::new(
                            FrameKind::SnapshotRequest,
                            &SnapshotRequestPayload { since },
                        )?;
                        tokio::spawn(snapshot::consume(
                            hrx, sender, request, store, timeout, done,
                        ));
                    }
                    Err(e) => {
                        let _ = done.send(Err(e));
                    }
                }
                Ok(())
            }
            SessionCommand::RotateCapability { capability, reply } => {
                let frame = Frame::new(
                    FrameKind::CapabilityRotate,
                    &CapabilityRotatePayload { capability },
                )?;
                let result = self.write_frame(CONTROL_STREAM_ID, frame).await;
                let _ = reply.send(result);
                Ok(())
            }
            SessionCommand::Info { reply } => {
                let _ = reply.send(SessionInfo {
                    session_id: self.shared.session_id,
                    peer_key: self.shared.peer_key,
                    state: self.state,
                    open_streams: self.streams.len(),
                    observed_spend: self.shared.observed_spend(),
                });
                Ok(())
            }
            SessionCommand::Shutdown { reply } => {
                self.begin_drain().await;
                let _ = reply.send(());
                Ok(())
            }
        }
    }

    async fn handle_internal(&mut self, cmd: InternalCmd) -> Result<()> {
        match cmd {
            InternalCmd::GrantCredit { stream_id, credits } => {
                // The stream may already be gone; a grant for it is moot
                if self.streams.contains_key(&stream_id) {
                    let grant = Frame::new(
                        FrameKind::CreditGrant,
                        &CreditGrantPayload { stream_id, credits },
                    )?;
                    self.write_frame(CONTROL_STREAM_ID, grant).await?;
                }
                Ok(())
            }
            InternalCmd::AbortStream { stream_id, reason, notify_peer } => {
                self.abort_stream(stream_id, &reason, notify_peer).await
            }
            InternalCmd::StreamFinished { stream_id } => {
                if let Some(entry) = self.streams.remove(&stream_id) {
                    self.closed_streams.insert(stream_id);
                    if let Some(credit) = entry.send_credit {
                        credit.close();
                    }
                    if self
                        .sync_out
                        .as_ref()
                        .is_some_and(|s| s.stream_id() == stream_id)
                    {
                        self.sync_out = None;
                    }
                }
                Ok(())
            }
            InternalCmd::OpenSyncStream { reply } => {
                let result = self.get_sync_out();
                let _ = reply.send(result);
                Ok(())
            }
        }
    }

    // -----------------------------------------------------------------
    // Stream management
    // -----------------------------------------------------------------

    fn get_sync_out(&mut self) -> Result<StreamSender> {
        if let Some(sender) = &self.sync_out {
            return Ok(sender.clone());
        }
        let sender = self.open_local_stream(StreamKind::PatternSync)?;
        self.sync_out = Some(sender.clone());
        Ok(sender)
    }

    fn open_local_stream(&mut self, kind: StreamKind) -> Result<StreamSender> {
        if self.state != SessionState::Ready {
            return Err(BusError::SessionClosed("session is not ready".to_string()));
        }
        if self.streams.len() >= self.ctx.bus_config.max_streams_per_session {
            return Err(BusError::TooManyStreams);
        }
        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        let credit = Arc::new(Semaphore::new(self.peer_credit as usize));
        self.streams.insert(
            stream_id,
            StreamEntry {
                kind,
                to_handler: None,
                send_credit: Some(Arc::clone(&credit)),
            },
        );
        Ok(StreamSender::new(stream_id, credit, self.outbound_tx.clone()))
    }

    async fn abort_stream(&mut self, stream_id: u32, reason: &str, notify_peer: bool) -> Result<()> {
        self.closed_streams.insert(stream_id);
        if let Some(entry) = self.streams.remove(&stream_id) {
            if let Some(tx) = entry.to_handler {
                let _ = tx.try_send(InboundEvent::Aborted(reason.to_string()));
            }
            if let Some(credit) = entry.send_credit {
                credit.close();
            }
            if self
                .sync_out
                .as_ref()
                .is_some_and(|s| s.stream_id() == stream_id)
            {
                self.sync_out = None;
            }
            debug!(stream_id, reason, "stream aborted");
        }
        if notify_peer {
            return self.send_stream_abort(stream_id, reason).await;
        }
        Ok(())
    }

    async fn send_stream_abort(&mut self, stream_id: u32, reason: &str) -> Result<()> {
        let abort = Frame::new(
            FrameKind::StreamAbort,
            &StreamAbortPayload {
                stream_id,
                reason: reason.to_string(),
            },
        )?;
        self.write_frame(CONTROL_STREAM_ID, abort).await
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    async fn begin_drain(&mut self) {
        if self.state != SessionState::Ready {
            return;
        }
        self.state = SessionState::Draining;
        self.drain_deadline = Some(
            Instant::now() + Duration::from_secs(self.ctx.bus_config.drain_timeout_secs.max(1)),
        );
        self.send_goodbye("shutdown").await;
    }

    async fn send_goodbye(&mut self, reason: &str) {
        if self.goodbye_sent {
            return;
        }
        self.goodbye_sent = true;
        if let Ok(goodbye) = Frame::new(
            FrameKind::Goodbye,
            &GoodbyePayload {
                reason: reason.to_string(),
            },
        ) {
            let _ = self.framed.send((CONTROL_STREAM_ID, goodbye)).await;
        }
    }

    async fn keepalive_tick(&mut self) -> Result<()> {
        if self.missed_pongs >= self.ctx.bus_config.keepalive_misses {
            return Err(BusError::SessionClosed(
                "keepalive: peer stopped answering".to_string(),
            ));
        }
        self.ping_seq += 1;
        self.missed_pongs += 1;
        let ping = Frame::new(FrameKind::Ping, &PingPayload { seq: self.ping_seq })?;
        self.write_frame(CONTROL_STREAM_ID, ping).await
    }

    async fn write_frame(&mut self, stream_id: u32, frame: Frame) -> Result<()> {
        self.framed.send((stream_id, frame)).await
    }
}
