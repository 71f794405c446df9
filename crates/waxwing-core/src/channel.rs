//! Per-channel state: sequence counters, flow-control windows, pending
//! exchanges, reassembly, and the outbound message queue drained by the
//! sequencer.
//!
//! A [`Channel`] is a cheap cloneable handle; the shared state lives in
//! one mutex-guarded block. Channels hold a weak back-reference to their
//! connection so the Connection → Channel → Connection cycle cannot
//! leak; every operation that needs the connection re-upgrades it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::connection::{Connection, ConnectionInner};
use crate::ctx::AutomaticMime;
use crate::error::{Error, Result};
use crate::feeder::{FeederHandle, PayloadFeeder};
use crate::frame::{DEFAULT_MAX_FRAME_SIZE, DEFAULT_WINDOW, Frame, FrameType, MAX_MSGNO, SeqFrame};
use crate::mime::{self, MimeHeaders};
use crate::profile::{CloseDecision, Profile};

/// A reassembled inbound message (or a single fragment, when the
/// channel's complete flag is off).
#[derive(Clone, Debug)]
pub struct Message {
    pub kind: FrameType,
    pub channel: u32,
    pub msgno: u32,
    /// Answer number; present on ANS deliveries.
    pub ansno: Option<u32>,
    /// `true` only for non-final fragments delivered with the complete
    /// flag off.
    pub more: bool,
    pub mime: MimeHeaders,
    pub payload: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelStatus {
    /// `<start>` sent, awaiting the peer's `<profile>` or `<error>`.
    Negotiating,
    Open,
    /// We asked the peer to close.
    ClosingOut,
    /// The peer asked us to close.
    ClosingIn,
    Dead,
}

pub type FrameReceivedFn = dyn Fn(&Channel, &Message) + Send + Sync;
pub type CloseNotifyFn = dyn Fn(&Channel) -> CloseDecision + Send + Sync;

#[derive(Clone)]
pub struct Channel {
    pub(crate) inner: Arc<ChannelInner>,
}

pub(crate) struct ChannelInner {
    num: u32,
    profile_uri: String,
    profile: Option<Arc<dyn Profile>>,
    conn: Weak<ConnectionInner>,
    state: Mutex<ChannelState>,
    serialize: AtomicBool,
    complete: AtomicBool,
    max_frame_size: AtomicU32,
    frame_handler: Mutex<Option<Arc<FrameReceivedFn>>>,
    close_handler: Mutex<Option<Arc<CloseNotifyFn>>>,
    serial_queue: Mutex<VecDeque<Message>>,
    serial_active: AtomicBool,
}

struct ChannelState {
    status: ChannelStatus,
    // outbound
    next_seqno: u32,
    last_acked: u32,
    remote_window: u32,
    next_msgno: u32,
    outbound: VecDeque<OutboundMessage>,
    ans_next: HashMap<u32, u32>,
    // inbound
    recv_seqno: u32,
    local_window: u32,
    pending_window: Option<u32>,
    unacked: u32,
    partials: Vec<Partial>,
    // exchange tracking
    sent_outstanding: HashSet<u32>,
    recv_outstanding: HashSet<u32>,
    waiting_reply: HashMap<u32, oneshot::Sender<Message>>,
    abandoned: HashSet<u32>,
    close_pending: Option<oneshot::Sender<()>>,
    mime_defaults: Option<MimeHeaders>,
    start_content: Option<String>,
}

struct Partial {
    kind: FrameType,
    msgno: u32,
    ansno: Option<u32>,
    mime: MimeHeaders,
    buf: BytesMut,
}

pub(crate) struct OutboundMessage {
    kind: FrameType,
    msgno: u32,
    ansno: Option<u32>,
    source: PayloadSource,
    started: bool,
}

enum PayloadSource {
    Buffer { data: Bytes, offset: usize },
    Feeder {
        feeder: Box<dyn PayloadFeeder>,
        handle: FeederHandle,
        total: Option<u64>,
        sent: u64,
    },
}

/// How a message body acquires its MIME section.
enum MimeMode {
    /// Apply the context's automatic-MIME policy.
    Auto,
    /// Prepend exactly these headers.
    Explicit(MimeHeaders),
    /// Send verbatim.
    Raw,
}

enum MsgnoMode {
    Alloc,
    Exact(u32),
}

/// What the reader should do after feeding one frame into a channel.
pub(crate) struct RecvOutcome {
    pub(crate) deliveries: Vec<Delivery>,
    pub(crate) seq: Option<SeqFrame>,
}

pub(crate) enum Delivery {
    /// Hand to the channel's frame-received chain.
    Handler(Message),
    /// Complete a synchronous wait.
    Waiter(oneshot::Sender<Message>, Message),
}

impl Channel {
    pub(crate) fn create(
        num: u32,
        profile_uri: String,
        profile: Option<Arc<dyn Profile>>,
        conn: Weak<ConnectionInner>,
        status: ChannelStatus,
    ) -> Channel {
        let mime_defaults = profile.as_ref().and_then(|p| p.mime_defaults());
        Channel {
            inner: Arc::new(ChannelInner {
                num,
                profile_uri,
                profile,
                conn,
                state: Mutex::new(ChannelState {
                    status,
                    next_seqno: 0,
                    last_acked: 0,
                    remote_window: DEFAULT_WINDOW,
                    // on channel 0, msgno 0 is the greeting reply
                    next_msgno: if num == 0 { 1 } else { 0 },
                    outbound: VecDeque::new(),
                    ans_next: HashMap::new(),
                    recv_seqno: 0,
                    local_window: DEFAULT_WINDOW,
                    pending_window: None,
                    unacked: 0,
                    partials: Vec::new(),
                    sent_outstanding: HashSet::new(),
                    recv_outstanding: HashSet::new(),
                    waiting_reply: HashMap::new(),
                    abandoned: HashSet::new(),
                    close_pending: None,
                    mime_defaults,
                    start_content: None,
                }),
                serialize: AtomicBool::new(false),
                complete: AtomicBool::new(true),
                max_frame_size: AtomicU32::new(DEFAULT_MAX_FRAME_SIZE),
                frame_handler: Mutex::new(None),
                close_handler: Mutex::new(None),
                serial_queue: Mutex::new(VecDeque::new()),
                serial_active: AtomicBool::new(false),
            }),
        }
    }

    pub fn number(&self) -> u32 {
        self.inner.num
    }

    pub fn profile_uri(&self) -> &str {
        &self.inner.profile_uri
    }

    /// The owning connection, if it is still alive.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.conn.upgrade().map(Connection::from_inner)
    }

    pub fn status(&self) -> ChannelStatus {
        self.inner.state.lock().status
    }

    pub fn is_open(&self) -> bool {
        self.status() == ChannelStatus::Open
    }

    /// Open, with no exchange in flight in either direction.
    pub fn is_ready(&self) -> bool {
        let state = self.inner.state.lock();
        state.status == ChannelStatus::Open
            && state.sent_outstanding.is_empty()
            && state.recv_outstanding.is_empty()
            && state.outbound.is_empty()
    }

    /// Exchanges awaiting completion in either direction.
    pub fn outstanding_messages(&self) -> usize {
        let state = self.inner.state.lock();
        state.sent_outstanding.len() + state.recv_outstanding.len()
    }

    /// Octets the peer will currently accept from us.
    pub fn window_available(&self) -> u32 {
        window_available(&self.inner.state.lock())
    }

    pub fn remote_window(&self) -> u32 {
        self.inner.state.lock().remote_window
    }

    pub fn local_window(&self) -> u32 {
        self.inner.state.lock().local_window
    }

    /// Advertise a new local window; takes effect on the next SEQ.
    pub fn set_window_size(&self, window: u32) {
        let window = window.clamp(1, i32::MAX as u32);
        self.inner.state.lock().pending_window = Some(window);
    }

    /// Upper bound for a single outbound frame's payload.
    pub fn set_max_frame_size(&self, size: u32) {
        self.inner.max_frame_size.store(size.max(1), Ordering::Release);
    }

    /// Serialize handler invocations for this channel.
    pub fn set_serialize(&self, serialize: bool) {
        self.inner.serialize.store(serialize, Ordering::Release);
    }

    pub fn serialize(&self) -> bool {
        self.inner.serialize.load(Ordering::Acquire)
    }

    /// Reassemble fragmented messages before dispatch (the default).
    /// When off, every frame is delivered individually with `more`
    /// visible to the consumer.
    pub fn set_complete_flag(&self, complete: bool) {
        self.inner.complete.store(complete, Ordering::Release);
    }

    pub fn complete_flag(&self) -> bool {
        self.inner.complete.load(Ordering::Acquire)
    }

    /// Replace the delivery callback for this channel.
    pub fn set_frame_received<F>(&self, f: F)
    where
        F: Fn(&Channel, &Message) + Send + Sync + 'static,
    {
        *self.inner.frame_handler.lock() = Some(Arc::new(f));
    }

    /// Replace the close-decision callback for this channel.
    pub fn set_close_notify<F>(&self, f: F)
    where
        F: Fn(&Channel) -> CloseDecision + Send + Sync + 'static,
    {
        *self.inner.close_handler.lock() = Some(Arc::new(f));
    }

    /// Send a MSG; returns the allocated message number.
    pub fn send_msg(&self, payload: impl Into<Bytes>) -> Result<u32> {
        self.send_buffer(
            FrameType::Msg,
            MsgnoMode::Alloc,
            None,
            payload.into(),
            MimeMode::Auto,
        )
    }

    /// Send a MSG and wait for its reply. `timeout` falls back to the
    /// context default; on expiry the reply, if it ever arrives, is
    /// discarded.
    pub async fn send_msg_wait(
        &self,
        payload: impl Into<Bytes>,
        timeout: Option<std::time::Duration>,
    ) -> Result<Message> {
        let conn = self.conn()?;
        let wait = timeout.unwrap_or(conn.ctx.options().default_timeout);
        let (tx, rx) = oneshot::channel();
        let msgno = self.send_buffer_with_waiter(payload.into(), tx)?;

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(message)) => Ok(message),
            Ok(Err(_)) => Err(Error::TransportClosed),
            Err(_) => {
                let mut state = self.inner.state.lock();
                if state.waiting_reply.remove(&msgno).is_some() {
                    state.abandoned.insert(msgno);
                }
                Err(Error::Timeout)
            }
        }
    }

    /// Reply to `msgno` with a RPY.
    pub fn send_rpy(&self, msgno: u32, payload: impl Into<Bytes>) -> Result<()> {
        self.send_buffer(
            FrameType::Rpy,
            MsgnoMode::Exact(msgno),
            None,
            payload.into(),
            MimeMode::Auto,
        )
        .map(|_| ())
    }

    /// Reply to `msgno` with an ERR.
    pub fn send_err(&self, msgno: u32, payload: impl Into<Bytes>) -> Result<()> {
        self.send_buffer(
            FrameType::Err,
            MsgnoMode::Exact(msgno),
            None,
            payload.into(),
            MimeMode::Auto,
        )
        .map(|_| ())
    }

    /// Append one answer to the ANS series for `msgno`; returns the
    /// allocated answer number.
    pub fn send_ans(&self, msgno: u32, payload: impl Into<Bytes>) -> Result<u32> {
        self.send_buffer(
            FrameType::Ans,
            MsgnoMode::Exact(msgno),
            None,
            payload.into(),
            MimeMode::Auto,
        )
    }

    /// Terminate the ANS series for `msgno` with a NUL.
    pub fn finalize_ans(&self, msgno: u32) -> Result<()> {
        self.send_buffer(
            FrameType::Nul,
            MsgnoMode::Exact(msgno),
            None,
            Bytes::new(),
            MimeMode::Raw,
        )
        .map(|_| ())
    }

    /// Send a MSG whose content is produced lazily by `feeder`.
    pub fn send_msg_from_feeder(
        &self,
        feeder: Box<dyn PayloadFeeder>,
    ) -> Result<(u32, FeederHandle)> {
        let handle = FeederHandle::new();
        let msgno = self.send_internal(
            FrameType::Msg,
            MsgnoMode::Alloc,
            None,
            Some((feeder, handle.clone())),
            Bytes::new(),
            MimeMode::Raw,
            None,
        )?;
        Ok((msgno, handle))
    }

    /// Reply to `msgno` with a feeder-backed RPY.
    pub fn send_rpy_from_feeder(
        &self,
        msgno: u32,
        feeder: Box<dyn PayloadFeeder>,
    ) -> Result<FeederHandle> {
        let handle = FeederHandle::new();
        self.send_internal(
            FrameType::Rpy,
            MsgnoMode::Exact(msgno),
            None,
            Some((feeder, handle.clone())),
            Bytes::new(),
            MimeMode::Raw,
            None,
        )?;
        Ok(handle)
    }

    /// Append a feeder-backed answer to the ANS series for `msgno`.
    pub fn send_ans_from_feeder(
        &self,
        msgno: u32,
        feeder: Box<dyn PayloadFeeder>,
    ) -> Result<(u32, FeederHandle)> {
        let handle = FeederHandle::new();
        let ansno = self.send_internal(
            FrameType::Ans,
            MsgnoMode::Exact(msgno),
            None,
            Some((feeder, handle.clone())),
            Bytes::new(),
            MimeMode::Raw,
            None,
        )?;
        Ok((ansno, handle))
    }

    /// Initiate a clean close of this channel via channel 0.
    pub async fn close(&self) -> Result<()> {
        let conn = self.conn()?;
        Connection::from_inner(conn).close_channel(self.inner.num).await
    }

    /// Content of the peer's `<profile>` reply to our `<start>`.
    pub fn start_reply_content(&self) -> Option<String> {
        self.inner.state.lock().start_content.clone()
    }

    // ---- crate-internal surface ------------------------------------

    fn conn(&self) -> Result<Arc<ConnectionInner>> {
        self.inner
            .conn
            .upgrade()
            .ok_or(Error::ChannelClosed(self.inner.num))
    }

    pub(crate) fn profile(&self) -> Option<Arc<dyn Profile>> {
        self.inner.profile.clone()
    }

    pub(crate) fn frame_handler(&self) -> Option<Arc<FrameReceivedFn>> {
        self.inner.frame_handler.lock().clone()
    }

    pub(crate) fn close_handler(&self) -> Option<Arc<CloseNotifyFn>> {
        self.inner.close_handler.lock().clone()
    }

    pub(crate) fn set_status(&self, status: ChannelStatus) {
        self.inner.state.lock().status = status;
    }

    pub(crate) fn set_start_reply_content(&self, content: Option<String>) {
        self.inner.state.lock().start_content = content;
    }

    pub(crate) fn is_management(&self) -> bool {
        self.inner.num == 0
    }

    fn send_buffer(
        &self,
        kind: FrameType,
        msgno: MsgnoMode,
        ansno: Option<u32>,
        payload: Bytes,
        mime: MimeMode,
    ) -> Result<u32> {
        self.send_internal(kind, msgno, ansno, None, payload, mime, None)
    }

    fn send_buffer_with_waiter(
        &self,
        payload: Bytes,
        waiter: oneshot::Sender<Message>,
    ) -> Result<u32> {
        self.send_internal(
            FrameType::Msg,
            MsgnoMode::Alloc,
            None,
            None,
            payload,
            MimeMode::Auto,
            Some(waiter),
        )
    }

    /// Sends used by the channel-management layer: explicit MIME
    /// headers, no automatic policy.
    pub(crate) fn send_management(
        &self,
        kind: FrameType,
        msgno: MsgnoMode2,
        body: Bytes,
        headers: MimeHeaders,
    ) -> Result<u32> {
        let mode = match msgno {
            MsgnoMode2::Alloc => MsgnoMode::Alloc,
            MsgnoMode2::Exact(n) => MsgnoMode::Exact(n),
        };
        self.send_internal(kind, mode, None, None, body, MimeMode::Explicit(headers), None)
    }

    /// The one true send path. Validates channel state, allocates or
    /// checks the msgno, applies MIME policy, queues the message and
    /// wakes the sequencer.
    #[allow(clippy::too_many_arguments)]
    fn send_internal(
        &self,
        kind: FrameType,
        msgno: MsgnoMode,
        ansno: Option<u32>,
        feeder: Option<(Box<dyn PayloadFeeder>, FeederHandle)>,
        payload: Bytes,
        mime: MimeMode,
        waiter: Option<oneshot::Sender<Message>>,
    ) -> Result<u32> {
        let conn = self.conn()?;
        let automatic = conn.ctx.options().automatic_mime;
        let management = self.is_management();

        let (allocated, handle) = {
            let mut state = self.inner.state.lock();
            match state.status {
                ChannelStatus::Open => {}
                ChannelStatus::Negotiating | ChannelStatus::ClosingIn if management => {}
                _ => return Err(Error::ChannelClosed(self.inner.num)),
            }

            let msgno = match msgno {
                MsgnoMode::Alloc => alloc_msgno(&mut state)?,
                MsgnoMode::Exact(n) => n,
            };

            // exchange bookkeeping; the management channel tracks its
            // own request/reply pairing
            let mut ansno = ansno;
            if !management {
                match kind {
                    FrameType::Msg => {
                        state.sent_outstanding.insert(msgno);
                    }
                    FrameType::Rpy | FrameType::Err => {
                        if !state.recv_outstanding.remove(&msgno) {
                            return Err(Error::Protocol(format!(
                                "no pending MSG {} to reply to",
                                msgno
                            )));
                        }
                    }
                    FrameType::Ans => {
                        if !state.recv_outstanding.contains(&msgno) {
                            return Err(Error::Protocol(format!(
                                "no pending MSG {} to answer",
                                msgno
                            )));
                        }
                        if ansno.is_none() {
                            let next = state.ans_next.entry(msgno).or_insert(0);
                            ansno = Some(*next);
                            *next += 1;
                        }
                    }
                    FrameType::Nul => {
                        state.ans_next.remove(&msgno);
                        if !state.recv_outstanding.remove(&msgno) {
                            return Err(Error::Protocol(format!(
                                "no ANS series {} to finalize",
                                msgno
                            )));
                        }
                    }
                    FrameType::Seq => unreachable!("SEQ is not a message"),
                }
            }

            let source = match feeder {
                Some((feeder, handle)) => PayloadSource::Feeder {
                    feeder,
                    handle: handle.clone(),
                    total: None,
                    sent: 0,
                },
                None => {
                    let body = apply_mime(payload, &mime, automatic, &state.mime_defaults);
                    PayloadSource::Buffer {
                        data: body,
                        offset: 0,
                    }
                }
            };
            let handle = match &source {
                PayloadSource::Feeder { handle, .. } => Some(handle.clone()),
                PayloadSource::Buffer { .. } => None,
            };

            if let Some(waiter) = waiter {
                state.waiting_reply.insert(msgno, waiter);
            }

            state.outbound.push_back(OutboundMessage {
                kind,
                msgno,
                ansno,
                source,
                started: false,
            });
            let returned = if kind == FrameType::Ans {
                ansno.unwrap_or(0)
            } else {
                msgno
            };
            (returned, handle.map(|h| (h, msgno)))
        };

        if let Some((handle, msgno)) = handle {
            let weak = Arc::downgrade(&conn);
            let num = self.inner.num;
            handle.bind(
                msgno,
                Box::new(move || {
                    if let Some(conn) = weak.upgrade() {
                        conn.wake_channel(num);
                    }
                }),
            );
        }
        conn.wake_channel(self.inner.num);
        Ok(allocated)
    }

    /// Pull the next frame the sequencer should write, if the window
    /// and queue allow one. The second element of the pair asks the
    /// sequencer to poll this channel again.
    pub(crate) fn next_frame(&self) -> Option<(Frame, bool)> {
        let mut finished: Vec<FeederHandle> = Vec::new();
        let result = self.next_frame_locked(&mut finished);
        for handle in finished {
            handle.finish();
        }
        result
    }

    fn next_frame_locked(&self, finished: &mut Vec<FeederHandle>) -> Option<(Frame, bool)> {
        let max_frame = self.inner.max_frame_size.load(Ordering::Acquire) as usize;
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if state.status == ChannelStatus::Dead {
            return None;
        }

        loop {
            let avail = window_available(state) as usize;
            let Some(front) = state.outbound.front_mut() else {
                return None;
            };

            // feeder control flags are polled between frames
            if let PayloadSource::Feeder { handle, .. } = &front.source {
                if handle.is_cancelled() {
                    let emit_terminal = handle.should_close_on_cancel() || front.started;
                    let mut msg = state.outbound.pop_front().expect("front checked");
                    if let PayloadSource::Feeder { handle, feeder, .. } = &mut msg.source {
                        feeder.release();
                        finished.push(handle.clone());
                    }
                    if msg.kind == FrameType::Ans {
                        // the NUL below terminates the whole series
                        state.ans_next.remove(&msg.msgno);
                        state.recv_outstanding.remove(&msg.msgno);
                    }
                    if emit_terminal {
                        let kind = if msg.kind == FrameType::Ans {
                            FrameType::Nul
                        } else {
                            msg.kind
                        };
                        let frame = Frame {
                            kind,
                            channel: self.inner.num,
                            msgno: msg.msgno,
                            more: false,
                            seqno: state.next_seqno,
                            ansno: None,
                            payload: Bytes::new(),
                        };
                        maybe_fire_close(state);
                        let requeue = !state.outbound.is_empty();
                        return Some((frame, requeue));
                    }
                    maybe_fire_close(state);
                    continue;
                }
                if handle.is_paused() {
                    // resume re-marks the channel ready
                    return None;
                }
            }

            let (payload, done) = match &mut front.source {
                PayloadSource::Buffer { data, offset } => {
                    let remaining = data.len() - *offset;
                    if remaining > 0 && avail == 0 {
                        return None;
                    }
                    let n = remaining.min(max_frame).min(if remaining == 0 {
                        0
                    } else {
                        avail
                    });
                    let chunk = data.slice(*offset..*offset + n);
                    *offset += n;
                    (chunk, *offset == data.len())
                }
                PayloadSource::Feeder {
                    feeder,
                    handle,
                    total,
                    sent,
                } => {
                    if total.is_none() {
                        *total = feeder.size();
                    }
                    if avail == 0 {
                        return None;
                    }
                    let mut budget = max_frame.min(avail);
                    if let Some(total) = *total {
                        budget = budget.min((total - *sent) as usize);
                    }
                    let mut chunk = vec![0u8; budget];
                    let n = match feeder.fill(&mut chunk) {
                        Ok(n) => n,
                        Err(e) => {
                            tracing::warn!(
                                channel = self.inner.num,
                                msgno = front.msgno,
                                error = %e,
                                "payload feeder failed; completing transfer"
                            );
                            0
                        }
                    };
                    chunk.truncate(n);
                    *sent += n as u64;
                    handle.note_sent(n as u64);
                    let done = n == 0
                        || feeder.is_finished()
                        || total.is_some_and(|t| *sent >= t);
                    (Bytes::from(chunk), done)
                }
            };

            let n = payload.len();
            let frame = Frame {
                kind: front.kind,
                channel: self.inner.num,
                msgno: front.msgno,
                more: !done,
                seqno: state.next_seqno,
                ansno: if front.kind == FrameType::Ans {
                    front.ansno
                } else {
                    None
                },
                payload,
            };
            front.started = true;
            state.next_seqno = state.next_seqno.wrapping_add(n as u32);

            if done {
                let mut msg = state.outbound.pop_front().expect("front checked");
                if let PayloadSource::Feeder { feeder, handle, .. } = &mut msg.source {
                    feeder.release();
                    finished.push(handle.clone());
                }
                maybe_fire_close(state);
            }
            let requeue = !state.outbound.is_empty();
            return Some((frame, requeue));
        }
    }

    /// Apply an inbound SEQ. Returns whether the channel now has
    /// sendable work *and* is in a state where the sequencer should be
    /// woken (locally-closed channels accept the update silently).
    pub(crate) fn apply_seq(&self, ackno: u32, window: u32) -> bool {
        let mut state = self.inner.state.lock();
        let advance = ackno.wrapping_sub(state.last_acked);
        let limit = state.next_seqno.wrapping_sub(state.last_acked);
        if advance > limit {
            tracing::warn!(
                channel = self.inner.num,
                ackno,
                "SEQ acknowledges octets never sent; ignored"
            );
            return false;
        }
        state.last_acked = ackno;
        state.remote_window = window.min(i32::MAX as u32);

        matches!(state.status, ChannelStatus::Open | ChannelStatus::Negotiating)
            && !state.outbound.is_empty()
            && window_available(&state) > 0
    }

    /// Feed one inbound data frame through validation, reassembly and
    /// exchange bookkeeping.
    pub(crate) fn receive(&self, frame: Frame) -> Result<RecvOutcome> {
        let complete = self.inner.complete.load(Ordering::Acquire);
        let management = self.is_management();
        let mut state = self.inner.state.lock();

        let mut outcome = RecvOutcome {
            deliveries: Vec::new(),
            seq: None,
        };
        if state.status == ChannelStatus::Dead {
            return Ok(outcome);
        }

        if frame.seqno != state.recv_seqno {
            return Err(Error::Protocol(format!(
                "channel {}: expected seqno {}, got {}",
                self.inner.num, state.recv_seqno, frame.seqno
            )));
        }
        let n = frame.payload.len() as u32;
        if state.unacked.saturating_add(n) > state.local_window {
            return Err(Error::Protocol(format!(
                "channel {}: peer overran the advertised window",
                self.inner.num
            )));
        }
        state.recv_seqno = state.recv_seqno.wrapping_add(n);
        state.unacked += n;

        if frame.kind == FrameType::Nul && (frame.more || n != 0) {
            return Err(Error::Protocol(
                "NUL frame must be complete and empty".to_string(),
            ));
        }

        let partial_idx = state
            .partials
            .iter()
            .position(|p| p.kind == frame.kind && p.msgno == frame.msgno && p.ansno == frame.ansno);

        // first frame of a message: validate the exchange and strip the
        // MIME section; continuations carry raw payload
        let (mime, body) = match partial_idx {
            Some(_) => (MimeHeaders::new(), frame.payload.clone()),
            None => {
                if frame.kind != FrameType::Ans && !state.partials.is_empty() {
                    return Err(Error::Protocol(
                        "frames of distinct messages interleaved".to_string(),
                    ));
                }
                if !management {
                    match frame.kind {
                        FrameType::Msg => {
                            if state.recv_outstanding.contains(&frame.msgno) {
                                return Err(Error::Protocol(format!(
                                    "msgno {} reused before its reply",
                                    frame.msgno
                                )));
                            }
                        }
                        _ => {
                            if !state.sent_outstanding.contains(&frame.msgno)
                                && !state.abandoned.contains(&frame.msgno)
                            {
                                return Err(Error::Protocol(format!(
                                    "unsolicited reply to msgno {}",
                                    frame.msgno
                                )));
                            }
                        }
                    }
                }
                if frame.kind == FrameType::Nul || (frame.payload.is_empty() && !frame.more) {
                    (MimeHeaders::new(), frame.payload.clone())
                } else {
                    let (mime, offset) = mime::split(&frame.payload).map_err(Error::Frame)?;
                    (mime, frame.payload.slice(offset..))
                }
            }
        };

        if frame.more {
            // intermediate fragment
            match partial_idx {
                Some(idx) => {
                    if complete {
                        state.partials[idx].buf.extend_from_slice(&body);
                    }
                }
                None => {
                    let mut buf = BytesMut::new();
                    if complete {
                        buf.extend_from_slice(&body);
                    }
                    state.partials.push(Partial {
                        kind: frame.kind,
                        msgno: frame.msgno,
                        ansno: frame.ansno,
                        mime: mime.clone(),
                        buf,
                    });
                }
            }
            if !complete {
                outcome.deliveries.push(Delivery::Handler(Message {
                    kind: frame.kind,
                    channel: self.inner.num,
                    msgno: frame.msgno,
                    ansno: frame.ansno,
                    more: true,
                    mime,
                    payload: body,
                }));
            }
        } else {
            // terminal frame: assemble and account the exchange
            let (mime, payload) = match partial_idx {
                Some(idx) => {
                    let partial = state.partials.remove(idx);
                    if complete {
                        let mut buf = partial.buf;
                        buf.extend_from_slice(&body);
                        (partial.mime, buf.freeze())
                    } else {
                        (MimeHeaders::new(), body)
                    }
                }
                None => (mime, body),
            };

            let message = Message {
                kind: frame.kind,
                channel: self.inner.num,
                msgno: frame.msgno,
                ansno: frame.ansno,
                more: false,
                mime,
                payload,
            };

            if management {
                outcome.deliveries.push(Delivery::Handler(message));
            } else {
                match frame.kind {
                    FrameType::Msg => {
                        state.recv_outstanding.insert(frame.msgno);
                        outcome.deliveries.push(Delivery::Handler(message));
                    }
                    FrameType::Ans => {
                        match state.waiting_reply.remove(&frame.msgno) {
                            Some(tx) => outcome.deliveries.push(Delivery::Waiter(tx, message)),
                            None => {
                                if !state.abandoned.contains(&frame.msgno) {
                                    outcome.deliveries.push(Delivery::Handler(message));
                                }
                            }
                        }
                    }
                    FrameType::Rpy | FrameType::Err | FrameType::Nul => {
                        state.sent_outstanding.remove(&frame.msgno);
                        if state.abandoned.remove(&frame.msgno) {
                            tracing::debug!(
                                channel = self.inner.num,
                                msgno = frame.msgno,
                                "discarding reply that arrived after its wait timed out"
                            );
                        } else {
                            match state.waiting_reply.remove(&frame.msgno) {
                                Some(tx) => {
                                    outcome.deliveries.push(Delivery::Waiter(tx, message))
                                }
                                None => outcome.deliveries.push(Delivery::Handler(message)),
                            }
                        }
                        maybe_fire_close(&mut state);
                    }
                    FrameType::Seq => unreachable!("SEQ routed before reassembly"),
                }
            }
        }

        // SEQ hysteresis: acknowledge once half the local window is
        // consumed
        if state.unacked >= state.local_window / 2 && state.unacked > 0 {
            if let Some(window) = state.pending_window.take() {
                state.local_window = window;
            }
            outcome.seq = Some(SeqFrame {
                channel: self.inner.num,
                ackno: state.recv_seqno,
                window: state.local_window,
            });
            state.unacked = 0;
        }

        Ok(outcome)
    }

    /// Register interest in the channel becoming drained (no pending
    /// exchanges, nothing queued). Returns `None` when it already is.
    pub(crate) fn register_close_waiter(&self) -> Option<oneshot::Receiver<()>> {
        let mut state = self.inner.state.lock();
        if state.sent_outstanding.is_empty()
            && state.recv_outstanding.is_empty()
            && state.outbound.is_empty()
        {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        state.close_pending = Some(tx);
        Some(rx)
    }

    pub(crate) fn cancel_close_waiter(&self) {
        self.inner.state.lock().close_pending = None;
    }

    /// Whether the sequencer could make progress on this channel.
    pub(crate) fn has_sendable(&self) -> bool {
        let state = self.inner.state.lock();
        state.status != ChannelStatus::Dead && !state.outbound.is_empty()
    }

    /// Tear the channel down locally: fail waiters, drop queued work,
    /// finish feeders.
    pub(crate) fn mark_dead(&self) {
        let (waiters, handles) = {
            let mut state = self.inner.state.lock();
            state.status = ChannelStatus::Dead;
            state.close_pending = None;
            state.partials.clear();
            let waiters: Vec<_> = state.waiting_reply.drain().map(|(_, tx)| tx).collect();
            let mut handles = Vec::new();
            for mut msg in state.outbound.drain(..) {
                if let PayloadSource::Feeder { feeder, handle, .. } = &mut msg.source {
                    feeder.release();
                    handles.push(handle.clone());
                }
            }
            (waiters, handles)
        };
        drop(waiters); // wakes `send_msg_wait` callers with TransportClosed
        for handle in handles {
            handle.finish();
        }
    }

    pub(crate) fn push_serial(&self, message: Message) -> bool {
        self.inner.serial_queue.lock().push_back(message);
        !self.inner.serial_active.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn pop_serial(&self) -> Option<Message> {
        self.inner.serial_queue.lock().pop_front()
    }

    /// Called by the serial consumer when its queue ran dry. Returns
    /// `true` when the consumer must keep draining (a producer raced a
    /// new item in).
    pub(crate) fn serial_idle(&self) -> bool {
        self.inner.serial_active.store(false, Ordering::Release);
        if self.inner.serial_queue.lock().is_empty() {
            return false;
        }
        // a message slipped in between pop and idle; reclaim the slot
        !self.inner.serial_active.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("number", &self.inner.num)
            .field("profile", &self.inner.profile_uri)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Msgno selection for management sends (mirrored privately for the
/// normal send path).
pub(crate) enum MsgnoMode2 {
    Alloc,
    Exact(u32),
}

fn alloc_msgno(state: &mut ChannelState) -> Result<u32> {
    for _ in 0..=MAX_MSGNO {
        let candidate = state.next_msgno;
        state.next_msgno = if state.next_msgno == MAX_MSGNO {
            0
        } else {
            state.next_msgno + 1
        };
        if !state.sent_outstanding.contains(&candidate)
            && !state.abandoned.contains(&candidate)
            && !state.waiting_reply.contains_key(&candidate)
        {
            return Ok(candidate);
        }
    }
    Err(Error::ResourceExhausted("message numbers"))
}

fn window_available(state: &ChannelState) -> u32 {
    let inflight = state.next_seqno.wrapping_sub(state.last_acked);
    state.remote_window.saturating_sub(inflight)
}

fn maybe_fire_close(state: &mut ChannelState) {
    if state.close_pending.is_some()
        && state.sent_outstanding.is_empty()
        && state.recv_outstanding.is_empty()
        && state.outbound.is_empty()
    {
        if let Some(tx) = state.close_pending.take() {
            let _ = tx.send(());
        }
    }
}

fn apply_mime(
    payload: Bytes,
    mode: &MimeMode,
    automatic: AutomaticMime,
    defaults: &Option<MimeHeaders>,
) -> Bytes {
    let prelude = match mode {
        MimeMode::Raw => return payload,
        MimeMode::Explicit(headers) => mime::prelude(headers),
        MimeMode::Auto => match automatic {
            AutomaticMime::Off => return payload,
            AutomaticMime::Mixed if mime::starts_with_mime(&payload) => return payload,
            AutomaticMime::On | AutomaticMime::Mixed => {
                mime::prelude(defaults.as_ref().unwrap_or(&MimeHeaders::new()))
            }
        },
    };
    let mut body = BytesMut::with_capacity(prelude.len() + payload.len());
    body.extend_from_slice(&prelude);
    body.extend_from_slice(&payload);
    body.freeze()
}
