//! The BEEP session: transport, role, channel table, greetings, the
//! channel-management request side, and the connection lifecycle.
//!
//! A [`Connection`] is a cheap cloneable handle over one `Arc`'d block;
//! the reader and sequencer tasks hold the same block, and channels
//! point back to it weakly. Dropping every handle after `shutdown`
//! releases the transport.

use std::any::Any;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::chan0;
use crate::channel::{Channel, ChannelStatus, Message, MsgnoMode2};
use crate::ctx::Ctx;
use crate::error::{Error, ReplyCode, Result};
use crate::frame::FrameType;
use crate::mime::MimeHeaders;
use crate::pool::ChannelPool;
use crate::reader;
use crate::sequencer::{self, Sequencer};
use crate::transport::{Transport, TransportKind};

/// Which side of the session we are. The initiator allocates odd
/// channel numbers, the listener even ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Listener,
}

/// Per-connection options.
#[derive(Clone, Debug, Default)]
pub struct ConnOptions {
    /// Requested virtual host, carried in our `<start>` elements.
    pub server_name: Option<String>,
    /// `features` attribute of our greeting.
    pub features: Option<String>,
    /// `localize` attribute of our greeting.
    pub localize: Option<String>,
    /// Overrides the context default timeout for greetings and
    /// channel-management waits.
    pub timeout: Option<Duration>,
}

/// Options for a single `<start>` request.
#[derive(Clone, Debug, Default)]
pub struct StartOptions {
    /// Piggybacked content for the requesting `<profile>` element.
    pub content: Option<String>,
    /// Local window to advertise on the new channel.
    pub window_size: Option<u32>,
}

/// What the peer's greeting told us.
#[derive(Clone, Debug, Default)]
pub struct RemoteGreeting {
    pub profiles: Vec<String>,
    pub features: Option<String>,
    pub localize: Option<String>,
}

/// Reply to one of our channel-management requests.
#[derive(Debug)]
pub(crate) enum CtlReply {
    Profile {
        uri: String,
        content: Option<String>,
    },
    Ok,
    Refused {
        code: ReplyCode,
        text: String,
    },
}

struct CtlPending {
    /// Wire msgno, filled in once the request is queued.
    msgno: Option<u32>,
    tx: oneshot::Sender<CtlReply>,
}

enum GreetingState {
    Pending {
        waiter: Option<oneshot::Sender<Result<RemoteGreeting>>>,
    },
    Done(RemoteGreeting),
    Failed,
}

/// Pause/resume handshake between the connection and its reader task,
/// used to quiesce the stream around a transport swap.
pub(crate) struct ReaderCtl {
    pause: watch::Sender<bool>,
    ack: watch::Sender<bool>,
}

impl ReaderCtl {
    fn new() -> ReaderCtl {
        ReaderCtl {
            pause: watch::channel(false).0,
            ack: watch::channel(false).0,
        }
    }

    pub(crate) fn pause_rx(&self) -> watch::Receiver<bool> {
        self.pause.subscribe()
    }

    pub(crate) fn set_ack(&self, acked: bool) {
        let _ = self.ack.send(acked);
    }

    fn request_pause(&self, paused: bool) {
        let _ = self.pause.send(paused);
    }

    async fn wait_ack(&self, acked: bool) -> Result<()> {
        let mut rx = self.ack.subscribe();
        rx.wait_for(|a| *a == acked)
            .await
            .map(|_| ())
            .map_err(|_| Error::TransportClosed)
    }
}

type OnCloseHook = Box<dyn FnOnce(&Connection) + Send>;

#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

pub(crate) struct ConnectionInner {
    pub(crate) ctx: Ctx,
    pub(crate) role: Role,
    pub(crate) opts: ConnOptions,
    pub(crate) transport: Transport,
    pub(crate) sequencer: Sequencer,
    pub(crate) reader_ctl: ReaderCtl,
    self_ref: std::sync::Weak<ConnectionInner>,
    channels: Mutex<HashMap<u32, Channel>>,
    next_channel: Mutex<u32>,
    last_peer_channel: Mutex<u32>,
    greeting: Mutex<GreetingState>,
    ctl_lock: tokio::sync::Mutex<()>,
    ctl_pending: Mutex<Option<CtlPending>>,
    connected: AtomicBool,
    close_called: AtomicBool,
    close_fired: AtomicBool,
    on_close: Mutex<Vec<OnCloseHook>>,
    data: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    errors: Mutex<Vec<Error>>,
    server_name: Mutex<Option<String>>,
    pools: Mutex<HashMap<u32, ChannelPool>>,
    next_pool_id: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Connection {
    /// Open a TCP connection and exchange greetings.
    pub async fn connect(ctx: &Ctx, host: &str, port: u16) -> Result<Connection> {
        Connection::connect_with(ctx, host, port, ConnOptions::default()).await
    }

    pub async fn connect_with(
        ctx: &Ctx,
        host: &str,
        port: u16,
        opts: ConnOptions,
    ) -> Result<Connection> {
        let ctx_opts = ctx.options();
        if ctx.connection_count() >= ctx_opts.hard_socket_limit {
            return Err(Error::ResourceExhausted("hard socket limit"));
        }
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(ctx_opts.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::Timeout)??;
        let _ = stream.set_nodelay(true);
        Connection::with_transport_opts(ctx, Transport::tcp(stream), Role::Initiator, opts).await
    }

    /// Run a BEEP session over an already-established transport (an
    /// in-process pair, a TLS session, an external socket).
    pub async fn with_transport(
        ctx: &Ctx,
        transport: Transport,
        role: Role,
    ) -> Result<Connection> {
        Connection::with_transport_opts(ctx, transport, role, ConnOptions::default()).await
    }

    pub async fn with_transport_opts(
        ctx: &Ctx,
        transport: Transport,
        role: Role,
        opts: ConnOptions,
    ) -> Result<Connection> {
        let conn = Connection::build(ctx, transport, role, opts);
        conn.complete_greetings().await?;
        Ok(conn)
    }

    /// Create the session object and spawn its reader and sequencer.
    /// Greetings have not been sent yet; listener-side accept hooks run
    /// between `build` and [`Connection::complete_greetings`].
    pub(crate) fn build(ctx: &Ctx, transport: Transport, role: Role, opts: ConnOptions) -> Connection {
        ctx.ensure_started();
        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<ConnectionInner>| {
            let channel0 = Channel::create(
                0,
                String::new(),
                None,
                weak.clone(),
                ChannelStatus::Open,
            );
            let mut channels = HashMap::new();
            channels.insert(0, channel0);
            ConnectionInner {
                ctx: ctx.clone(),
                role,
                opts,
                transport,
                sequencer: Sequencer::new(),
                reader_ctl: ReaderCtl::new(),
                self_ref: weak.clone(),
                channels: Mutex::new(channels),
                next_channel: Mutex::new(match role {
                    Role::Initiator => 1,
                    Role::Listener => 2,
                }),
                last_peer_channel: Mutex::new(0),
                greeting: Mutex::new(GreetingState::Pending { waiter: None }),
                ctl_lock: tokio::sync::Mutex::new(()),
                ctl_pending: Mutex::new(None),
                connected: AtomicBool::new(false),
                close_called: AtomicBool::new(false),
                close_fired: AtomicBool::new(false),
                on_close: Mutex::new(Vec::new()),
                data: Mutex::new(HashMap::new()),
                errors: Mutex::new(Vec::new()),
                server_name: Mutex::new(None),
                pools: Mutex::new(HashMap::new()),
                next_pool_id: AtomicU32::new(1),
                tasks: Mutex::new(Vec::new()),
                bytes_sent: AtomicU64::new(0),
                bytes_received: AtomicU64::new(0),
            }
        });
        ctx.conn_opened();

        let reader_task = tokio::spawn(reader::run(Arc::clone(&inner)));
        let sequencer_task = tokio::spawn(sequencer::run(Arc::clone(&inner)));
        inner.tasks.lock().extend([reader_task, sequencer_task]);

        Connection { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ConnectionInner>) -> Connection {
        Connection { inner }
    }

    /// Send our greeting and wait for the peer's.
    pub(crate) async fn complete_greetings(&self) -> Result<()> {
        let conn = &self.inner;
        let mut profiles = conn.ctx.profiles().uris();
        profiles.sort();
        let xml = chan0::greeting_xml(
            &profiles,
            conn.opts.features.as_deref(),
            conn.opts.localize.as_deref(),
        );
        conn.channel0().send_management(
            FrameType::Rpy,
            MsgnoMode2::Exact(0),
            xml,
            chan0::management_mime(),
        )?;

        let waiter = {
            let mut greeting = conn.greeting.lock();
            match &mut *greeting {
                GreetingState::Done(_) => None,
                GreetingState::Failed => {
                    return Err(Error::Protocol("greeting already failed".to_string()));
                }
                GreetingState::Pending { waiter } => {
                    let (tx, rx) = oneshot::channel();
                    *waiter = Some(tx);
                    Some(rx)
                }
            }
        };

        if let Some(rx) = waiter {
            match tokio::time::timeout(self.exchange_timeout(), rx).await {
                Ok(Ok(Ok(_remote))) => {}
                Ok(Ok(Err(e))) => {
                    self.shutdown();
                    return Err(e);
                }
                Ok(Err(_)) => return Err(Error::TransportClosed),
                Err(_) => {
                    self.shutdown();
                    return Err(Error::Timeout);
                }
            }
        }

        conn.connected.store(true, Ordering::Release);
        tracing::info!(
            role = ?conn.role,
            peer = ?conn.transport.peer_addr(),
            "session ready; greetings exchanged"
        );
        Ok(())
    }

    pub fn ctx(&self) -> &Ctx {
        &self.inner.ctx
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Whether a cooperative close has been requested locally.
    pub fn close_requested(&self) -> bool {
        self.inner.close_called.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.local_addr()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.peer_addr()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    /// Payload octets written so far (frame headers excluded).
    pub fn bytes_sent(&self) -> u64 {
        self.inner.bytes_sent.load(Ordering::Acquire)
    }

    /// Payload octets received so far (frame headers excluded).
    pub fn bytes_received(&self) -> u64 {
        self.inner.bytes_received.load(Ordering::Acquire)
    }

    /// The peer's greeting, once exchanged.
    pub fn remote_greeting(&self) -> Option<RemoteGreeting> {
        match &*self.inner.greeting.lock() {
            GreetingState::Done(remote) => Some(remote.clone()),
            _ => None,
        }
    }

    /// Profiles the peer advertised in its greeting.
    pub fn remote_profiles(&self) -> Vec<String> {
        self.remote_greeting().map(|g| g.profiles).unwrap_or_default()
    }

    /// The serverName pinned for this session: what the peer asked for
    /// in its first `<start>`, or what we are configured to ask for.
    pub fn server_name(&self) -> Option<String> {
        self.inner
            .server_name
            .lock()
            .clone()
            .or_else(|| self.inner.opts.server_name.clone())
    }

    pub fn channel(&self, number: u32) -> Option<Channel> {
        self.inner.get_channel(number)
    }

    /// Numbers of all live channels, channel 0 included.
    pub fn channels(&self) -> Vec<u32> {
        let mut numbers: Vec<u32> = self.inner.channels.lock().keys().copied().collect();
        numbers.sort_unstable();
        numbers
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    /// Store a typed value on the connection (profile plug-in state).
    pub fn set_data<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.data.lock().insert(key.into(), Arc::new(value));
    }

    pub fn get_data<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.data.lock().get(key).cloned()?;
        value.downcast().ok()
    }

    pub fn remove_data(&self, key: &str) -> bool {
        self.inner.data.lock().remove(key).is_some()
    }

    /// Pop the most recent channel-level error.
    pub fn pop_error(&self) -> Option<Error> {
        self.inner.errors.lock().pop()
    }

    /// Register a hook run exactly once when the connection goes down.
    /// If it is already down, the hook runs immediately.
    pub fn add_on_close<F>(&self, hook: F)
    where
        F: FnOnce(&Connection) + Send + 'static,
    {
        if self.inner.close_fired.load(Ordering::Acquire) {
            hook(self);
            return;
        }
        let mut hooks = self.inner.on_close.lock();
        if self.inner.close_fired.load(Ordering::Acquire) {
            drop(hooks);
            hook(self);
        } else {
            hooks.push(Box::new(hook));
        }
    }

    /// Start a channel running `profile`.
    pub async fn start_channel(&self, profile: &str) -> Result<Channel> {
        self.start_channel_with(profile, StartOptions::default()).await
    }

    pub async fn start_channel_with(
        &self,
        profile: &str,
        options: StartOptions,
    ) -> Result<Channel> {
        let conn = &self.inner;
        if !self.is_connected() {
            return Err(Error::TransportClosed);
        }
        if conn.ctx.options().enforce_profiles_supported
            && !self.remote_profiles().iter().any(|uri| uri == profile)
        {
            let message = format!("profile {} not advertised by peer", profile);
            conn.push_error(Error::StartRefused {
                code: ReplyCode::ACTION_NOT_ALLOWED,
                message: message.clone(),
            });
            return Err(Error::StartRefused {
                code: ReplyCode::ACTION_NOT_ALLOWED,
                message,
            });
        }

        let number = conn.alloc_channel_number()?;
        let channel = Channel::create(
            number,
            profile.to_string(),
            conn.ctx.profiles().lookup(profile),
            Arc::downgrade(conn),
            ChannelStatus::Negotiating,
        );
        conn.insert_channel(channel.clone());

        let body = chan0::start_xml(
            number,
            conn.opts.server_name.as_deref(),
            profile,
            options.content.as_deref(),
        );
        match self.ctl_request(body).await {
            Ok(CtlReply::Profile { uri, content }) => {
                if uri != profile {
                    tracing::warn!(
                        requested = profile,
                        got = %uri,
                        "peer accepted start with a different profile URI"
                    );
                }
                channel.set_status(ChannelStatus::Open);
                channel.set_start_reply_content(content.clone());
                if let Some(window) = options.window_size {
                    channel.set_window_size(window);
                }
                conn.ctx.notify_channel_added(&channel);
                tracing::debug!(channel = number, profile, "channel started");

                if let Some(content) = content {
                    if !content.is_empty() {
                        // piggybacked reply data is delivered like a frame
                        let piggyback = Message {
                            kind: FrameType::Rpy,
                            channel: number,
                            msgno: 0,
                            ansno: None,
                            more: false,
                            mime: MimeHeaders::new(),
                            payload: Bytes::from(content),
                        };
                        reader::dispatch(conn, &channel, piggyback);
                    }
                }
                Ok(channel)
            }
            Ok(CtlReply::Refused { code, text }) => {
                channel.mark_dead();
                conn.remove_channel(number);
                conn.push_error(Error::StartRefused {
                    code,
                    message: text.clone(),
                });
                Err(Error::StartRefused {
                    code,
                    message: text,
                })
            }
            Ok(CtlReply::Ok) => {
                channel.mark_dead();
                conn.remove_channel(number);
                Err(Error::Protocol("<ok/> in reply to <start>".to_string()))
            }
            Err(e) => {
                channel.mark_dead();
                conn.remove_channel(number);
                Err(e)
            }
        }
    }

    /// Cleanly close one channel. Waits for outstanding exchanges to
    /// drain before asking the peer; a refusal leaves the channel open.
    pub async fn close_channel(&self, number: u32) -> Result<()> {
        if number == 0 {
            return Err(Error::Protocol(
                "closing channel 0 releases the session; use close()".to_string(),
            ));
        }
        let conn = &self.inner;
        let Some(channel) = conn.get_channel(number) else {
            return Err(Error::ChannelClosed(number));
        };
        if channel.status() == ChannelStatus::Dead {
            return Ok(());
        }

        if let Some(drained) = channel.register_close_waiter() {
            tracing::debug!(channel = number, "close deferred until exchanges drain");
            match tokio::time::timeout(self.exchange_timeout(), drained).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(Error::TransportClosed),
                Err(_) => {
                    channel.cancel_close_waiter();
                    return Err(Error::Timeout);
                }
            }
        }

        channel.set_status(ChannelStatus::ClosingOut);
        match self.ctl_request(chan0::close_xml(number, ReplyCode::SUCCESS)).await {
            Ok(CtlReply::Ok) => {
                channel.mark_dead();
                conn.remove_channel(number);
                conn.ctx.notify_channel_removed(&channel);
                tracing::debug!(channel = number, "channel closed");
                Ok(())
            }
            Ok(CtlReply::Refused { code, text }) => {
                channel.set_status(ChannelStatus::Open);
                conn.push_error(Error::CloseRefused {
                    code,
                    message: text.clone(),
                });
                Err(Error::CloseRefused {
                    code,
                    message: text,
                })
            }
            Ok(CtlReply::Profile { .. }) => {
                channel.set_status(ChannelStatus::Open);
                Err(Error::Protocol("<profile> in reply to <close>".to_string()))
            }
            Err(Error::Timeout) => {
                channel.set_status(ChannelStatus::Open);
                Err(Error::Timeout)
            }
            Err(e) => Err(e),
        }
    }

    /// Cooperative session close: close every channel, then release the
    /// session on channel 0. Any refusal aborts and leaves the
    /// connection up.
    pub async fn close(&self) -> Result<()> {
        let conn = &self.inner;
        conn.close_called.store(true, Ordering::Release);
        if !self.is_connected() {
            self.shutdown();
            return Ok(());
        }

        let mut numbers = self.channels();
        numbers.retain(|n| *n != 0);
        for number in numbers {
            match self.close_channel(number).await {
                Ok(()) | Err(Error::ChannelClosed(_)) => {}
                Err(e) => return Err(e),
            }
        }

        match self.ctl_request(chan0::close_xml(0, ReplyCode::SUCCESS)).await {
            // a peer racing its own teardown counts as released
            Ok(CtlReply::Ok) | Err(Error::TransportClosed) | Err(Error::ChannelClosed(_)) => {}
            Ok(CtlReply::Refused { code, text }) => {
                return Err(Error::CloseRefused {
                    code,
                    message: text,
                });
            }
            Ok(CtlReply::Profile { .. }) => {
                return Err(Error::Protocol("<profile> in reply to <close>".to_string()));
            }
            Err(e) => return Err(e),
        }

        let _ = tokio::time::timeout(Duration::from_secs(1), conn.sequencer.flush()).await;
        self.shutdown();
        Ok(())
    }

    /// Unilateral teardown: drop the transport, kill both tasks, mark
    /// every channel dead, unblock all waiters, fire on-close hooks.
    pub fn shutdown(&self) {
        self.inner.disconnected();
    }

    /// Swap the underlying stream (TLS upgrade, transport migration).
    /// Quiesces the sequencer, pauses the reader, swaps, resumes.
    pub async fn replace_transport<S>(&self, stream: S, kind: TransportKind) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let conn = &self.inner;
        let _ = tokio::time::timeout(Duration::from_secs(5), conn.sequencer.flush()).await;
        conn.reader_ctl.request_pause(true);
        conn.reader_ctl.wait_ack(true).await?;
        conn.transport.replace(stream, kind).await;
        conn.reader_ctl.request_pause(false);
        tracing::info!(kind = ?kind, "transport replaced");
        Ok(())
    }

    /// One channel-management request; channel 0 is strictly ordered,
    /// so requests queue on an async mutex.
    async fn ctl_request(&self, body: Bytes) -> Result<CtlReply> {
        let conn = &self.inner;
        let _ordered = conn.ctl_lock.lock().await;

        // register the reply slot before the request can hit the wire
        let (tx, rx) = oneshot::channel();
        *conn.ctl_pending.lock() = Some(CtlPending { msgno: None, tx });
        let msgno = match conn.channel0().send_management(
            FrameType::Msg,
            MsgnoMode2::Alloc,
            body,
            chan0::management_mime(),
        ) {
            Ok(msgno) => msgno,
            Err(e) => {
                *conn.ctl_pending.lock() = None;
                return Err(e);
            }
        };
        if let Some(pending) = conn.ctl_pending.lock().as_mut() {
            pending.msgno = Some(msgno);
        }

        match tokio::time::timeout(self.exchange_timeout(), rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::TransportClosed),
            Err(_) => {
                // the ordering lock is still ours; the slot is too
                *conn.ctl_pending.lock() = None;
                Err(Error::Timeout)
            }
        }
    }

    fn exchange_timeout(&self) -> Duration {
        self.inner
            .opts
            .timeout
            .unwrap_or_else(|| self.inner.ctx.options().default_timeout)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.inner.role)
            .field("peer", &self.peer_addr())
            .field("channels", &self.channel_count())
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ConnectionInner {
    pub(crate) fn channel0(&self) -> Channel {
        self.channels
            .lock()
            .get(&0)
            .cloned()
            .expect("channel 0 exists for the life of the connection")
    }

    pub(crate) fn get_channel(&self, number: u32) -> Option<Channel> {
        self.channels.lock().get(&number).cloned()
    }

    pub(crate) fn insert_channel(&self, channel: Channel) {
        self.channels.lock().insert(channel.number(), channel);
    }

    pub(crate) fn remove_channel(&self, number: u32) -> Option<Channel> {
        if number == 0 {
            return None;
        }
        self.channels.lock().remove(&number)
    }

    fn alloc_channel_number(&self) -> Result<u32> {
        let mut next = self.next_channel.lock();
        if *next > i32::MAX as u32 - 2 {
            return Err(Error::ResourceExhausted("channel numbers"));
        }
        let number = *next;
        *next += 2;
        Ok(number)
    }

    /// Validate a peer-chosen channel number: correct parity, strictly
    /// increasing, not in use.
    pub(crate) fn check_peer_channel_number(
        &self,
        number: u32,
    ) -> std::result::Result<(), String> {
        let expect_odd = self.role == Role::Listener;
        if number == 0 {
            return Err("channel 0 is reserved".to_string());
        }
        if (number % 2 == 1) != expect_odd {
            return Err(format!(
                "channel number {} has the wrong parity for the peer's role",
                number
            ));
        }
        let mut last = self.last_peer_channel.lock();
        if number <= *last {
            return Err(format!(
                "channel number {} not greater than previous {}",
                number, *last
            ));
        }
        if self.channels.lock().contains_key(&number) {
            return Err(format!("channel {} already exists", number));
        }
        *last = number;
        Ok(())
    }

    pub(crate) fn note_server_name(&self, name: String) {
        let mut server_name = self.server_name.lock();
        if server_name.is_none() {
            *server_name = Some(name);
        }
    }

    pub(crate) fn greeting_done(&self) -> bool {
        !matches!(&*self.greeting.lock(), GreetingState::Pending { .. })
    }

    pub(crate) fn greeting_arrived(&self, result: Result<RemoteGreeting>) {
        let mut greeting = self.greeting.lock();
        let GreetingState::Pending { waiter } = &mut *greeting else {
            return;
        };
        let waiter = waiter.take();
        match result {
            Ok(remote) => {
                *greeting = GreetingState::Done(remote.clone());
                if let Some(tx) = waiter {
                    let _ = tx.send(Ok(remote));
                }
            }
            Err(e) => {
                *greeting = GreetingState::Failed;
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Err(e));
                    }
                    None => self.push_error(e),
                }
            }
        }
    }

    pub(crate) fn ctl_reply(&self, msgno: u32, reply: CtlReply) {
        // channel 0 carries one outstanding request at a time
        let pending = self.ctl_pending.lock().take();
        match pending {
            Some(p) => {
                if p.msgno.is_some_and(|m| m != msgno) {
                    tracing::warn!(
                        msgno,
                        expected = ?p.msgno,
                        "channel-management reply msgno mismatch"
                    );
                }
                let _ = p.tx.send(reply);
            }
            None => {
                tracing::warn!(msgno, "channel-management reply matches no request");
            }
        }
    }

    pub(crate) fn wake_channel(&self, number: u32) {
        self.sequencer.mark_ready(number);
    }

    pub(crate) fn note_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn note_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::AcqRel);
    }

    pub(crate) fn push_error(&self, error: Error) {
        self.errors.lock().push(error);
    }

    pub(crate) fn alloc_pool_id(&self) -> u32 {
        self.next_pool_id.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn store_pool(&self, id: u32, pool: ChannelPool) {
        self.pools.lock().insert(id, pool);
    }

    pub(crate) fn find_pool(&self, id: u32) -> Option<ChannelPool> {
        self.pools.lock().get(&id).cloned()
    }

    pub(crate) fn drop_pool(&self, id: u32) {
        self.pools.lock().remove(&id);
    }

    /// Flush pending writes, then tear the connection down. Used when
    /// the teardown was agreed on the wire (session release, protocol
    /// error report) and the last reply must still go out.
    pub(crate) fn shutdown_when_flushed(&self) {
        let Some(conn) = self.self_ref.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let _ = tokio::time::timeout(Duration::from_secs(1), conn.sequencer.flush()).await;
            conn.disconnected();
        });
    }

    /// The one teardown path. Idempotent; runs on whichever thread
    /// observed the disconnect.
    pub(crate) fn disconnected(&self) {
        if self.close_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        self.transport.close();
        self.sequencer.stop();

        // fail the greeting waiter, if any
        {
            let mut greeting = self.greeting.lock();
            if let GreetingState::Pending { waiter } = &mut *greeting {
                waiter.take();
                *greeting = GreetingState::Failed;
            }
        }
        // fail the channel-management waiter, if any
        *self.ctl_pending.lock() = None;

        let channels: Vec<Channel> = self.channels.lock().values().cloned().collect();
        for channel in &channels {
            channel.mark_dead();
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let transport = self.transport.clone();
            handle.spawn(async move {
                transport.shutdown().await;
            });
        }

        self.ctx.conn_closed();
        tracing::info!(peer = ?self.transport.peer_addr(), "connection down");

        let hooks = std::mem::take(&mut *self.on_close.lock());
        if let Some(arc) = self.self_ref.upgrade() {
            let conn = Connection::from_inner(arc);
            for hook in hooks {
                hook(&conn);
            }
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        // all handles gone: make sure the counters and tasks go too
        if !self.close_fired.load(Ordering::Acquire) {
            self.transport.close();
            self.sequencer.stop();
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
            self.ctx.conn_closed();
        }
    }
}
