//! The library context.
//!
//! All process-wide behavior (profile registry, worker pool, timed
//! events, default timeouts, socket limits) hangs off a [`Ctx`] handle
//! threaded through every API; there are no true globals.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::channel::{Channel, Message};
use crate::profile::{CloseDecision, Profile, ProfileRegistry};
use crate::rt::{Timer, WorkerPool, WorkerPoolConfig};

/// How message bodies acquire their MIME section on send.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AutomaticMime {
    /// Prepend the channel's MIME defaults (the bare separator when
    /// they match the BEEP defaults).
    #[default]
    On,
    /// Send bodies verbatim; the application supplies the section.
    Off,
    /// Prepend only when the body does not already begin with a MIME
    /// section.
    Mixed,
}

/// Context-level configuration.
#[derive(Clone, Debug)]
pub struct CtxOptions {
    /// Refuse local `<start>` requests whose profile the peer did not
    /// advertise in its greeting.
    pub enforce_profiles_supported: bool,
    pub automatic_mime: AutomaticMime,
    /// Listen backlog for new listeners.
    pub backlog: u32,
    /// Connection count above which accepts are logged as pressure.
    pub soft_socket_limit: usize,
    /// Connection count above which accepted sockets are dropped.
    pub hard_socket_limit: usize,
    /// Default deadline for greetings and channel-management exchanges.
    pub default_timeout: Duration,
    /// Deadline for establishing outbound TCP connections.
    pub connect_timeout: Duration,
    /// Optional per-write deadline enforced by the sequencer.
    pub write_timeout: Option<Duration>,
    /// Whether a tripped write timeout shuts the connection down.
    pub close_conn_on_write_timeout: bool,
    pub workers: WorkerPoolConfig,
}

impl Default for CtxOptions {
    fn default() -> Self {
        CtxOptions {
            enforce_profiles_supported: true,
            automatic_mime: AutomaticMime::On,
            backlog: 64,
            soft_socket_limit: 1024,
            hard_socket_limit: 4096,
            default_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(60),
            write_timeout: None,
            close_conn_on_write_timeout: true,
            workers: WorkerPoolConfig::default(),
        }
    }
}

type FrameFallback = dyn Fn(&Channel, &Message) + Send + Sync;
type CloseFallback = dyn Fn(&Channel) -> CloseDecision + Send + Sync;
type ChannelNotify = dyn Fn(&Channel) + Send + Sync;

#[derive(Clone)]
pub struct Ctx {
    inner: Arc<CtxInner>,
}

struct CtxInner {
    opts: RwLock<CtxOptions>,
    profiles: ProfileRegistry,
    workers: WorkerPool,
    timer: Timer,
    data: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    frame_fallback: Mutex<Option<Arc<FrameFallback>>>,
    close_fallback: Mutex<Option<Arc<CloseFallback>>>,
    channel_added: Mutex<Option<Arc<ChannelNotify>>>,
    channel_removed: Mutex<Option<Arc<ChannelNotify>>>,
    connections: AtomicUsize,
    started: AtomicBool,
}

impl Ctx {
    pub fn new() -> Ctx {
        Ctx::with_options(CtxOptions::default())
    }

    pub fn with_options(opts: CtxOptions) -> Ctx {
        let workers = WorkerPool::new(opts.workers.clone());
        Ctx {
            inner: Arc::new(CtxInner {
                opts: RwLock::new(opts),
                profiles: ProfileRegistry::new(),
                workers,
                timer: Timer::new(),
                data: Mutex::new(HashMap::new()),
                frame_fallback: Mutex::new(None),
                close_fallback: Mutex::new(None),
                channel_added: Mutex::new(None),
                channel_removed: Mutex::new(None),
                connections: AtomicUsize::new(0),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn options(&self) -> CtxOptions {
        self.inner.opts.read().clone()
    }

    pub fn update_options(&self, f: impl FnOnce(&mut CtxOptions)) {
        f(&mut self.inner.opts.write());
    }

    /// Enable or disable the sequencer write timeout.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.inner.opts.write().write_timeout = timeout;
    }

    pub fn set_close_conn_on_write_timeout(&self, close: bool) {
        self.inner.opts.write().close_conn_on_write_timeout = close;
    }

    pub fn profiles(&self) -> &ProfileRegistry {
        &self.inner.profiles
    }

    /// Shorthand for `ctx.profiles().register(...)`.
    pub fn register_profile(&self, profile: Arc<dyn Profile>) -> bool {
        self.inner.profiles.register(profile)
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.inner.workers
    }

    pub fn timer(&self) -> &Timer {
        &self.inner.timer
    }

    /// Store a typed value under `key`, replacing any previous one.
    pub fn set_data<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.data.lock().insert(key.into(), Arc::new(value));
    }

    /// Fetch the value stored under `key`, if it has the asked-for type.
    pub fn get_data<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        let value = self.inner.data.lock().get(key).cloned()?;
        value.downcast().ok()
    }

    pub fn remove_data(&self, key: &str) -> bool {
        self.inner.data.lock().remove(key).is_some()
    }

    /// Install the fallback frame handler, consulted when neither the
    /// channel nor its profile installs one.
    pub fn set_frame_received<F>(&self, f: F)
    where
        F: Fn(&Channel, &Message) + Send + Sync + 'static,
    {
        *self.inner.frame_fallback.lock() = Some(Arc::new(f));
    }

    /// Install the fallback close-decision handler.
    pub fn set_close_notify<F>(&self, f: F)
    where
        F: Fn(&Channel) -> CloseDecision + Send + Sync + 'static,
    {
        *self.inner.close_fallback.lock() = Some(Arc::new(f));
    }

    /// Notification for every channel added to a connection.
    pub fn set_channel_added<F>(&self, f: F)
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        *self.inner.channel_added.lock() = Some(Arc::new(f));
    }

    /// Notification for every channel removed from a connection.
    pub fn set_channel_removed<F>(&self, f: F)
    where
        F: Fn(&Channel) + Send + Sync + 'static,
    {
        *self.inner.channel_removed.lock() = Some(Arc::new(f));
    }

    pub(crate) fn frame_fallback(&self) -> Option<Arc<FrameFallback>> {
        self.inner.frame_fallback.lock().clone()
    }

    pub(crate) fn close_fallback(&self) -> Option<Arc<CloseFallback>> {
        self.inner.close_fallback.lock().clone()
    }

    pub(crate) fn notify_channel_added(&self, channel: &Channel) {
        let handler = self.inner.channel_added.lock().clone();
        if let Some(handler) = handler {
            handler(channel);
        }
    }

    pub(crate) fn notify_channel_removed(&self, channel: &Channel) {
        let handler = self.inner.channel_removed.lock().clone();
        if let Some(handler) = handler {
            handler(channel);
        }
    }

    /// Connections currently alive in this context.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::Acquire)
    }

    pub(crate) fn conn_opened(&self) -> usize {
        self.inner.connections.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn conn_closed(&self) {
        self.inner.connections.fetch_sub(1, Ordering::AcqRel);
    }

    /// Attach runtime-bound machinery (the worker-pool autoscaler) the
    /// first time the context is used from inside a runtime.
    pub(crate) fn ensure_started(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.workers.attach_autoscaler(&self.inner.timer);
    }

    /// Tear down context machinery: stops the timer heap and closes the
    /// worker pool. Live connections are not touched.
    pub fn close(&self) {
        self.inner.timer.shutdown();
        self.inner.workers.close();
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Ctx::new()
    }
}

impl std::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx")
            .field("profiles", &self.inner.profiles.len())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}
