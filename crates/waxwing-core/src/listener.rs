//! Accepting side: a passive socket whose connections are greeted and
//! registered, with pre-greeting accept hooks and port sharing.
//!
//! Port sharing lets several handlers coexist on one (addr, port): each
//! registered [`PortShare`] gets a peek at the first bytes of an
//! accepted socket and may claim it (say, raw TLS on a BEEP port); the
//! first to claim owns the stream, and unclaimed sockets take the
//! default BEEP path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinHandle;

use crate::connection::{ConnOptions, Connection, Role};
use crate::ctx::Ctx;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// How many octets a port-share handler gets to look at.
const PREVIEW_LEN: usize = 8;
/// How long to wait for those octets before giving the socket to BEEP.
const PREVIEW_WAIT: Duration = Duration::from_secs(2);

/// A claimant in port sharing.
pub trait PortShare: Send + Sync + 'static {
    /// Inspect the first bytes of an accepted socket. Return `true` to
    /// claim it.
    fn accepts(&self, preview: &[u8]) -> bool;

    /// Take ownership of a claimed socket.
    fn claim(&self, ctx: &Ctx, stream: TcpStream);
}

type AcceptHook = dyn Fn(&Connection) -> bool + Send + Sync;

#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    ctx: Ctx,
    local: SocketAddr,
    opts: ConnOptions,
    hooks: Mutex<Vec<Arc<AcceptHook>>>,
    shares: Mutex<Vec<Arc<dyn PortShare>>>,
    closed: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Bind and start accepting. Returns once the socket is listening;
    /// `local_addr` is then final (useful with port 0).
    pub async fn bind(ctx: &Ctx, host: &str, port: u16) -> Result<Listener> {
        Listener::bind_with(ctx, host, port, ConnOptions::default()).await
    }

    pub async fn bind_with(
        ctx: &Ctx,
        host: &str,
        port: u16,
        opts: ConnOptions,
    ) -> Result<Listener> {
        ctx.ensure_started();
        let addr = resolve(host, port).await?;
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(ctx.options().backlog)?;
        let local = listener.local_addr()?;

        let inner = Arc::new(ListenerInner {
            ctx: ctx.clone(),
            local,
            opts,
            hooks: Mutex::new(Vec::new()),
            shares: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            task: Mutex::new(None),
        });
        let task = tokio::spawn(accept_loop(Arc::downgrade(&inner), listener));
        *inner.task.lock() = Some(task);

        tracing::info!(%local, "listening");
        Ok(Listener { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    pub fn ctx(&self) -> &Ctx {
        &self.inner.ctx
    }

    /// Hook run for every accepted connection before greetings.
    /// Returning `false` drops the connection.
    pub fn on_accept<F>(&self, hook: F)
    where
        F: Fn(&Connection) -> bool + Send + Sync + 'static,
    {
        self.inner.hooks.lock().push(Arc::new(hook));
    }

    /// Attach a port-share handler; first to claim wins.
    pub fn add_port_share(&self, share: Arc<dyn PortShare>) {
        self.inner.shares.lock().push(share);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop accepting. Existing connections are untouched.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.inner.task.lock().take() {
            task.abort();
        }
        tracing::info!(local = %self.inner.local, "listener closed");
    }
}

impl Drop for ListenerInner {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local", &self.inner.local)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    addrs.next().ok_or_else(|| {
        Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "host resolved to no addresses",
        ))
    })
}

async fn accept_loop(inner: std::sync::Weak<ListenerInner>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        // the listener handle may be gone; stop accepting if so
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }

        let opts = inner.ctx.options();
        let active = inner.ctx.connection_count();
        if active >= opts.hard_socket_limit {
            tracing::warn!(peer = %peer, active, "hard socket limit reached; dropping accept");
            continue;
        }
        if active >= opts.soft_socket_limit {
            tracing::warn!(peer = %peer, active, "soft socket limit exceeded");
        }

        tokio::spawn(async move {
            handle_incoming(inner, stream, peer).await;
        });
    }
}

async fn handle_incoming(inner: Arc<ListenerInner>, stream: TcpStream, peer: SocketAddr) {
    tracing::debug!(peer = %peer, "accepted");

    // port sharing: peek at the first bytes and offer the socket around
    let shares: Vec<Arc<dyn PortShare>> = inner.shares.lock().clone();
    if !shares.is_empty() {
        let mut preview = [0u8; PREVIEW_LEN];
        let peeked = tokio::time::timeout(PREVIEW_WAIT, stream.peek(&mut preview)).await;
        if let Ok(Ok(n)) = peeked {
            for share in &shares {
                if share.accepts(&preview[..n]) {
                    tracing::debug!(peer = %peer, "socket claimed by port-share handler");
                    share.claim(&inner.ctx, stream);
                    return;
                }
            }
        }
    }

    let _ = stream.set_nodelay(true);
    let conn = Connection::build(
        &inner.ctx,
        Transport::tcp(stream),
        Role::Listener,
        inner.opts.clone(),
    );

    let hooks: Vec<Arc<AcceptHook>> = inner.hooks.lock().clone();
    for hook in hooks {
        if !hook(&conn) {
            tracing::debug!(peer = %peer, "connection refused by accept hook");
            conn.shutdown();
            return;
        }
    }

    if let Err(e) = conn.complete_greetings().await {
        tracing::debug!(peer = %peer, error = %e, "greeting exchange failed");
    }
}
