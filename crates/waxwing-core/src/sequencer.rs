//! Outbound scheduler: one task per connection slices queued messages
//! into frames, honoring each channel's advertised window.
//!
//! The sequencer is the only writer on a connection's transport, which
//! makes writes totally ordered across all channels. Channels become
//! "ready" when a message is enqueued or a SEQ reopens their window;
//! ready channels are served round-robin, one frame per turn. SEQ
//! acknowledgements jump the queue.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::{Notify, oneshot};

use parking_lot::Mutex;

use crate::connection::ConnectionInner;
use crate::frame::SeqFrame;

pub(crate) struct Sequencer {
    state: Mutex<SeqState>,
    notify: Notify,
}

struct SeqState {
    ready: VecDeque<u32>,
    queued: HashSet<u32>,
    seqs: VecDeque<SeqFrame>,
    flushes: Vec<oneshot::Sender<()>>,
    stopped: bool,
}

enum Work {
    Seq(SeqFrame),
    Channel(u32),
    Idle,
    Stopped,
}

impl Sequencer {
    pub(crate) fn new() -> Sequencer {
        Sequencer {
            state: Mutex::new(SeqState {
                ready: VecDeque::new(),
                queued: HashSet::new(),
                seqs: VecDeque::new(),
                flushes: Vec::new(),
                stopped: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Note that `channel` has sendable work.
    pub(crate) fn mark_ready(&self, channel: u32) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        if state.queued.insert(channel) {
            state.ready.push_back(channel);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Queue a SEQ acknowledgement ahead of data frames.
    pub(crate) fn push_seq(&self, seq: SeqFrame) {
        let mut state = self.state.lock();
        if state.stopped {
            return;
        }
        state.seqs.push_back(seq);
        drop(state);
        self.notify.notify_one();
    }

    /// Resolves once every write queued so far has hit the transport.
    pub(crate) fn flush(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.stopped {
            let _ = tx.send(());
        } else {
            state.flushes.push(tx);
        }
        drop(state);
        self.notify.notify_one();
        rx
    }

    pub(crate) fn stop(&self) {
        let mut state = self.state.lock();
        state.stopped = true;
        for tx in state.flushes.drain(..) {
            let _ = tx.send(());
        }
        drop(state);
        self.notify.notify_waiters();
    }

    fn pop_work(&self) -> Work {
        let mut state = self.state.lock();
        if state.stopped {
            return Work::Stopped;
        }
        if let Some(seq) = state.seqs.pop_front() {
            return Work::Seq(seq);
        }
        if let Some(channel) = state.ready.pop_front() {
            state.queued.remove(&channel);
            return Work::Channel(channel);
        }
        // idle: everything enqueued has been written
        for tx in state.flushes.drain(..) {
            let _ = tx.send(());
        }
        Work::Idle
    }
}

/// The per-connection sequencer task.
pub(crate) async fn run(conn: Arc<ConnectionInner>) {
    loop {
        match conn.sequencer.pop_work() {
            Work::Stopped => return,
            Work::Seq(seq) => {
                tracing::trace!(
                    channel = seq.channel,
                    ackno = seq.ackno,
                    window = seq.window,
                    "sending SEQ"
                );
                if !write(&conn, &seq.encode()).await {
                    return;
                }
            }
            Work::Channel(number) => {
                let Some(channel) = conn.get_channel(number) else {
                    continue;
                };
                let Some((frame, requeue)) = channel.next_frame() else {
                    continue;
                };
                let payload_len = frame.payload.len();
                tracing::trace!(
                    channel = number,
                    kind = %frame.kind,
                    msgno = frame.msgno,
                    seqno = frame.seqno,
                    size = payload_len,
                    more = frame.more,
                    "sending frame"
                );
                if !write(&conn, &frame.encode()).await {
                    return;
                }
                conn.note_sent(payload_len as u64);
                if requeue {
                    conn.sequencer.mark_ready(number);
                }
            }
            Work::Idle => {
                let notified = conn.sequencer.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                // re-check: work may have raced in before we enabled
                {
                    let state = conn.sequencer.state.lock();
                    if state.stopped || !state.seqs.is_empty() || !state.ready.is_empty() {
                        continue;
                    }
                }
                notified.await;
            }
        }
    }
}

/// Write one frame, honoring the context write timeout. Returns `false`
/// when the connection is gone and the task should end.
async fn write(conn: &Arc<ConnectionInner>, bytes: &[u8]) -> bool {
    let opts = conn.ctx.options();
    let result = match opts.write_timeout {
        Some(limit) => match tokio::time::timeout(limit, conn.transport.write_all(bytes)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?limit, "write timed out");
                if opts.close_conn_on_write_timeout {
                    conn.disconnected();
                }
                return false;
            }
        },
        None => conn.transport.write_all(bytes).await,
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "transport write failed");
            conn.disconnected();
            false
        }
    }
}
