//! Inbound demultiplexer: one task per connection reads raw bytes,
//! decodes frames, routes SEQ acknowledgements to flow control, channel
//! 0 to the management layer, and data frames through reassembly to
//! handler dispatch on the worker pool.
//!
//! The reader never blocks in user code: handlers run on workers (or a
//! per-channel serial consumer when the serialize flag is set). Partial
//! frames survive read cycles in the connection's reassembly buffer. A
//! zero-byte read is a half-closed transport and tears the connection
//! down.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use bytes::BytesMut;

use crate::chan0;
use crate::channel::{Channel, Delivery, Message};
use crate::connection::ConnectionInner;
use crate::error::{Error, ReplyCode};
use crate::frame::{self, Decoded};

const READ_CHUNK: usize = 8 * 1024;

/// The per-connection reader task.
pub(crate) async fn run(conn: Arc<ConnectionInner>) {
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut pause = conn.reader_ctl.pause_rx();

    loop {
        if *pause.borrow() {
            // transport swap handshake: drop buffered bytes from the
            // old stream, signal quiescence, park until resumed
            buf.clear();
            conn.reader_ctl.set_ack(true);
            if pause.wait_for(|paused| !paused).await.is_err() {
                return;
            }
            conn.reader_ctl.set_ack(false);
            continue;
        }

        tokio::select! {
            changed = pause.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            read = conn.transport.read_buf(&mut buf) => match read {
                Ok(0) => {
                    tracing::debug!("peer half-closed the transport");
                    conn.disconnected();
                    return;
                }
                Ok(_) => {
                    if let Err(e) = drain(&conn, &mut buf) {
                        fatal(&conn, e);
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "transport read failed");
                    conn.disconnected();
                    return;
                }
            }
        }
    }
}

/// Decode and route every complete frame currently buffered.
fn drain(conn: &Arc<ConnectionInner>, buf: &mut BytesMut) -> crate::error::Result<()> {
    while let Some(decoded) = frame::decode(buf).map_err(Error::Frame)? {
        handle_frame(conn, decoded)?;
    }
    Ok(())
}

fn handle_frame(conn: &Arc<ConnectionInner>, decoded: Decoded) -> crate::error::Result<()> {
    match decoded {
        Decoded::Seq(seq) => {
            let Some(channel) = conn.get_channel(seq.channel) else {
                // the channel may have been closed a moment ago
                tracing::trace!(channel = seq.channel, "SEQ for unknown channel ignored");
                return Ok(());
            };
            if channel.apply_seq(seq.ackno, seq.window) {
                conn.sequencer.mark_ready(seq.channel);
            }
            Ok(())
        }
        Decoded::Data(frame) => {
            let Some(channel) = conn.get_channel(frame.channel) else {
                return Err(Error::Protocol(format!(
                    "data frame for unknown channel {}",
                    frame.channel
                )));
            };
            let payload_len = frame.payload.len() as u64;
            let outcome = channel.receive(frame)?;
            conn.note_received(payload_len);

            if let Some(seq) = outcome.seq {
                conn.sequencer.push_seq(seq);
            }
            for delivery in outcome.deliveries {
                match delivery {
                    Delivery::Waiter(tx, message) => {
                        let _ = tx.send(message);
                    }
                    Delivery::Handler(message) => {
                        if channel.is_management() {
                            chan0::handle_message(conn, message)?;
                        } else {
                            dispatch(conn, &channel, message);
                        }
                    }
                }
            }
            Ok(())
        }
    }
}

/// Hand one message to the channel's handler chain on a worker, or on
/// the channel's serial consumer when the serialize flag is set.
pub(crate) fn dispatch(conn: &Arc<ConnectionInner>, channel: &Channel, message: Message) {
    let workers = conn.ctx.workers().clone();
    if channel.serialize() {
        if channel.push_serial(message) {
            let conn = Arc::clone(conn);
            let channel = channel.clone();
            workers.spawn(move || {
                loop {
                    while let Some(message) = channel.pop_serial() {
                        invoke(&conn, &channel, &message);
                    }
                    if !channel.serial_idle() {
                        return;
                    }
                }
            });
        }
    } else {
        let conn = Arc::clone(conn);
        let channel = channel.clone();
        workers.spawn(move || {
            invoke(&conn, &channel, &message);
        });
    }
}

/// Resolve the handler chain and invoke it, catching panics so a
/// failing handler cannot take the connection down.
fn invoke(conn: &Arc<ConnectionInner>, channel: &Channel, message: &Message) {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if let Some(handler) = channel.frame_handler() {
            handler(channel, message);
        } else if let Some(profile) = channel.profile() {
            profile.on_frame(channel, message);
        } else if let Some(handler) = conn.ctx.frame_fallback() {
            handler(channel, message);
        } else {
            tracing::warn!(
                channel = channel.number(),
                msgno = message.msgno,
                "message dropped: no handler installed"
            );
        }
    }));
    if let Err(panic) = result {
        let text = panic_text(&panic);
        tracing::error!(
            channel = channel.number(),
            msgno = message.msgno,
            panic = %text,
            "frame handler panicked; connection continues"
        );
        conn.push_error(Error::Handler(text));
    }
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A framing or protocol violation: push the error, tell the peer with
/// a best-effort `<error code="500">`, then drop the transport.
fn fatal(conn: &Arc<ConnectionInner>, error: Error) {
    tracing::warn!(error = %error, "protocol error; shutting connection down");
    let text = error.to_string();
    conn.push_error(error);
    let _ = conn.channel0().send_management(
        crate::frame::FrameType::Err,
        crate::channel::MsgnoMode2::Alloc,
        chan0::error_xml(ReplyCode::SYNTAX_ERROR, &text),
        chan0::management_mime(),
    );
    conn.shutdown_when_flushed();
}
