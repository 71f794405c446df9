//! End-to-end exchanges between two peers over an in-process transport
//! pair: echo, fragmentation, ANS series, refusals, close deferral and
//! sudden disconnects.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use waxwing_core::{
    Channel, ChannelStatus, CloseDecision, ConnOptions, Connection, Ctx, Error, FrameType,
    Message, ProfileBuilder, ReplyCode, Role, StartDecision, Transport,
};

const ECHO: &str = "urn:x-test:echo";
const SINK: &str = "urn:x-test:sink";
const TIMEOUT: Duration = Duration::from_secs(5);

fn echo_profile(ctx: &Ctx) {
    ctx.register_profile(
        ProfileBuilder::new(ECHO)
            .on_frame(|channel, message| {
                if message.kind == FrameType::Msg {
                    channel
                        .send_rpy(message.msgno, message.payload.clone())
                        .expect("echo reply");
                }
            })
            .build(),
    );
}

fn sink_profile(ctx: &Ctx) {
    ctx.register_profile(ProfileBuilder::new(SINK).build());
}

/// Two connected peers over an in-process stream pair.
async fn session(
    client_ctx: &Ctx,
    server_ctx: &Ctx,
) -> (Connection, Connection) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let (a, b) = Transport::pair();
    let (client, server) = tokio::join!(
        Connection::with_transport(client_ctx, a, Role::Initiator),
        Connection::with_transport(server_ctx, b, Role::Listener),
    );
    (client.expect("client greeting"), server.expect("server greeting"))
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("delivery within timeout")
        .expect("channel open")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn echo_over_one_channel() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    echo_profile(&server_ctx);

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    assert!(client.remote_profiles().iter().any(|uri| uri == ECHO));

    let channel = client.start_channel(ECHO).await.expect("start");
    assert_eq!(channel.number(), 1);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_handler = Arc::clone(&calls);
    channel.set_frame_received(move |_, message| {
        calls_in_handler.fetch_add(1, Ordering::SeqCst);
        tx.send(message.clone()).unwrap();
    });

    let msgno = channel.send_msg(Bytes::from_static(b"hello")).expect("send");
    let reply = recv(&mut rx).await;
    assert_eq!(reply.kind, FrameType::Rpy);
    assert_eq!(reply.msgno, msgno);
    assert_eq!(&reply.payload[..], b"hello");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(channel.outstanding_messages(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn send_and_wait_round_trip() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    echo_profile(&server_ctx);

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel(ECHO).await.unwrap();

    let reply = channel
        .send_msg_wait(Bytes::from_static(b"ping"), Some(TIMEOUT))
        .await
        .expect("reply");
    assert_eq!(reply.kind, FrameType::Rpy);
    assert_eq!(&reply.payload[..], b"ping");
    assert!(channel.is_ready());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fragmented_reply_is_reassembled() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    echo_profile(&server_ctx);

    let (client, server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel(ECHO).await.unwrap();

    // force the replier to slice into 8-octet frames
    server.channel(1).expect("server channel").set_max_frame_size(8);

    let payload = Bytes::from(vec![b'q'; 20]);
    let reply = channel
        .send_msg_wait(payload.clone(), Some(TIMEOUT))
        .await
        .expect("reply");
    assert_eq!(reply.payload, payload);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fragments_visible_with_complete_flag_off() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    echo_profile(&server_ctx);

    let (client, server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel(ECHO).await.unwrap();
    channel.set_complete_flag(false);
    channel.set_serialize(true);
    server.channel(1).unwrap().set_max_frame_size(8);

    let (tx, mut rx) = mpsc::unbounded_channel();
    channel.set_frame_received(move |_, message| {
        tx.send(message.clone()).unwrap();
    });
    channel.send_msg(Bytes::from(vec![b'f'; 20])).unwrap();

    let first = recv(&mut rx).await;
    let second = recv(&mut rx).await;
    let third = recv(&mut rx).await;
    assert!(first.more && second.more && !third.more);
    assert_eq!(first.payload.len() + second.payload.len() + third.payload.len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_message_flows_through_windows() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    echo_profile(&server_ctx);

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel(ECHO).await.unwrap();

    // several multiples of the 4096-octet window: the exchange only
    // completes if SEQ acknowledgements keep the window moving
    let payload: Bytes = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
    let reply = channel
        .send_msg_wait(payload.clone(), Some(TIMEOUT))
        .await
        .expect("reply");
    assert_eq!(reply.payload, payload);
    assert!(client.bytes_received() >= 64 * 1024);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ans_nul_sequence() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    server_ctx.register_profile(
        ProfileBuilder::new("urn:x-test:ans")
            .on_frame(|channel, message| {
                if message.kind == FrameType::Msg {
                    for i in 0..3u32 {
                        let body = format!("answer {}", i);
                        channel.send_ans(message.msgno, body).unwrap();
                    }
                    channel.finalize_ans(message.msgno).unwrap();
                }
            })
            .build(),
    );

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel("urn:x-test:ans").await.unwrap();
    channel.set_serialize(true);

    let (tx, mut rx) = mpsc::unbounded_channel();
    channel.set_frame_received(move |_, message| {
        tx.send(message.clone()).unwrap();
    });
    channel.send_msg(Bytes::from_static(b"query")).unwrap();

    for expected in 0..3u32 {
        let answer = recv(&mut rx).await;
        assert_eq!(answer.kind, FrameType::Ans);
        assert_eq!(answer.ansno, Some(expected));
        assert_eq!(answer.payload, Bytes::from(format!("answer {}", expected)));
    }
    let nul = recv(&mut rx).await;
    assert_eq!(nul.kind, FrameType::Nul);
    assert_eq!(nul.ansno, None);
    assert!(nul.payload.is_empty());

    tokio::time::timeout(TIMEOUT, async {
        while !channel.is_ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel returns to idle");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_refused_by_peer() {
    let client_ctx = Ctx::new();
    client_ctx.update_options(|o| o.enforce_profiles_supported = false);
    let server_ctx = Ctx::new();
    sink_profile(&server_ctx);

    let (client, server) = session(&client_ctx, &server_ctx).await;
    let err = client
        .start_channel("urn:x-test:none")
        .await
        .expect_err("start must fail");
    match err {
        Error::StartRefused { code, message } => {
            assert_eq!(code, ReplyCode(550));
            assert_eq!(message, "profile not supported");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(client.channels(), vec![0]);
    assert_eq!(server.channels(), vec![0]);
    assert!(matches!(
        client.pop_error(),
        Some(Error::StartRefused { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_refused_locally_when_peer_lacks_profile() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    sink_profile(&server_ctx);

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    let err = client.start_channel("urn:x-test:none").await.unwrap_err();
    assert!(matches!(err, Error::StartRefused { code, .. } if code == ReplyCode(550)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_decision_refusal_reaches_initiator() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    server_ctx.register_profile(
        ProfileBuilder::new("urn:x-test:picky")
            .on_start(|_, piggyback| {
                if piggyback == Some("let me in") {
                    StartDecision::Accept {
                        content: Some("welcome".to_string()),
                    }
                } else {
                    StartDecision::refuse(ReplyCode::TRANSACTION_FAILED, "say the magic words")
                }
            })
            .build(),
    );

    let (client, _server) = session(&client_ctx, &server_ctx).await;

    let err = client.start_channel("urn:x-test:picky").await.unwrap_err();
    assert!(matches!(
        err,
        Error::StartRefused { code, .. } if code == ReplyCode::TRANSACTION_FAILED
    ));

    let channel = client
        .start_channel_with(
            "urn:x-test:picky",
            waxwing_core::StartOptions {
                content: Some("let me in".to_string()),
                ..Default::default()
            },
        )
        .await
        .expect("accepted with piggyback");
    assert_eq!(channel.start_reply_content().as_deref(), Some("welcome"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_waits_for_outstanding_reply() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    let pending: Arc<Mutex<Option<(Channel, u32)>>> = Arc::new(Mutex::new(None));
    let pending_in_handler = Arc::clone(&pending);
    server_ctx.register_profile(
        ProfileBuilder::new(SINK)
            .on_frame(move |channel, message| {
                if message.kind == FrameType::Msg {
                    *pending_in_handler.lock() = Some((channel.clone(), message.msgno));
                }
            })
            .build(),
    );

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel(SINK).await.unwrap();
    channel.send_msg(Bytes::from_static(b"work")).unwrap();

    let closer = {
        let client = client.clone();
        tokio::spawn(async move { client.close_channel(1).await })
    };

    // the close is deferred while the reply is outstanding
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!closer.is_finished());
    assert_eq!(channel.status(), ChannelStatus::Open);

    // the listener finally answers; the close may now proceed
    let (server_channel, msgno) = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(found) = pending.lock().take() {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    server_channel.send_rpy(msgno, Bytes::from_static(b"done")).unwrap();

    tokio::time::timeout(TIMEOUT, closer)
        .await
        .expect("close completes")
        .expect("close task")
        .expect("close accepted");
    assert!(client.channel(1).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn close_refused_leaves_channel_open() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    echo_profile(&server_ctx);
    let server_refuses = ProfileBuilder::new("urn:x-test:sticky")
        .on_close(|_| CloseDecision::refuse(ReplyCode::ACTION_NOT_ALLOWED, "not now"))
        .build();
    server_ctx.register_profile(server_refuses);

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel("urn:x-test:sticky").await.unwrap();

    let err = client.close_channel(channel.number()).await.unwrap_err();
    match err {
        Error::CloseRefused { code, message } => {
            assert_eq!(code, ReplyCode::ACTION_NOT_ALLOWED);
            assert_eq!(message, "not now");
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(channel.status(), ChannelStatus::Open);
    assert!(client.channel(channel.number()).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clean_session_close_removes_channels() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    sink_profile(&server_ctx);

    let (client, server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel(SINK).await.unwrap();
    assert_eq!(channel.number(), 1);
    assert!(server.channel(1).is_some());

    tokio::time::timeout(TIMEOUT, client.close())
        .await
        .expect("close completes")
        .expect("close accepted");
    assert!(!client.is_connected());
    assert_eq!(channel.status(), ChannelStatus::Dead);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sudden_disconnect_unblocks_everything() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    sink_profile(&server_ctx);

    let (client, server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel(SINK).await.unwrap();

    let closes = Arc::new(AtomicUsize::new(0));
    let closes_in_hook = Arc::clone(&closes);
    client.add_on_close(move |_| {
        closes_in_hook.fetch_add(1, Ordering::SeqCst);
    });

    let waiter = {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel
                .send_msg_wait(Bytes::from_static(b"anyone there"), Some(TIMEOUT))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // peer drops mid-exchange
    server.shutdown();

    let result = tokio::time::timeout(TIMEOUT, waiter)
        .await
        .expect("wait unblocks")
        .expect("task");
    assert!(matches!(result, Err(Error::TransportClosed)));

    tokio::time::timeout(TIMEOUT, async {
        while closes.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("on-close fires");

    // a second teardown is a no-op; the hook fired exactly once
    client.shutdown();
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert_eq!(channel.status(), ChannelStatus::Dead);
    assert!(!client.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wait_timeout_discards_late_reply() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    let pending: Arc<Mutex<Option<(Channel, u32)>>> = Arc::new(Mutex::new(None));
    let pending_in_handler = Arc::clone(&pending);
    server_ctx.register_profile(
        ProfileBuilder::new(SINK)
            .on_frame(move |channel, message| {
                if message.kind == FrameType::Msg {
                    *pending_in_handler.lock() = Some((channel.clone(), message.msgno));
                }
            })
            .build(),
    );

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel(SINK).await.unwrap();

    let delivered = Arc::new(AtomicUsize::new(0));
    let delivered_in_handler = Arc::clone(&delivered);
    channel.set_frame_received(move |_, _| {
        delivered_in_handler.fetch_add(1, Ordering::SeqCst);
    });

    let err = channel
        .send_msg_wait(Bytes::from_static(b"slow"), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout));

    // the reply arrives after the wait gave up: it must vanish
    let (server_channel, msgno) = tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(found) = pending.lock().take() {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    server_channel.send_rpy(msgno, Bytes::from_static(b"too late")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(delivered.load(Ordering::SeqCst), 0);
    assert!(client.is_connected());
    assert_eq!(channel.outstanding_messages(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listener_starts_even_numbered_channels() {
    let client_ctx = Ctx::new();
    echo_profile(&client_ctx);
    let server_ctx = Ctx::new();
    echo_profile(&server_ctx);

    let (client, server) = session(&client_ctx, &server_ctx).await;

    let from_client = client.start_channel(ECHO).await.unwrap();
    assert_eq!(from_client.number(), 1);
    let from_server = server.start_channel(ECHO).await.unwrap();
    assert_eq!(from_server.number(), 2);
    let second_from_client = client.start_channel(ECHO).await.unwrap();
    assert_eq!(second_from_client.number(), 3);

    let reply = from_server
        .send_msg_wait(Bytes::from_static(b"reverse"), Some(TIMEOUT))
        .await
        .expect("echo from client side");
    assert_eq!(&reply.payload[..], b"reverse");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn serialized_channel_preserves_delivery_order() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    echo_profile(&server_ctx);

    let (client, server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel(ECHO).await.unwrap();
    channel.set_serialize(true);
    // the echo side must also reply in arrival order
    server.channel(1).unwrap().set_serialize(true);

    let order = Arc::new(Mutex::new(Vec::new()));
    let live = Arc::new(AtomicU32::new(0));
    let overlapped = Arc::new(AtomicUsize::new(0));
    let (order2, live2, overlapped2) =
        (Arc::clone(&order), Arc::clone(&live), Arc::clone(&overlapped));
    channel.set_frame_received(move |_, message| {
        if live2.fetch_add(1, Ordering::SeqCst) > 0 {
            overlapped2.fetch_add(1, Ordering::SeqCst);
        }
        std::thread::sleep(Duration::from_millis(5));
        order2.lock().push(message.msgno);
        live2.fetch_sub(1, Ordering::SeqCst);
    });

    let mut msgnos = Vec::new();
    for i in 0..8u32 {
        msgnos.push(channel.send_msg(Bytes::from(format!("m{}", i))).unwrap());
    }

    tokio::time::timeout(TIMEOUT, async {
        while order.lock().len() < 8 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("all replies delivered");

    assert_eq!(*order.lock(), msgnos);
    assert_eq!(overlapped.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn handler_panic_does_not_kill_connection() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    echo_profile(&server_ctx);

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel(ECHO).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_handler = Arc::clone(&calls);
    channel.set_frame_received(move |_, _| {
        calls_in_handler.fetch_add(1, Ordering::SeqCst);
        panic!("boom");
    });

    channel.send_msg(Bytes::from_static(b"one")).unwrap();
    tokio::time::timeout(TIMEOUT, async {
        while calls.load(Ordering::SeqCst) < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // the connection survived; a second exchange still works
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.is_connected());
    channel.send_msg(Bytes::from_static(b"two")).unwrap();
    tokio::time::timeout(TIMEOUT, async {
        while calls.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(matches!(client.pop_error(), Some(Error::Handler(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn greeting_carries_features_and_localize() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    sink_profile(&server_ctx);

    let (a, b) = Transport::pair();
    let client_opts = ConnOptions {
        features: Some("x-compress".to_string()),
        ..Default::default()
    };
    let server_opts = ConnOptions {
        localize: Some("en-US".to_string()),
        ..Default::default()
    };
    let (client, server) = tokio::join!(
        Connection::with_transport_opts(&client_ctx, a, Role::Initiator, client_opts),
        Connection::with_transport_opts(&server_ctx, b, Role::Listener, server_opts),
    );
    let (client, server) = (client.unwrap(), server.unwrap());

    let seen_by_server = server.remote_greeting().unwrap();
    assert_eq!(seen_by_server.features.as_deref(), Some("x-compress"));
    let seen_by_client = client.remote_greeting().unwrap();
    assert_eq!(seen_by_client.localize.as_deref(), Some("en-US"));
    assert_eq!(seen_by_client.profiles, vec![SINK.to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn channel_lifecycle_notifications_fire() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    echo_profile(&server_ctx);

    let added = Arc::new(AtomicUsize::new(0));
    let removed = Arc::new(AtomicUsize::new(0));
    let added_in_handler = Arc::clone(&added);
    let removed_in_handler = Arc::clone(&removed);
    client_ctx.set_channel_added(move |_| {
        added_in_handler.fetch_add(1, Ordering::SeqCst);
    });
    client_ctx.set_channel_removed(move |_| {
        removed_in_handler.fetch_add(1, Ordering::SeqCst);
    });

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel(ECHO).await.unwrap();
    assert_eq!(added.load(Ordering::SeqCst), 1);
    assert_eq!(removed.load(Ordering::SeqCst), 0);

    client.close_channel(channel.number()).await.unwrap();
    assert_eq!(removed.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_data_dictionary() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    sink_profile(&server_ctx);

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    client.set_data("token", "abc".to_string());
    assert_eq!(
        client.get_data::<String>("token").as_deref(),
        Some(&"abc".to_string())
    );
    assert!(client.get_data::<u32>("token").is_none());
    assert!(client.remove_data("token"));
    assert!(client.get_data::<String>("token").is_none());
}
