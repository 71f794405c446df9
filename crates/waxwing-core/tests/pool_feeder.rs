//! Channel pools and feeder-backed transfers over a live session pair.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use waxwing_core::{
    ChannelPool, Connection, Ctx, FileFeeder, FrameType, Message, ProfileBuilder, Role, Transport,
};

const ECHO: &str = "urn:x-test:echo";
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

async fn session(client_ctx: &Ctx, server_ctx: &Ctx) -> (Connection, Connection) {
    let (a, b) = Transport::pair();
    let (client, server) = tokio::join!(
        Connection::with_transport(client_ctx, a, Role::Initiator),
        Connection::with_transport(server_ctx, b, Role::Listener),
    );
    (client.unwrap(), server.unwrap())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_reuses_idle_channels() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    echo_profile(&server_ctx);

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    let pool = ChannelPool::create(&client, ECHO, 2).await.expect("pool");
    assert_eq!(pool.channel_count().await, 2);
    assert_eq!(pool.channel_available().await, 2);

    let first = pool.get_next_ready(false).await.unwrap().expect("idle");
    let second = pool.get_next_ready(false).await.unwrap().expect("idle");
    assert_ne!(first.number(), second.number());
    // pool exhausted without auto_inc
    assert!(pool.get_next_ready(false).await.unwrap().is_none());
    assert_eq!(pool.channel_available().await, 0);

    pool.release(&first).await;
    // release is idempotent
    pool.release(&first).await;
    assert_eq!(pool.channel_available().await, 1);

    let again = pool.get_next_ready(false).await.unwrap().expect("reused");
    assert_eq!(again.number(), first.number());

    // auto_inc grows the pool under pressure
    let grown = pool.get_next_ready(true).await.unwrap().expect("grown");
    assert_eq!(pool.channel_count().await, 3);
    assert!(grown.is_open());

    // the pool is registered on its connection
    assert!(ChannelPool::find(&client, pool.id()).is_some());
    pool.close().await.expect("pool close");
    assert!(ChannelPool::find(&client, pool.id()).is_none());
    assert_eq!(client.channels(), vec![0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn file_feeder_streams_a_message(){
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    echo_profile(&server_ctx);

    // ~40 KiB: the transfer spans many frames and several windows
    let content: Vec<u8> = (0..40 * 1024u32).map(|i| (i % 223) as u8).collect();
    let mut path = std::env::temp_dir();
    path.push(format!("waxwing-feeder-e2e-{}", std::process::id()));
    std::fs::File::create(&path)
        .unwrap()
        .write_all(&content)
        .unwrap();

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel(ECHO).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    channel.set_frame_received(move |_, message| {
        tx.send(message.clone()).unwrap();
    });

    let finished = Arc::new(AtomicUsize::new(0));
    let feeder = FileFeeder::open(&path, true).expect("open feeder");
    let (msgno, handle) = channel.send_msg_from_feeder(Box::new(feeder)).expect("send");
    let finished_in_callback = Arc::clone(&finished);
    handle.set_on_finished(move |status| {
        assert!(status.is_finished);
        finished_in_callback.fetch_add(1, Ordering::SeqCst);
    });

    let reply = tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("echo within timeout")
        .expect("delivery");
    assert_eq!(reply.kind, FrameType::Rpy);
    assert_eq!(reply.msgno, msgno);
    assert_eq!(&reply.payload[..], &content[..]);

    let status = handle.status();
    // content plus the two-octet MIME separator
    assert_eq!(status.bytes_transferred, content.len() as u64 + 2);
    assert!(status.is_finished);
    assert_eq!(status.msgno, Some(msgno));
    assert_eq!(finished.load(Ordering::SeqCst), 1);

    std::fs::remove_file(&path).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn paused_feeder_holds_the_transfer() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    let sink_count = Arc::new(AtomicUsize::new(0));
    let sink_count_in_handler = Arc::clone(&sink_count);
    server_ctx.register_profile(
        ProfileBuilder::new("urn:x-test:upload")
            .on_frame(move |channel, message| {
                if message.kind == FrameType::Msg {
                    sink_count_in_handler.fetch_add(1, Ordering::SeqCst);
                    channel.send_rpy(message.msgno, Bytes::from_static(b"got it")).unwrap();
                }
            })
            .build(),
    );

    let content = vec![b'u'; 256 * 1024];
    let mut path = std::env::temp_dir();
    path.push(format!("waxwing-feeder-pause-{}", std::process::id()));
    std::fs::File::create(&path).unwrap().write_all(&content).unwrap();

    let (client, _server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel("urn:x-test:upload").await.unwrap();

    let feeder = FileFeeder::open(&path, true).unwrap();
    let (_msgno, handle) = channel.send_msg_from_feeder(Box::new(feeder)).unwrap();
    handle.pause();

    tokio::time::sleep(Duration::from_millis(200)).await;
    // nothing complete arrived while paused
    assert_eq!(sink_count.load(Ordering::SeqCst), 0);
    let paused_at = handle.status().bytes_transferred;
    assert!(paused_at < content.len() as u64);

    handle.resume();
    tokio::time::timeout(TIMEOUT, async {
        while sink_count.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("transfer completes after resume");
    assert!(handle.status().is_finished);

    std::fs::remove_file(&path).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replace_transport_keeps_the_session() {
    let client_ctx = Ctx::new();
    let server_ctx = Ctx::new();
    echo_profile(&server_ctx);

    let (client, server) = session(&client_ctx, &server_ctx).await;
    let channel = client.start_channel(ECHO).await.unwrap();
    let before = channel
        .send_msg_wait(Bytes::from_static(b"before"), Some(TIMEOUT))
        .await
        .unwrap();
    assert_eq!(&before.payload[..], b"before");

    // swap both ends onto a fresh stream pair at a quiescent point
    let (x, y) = tokio::io::duplex(65536);
    let swap_server = {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .replace_transport(y, waxwing_core::TransportKind::External)
                .await
        })
    };
    client
        .replace_transport(x, waxwing_core::TransportKind::External)
        .await
        .expect("client swap");
    swap_server.await.unwrap().expect("server swap");

    let after = channel
        .send_msg_wait(Bytes::from_static(b"after"), Some(TIMEOUT))
        .await
        .expect("echo over the new transport");
    assert_eq!(&after.payload[..], b"after");
}
