//! Counterpart to `echo_server`: opens one channel and round-trips a
//! message.
//!
//! Run with:
//! ```sh
//! cargo run --example echo_client -- "some text"
//! ```

use std::time::Duration;

use waxwing::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let text = std::env::args().nth(1).unwrap_or_else(|| "hello".to_string());

    let ctx = Ctx::new();
    let conn = waxwing::client::connect(&ctx, "localhost:10288").await?;
    tracing::info!(profiles = ?conn.remote_profiles(), "connected");

    let channel = conn.start_channel("urn:x-demo:echo").await?;
    let reply = channel
        .send_msg_wait(text.into_bytes(), Some(Duration::from_secs(10)))
        .await?;
    println!("{}", String::from_utf8_lossy(&reply.payload));

    conn.close().await
}
