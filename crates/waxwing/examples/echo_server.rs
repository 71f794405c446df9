//! A BEEP echo server: accepts connections on port 10288 and answers
//! every MSG on `urn:x-demo:echo` with an identical RPY.
//!
//! Run with:
//! ```sh
//! cargo run --example echo_server
//! ```

use waxwing::prelude::*;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let ctx = Ctx::new();
    ctx.register_profile(
        ProfileBuilder::new("urn:x-demo:echo")
            .on_frame(|channel, message| {
                if message.kind == FrameType::Msg {
                    tracing::info!(
                        channel = channel.number(),
                        msgno = message.msgno,
                        bytes = message.payload.len(),
                        "echoing"
                    );
                    if let Err(e) = channel.send_rpy(message.msgno, message.payload.clone()) {
                        tracing::warn!(error = %e, "echo reply failed");
                    }
                }
            })
            .build(),
    );

    let listener = waxwing::server::listen(&ctx, "0.0.0.0:10288").await?;
    tracing::info!(addr = %listener.local_addr(), "echo server up");

    // serve until interrupted
    tokio::signal::ctrl_c().await.map_err(Error::Io)?;
    listener.close();
    Ok(())
}
