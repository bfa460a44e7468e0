use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use clap::Parser;
use seine::framing::length_prefix_framer;
use seine::{
    ConnectorConfig, ErrorReporter, IoStateChange, Net, WaitQueue, DEFAULT_HOST, DEFAULT_PORT,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "echo-client", version)]
/// Sends framed messages to the echo server and prints the echoes.
struct EchoClient {
    /// Message body to send.
    #[arg(default_value = "hello")]
    message: String,
    /// How many copies to send.
    #[arg(long, default_value_t = 5)]
    count: usize,
    #[arg(long, default_value = DEFAULT_HOST)]
    host: std::net::IpAddr,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Reconnect backoff in milliseconds; omit to disable reconnect.
    #[arg(long)]
    reconnect_ms: Option<u64>,
}

fn frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 2);
    buf.put_u16(body.len() as u16);
    buf.put_slice(body);
    buf.freeze()
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = EchoClient::parse();
    let net = Net::new();
    let connector = net.make_tcp_connector(ConnectorConfig {
        remote_endpoints: vec![format!("{}:{}", args.host, args.port)],
        reconnect_backoff: args.reconnect_ms.map(Duration::from_millis),
    });

    let echoes = WaitQueue::new();
    let message = frame(args.message.as_bytes());
    let count = args.count;

    let collected = echoes.clone();
    let io_state: IoStateChange = Arc::new(move |io, _total, opened| {
        if !opened {
            return;
        }
        let collected = collected.clone();
        let armed = io.start_io_framed(
            2,
            length_prefix_framer(2),
            Box::new(move |echoed, _output, _peer| collected.try_push(echoed).is_ok()),
        );
        if armed.is_ok() {
            for _ in 0..count {
                let _ = io.send(message.clone());
            }
        }
    });
    let error_reporter: ErrorReporter = Arc::new(|_io, cause: &seine::Error| {
        warn!(%cause, "network event");
    });

    // An unblocked queue is how the terminal shutdown reaches the loop below.
    let closer = echoes.clone();
    connector
        .start(
            io_state,
            error_reporter,
            Box::new(move |_io, cause, _remaining| {
                info!(%cause, "connector stopped");
                closer.close();
            }),
        )
        .await
        .context("failed to start connector")?;

    for _ in 0..count {
        let echoed = echoes
            .wait_and_pop()
            .await
            .context("connection closed before all echoes arrived")?;
        println!("{}", String::from_utf8_lossy(&echoed[2..]));
    }

    let _ = connector.stop();
    while echoes.wait_and_pop().await.is_some() {}

    Ok(())
}
