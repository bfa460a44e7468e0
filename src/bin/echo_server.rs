use anyhow::Context;
use clap::Parser;
use seine::framing::length_prefix_framer;
use seine::{AcceptorConfig, ErrorReporter, IoStateChange, Net, DEFAULT_HOST, DEFAULT_PORT};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "echo-server", version)]
/// Echo server for length-prefix framed messages.
struct EchoServer {
    #[arg(long, default_value = DEFAULT_HOST)]
    host: std::net::IpAddr,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    /// Cap on concurrently served connections.
    #[arg(long)]
    max_connections: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = EchoServer::parse();
    let addr = SocketAddr::new(args.host, args.port);

    let net = Net::new();
    let mut config = AcceptorConfig::new(addr);
    config.reuse_address = true;
    config.max_connections = args.max_connections;
    let acceptor = net.make_tcp_acceptor(config);

    let io_state: IoStateChange = Arc::new(|io, total, opened| {
        if opened {
            info!(total, "connection opened");
            let armed = io.start_io_framed(
                2,
                length_prefix_framer(2),
                Box::new(|message, output, _peer| {
                    let _ = output.send(message);
                    true
                }),
            );
            if let Err(err) = armed {
                error!(cause = %err, "failed to arm connection");
            }
        } else {
            info!(total, "connection closed");
        }
    });
    let error_reporter: ErrorReporter = Arc::new(|_io, cause: &seine::Error| {
        warn!(%cause, "network event");
    });

    let (down_tx, mut down_rx) = tokio::sync::mpsc::unbounded_channel();
    acceptor
        .start(
            io_state,
            error_reporter,
            Box::new(move |_io, cause, _remaining| {
                let _ = down_tx.send(cause);
            }),
        )
        .await
        .context("failed to start acceptor")?;
    info!(%addr, "echo server listening");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    acceptor.stop()?;
    if let Some(cause) = down_rx.recv().await {
        info!(%cause, "server stopped");
    }

    Ok(())
}
