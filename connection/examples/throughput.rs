//! Push bytes between loopback peers under a shared upload limit.
//!
//! Starts a listening pool and a rate limited client loop, connects a number
//! of peers and reports how many bytes the listener received per second.

use bytes::Bytes;
use clap::Parser;
use log::LevelFilter;
use std::time::{Duration, Instant};
use swarmwire_connection::{
    serve, ChannelHandler, ConnectionEvent, EncryptionPolicy, Multiplexer,
    MultiplexerConfiguration, MultiplexerPool, ProtocolEndpoint, RateController, TcpAcceptor,
    DEFAULT_PLAINTEXT_HEADER,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of connections to open.
    #[arg(short, long, default_value = "4")]
    connections: usize,

    /// Aggregate upload limit in bytes per second, 0 for unlimited.
    #[arg(short, long, default_value = "65536")]
    upload_limit: u64,

    /// Bytes each connection sends.
    #[arg(short, long, default_value = "1048576")]
    bytes: usize,

    /// Framing policy of the dialing side.
    #[arg(short, long, default_value = "preferred")]
    policy: String,

    /// Seconds to run for.
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Log level.
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] {} - {}",
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log_level)
        .chain(std::io::stderr())
        .apply()?;

    let policy = match args.policy.to_lowercase().as_str() {
        "plain" => EncryptionPolicy::PlainOnly,
        "required" => EncryptionPolicy::EncryptedRequired,
        "preferred" => EncryptionPolicy::EncryptedPreferred,
        other => return Err(format!("Unknown policy: {other}").into()),
    };

    let config = swarmwire_connection::Configuration::default()
        .with_upload_rate_limit(args.upload_limit)
        .with_encryption_policy(policy);
    log::info!("Running with {config}");

    // Listening side: two loops, no limits.
    let server = MultiplexerPool::spawn(
        2,
        MultiplexerConfiguration::default(),
        RateController::unlimited().shared(),
    );
    let acceptor = TcpAcceptor::bind("127.0.0.1:0".parse()?).await?;
    let addr = acceptor.local_addr()?;
    let (server_handler, mut received) = ChannelHandler::new();
    let server_connection = swarmwire_connection::ConnectionConfiguration::default();

    let listener = tokio::spawn(async move {
        let result = serve(acceptor, &server, server_connection, move |endpoint| {
            log::debug!("Inbound peer {endpoint}");
            server_handler.clone()
        })
        .await;
        if let Err(e) = result {
            log::error!("Serving stopped: {e}");
        }
        server
    });

    // Dialing side: one loop under the configured limit.
    let (client, handle) = Multiplexer::new(
        MultiplexerConfiguration::default(),
        RateController::new(&config.rate()).shared(),
    );
    let client_task = tokio::spawn(client.run());
    let mut payload = DEFAULT_PLAINTEXT_HEADER.to_vec();
    payload.resize(args.bytes, 0xab);
    let payload = Bytes::from(payload);

    let (client_handler, mut client_events) = ChannelHandler::new();
    for _ in 0..args.connections {
        handle
            .connect(
                ProtocolEndpoint::from(addr),
                config.connection(),
                client_handler.clone(),
            )
            .await?;
    }

    let sender = tokio::spawn(async move {
        while let Some(event) = client_events.recv().await {
            match event {
                ConnectionEvent::Established(connection) => {
                    log::info!("{} up, {} framing", connection.id(), connection.framing());
                    if let Err(e) = connection.send(payload.clone()) {
                        log::warn!("{}: {e}", connection.id());
                    }
                }
                ConnectionEvent::Closed { id, reason } => log::info!("{id} closed: {reason}"),
                ConnectionEvent::Data { .. } => {}
            }
        }
    });

    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.duration);
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut total = 0usize;
    let mut window = 0usize;

    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupted");
                break;
            }
            _ = ticker.tick() => {
                log::info!("{window} B/s ({total} B total)");
                window = 0;
            }
            event = received.recv() => match event {
                Some(ConnectionEvent::Data { data, .. }) => {
                    total += data.len();
                    window += data.len();
                }
                Some(_) => {}
                None => break,
            },
        }
    }

    let elapsed = started.elapsed().as_secs_f64();
    log::info!(
        "Received {total} bytes in {elapsed:.1}s, {:.0} B/s average",
        total as f64 / elapsed
    );

    handle.shutdown();
    if let Err(e) = client_task.await {
        log::error!("Client loop failed: {e}");
    }
    sender.abort();
    listener.abort();

    Ok(())
}
