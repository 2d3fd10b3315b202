//! Subscribe to a live channel and print what arrives
//!
//! Run with: cargo run --example watch_channel HOST[:PORT] CHANNEL_ID [PROFILE]
//!
//! Credentials come from `HTSP_USER` and `HTSP_PASSWORD`.
//!
//! Examples:
//!   cargo run --example watch_channel tvh.local 1234
//!   cargo run --example watch_channel 192.168.1.10:9982 1234 pass
//!
//! Kill the TVHeadend connection (or restart the server) while it runs: the
//! client reconnects and the subscription resumes with the same id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use htsp_rs::protocol::DEFAULT_PORT;
use htsp_rs::{
    ClientConfig, ConnectionDetails, ConnectionListener, ConnectionState, HtspClient,
    HtspMessage, SubscriptionListener,
};

/// Counts packets per stream kind and logs lifecycle notifications
struct Watcher {
    packets: AtomicU64,
    bytes: AtomicU64,
    keyframes: AtomicU64,
}

impl Watcher {
    fn new() -> Self {
        Self {
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            keyframes: AtomicU64::new(0),
        }
    }

    fn print_stats(&self) {
        println!(
            "Stats: packets={} keyframes={} bytes={}",
            self.packets.load(Ordering::Relaxed),
            self.keyframes.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        );
    }
}

impl SubscriptionListener for Watcher {
    fn on_subscription_start(&self, message: &HtspMessage) {
        let streams = message.get_list("streams").map(|s| s.len()).unwrap_or(0);
        println!("Subscription started with {} streams", streams);
    }

    fn on_subscription_status(&self, message: &HtspMessage) {
        println!(
            "Subscription status: {}",
            message.get_str_or("status", "ok")
        );
    }

    fn on_subscription_stop(&self, message: &HtspMessage) {
        println!("Subscription stopped: {}", message.get_str_or("status", "-"));
    }

    fn on_muxpkt(&self, message: &HtspMessage) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        if let Some(payload) = message.get_bin("payload") {
            self.bytes.fetch_add(payload.len() as u64, Ordering::Relaxed);
        }
        if message.get_str("frametype") == Some("I") {
            self.keyframes.fetch_add(1, Ordering::Relaxed);
        }
    }
}

struct StatePrinter;

impl ConnectionListener for StatePrinter {
    fn on_connection_state_change(&self, state: ConnectionState) {
        println!("Connection: {}", state);
    }
}

fn print_usage() {
    eprintln!("Usage: watch_channel HOST[:PORT] CHANNEL_ID [PROFILE]");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  HTSP_USER       username (default: empty)");
    eprintln!("  HTSP_PASSWORD   password (default: empty)");
}

fn parse_host(arg: &str) -> Result<(String, u16), String> {
    match arg.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse()
                .map_err(|_| format!("Invalid port: {}", port))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((arg.to_string(), DEFAULT_PORT)),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }

    let (host, port) = match parse_host(&args[1]) {
        Ok(hp) => hp,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_usage();
            std::process::exit(1);
        }
    };
    let channel_id: i64 = args[2].parse()?;
    let profile = args.get(3).cloned();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("htsp_rs=info".parse()?)
                .add_directive("watch_channel=debug".parse()?),
        )
        .init();

    let details = ConnectionDetails::new(
        host,
        port,
        std::env::var("HTSP_USER").unwrap_or_default(),
        std::env::var("HTSP_PASSWORD").unwrap_or_default(),
        "watch_channel",
        env!("CARGO_PKG_VERSION"),
    );
    let client = HtspClient::new(ClientConfig::new(details));

    let states: Arc<dyn ConnectionListener> = Arc::new(StatePrinter);
    client.add_connection_listener(&states);

    client.start()?;
    while !client.is_ready() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if let Some(info) = client.server_info() {
        println!(
            "Connected to {} {} (HTSP v{})",
            info.server_name, info.server_version, info.htsp_version
        );
    }

    let watcher = Arc::new(Watcher::new());
    let listener: Arc<dyn SubscriptionListener> = watcher.clone();
    let subscriber = client.subscriber();
    subscriber.add_subscription_listener(&listener);
    subscriber
        .subscribe(channel_id, profile.as_deref(), 0)
        .await?;
    println!(
        "Subscribed to channel {} as subscription {}",
        channel_id,
        subscriber.subscription_id().unwrap_or(0)
    );

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = ticker.tick() => watcher.print_stats(),
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    subscriber.unsubscribe();
    client.stop().await;
    watcher.print_stats();
    Ok(())
}
