//! Download a file from the server (e.g. a channel icon)
//!
//! Run with: cargo run --example fetch_file HOST FILE [OUTPUT]
//!
//! Credentials come from `HTSP_USER` and `HTSP_PASSWORD`.
//!
//! Examples:
//!   cargo run --example fetch_file tvh.local imagecache/42 icon.png

use std::time::Duration;

use htsp_rs::{ClientConfig, HtspClient};

fn print_usage() {
    eprintln!("Usage: fetch_file HOST FILE [OUTPUT]");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 || args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return Ok(());
    }
    let output = args
        .get(3)
        .cloned()
        .unwrap_or_else(|| args[2].rsplit('/').next().unwrap_or("download").to_string());

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("htsp_rs=info".parse()?),
        )
        .init();

    let config = ClientConfig::with_host(
        &args[1],
        &std::env::var("HTSP_USER").unwrap_or_default(),
        &std::env::var("HTSP_PASSWORD").unwrap_or_default(),
    );
    let client = HtspClient::new(config);
    client.start()?;

    let ready = tokio::time::timeout(Duration::from_secs(10), async {
        while !client.is_ready() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if ready.is_err() {
        eprintln!("Error: could not connect to {}", args[1]);
        client.stop().await;
        std::process::exit(1);
    }

    let mut file = client.open_file(&args[2]).await?;
    let data = file.read_to_end().await?;
    file.close();

    tokio::fs::write(&output, &data).await?;
    println!("Wrote {} bytes to {}", data.len(), output);

    client.stop().await;
    Ok(())
}
