use std::fs;

use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use traffic_analyzer::config::Cli;
use traffic_analyzer::resolver::{DnsResolver, ResolverCache};
use traffic_analyzer::session::{self, Shutdown};
use traffic_analyzer::sniff::{PacketSource, PcapSource};

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout is reserved for the report
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let sink = cli.open_sink().await?;
    let source: Box<dyn PacketSource> = match &cli.read {
        Some(path) => Box::new(PcapSource::file(path, cli.filter())?),
        None => Box::new(PcapSource::live(&cli.capture_settings())?),
    };

    let shutdown = Shutdown::new();
    let handler_shutdown = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Interrupt received, generating report...");
        handler_shutdown.trigger();
    })
    .map_err(traffic_analyzer::Error::from)?;

    let settings = cli.session_settings();
    let resolver = ResolverCache::new(DnsResolver::new(cli.resolve_timeout()));
    info!("Capturing packets... press Ctrl+C to stop");

    let outcome =
        tokio::task::spawn_blocking(move || session::run(source, sink, &resolver, &settings, shutdown)).await?;

    let json = outcome.report.to_json()?;
    println!("{}", json);
    if let Some(path) = &cli.output {
        if let Err(e) = fs::write(path, &json) {
            warn!("Could not write report to {}: {}", path.display(), e);
        }
    }

    info!(
        "Stored {} packet records ({} failed, {} dropped)",
        outcome.sink.written, outcome.sink.failed, outcome.sink.dropped
    );

    match outcome.capture_error {
        Some(e) => {
            error!("Packet capture error: {}", e);
            Err(traffic_analyzer::Error::from(e).into())
        }
        None => Ok(()),
    }
}
