use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::db::{MongoSink, NullSink, PacketSink, SinkError, SqliteSink};
use crate::pipeline::SinkQueueConfig;
use crate::session::SessionSettings;
use crate::sniff::CaptureSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkBackend {
    Sqlite,
    Mongo,
    None,
}

/// Capture packets, aggregate traffic statistics and print a report on Ctrl+C.
#[derive(Debug, Parser)]
#[command(name = "traffic-analyzer", version, about)]
pub struct Cli {
    /// Network interface to capture on (default device if omitted)
    #[arg(short, long, env = "TRAFFIC_INTERFACE")]
    pub interface: Option<String>,

    /// Read packets from a pcap file instead of a live interface
    #[arg(short, long, value_name = "FILE", conflicts_with = "interface")]
    pub read: Option<PathBuf>,

    /// BPF filter; empty string disables filtering
    #[arg(short, long, default_value = "ip or ip6")]
    pub filter: String,

    #[arg(long, default_value_t = 65535)]
    pub snaplen: i32,

    /// Leave the interface out of promiscuous mode
    #[arg(long)]
    pub no_promisc: bool,

    /// Where per-packet records are stored
    #[arg(long, value_enum, default_value_t = SinkBackend::Sqlite, env = "TRAFFIC_SINK")]
    pub sink: SinkBackend,

    #[arg(long, default_value = "traffic_analyzer.db", env = "TRAFFIC_DB_PATH")]
    pub db_path: PathBuf,

    #[arg(long, default_value = "mongodb://localhost:27017", env = "MONGODB_URI")]
    pub mongo_uri: String,

    #[arg(long, default_value = "network_monitor", env = "MONGODB_DATABASE")]
    pub mongo_db: String,

    /// Records waiting for storage beyond this many are dropped
    #[arg(long, default_value_t = 10_000)]
    pub queue_capacity: usize,

    #[arg(long, default_value_t = 256)]
    pub batch_size: usize,

    /// Reverse DNS timeout per address, in milliseconds
    #[arg(long, default_value_t = 2000)]
    pub resolve_timeout_ms: u64,

    /// Log running totals every N seconds (0 = off)
    #[arg(long, default_value_t = 0)]
    pub stats_interval: u64,

    /// Also write the final JSON report to this file
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn filter(&self) -> Option<&str> {
        let filter = self.filter.trim();
        (!filter.is_empty()).then_some(filter)
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            interface: self.interface.clone(),
            filter: self.filter().map(str::to_string),
            snaplen: self.snaplen,
            promisc: !self.no_promisc,
            ..CaptureSettings::default()
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            sink_queue: SinkQueueConfig {
                capacity: self.queue_capacity,
                batch_size: self.batch_size,
            },
            stats_interval: (self.stats_interval > 0).then(|| Duration::from_secs(self.stats_interval)),
            ..SessionSettings::default()
        }
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub async fn open_sink(&self) -> Result<Box<dyn PacketSink>, SinkError> {
        Ok(match self.sink {
            SinkBackend::Sqlite => Box::new(SqliteSink::open(&self.db_path)?),
            SinkBackend::Mongo => {
                Box::new(MongoSink::connect(&self.mongo_uri, &self.mongo_db, Duration::from_secs(5)).await?)
            }
            SinkBackend::None => Box::new(NullSink),
        })
    }
}
