use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use tracing::{debug, info};

use crate::db::PacketSink;
use crate::models::domain::PacketObservation;
use crate::pipeline::{IngestPipeline, SinkHandle, SinkQueueConfig, SinkStats};
use crate::report::{self, Report};
use crate::resolver::{ResolverCache, ReverseLookup};
use crate::sniff::{self, CaptureError, PacketSource};
use crate::stats::NetworkStats;

/// Cooperative cancellation flag shared by the signal handler and the capture loop.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub sink_queue: SinkQueueConfig,
    pub stats_interval: Option<Duration>,
    pub poll_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            sink_queue: SinkQueueConfig::default(),
            stats_interval: None,
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub report: Report,
    pub captured: u64,
    pub sink: SinkStats,
    /// Set when capture ended on an error rather than on shutdown or exhaustion.
    pub capture_error: Option<CaptureError>,
}

/// Run one capture session to completion and build its final report.
///
/// Capture runs on its own thread and feeds the ingest loop here; persistence
/// runs on the sink writer thread. The session ends when `shutdown` fires,
/// the source is exhausted, or capture fails. In every case the sink is
/// drained and closed before the single report is generated.
pub fn run<S, K, L>(
    source: S,
    sink: K,
    resolver: &ResolverCache<L>,
    settings: &SessionSettings,
    shutdown: Shutdown,
) -> SessionOutcome
where
    S: PacketSource + 'static,
    K: PacketSink + 'static,
    L: ReverseLookup,
{
    let stats = Arc::new(NetworkStats::new());
    let pipeline = IngestPipeline::new(Arc::clone(&stats), SinkHandle::spawn(sink, settings.sink_queue));
    let (tx, rx) = unbounded();

    let capture_shutdown = shutdown.clone();
    let capture_thread = thread::spawn(move || {
        let result = sniff::start_sniffing(source, tx, &capture_shutdown);
        capture_shutdown.trigger();
        result
    });

    process_events(&rx, &pipeline, settings);

    let capture_result = capture_thread
        .join()
        .unwrap_or(Err(CaptureError::Panicked));
    let sink_stats = pipeline.shutdown();

    let report = report::generate(&stats.snapshot(), resolver);
    let (captured, capture_error) = match capture_result {
        Ok(captured) => (captured, None),
        Err(e) => (report.total_packets, Some(e)),
    };

    SessionOutcome {
        report,
        captured,
        sink: sink_stats,
        capture_error,
    }
}

// Runs until the capture side hangs up, so anything already queued is still ingested.
fn process_events(rx: &Receiver<PacketObservation>, pipeline: &IngestPipeline, settings: &SessionSettings) {
    let mut last_log = Instant::now();
    loop {
        match rx.recv_timeout(settings.poll_interval) {
            Ok(obs) => pipeline.ingest(obs),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if let Some(interval) = settings.stats_interval {
            if last_log.elapsed() >= interval {
                let (packets, bytes) = pipeline.stats().totals();
                let elapsed = pipeline.stats().elapsed().as_secs_f64();
                let rate = if elapsed > 0.0 { packets as f64 / elapsed } else { 0.0 };
                info!("{} packets, {} bytes, {:.1} packets/s", packets, bytes, rate);
                last_log = Instant::now();
            }
        }
    }
    debug!("Ingest loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::NullSink;
    use crate::resolver::LookupError;
    use crate::sniff::Captured;
    use std::net::IpAddr;

    struct NoDns;

    impl ReverseLookup for NoDns {
        fn reverse_lookup(&self, addr: IpAddr) -> Result<String, LookupError> {
            Err(LookupError::NotFound(addr))
        }
    }

    /// Produces idle polls forever.
    struct Silent;

    impl PacketSource for Silent {
        fn next_observation(&mut self) -> Result<Captured, CaptureError> {
            thread::sleep(Duration::from_millis(5));
            Ok(Captured::Idle)
        }
    }

    #[test]
    fn shutdown_token_is_shared() {
        let a = Shutdown::new();
        let b = a.clone();
        assert!(!b.is_triggered());
        a.trigger();
        assert!(b.is_triggered());
    }

    #[test]
    fn external_shutdown_ends_an_idle_session() {
        let shutdown = Shutdown::new();
        let trigger = shutdown.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.trigger();
        });

        let outcome = run(
            Silent,
            NullSink,
            &ResolverCache::new(NoDns),
            &SessionSettings::default(),
            shutdown,
        );
        stopper.join().unwrap();

        assert!(outcome.capture_error.is_none());
        assert_eq!(outcome.report.total_packets, 0);
        assert_eq!(outcome.report.packet_rate, 0.0);
    }
}
