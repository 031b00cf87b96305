use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, warn};

use crate::db::PacketSink;
use crate::models::domain::PacketObservation;
use crate::stats::NetworkStats;

#[derive(Debug, Clone, Copy)]
pub struct SinkQueueConfig {
    /// Observations waiting for the writer beyond this are dropped (newest first).
    pub capacity: usize,
    pub batch_size: usize,
}

impl Default for SinkQueueConfig {
    fn default() -> Self {
        SinkQueueConfig {
            capacity: 10_000,
            batch_size: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub written: u64,
    pub failed: u64,
    pub dropped: u64,
}

/// Sending side of the persistence queue; the writer thread owns the sink.
pub struct SinkHandle {
    tx: Sender<PacketObservation>,
    dropped: Arc<AtomicU64>,
    worker: JoinHandle<SinkStats>,
}

impl SinkHandle {
    pub fn spawn<S: PacketSink + 'static>(sink: S, config: SinkQueueConfig) -> Self {
        let (tx, rx) = bounded(config.capacity.max(1));
        let batch_size = config.batch_size.max(1);
        let worker = thread::spawn(move || write_loop(sink, rx, batch_size));
        SinkHandle {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
            worker,
        }
    }

    /// Queue `obs` for persistence without blocking. Returns false if it was dropped.
    pub fn submit(&self, obs: PacketObservation) -> bool {
        match self.tx.try_send(obs) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!("Persistence queue full, {} records dropped so far", dropped);
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue, let the writer drain it and close the sink.
    pub fn shutdown(self) -> SinkStats {
        let SinkHandle { tx, dropped, worker } = self;
        drop(tx);
        let mut stats = worker.join().unwrap_or_else(|_| {
            error!("Persistence writer panicked");
            SinkStats::default()
        });
        stats.dropped = dropped.load(Ordering::Relaxed);
        stats
    }
}

fn write_loop<S: PacketSink>(mut sink: S, rx: Receiver<PacketObservation>, batch_size: usize) -> SinkStats {
    let mut stats = SinkStats::default();
    let mut batch = Vec::with_capacity(batch_size);

    while let Ok(first) = rx.recv() {
        batch.push(first);
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(obs) => batch.push(obs),
                Err(_) => break,
            }
        }

        match sink.append_batch(&batch) {
            Ok(()) => stats.written += batch.len() as u64,
            Err(e) => {
                stats.failed += batch.len() as u64;
                error!("Error storing {} packets: {}", batch.len(), e);
            }
        }
        batch.clear();
    }

    if let Err(e) = sink.close() {
        error!("Error closing packet store: {}", e);
    }
    debug!("Persistence writer finished: {:?}", stats);
    stats
}

/// Applies each observation to the in-memory stats, then hands it to persistence.
pub struct IngestPipeline {
    stats: Arc<NetworkStats>,
    sink: SinkHandle,
}

impl IngestPipeline {
    pub fn new(stats: Arc<NetworkStats>, sink: SinkHandle) -> Self {
        IngestPipeline { stats, sink }
    }

    pub fn ingest(&self, obs: PacketObservation) {
        self.stats.record(&obs);
        debug!(
            "Packet captured: {} -> {} proto {} len {}",
            obs.source, obs.destination, obs.protocol, obs.length
        );
        self.sink.submit(obs);
    }

    pub fn stats(&self) -> &Arc<NetworkStats> {
        &self.stats
    }

    pub fn shutdown(self) -> SinkStats {
        self.sink.shutdown()
    }
}
