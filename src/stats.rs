use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::models::domain::{FlowAccumulator, FlowKey, PacketObservation};

pub const HISTOGRAM_BUCKET_WIDTH: u32 = 100;

#[derive(Debug, Clone, Default)]
struct Counters {
    total_packets: u64,
    total_bytes: u64,
    protocol_counts: HashMap<u8, u64>,
    source_counts: HashMap<IpAddr, u64>,
    destination_counts: HashMap<IpAddr, u64>,
    flows: HashMap<FlowKey, FlowAccumulator>,
    size_histogram: BTreeMap<u32, u64>,
}

impl Counters {
    fn update(&mut self, obs: &PacketObservation) {
        self.total_packets += 1;
        self.total_bytes += u64::from(obs.length);
        *self.protocol_counts.entry(obs.protocol).or_insert(0) += 1;
        *self.source_counts.entry(obs.source).or_insert(0) += 1;
        *self.destination_counts.entry(obs.destination).or_insert(0) += 1;
        self.flows.entry(obs.flow_key()).or_default().add(obs.length);
        *self.size_histogram.entry(size_bucket(obs.length)).or_insert(0) += 1;
    }
}

/// Running traffic statistics for one capture session.
///
/// Every observation is applied under a single lock, so a snapshot always
/// reflects a whole number of observations.
#[derive(Debug)]
pub struct NetworkStats {
    started_at: Instant,
    counters: Mutex<Counters>,
}

impl NetworkStats {
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    pub fn started_at(started_at: Instant) -> Self {
        NetworkStats {
            started_at,
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn record(&self, obs: &PacketObservation) {
        self.counters.lock().update(obs);
    }

    /// (packets, bytes) without copying the maps.
    pub fn totals(&self) -> (u64, u64) {
        let counters = self.counters.lock();
        (counters.total_packets, counters.total_bytes)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Copies the counters under the lock. Size samples are kept as bucket
    /// counts, so the copy is bounded by distinct hosts, flows and buckets
    /// rather than by the number of packets seen.
    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.counters.lock().clone();
        StatsSnapshot {
            started_at: self.started_at,
            total_packets: counters.total_packets,
            total_bytes: counters.total_bytes,
            protocol_counts: counters.protocol_counts,
            source_counts: counters.source_counts,
            destination_counts: counters.destination_counts,
            flows: counters.flows,
            size_histogram: counters.size_histogram,
        }
    }
}

impl Default for NetworkStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`NetworkStats`].
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub started_at: Instant,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub protocol_counts: HashMap<u8, u64>,
    pub source_counts: HashMap<IpAddr, u64>,
    pub destination_counts: HashMap<IpAddr, u64>,
    pub flows: HashMap<FlowKey, FlowAccumulator>,
    /// Packet count per [`size_bucket`].
    pub size_histogram: BTreeMap<u32, u64>,
}

pub fn size_bucket(length: u32) -> u32 {
    length / HISTOGRAM_BUCKET_WIDTH * HISTOGRAM_BUCKET_WIDTH
}
