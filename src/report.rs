use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;

use crate::models::domain::Protocol;
use crate::resolver::{ResolverCache, ReverseLookup};
use crate::stats::StatsSnapshot;

pub const TOP_N: usize = 5;

/// `[address, hostname]` in the serialized report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedHost(pub IpAddr, pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlowSummary {
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub total_packets: u64,
    pub total_bytes: u64,
    pub protocol_counts: BTreeMap<String, u64>,
    pub top_sources: Vec<RankedHost>,
    pub top_destinations: Vec<RankedHost>,
    pub packet_rate: f64,
    pub avg_packet_size: f64,
    pub size_histogram: BTreeMap<u32, u64>,
    pub flows: BTreeMap<String, FlowSummary>,
}

impl Report {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub fn generate<L: ReverseLookup>(snapshot: &StatsSnapshot, resolver: &ResolverCache<L>) -> Report {
    generate_with_elapsed(snapshot, resolver, snapshot.started_at.elapsed())
}

pub fn generate_with_elapsed<L: ReverseLookup>(
    snapshot: &StatsSnapshot,
    resolver: &ResolverCache<L>,
    elapsed: Duration,
) -> Report {
    let resolve_all = |ranked: Vec<IpAddr>| -> Vec<RankedHost> {
        ranked
            .into_iter()
            .map(|addr| RankedHost(addr, resolver.resolve(addr)))
            .collect()
    };

    let mut protocol_counts = BTreeMap::new();
    for (&proto, &count) in &snapshot.protocol_counts {
        *protocol_counts
            .entry(Protocol::from(proto).to_string())
            .or_insert(0) += count;
    }

    let flows = snapshot
        .flows
        .iter()
        .map(|(key, acc)| {
            (
                key.to_string(),
                FlowSummary {
                    packets: acc.packets,
                    bytes: acc.bytes,
                },
            )
        })
        .collect();

    Report {
        total_packets: snapshot.total_packets,
        total_bytes: snapshot.total_bytes,
        protocol_counts,
        top_sources: resolve_all(top_addresses(&snapshot.source_counts, TOP_N)),
        top_destinations: resolve_all(top_addresses(&snapshot.destination_counts, TOP_N)),
        packet_rate: packet_rate(snapshot.total_packets, elapsed),
        avg_packet_size: average_size(snapshot.total_bytes, snapshot.total_packets),
        size_histogram: snapshot.size_histogram.clone(),
        flows,
    }
}

/// Highest counts first; equal counts ordered by address ascending.
pub fn top_addresses(counts: &HashMap<IpAddr, u64>, n: usize) -> Vec<IpAddr> {
    let mut ranked: Vec<(&IpAddr, &u64)> = counts.iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    ranked.into_iter().take(n).map(|(addr, _)| *addr).collect()
}

fn packet_rate(packets: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        packets as f64 / secs
    } else {
        0.0
    }
}

fn average_size(bytes: u64, packets: u64) -> f64 {
    if packets == 0 {
        0.0
    } else {
        bytes as f64 / packets as f64
    }
}
