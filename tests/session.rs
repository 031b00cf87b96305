use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use traffic_analyzer::db::{PacketSink, SinkError, SqliteSink};
use traffic_analyzer::models::domain::PacketObservation;
use traffic_analyzer::report::{FlowSummary, RankedHost};
use traffic_analyzer::resolver::{LookupError, ResolverCache, ReverseLookup};
use traffic_analyzer::session::{self, SessionSettings, Shutdown};
use traffic_analyzer::sniff::{CaptureError, Captured, PacketSource};

struct Replay(VecDeque<Result<Captured, CaptureError>>);

impl Replay {
    fn packets(observations: Vec<PacketObservation>) -> Self {
        Replay(observations.into_iter().map(|o| Ok(Captured::Packet(o))).collect())
    }
}

impl PacketSource for Replay {
    fn next_observation(&mut self) -> Result<Captured, CaptureError> {
        self.0.pop_front().unwrap_or(Ok(Captured::Exhausted))
    }
}

#[derive(Clone, Default)]
struct CountingDns {
    calls: Arc<AtomicUsize>,
}

impl ReverseLookup for CountingDns {
    fn reverse_lookup(&self, addr: IpAddr) -> Result<String, LookupError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match addr.to_string().as_str() {
            "192.168.0.10" => Ok("laptop.lan".to_string()),
            _ => Err(LookupError::NotFound(addr)),
        }
    }
}

struct DownSink;

impl PacketSink for DownSink {
    fn append_batch(&mut self, _batch: &[PacketObservation]) -> Result<(), SinkError> {
        Err(SinkError::Unavailable("connection refused".into()))
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn scenario() -> Vec<PacketObservation> {
    let a = ip("192.168.0.10");
    let b = ip("93.184.216.34");
    vec![
        PacketObservation::new(a, b, 6, 500),
        PacketObservation::new(a, b, 6, 1500),
        PacketObservation::new(b, a, 17, 60),
    ]
}

#[test]
fn replayed_capture_produces_full_report() {
    let dns = CountingDns::default();
    let resolver = ResolverCache::new(dns.clone());
    let sink = SqliteSink::in_memory().unwrap();

    let outcome = session::run(
        Replay::packets(scenario()),
        sink,
        &resolver,
        &SessionSettings::default(),
        Shutdown::new(),
    );

    assert!(outcome.capture_error.is_none());
    assert_eq!(outcome.captured, 3);
    assert_eq!(outcome.sink.written, 3);
    assert_eq!(outcome.sink.failed, 0);

    let report = outcome.report;
    assert_eq!(report.total_packets, 3);
    assert_eq!(report.total_bytes, 2060);
    assert_eq!(report.protocol_counts.len(), 2);
    assert_eq!(report.protocol_counts["TCP"], 2);
    assert_eq!(report.protocol_counts["UDP"], 1);
    assert_eq!(
        report.flows["192.168.0.10->93.184.216.34 (TCP)"],
        FlowSummary { packets: 2, bytes: 2000 }
    );
    assert_eq!(
        report.flows["93.184.216.34->192.168.0.10 (UDP)"],
        FlowSummary { packets: 1, bytes: 60 }
    );
    assert_eq!(
        report.size_histogram.iter().map(|(k, v)| (*k, *v)).collect::<Vec<_>>(),
        vec![(0, 1), (500, 1), (1500, 1)]
    );
    assert!((report.avg_packet_size - 2060.0 / 3.0).abs() < 1e-9);

    assert_eq!(
        report.top_sources,
        vec![
            RankedHost(ip("192.168.0.10"), "laptop.lan".into()),
            RankedHost(ip("93.184.216.34"), "93.184.216.34".into()),
        ]
    );
    assert_eq!(
        report.top_destinations,
        vec![
            RankedHost(ip("93.184.216.34"), "93.184.216.34".into()),
            RankedHost(ip("192.168.0.10"), "laptop.lan".into()),
        ]
    );
    // both addresses appear in both lists but each is looked up once
    assert_eq!(dns.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn storage_outage_does_not_lose_statistics() {
    let outcome = session::run(
        Replay::packets(scenario()),
        DownSink,
        &ResolverCache::new(CountingDns::default()),
        &SessionSettings::default(),
        Shutdown::new(),
    );

    assert!(outcome.capture_error.is_none());
    assert_eq!(outcome.report.total_packets, 3);
    assert_eq!(outcome.report.total_bytes, 2060);
    assert_eq!(outcome.sink.written, 0);
    assert_eq!(outcome.sink.failed + outcome.sink.dropped, 3);
}

#[test]
fn capture_failure_still_reports_what_was_seen() {
    let mut steps: VecDeque<_> = scenario().into_iter().map(|o| Ok(Captured::Packet(o))).collect();
    steps.push_back(Err(CaptureError::NoDevice));
    steps.push_back(Ok(Captured::Packet(PacketObservation::new(
        ip("10.9.9.9"),
        ip("10.8.8.8"),
        1,
        84,
    ))));

    let outcome = session::run(
        Replay(steps),
        traffic_analyzer::db::NullSink,
        &ResolverCache::new(CountingDns::default()),
        &SessionSettings::default(),
        Shutdown::new(),
    );

    assert!(matches!(outcome.capture_error, Some(CaptureError::NoDevice)));
    assert_eq!(outcome.report.total_packets, 3);
    assert!(!outcome.report.protocol_counts.contains_key("ICMP"));
}

#[test]
fn report_json_has_fixed_field_names() {
    let outcome = session::run(
        Replay::packets(scenario()),
        traffic_analyzer::db::NullSink,
        &ResolverCache::new(CountingDns::default()),
        &SessionSettings::default(),
        Shutdown::new(),
    );

    let value: serde_json::Value = serde_json::from_str(&outcome.report.to_json().unwrap()).unwrap();
    let mut fields: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
    fields.sort_unstable();
    assert_eq!(
        fields,
        vec![
            "avg_packet_size",
            "flows",
            "packet_rate",
            "protocol_counts",
            "size_histogram",
            "top_destinations",
            "top_sources",
            "total_bytes",
            "total_packets",
        ]
    );
    assert_eq!(value["total_packets"], 3);
    assert_eq!(value["size_histogram"]["1500"], 1);
    assert_eq!(value["top_sources"][0], serde_json::json!(["192.168.0.10", "laptop.lan"]));
}
