// src/sniff.rs
use std::net::IpAddr;
use std::path::Path;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use etherparse::{LaxNetSlice, LaxSlicedPacket};
use pcap::{Activated, Active, Capture, Device, Linktype, Offline};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::domain::PacketObservation;
use crate::session::Shutdown;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("pcap: {0}")]
    Pcap(#[from] pcap::Error),
    #[error("no capture device available")]
    NoDevice,
    #[error("no such interface: {0}")]
    NoSuchInterface(String),
    #[error("unsupported link type {0:?}")]
    UnsupportedLinkType(Linktype),
    #[error("capture thread panicked")]
    Panicked,
}

/// Result of one poll of a [`PacketSource`].
#[derive(Debug)]
pub enum Captured {
    Packet(PacketObservation),
    /// A frame arrived but carried no IP packet, or could not be decoded.
    Skipped,
    /// Read timeout; nothing arrived.
    Idle,
    /// Offline source has no more packets.
    Exhausted,
}

pub trait PacketSource: Send {
    fn next_observation(&mut self) -> Result<Captured, CaptureError>;
}

impl<S: PacketSource + ?Sized> PacketSource for Box<S> {
    fn next_observation(&mut self) -> Result<Captured, CaptureError> {
        (**self).next_observation()
    }
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub interface: Option<String>,
    pub filter: Option<String>,
    pub snaplen: i32,
    pub promisc: bool,
    pub timeout_ms: i32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        CaptureSettings {
            interface: None,
            filter: Some("ip or ip6".to_string()),
            snaplen: 65535,
            promisc: true,
            timeout_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkLayer {
    Ethernet,
    RawIp,
}

impl LinkLayer {
    fn from_linktype(link: Linktype) -> Result<Self, CaptureError> {
        match link.0 {
            1 => Ok(LinkLayer::Ethernet),
            12 | 14 | 101 | 228 | 229 => Ok(LinkLayer::RawIp),
            _ => Err(CaptureError::UnsupportedLinkType(link)),
        }
    }
}

pub struct PcapSource<T: Activated + ?Sized> {
    cap: Capture<T>,
    link: LinkLayer,
}

impl PcapSource<Active> {
    pub fn live(settings: &CaptureSettings) -> Result<Self, CaptureError> {
        let device = match &settings.interface {
            Some(name) => Device::list()?
                .into_iter()
                .find(|d| &d.name == name)
                .ok_or_else(|| CaptureError::NoSuchInterface(name.clone()))?,
            None => Device::lookup()?.ok_or(CaptureError::NoDevice)?,
        };
        info!("Capturing on {}", device.name);

        let mut cap = Capture::from_device(device)?
            .promisc(settings.promisc)
            .snaplen(settings.snaplen)
            .timeout(settings.timeout_ms)
            .immediate_mode(true)
            .open()?;
        if let Some(filter) = &settings.filter {
            cap.filter(filter, true)?;
        }

        let link = LinkLayer::from_linktype(cap.get_datalink())?;
        Ok(PcapSource { cap, link })
    }
}

impl PcapSource<Offline> {
    pub fn file(path: impl AsRef<Path>, filter: Option<&str>) -> Result<Self, CaptureError> {
        let mut cap = Capture::from_file(path.as_ref())?;
        if let Some(filter) = filter {
            cap.filter(filter, true)?;
        }
        info!("Reading packets from {}", path.as_ref().display());

        let link = LinkLayer::from_linktype(cap.get_datalink())?;
        Ok(PcapSource { cap, link })
    }
}

impl<T: Activated + ?Sized> PacketSource for PcapSource<T> {
    fn next_observation(&mut self) -> Result<Captured, CaptureError> {
        match self.cap.next_packet() {
            Ok(packet) => {
                let ts = &packet.header.ts;
                let timestamp = packet_timestamp(ts.tv_sec as i64, i64::from(ts.tv_usec));
                Ok(analyze_packet(self.link, packet.data, packet.header.len, timestamp)
                    .map_or(Captured::Skipped, Captured::Packet))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(Captured::Idle),
            Err(pcap::Error::NoMorePackets) => Ok(Captured::Exhausted),
            Err(e) => Err(e.into()),
        }
    }
}

/// Falls back to the current time when the microsecond field is out of range.
fn packet_timestamp(secs: i64, micros: i64) -> DateTime<Utc> {
    u32::try_from(micros)
        .ok()
        .and_then(|us| us.checked_mul(1000))
        .and_then(|ns| DateTime::<Utc>::from_timestamp(secs, ns))
        .unwrap_or_else(Utc::now)
}

/// Only the IP header has to be present; a frame cut short by the snaplen is
/// still counted at its wire length.
fn analyze_packet(
    link: LinkLayer,
    data: &[u8],
    wire_len: u32,
    timestamp: DateTime<Utc>,
) -> Option<PacketObservation> {
    let sliced = match link {
        LinkLayer::Ethernet => LaxSlicedPacket::from_ethernet(data).ok()?,
        LinkLayer::RawIp => LaxSlicedPacket::from_ip(data).ok()?,
    };

    let (source, destination, protocol) = match sliced.net? {
        LaxNetSlice::Ipv4(ipv4) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
            ipv4.payload().ip_number.0,
        ),
        LaxNetSlice::Ipv6(ipv6) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
            ipv6.payload().ip_number.0,
        ),
    };

    Some(PacketObservation {
        source,
        destination,
        protocol,
        length: wire_len,
        timestamp,
    })
}

/// Pull packets from `source` until shutdown, exhaustion or a capture error.
pub fn start_sniffing<S: PacketSource>(
    mut source: S,
    sender: Sender<PacketObservation>,
    shutdown: &Shutdown,
) -> Result<u64, CaptureError> {
    let mut captured = 0u64;
    let mut skipped = 0u64;

    while !shutdown.is_triggered() {
        match source.next_observation()? {
            Captured::Packet(obs) => {
                captured += 1;
                if sender.send(obs).is_err() {
                    debug!("Ingest side closed, stopping capture");
                    break;
                }
            }
            Captured::Skipped => skipped += 1,
            Captured::Idle => {}
            Captured::Exhausted => {
                info!("Capture source exhausted");
                break;
            }
        }
    }

    debug!("Capture stopped: {} packets, {} non-IP frames skipped", captured, skipped);
    Ok(captured)
}
