pub mod domain {
    use std::fmt;
    use std::net::IpAddr;

    use chrono::{DateTime, Utc};

    /// One decoded IP packet, as handed to the ingest pipeline.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PacketObservation {
        pub source: IpAddr,
        pub destination: IpAddr,
        pub protocol: u8,
        pub length: u32,
        pub timestamp: DateTime<Utc>,
    }

    impl PacketObservation {
        pub fn new(source: IpAddr, destination: IpAddr, protocol: u8, length: u32) -> Self {
            Self {
                source,
                destination,
                protocol,
                length,
                timestamp: Utc::now(),
            }
        }

        pub fn flow_key(&self) -> FlowKey {
            FlowKey {
                source: self.source,
                destination: self.destination,
                protocol: self.protocol,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct FlowKey {
        pub source: IpAddr,
        pub destination: IpAddr,
        pub protocol: u8,
    }

    impl fmt::Display for FlowKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}->{} ({})",
                self.source,
                self.destination,
                Protocol::from(self.protocol)
            )
        }
    }

    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct FlowAccumulator {
        pub packets: u64,
        pub bytes: u64,
    }

    impl FlowAccumulator {
        pub fn add(&mut self, length: u32) {
            self.packets += 1;
            self.bytes += u64::from(length);
        }
    }

    /// IP protocol number with names for the ones the report labels.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum Protocol {
        Icmp,
        Tcp,
        Udp,
        Other(u8),
    }

    impl From<u8> for Protocol {
        fn from(number: u8) -> Self {
            match number {
                1 => Protocol::Icmp,
                6 => Protocol::Tcp,
                17 => Protocol::Udp,
                n => Protocol::Other(n),
            }
        }
    }

    impl fmt::Display for Protocol {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Protocol::Icmp => f.write_str("ICMP"),
                Protocol::Tcp => f.write_str("TCP"),
                Protocol::Udp => f.write_str("UDP"),
                Protocol::Other(n) => write!(f, "{}", n),
            }
        }
    }
}

pub mod dto {
    use serde::{Deserialize, Serialize};

    use super::domain::PacketObservation;

    /// Stored shape of a packet. New fields must be optional so older rows still load.
    #[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
    pub struct PacketRecord {
        pub ip_src: String,
        pub ip_dst: String,
        pub protocol: u8,
        pub length: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub captured_at: Option<String>,
    }

    impl From<&PacketObservation> for PacketRecord {
        fn from(obs: &PacketObservation) -> Self {
            PacketRecord {
                ip_src: obs.source.to_string(),
                ip_dst: obs.destination.to_string(),
                protocol: obs.protocol,
                length: obs.length,
                captured_at: Some(obs.timestamp.to_rfc3339()),
            }
        }
    }
}
