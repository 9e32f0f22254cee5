//! Core data types shared by discovery, probing and stats.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A candidate QoS server in one region.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub location_id: i64,
    pub region_id: String,
    /// Probing is skipped while `now < backoff_until`.
    pub backoff_until: Option<DateTime<Utc>>,
}

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16, location_id: i64, region_id: &str) -> Self {
        Self {
            ip,
            port,
            location_id,
            region_id: region_id.to_string(),
            backoff_until: None,
        }
    }

    /// Identity key: the IPv4 address and port packed into 48 bits.
    pub fn id(&self) -> u64 {
        endpoint_id(self.ip, self.port)
    }

    /// String identity used to key stats history.
    pub fn key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    pub fn is_backed_off(&self, now: DateTime<Utc>) -> bool {
        matches!(self.backoff_until, Some(until) if now < until)
    }
}

/// Pack an address and port into a single comparable key.
pub fn endpoint_id(ip: Ipv4Addr, port: u16) -> u64 {
    (u64::from(u32::from(ip)) << 16) | u64::from(port)
}

/// Server-issued flow-control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum FlowControlType {
    #[default]
    None,
    Throttle,
    Ban,
}

impl fmt::Display for FlowControlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlowControlType::None => "none",
            FlowControlType::Throttle => "throttle",
            FlowControlType::Ban => "ban",
        };
        f.write_str(name)
    }
}

/// Flow-control type plus its unit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowControl {
    pub kind: FlowControlType,
    pub units: u8,
}

impl FlowControl {
    pub const NONE: FlowControl = FlowControl {
        kind: FlowControlType::None,
        units: 0,
    };

    pub fn throttle(units: u8) -> Self {
        Self {
            kind: FlowControlType::Throttle,
            units,
        }
    }

    pub fn ban(units: u8) -> Self {
        Self {
            kind: FlowControlType::Ban,
            units,
        }
    }

    /// Whether `other` should replace `self` as the strongest signal seen.
    ///
    /// More units always wins; at equal units a ban outranks a throttle.
    pub fn is_exceeded_by(&self, other: &FlowControl) -> bool {
        if other.kind == FlowControlType::None {
            return false;
        }
        if self.kind == FlowControlType::None {
            return true;
        }
        let rank = |fc: &FlowControl| (fc.units, fc.kind == FlowControlType::Ban);
        rank(other) > rank(self)
    }
}

/// Outcome of probing a single endpoint in one run.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ProbeResult {
    pub requests_sent: u32,
    pub responses_received: u32,
    pub duplicate_responses: u32,
    pub invalid_responses: u32,
    pub invalid_requests: u32,
    pub average_latency_ms: u32,
    /// Zero when nothing was sent.
    pub packet_loss: f32,
    pub flow_control_type: FlowControlType,
    pub flow_control_units: u8,
}

impl ProbeResult {
    /// Results with no requests sent carry no measurement.
    pub fn is_valid(&self) -> bool {
        self.requests_sent > 0
    }

    pub fn flow_control(&self) -> FlowControl {
        FlowControl {
            kind: self.flow_control_type,
            units: self.flow_control_units,
        }
    }

    pub fn update_packet_loss(&mut self) {
        if self.requests_sent > 0 {
            let received = self.responses_received.min(self.requests_sent);
            self.packet_loss = 1.0 - received as f32 / self.requests_sent as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_id_packs_ip_and_port() {
        let ep = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 9000, 1, "eu");
        assert_eq!(ep.id(), (0x0A00_0001u64 << 16) | 9000);
        assert_eq!(ep.key(), "10.0.0.1:9000");

        let other = Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 9001, 1, "eu");
        assert_ne!(ep.id(), other.id());
    }

    #[test]
    fn test_packet_loss() {
        let mut result = ProbeResult {
            requests_sent: 10,
            responses_received: 7,
            ..Default::default()
        };
        result.update_packet_loss();
        assert!((result.packet_loss - 0.3).abs() < 1e-6);

        let mut empty = ProbeResult::default();
        empty.update_packet_loss();
        assert_eq!(empty.packet_loss, 0.0);
    }

    #[test]
    fn test_flow_control_severity() {
        let none = FlowControl::NONE;
        assert!(none.is_exceeded_by(&FlowControl::throttle(1)));
        assert!(!FlowControl::throttle(1).is_exceeded_by(&none));

        // Ban outranks throttle at equal or higher units
        assert!(FlowControl::throttle(2).is_exceeded_by(&FlowControl::ban(2)));
        assert!(FlowControl::throttle(2).is_exceeded_by(&FlowControl::ban(3)));
        assert!(!FlowControl::ban(2).is_exceeded_by(&FlowControl::throttle(2)));

        // More units wins regardless of type
        assert!(FlowControl::ban(2).is_exceeded_by(&FlowControl::throttle(3)));
        assert!(FlowControl::throttle(3).is_exceeded_by(&FlowControl::throttle(4)));
        assert!(!FlowControl::ban(4).is_exceeded_by(&FlowControl::ban(3)));
    }

    #[test]
    fn test_backoff_gate() {
        let now = Utc::now();
        let mut ep = Endpoint::new(Ipv4Addr::LOCALHOST, 1, 1, "r");
        assert!(!ep.is_backed_off(now));
        ep.backoff_until = Some(now + chrono::Duration::seconds(5));
        assert!(ep.is_backed_off(now));
        assert!(!ep.is_backed_off(now + chrono::Duration::seconds(5)));
    }
}
