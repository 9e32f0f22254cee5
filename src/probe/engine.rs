//! Blocking QoS probe engine.
//!
//! One run owns one non-blocking UDP socket and walks the endpoint list in
//! order, giving each endpoint an equal share of whatever budget is left.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};

use super::packet::{RequestPacket, ResponsePacket, MAX_PACKET_LEN};
use super::ProbeError;
use crate::config::{validate_probe_settings, validate_title, ConfigError};
use crate::models::{Endpoint, FlowControl, ProbeResult};

const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

/// Pause between empty non-blocking reads.
const RECV_POLL_INTERVAL: Duration = Duration::from_micros(500);

/// Runs QoS exchanges against a list of endpoints.
pub struct ProbeEngine {
    title: String,
    /// Zero point of the millisecond clock carried in request timestamps.
    epoch: Instant,
    next_identifier: AtomicU16,
}

impl ProbeEngine {
    pub fn new(title: &str) -> Result<Self, ConfigError> {
        validate_title(title)?;
        Ok(Self {
            title: title.to_string(),
            epoch: Instant::now(),
            next_identifier: AtomicU16::new(rand::random()),
        })
    }

    /// Probe every endpoint and return results index-aligned with the input.
    ///
    /// Blocks for at most `total_timeout`. Socket setup failure aborts the
    /// whole run; everything after that is folded into result counters.
    pub fn probe(
        &self,
        endpoints: &[Endpoint],
        requests_per_endpoint: u32,
        total_timeout: Duration,
    ) -> Result<Vec<ProbeResult>, ProbeError> {
        validate_probe_settings(&self.title, requests_per_endpoint, total_timeout)?;

        let mut results = vec![ProbeResult::default(); endpoints.len()];
        if endpoints.is_empty() {
            return Ok(results);
        }

        let job_deadline = Instant::now() + total_timeout;
        let socket = open_socket()?;
        let mut probed: HashMap<u64, usize> = HashMap::with_capacity(endpoints.len());

        for (i, endpoint) in endpoints.iter().enumerate() {
            if let Some(&first) = probed.get(&endpoint.id()) {
                results[i] = results[first].clone();
                continue;
            }

            if endpoint.is_backed_off(Utc::now()) {
                tracing::debug!(
                    "Probe: skipping {} ({}), backed off until {:?}",
                    endpoint.key(),
                    endpoint.region_id,
                    endpoint.backoff_until
                );
                continue;
            }

            let now = Instant::now();
            if now >= job_deadline {
                tracing::debug!(
                    "Probe: job deadline reached, {} endpoints left unprobed",
                    endpoints.len() - i
                );
                break;
            }

            let remaining = (endpoints.len() - i) as u32;
            let slice_deadline = now + (job_deadline - now) / remaining;

            results[i] = self.probe_endpoint(&socket, endpoint, requests_per_endpoint, slice_deadline);
            probed.insert(endpoint.id(), i);

            tracing::debug!(
                "Probe: {} ({}) sent={} received={} latency={}ms loss={:.2}",
                endpoint.key(),
                endpoint.region_id,
                results[i].requests_sent,
                results[i].responses_received,
                results[i].average_latency_ms,
                results[i].packet_loss
            );
        }

        Ok(results)
    }

    fn probe_endpoint(
        &self,
        socket: &UdpSocket,
        endpoint: &Endpoint,
        requests: u32,
        deadline: Instant,
    ) -> ProbeResult {
        let identifier = self.next_identifier.fetch_add(1, Ordering::Relaxed);
        let addr = endpoint.socket_addr();
        let mut tally = ResponseTally::new(identifier, requests);

        for sequence in 0..requests {
            // requests <= 256, so every sequence number fits in a byte
            let packet = RequestPacket::new(&self.title, identifier, sequence as u8, self.now_ms());
            let bytes = packet.encode();
            match socket.send_to(&bytes, addr) {
                Ok(n) if n == bytes.len() => tally.record_sent(),
                Ok(n) => {
                    tracing::debug!("Probe: short send to {} ({} of {} bytes)", addr, n, bytes.len());
                    tally.record_invalid_request();
                }
                Err(e) => {
                    tracing::debug!("Probe: send to {} failed: {}", addr, e);
                    tally.record_invalid_request();
                }
            }
        }

        let mut buf = [0u8; MAX_PACKET_LEN];
        while !tally.is_complete() && Instant::now() < deadline {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if from != addr {
                        continue;
                    }
                    tally.record_datagram(&buf[..len], self.now_ms());
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(RECV_POLL_INTERVAL);
                }
                Err(e) => {
                    tracing::debug!("Probe: receive error while waiting on {}: {}", addr, e);
                    std::thread::sleep(RECV_POLL_INTERVAL);
                }
            }
        }

        tally.finish()
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

fn open_socket() -> Result<UdpSocket, ProbeError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| ProbeError::Transport(format!("failed to create UDP socket: {}", e)))?;

    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        tracing::warn!("Probe: failed to size send buffer: {}", e);
    }
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        tracing::warn!("Probe: failed to size receive buffer: {}", e);
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| ProbeError::Transport(format!("failed to set non-blocking: {}", e)))?;

    let local = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
    socket
        .bind(&local.into())
        .map_err(|e| ProbeError::Transport(format!("failed to bind socket: {}", e)))?;

    Ok(socket.into())
}

/// Receive-side bookkeeping for one endpoint.
struct ResponseTally {
    identifier: u16,
    /// Sequence numbers handed out, whether or not the send succeeded.
    attempted: u32,
    seen: [bool; 256],
    latency_sum: u64,
    flow_control: FlowControl,
    result: ProbeResult,
}

impl ResponseTally {
    fn new(identifier: u16, attempted: u32) -> Self {
        Self {
            identifier,
            attempted,
            seen: [false; 256],
            latency_sum: 0,
            flow_control: FlowControl::NONE,
            result: ProbeResult::default(),
        }
    }

    fn record_sent(&mut self) {
        self.result.requests_sent += 1;
    }

    fn record_invalid_request(&mut self) {
        self.result.invalid_requests += 1;
    }

    fn is_complete(&self) -> bool {
        self.result.responses_received >= self.result.requests_sent
    }

    fn record_datagram(&mut self, buf: &[u8], now_ms: u64) {
        let response = match ResponsePacket::decode(buf) {
            Ok(r) if r.is_valid_header() => r,
            _ => {
                self.result.invalid_responses += 1;
                return;
            }
        };

        if response.identifier != self.identifier
            || u32::from(response.sequence) >= self.attempted
            || response.timestamp_ms > now_ms
        {
            self.result.invalid_responses += 1;
            return;
        }

        let fc = response.flow_control();
        if self.flow_control.is_exceeded_by(&fc) {
            self.flow_control = fc;
        }

        let seen = &mut self.seen[usize::from(response.sequence)];
        if *seen {
            self.result.duplicate_responses += 1;
            return;
        }
        *seen = true;

        self.result.responses_received += 1;
        self.latency_sum += now_ms - response.timestamp_ms;
    }

    fn finish(mut self) -> ProbeResult {
        if self.result.responses_received > 0 {
            self.result.average_latency_ms =
                (self.latency_sum / u64::from(self.result.responses_received)) as u32;
        }
        self.result.update_packet_loss();
        self.result.flow_control_type = self.flow_control.kind;
        self.result.flow_control_units = self.flow_control.units;
        self.result
    }
}
