//! ICMP echo sampler.
//!
//! Uses an unprivileged datagram ICMP socket where the OS allows it and
//! falls back to a raw socket. If neither can be opened the failure is
//! permanent: retrying will not grant the missing privilege.

use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::{Rtt, RttSampler};
use crate::error::SampleError;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_DEST_UNREACHABLE: u8 = 3;
const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_TIME_EXCEEDED: u8 = 11;
const PAYLOAD: &[u8; 32] = b"abcdefghijklmnopqrstuvwabcdefghi";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SocketKind {
	/// Kernel strips the IP header and owns the identifier.
	Dgram,
	/// Full IP datagrams, every ICMP message on the host.
	Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reply {
	Echo { ttl: Option<u8> },
	Unreachable { icmp_type: u8, code: u8 },
	Unrelated,
}

/// Sends one ICMP echo per sample with a bounded hop limit.
#[derive(Debug)]
pub struct IcmpEchoSampler {
	timeout: Duration,
	hop_limit: u32,
	identifier: u16,
	sequence: AtomicU16,
}

impl IcmpEchoSampler {
	pub fn new(timeout: Duration, hop_limit: u32) -> Self {
		Self { timeout, hop_limit, identifier: rand::random(), sequence: AtomicU16::new(0) }
	}
}

#[async_trait]
impl RttSampler for IcmpEchoSampler {
	fn name(&self) -> &'static str { "icmp_echo" }

	async fn sample(&self, address: IpAddr) -> Result<Rtt, SampleError> {
		let IpAddr::V4(dest) = address else {
			return Err(SampleError::Unsupported(format!("icmp echo to {address}")));
		};
		let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
		let (identifier, hop_limit, timeout) = (self.identifier, self.hop_limit, self.timeout);
		tokio::task::spawn_blocking(move || probe(dest, identifier, seq, hop_limit, timeout))
			.await
			.map_err(|e| SampleError::Os { code: -1, message: format!("probe task failed: {e}") })?
	}
}

fn open_socket() -> io::Result<(Socket, SocketKind)> {
	match Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)) {
		Ok(s) => Ok((s, SocketKind::Dgram)),
		Err(_) => Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).map(|s| (s, SocketKind::Raw)),
	}
}

fn probe(dest: Ipv4Addr, identifier: u16, seq: u16, hop_limit: u32, timeout: Duration) -> Result<Rtt, SampleError> {
	let (socket, kind) = open_socket().map_err(SampleError::from_io)?;
	socket.set_ttl(hop_limit).map_err(SampleError::from_io)?;
	let request = encode_echo_request(identifier, seq, PAYLOAD);
	let target = SockAddr::from(SocketAddr::new(IpAddr::V4(dest), 0));

	let started = Instant::now();
	let deadline = started + timeout;
	socket.send_to(&request, &target).map_err(SampleError::from_io)?;

	let mut buf = [0u8; 1500];
	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());
		if remaining.is_zero() {
			return Err(SampleError::Timeout(timeout));
		}
		socket.set_read_timeout(Some(remaining)).map_err(SampleError::from_io)?;
		let n = match (&socket).read(&mut buf) {
			Ok(n) => n,
			Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
				return Err(SampleError::Timeout(timeout));
			}
			Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
			Err(e) => return Err(SampleError::from_io(e)),
		};
		let elapsed = started.elapsed();
		match parse_reply(&buf[..n], kind, identifier, seq) {
			Reply::Echo { ttl } => {
				return Ok(Rtt { millis: elapsed.as_millis() as u64, hops: ttl.map(hops_from_ttl) });
			}
			Reply::Unreachable { icmp_type, code } => {
				return Err(SampleError::Unreachable(format!("{dest}: icmp type {icmp_type} code {code}")));
			}
			Reply::Unrelated => continue,
		}
	}
}

fn encode_echo_request(identifier: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
	let mut pkt = Vec::with_capacity(8 + payload.len());
	pkt.extend_from_slice(&[ICMP_ECHO_REQUEST, 0, 0, 0]);
	pkt.extend_from_slice(&identifier.to_be_bytes());
	pkt.extend_from_slice(&seq.to_be_bytes());
	pkt.extend_from_slice(payload);
	let sum = checksum(&pkt);
	pkt[2..4].copy_from_slice(&sum.to_be_bytes());
	pkt
}

/// RFC 1071 internet checksum.
fn checksum(data: &[u8]) -> u16 {
	let mut sum: u32 = data
		.chunks(2)
		.map(|c| u32::from(u16::from_be_bytes([c[0], *c.get(1).unwrap_or(&0)])))
		.sum();
	while sum >> 16 != 0 {
		sum = (sum & 0xffff) + (sum >> 16);
	}
	!(sum as u16)
}

fn split_ip_header(buf: &[u8]) -> Option<(&[u8], u8)> {
	let ihl = usize::from(*buf.first()? & 0x0f) * 4;
	if ihl < 20 || buf.len() < ihl {
		return None;
	}
	Some((&buf[ihl..], buf[8]))
}

fn parse_reply(buf: &[u8], kind: SocketKind, identifier: u16, seq: u16) -> Reply {
	let (icmp, ttl) = match kind {
		SocketKind::Dgram => (buf, None),
		SocketKind::Raw => match split_ip_header(buf) {
			Some((icmp, ttl)) => (icmp, Some(ttl)),
			None => return Reply::Unrelated,
		},
	};
	if icmp.len() < 8 {
		return Reply::Unrelated;
	}
	let id_seq = |b: &[u8]| (u16::from_be_bytes([b[4], b[5]]), u16::from_be_bytes([b[6], b[7]]));
	match icmp[0] {
		ICMP_ECHO_REPLY => {
			let (rid, rseq) = id_seq(icmp);
			// datagram sockets rewrite the identifier to the socket's own
			if rseq == seq && (kind == SocketKind::Dgram || rid == identifier) {
				Reply::Echo { ttl }
			} else {
				Reply::Unrelated
			}
		}
		ICMP_DEST_UNREACHABLE | ICMP_TIME_EXCEEDED => {
			let ours = match kind {
				SocketKind::Dgram => true,
				// the error quotes our original IP header plus the first 8 ICMP bytes
				SocketKind::Raw => match split_ip_header(&icmp[8..]) {
					Some((quoted, _)) if quoted.len() >= 8 => id_seq(quoted) == (identifier, seq),
					_ => false,
				},
			};
			if ours {
				Reply::Unreachable { icmp_type: icmp[0], code: icmp[1] }
			} else {
				Reply::Unrelated
			}
		}
		_ => Reply::Unrelated,
	}
}

/// Guess hops from the remaining TTL assuming a common initial value.
fn hops_from_ttl(ttl: u8) -> u8 {
	let initial: u8 = match ttl {
		0..=64 => 64,
		65..=128 => 128,
		_ => 255,
	};
	initial - ttl
}
