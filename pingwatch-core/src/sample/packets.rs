//! Passive latency from the client's own traffic.
//!
//! No probes are sent. The host forwards every game packet it sees to a
//! [`PacketObserver`]; an outgoing request opcode starts a timer and the
//! matching acknowledgment opcode stops it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{Rtt, RttSampler};
use crate::config::PacketPair;
use crate::error::SampleError;

/// Requests older than this are assumed lost.
const DEFAULT_MAX_PENDING_AGE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	Outbound,
	Inbound,
}

#[derive(Debug)]
struct TimingState {
	pairs: Vec<PacketPair>,
	/// ack opcode -> send time of the oldest unacknowledged request
	pending: HashMap<u16, Instant>,
	latest: Option<Duration>,
}

/// Host-facing hook into the client's packet pipeline. Cheap to clone.
#[derive(Debug, Clone)]
pub struct PacketObserver {
	inner: Arc<Mutex<TimingState>>,
	max_pending_age: Duration,
}

impl PacketObserver {
	pub fn new(pairs: Vec<PacketPair>) -> Self {
		Self {
			inner: Arc::new(Mutex::new(TimingState { pairs, pending: HashMap::new(), latest: None })),
			max_pending_age: DEFAULT_MAX_PENDING_AGE,
		}
	}

	pub fn with_max_pending_age(mut self, age: Duration) -> Self {
		self.max_pending_age = age;
		self
	}

	pub fn observe(&self, direction: Direction, opcode: u16, at: Instant) {
		let mut st = self.inner.lock();
		match direction {
			Direction::Outbound => {
				let acks: Vec<u16> = st.pairs.iter().filter(|p| p.request == opcode).map(|p| p.ack).collect();
				for ack in acks {
					let stale = st
						.pending
						.get(&ack)
						.map_or(true, |sent| at.saturating_duration_since(*sent) > self.max_pending_age);
					if stale {
						st.pending.insert(ack, at);
					}
				}
			}
			Direction::Inbound => {
				if let Some(sent) = st.pending.remove(&opcode) {
					let rtt = at.saturating_duration_since(sent);
					if rtt <= self.max_pending_age {
						st.latest = Some(rtt);
					}
				}
			}
		}
	}

	/// The newest completed measurement since the last call.
	pub fn take_latest(&self) -> Option<Duration> { self.inner.lock().latest.take() }
}

pub struct PacketTimingSampler {
	observer: PacketObserver,
}

impl PacketTimingSampler {
	pub fn new(observer: PacketObserver) -> Self { Self { observer } }
}

#[async_trait]
impl RttSampler for PacketTimingSampler {
	fn name(&self) -> &'static str { "packet_timing" }

	async fn sample(&self, _address: IpAddr) -> Result<Rtt, SampleError> {
		self.observer
			.take_latest()
			.map(|d| Rtt::from_millis(d.as_millis() as u64))
			.ok_or(SampleError::NoData)
	}
}
