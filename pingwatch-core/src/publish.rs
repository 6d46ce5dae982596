//! Best-effort forwarding of tracker snapshots to other consumers.
//!
//! Publishers run inside the tracker's subscriber callback, so they must not
//! block; failures are logged and never reach the sampling loop.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::warn;

use crate::error::{Error, Result};
use crate::subscribers::SubscriptionId;
use crate::tracker::{Tracker, TrackerSnapshot};

pub trait SnapshotPublisher: Send + Sync {
	fn name(&self) -> &'static str;
	fn publish(&self, snapshot: &TrackerSnapshot) -> Result<()>;
}

/// Sends each snapshot as one JSON datagram (`{"LastRTT":..,"AverageRTT":..}`).
#[derive(Debug)]
pub struct UdpJsonPublisher {
	socket: UdpSocket,
	target: SocketAddr,
}

impl UdpJsonPublisher {
	pub fn bind(target: SocketAddr) -> Result<Self> {
		let local: SocketAddr = if target.is_ipv4() { ([0, 0, 0, 0], 0).into() } else { ([0u16; 8], 0).into() };
		let socket = UdpSocket::bind(local)?;
		socket.set_nonblocking(true)?;
		Ok(Self { socket, target })
	}

	pub fn target(&self) -> SocketAddr { self.target }
}

impl SnapshotPublisher for UdpJsonPublisher {
	fn name(&self) -> &'static str { "udp_json" }

	fn publish(&self, snapshot: &TrackerSnapshot) -> Result<()> {
		let payload = serde_json::to_vec(snapshot)?;
		let sent = self.socket.send_to(&payload, self.target)?;
		if sent != payload.len() {
			return Err(Error::publish(format!("short datagram: {sent}/{} bytes", payload.len())));
		}
		Ok(())
	}
}

/// In-process fan-out over a tokio broadcast channel.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
	tx: broadcast::Sender<TrackerSnapshot>,
}

impl BroadcastPublisher {
	pub fn new(buffer: usize) -> Self {
		let (tx, _rx) = broadcast::channel(buffer.max(1));
		Self { tx }
	}

	pub fn subscribe(&self) -> broadcast::Receiver<TrackerSnapshot> { self.tx.subscribe() }
}

impl SnapshotPublisher for BroadcastPublisher {
	fn name(&self) -> &'static str { "broadcast" }

	fn publish(&self, snapshot: &TrackerSnapshot) -> Result<()> {
		// no receivers is not an error; the channel is best-effort
		let _ = self.tx.send(*snapshot);
		Ok(())
	}
}

/// Subscribe `publisher` to every snapshot `tracker` emits.
pub fn forward_to(tracker: &Tracker, publisher: Arc<dyn SnapshotPublisher>) -> SubscriptionId {
	let tracker_name = tracker.name().to_string();
	tracker.subscribe(move |snapshot| {
		if let Err(e) = publisher.publish(snapshot) {
			warn!(tracker = %tracker_name, publisher = publisher.name(), error = %e, "failed to forward snapshot");
		}
	})
}
