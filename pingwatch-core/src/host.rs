//! Host-side assembly: one shared game detector, a game tracker of the
//! configured kind, a gateway tracker, and snapshot forwarding.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use crate::config::TrackerConfig;
use crate::detect::aggregate::AggregateAddressDetector;
use crate::detect::client_state::{ClientState, ClientStateAddressDetector};
use crate::detect::gateway::ProcRouteTable;
use crate::detect::tcp_table::TcpTableAddressDetector;
use crate::error::{Error, Result};
use crate::factory::{build_gateway_tracker, build_tracker, TrackerKind};
use crate::publish::{forward_to, SnapshotPublisher};
use crate::sample::packets::PacketObserver;
use crate::subscribers::SubscriptionId;
use crate::tracker::{Tracker, TrackerState};

#[derive(Clone, Default)]
pub struct HostOptions {
	pub config: TrackerConfig,
	/// Overrides `/proc/net/tcp`.
	pub tcp_table_path: Option<PathBuf>,
	/// Overrides `/proc/net/route` and `/sys/class/net`.
	pub route_paths: Option<(PathBuf, PathBuf)>,
	/// Receive every game tracker snapshot, across kind switches.
	pub publishers: Vec<Arc<dyn SnapshotPublisher>>,
}

pub struct PingHost {
	config: TrackerConfig,
	client_state: ClientState,
	packets: PacketObserver,
	game_detector: Arc<AggregateAddressDetector>,
	game: RwLock<Arc<Tracker>>,
	gateway: Arc<Tracker>,
	publishers: Vec<Arc<dyn SnapshotPublisher>>,
	forwarding: Mutex<Vec<SubscriptionId>>,
}

impl PingHost {
	/// Build both trackers without starting them.
	pub fn new(options: HostOptions) -> Result<Self> {
		let HostOptions { config, tcp_table_path, route_paths, publishers } = options;
		config.validate()?;

		let client_state = ClientState::new();
		let packets = PacketObserver::new(config.packet_pairs.clone());

		let tcp = match tcp_table_path {
			Some(path) => TcpTableAddressDetector::with_path(path, config.server_ports.clone()),
			None => TcpTableAddressDetector::new(config.server_ports.clone()),
		};
		let game_detector = Arc::new(
			AggregateAddressDetector::new(Box::new(tcp), Box::new(ClientStateAddressDetector::new(client_state.clone())))
				.with_span(tracing::info_span!("game_detector")),
		);

		let game = build_tracker(config.kind, &config, game_detector.clone(), Some(packets.clone()))?;
		let routes = match route_paths {
			Some((route, sys)) => ProcRouteTable::with_paths(route, sys),
			None => ProcRouteTable::new(),
		};
		let gateway = build_gateway_tracker(&config, game_detector.clone(), Box::new(routes))?;

		let host = Self {
			config,
			client_state,
			packets,
			game_detector,
			game: RwLock::new(Arc::new(game)),
			gateway: Arc::new(gateway),
			publishers,
			forwarding: Mutex::new(Vec::new()),
		};
		host.attach_forwarding(&host.game.read());
		Ok(host)
	}

	pub fn start(&self) -> Result<()> {
		self.game.read().start()?;
		self.gateway.start()?;
		info!(kind = %self.config.kind, "ping host started");
		Ok(())
	}

	/// Replace the game tracker with one of `kind`. The old tracker is
	/// disposed before the new one starts; forwarding moves with it.
	///
	/// The new tracker starts only if the old one was running. Every
	/// precondition is checked before the old tracker is touched, so an
	/// error leaves it running.
	pub fn switch_kind(&self, kind: TrackerKind) -> Result<Arc<Tracker>> {
		let next = Arc::new(build_tracker(kind, &self.config, self.game_detector.clone(), Some(self.packets.clone()))?);
		let mut game = self.game.write();
		let running = game.state() == TrackerState::Running;
		if running {
			tokio::runtime::Handle::try_current()
				.map_err(|e| Error::lifecycle(format!("cannot switch to {kind} outside a tokio runtime: {e}")))?;
		}
		next.set_verbose(game.verbose());

		for id in self.forwarding.lock().drain(..) {
			game.unsubscribe(id);
		}
		game.dispose();
		self.attach_forwarding(&next);
		let previous = std::mem::replace(&mut *game, next.clone());
		info!(from = previous.name(), to = next.name(), "switched game tracker");
		if running {
			// the replacement stays installed either way; a later `start` revives it
			next.start()?;
		}
		Ok(next)
	}

	pub fn game_tracker(&self) -> Arc<Tracker> { self.game.read().clone() }
	pub fn gateway_tracker(&self) -> Arc<Tracker> { self.gateway.clone() }
	pub fn game_detector(&self) -> &Arc<AggregateAddressDetector> { &self.game_detector }

	/// Feed for the client-state fallback detector.
	pub fn client_state(&self) -> &ClientState { &self.client_state }

	/// Feed for the packet-timing sampler.
	pub fn packets(&self) -> &PacketObserver { &self.packets }

	/// Dispose both trackers and wait up to `max_wait` per loop for them to exit.
	pub async fn shutdown(&self, max_wait: Duration) {
		let game = self.game_tracker();
		self.gateway.dispose();
		game.dispose();
		self.gateway.wait_terminated(max_wait).await;
		game.wait_terminated(max_wait).await;
		info!("ping host stopped");
	}

	fn attach_forwarding(&self, tracker: &Tracker) {
		let mut forwarding = self.forwarding.lock();
		for publisher in &self.publishers {
			forwarding.push(forward_to(tracker, publisher.clone()));
		}
	}
}

impl Drop for PingHost {
	fn drop(&mut self) {
		self.gateway.dispose();
		self.game.read().dispose();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::publish::BroadcastPublisher;

	fn options(dir: &tempfile::TempDir) -> HostOptions {
		let tcp = dir.path().join("tcp");
		std::fs::write(
			&tcp,
			"  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n",
		)
		.unwrap();
		HostOptions {
			config: TrackerConfig::default(),
			tcp_table_path: Some(tcp),
			route_paths: Some((dir.path().join("route"), dir.path().join("net"))),
			publishers: vec![Arc::new(BroadcastPublisher::new(4))],
		}
	}

	#[tokio::test]
	async fn switching_disposes_old_and_moves_forwarding() {
		let dir = tempfile::tempdir().unwrap();
		let host = PingHost::new(options(&dir)).unwrap();
		host.start().unwrap();
		let old = host.game_tracker();
		assert_eq!(old.state(), TrackerState::Running);

		let next = host.switch_kind(TrackerKind::Connect).unwrap();
		assert_eq!(old.state(), TrackerState::Disposed);
		assert_eq!(next.state(), TrackerState::Running);
		assert_eq!(next.name(), "game:connect");
		assert!(Arc::ptr_eq(&next, &host.game_tracker()));
		assert_eq!(host.forwarding.lock().len(), 1);

		host.shutdown(Duration::from_secs(1)).await;
		assert_eq!(host.gateway_tracker().state(), TrackerState::Disposed);
		assert_eq!(host.game_tracker().state(), TrackerState::Disposed);
	}

	#[test]
	fn failed_switch_keeps_old_tracker_running() {
		let dir = tempfile::tempdir().unwrap();
		let rt = tokio::runtime::Runtime::new().unwrap();
		let host = PingHost::new(options(&dir)).unwrap();
		{
			let _guard = rt.enter();
			host.start().unwrap();
		}
		let old = host.game_tracker();

		assert!(matches!(host.switch_kind(TrackerKind::Connect), Err(Error::Lifecycle(_))));
		assert_eq!(old.state(), TrackerState::Running);
		assert!(Arc::ptr_eq(&old, &host.game_tracker()));
		assert_eq!(host.forwarding.lock().len(), 1);

		rt.block_on(host.shutdown(Duration::from_secs(1)));
		assert_eq!(old.state(), TrackerState::Disposed);
	}

	#[tokio::test]
	async fn switching_a_stopped_host_leaves_replacement_stopped() {
		let dir = tempfile::tempdir().unwrap();
		let host = PingHost::new(options(&dir)).unwrap();
		let next = host.switch_kind(TrackerKind::Echo).unwrap();
		assert_eq!(next.state(), TrackerState::Stopped);
		host.start().unwrap();
		assert_eq!(host.game_tracker().state(), TrackerState::Running);
		host.shutdown(Duration::from_secs(1)).await;
	}

	#[tokio::test]
	async fn client_state_feeds_the_shared_detector() {
		let dir = tempfile::tempdir().unwrap();
		let host = PingHost::new(options(&dir)).unwrap();
		host.client_state().set_server_address(Some("198.51.100.7".parse().unwrap()));
		assert!(host.game_tracker().refresh_tick());
		assert_eq!(host.game_tracker().address(), "198.51.100.7".parse::<std::net::IpAddr>().unwrap());
		assert_eq!(host.game_detector().address(), host.game_tracker().address());
	}
}
