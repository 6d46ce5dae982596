use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pingwatch_core::detect::client_state::{ClientState, ClientStateAddressDetector};
use pingwatch_core::{
	forward_to, BroadcastPublisher, Error, Rtt, RttSampler, SampleError, SampleOutcome, SnapshotPublisher, Tracker,
	TrackerConfig, TrackerSnapshot,
};

struct Constant(u64);

#[async_trait]
impl RttSampler for Constant {
	fn name(&self) -> &'static str { "constant" }
	async fn sample(&self, _address: IpAddr) -> Result<Rtt, SampleError> { Ok(Rtt::from_millis(self.0)) }
}

struct Broken;

impl SnapshotPublisher for Broken {
	fn name(&self) -> &'static str { "broken" }
	fn publish(&self, _snapshot: &TrackerSnapshot) -> pingwatch_core::Result<()> { Err(Error::publish("pipe closed")) }
}

fn tracker(rtt: u64) -> Tracker {
	let state = ClientState::new();
	state.set_server_address(Some("198.51.100.20".parse().unwrap()));
	let detector = Arc::new(ClientStateAddressDetector::new(state));
	let t = Tracker::new("game", &TrackerConfig::default(), detector, Arc::new(Constant(rtt))).unwrap();
	assert!(t.refresh_tick());
	t
}

#[tokio::test]
async fn snapshots_reach_udp_listener_as_json() {
	let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
	listener.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
	let publisher = Arc::new(pingwatch_core::UdpJsonPublisher::bind(listener.local_addr().unwrap()).unwrap());

	let t = tracker(25);
	forward_to(&t, publisher);
	t.sample_tick().await;
	t.sample_tick().await;

	let mut buf = [0u8; 128];
	let first = listener.recv(&mut buf).unwrap();
	assert_eq!(&buf[..first], br#"{"LastRTT":25,"AverageRTT":0}"#);
	let second = listener.recv(&mut buf).unwrap();
	assert_eq!(&buf[..second], br#"{"LastRTT":25,"AverageRTT":25}"#);
}

#[tokio::test]
async fn failing_publisher_does_not_disturb_sampling() {
	let t = tracker(8);
	let broadcast = BroadcastPublisher::new(4);
	let mut rx = broadcast.subscribe();
	forward_to(&t, Arc::new(Broken));
	forward_to(&t, Arc::new(broadcast));

	assert!(matches!(t.sample_tick().await, SampleOutcome::Recorded(_)));
	assert!(!t.errored());
	assert_eq!(rx.recv().await.unwrap(), TrackerSnapshot { last_rtt: 8, average_rtt: 0 });
}
