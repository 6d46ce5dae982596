//! Maps a requested [`TrackerKind`] onto a concrete detector/sampler pairing.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::TrackerConfig;
use crate::detect::aggregate::AggregateAddressDetector;
use crate::detect::gateway::{GatewayAddressDetector, GatewayResolver, RouteTable};
use crate::detect::AddressDetector;
use crate::error::{Error, Result};
use crate::sample::aggregate::AggregateSampler;
use crate::sample::connect::TcpConnectSampler;
use crate::sample::echo::IcmpEchoSampler;
use crate::sample::packets::{PacketObserver, PacketTimingSampler};
use crate::sample::RttSampler;
use crate::tracker::Tracker;

/// Sampling strategy for the game tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
	/// Race every available sampler.
	#[default]
	Aggregate,
	Echo,
	Connect,
	/// Passive timing of the client's own packets; needs a [`PacketObserver`].
	Packets,
}

impl TrackerKind {
	pub const ALL: [TrackerKind; 4] = [Self::Aggregate, Self::Echo, Self::Connect, Self::Packets];

	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Aggregate => "aggregate",
			Self::Echo => "echo",
			Self::Connect => "connect",
			Self::Packets => "packets",
		}
	}
}

impl fmt::Display for TrackerKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tracker kind '{0}' (expected aggregate, echo, connect or packets)")]
pub struct ParseKindError(String);

impl FromStr for TrackerKind {
	type Err = ParseKindError;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"aggregate" | "auto" => Ok(Self::Aggregate),
			"echo" | "icmp" => Ok(Self::Echo),
			"connect" | "tcp" => Ok(Self::Connect),
			"packets" | "packet" => Ok(Self::Packets),
			other => Err(ParseKindError(other.to_string())),
		}
	}
}

/// Build the game tracker for `kind`. The tracker is returned stopped.
pub fn build_tracker(
	kind: TrackerKind,
	config: &TrackerConfig,
	detector: Arc<dyn AddressDetector>,
	packets: Option<PacketObserver>,
) -> Result<Tracker> {
	let sampler: Arc<dyn RttSampler> = match kind {
		TrackerKind::Echo => Arc::new(echo_sampler(config)),
		TrackerKind::Connect => Arc::new(connect_sampler(config)),
		TrackerKind::Packets => {
			let observer =
				packets.ok_or_else(|| Error::construction("packets tracker requires a packet observer from the host"))?;
			Arc::new(PacketTimingSampler::new(observer))
		}
		TrackerKind::Aggregate => {
			let mut samplers: Vec<Box<dyn RttSampler>> =
				vec![Box::new(echo_sampler(config)), Box::new(connect_sampler(config))];
			if let Some(observer) = packets {
				samplers.push(Box::new(PacketTimingSampler::new(observer)));
			}
			Arc::new(AggregateSampler::new(samplers, config.probe_timeout()))
		}
	};
	Tracker::new(format!("game:{kind}"), config, detector, sampler)
}

/// Build the tracker that follows the game server's first-hop gateway.
pub fn build_gateway_tracker(
	config: &TrackerConfig,
	game: Arc<AggregateAddressDetector>,
	routes: Box<dyn RouteTable>,
) -> Result<Tracker> {
	let resolver = GatewayResolver::new(routes).with_span(tracing::info_span!("gateway_resolver"));
	let detector = Arc::new(GatewayAddressDetector::new(game, resolver));
	Tracker::new("gateway", config, detector, Arc::new(echo_sampler(config)))
}

fn echo_sampler(config: &TrackerConfig) -> IcmpEchoSampler { IcmpEchoSampler::new(config.probe_timeout(), config.hop_limit) }

fn connect_sampler(config: &TrackerConfig) -> TcpConnectSampler {
	TcpConnectSampler::new(config.connect_port, config.probe_timeout())
}
