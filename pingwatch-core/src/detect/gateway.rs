//! First-hop gateway resolution.
//!
//! Echo requests to the game server itself are often blocked or rate
//! limited, while the first-hop gateway is reliably reachable. Resolving it
//! means asking which local interface would carry traffic to the server and
//! then reading that interface's gateway, rather than assuming a single
//! default route.

use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, Span};

use super::aggregate::AggregateAddressDetector;
use super::{is_unset, AddressDetector, UNSET_ADDRESS};
use crate::error::DetectError;

const DEFAULT_ROUTE_TABLE: &str = "/proc/net/route";
const DEFAULT_SYS_CLASS_NET: &str = "/sys/class/net";
const RTF_UP: u16 = 0x0001;
const RTF_GATEWAY: u16 = 0x0002;

/// A local network interface as seen by the routing layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
	pub index: u32,
	pub name: String,
	pub ipv4: bool,
	pub gateway: Option<IpAddr>,
}

/// OS routing-table boundary.
pub trait RouteTable: Send + Sync {
	/// Index of the interface that would carry traffic to `destination`.
	fn best_interface(&self, destination: Ipv4Addr) -> Result<u32, DetectError>;

	fn interfaces(&self) -> Result<Vec<InterfaceInfo>, DetectError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RouteEntry {
	iface: String,
	destination: Ipv4Addr,
	gateway: Ipv4Addr,
	flags: u16,
	metric: u32,
	mask: Ipv4Addr,
}

impl RouteEntry {
	fn covers(&self, addr: Ipv4Addr) -> bool {
		let mask = u32::from(self.mask);
		u32::from(addr) & mask == u32::from(self.destination) & mask
	}

	fn prefix_len(&self) -> u32 { u32::from(self.mask).count_ones() }
}

/// Linux routing table read from `/proc/net/route`, with interface indices
/// taken from `/sys/class/net/<iface>/ifindex`.
#[derive(Debug, Clone)]
pub struct ProcRouteTable {
	route_path: PathBuf,
	sys_class_net: PathBuf,
}

impl Default for ProcRouteTable {
	fn default() -> Self { Self::with_paths(DEFAULT_ROUTE_TABLE, DEFAULT_SYS_CLASS_NET) }
}

impl ProcRouteTable {
	pub fn new() -> Self { Self::default() }

	pub fn with_paths(route_path: impl Into<PathBuf>, sys_class_net: impl Into<PathBuf>) -> Self {
		Self { route_path: route_path.into(), sys_class_net: sys_class_net.into() }
	}

	fn routes(&self) -> Result<Vec<RouteEntry>, DetectError> {
		let data = fs::read_to_string(&self.route_path)?;
		let mut lines = data.lines();
		match lines.next() {
			Some(header) if header.starts_with("Iface") => {}
			_ => return Err(DetectError::Malformed(format!("{} has no header row", self.route_path.display()))),
		}
		Ok(lines.filter_map(parse_route_line).collect())
	}

	fn if_index(&self, iface: &str) -> Result<u32, DetectError> {
		let raw = fs::read_to_string(self.sys_class_net.join(iface).join("ifindex"))?;
		raw.trim()
			.parse()
			.map_err(|e| DetectError::Malformed(format!("ifindex for {iface}: {e}")))
	}
}

impl RouteTable for ProcRouteTable {
	fn best_interface(&self, destination: Ipv4Addr) -> Result<u32, DetectError> {
		let routes = self.routes()?;
		let best = routes
			.iter()
			.filter(|r| r.flags & RTF_UP != 0 && r.covers(destination))
			.max_by(|a, b| a.prefix_len().cmp(&b.prefix_len()).then(b.metric.cmp(&a.metric)))
			.ok_or_else(|| DetectError::NoRoute(destination.to_string()))?;
		self.if_index(&best.iface)
	}

	fn interfaces(&self) -> Result<Vec<InterfaceInfo>, DetectError> {
		let routes = self.routes()?;
		let mut out: Vec<InterfaceInfo> = Vec::new();
		for route in &routes {
			if out.iter().any(|i| i.name == route.iface) {
				continue;
			}
			let index = match self.if_index(&route.iface) {
				Ok(i) => i,
				Err(e) => {
					debug!(iface = %route.iface, error = %e, "skipping interface without index");
					continue;
				}
			};
			// Prefer the default route's gateway, then any gateway route on the interface.
			let gateway = routes
				.iter()
				.filter(|r| r.iface == route.iface && r.flags & RTF_GATEWAY != 0 && !r.gateway.is_unspecified())
				.min_by_key(|r| (r.prefix_len(), r.metric))
				.map(|r| IpAddr::V4(r.gateway));
			out.push(InterfaceInfo { index, name: route.iface.clone(), ipv4: true, gateway });
		}
		Ok(out)
	}
}

fn parse_route_line(line: &str) -> Option<RouteEntry> {
	let fields: Vec<&str> = line.split_whitespace().collect();
	if fields.len() < 8 {
		return None;
	}
	let hex_addr = |s: &str| u32::from_str_radix(s, 16).ok().map(|v| Ipv4Addr::from(v.to_ne_bytes()));
	Some(RouteEntry {
		iface: fields[0].to_string(),
		destination: hex_addr(fields[1])?,
		gateway: hex_addr(fields[2])?,
		flags: u16::from_str_radix(fields[3], 16).ok()?,
		metric: fields[6].parse().ok()?,
		mask: hex_addr(fields[7])?,
	})
}

/// Translates a destination into the gateway of the interface that reaches it.
pub struct GatewayResolver {
	routes: Box<dyn RouteTable>,
	span: Span,
}

impl GatewayResolver {
	pub fn new(routes: Box<dyn RouteTable>) -> Self { Self { routes, span: Span::current() } }

	pub fn with_span(mut self, span: Span) -> Self {
		self.span = span;
		self
	}

	/// Returns [`UNSET_ADDRESS`] when the destination is not IPv4, the
	/// interface lookup fails, or the matching interface has no gateway.
	pub fn resolve(&self, destination: IpAddr, verbose: bool) -> IpAddr {
		let _enter = self.span.enter();
		let IpAddr::V4(dest) = destination else {
			debug!(%destination, "gateway resolution only supports IPv4 destinations");
			return UNSET_ADDRESS;
		};
		let index = match self.routes.best_interface(dest) {
			Ok(i) => i,
			Err(e) => {
				debug!(%destination, error = %e, "no egress interface for destination");
				return UNSET_ADDRESS;
			}
		};
		let interfaces = match self.routes.interfaces() {
			Ok(list) => list,
			Err(e) => {
				debug!(error = %e, "interface enumeration failed");
				return UNSET_ADDRESS;
			}
		};
		let gateway = interfaces
			.into_iter()
			.filter(|i| i.index == index && i.ipv4)
			.find_map(|i| i.gateway);
		match gateway {
			Some(gw) => {
				if verbose && !is_unset(&gw) {
					info!(%destination, gateway = %gw, interface = index, "detected gateway for server");
				}
				gw
			}
			None => UNSET_ADDRESS,
		}
	}
}

/// Follows the game server address to its first-hop gateway.
pub struct GatewayAddressDetector {
	game: Arc<AggregateAddressDetector>,
	resolver: GatewayResolver,
}

impl GatewayAddressDetector {
	pub fn new(game: Arc<AggregateAddressDetector>, resolver: GatewayResolver) -> Self { Self { game, resolver } }
}

impl AddressDetector for GatewayAddressDetector {
	fn name(&self) -> &'static str { "gateway" }

	fn detect(&self, verbose: bool) -> Result<IpAddr, DetectError> {
		let server = self.game.get_address(verbose);
		if is_unset(&server) {
			return Ok(UNSET_ADDRESS);
		}
		Ok(self.resolver.resolve(server, verbose))
	}
}
