//! Address detection strategies.
//!
//! There is no direct way to ask which server the game client is talking to,
//! so several strategies of differing reliability are chained:
//! - [`tcp_table::TcpTableAddressDetector`]: reads the OS connection table
//! - [`client_state::ClientStateAddressDetector`]: reads what the host reports
//! - [`aggregate::AggregateAddressDetector`]: priority chain with sticky failure
//! - [`gateway::GatewayAddressDetector`]: first-hop gateway towards the server

use std::net::{IpAddr, Ipv4Addr};

use crate::error::DetectError;

pub mod aggregate;
pub mod client_state;
pub mod gateway;
pub mod tcp_table;

/// Sentinel meaning "no address resolved yet".
pub const UNSET_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub fn is_unset(addr: &IpAddr) -> bool { *addr == UNSET_ADDRESS }

/// One way of finding the current target address.
///
/// Returning [`UNSET_ADDRESS`] means "nothing found this time" and may succeed
/// on a later call. Returning an error means the mechanism itself is broken.
pub trait AddressDetector: Send + Sync {
	/// Short strategy name used in diagnostics.
	fn name(&self) -> &'static str;

	fn detect(&self, verbose: bool) -> Result<IpAddr, DetectError>;
}

impl<T: AddressDetector + ?Sized> AddressDetector for std::sync::Arc<T> {
	fn name(&self) -> &'static str { (**self).name() }
	fn detect(&self, verbose: bool) -> Result<IpAddr, DetectError> { (**self).detect(verbose) }
}
