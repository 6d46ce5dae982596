use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{AddressDetector, UNSET_ADDRESS};
use crate::error::DetectError;

/// Server address as reported by the game client, updated by the host.
#[derive(Debug, Clone, Default)]
pub struct ClientState {
	server: Arc<RwLock<Option<IpAddr>>>,
}

impl ClientState {
	pub fn new() -> Self { Self::default() }

	pub fn set_server_address(&self, addr: Option<IpAddr>) { *self.server.write() = addr; }

	pub fn server_address(&self) -> Option<IpAddr> { *self.server.read() }
}

/// Reads the address the host last reported. Always available, never fails.
#[derive(Debug, Clone)]
pub struct ClientStateAddressDetector {
	state: ClientState,
}

impl ClientStateAddressDetector {
	pub fn new(state: ClientState) -> Self { Self { state } }
}

impl AddressDetector for ClientStateAddressDetector {
	fn name(&self) -> &'static str { "client_state" }

	fn detect(&self, _verbose: bool) -> Result<IpAddr, DetectError> {
		Ok(self.state.server_address().unwrap_or(UNSET_ADDRESS))
	}
}
