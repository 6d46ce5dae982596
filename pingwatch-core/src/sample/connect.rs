use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;

use super::{Rtt, RttSampler};
use crate::error::SampleError;

/// Times a TCP handshake through the OS network stack.
///
/// Needs no privilege. A refused connection still measures a full round
/// trip (SYN out, RST back) and counts as a sample.
#[derive(Debug, Clone)]
pub struct TcpConnectSampler {
	port: u16,
	timeout: Duration,
}

impl TcpConnectSampler {
	pub fn new(port: u16, timeout: Duration) -> Self { Self { port, timeout } }
}

#[async_trait]
impl RttSampler for TcpConnectSampler {
	fn name(&self) -> &'static str { "tcp_connect" }

	async fn sample(&self, address: IpAddr) -> Result<Rtt, SampleError> {
		let target = SocketAddr::new(address, self.port);
		let started = Instant::now();
		match tokio::time::timeout(self.timeout, TcpStream::connect(target)).await {
			Err(_) => Err(SampleError::Timeout(self.timeout)),
			Ok(Ok(_stream)) => Ok(Rtt::from_millis(started.elapsed().as_millis() as u64)),
			Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
				Ok(Rtt::from_millis(started.elapsed().as_millis() as u64))
			}
			Ok(Err(e)) => Err(SampleError::from_io(e)),
		}
	}
}
