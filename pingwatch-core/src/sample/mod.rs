//! Round-trip time samplers.

use std::net::IpAddr;

use async_trait::async_trait;

use crate::error::SampleError;

pub mod aggregate;
pub mod connect;
pub mod echo;
pub mod packets;

/// One completed measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rtt {
	pub millis: u64,
	/// Hops travelled by the reply, when the socket exposes it.
	pub hops: Option<u8>,
}

impl Rtt {
	pub const fn from_millis(millis: u64) -> Self { Self { millis, hops: None } }
}

/// One way of measuring latency to an address.
///
/// Implementations must bound their own run time (a probe timeout shorter
/// than the sampling interval). Errors are transient misses unless
/// [`SampleError::is_permanent`] says otherwise.
#[async_trait]
pub trait RttSampler: Send + Sync {
	fn name(&self) -> &'static str;

	async fn sample(&self, address: IpAddr) -> Result<Rtt, SampleError>;
}

#[async_trait]
impl<T: RttSampler + ?Sized> RttSampler for std::sync::Arc<T> {
	fn name(&self) -> &'static str { (**self).name() }

	async fn sample(&self, address: IpAddr) -> Result<Rtt, SampleError> { (**self).sample(address).await }
}
