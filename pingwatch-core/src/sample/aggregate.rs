use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, error};

use super::{Rtt, RttSampler};
use crate::error::SampleError;

struct Slot {
	sampler: Box<dyn RttSampler>,
	failed: AtomicBool,
}

/// Races several samplers and keeps the first successful measurement.
///
/// A strategy that fails permanently (e.g. missing privilege) is skipped
/// from then on. Once every strategy is disabled the aggregate itself
/// reports a permanent failure.
pub struct AggregateSampler {
	slots: Vec<Slot>,
	deadline: Duration,
}

impl AggregateSampler {
	pub fn new(samplers: Vec<Box<dyn RttSampler>>, deadline: Duration) -> Self {
		let slots = samplers.into_iter().map(|sampler| Slot { sampler, failed: AtomicBool::new(false) }).collect();
		Self { slots, deadline }
	}

	pub fn is_failed(&self, index: usize) -> bool {
		self.slots.get(index).is_some_and(|s| s.failed.load(Ordering::Acquire))
	}

	fn all_failed(&self) -> bool { self.slots.iter().all(|s| s.failed.load(Ordering::Acquire)) }

	pub fn len(&self) -> usize { self.slots.len() }
	pub fn is_empty(&self) -> bool { self.slots.is_empty() }
}

#[async_trait]
impl RttSampler for AggregateSampler {
	fn name(&self) -> &'static str { "aggregate" }

	async fn sample(&self, address: IpAddr) -> Result<Rtt, SampleError> {
		let mut racing: FuturesUnordered<_> = self
			.slots
			.iter()
			.filter(|slot| !slot.failed.load(Ordering::Acquire))
			.map(|slot| async move { (slot, slot.sampler.sample(address).await) })
			.collect();

		let race = async {
			while let Some((slot, result)) = racing.next().await {
				match result {
					Ok(rtt) => return Some(rtt),
					Err(e) if e.is_permanent() => {
						if !slot.failed.swap(true, Ordering::AcqRel) {
							error!(sampler = slot.sampler.name(), error = %e, "sampler failed permanently, disabling it");
						}
					}
					Err(e) => debug!(sampler = slot.sampler.name(), error = %e, "sampler missed"),
				}
			}
			None
		};

		match tokio::time::timeout(self.deadline, race).await {
			Ok(Some(rtt)) => Ok(rtt),
			_ if self.all_failed() => Err(SampleError::Permanent("every sampling strategy is disabled".into())),
			Ok(None) | Err(_) => Err(SampleError::AllFailed),
		}
	}
}
