//! Periodic latency tracker.
//!
//! A [`Tracker`] pairs one [`AddressDetector`] with one [`RttSampler`] and
//! runs two independent loops once started:
//! - sampling: probe the current address, update the window, publish a snapshot
//! - refresh: re-resolve the address and discard history when it changes
//!
//! Both loops stop at their next tick boundary after [`Tracker::dispose`].

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::config::TrackerConfig;
use crate::detect::{is_unset, AddressDetector, UNSET_ADDRESS};
use crate::error::{Error, Result};
use crate::sample::RttSampler;
use crate::subscribers::{Subscribers, SubscriptionId};
use crate::window::SlidingWindow;

/// Published after every successful sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerSnapshot {
	#[serde(rename = "LastRTT")]
	pub last_rtt: u64,
	#[serde(rename = "AverageRTT")]
	pub average_rtt: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
	Stopped,
	Running,
	/// Terminal; a disposed tracker cannot be restarted.
	Disposed,
}

/// Result of a single sampling tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
	Recorded(TrackerSnapshot),
	/// The probe failed; the window was left untouched.
	Missed,
	/// No address resolved yet.
	NoAddress,
	/// The address changed while the probe was in flight; the sample was dropped.
	Stale,
	/// The sampler failed permanently and is not called again.
	Disabled,
	Cancelled,
}

#[derive(Debug)]
struct Measurements {
	window: SlidingWindow,
	last_rtt: u64,
	average: f64,
	address: IpAddr,
	/// Bumped on every address change so in-flight samples can detect it.
	generation: u64,
}

impl Measurements {
	fn snapshot(&self) -> TrackerSnapshot {
		TrackerSnapshot { last_rtt: self.last_rtt, average_rtt: self.average.round() as u64 }
	}
}

struct Inner {
	name: String,
	sample_interval: Duration,
	refresh_interval: Duration,
	detector: Arc<dyn AddressDetector>,
	sampler: Arc<dyn RttSampler>,
	measurements: Mutex<Measurements>,
	verbose: AtomicBool,
	errored: AtomicBool,
	reset: AtomicBool,
	/// Latched when the sampler reports a permanent failure.
	sampler_disabled: AtomicBool,
	subscribers: Subscribers<TrackerSnapshot>,
	/// Held across the final cancellation check and publication, and by
	/// `dispose`, so no snapshot is published once `dispose` returns.
	/// Reentrant so a subscriber may dispose its own tracker.
	publish_gate: ReentrantMutex<()>,
	cancel: CancellationToken,
	span: Span,
}

pub struct Tracker {
	inner: Arc<Inner>,
	state: Mutex<TrackerState>,
	tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Tracker {
	/// Build a stopped tracker. No background work starts until [`start`](Self::start).
	pub fn new(
		name: impl Into<String>,
		config: &TrackerConfig,
		detector: Arc<dyn AddressDetector>,
		sampler: Arc<dyn RttSampler>,
	) -> Result<Self> {
		config.validate()?;
		let name = name.into();
		let span = tracing::info_span!("tracker", name = %name);
		let inner = Inner {
			sample_interval: config.sample_interval(),
			refresh_interval: config.refresh_interval(),
			detector,
			sampler,
			measurements: Mutex::new(Measurements {
				window: SlidingWindow::new(config.window_capacity),
				last_rtt: 0,
				average: 0.0,
				address: UNSET_ADDRESS,
				generation: 0,
			}),
			verbose: AtomicBool::new(config.verbose),
			errored: AtomicBool::new(false),
			reset: AtomicBool::new(false),
			sampler_disabled: AtomicBool::new(false),
			subscribers: Subscribers::new(),
			publish_gate: ReentrantMutex::new(()),
			cancel: CancellationToken::new(),
			span,
			name,
		};
		Ok(Self { inner: Arc::new(inner), state: Mutex::new(TrackerState::Stopped), tasks: Mutex::new(Vec::new()) })
	}

	/// Spawn the sampling and refresh loops on the current tokio runtime.
	/// Starting a running tracker is a no-op; starting a disposed one fails.
	pub fn start(&self) -> Result<()> {
		let mut state = self.state.lock();
		match *state {
			TrackerState::Running => return Ok(()),
			TrackerState::Disposed => return Err(Error::lifecycle(format!("tracker {} is disposed", self.inner.name))),
			TrackerState::Stopped => {}
		}
		let handle = tokio::runtime::Handle::try_current()
			.map_err(|e| Error::lifecycle(format!("tracker {} needs a tokio runtime: {e}", self.inner.name)))?;

		let span = self.inner.span.clone();
		let sampling = handle.spawn(self.inner.clone().sampling_loop().instrument(span.clone()));
		let refresh = handle.spawn(self.inner.clone().refresh_loop().instrument(span.clone()));
		self.tasks.lock().extend([sampling, refresh]);
		*state = TrackerState::Running;
		span.in_scope(|| {
			info!(
				sampler = self.inner.sampler.name(),
				detector = self.inner.detector.name(),
				"tracker started"
			)
		});
		Ok(())
	}

	/// Stop both loops. Idempotent. Waits for a publication already in
	/// progress on another thread; nothing is published after this returns.
	pub fn dispose(&self) {
		{
			let mut state = self.state.lock();
			if *state == TrackerState::Disposed {
				return;
			}
			*state = TrackerState::Disposed;
		}
		let _gate = self.inner.publish_gate.lock();
		self.inner.cancel.cancel();
		self.inner.span.in_scope(|| info!("tracker disposed"));
	}

	/// Wait for the background loops to exit after [`dispose`](Self::dispose).
	pub async fn wait_terminated(&self, max_wait: Duration) {
		let handles = std::mem::take(&mut *self.tasks.lock());
		for h in handles {
			if tokio::time::timeout(max_wait, h).await.is_err() {
				self.inner.span.in_scope(|| warn!(?max_wait, "tracker loop did not stop in time"));
			}
		}
	}

	pub fn state(&self) -> TrackerState { *self.state.lock() }
	pub fn name(&self) -> &str { &self.inner.name }

	pub fn subscribe(&self, callback: impl Fn(&TrackerSnapshot) + Send + Sync + 'static) -> SubscriptionId {
		self.inner.subscribers.subscribe(callback)
	}

	pub fn unsubscribe(&self, id: SubscriptionId) -> bool { self.inner.subscribers.unsubscribe(id) }

	pub fn errored(&self) -> bool { self.inner.errored.load(Ordering::Acquire) }
	pub fn reset(&self) -> bool { self.inner.reset.load(Ordering::Acquire) }
	pub fn verbose(&self) -> bool { self.inner.verbose.load(Ordering::Relaxed) }
	pub fn set_verbose(&self, verbose: bool) { self.inner.verbose.store(verbose, Ordering::Relaxed) }
	pub fn address(&self) -> IpAddr { self.inner.measurements.lock().address }
	pub fn last_rtt(&self) -> u64 { self.inner.measurements.lock().last_rtt }
	pub fn average_rtt(&self) -> f64 { self.inner.measurements.lock().average }
	pub fn snapshot(&self) -> TrackerSnapshot { self.inner.measurements.lock().snapshot() }

	/// Copy of the current window, oldest first.
	pub fn history(&self) -> Vec<u64> { self.inner.measurements.lock().window.to_vec() }

	/// Run one sampling tick now. The sampling loop calls the same code.
	pub async fn sample_tick(&self) -> SampleOutcome {
		self.inner.sample_tick().instrument(self.inner.span.clone()).await
	}

	/// Whether the sampler has been disabled after a permanent failure.
	pub fn sampler_disabled(&self) -> bool { self.inner.sampler_disabled.load(Ordering::Acquire) }

	/// Run one address refresh now; returns whether the address changed.
	/// Detectors read OS tables synchronously; the refresh loop runs this on
	/// the blocking pool.
	pub fn refresh_tick(&self) -> bool { self.inner.span.in_scope(|| self.inner.refresh_tick()) }
}

impl Drop for Tracker {
	fn drop(&mut self) { self.inner.cancel.cancel(); }
}

impl Inner {
	async fn sampling_loop(self: Arc<Self>) {
		let mut ticker = tokio::time::interval(self.sample_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				biased;
				_ = self.cancel.cancelled() => break,
				_ = ticker.tick() => {}
			}
			self.sample_tick().await;
		}
		debug!("sampling loop stopped");
	}

	async fn refresh_loop(self: Arc<Self>) {
		let mut ticker = tokio::time::interval(self.refresh_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				biased;
				_ = self.cancel.cancelled() => break,
				_ = ticker.tick() => {}
			}
			let inner = self.clone();
			let span = Span::current();
			if let Err(e) = tokio::task::spawn_blocking(move || span.in_scope(|| inner.refresh_tick())).await {
				error!(error = %e, "address refresh task failed");
			}
		}
		debug!("refresh loop stopped");
	}

	async fn sample_tick(&self) -> SampleOutcome {
		if self.cancel.is_cancelled() {
			return SampleOutcome::Cancelled;
		}
		let (address, generation) = {
			let m = self.measurements.lock();
			(m.address, m.generation)
		};
		if is_unset(&address) {
			return SampleOutcome::NoAddress;
		}
		if self.sampler_disabled.load(Ordering::Acquire) {
			return SampleOutcome::Disabled;
		}

		let result = self.sampler.sample(address).await;
		if self.cancel.is_cancelled() {
			return SampleOutcome::Cancelled;
		}

		match result {
			Ok(rtt) => {
				let snapshot = {
					let mut m = self.measurements.lock();
					if m.generation != generation {
						debug!(%address, "address changed during probe, dropping sample");
						return SampleOutcome::Stale;
					}
					m.window.push(rtt.millis);
					m.average = m.window.average();
					m.last_rtt = rtt.millis;
					m.snapshot()
				};
				self.errored.store(false, Ordering::Release);
				let _gate = self.publish_gate.lock();
				if self.cancel.is_cancelled() {
					return SampleOutcome::Cancelled;
				}
				self.subscribers.publish(&snapshot);
				SampleOutcome::Recorded(snapshot)
			}
			Err(e) if e.is_permanent() => {
				self.errored.store(true, Ordering::Release);
				if !self.sampler_disabled.swap(true, Ordering::AcqRel) {
					error!(%address, sampler = self.sampler.name(), error = %e, "sampler failed permanently, sampling disabled");
				}
				SampleOutcome::Disabled
			}
			Err(e) => {
				self.errored.store(true, Ordering::Release);
				warn!(%address, sampler = self.sampler.name(), error = %e, "ping failed, this may be temporary");
				SampleOutcome::Missed
			}
		}
	}

	fn refresh_tick(&self) -> bool {
		if self.cancel.is_cancelled() {
			return false;
		}
		let verbose = self.verbose.load(Ordering::Relaxed);
		let next = match self.detector.detect(verbose) {
			Ok(addr) => addr,
			Err(e) => {
				// keep the previous address; a broken detector is not a path change
				error!(detector = self.detector.name(), error = %e, "address detection failed");
				self.reset.store(false, Ordering::Release);
				return false;
			}
		};

		let mut m = self.measurements.lock();
		if next == m.address {
			self.reset.store(false, Ordering::Release);
			return false;
		}
		let previous = std::mem::replace(&mut m.address, next);
		m.generation += 1;
		m.window.clear();
		m.average = 0.0;
		m.last_rtt = 0;
		self.reset.store(true, Ordering::Release);
		drop(m);
		if verbose {
			info!(%previous, address = %next, "target address changed, latency history cleared");
		}
		true
	}
}
