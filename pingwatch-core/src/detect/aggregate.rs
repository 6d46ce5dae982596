use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{error, info, Span};

use super::{is_unset, AddressDetector, UNSET_ADDRESS};
use crate::error::DetectError;

/// What happens to a strategy after it returns an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
	/// Disable the strategy for the lifetime of the detector.
	Sticky,
	/// Log and keep trying on every call.
	Retry,
}

struct Strategy {
	detector: Box<dyn AddressDetector>,
	policy: FailurePolicy,
	failed: AtomicBool,
}

/// Priority chain of detection strategies.
///
/// Strategies are tried in order until one yields a non-sentinel address.
/// The detector caches the last resolved value so callers can always read
/// the last known address.
pub struct AggregateAddressDetector {
	strategies: Vec<Strategy>,
	current: RwLock<IpAddr>,
	span: Span,
}

impl AggregateAddressDetector {
	/// The usual pairing: a primary that is disabled on its first error and an
	/// always-available fallback.
	pub fn new(primary: Box<dyn AddressDetector>, fallback: Box<dyn AddressDetector>) -> Self {
		Self::with_strategies(vec![(primary, FailurePolicy::Sticky), (fallback, FailurePolicy::Retry)])
	}

	pub fn with_strategies(strategies: Vec<(Box<dyn AddressDetector>, FailurePolicy)>) -> Self {
		let strategies = strategies
			.into_iter()
			.map(|(detector, policy)| Strategy { detector, policy, failed: AtomicBool::new(false) })
			.collect();
		Self { strategies, current: RwLock::new(UNSET_ADDRESS), span: Span::current() }
	}

	/// Emit diagnostics inside `span` instead of the span current at construction.
	pub fn with_span(mut self, span: Span) -> Self {
		self.span = span;
		self
	}

	/// Resolve the address. Never fails; returns the sentinel when nothing was found.
	pub fn get_address(&self, verbose: bool) -> IpAddr {
		let _enter = self.span.enter();
		let mut resolved = UNSET_ADDRESS;
		let mut winner = None;

		for strategy in &self.strategies {
			if strategy.failed.load(Ordering::Acquire) {
				continue;
			}
			match strategy.detector.detect(verbose) {
				Ok(addr) if !is_unset(&addr) => {
					resolved = addr;
					winner = Some(strategy.detector.name());
					break;
				}
				Ok(_) => {}
				Err(e) => self.record_failure(strategy, &e),
			}
		}

		let previous = std::mem::replace(&mut *self.current.write(), resolved);
		if verbose && !is_unset(&resolved) && resolved != previous {
			info!(address = %resolved, detector = winner.unwrap_or("none"), "got new server address");
		}
		resolved
	}

	/// Last value produced by [`get_address`](Self::get_address).
	pub fn address(&self) -> IpAddr { *self.current.read() }

	/// Whether the strategy at `index` has been disabled.
	pub fn is_failed(&self, index: usize) -> bool {
		self.strategies.get(index).is_some_and(|s| s.failed.load(Ordering::Acquire))
	}

	fn record_failure(&self, strategy: &Strategy, e: &DetectError) {
		let name = strategy.detector.name();
		match strategy.policy {
			FailurePolicy::Sticky => {
				// swap guards against logging twice if two callers race here
				if !strategy.failed.swap(true, Ordering::AcqRel) {
					error!(detector = name, error = %e, "address detection failed, falling back to the next strategy");
				}
			}
			FailurePolicy::Retry => {
				error!(detector = name, error = %e, "address detection failed in an always-available strategy");
			}
		}
	}
}

impl AddressDetector for AggregateAddressDetector {
	fn name(&self) -> &'static str { "aggregate" }

	fn detect(&self, verbose: bool) -> Result<IpAddr, DetectError> { Ok(self.get_address(verbose)) }
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::AtomicUsize;
	use std::sync::Arc;
	use tracing_test::traced_test;

	struct Scripted {
		name: &'static str,
		calls: Arc<AtomicUsize>,
		script: Box<dyn Fn(usize) -> Result<IpAddr, DetectError> + Send + Sync>,
	}

	impl AddressDetector for Scripted {
		fn name(&self) -> &'static str { self.name }
		fn detect(&self, _verbose: bool) -> Result<IpAddr, DetectError> {
			let n = self.calls.fetch_add(1, Ordering::SeqCst);
			(self.script)(n)
		}
	}

	fn scripted(
		name: &'static str,
		script: impl Fn(usize) -> Result<IpAddr, DetectError> + Send + Sync + 'static,
	) -> (Box<dyn AddressDetector>, Arc<AtomicUsize>) {
		let calls = Arc::new(AtomicUsize::new(0));
		(Box::new(Scripted { name, calls: calls.clone(), script: Box::new(script) }), calls)
	}

	fn addr(s: &str) -> IpAddr { s.parse().unwrap() }

	#[traced_test]
	#[test]
	fn primary_error_is_sticky() {
		let (primary, primary_calls) =
			scripted("primary", |_| Err(DetectError::Unsupported("no connection table".into())));
		let (fallback, fallback_calls) = scripted("fallback", |_| Ok("198.51.100.20".parse().unwrap()));
		let det = AggregateAddressDetector::new(primary, fallback);

		for _ in 0..4 {
			assert_eq!(det.get_address(false), addr("198.51.100.20"));
		}
		assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
		assert_eq!(fallback_calls.load(Ordering::SeqCst), 4);
		assert!(det.is_failed(0));
		assert!(!det.is_failed(1));
		logs_assert(|lines: &[&str]| {
			match lines.iter().filter(|l| l.contains("falling back to the next strategy")).count() {
				1 => Ok(()),
				n => Err(format!("expected one fallback error, saw {n}")),
			}
		});
	}

	#[test]
	fn sentinel_from_primary_falls_through_without_disabling() {
		let (primary, primary_calls) = scripted("primary", |n| {
			if n == 0 { Ok(UNSET_ADDRESS) } else { Ok("192.0.2.50".parse().unwrap()) }
		});
		let (fallback, fallback_calls) = scripted("fallback", |_| Ok("198.51.100.20".parse().unwrap()));
		let det = AggregateAddressDetector::new(primary, fallback);

		assert_eq!(det.get_address(false), addr("198.51.100.20"));
		assert!(!det.is_failed(0));
		assert_eq!(det.get_address(false), addr("192.0.2.50"));
		assert_eq!(primary_calls.load(Ordering::SeqCst), 2);
		assert_eq!(fallback_calls.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn fallback_errors_never_disable_it() {
		let (primary, _) = scripted("primary", |_| Ok(UNSET_ADDRESS));
		let (fallback, fallback_calls) = scripted("fallback", |n| {
			if n < 2 { Err(DetectError::Malformed("flaky".into())) } else { Ok("203.0.113.1".parse().unwrap()) }
		});
		let det = AggregateAddressDetector::new(primary, fallback);

		assert_eq!(det.get_address(false), UNSET_ADDRESS);
		assert_eq!(det.get_address(false), UNSET_ADDRESS);
		assert_eq!(det.get_address(false), addr("203.0.113.1"));
		assert_eq!(fallback_calls.load(Ordering::SeqCst), 3);
		assert!(!det.is_failed(1));
	}

	#[test]
	fn caches_last_result_even_when_unset() {
		let (primary, _) = scripted("primary", |n| if n == 0 { Ok("192.0.2.9".parse().unwrap()) } else { Ok(UNSET_ADDRESS) });
		let (fallback, _) = scripted("fallback", |_| Ok(UNSET_ADDRESS));
		let det = AggregateAddressDetector::new(primary, fallback);
		assert_eq!(det.address(), UNSET_ADDRESS);
		det.get_address(false);
		assert_eq!(det.address(), addr("192.0.2.9"));
		det.get_address(false);
		assert_eq!(det.address(), UNSET_ADDRESS);
	}

	#[traced_test]
	#[test]
	fn verbose_names_winning_strategy_on_change() {
		let (primary, _) = scripted("tcp_table", |_| Ok("192.0.2.77".parse().unwrap()));
		let (fallback, _) = scripted("client_state", |_| Ok(UNSET_ADDRESS));
		let det = AggregateAddressDetector::new(primary, fallback);
		det.get_address(true);
		det.get_address(true);
		assert!(logs_contain("got new server address"));
		assert!(logs_contain("tcp_table"));
		logs_assert(|lines: &[&str]| {
			match lines.iter().filter(|l| l.contains("got new server address")).count() {
				1 => Ok(()),
				n => Err(format!("expected one change message, saw {n}")),
			}
		});
	}
}
