use std::collections::VecDeque;

/// Bounded FIFO of millisecond RTT samples.
///
/// Pushing past capacity evicts the oldest sample. The average is only
/// reported once at least two samples are held; a single sample is too
/// noisy to be meaningful and reads as 0.
#[derive(Debug, Clone)]
pub struct SlidingWindow {
	samples: VecDeque<u64>,
	capacity: usize,
}

impl SlidingWindow {
	/// A zero capacity is clamped to 1.
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(1);
		Self { samples: VecDeque::with_capacity(capacity), capacity }
	}

	pub fn push(&mut self, rtt_ms: u64) {
		while self.samples.len() >= self.capacity {
			self.samples.pop_front();
		}
		self.samples.push_back(rtt_ms);
	}

	pub fn clear(&mut self) { self.samples.clear(); }

	pub fn average(&self) -> f64 {
		if self.samples.len() < 2 {
			return 0.0;
		}
		let sum: u128 = self.samples.iter().map(|&v| u128::from(v)).sum();
		sum as f64 / self.samples.len() as f64
	}

	pub fn last(&self) -> Option<u64> { self.samples.back().copied() }
	pub fn len(&self) -> usize { self.samples.len() }
	pub fn is_empty(&self) -> bool { self.samples.is_empty() }
	pub fn capacity(&self) -> usize { self.capacity }
	pub fn iter(&self) -> impl Iterator<Item = u64> + '_ { self.samples.iter().copied() }
	pub fn to_vec(&self) -> Vec<u64> { self.iter().collect() }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn evicts_oldest_and_averages() {
		let mut w = SlidingWindow::new(5);
		for v in [10, 20, 30, 40, 50, 60] {
			w.push(v);
		}
		assert_eq!(w.to_vec(), vec![20, 30, 40, 50, 60]);
		assert!((w.average() - 40.0).abs() < 1e-9);
		assert_eq!(w.last(), Some(60));
	}

	#[test]
	fn single_sample_reads_zero() {
		let mut w = SlidingWindow::new(3);
		assert_eq!(w.average(), 0.0);
		w.push(100);
		assert_eq!(w.average(), 0.0);
		w.push(110);
		assert!((w.average() - 105.0).abs() < 1e-9);
		w.clear();
		assert!(w.is_empty());
		assert_eq!(w.average(), 0.0);
	}

	#[test]
	fn zero_capacity_clamps() {
		let mut w = SlidingWindow::new(0);
		w.push(1);
		w.push(2);
		assert_eq!(w.capacity(), 1);
		assert_eq!(w.to_vec(), vec![2]);
	}
}
