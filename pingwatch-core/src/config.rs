use crate::error::{Error, Result};
use crate::factory::TrackerKind;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};

/// Inclusive range of remote ports that identify a game server connection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
	pub start: u16,
	pub end: u16,
}

impl PortRange {
	pub const fn new(start: u16, end: u16) -> Self { Self { start, end } }
	pub fn contains(&self, port: u16) -> bool { (self.start..=self.end).contains(&port) }
}

/// Outgoing request opcode and the incoming opcode that acknowledges it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PacketPair {
	pub request: u16,
	pub ack: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
	/// Number of samples kept for the running average.
	pub window_capacity: usize,
	pub sample_interval_ms: u64,
	pub refresh_interval_ms: u64,
	/// Upper bound for one probe; must stay below the sampling interval.
	pub probe_timeout_ms: u64,
	pub hop_limit: u32,
	pub kind: TrackerKind,
	pub verbose: bool,
	/// Port used by the TCP handshake sampler.
	pub connect_port: u16,
	pub server_ports: Vec<PortRange>,
	pub packet_pairs: Vec<PacketPair>,
}

impl Default for TrackerConfig {
	fn default() -> Self {
		Self {
			window_capacity: 20,
			sample_interval_ms: 3_000,
			refresh_interval_ms: 10_000,
			probe_timeout_ms: 2_000,
			hop_limit: 51,
			kind: TrackerKind::Aggregate,
			verbose: false,
			connect_port: 55006,
			server_ports: vec![PortRange::new(54992, 54994), PortRange::new(55006, 55007), PortRange::new(55021, 55040)],
			packet_pairs: Vec::new(),
		}
	}
}

impl TrackerConfig {
	pub fn builder() -> TrackerConfigBuilder { TrackerConfigBuilder::default() }

	pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
		let data = fs::read_to_string(path)?;
		let cfg: Self = toml::from_str(&data).map_err(|e| Error::config(format!("toml parse error: {e}")))?;
		cfg.validate()?;
		Ok(cfg)
	}

	pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
		let data = toml::to_string_pretty(self).map_err(|e| Error::config(format!("toml encode error: {e}")))?;
		fs::write(path, data)?;
		Ok(())
	}

	pub fn from_env() -> Result<Self> {
		let cfg = Self::default().apply_env()?;
		cfg.validate()?;
		Ok(cfg)
	}

	/// Overlay `PINGWATCH_*` environment variables on top of `self`.
	pub fn apply_env(mut self) -> Result<Self> {
		if let Some(v) = env_parse::<usize>("PINGWATCH_WINDOW_CAPACITY")? { self.window_capacity = v; }
		if let Some(v) = env_parse::<u64>("PINGWATCH_SAMPLE_INTERVAL_MS")? { self.sample_interval_ms = v; }
		if let Some(v) = env_parse::<u64>("PINGWATCH_REFRESH_INTERVAL_MS")? { self.refresh_interval_ms = v; }
		if let Some(v) = env_parse::<u64>("PINGWATCH_PROBE_TIMEOUT_MS")? { self.probe_timeout_ms = v; }
		if let Some(v) = env_parse::<TrackerKind>("PINGWATCH_MODE")? { self.kind = v; }
		if let Ok(v) = std::env::var("PINGWATCH_VERBOSE") { self.verbose = v == "1" || v.eq_ignore_ascii_case("true"); }
		Ok(self)
	}

	pub fn validate(&self) -> Result<()> {
		if self.window_capacity == 0 {
			return Err(Error::config("window_capacity must be at least 1"));
		}
		if self.sample_interval_ms < 100 || self.refresh_interval_ms < 100 {
			return Err(Error::config("sample_interval_ms and refresh_interval_ms must be >= 100"));
		}
		if self.probe_timeout_ms == 0 || self.probe_timeout_ms >= self.sample_interval_ms {
			return Err(Error::config(format!(
				"probe_timeout_ms ({}) must be non-zero and below sample_interval_ms ({})",
				self.probe_timeout_ms, self.sample_interval_ms
			)));
		}
		if self.hop_limit == 0 || self.hop_limit > 255 {
			return Err(Error::config(format!("invalid hop_limit: {}", self.hop_limit)));
		}
		if let Some(r) = self.server_ports.iter().find(|r| r.start > r.end) {
			return Err(Error::config(format!("inverted port range {}-{}", r.start, r.end)));
		}
		Ok(())
	}

	pub fn sample_interval(&self) -> Duration { Duration::from_millis(self.sample_interval_ms) }
	pub fn refresh_interval(&self) -> Duration { Duration::from_millis(self.refresh_interval_ms) }
	pub fn probe_timeout(&self) -> Duration { Duration::from_millis(self.probe_timeout_ms) }
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
	T: std::str::FromStr,
	T::Err: std::fmt::Display,
{
	match std::env::var(key) {
		Ok(v) => v.trim().parse::<T>().map(Some).map_err(|e| Error::config(format!("{key}: {e}"))),
		Err(_) => Ok(None),
	}
}

#[derive(Debug, Default)]
pub struct TrackerConfigBuilder {
	cfg: TrackerConfig,
}

impl TrackerConfigBuilder {
	pub fn window_capacity(mut self, n: usize) -> Self { self.cfg.window_capacity = n; self }
	pub fn sample_interval(mut self, d: Duration) -> Self { self.cfg.sample_interval_ms = d.as_millis() as u64; self }
	pub fn refresh_interval(mut self, d: Duration) -> Self { self.cfg.refresh_interval_ms = d.as_millis() as u64; self }
	pub fn probe_timeout(mut self, d: Duration) -> Self { self.cfg.probe_timeout_ms = d.as_millis() as u64; self }
	pub fn kind(mut self, kind: TrackerKind) -> Self { self.cfg.kind = kind; self }
	pub fn verbose(mut self, v: bool) -> Self { self.cfg.verbose = v; self }
	pub fn packet_pairs(mut self, pairs: Vec<PacketPair>) -> Self { self.cfg.packet_pairs = pairs; self }
	pub fn build(self) -> Result<TrackerConfig> {
		self.cfg.validate()?;
		Ok(self.cfg)
	}
}
