use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use pingwatch_core::TrackerConfig;
use serde::{Deserialize, Serialize};

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("cannot read {}: {source}", path.display())]
	Read { path: PathBuf, source: std::io::Error },
	#[error("cannot parse {}: {source}", path.display())]
	Parse { path: PathBuf, source: toml::de::Error },
	#[error("invalid log_level '{0}' (expected one of trace, debug, info, warn, error)")]
	LogLevel(String),
	#[error(transparent)]
	Tracker(#[from] pingwatch_core::Error),
}

/// Daemon settings: logging, where to forward snapshots, and the tracker itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
	pub log_level: String,
	/// UDP destination for JSON snapshots; forwarding is off when unset.
	pub publish_addr: Option<SocketAddr>,
	pub tracker: TrackerConfig,
}

impl Default for DaemonConfig {
	fn default() -> Self { Self { log_level: "info".into(), publish_addr: None, tracker: TrackerConfig::default() } }
}

impl DaemonConfig {
	pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let data = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
		let cfg: Self = toml::from_str(&data).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
		cfg.validate()?;
		Ok(cfg)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
			return Err(ConfigError::LogLevel(self.log_level.clone()));
		}
		self.tracker.validate()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pingwatch_core::TrackerKind;

	#[test]
	fn default_is_valid() {
		assert!(DaemonConfig::default().validate().is_ok());
	}

	#[test]
	fn loads_nested_tracker_section() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("pingwatchd.toml");
		fs::write(
			&path,
			r#"
log_level = "debug"
publish_addr = "127.0.0.1:9870"

[tracker]
kind = "connect"
window_capacity = 10
"#,
		)
		.unwrap();
		let cfg = DaemonConfig::load_from_file(&path).unwrap();
		assert_eq!(cfg.log_level, "debug");
		assert_eq!(cfg.publish_addr, Some("127.0.0.1:9870".parse().unwrap()));
		assert_eq!(cfg.tracker.kind, TrackerKind::Connect);
		assert_eq!(cfg.tracker.window_capacity, 10);
		assert_eq!(cfg.tracker.refresh_interval_ms, 10_000);
	}

	#[test]
	fn rejects_unknown_log_level() {
		let cfg = DaemonConfig { log_level: "chatty".into(), ..DaemonConfig::default() };
		assert!(matches!(cfg.validate(), Err(ConfigError::LogLevel(_))));
	}

	#[test]
	fn tracker_errors_surface() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("bad.toml");
		fs::write(&path, "[tracker]\nhop_limit = 0\n").unwrap();
		assert!(matches!(DaemonConfig::load_from_file(&path), Err(ConfigError::Tracker(_))));
		assert!(matches!(
			DaemonConfig::load_from_file(dir.path().join("absent.toml")),
			Err(ConfigError::Read { .. })
		));
	}
}
