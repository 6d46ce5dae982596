use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Crate-level errors surfaced to callers (construction, configuration, lifecycle).
#[derive(Debug, Error)]
pub enum Error {
	#[error("io: {0}")]
	Io(#[from] io::Error),
	#[error("serde: {0}")]
	Serde(#[from] serde_json::Error),
	#[error("config: {0}")]
	Config(String),
	#[error("construction: {0}")]
	Construction(String),
	#[error("lifecycle: {0}")]
	Lifecycle(String),
	#[error("publish: {0}")]
	Publish(String),
}

impl Error {
	pub fn config(msg: impl Into<String>) -> Self { Self::Config(msg.into()) }
	pub fn construction(msg: impl Into<String>) -> Self { Self::Construction(msg.into()) }
	pub fn lifecycle(msg: impl Into<String>) -> Self { Self::Lifecycle(msg.into()) }
	pub fn publish(msg: impl Into<String>) -> Self { Self::Publish(msg.into()) }
}

/// Failure raised by a single address detection strategy.
///
/// Any error from a strategy is treated as unrecoverable by the aggregate
/// detector; "nothing found" is expressed by returning the unset address instead.
#[derive(Debug, Error)]
pub enum DetectError {
	#[error("io: {0}")]
	Io(#[from] io::Error),
	#[error("unsupported: {0}")]
	Unsupported(String),
	#[error("malformed table: {0}")]
	Malformed(String),
	#[error("no route: {0}")]
	NoRoute(String),
}

/// Failure of a single RTT probe.
#[derive(Debug, Error)]
pub enum SampleError {
	#[error("probe timed out after {0:?}")]
	Timeout(Duration),
	#[error("destination unreachable: {0}")]
	Unreachable(String),
	#[error("address family not supported: {0}")]
	Unsupported(String),
	#[error("no sample available")]
	NoData,
	#[error("os error {code}: {message}")]
	Os { code: i32, message: String },
	#[error("permanent failure: {0}")]
	Permanent(String),
	#[error("all sampling strategies failed")]
	AllFailed,
}

impl SampleError {
	/// Whether the strategy that produced this error should never be retried.
	pub fn is_permanent(&self) -> bool { matches!(self, Self::Permanent(_)) }

	/// Classify an OS error. Missing privilege or an unsupported socket type is permanent,
	/// everything else is a transient miss.
	pub fn from_io(err: io::Error) -> Self {
		match err.kind() {
			io::ErrorKind::PermissionDenied | io::ErrorKind::Unsupported => Self::Permanent(err.to_string()),
			_ => Self::Os { code: err.raw_os_error().unwrap_or(-1), message: err.to_string() },
		}
	}
}
