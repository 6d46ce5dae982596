#![forbid(unsafe_code)]

//! `pingwatchd`: runs the game and gateway latency trackers, logs every
//! snapshot, and optionally forwards them as UDP JSON datagrams.
//!
//! Sending SIGHUP re-reads the config file and switches the game tracker
//! when its `kind` changed.

mod config;

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pingwatch_core::{
	BroadcastPublisher, HostOptions, PingHost, SnapshotPublisher, TrackerKind, TrackerSnapshot, UdpJsonPublisher,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::DaemonConfig;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "pingwatchd", version, about = "Track latency to the game server and its gateway")]
struct Cli {
	/// TOML configuration file
	#[arg(long)]
	config: Option<PathBuf>,
	/// Sampling strategy for the game tracker (aggregate, echo, connect, packets)
	#[arg(long)]
	mode: Option<TrackerKind>,
	/// Log address changes and detector decisions
	#[arg(long)]
	verbose: bool,
	/// Forward snapshots as JSON datagrams to this address
	#[arg(long)]
	publish: Option<SocketAddr>,
	/// Pin the game server address instead of waiting for detection
	#[arg(long)]
	server: Option<IpAddr>,
	/// Log filter used when RUST_LOG is not set
	#[arg(long)]
	log_level: Option<String>,
}

impl Cli {
	fn load_config(&self) -> anyhow::Result<DaemonConfig> {
		let mut cfg = match &self.config {
			Some(path) => DaemonConfig::load_from_file(path)?,
			None => DaemonConfig::default(),
		};
		cfg.tracker = cfg.tracker.apply_env()?;
		if let Some(kind) = self.mode {
			cfg.tracker.kind = kind;
		}
		if self.verbose {
			cfg.tracker.verbose = true;
		}
		if let Some(addr) = self.publish {
			cfg.publish_addr = Some(addr);
		}
		if let Some(level) = &self.log_level {
			cfg.log_level = level.clone();
		}
		cfg.validate()?;
		Ok(cfg)
	}
}

fn init_tracing(level: &str) {
	// RUST_LOG wins over the configured level
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
	tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	let cfg = cli.load_config().context("invalid configuration")?;
	init_tracing(&cfg.log_level);

	let snapshots = BroadcastPublisher::new(64);
	let mut publishers: Vec<Arc<dyn SnapshotPublisher>> = vec![Arc::new(snapshots.clone())];
	if let Some(addr) = cfg.publish_addr {
		let udp = UdpJsonPublisher::bind(addr).with_context(|| format!("cannot open publish socket for {addr}"))?;
		info!(target_addr = %udp.target(), "forwarding snapshots over udp");
		publishers.push(Arc::new(udp));
	}

	let host = PingHost::new(HostOptions { config: cfg.tracker.clone(), publishers, ..HostOptions::default() })
		.context("failed to assemble trackers")?;
	if let Some(server) = cli.server {
		host.client_state().set_server_address(Some(server));
	}
	host.start().context("failed to start trackers")?;

	let gateway = host.gateway_tracker();
	let gateway_ref = Arc::downgrade(&gateway);
	gateway.subscribe(move |s: &TrackerSnapshot| {
		let Some(gateway) = gateway_ref.upgrade() else { return };
		debug!(
			gateway = %gateway.address(),
			last_rtt_ms = s.last_rtt,
			average_rtt_ms = s.average_rtt,
			"gateway ping"
		)
	});

	let mut rx = snapshots.subscribe();
	let mut reload = ReloadSignal::new()?;
	let mut kind = cfg.tracker.kind;
	let shutdown = tokio::signal::ctrl_c();
	tokio::pin!(shutdown);

	loop {
		tokio::select! {
			res = &mut shutdown => {
				if let Err(e) = res {
					warn!(error = %e, "cannot listen for ctrl-c, shutting down");
				}
				info!("shutdown requested");
				break;
			}
			_ = reload.recv() => {
				if let Some(path) = &cli.config {
					kind = reload_config(&host, path, kind);
				}
			}
			msg = rx.recv() => match msg {
				Ok(s) => {
					let game = host.game_tracker();
					info!(
						server = %game.address(),
						last_rtt_ms = s.last_rtt,
						average_rtt_ms = s.average_rtt,
						samples = game.history().len(),
						"game ping"
					);
				}
				Err(RecvError::Lagged(skipped)) => warn!(skipped, "snapshot log fell behind"),
				Err(RecvError::Closed) => break,
			}
		}
	}

	host.shutdown(SHUTDOWN_GRACE).await;
	Ok(())
}

/// Apply a re-read config file. Only `kind` and `verbose` take effect without a restart.
fn reload_config(host: &PingHost, path: &Path, current: TrackerKind) -> TrackerKind {
	let cfg = match DaemonConfig::load_from_file(path) {
		Ok(cfg) => cfg,
		Err(e) => {
			warn!(error = %e, "config reload failed, keeping current settings");
			return current;
		}
	};
	let mut kind = current;
	if cfg.tracker.kind != current {
		match host.switch_kind(cfg.tracker.kind) {
			Ok(_) => kind = cfg.tracker.kind,
			Err(e) => warn!(error = %e, requested = %cfg.tracker.kind, "cannot switch tracker kind"),
		}
	}
	host.game_tracker().set_verbose(cfg.tracker.verbose);
	host.gateway_tracker().set_verbose(cfg.tracker.verbose);
	info!(%kind, verbose = cfg.tracker.verbose, "configuration reloaded");
	kind
}

struct ReloadSignal {
	#[cfg(unix)]
	inner: tokio::signal::unix::Signal,
}

impl ReloadSignal {
	fn new() -> std::io::Result<Self> {
		#[cfg(unix)]
		{
			let inner = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
			Ok(Self { inner })
		}
		#[cfg(not(unix))]
		{
			Ok(Self {})
		}
	}

	async fn recv(&mut self) {
		#[cfg(unix)]
		{
			if self.inner.recv().await.is_some() {
				return;
			}
		}
		std::future::pending::<()>().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cli_overrides_file_and_defaults() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("d.toml");
		std::fs::write(&path, "log_level = \"warn\"\n[tracker]\nkind = \"echo\"\n").unwrap();
		let cli = Cli::parse_from([
			"pingwatchd",
			"--config",
			path.to_str().unwrap(),
			"--mode",
			"connect",
			"--verbose",
			"--publish",
			"127.0.0.1:7000",
		]);
		let cfg = cli.load_config().unwrap();
		assert_eq!(cfg.log_level, "warn");
		assert_eq!(cfg.tracker.kind, TrackerKind::Connect);
		assert!(cfg.tracker.verbose);
		assert_eq!(cfg.publish_addr, Some("127.0.0.1:7000".parse().unwrap()));
	}

	#[test]
	fn unknown_mode_is_rejected_by_parser() {
		assert!(Cli::try_parse_from(["pingwatchd", "--mode", "semaphore"]).is_err());
	}
}
