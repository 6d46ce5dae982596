use std::{env, fs, time::Duration};

use pingwatch_core::{Error, PacketPair, TrackerConfig, TrackerKind};

#[test]
fn round_trips_through_toml_file() {
	let cfg = TrackerConfig::builder()
		.window_capacity(50)
		.kind(TrackerKind::Packets)
		.packet_pairs(vec![PacketPair { request: 0x65, ack: 0x66 }])
		.build()
		.unwrap();
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("pingwatch.toml");
	cfg.write_to_file(&path).unwrap();

	let text = fs::read_to_string(&path).unwrap();
	assert!(text.contains("kind = \"packets\""));
	assert_eq!(TrackerConfig::load_from_file(&path).unwrap(), cfg);
}

#[test]
fn partial_file_fills_defaults() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("partial.toml");
	fs::write(&path, "window_capacity = 5\nkind = \"echo\"\n").unwrap();
	let cfg = TrackerConfig::load_from_file(&path).unwrap();
	assert_eq!(cfg.window_capacity, 5);
	assert_eq!(cfg.kind, TrackerKind::Echo);
	assert_eq!(cfg.sample_interval(), Duration::from_secs(3));
	assert_eq!(cfg.hop_limit, 51);
}

#[test]
fn invalid_file_is_a_config_error() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("bad.toml");
	fs::write(&path, "window_capacity = 0\n").unwrap();
	assert!(matches!(TrackerConfig::load_from_file(&path), Err(Error::Config(_))));

	fs::write(&path, "kind = \"carrier-pigeon\"\n").unwrap();
	assert!(matches!(TrackerConfig::load_from_file(&path), Err(Error::Config(_))));

	assert!(matches!(TrackerConfig::load_from_file(dir.path().join("missing.toml")), Err(Error::Io(_))));
}

#[test]
fn env_overrides_and_validation() {
	// Preserve and restore so other tests in this binary see a clean environment
	let keys = ["PINGWATCH_WINDOW_CAPACITY", "PINGWATCH_MODE", "PINGWATCH_VERBOSE"];
	let saved: Vec<_> = keys.iter().map(|k| env::var(k).ok()).collect();

	env::set_var("PINGWATCH_WINDOW_CAPACITY", "8");
	env::set_var("PINGWATCH_MODE", "connect");
	env::set_var("PINGWATCH_VERBOSE", "true");
	let cfg = TrackerConfig::from_env().unwrap();
	assert_eq!(cfg.window_capacity, 8);
	assert_eq!(cfg.kind, TrackerKind::Connect);
	assert!(cfg.verbose);

	env::set_var("PINGWATCH_WINDOW_CAPACITY", "lots");
	assert!(matches!(TrackerConfig::from_env(), Err(Error::Config(_))));

	for (k, v) in keys.iter().zip(saved) {
		match v {
			Some(v) => env::set_var(k, v),
			None => env::remove_var(k),
		}
	}
}
