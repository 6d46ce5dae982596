use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{AddressDetector, UNSET_ADDRESS};
use crate::config::PortRange;
use crate::error::DetectError;

const DEFAULT_TCP_TABLE: &str = "/proc/net/tcp";
const DEFAULT_TCP6_TABLE: &str = "/proc/net/tcp6";
const TCP_ESTABLISHED: u8 = 0x01;

/// One row of the kernel TCP connection table. IPv4-mapped IPv6 endpoints
/// from `tcp6` are stored as plain IPv4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpEntry {
	pub local: (IpAddr, u16),
	pub remote: (IpAddr, u16),
	pub state: u8,
}

/// Finds the game server by scanning established TCP connections for a remote
/// port inside the configured ranges.
///
/// Dual-stack sockets list IPv4 peers in `tcp6` as `::ffff:a.b.c.d`, so that
/// table is scanned too when present. A missing or unreadable `tcp` table is
/// an error (the mechanism is unavailable on this host); no matching
/// connection yields [`UNSET_ADDRESS`].
#[derive(Debug, Clone)]
pub struct TcpTableAddressDetector {
	path: PathBuf,
	path6: Option<PathBuf>,
	ports: Vec<PortRange>,
}

impl TcpTableAddressDetector {
	pub fn new(ports: Vec<PortRange>) -> Self { Self::with_paths(DEFAULT_TCP_TABLE, Some(DEFAULT_TCP6_TABLE.into()), ports) }

	/// Scan a single IPv4 table.
	pub fn with_path(path: impl Into<PathBuf>, ports: Vec<PortRange>) -> Self { Self::with_paths(path, None, ports) }

	pub fn with_paths(path: impl Into<PathBuf>, path6: Option<PathBuf>, ports: Vec<PortRange>) -> Self {
		Self { path: path.into(), path6, ports }
	}

	fn matches(&self, entry: &TcpEntry) -> bool {
		let IpAddr::V4(remote) = entry.remote.0 else { return false };
		if entry.state != TCP_ESTABLISHED || remote.is_loopback() || remote.is_unspecified() {
			return false;
		}
		self.ports.is_empty() || self.ports.iter().any(|r| r.contains(entry.remote.1))
	}

	fn scan(&self, path: &Path) -> Result<Option<TcpEntry>, DetectError> {
		let data = fs::read_to_string(path)?;
		let mut lines = data.lines();
		match lines.next() {
			Some(header) if header.contains("rem_address") => {}
			_ => return Err(DetectError::Malformed(format!("{} has no header row", path.display()))),
		}
		Ok(lines.filter_map(parse_tcp_line).find(|e| self.matches(e)))
	}
}

impl AddressDetector for TcpTableAddressDetector {
	fn name(&self) -> &'static str { "tcp_table" }

	fn detect(&self, _verbose: bool) -> Result<IpAddr, DetectError> {
		let mut found = self.scan(&self.path)?;
		if let (None, Some(path6)) = (found, &self.path6) {
			found = match self.scan(path6) {
				Ok(entry) => entry,
				// kernels built without IPv6 have no tcp6 table
				Err(DetectError::Io(e)) if e.kind() == io::ErrorKind::NotFound => None,
				Err(e) => return Err(e),
			};
		}
		match found {
			Some(entry) => Ok(entry.remote.0),
			None => {
				debug!(table = %self.path.display(), "no matching game connection in tcp table");
				Ok(UNSET_ADDRESS)
			}
		}
	}
}

/// Parse one data row; returns `None` for rows that do not look like entries.
pub fn parse_tcp_line(line: &str) -> Option<TcpEntry> {
	let mut fields = line.split_whitespace();
	let _slot = fields.next()?;
	let local = parse_endpoint(fields.next()?)?;
	let remote = parse_endpoint(fields.next()?)?;
	let state = u8::from_str_radix(fields.next()?, 16).ok()?;
	Some(TcpEntry { local, remote, state })
}

/// `0100007F:1F90` -> 127.0.0.1:8080. Each 32-bit word of the address is
/// the raw in-memory network-order value printed as a native integer; IPv6
/// addresses are four such words. The port is host order.
fn parse_endpoint(s: &str) -> Option<(IpAddr, u16)> {
	let (addr, port) = s.split_once(':')?;
	let port = u16::from_str_radix(port, 16).ok()?;
	let ip = match addr.len() {
		8 => IpAddr::V4(Ipv4Addr::from(hex_word(addr)?)),
		32 => {
			let mut octets = [0u8; 16];
			for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
				chunk.copy_from_slice(&hex_word(addr.get(i * 8..i * 8 + 8)?)?);
			}
			let v6 = Ipv6Addr::from(octets);
			v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4)
		}
		_ => return None,
	};
	Some((ip, port))
}

fn hex_word(s: &str) -> Option<[u8; 4]> { u32::from_str_radix(s, 16).ok().map(u32::to_ne_bytes) }

#[cfg(all(test, target_endian = "little"))]
mod tests {
	use super::*;
	use std::io::Write;

	const HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

	fn table(rows: &[&str]) -> tempfile::NamedTempFile {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		writeln!(f, "{HEADER}").unwrap();
		for r in rows {
			writeln!(f, "{r}").unwrap();
		}
		f
	}

	#[test]
	fn parses_endpoint_byte_order() {
		let e = parse_tcp_line("   0: 0100007F:1F90 0A00A8C0:D6D8 01 00000000:00000000 00:00000000 00000000  1000 0 1 1").unwrap();
		assert_eq!(e.local, (IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080));
		assert_eq!(e.remote, (IpAddr::V4(Ipv4Addr::new(192, 168, 0, 10)), 55000));
		assert_eq!(e.state, TCP_ESTABLISHED);
	}

	#[test]
	fn picks_established_connection_in_port_range() {
		// 203.0.113.5:55006 established, 198.51.100.9:55007 in TIME_WAIT
		let f = table(&[
			"   0: 0100007F:0CEA 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000 0 1 1",
			"   1: 0A00A8C0:C350 096433C6:D6DF 06 00000000:00000000 00:00000000 00000000  1000 0 2 1",
			"   2: 0A00A8C0:C351 057100CB:D6DE 01 00000000:00000000 00:00000000 00000000  1000 0 3 1",
		]);
		let det = TcpTableAddressDetector::with_path(f.path(), vec![PortRange::new(55006, 55007)]);
		assert_eq!(det.detect(false).unwrap(), "203.0.113.5".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn no_match_is_unset_not_error() {
		let f = table(&["   0: 0100007F:0CEA 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000 0 1 1"]);
		let det = TcpTableAddressDetector::with_path(f.path(), vec![PortRange::new(55006, 55007)]);
		assert_eq!(det.detect(false).unwrap(), UNSET_ADDRESS);
	}

	#[test]
	fn missing_table_is_error() {
		let dir = tempfile::tempdir().unwrap();
		let det = TcpTableAddressDetector::with_path(dir.path().join("absent"), Vec::new());
		assert!(matches!(det.detect(false), Err(DetectError::Io(_))));
	}

	#[test]
	fn unmaps_ipv4_mapped_tcp6_peer() {
		let e = parse_tcp_line(
			"   0: 00000000000000000000000000000000:C350 0000000000000000FFFF0000057100CB:D6DE 01 00000000:00000000 00:00000000 00000000  1000 0 1 1",
		)
		.unwrap();
		assert_eq!(e.remote, (IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 55006));
		assert_eq!(e.local.0, IpAddr::V6(Ipv6Addr::UNSPECIFIED));
	}

	#[test]
	fn falls_back_to_tcp6_for_dual_stack_sockets() {
		let v4 = table(&[]);
		// a native IPv6 peer is skipped, the mapped IPv4 one is reported
		let v6 = table(&[
			"   0: 00000000000000000000000001000000:C350 B80D0120000000000000000001000000:D6DE 01 00000000:00000000 00:00000000 00000000  1000 0 1 1",
			"   1: 0000000000000000FFFF00000A00A8C0:C351 0000000000000000FFFF0000057100CB:D6DE 01 00000000:00000000 00:00000000 00000000  1000 0 2 1",
		]);
		let det = TcpTableAddressDetector::with_paths(v4.path(), Some(v6.path().to_path_buf()), vec![PortRange::new(55006, 55007)]);
		assert_eq!(det.detect(false).unwrap(), "203.0.113.5".parse::<IpAddr>().unwrap());
	}

	#[test]
	fn absent_tcp6_table_is_ignored() {
		let dir = tempfile::tempdir().unwrap();
		let v4 = table(&[]);
		let det = TcpTableAddressDetector::with_paths(v4.path(), Some(dir.path().join("tcp6")), Vec::new());
		assert_eq!(det.detect(false).unwrap(), UNSET_ADDRESS);
	}
}
