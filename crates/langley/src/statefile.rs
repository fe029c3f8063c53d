//! The state file consumed by the `langley run` launcher collaborator.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StateFile {
	pub proxy_addr: SocketAddr,
	pub api_addr: SocketAddr,
	pub ca_path: PathBuf,
	pub pid: u32,
	pub started_at: DateTime<Utc>,
}

impl StateFile {
	pub fn write(&self, dir: &Path) -> std::io::Result<PathBuf> {
		let path = dir.join("state.json");
		let raw = serde_json::to_vec_pretty(self)?;
		write_atomic(&path, &raw)?;
		Ok(path)
	}

	pub fn read(dir: &Path) -> std::io::Result<StateFile> {
		let raw = std::fs::read(dir.join("state.json"))?;
		serde_json::from_slice(&raw).map_err(std::io::Error::other)
	}
}

/// Write via a sibling temp file and rename, so readers never observe a
/// half-written file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
	let tmp = path.with_extension("tmp");
	std::fs::write(&tmp, contents)?;
	std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn state_round_trips() {
		let dir = tempfile::tempdir().unwrap();
		let state = StateFile {
			proxy_addr: "127.0.0.1:9090".parse().unwrap(),
			api_addr: "127.0.0.1:9091".parse().unwrap(),
			ca_path: dir.path().join("certs/ca.crt"),
			pid: std::process::id(),
			started_at: Utc::now(),
		};
		state.write(dir.path()).unwrap();
		let back = StateFile::read(dir.path()).unwrap();
		assert_eq!(back.proxy_addr, state.proxy_addr);
		assert_eq!(back.pid, state.pid);
	}

	#[test]
	fn atomic_write_replaces_existing() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("f.json");
		write_atomic(&path, b"one").unwrap();
		write_atomic(&path, b"two").unwrap();
		assert_eq!(std::fs::read(&path).unwrap(), b"two");
		assert!(!path.with_extension("tmp").exists());
	}
}
