//! YAML configuration with environment overrides.
//!
//! Loaded once at startup from `<config_dir>/config.yaml`; every field has a
//! default so a missing file yields a working local setup. A handful of
//! `LANGLEY_*` environment variables override the file explicitly, which
//! keeps CI and the launcher collaborator simple.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{ActionableError, InitError};

pub const DEFAULT_BODY_MAX_BYTES: usize = 1_048_576;
pub const DEFAULT_IDLE_GAP_MINUTES: u64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
	pub proxy: ProxyConfig,
	pub api: ApiConfig,
	pub auth: AuthConfig,
	pub persistence: PersistenceConfig,
	pub redaction: RedactionConfig,
	pub retention: RetentionConfig,
	pub analytics: AnalyticsConfig,
	pub task: TaskConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
	pub listen: String,
	/// Hosts for which upstream certificate verification is disabled.
	/// Each use is logged at warn.
	pub insecure_hosts: Vec<String>,
}

impl Default for ProxyConfig {
	fn default() -> Self {
		ProxyConfig {
			listen: "127.0.0.1:9090".to_string(),
			insecure_hosts: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
	pub listen: String,
}

impl Default for ApiConfig {
	fn default() -> Self {
		ApiConfig {
			listen: "127.0.0.1:9091".to_string(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
	/// Bearer token for read-side observers; auto-generated when absent.
	pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
	pub body_max_bytes: usize,
	pub db_path: Option<PathBuf>,
	/// Queue capacity in items across all priority bands.
	pub queue_capacity: usize,
	/// Queue capacity in summed payload bytes.
	pub queue_max_bytes: usize,
	/// Per-flow enqueued-bytes cap; beyond it LOW events for the flow drop.
	pub per_flow_max_bytes: usize,
	pub batch_size: usize,
	pub batch_interval_ms: u64,
}

impl Default for PersistenceConfig {
	fn default() -> Self {
		PersistenceConfig {
			body_max_bytes: DEFAULT_BODY_MAX_BYTES,
			db_path: None,
			queue_capacity: 10_000,
			queue_max_bytes: 64 * 1024 * 1024,
			per_flow_max_bytes: 8 * 1024 * 1024,
			batch_size: 50,
			batch_interval_ms: 1_000,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
	pub always_redact_headers: Vec<String>,
	pub pattern_redact_headers: Vec<String>,
	pub redact_api_keys: bool,
	pub redact_base64_images: bool,
	pub disable_body_storage: bool,
	/// Gated escape hatch: store raw (unredacted) bodies. Default off.
	pub store_raw_bodies: bool,
}

impl Default for RedactionConfig {
	fn default() -> Self {
		RedactionConfig {
			always_redact_headers: Vec::new(),
			pattern_redact_headers: Vec::new(),
			redact_api_keys: true,
			redact_base64_images: true,
			disable_body_storage: false,
			store_raw_bodies: false,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
	pub flows_ttl_days: u32,
	pub events_ttl_days: u32,
	pub drop_log_ttl_days: u32,
	pub sweep_interval_minutes: u64,
}

impl Default for RetentionConfig {
	fn default() -> Self {
		RetentionConfig {
			flows_ttl_days: 7,
			events_ttl_days: 3,
			drop_log_ttl_days: 1,
			sweep_interval_minutes: 60,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
	pub anomaly_context_tokens: u64,
	pub anomaly_tool_delay_ms: i64,
	pub anomaly_rapid_calls_window_s: u64,
	pub anomaly_rapid_calls_threshold: usize,
	pub anomaly_cost_usd: f64,
	pub anomaly_tool_calls: usize,
}

impl Default for AnalyticsConfig {
	fn default() -> Self {
		AnalyticsConfig {
			anomaly_context_tokens: 100_000,
			anomaly_tool_delay_ms: 30_000,
			anomaly_rapid_calls_window_s: 60,
			anomaly_rapid_calls_threshold: 5,
			anomaly_cost_usd: 1.0,
			anomaly_tool_calls: 20,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
	pub idle_gap_minutes: u64,
	/// Opt-in request signatures (hash over method+path+sorted tool names).
	pub signature: bool,
}

impl Default for TaskConfig {
	fn default() -> Self {
		TaskConfig {
			idle_gap_minutes: DEFAULT_IDLE_GAP_MINUTES,
			signature: false,
		}
	}
}

impl Config {
	/// Load `config.yaml` from `dir`, creating it (with a fresh auth token)
	/// when absent. Environment overrides are applied last.
	pub fn load_or_init(dir: &Path) -> Result<Config, InitError> {
		let path = dir.join("config.yaml");
		let mut cfg: Config = match std::fs::read_to_string(&path) {
			Ok(raw) => serde_yaml::from_str(&raw).map_err(|e| {
				InitError::Config(ActionableError::new(
					format!("cannot parse {}", path.display()),
					e.to_string(),
					"fix the YAML or delete the file to regenerate defaults",
				))
			})?,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
			Err(e) => {
				return Err(InitError::Io(ActionableError::new(
					format!("cannot read {}", path.display()),
					e.to_string(),
					"check permissions on the config directory",
				)));
			},
		};

		cfg.apply_env();

		let mut dirty = false;
		if cfg.auth.token.is_none() {
			cfg.auth.token = Some(generate_token());
			dirty = true;
		}
		cfg.task.idle_gap_minutes = cfg.task.idle_gap_minutes.clamp(1, 60);

		if dirty || !path.exists() {
			cfg.persist(&path)?;
		}
		Ok(cfg)
	}

	fn apply_env(&mut self) {
		if let Ok(v) = std::env::var("LANGLEY_PROXY_LISTEN")
			&& !v.is_empty()
		{
			self.proxy.listen = v;
		}
		if let Ok(v) = std::env::var("LANGLEY_API_LISTEN")
			&& !v.is_empty()
		{
			self.api.listen = v;
		}
		if let Ok(v) = std::env::var("LANGLEY_AUTH_TOKEN")
			&& !v.is_empty()
		{
			self.auth.token = Some(v);
		}
		if let Ok(v) = std::env::var("LANGLEY_DB_PATH")
			&& !v.is_empty()
		{
			self.persistence.db_path = Some(PathBuf::from(v));
		}
		if let Ok(v) = std::env::var("LANGLEY_BODY_MAX_BYTES")
			&& let Ok(n) = v.parse::<usize>()
		{
			self.persistence.body_max_bytes = n;
		}
		if let Ok(v) = std::env::var("LANGLEY_IDLE_GAP_MINUTES")
			&& let Ok(n) = v.parse::<u64>()
		{
			self.task.idle_gap_minutes = n;
		}
	}

	fn persist(&self, path: &Path) -> Result<(), InitError> {
		let raw = serde_yaml::to_string(self).map_err(|e| {
			InitError::Config(ActionableError::new(
				"cannot serialize config",
				e.to_string(),
				"report this as a bug",
			))
		})?;
		crate::statefile::write_atomic(path, raw.as_bytes()).map_err(|e| {
			InitError::Io(ActionableError::new(
				format!("cannot write {}", path.display()),
				e.to_string(),
				"check permissions on the config directory",
			))
		})
	}

	pub fn proxy_addr(&self) -> Result<SocketAddr, InitError> {
		parse_addr(&self.proxy.listen, "proxy.listen")
	}

	pub fn api_addr(&self) -> Result<SocketAddr, InitError> {
		parse_addr(&self.api.listen, "api.listen")
	}

	pub fn db_path(&self, dir: &Path) -> PathBuf {
		self
			.persistence
			.db_path
			.clone()
			.unwrap_or_else(|| dir.join("langley.db"))
	}
}

fn parse_addr(raw: &str, field: &str) -> Result<SocketAddr, InitError> {
	raw.parse().map_err(|_| {
		InitError::Config(ActionableError::new(
			format!("invalid {field}"),
			format!("{raw:?} is not a host:port address"),
			"use an address like 127.0.0.1:9090",
		))
	})
}

/// OS-appropriate config dir, e.g. `~/.config/langley` on Linux.
pub fn default_config_dir() -> Result<PathBuf, InitError> {
	let base = dirs::config_dir().ok_or_else(|| {
		InitError::Config(ActionableError::new(
			"cannot locate config directory",
			"no home directory for the current user",
			"set LANGLEY_CONFIG_DIR explicitly",
		))
	})?;
	Ok(base.join("langley"))
}

fn generate_token() -> String {
	let mut bytes = [0u8; 32];
	rand::rng().fill(&mut bytes);
	hex::encode(bytes)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_sane() {
		let c = Config::default();
		assert_eq!(c.persistence.body_max_bytes, 1_048_576);
		assert_eq!(c.task.idle_gap_minutes, 5);
		assert!(!c.redaction.store_raw_bodies);
		assert!(c.proxy_addr().is_ok());
	}

	#[test]
	fn load_creates_file_and_token() {
		let dir = tempfile::tempdir().unwrap();
		let c = Config::load_or_init(dir.path()).unwrap();
		let token = c.auth.token.as_deref().unwrap();
		assert_eq!(token.len(), 64);
		assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
		assert!(dir.path().join("config.yaml").exists());

		// Second load reuses the persisted token.
		let c2 = Config::load_or_init(dir.path()).unwrap();
		assert_eq!(c2.auth.token, c.auth.token);
	}

	#[test]
	fn idle_gap_is_clamped() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(
			dir.path().join("config.yaml"),
			"task:\n  idle_gap_minutes: 600\n",
		)
		.unwrap();
		let c = Config::load_or_init(dir.path()).unwrap();
		assert_eq!(c.task.idle_gap_minutes, 60);
	}
}
