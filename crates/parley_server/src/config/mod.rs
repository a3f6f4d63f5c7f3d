#![forbid(unsafe_code)]

use core::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

/// Default match window handed to clients for optimistic reconciliation.
pub const DEFAULT_MATCH_WINDOW_MS: u64 = 2000;

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	dirs::home_dir()
		.map(|home| home.join(".parley").join("config.toml"))
		.ok_or_else(|| anyhow!("no home directory to look for .parley/config.toml in"))
}

/// File at `path` (missing is fine) with `PARLEY_*` env overrides applied.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file = read_file_config(path)
		.with_context(|| format!("loading {}", path.display()))?
		.unwrap_or_default();
	let mut cfg = ServerConfig::from_file(file);
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	load_server_config_from_path(&default_config_path()?)
}

/// Parse config TOML without touching the environment.
pub fn parse_server_config(toml_text: &str) -> anyhow::Result<ServerConfig> {
	let file: FileConfig = toml::from_str(toml_text).context("parse TOML")?;
	Ok(ServerConfig::from_file(file))
}

/// Secret that never prints its value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(secret: impl Into<String>) -> Self {
		Self(secret.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
		out.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
		out.write_str("<redacted>")
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub reconcile: ReconcileSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// `host:port` for `/healthz` and `/readyz`; off when unset.
	pub health_bind: Option<String>,
	/// `host:port` for the Prometheus scrape endpoint; off when unset.
	pub metrics_bind: Option<String>,
	/// HMAC secret for session tokens.
	pub auth_hmac_secret: Option<SecretString>,
	/// Maximum queued events per stream subscriber before lag markers kick in.
	pub subscriber_queue_capacity: usize,
	/// Request body limit for the API.
	pub max_body_bytes: usize,
	/// Interval between keepalive comments on idle event streams.
	pub keepalive_secs: u64,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			health_bind: None,
			metrics_bind: None,
			auth_hmac_secret: None,
			subscriber_queue_capacity: 256,
			max_body_bytes: 64 * 1024,
			keepalive_secs: 15,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Use the SQL store instead of the in-memory one.
	pub enabled: bool,
	/// `sqlite:` or `postgres://` URL.
	pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
	pub match_window_ms: u64,
}

impl Default for ReconcileSettings {
	fn default() -> Self {
		Self {
			match_window_ms: DEFAULT_MATCH_WINDOW_MS,
		}
	}
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	reconcile: FileReconcileSettings,
}

#[derive(Debug, Default, Deserialize)]
struct FileServerSettings {
	health_bind: Option<String>,
	metrics_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	subscriber_queue_capacity: Option<usize>,
	max_body_bytes: Option<usize>,
	keepalive_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileReconcileSettings {
	match_window_ms: Option<u64>,
}

fn non_blank(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn positive<T: PartialOrd + Default>(v: Option<T>, fallback: T) -> T {
	v.filter(|n| *n > T::default()).unwrap_or(fallback)
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let d = ServerSettings::default();
		let FileServerSettings {
			health_bind,
			metrics_bind,
			auth_hmac_secret,
			subscriber_queue_capacity,
			max_body_bytes,
			keepalive_secs,
		} = file.server;

		Self {
			server: ServerSettings {
				health_bind: non_blank(health_bind),
				metrics_bind: non_blank(metrics_bind),
				auth_hmac_secret: non_blank(auth_hmac_secret).map(SecretString::new),
				subscriber_queue_capacity: positive(subscriber_queue_capacity, d.subscriber_queue_capacity),
				max_body_bytes: positive(max_body_bytes, d.max_body_bytes),
				keepalive_secs: positive(keepalive_secs, d.keepalive_secs),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or_default(),
				database_url: non_blank(file.persistence.database_url),
			},
			reconcile: ReconcileSettings {
				match_window_ms: file.reconcile.match_window_ms.unwrap_or(DEFAULT_MATCH_WINDOW_MS),
			},
		}
	}
}

fn read_file_config(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	let text = match fs::read_to_string(path) {
		Ok(text) => text,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
		Err(e) => return Err(anyhow!(e).context("read config file")),
	};
	toml::from_str(&text).map(Some).context("parse TOML")
}

/// Trimmed, non-empty value of `PARLEY_{key}`.
fn env_value(key: &str) -> Option<String> {
	non_blank(std::env::var(format!("PARLEY_{key}")).ok())
}

fn env_flag(key: &str) -> Option<bool> {
	match env_value(key)?.to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		other => {
			warn!(key, value = other, "ignoring unparsable boolean override");
			None
		}
	}
}

fn env_number<T: std::str::FromStr + PartialOrd + Default>(key: &str) -> Option<T> {
	let raw = env_value(key)?;
	match raw.parse::<T>() {
		Ok(n) if n > T::default() => Some(n),
		_ => {
			warn!(key, value = %raw, "ignoring non-positive numeric override");
			None
		}
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	let mut overridden: Vec<&'static str> = Vec::new();

	if let Some(v) = env_value("AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		overridden.push("server.auth_hmac_secret");
	}
	if let Some(v) = env_value("HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		overridden.push("server.health_bind");
	}
	if let Some(v) = env_value("METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		overridden.push("server.metrics_bind");
	}
	if let Some(n) = env_number("SUBSCRIBER_QUEUE_CAPACITY") {
		cfg.server.subscriber_queue_capacity = n;
		overridden.push("server.subscriber_queue_capacity");
	}
	if let Some(n) = env_number("MAX_BODY_BYTES") {
		cfg.server.max_body_bytes = n;
		overridden.push("server.max_body_bytes");
	}
	if let Some(n) = env_number("KEEPALIVE_SECS") {
		cfg.server.keepalive_secs = n;
		overridden.push("server.keepalive_secs");
	}
	if let Some(b) = env_flag("PERSISTENCE_ENABLED") {
		cfg.persistence.enabled = b;
		overridden.push("persistence.enabled");
	}
	if let Some(v) = env_value("PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		overridden.push("persistence.database_url");
	}
	if let Some(n) = env_number("MATCH_WINDOW_MS") {
		cfg.reconcile.match_window_ms = n;
		overridden.push("reconcile.match_window_ms");
	}

	if !overridden.is_empty() {
		info!(keys = ?overridden, "config overridden from environment");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_uses_defaults() {
		let cfg = parse_server_config("").expect("parse");
		assert_eq!(cfg.server.subscriber_queue_capacity, 256);
		assert_eq!(cfg.reconcile.match_window_ms, DEFAULT_MATCH_WINDOW_MS);
		assert!(!cfg.persistence.enabled);
		assert!(cfg.server.auth_hmac_secret.is_none());
	}

	#[test]
	fn sections_are_normalized() {
		let cfg = parse_server_config(
			r#"
[server]
health_bind = "127.0.0.1:18301"
metrics_bind = "  "
auth_hmac_secret = "s3cret"
subscriber_queue_capacity = 0

[persistence]
enabled = true
database_url = "sqlite::memory:"

[reconcile]
match_window_ms = 500
"#,
		)
		.expect("parse");

		assert_eq!(cfg.server.health_bind.as_deref(), Some("127.0.0.1:18301"));
		assert!(cfg.server.metrics_bind.is_none());
		assert_eq!(cfg.server.subscriber_queue_capacity, 256);
		assert_eq!(cfg.persistence.database_url.as_deref(), Some("sqlite::memory:"));
		assert_eq!(cfg.reconcile.match_window_ms, 500);

		let secret = cfg.server.auth_hmac_secret.expect("secret");
		assert_eq!(secret.expose(), "s3cret");
		assert_eq!(format!("{secret:?}"), "SecretString(<redacted>)");
	}
}
