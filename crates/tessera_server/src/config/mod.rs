#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tessera_domain::BucketPolicy;
use tessera_store::{RepoSettings, StoreBackend};
use tracing::{info, warn};

pub const DEFAULT_BIND: &str = "ws://0.0.0.0:8080";

/// Default config path: `~/.tessera/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".tessera").join("config.toml"))
}

fn default_data_dir() -> PathBuf {
	dirs::home_dir()
		.map(|home| home.join(".tessera").join("data"))
		.unwrap_or_else(|| PathBuf::from(".tessera/data"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	cfg.normalize();
	Ok(cfg)
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub game: GameSettings,
	pub storage: StorageSettings,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// WebSocket listen address (`ws://host:port`).
	pub bind: String,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for session tokens. Without it every session is anonymous.
	pub auth_hmac_secret: Option<SecretString>,
	pub max_message_bytes: usize,
	pub write_wait: Duration,
	/// Read-idle timeout; pings go out at 90% of it.
	pub pong_wait: Duration,
	/// Per-connection outbound queue capacity.
	pub outbound_queue: usize,
}

#[derive(Debug, Clone)]
pub struct GameSettings {
	pub tile_lock_ttl_secs: u32,
	pub bucket_size: u32,
	pub bucket_rate_secs: u32,
	pub timestamp_unit_secs: u32,
	/// External ids granted the moderator role.
	pub moderators: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
	Sqlite,
	Memory,
}

impl StorageKind {
	fn parse(s: &str) -> Option<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"sqlite" => Some(StorageKind::Sqlite),
			"memory" | "mem" => Some(StorageKind::Memory),
			_ => None,
		}
	}
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
	pub backend: StorageKind,
	pub data_dir: PathBuf,
	/// Reports, loves and faults older than this are swept. Zero keeps them forever.
	pub retention_days: u32,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let backend = match file.storage.backend.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
			None => StorageKind::Sqlite,
			Some(s) => StorageKind::parse(s).unwrap_or_else(|| {
				warn!(backend = s, "storage config: unknown backend; using sqlite");
				StorageKind::Sqlite
			}),
		};

		Self {
			server: ServerSettings {
				bind: file
					.server
					.bind
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| DEFAULT_BIND.to_string()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				max_message_bytes: file.server.max_message_bytes.unwrap_or(512),
				write_wait: Duration::from_secs(file.server.write_wait_secs.unwrap_or(10)),
				pong_wait: Duration::from_secs(file.server.pong_wait_secs.unwrap_or(60)),
				outbound_queue: file.server.outbound_queue.unwrap_or(256),
			},
			game: GameSettings {
				tile_lock_ttl_secs: file.game.tile_lock_ttl_secs.unwrap_or(600),
				bucket_size: file.game.bucket_size.unwrap_or(8),
				bucket_rate_secs: file.game.bucket_rate_secs.unwrap_or(15),
				timestamp_unit_secs: file.game.timestamp_unit_secs.unwrap_or(60),
				moderators: file
					.game
					.moderators
					.into_iter()
					.map(|s| s.trim().to_string())
					.filter(|s| !s.is_empty())
					.collect(),
			},
			storage: StorageSettings {
				backend,
				data_dir: file
					.storage
					.data_dir
					.filter(|s| !s.trim().is_empty())
					.map(PathBuf::from)
					.unwrap_or_else(default_data_dir),
				retention_days: file.storage.retention_days.unwrap_or(30),
			},
		}
	}

	/// Clamp values that would stall the server.
	fn normalize(&mut self) {
		if self.game.timestamp_unit_secs == 0 {
			warn!("game config: timestamp_unit_secs = 0; using 1");
			self.game.timestamp_unit_secs = 1;
		}
		if self.game.bucket_rate_secs == 0 {
			warn!("game config: bucket_rate_secs = 0; using 1");
			self.game.bucket_rate_secs = 1;
		}
		if self.server.outbound_queue == 0 {
			warn!("server config: outbound_queue = 0; using 1");
			self.server.outbound_queue = 1;
		}
		if self.server.pong_wait.is_zero() {
			warn!("server config: pong_wait_secs = 0; using 60");
			self.server.pong_wait = Duration::from_secs(60);
		}
	}

	pub fn is_moderator(&self, external_id: &str) -> bool {
		self.game.moderators.iter().any(|m| m == external_id)
	}

	pub fn repo_settings(&self) -> RepoSettings {
		RepoSettings {
			lock_ttl_secs: self.game.tile_lock_ttl_secs,
			bucket: BucketPolicy {
				size: self.game.bucket_size,
				rate_secs: self.game.bucket_rate_secs,
			},
			timestamp_unit_secs: self.game.timestamp_unit_secs,
		}
	}

	pub fn store_backend(&self) -> StoreBackend {
		match self.storage.backend {
			StorageKind::Memory => StoreBackend::Memory,
			StorageKind::Sqlite => StoreBackend::Sqlite {
				dir: self.storage.data_dir.clone(),
			},
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,
	#[serde(default)]
	game: FileGameSettings,
	#[serde(default)]
	storage: FileStorageSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	bind: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	max_message_bytes: Option<usize>,
	write_wait_secs: Option<u64>,
	pong_wait_secs: Option<u64>,
	outbound_queue: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileGameSettings {
	tile_lock_ttl_secs: Option<u32>,
	bucket_size: Option<u32>,
	bucket_rate_secs: Option<u32>,
	timestamp_unit_secs: Option<u32>,
	#[serde(default)]
	moderators: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStorageSettings {
	backend: Option<String>,
	data_dir: Option<String>,
	retention_days: Option<u32>,
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn env_string(name: &str) -> Option<String> {
	std::env::var(name)
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty())
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("TESSERA_BIND") {
		cfg.server.bind = v;
		info!("server config: bind overridden by env");
	}

	if let Some(v) = env_string("TESSERA_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("TESSERA_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = env_string("TESSERA_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Ok(v) = std::env::var("TESSERA_MAX_MESSAGE_BYTES")
		&& let Ok(bytes) = v.trim().parse::<usize>()
	{
		cfg.server.max_message_bytes = bytes;
		info!(bytes, "server config: max_message_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("TESSERA_WRITE_WAIT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.server.write_wait = Duration::from_secs(secs);
		info!(secs, "server config: write_wait_secs overridden by env");
	}

	if let Ok(v) = std::env::var("TESSERA_PONG_WAIT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.server.pong_wait = Duration::from_secs(secs);
		info!(secs, "server config: pong_wait_secs overridden by env");
	}

	if let Ok(v) = std::env::var("TESSERA_OUTBOUND_QUEUE")
		&& let Ok(capacity) = v.trim().parse::<usize>()
	{
		cfg.server.outbound_queue = capacity;
		info!(capacity, "server config: outbound_queue overridden by env");
	}

	if let Ok(v) = std::env::var("TESSERA_TILE_LOCK_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u32>()
	{
		cfg.game.tile_lock_ttl_secs = secs;
		info!(secs, "game config: tile_lock_ttl_secs overridden by env");
	}

	if let Ok(v) = std::env::var("TESSERA_BUCKET_SIZE")
		&& let Ok(size) = v.trim().parse::<u32>()
	{
		cfg.game.bucket_size = size;
		info!(size, "game config: bucket_size overridden by env");
	}

	if let Ok(v) = std::env::var("TESSERA_BUCKET_RATE_SECS")
		&& let Ok(secs) = v.trim().parse::<u32>()
	{
		cfg.game.bucket_rate_secs = secs;
		info!(secs, "game config: bucket_rate_secs overridden by env");
	}

	if let Ok(v) = std::env::var("TESSERA_TIMESTAMP_UNIT_SECS")
		&& let Ok(secs) = v.trim().parse::<u32>()
	{
		cfg.game.timestamp_unit_secs = secs;
		info!(secs, "game config: timestamp_unit_secs overridden by env");
	}

	if let Some(v) = env_string("TESSERA_MODERATORS") {
		cfg.game.moderators = parse_list(&v);
		info!(count = cfg.game.moderators.len(), "game config: moderators overridden by env");
	}

	if let Some(v) = env_string("TESSERA_STORAGE_BACKEND") {
		match StorageKind::parse(&v) {
			Some(kind) => {
				cfg.storage.backend = kind;
				info!(backend = %v, "storage config: backend overridden by env");
			}
			None => warn!(backend = %v, "storage config: ignoring unknown backend from env"),
		}
	}

	if let Some(v) = env_string("TESSERA_DATA_DIR") {
		cfg.storage.data_dir = PathBuf::from(v);
		info!("storage config: data_dir overridden by env");
	}

	if let Ok(v) = std::env::var("TESSERA_RETENTION_DAYS")
		&& let Ok(days) = v.trim().parse::<u32>()
	{
		cfg.storage.retention_days = days;
		info!(days, "storage config: retention_days overridden by env");
	}
}

fn parse_list(v: &str) -> Vec<String> {
	v.split(',')
		.map(|s| s.trim().to_string())
		.filter(|s| !s.is_empty())
		.collect()
}
