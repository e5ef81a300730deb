#![forbid(unsafe_code)]

use tessera_store::Repos;

use crate::config::ServerConfig;
use crate::server::hub::HubHandle;

/// Everything a connection needs, shared across all of them.
pub struct AppState {
	pub config: ServerConfig,
	pub repos: Repos,
	pub hub: HubHandle,
}

impl AppState {
	pub fn new(config: ServerConfig, repos: Repos, hub: HubHandle) -> Self {
		Self { config, repos, hub }
	}
}
