#![forbid(unsafe_code)]

mod config;
mod server;
mod util;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use tessera_store::{Repos, StoreFactory};
use tessera_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::server::connection::serve;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::hub::{HubConfig, spawn_hub};
use crate::server::maintenance::spawn_maintenance;
use crate::server::state::AppState;

const TESSERA_CONFIG_ENV: &str = "TESSERA_CONFIG";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: tessera_server [--bind ws://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default from config, else {})\n\
\t         Format: ws://host:port\n\
\t--help   Show this help\n\
",
		crate::config::DEFAULT_BIND
	);
	std::process::exit(2)
}

/// Returns the `--bind` override, if any.
fn parse_args() -> Option<String> {
	let mut bind = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				bind = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tessera_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("tessera_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn config_path() -> anyhow::Result<PathBuf> {
	match std::env::var(TESSERA_CONFIG_ENV) {
		Ok(path) if !path.trim().is_empty() => Ok(PathBuf::from(path.trim())),
		_ => crate::config::default_config_path(),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let bind_override = parse_args();

	let config_path = config_path()?;
	let mut server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");
	if let Some(bind) = bind_override {
		server_cfg.server.bind = bind;
	}

	let bind = WsEndpoint::parse(&server_cfg.server.bind).context("parse bind endpoint")?;
	let bind_addr = bind.socket_addr().context("resolve bind endpoint")?;

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	if server_cfg.server.auth_hmac_secret.is_none() {
		warn!("no auth secret configured; every connection will be anonymous");
	}

	let factory = Arc::new(StoreFactory::new(server_cfg.store_backend()));
	let repos = Repos::open(factory, server_cfg.repo_settings())
		.await
		.context("open storage")?;
	info!(backend = ?server_cfg.storage.backend, "storage ready");

	let (hub, _hub_task) = spawn_hub(HubConfig::default());
	let state = Arc::new(AppState::new(server_cfg, repos, hub));
	let _maintenance = spawn_maintenance(Arc::clone(&state));

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {}", bind.url()))?;
	info!(bind = %bind.url(), "tessera_server: websocket endpoint ready");

	health_state.mark_ready();
	serve(listener, state).await
}
