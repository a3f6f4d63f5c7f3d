#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parley_domain::UserId;
use parley_server::broker::{ChannelHub, ChannelHubConfig};
use parley_server::config::{self, ServerConfig};
use parley_server::engine::ChatService;
use parley_server::server::api::{ApiSettings, ApiState, spawn_api_server};
use parley_server::server::auth::HmacSessions;
use parley_server::server::health::{HealthState, spawn_health_server};
use parley_server::store::open_store;
use parley_util::endpoint::HttpEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind http://host:port] [--issue-token USER]\n\
\n\
Options:\n\
\t--bind          Bind endpoint (default: http://127.0.0.1:18300)\n\
\t               Format: http://host:port\n\
\t--issue-token   Print a session token for USER signed with the configured secret, then exit\n\
\t--help         Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: SocketAddr,
	issue_token_for: Option<String>,
}

fn parse_args() -> Args {
	let mut bind_endpoint = "http://127.0.0.1:18300".to_string();
	let mut issue_token_for = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected http://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			"--issue-token" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				issue_token_for = Some(v);
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = HttpEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let bind: SocketAddr = bind.socket_addr().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args { bind, issue_token_for }
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("parley_server");
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

	match bind.parse::<SocketAddr>() {
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

fn sessions(cfg: &ServerConfig) -> anyhow::Result<HmacSessions> {
	let secret = cfg.server.auth_hmac_secret.clone().ok_or_else(|| {
		anyhow::anyhow!("server.auth_hmac_secret (or PARLEY_AUTH_HMAC_SECRET) must be configured")
	})?;
	Ok(HmacSessions::new(secret))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = config::default_config_path()?;
	let server_cfg = config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(user) = args.issue_token_for {
		let user = UserId::new(user)?;
		println!("{}", sessions(&server_cfg)?.issue(&user, DEFAULT_TOKEN_TTL)?);
		return Ok(());
	}

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let store = open_store(&server_cfg.persistence).await?;
	let hub = ChannelHub::new(ChannelHubConfig {
		subscriber_queue_capacity: server_cfg.server.subscriber_queue_capacity,
		debug_logs: false,
	});
	let service = Arc::new(ChatService::new(
		store,
		Arc::new(hub.clone()),
		server_cfg.reconcile.match_window_ms,
	));

	let state = Arc::new(ApiState {
		service,
		sessions: Arc::new(sessions(&server_cfg)?),
		hub: hub.clone(),
		settings: ApiSettings {
			max_body_bytes: server_cfg.server.max_body_bytes,
			keepalive: Duration::from_secs(server_cfg.server.keepalive_secs),
			..ApiSettings::default()
		},
	});

	let (local, api_task) = spawn_api_server(args.bind, state).await?;
	health_state.mark_ready();
	info!(bind = %local, "parley_server ready");

	tokio::select! {
		_ = tokio::signal::ctrl_c() => info!("shutdown requested"),
		res = api_task => warn!(?res, "api server task exited"),
	}

	health_state.mark_not_ready();
	hub.close().await;
	Ok(())
}
