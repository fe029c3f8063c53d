//! Langley: a local HTTPS interception proxy that records LLM traffic.
//!
//! The data plane (proxy -> redactor -> task assigner -> queue -> writer)
//! never blocks on persistence; the read plane (HTTP API + WebSocket hub)
//! shares the store and the hub with it. See DESIGN.md for the layout.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::watch;

pub mod analytics;
pub mod api;
pub mod ca;
pub mod config;
pub mod errors;
pub mod hub;
pub mod llm;
pub mod parse;
pub mod pricing;
pub mod proxy;
pub mod redact;
pub mod statefile;
pub mod store;
pub mod tasks;
pub mod types;

use analytics::AnomalyDetector;
use ca::CertificateAuthority;
use ca::cache::CertCache;
use config::Config;
use errors::{ActionableError, InitError};
use hub::Hub;
use llm::Registry;
use pricing::PricingTable;
use proxy::ProxyState;
use proxy::upstream::UpstreamConnector;
use redact::Redactor;
use statefile::StateFile;
use store::queue::PersistQueue;
use store::{FlowLedger, Store};
use tasks::TaskAssigner;

/// Queue drain budget during graceful shutdown.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);

/// Run the proxy until `shutdown` flips. Returns only after the writer has
/// flushed and the store is closed; classified failures map to exit code 1.
pub async fn run(
	config_dir: Option<PathBuf>,
	mut shutdown: watch::Receiver<bool>,
) -> Result<(), InitError> {
	let dir = match config_dir {
		Some(dir) => dir,
		None => config::default_config_dir()?,
	};
	std::fs::create_dir_all(&dir).map_err(|e| {
		InitError::Io(ActionableError::new(
			format!("cannot create {}", dir.display()),
			e.to_string(),
			"check permissions on the parent directory",
		))
	})?;
	let cfg = Config::load_or_init(&dir)?;
	let proxy_addr = cfg.proxy_addr()?;
	let api_addr = cfg.api_addr()?;

	let crl_url = format!("http://{api_addr}/crl.der");
	let ca = Arc::new(CertificateAuthority::load_or_create(&dir, &crl_url)?);

	let queue = Arc::new(PersistQueue::new(
		cfg.persistence.queue_capacity,
		cfg.persistence.queue_max_bytes,
		cfg.persistence.per_flow_max_bytes,
	));
	let ledger = Arc::new(FlowLedger::default());
	let pricing = Arc::new(PricingTable::seeded());
	let hub = Arc::new(Hub::default());

	let db_path = cfg.db_path(&dir);
	let writer = store::writer::spawn(
		db_path.clone(),
		queue.clone(),
		hub.clone(),
		ledger.clone(),
		pricing.clone(),
		cfg.persistence.clone(),
		cfg.retention.clone(),
	)?;
	let store = Arc::new(Store::open(&db_path).map_err(|e| {
		InitError::DatabaseLocked(ActionableError::new(
			format!("cannot open {}", db_path.display()),
			e.to_string(),
			"another langley instance may be running",
		))
	})?);

	// Runtime-adjusted settings survive restarts through the store.
	let mut idle_gap = cfg.task.idle_gap_minutes;
	if let Ok(Some(saved)) = store.get_setting("idle_gap_minutes")
		&& let Ok(saved) = saved.parse::<u64>()
	{
		idle_gap = saved.clamp(1, 60);
	}
	let assigner = Arc::new(TaskAssigner::new(idle_gap));

	let redactor = Redactor::new(&cfg.redaction, cfg.persistence.body_max_bytes).map_err(|e| {
		InitError::Config(ActionableError::new(
			"invalid redaction pattern",
			e.to_string(),
			"fix redaction.pattern_redact_headers in config.yaml",
		))
	})?;
	let upstream = UpstreamConnector::new(&cfg.proxy.insecure_hosts).map_err(|e| {
		InitError::Io(ActionableError::new(
			"cannot load system root certificates",
			e.to_string(),
			"check the system trust store",
		))
	})?;
	let cert_cache = Arc::new(CertCache::new(ca.clone(), ca::cache::DEFAULT_CAPACITY));

	let proxy_state = Arc::new(ProxyState {
		redactor,
		assigner: assigner.clone(),
		registry: Registry::new(),
		pricing: pricing.clone(),
		queue: queue.clone(),
		cert_cache,
		upstream,
		body_max_bytes: cfg.persistence.body_max_bytes,
		disable_body_storage: cfg.redaction.disable_body_storage,
		store_raw_bodies: cfg.redaction.store_raw_bodies,
		signature: cfg.task.signature,
	});

	let proxy_listener = bind(proxy_addr, "proxy.listen").await?;
	let api_listener = bind(api_addr, "api.listen").await?;

	StateFile {
		proxy_addr,
		api_addr,
		ca_path: ca.cert_path().to_path_buf(),
		pid: std::process::id(),
		started_at: Utc::now(),
	}
	.write(&dir)
	.map_err(|e| {
		InitError::Io(ActionableError::new(
			"cannot write state.json",
			e.to_string(),
			"check permissions on the config directory",
		))
	})?;

	let api_state = Arc::new(api::ApiState {
		store: store.clone(),
		hub: hub.clone(),
		assigner: assigner.clone(),
		pricing: pricing.clone(),
		queue: queue.clone(),
		ca: ca.clone(),
		detector: AnomalyDetector::new(cfg.analytics.clone()),
		auth_token: cfg.auth.token.clone().unwrap_or_default(),
	});

	tracing::info!(proxy = %proxy_addr, api = %api_addr, "langley listening");

	let mut tasks = tokio::task::JoinSet::new();
	tasks.spawn(proxy::run(
		proxy_state.clone(),
		proxy_listener,
		shutdown.clone(),
	));
	{
		let api_state = api_state.clone();
		let shutdown = shutdown.clone();
		tasks.spawn(async move {
			if let Err(e) = api::serve(api_state, api_listener, shutdown).await {
				tracing::error!(error = %e, "api server failed");
			}
		});
	}
	tasks.spawn(store::retention::run(
		queue.clone(),
		cfg.retention.sweep_interval_minutes,
		shutdown.clone(),
	));
	tasks.spawn(ca::run_crl_refresher(ca.clone(), shutdown.clone()));
	tasks.spawn(hub.clone().run_pinger(shutdown.clone()));

	// Park until the shutdown signal.
	let _ = shutdown.changed().await;
	tracing::info!("shutdown requested; draining");

	// Stop accepting (the tasks watch the same signal), give the queue a
	// bounded drain, then flush the writer and close up.
	let drain_start = std::time::Instant::now();
	while !queue.is_empty() && drain_start.elapsed() < DRAIN_DEADLINE {
		tokio::time::sleep(Duration::from_millis(50)).await;
	}
	if !queue.is_empty() {
		tracing::warn!(remaining = queue.len(), "drain deadline hit; dropping remaining items");
	}
	queue.close();
	tokio::task::spawn_blocking(move || writer.join())
		.await
		.ok();
	hub.shutdown();
	tasks.abort_all();
	tracing::info!("shutdown complete");
	Ok(())
}

async fn bind(addr: SocketAddr, field: &str) -> Result<TcpListener, InitError> {
	TcpListener::bind(addr).await.map_err(|e| {
		if e.kind() == std::io::ErrorKind::AddrInUse {
			InitError::PortInUse(ActionableError::new(
				format!("cannot bind {addr}"),
				"address already in use".to_string(),
				format!("stop the other process or change {field}"),
			))
		} else {
			InitError::Io(ActionableError::new(
				format!("cannot bind {addr}"),
				e.to_string(),
				format!("check {field} in config.yaml"),
			))
		}
	})
}
