//! Proxy listener and MITM tunnel serving.
//!
//! `CONNECT` tunnels are answered, upgraded, TLS-terminated with a forged
//! leaf selected by SNI, then served as ordinary HTTP (1.1 or 2) where each
//! request becomes one recorded exchange. Plain absolute-form requests are
//! proxied directly. WebSocket upgrades pass through untouched.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;

use crate::ca::cache::CertCache;
use crate::llm::Registry;
use crate::pricing::PricingTable;
use crate::redact::Redactor;
use crate::store::queue::PersistQueue;
use crate::tasks::TaskAssigner;

pub mod exchange;
pub mod tee;
pub mod upstream;

use tee::TeeBody;
use upstream::UpstreamConnector;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;

pub fn empty_body() -> ProxyBody {
	Empty::<Bytes>::new()
		.map_err(|never| match never {})
		.boxed_unsync()
}

pub fn full_body(text: &'static str) -> ProxyBody {
	Full::new(Bytes::from_static(text.as_bytes()))
		.map_err(|never| match never {})
		.boxed_unsync()
}

/// Everything an exchange needs, shared across all connections.
pub struct ProxyState {
	pub redactor: Redactor,
	pub assigner: Arc<TaskAssigner>,
	pub registry: Registry,
	pub pricing: Arc<PricingTable>,
	pub queue: Arc<PersistQueue>,
	pub cert_cache: Arc<CertCache>,
	pub upstream: UpstreamConnector,
	pub body_max_bytes: usize,
	pub disable_body_storage: bool,
	pub store_raw_bodies: bool,
	pub signature: bool,
}

impl ProxyState {
	#[cfg(test)]
	pub(crate) fn for_tests() -> ProxyState {
		use crate::ca::CertificateAuthority;
		let dir = tempfile::tempdir().unwrap();
		let ca = Arc::new(
			CertificateAuthority::load_or_create(dir.path(), "http://127.0.0.1:9091/crl.der").unwrap(),
		);
		// Keep the CA files alive for the duration of the test process.
		std::mem::forget(dir);
		ProxyState {
			redactor: Redactor::new(&crate::config::RedactionConfig::default(), 1_048_576).unwrap(),
			assigner: Arc::new(TaskAssigner::new(5)),
			registry: Registry::new(),
			pricing: Arc::new(PricingTable::seeded()),
			queue: Arc::new(PersistQueue::new(1000, 1 << 24, 1 << 22)),
			cert_cache: Arc::new(CertCache::new(ca, 16)),
			upstream: UpstreamConnector::new(&[]).unwrap(),
			body_max_bytes: 1_048_576,
			disable_body_storage: false,
			store_raw_bodies: false,
			signature: false,
		}
	}
}

/// Accept loop. Stops accepting when the shutdown signal fires; in-flight
/// tunnels finish on their own time within the drain deadline.
pub async fn run(
	state: Arc<ProxyState>,
	listener: TcpListener,
	mut shutdown: watch::Receiver<bool>,
) {
	loop {
		tokio::select! {
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						let _ = stream.set_nodelay(true);
						let state = state.clone();
						tokio::spawn(async move {
							let service = service_fn(move |req| route(state.clone(), req));
							let conn = hyper::server::conn::http1::Builder::new()
								.preserve_header_case(true)
								.serve_connection(TokioIo::new(stream), service)
								.with_upgrades();
							if let Err(e) = conn.await {
								tracing::debug!(peer = %peer, error = %e, "proxy connection ended");
							}
						});
					},
					Err(e) => {
						tracing::warn!(error = %e, "accept failed");
						tokio::time::sleep(std::time::Duration::from_millis(100)).await;
					},
				}
			},
			_ = shutdown.changed() => {
				tracing::info!("proxy listener stopping");
				break;
			},
		}
	}
}

async fn route(
	state: Arc<ProxyState>,
	req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
	if req.method() == Method::CONNECT {
		Ok(handle_connect(state, req))
	} else {
		Ok(handle_direct(state, req).await)
	}
}

fn handle_connect(state: Arc<ProxyState>, req: Request<Incoming>) -> Response<ProxyBody> {
	let Some(authority) = req.uri().authority().cloned() else {
		return status_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
	};
	let host = authority.host().to_string();
	let port = authority.port_u16().unwrap_or(443);
	tokio::spawn(async move {
		match hyper::upgrade::on(req).await {
			Ok(upgraded) => {
				if let Err(e) = serve_tunnel(state, TokioIo::new(upgraded), host.clone(), port).await {
					tracing::debug!(host = %host, error = %e, "tunnel ended");
				}
			},
			Err(e) => tracing::debug!(error = %e, "CONNECT upgrade failed"),
		}
	});
	// 200 Connection Established; the TLS handshake follows on the upgrade.
	Response::new(empty_body())
}

async fn serve_tunnel(
	state: Arc<ProxyState>,
	io: TokioIo<hyper::upgrade::Upgraded>,
	connect_host: String,
	port: u16,
) -> anyhow::Result<()> {
	let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), io);
	let start = acceptor.await?;
	let sni = start
		.client_hello()
		.server_name()
		.map(|s| s.to_string());
	// SNI wins over the CONNECT authority; they agree for sane clients.
	let host = sni.unwrap_or_else(|| connect_host.clone());
	let config = state.cert_cache.server_config(&host)?;
	let tls = start.into_stream(config).await?;

	let upstream: Arc<tokio::sync::Mutex<Option<SendRequest<TeeBody<Incoming>>>>> =
		Arc::new(tokio::sync::Mutex::new(None));
	let service = service_fn(move |req| {
		tunnel_exchange(state.clone(), host.clone(), port, upstream.clone(), req)
	});
	hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
		.serve_connection_with_upgrades(TokioIo::new(tls), service)
		.await
		.map_err(|e| anyhow::anyhow!("tunnel serve: {e}"))
}

async fn tunnel_exchange(
	state: Arc<ProxyState>,
	host: String,
	port: u16,
	upstream: Arc<tokio::sync::Mutex<Option<SendRequest<TeeBody<Incoming>>>>>,
	req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
	let mut slot = upstream.lock().await;
	if slot.as_ref().is_none_or(|sr| sr.is_closed()) {
		match connect_upstream(&state, &host, port).await {
			Ok(sr) => *slot = Some(sr),
			Err(e) => {
				// Upstream TLS/dial failure fails this exchange with a
				// synthetic 502; no insecure downgrade.
				tracing::warn!(host = %host, error = %e, "upstream unavailable");
				return Ok(status_response(
					StatusCode::BAD_GATEWAY,
					"langley: cannot reach upstream",
				));
			},
		}
	}
	let sr = slot.as_mut().expect("just connected");
	Ok(exchange::run(state.clone(), "https", host, req, sr).await)
}

async fn connect_upstream(
	state: &Arc<ProxyState>,
	host: &str,
	port: u16,
) -> anyhow::Result<SendRequest<TeeBody<Incoming>>> {
	let tls = state.upstream.connect(host, port).await?;
	let (sr, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
	let host = host.to_string();
	tokio::spawn(async move {
		if let Err(e) = conn.with_upgrades().await {
			tracing::debug!(host = %host, error = %e, "upstream connection closed");
		}
	});
	Ok(sr)
}

/// Plain (non-CONNECT) proxying of absolute-form requests, kept for clients
/// that do not tunnel. Same capture pipeline, no TLS interception.
async fn handle_direct(state: Arc<ProxyState>, req: Request<Incoming>) -> Response<ProxyBody> {
	let Some(host) = req.uri().host().map(str::to_string) else {
		return status_response(
			StatusCode::BAD_REQUEST,
			"proxy requests must use absolute-form URIs",
		);
	};
	let port = req.uri().port_u16().unwrap_or(80);

	let tcp = match tokio::net::TcpStream::connect((host.as_str(), port)).await {
		Ok(tcp) => tcp,
		Err(e) => {
			tracing::warn!(host = %host, error = %e, "direct dial failed");
			return status_response(StatusCode::BAD_GATEWAY, "langley: cannot reach upstream");
		},
	};
	let _ = tcp.set_nodelay(true);
	let (mut sr, conn) = match hyper::client::conn::http1::handshake::<_, TeeBody<Incoming>>(
		TokioIo::new(tcp),
	)
	.await
	{
		Ok(pair) => pair,
		Err(e) => {
			tracing::warn!(host = %host, error = %e, "direct handshake failed");
			return status_response(StatusCode::BAD_GATEWAY, "langley: cannot reach upstream");
		},
	};
	{
		let host = host.clone();
		tokio::spawn(async move {
			if let Err(e) = conn.with_upgrades().await {
				tracing::debug!(host = %host, error = %e, "direct connection closed");
			}
		});
	}

	// Origin-form for the upstream server.
	let (mut parts, body) = req.into_parts();
	let origin: Uri = parts
		.uri
		.path_and_query()
		.map(|pq| pq.as_str())
		.unwrap_or("/")
		.parse()
		.unwrap_or_else(|_| Uri::from_static("/"));
	parts.uri = origin;
	let req = Request::from_parts(parts, body);

	exchange::run(state, "http", host, req, &mut sr).await
}

fn status_response(status: StatusCode, text: &'static str) -> Response<ProxyBody> {
	let mut resp = Response::new(full_body(text));
	*resp.status_mut() = status;
	resp
}
