//! Read-side HTTP surface. Everything here consumes the store and the hub;
//! writes go through the persistence queue like any other mutation.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::watch;

use crate::analytics::AnomalyDetector;
use crate::ca::CertificateAuthority;
use crate::hub::Hub;
use crate::pricing::{PricingEntry, PricingTable};
use crate::store::queue::{PersistQueue, WorkItem};
use crate::store::{FlowFilter, StatsGroup, Store};
use crate::tasks::TaskAssigner;
use crate::types::{Flow, Provider};

mod export;

pub struct ApiState {
	pub store: Arc<Store>,
	pub hub: Arc<Hub>,
	pub assigner: Arc<TaskAssigner>,
	pub pricing: Arc<PricingTable>,
	pub queue: Arc<PersistQueue>,
	pub ca: Arc<CertificateAuthority>,
	pub detector: AnomalyDetector,
	pub auth_token: String,
}

pub fn router(state: Arc<ApiState>) -> Router {
	let protected = Router::new()
		.route("/api/flows", get(list_flows))
		.route("/api/flows/{id}", get(get_flow))
		.route("/api/flows/{id}/events", get(get_events))
		.route("/api/flows/{id}/tools", get(get_flow_tools))
		.route("/api/tools", get(get_tools_by_name))
		.route("/api/export", get(export::export_flows))
		.route("/api/stats", get(stats))
		.route("/api/anomalies", get(anomalies))
		.route("/api/tasks", get(tasks))
		.route("/api/drops", get(drops))
		.route("/api/pricing", get(get_pricing).put(put_pricing))
		.route("/api/settings", get(get_settings).put(put_settings))
		.route("/ws", get(ws_subscribe))
		.layer(middleware::from_fn_with_state(state.clone(), auth));

	Router::new()
		.route("/healthz", get(|| async { "ok" }))
		.route("/crl.der", get(crl))
		.merge(protected)
		.layer(tower_http::trace::TraceLayer::new_for_http())
		.layer(tower_http::limit::RequestBodyLimitLayer::new(4 * 1024 * 1024))
		.with_state(state)
}

pub async fn serve(
	state: Arc<ApiState>,
	listener: tokio::net::TcpListener,
	mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
	let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
	axum::serve(listener, app)
		.with_graceful_shutdown(async move {
			let _ = shutdown.changed().await;
		})
		.await
}

/// Bearer-token auth: cookie, Authorization header, or (local-only
/// convenience) a query parameter. Comparison is constant-time; the origin,
/// when present, must be loopback.
async fn auth(
	State(state): State<Arc<ApiState>>,
	ConnectInfo(peer): ConnectInfo<SocketAddr>,
	req: axum::extract::Request,
	next: middleware::Next,
) -> Response {
	if !peer.ip().is_loopback() {
		return StatusCode::FORBIDDEN.into_response();
	}
	if let Some(origin) = req.headers().get(header::ORIGIN)
		&& !origin_is_loopback(origin.to_str().unwrap_or(""))
	{
		return StatusCode::FORBIDDEN.into_response();
	}
	let presented = token_from_request(req.headers(), req.uri().query().unwrap_or(""));
	let ok = presented.is_some_and(|t| {
		t.len() == state.auth_token.len()
			&& t.as_bytes().ct_eq(state.auth_token.as_bytes()).into()
	});
	if !ok {
		return StatusCode::UNAUTHORIZED.into_response();
	}
	next.run(req).await
}

fn token_from_request(headers: &HeaderMap, query: &str) -> Option<String> {
	use headers::authorization::{Authorization, Bearer};
	use headers::HeaderMapExt;
	if let Some(bearer) = headers.typed_get::<Authorization<Bearer>>() {
		return Some(bearer.token().to_string());
	}
	if let Some(cookies) = headers.get(header::COOKIE)
		&& let Ok(cookies) = cookies.to_str()
	{
		for pair in cookies.split(';') {
			let pair = pair.trim();
			if let Some(token) = pair.strip_prefix("langley_token=") {
				return Some(token.to_string());
			}
		}
	}
	for pair in query.split('&') {
		if let Some(token) = pair.strip_prefix("token=") {
			return Some(token.to_string());
		}
	}
	None
}

fn origin_is_loopback(origin: &str) -> bool {
	url::Url::parse(origin)
		.ok()
		.and_then(|u| u.host_str().map(|h| h.to_string()))
		.is_some_and(|host| {
			host == "localhost"
				|| host
					.trim_start_matches('[')
					.trim_end_matches(']')
					.parse::<std::net::IpAddr>()
					.is_ok_and(|ip| ip.is_loopback())
		})
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
	host: Option<String>,
	task_id: Option<String>,
	model: Option<String>,
	provider: Option<Provider>,
	since: Option<DateTime<Utc>>,
	until: Option<DateTime<Utc>>,
	status_class: Option<u16>,
	offset: Option<u64>,
	limit: Option<u64>,
}

impl ListQuery {
	pub fn filter(&self) -> FlowFilter {
		FlowFilter {
			host: self.host.clone(),
			task_id: self.task_id.clone(),
			model: self.model.clone(),
			provider: self.provider,
			since: self.since,
			until: self.until,
			status_class: self.status_class,
			offset: self.offset.unwrap_or(0),
			limit: self.limit.unwrap_or(100).min(1000),
		}
	}
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FlowPage {
	flows: Vec<Flow>,
	total: u64,
	offset: u64,
}

enum ApiError {
	Store(crate::store::StoreError),
	NotFound,
	BadRequest(String),
}

impl From<crate::store::StoreError> for ApiError {
	fn from(e: crate::store::StoreError) -> ApiError {
		ApiError::Store(e)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		match self {
			ApiError::Store(e) => {
				tracing::error!(error = %e, "store query failed");
				(StatusCode::INTERNAL_SERVER_ERROR, "store error").into_response()
			},
			ApiError::NotFound => StatusCode::NOT_FOUND.into_response(),
			ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
		}
	}
}

async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
	T: Send + 'static,
	F: FnOnce() -> Result<T, crate::store::StoreError> + Send + 'static,
{
	tokio::task::spawn_blocking(f)
		.await
		.map_err(|e| ApiError::BadRequest(format!("task join: {e}")))?
		.map_err(ApiError::from)
}

async fn list_flows(
	State(state): State<Arc<ApiState>>,
	Query(query): Query<ListQuery>,
) -> Result<Json<FlowPage>, ApiError> {
	let filter = query.filter();
	let store = state.store.clone();
	let offset = filter.offset;
	let page = blocking(move || {
		let flows = store.list_flows(&filter)?;
		let total = store.count_flows(&filter)?;
		Ok(FlowPage {
			flows,
			total,
			offset,
		})
	})
	.await?;
	Ok(Json(page))
}

async fn get_flow(
	State(state): State<Arc<ApiState>>,
	AxumPath(id): AxumPath<String>,
) -> Result<Json<Flow>, ApiError> {
	let store = state.store.clone();
	let flow = blocking(move || store.get_flow(&id)).await?;
	flow.map(Json).ok_or(ApiError::NotFound)
}

async fn get_events(
	State(state): State<Arc<ApiState>>,
	AxumPath(id): AxumPath<String>,
) -> Result<Json<Vec<crate::types::Event>>, ApiError> {
	let store = state.store.clone();
	Ok(Json(blocking(move || store.get_events(&id)).await?))
}

async fn get_flow_tools(
	State(state): State<Arc<ApiState>>,
	AxumPath(id): AxumPath<String>,
) -> Result<Json<Vec<crate::types::ToolInvocation>>, ApiError> {
	let store = state.store.clone();
	Ok(Json(
		blocking(move || store.get_tool_invocations(&id)).await?,
	))
}

#[derive(Deserialize)]
struct ToolQuery {
	name: String,
	#[serde(default)]
	limit: Option<u64>,
}

async fn get_tools_by_name(
	State(state): State<Arc<ApiState>>,
	Query(query): Query<ToolQuery>,
) -> Result<Json<Vec<crate::types::ToolInvocation>>, ApiError> {
	let store = state.store.clone();
	let limit = query.limit.unwrap_or(100).min(1000);
	Ok(Json(
		blocking(move || store.get_tool_invocations_by_name(&query.name, limit)).await?,
	))
}

#[derive(Deserialize)]
struct StatsQuery {
	#[serde(default = "default_group")]
	group: StatsGroup,
}

fn default_group() -> StatsGroup {
	StatsGroup::Model
}

async fn stats(
	State(state): State<Arc<ApiState>>,
	Query(query): Query<StatsQuery>,
	Query(list): Query<ListQuery>,
) -> Result<Json<Vec<crate::store::StatsRow>>, ApiError> {
	let store = state.store.clone();
	let filter = list.filter();
	Ok(Json(
		blocking(move || store.stats(&filter, query.group)).await?,
	))
}

async fn anomalies(
	State(state): State<Arc<ApiState>>,
	Query(query): Query<ListQuery>,
) -> Result<Json<Vec<crate::analytics::Anomaly>>, ApiError> {
	let store = state.store.clone();
	let filter = query.filter();
	let detector = AnomalyDetector::new(detector_config(&state));
	let found = blocking(move || {
		let mut found = Vec::new();
		for flow in store.list_flows(&filter)? {
			let tools = store.get_tool_invocations(&flow.id)?;
			found.extend(detector.check_flow(&flow, &tools));
		}
		found.extend(detector.check_rapid_repeats(&store)?);
		Ok(found)
	})
	.await?;
	Ok(Json(found))
}

fn detector_config(state: &ApiState) -> crate::config::AnalyticsConfig {
	state.detector.config().clone()
}

async fn tasks(
	State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<crate::store::TaskSummary>>, ApiError> {
	let store = state.store.clone();
	Ok(Json(blocking(move || store.list_tasks(200)).await?))
}

async fn drops(
	State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<crate::types::DropLogEntry>>, ApiError> {
	let store = state.store.clone();
	Ok(Json(blocking(move || store.recent_drops(200)).await?))
}

async fn get_pricing(
	State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<PricingEntry>>, ApiError> {
	Ok(Json(state.pricing.entries()))
}

async fn put_pricing(
	State(state): State<Arc<ApiState>>,
	Json(entries): Json<Vec<PricingEntry>>,
) -> Result<StatusCode, ApiError> {
	if entries.is_empty() {
		return Err(ApiError::BadRequest("pricing must not be empty".to_string()));
	}
	// The writer commits, then mirrors into the in-memory table.
	state.queue.push(WorkItem::ReplacePricing(entries));
	Ok(StatusCode::ACCEPTED)
}

#[derive(Serialize, Deserialize)]
struct Settings {
	idle_gap_minutes: u64,
}

async fn get_settings(State(state): State<Arc<ApiState>>) -> Json<Settings> {
	Json(Settings {
		idle_gap_minutes: state.assigner.idle_gap_minutes(),
	})
}

async fn put_settings(
	State(state): State<Arc<ApiState>>,
	Json(settings): Json<Settings>,
) -> Result<Json<Settings>, ApiError> {
	if !(1..=60).contains(&settings.idle_gap_minutes) {
		return Err(ApiError::BadRequest(
			"idle_gap_minutes must be 1..=60".to_string(),
		));
	}
	state.assigner.set_idle_gap_minutes(settings.idle_gap_minutes);
	state.queue.push(WorkItem::PutSetting(
		"idle_gap_minutes".to_string(),
		settings.idle_gap_minutes.to_string(),
	));
	Ok(Json(Settings {
		idle_gap_minutes: state.assigner.idle_gap_minutes(),
	}))
}

async fn crl(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
	(
		[(header::CONTENT_TYPE, "application/pkix-crl")],
		state.ca.crl_der(),
	)
}

async fn ws_subscribe(
	State(state): State<Arc<ApiState>>,
	ws: WebSocketUpgrade,
) -> Response {
	ws.on_upgrade(move |socket| observer_loop(socket, state))
}

async fn observer_loop(mut socket: WebSocket, state: Arc<ApiState>) {
	let (id, mut rx) = state.hub.subscribe();
	loop {
		tokio::select! {
			outbound = rx.recv() => {
				match outbound {
					Some(msg) => {
						let Ok(text) = serde_json::to_string(&msg) else { continue };
						if socket.send(Message::Text(text.into())).await.is_err() {
							break;
						}
					},
					None => break,
				}
			},
			inbound = socket.recv() => {
				match inbound {
					Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
					Some(Ok(_)) => {},
				}
			},
		}
	}
	state.hub.unsubscribe(id);
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn token_sources_in_order() {
		let mut headers = HeaderMap::new();
		headers.insert(header::AUTHORIZATION, "Bearer abc".parse().unwrap());
		assert_eq!(token_from_request(&headers, ""), Some("abc".to_string()));

		let mut headers = HeaderMap::new();
		headers.insert(
			header::COOKIE,
			"other=1; langley_token=fromcookie".parse().unwrap(),
		);
		assert_eq!(
			token_from_request(&headers, ""),
			Some("fromcookie".to_string())
		);

		let headers = HeaderMap::new();
		assert_eq!(
			token_from_request(&headers, "a=1&token=fromquery"),
			Some("fromquery".to_string())
		);
		assert_eq!(token_from_request(&headers, "a=1"), None);
	}

	#[test]
	fn origin_check() {
		assert!(origin_is_loopback("http://localhost:3000"));
		assert!(origin_is_loopback("http://127.0.0.1:9091"));
		assert!(origin_is_loopback("http://[::1]:9091"));
		assert!(!origin_is_loopback("https://evil.example.com"));
		assert!(!origin_is_loopback("not a url"));
	}

	#[test]
	fn list_query_clamps_limit() {
		let q = ListQuery {
			limit: Some(10_000),
			..Default::default()
		};
		assert_eq!(q.filter().limit, 1000);
	}
}
