//! One intercepted HTTP exchange end-to-end: request tee -> skeleton row ->
//! upstream forward -> response tee -> streaming parse -> final update.
//! Bytes flow to the client unbuffered; everything else happens on the side.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{Request, Response, StatusCode, header};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::upgrade::OnUpgrade;
use serde_json::Value;
use tokio::sync::oneshot;

use super::tee::{RawCapture, TeeBody, drain_capture};
use super::{ProxyBody, ProxyState, empty_body};
use crate::llm::ParsedEvent;
use crate::parse::sse::SseParser;
use crate::store::queue::{Enqueue, FlowFinal, WorkItem};
use crate::types::{
	BodyCapture, Event, Flow, Integrity, Priority, Provider, ToolInvocation, Usage, mono_now,
	new_flow_id,
};

/// Handed from the request-capture task to the response-capture task once
/// the skeleton row has been enqueued.
struct SkeletonInfo {
	task_id: Option<String>,
	request_model: Option<String>,
}

/// Run one exchange. The returned response streams the upstream body to the
/// client; capture, parsing, and persistence ride the tees.
pub async fn run(
	state: Arc<ProxyState>,
	scheme: &'static str,
	host: String,
	req: Request<Incoming>,
	send: &mut SendRequest<TeeBody<Incoming>>,
) -> Response<ProxyBody> {
	let flow_id = new_flow_id();
	let started = Instant::now();
	let timestamp = Utc::now();
	let timestamp_mono = mono_now();
	let method = req.method().to_string();
	let path = req
		.uri()
		.path_and_query()
		.map(|p| p.as_str().to_string())
		.unwrap_or_else(|| "/".to_string());
	let url = format!("{scheme}://{host}{path}");
	let provider = state.registry.detect(&host);
	let request_headers = state.redactor.redact_headers(req.headers());
	let task_headers = req.headers().clone();

	let mut req = req;
	let client_upgrade = req.extensions_mut().remove::<OnUpgrade>();
	let wants_upgrade = req.headers().contains_key(header::UPGRADE);

	let (parts, body) = req.into_parts();
	let (req_tee, req_rx) = TeeBody::new(body);
	let forwarded_req = Request::from_parts(parts, req_tee);

	// Request capture: once headers plus the captured body prefix are in,
	// the skeleton row goes to the writer, before upstream has answered.
	let (skeleton_tx, skeleton_rx) = oneshot::channel::<SkeletonInfo>();
	{
		let state = state.clone();
		let flow_id = flow_id.clone();
		let host = host.clone();
		let method = method.clone();
		let path = path.clone();
		let url = url.clone();
		tokio::spawn(async move {
			let capture = drain_capture(req_rx, state.body_max_bytes, |_| {}).await;
			let body_json: Option<Value> = serde_json::from_slice(&capture.bytes).ok();
			let (task_id, task_source) =
				state
					.assigner
					.assign(&host, &task_headers, Some(&capture.bytes));
			let request_model = body_json
				.as_ref()
				.and_then(|j| j.get("model"))
				.and_then(Value::as_str)
				.map(str::to_string);
			let streaming_guess = body_json
				.as_ref()
				.and_then(|j| j.get("stream"))
				.and_then(Value::as_bool)
				.unwrap_or(false);
			let request_signature = state.signature.then(|| {
				let tools = body_json
					.as_ref()
					.and_then(|j| j.get("tools"))
					.and_then(Value::as_array)
					.map(|tools| {
						tools
							.iter()
							.filter_map(|t| {
								t.get("name")
									.or_else(|| t.get("function").and_then(|f| f.get("name")))
									.and_then(Value::as_str)
									.map(str::to_string)
							})
							.collect::<Vec<_>>()
					})
					.unwrap_or_default();
				crate::tasks::request_signature(&method, &path, &tools)
			});

			let flow = Flow {
				id: flow_id.clone(),
				host,
				method,
				path,
				url,
				timestamp,
				timestamp_mono,
				duration_ms: None,
				status: None,
				status_text: None,
				is_streaming: streaming_guess,
				integrity: Integrity::Complete,
				events_dropped: 0,
				request_body: capture_to_body(&state, &capture),
				response_body: BodyCapture::default(),
				request_headers,
				response_headers: Vec::new(),
				task_id: Some(task_id.clone()),
				task_source: Some(task_source),
				request_signature,
				provider,
				model: request_model.clone(),
				usage: Usage::default(),
				total_cost: None,
				cost_source: None,
				created_at: timestamp,
				expires_at: None,
			};
			if let Enqueue::Dropped(reason) = state.queue.push(WorkItem::FlowSkeleton(Box::new(flow)))
			{
				tracing::warn!(flow = %flow_id, ?reason, "skeleton enqueue dropped");
			}
			let _ = skeleton_tx.send(SkeletonInfo {
				task_id: Some(task_id),
				request_model,
			});
		});
	}

	let mut resp = match send.send_request(forwarded_req).await {
		Ok(resp) => resp,
		Err(e) => {
			tracing::warn!(host = %host, error = %e, "upstream request failed");
			finalize_synthetic(&state, &flow_id, &host, &method, &path, started, skeleton_rx);
			return synthetic_502();
		},
	};

	// WebSocket pass-through: bridge the two upgraded connections and record
	// the exchange without body capture.
	if resp.status() == StatusCode::SWITCHING_PROTOCOLS && wants_upgrade {
		let response_headers = state.redactor.redact_headers(resp.headers());
		let upstream_upgrade = hyper::upgrade::on(&mut resp);
		if let Some(client_upgrade) = client_upgrade {
			tokio::spawn(bridge_upgrade(client_upgrade, upstream_upgrade));
		}
		finalize_passthrough(
			&state,
			&flow_id,
			&host,
			&method,
			&path,
			resp.status(),
			response_headers,
			started,
			skeleton_rx,
		);
		let (parts, _) = resp.into_parts();
		return Response::from_parts(parts, empty_body());
	}

	let status = resp.status();
	let response_headers = state.redactor.redact_headers(resp.headers());
	let is_sse = resp
		.headers()
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.is_some_and(|ct| ct.starts_with("text/event-stream"));

	let (parts, body) = resp.into_parts();
	let (resp_tee, resp_rx) = TeeBody::new(body);

	{
		let state = state.clone();
		let flow_id = flow_id.clone();
		let host = host.clone();
		let method = method.clone();
		let path = path.clone();
		tokio::spawn(async move {
			let mut side = ResponseSide::new(&state, &flow_id, provider, is_sse, skeleton_rx);
			let capture = drain_capture(resp_rx, state.body_max_bytes, |chunk| {
				side.on_chunk(chunk);
			})
			.await;
			side
				.finalize(capture, host, method, path, Some(status), response_headers, started)
				.await;
		});
	}

	Response::from_parts(parts, box_body(resp_tee))
}

fn box_body(tee: TeeBody<Incoming>) -> ProxyBody {
	use http_body_util::BodyExt;
	tee.map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
		.boxed_unsync()
}

fn synthetic_502() -> Response<ProxyBody> {
	let mut resp = Response::new(super::full_body("langley: upstream request failed"));
	*resp.status_mut() = StatusCode::BAD_GATEWAY;
	resp
}

/// Streaming-side state: SSE parsing, event sequencing, tool tracking.
struct ResponseSide<'a> {
	state: &'a Arc<ProxyState>,
	flow_id: &'a str,
	provider: Provider,
	is_sse: bool,
	parser: SseParser,
	sequence: u64,
	dropped: u64,
	integrity: Integrity,
	skeleton_rx: Option<oneshot::Receiver<SkeletonInfo>>,
	skeleton: Option<SkeletonInfo>,
	pending_tools: HashMap<u64, PendingTool>,
	tools: Vec<ToolInvocation>,
}

struct PendingTool {
	name: String,
	tool_type: String,
	started: Instant,
	timestamp: DateTime<Utc>,
}

impl<'a> ResponseSide<'a> {
	fn new(
		state: &'a Arc<ProxyState>,
		flow_id: &'a str,
		provider: Provider,
		is_sse: bool,
		skeleton_rx: oneshot::Receiver<SkeletonInfo>,
	) -> ResponseSide<'a> {
		ResponseSide {
			state,
			flow_id,
			provider,
			is_sse,
			parser: SseParser::default(),
			sequence: 0,
			dropped: 0,
			integrity: Integrity::Complete,
			skeleton_rx: Some(skeleton_rx),
			skeleton: None,
			pending_tools: HashMap::new(),
			tools: Vec::new(),
		}
	}

	fn on_chunk(&mut self, chunk: &Bytes) {
		if !self.is_sse {
			return;
		}
		let frames = self.parser.push(chunk);
		for frame in frames {
			let Some(parser) = self.state.registry.get(self.provider) else {
				continue;
			};
			if let Some(event) = parser.classify_frame(&frame) {
				self.track_tools(&event);
				self.emit(event);
			}
		}
	}

	fn emit(&mut self, parsed: ParsedEvent) {
		let event = Event {
			flow_id: self.flow_id.to_string(),
			sequence: self.sequence,
			timestamp: Utc::now(),
			timestamp_mono: mono_now(),
			event_type: parsed.event_type,
			payload: parsed.payload,
			priority: parsed.priority,
		};
		self.sequence += 1;
		let priority = event.priority;
		if let Enqueue::Dropped(_) = self.state.queue.push(WorkItem::Event(Box::new(event))) {
			self.dropped += 1;
			if priority == Priority::High {
				self.integrity = self.integrity.degrade(Integrity::Corrupted);
			} else {
				self.integrity = self.integrity.degrade(Integrity::Partial);
			}
		}
	}

	fn track_tools(&mut self, event: &ParsedEvent) {
		match event.event_type.as_str() {
			"content_block_start" => {
				let block = &event.payload["content_block"];
				if block["type"] == "tool_use"
					&& let Some(name) = block["name"].as_str()
					&& let Some(index) = event.payload["index"].as_u64()
				{
					self.pending_tools.insert(
						index,
						PendingTool {
							name: name.to_string(),
							tool_type: "tool_use".to_string(),
							started: Instant::now(),
							timestamp: Utc::now(),
						},
					);
				}
			},
			"content_block_stop" => {
				if let Some(index) = event.payload["index"].as_u64()
					&& let Some(pending) = self.pending_tools.remove(&index)
				{
					self.tools.push(ToolInvocation {
						flow_id: self.flow_id.to_string(),
						task_id: None,
						tool_name: pending.name,
						tool_type: pending.tool_type,
						timestamp: pending.timestamp,
						duration_ms: Some(pending.started.elapsed().as_millis() as i64),
						success: None,
						error: None,
						input_tokens: None,
						output_tokens: None,
						cost: None,
					});
				}
			},
			_ => {},
		}
	}

	/// Tool calls in a complete (non-streaming) response body.
	fn tools_from_body(&mut self, json: &Value) {
		let now = Utc::now();
		if let Some(blocks) = json.get("content").and_then(Value::as_array) {
			for block in blocks {
				if block["type"] == "tool_use"
					&& let Some(name) = block["name"].as_str()
				{
					self.tools.push(ToolInvocation {
						flow_id: self.flow_id.to_string(),
						task_id: None,
						tool_name: name.to_string(),
						tool_type: "tool_use".to_string(),
						timestamp: now,
						duration_ms: None,
						success: None,
						error: None,
						input_tokens: None,
						output_tokens: None,
						cost: None,
					});
				}
			}
		}
		if let Some(calls) = json
			.pointer("/choices/0/message/tool_calls")
			.and_then(Value::as_array)
		{
			for call in calls {
				if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
					self.tools.push(ToolInvocation {
						flow_id: self.flow_id.to_string(),
						task_id: None,
						tool_name: name.to_string(),
						tool_type: "function".to_string(),
						timestamp: now,
						duration_ms: None,
						success: None,
						error: None,
						input_tokens: None,
						output_tokens: None,
						cost: None,
					});
				}
			}
		}
	}

	#[allow(clippy::too_many_arguments)]
	async fn finalize(
		mut self,
		capture: RawCapture,
		host: String,
		method: String,
		path: String,
		status: Option<StatusCode>,
		response_headers: Vec<(String, String)>,
		started: Instant,
	) {
		// Flush any final frame the stream ended without terminating.
		if self.is_sse {
			let frames = self.parser.finish();
			for frame in frames {
				if let Some(parser) = self.state.registry.get(self.provider)
					&& let Some(event) = parser.classify_frame(&frame)
				{
					self.track_tools(&event);
					self.emit(event);
				}
			}
		}

		// The skeleton task has normally finished long before the response
		// ends; the timeout only guards a request body still streaming.
		let skeleton = match self.skeleton_rx.take() {
			Some(rx) => tokio::time::timeout(std::time::Duration::from_secs(10), rx)
				.await
				.ok()
				.and_then(Result::ok),
			None => None,
		};
		self.skeleton = skeleton;

		match capture.ended_ok {
			Some(true) => {},
			Some(false) | None => {
				self.integrity = self.integrity.degrade(Integrity::Interrupted);
			},
		}
		if capture.live_lost {
			self.integrity = self.integrity.degrade(Integrity::Partial);
		}

		let parsed = self
			.state
			.registry
			.get(self.provider)
			.map(|p| p.parse_usage(&capture.bytes, self.is_sse))
			.unwrap_or_default();
		let model = parsed
			.model
			.clone()
			.or_else(|| self.skeleton.as_ref().and_then(|s| s.request_model.clone()));

		if !self.is_sse
			&& let Ok(json) = serde_json::from_slice::<Value>(&capture.bytes)
		{
			self.tools_from_body(&json);
		}

		let cost = self
			.state
			.pricing
			.cost(self.provider, model.as_deref(), &parsed.usage);

		let task_id = self.skeleton.as_ref().and_then(|s| s.task_id.clone());
		if !self.tools.is_empty() {
			let mut tools = std::mem::take(&mut self.tools);
			for tool in &mut tools {
				tool.task_id = task_id.clone();
			}
			if let Enqueue::Dropped(_) = self.state.queue.push(WorkItem::Tools(tools)) {
				self.integrity = self.integrity.degrade(Integrity::Partial);
			}
		}

		let fin = FlowFinal {
			flow_id: self.flow_id.to_string(),
			host,
			method,
			path,
			task_id,
			duration_ms: started.elapsed().as_millis() as i64,
			status: status.map(|s| s.as_u16()),
			status_text: status
				.and_then(|s| s.canonical_reason())
				.map(str::to_string),
			is_streaming: self.is_sse,
			integrity: self.integrity,
			events_dropped: self.dropped,
			response_body: capture_to_body(self.state, &capture),
			response_headers,
			model,
			usage: parsed.usage,
			total_cost: cost.map(|(c, _)| c),
			cost_source: cost.map(|(_, s)| s),
		};
		if let Enqueue::Dropped(reason) = self.state.queue.push(WorkItem::FlowFinal(Box::new(fin))) {
			tracing::warn!(flow = %self.flow_id, ?reason, "final update enqueue dropped");
		}
	}
}

/// Upstream never answered: persist the exchange with a synthetic gateway
/// status so the record is not silently lost.
fn finalize_synthetic(
	state: &Arc<ProxyState>,
	flow_id: &str,
	host: &str,
	method: &str,
	path: &str,
	started: Instant,
	skeleton_rx: oneshot::Receiver<SkeletonInfo>,
) {
	let state = state.clone();
	let flow_id = flow_id.to_string();
	let host = host.to_string();
	let method = method.to_string();
	let path = path.to_string();
	tokio::spawn(async move {
		let skeleton = tokio::time::timeout(std::time::Duration::from_secs(10), skeleton_rx)
			.await
			.ok()
			.and_then(Result::ok);
		let fin = FlowFinal {
			flow_id,
			host,
			method,
			path,
			task_id: skeleton.as_ref().and_then(|s| s.task_id.clone()),
			duration_ms: started.elapsed().as_millis() as i64,
			status: Some(502),
			status_text: Some("Bad Gateway".to_string()),
			is_streaming: false,
			integrity: Integrity::Interrupted,
			events_dropped: 0,
			response_body: BodyCapture::default(),
			response_headers: Vec::new(),
			model: skeleton.and_then(|s| s.request_model),
			usage: Usage::default(),
			total_cost: None,
			cost_source: None,
		};
		state.queue.push(WorkItem::FlowFinal(Box::new(fin)));
	});
}

#[allow(clippy::too_many_arguments)]
fn finalize_passthrough(
	state: &Arc<ProxyState>,
	flow_id: &str,
	host: &str,
	method: &str,
	path: &str,
	status: StatusCode,
	response_headers: Vec<(String, String)>,
	started: Instant,
	skeleton_rx: oneshot::Receiver<SkeletonInfo>,
) {
	let state = state.clone();
	let flow_id = flow_id.to_string();
	let host = host.to_string();
	let method = method.to_string();
	let path = path.to_string();
	tokio::spawn(async move {
		let skeleton = tokio::time::timeout(std::time::Duration::from_secs(10), skeleton_rx)
			.await
			.ok()
			.and_then(Result::ok);
		let fin = FlowFinal {
			flow_id,
			host,
			method,
			path,
			task_id: skeleton.as_ref().and_then(|s| s.task_id.clone()),
			duration_ms: started.elapsed().as_millis() as i64,
			status: Some(status.as_u16()),
			status_text: status.canonical_reason().map(str::to_string),
			is_streaming: false,
			integrity: Integrity::Complete,
			events_dropped: 0,
			response_body: BodyCapture::default(),
			response_headers,
			model: None,
			usage: Usage::default(),
			total_cost: None,
			cost_source: None,
		};
		state.queue.push(WorkItem::FlowFinal(Box::new(fin)));
	});
}

async fn bridge_upgrade(client: OnUpgrade, upstream: OnUpgrade) {
	let (client, upstream) = match tokio::join!(client, upstream) {
		(Ok(c), Ok(u)) => (c, u),
		(c, u) => {
			tracing::debug!(client_err = c.is_err(), upstream_err = u.is_err(), "upgrade failed");
			return;
		},
	};
	let mut client = hyper_util::rt::TokioIo::new(client);
	let mut upstream = hyper_util::rt::TokioIo::new(upstream);
	match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
		Ok((up, down)) => tracing::debug!(up, down, "websocket bridge closed"),
		Err(e) => tracing::debug!(error = %e, "websocket bridge error"),
	}
}

fn capture_to_body(state: &ProxyState, capture: &RawCapture) -> BodyCapture {
	if state.disable_body_storage {
		return BodyCapture {
			content: None,
			truncated: capture.truncated,
		};
	}
	let text = String::from_utf8_lossy(&capture.bytes);
	if state.store_raw_bodies {
		return BodyCapture {
			content: Some(text.into_owned()),
			truncated: capture.truncated,
		};
	}
	if !state.redactor.body_within_budget(text.len()) {
		// Too big for the regex pass: body-level redaction cannot be
		// guaranteed, so only the header-redacted record survives.
		return BodyCapture {
			content: None,
			truncated: true,
		};
	}
	BodyCapture {
		content: Some(state.redactor.redact_body(&text).into_owned()),
		truncated: capture.truncated,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn capture_to_body_redacts() {
		let state = ProxyState::for_tests();
		let capture = RawCapture {
			bytes: Bytes::from_static(b"{\"k\":\"sk-ant-api03-zzz\"}"),
			total: 24,
			truncated: false,
			ended_ok: Some(true),
			live_lost: false,
		};
		let body = capture_to_body(&state, &capture);
		let content = body.content.unwrap();
		assert!(content.contains("sk-ant-[REDACTED]"));
		assert!(!content.contains("api03"));
	}

	#[test]
	fn disable_body_storage_drops_content() {
		let mut state = ProxyState::for_tests();
		state.disable_body_storage = true;
		let capture = RawCapture {
			bytes: Bytes::from_static(b"data"),
			total: 4,
			truncated: true,
			ended_ok: Some(true),
			live_lost: false,
		};
		let body = capture_to_body(&state, &capture);
		assert!(body.content.is_none());
		assert!(body.truncated);
	}
}
