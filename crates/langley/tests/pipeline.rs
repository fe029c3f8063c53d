//! Pipeline tests: streaming parse -> queue -> writer -> store, without
//! sockets. Exercises the same paths the proxy drives per exchange.

use std::sync::Arc;

use chrono::Utc;
use langley::config::{PersistenceConfig, RedactionConfig, RetentionConfig};
use langley::hub::{Hub, HubMessage};
use langley::llm::Registry;
use langley::parse::sse::SseParser;
use langley::pricing::PricingTable;
use langley::redact::Redactor;
use langley::store::queue::{Enqueue, FlowFinal, PersistQueue, WorkItem};
use langley::store::writer;
use langley::store::{FlowLedger, Store};
use langley::types::{
	BodyCapture, CostSource, Event, Flow, Integrity, Priority, Provider, TaskSource, Usage,
	mono_now, new_flow_id,
};

const ANTHROPIC_STREAM: &str = concat!(
	"event: message_start\n",
	"data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-3-5-sonnet-20241022\",\"usage\":{\"input_tokens\":137,\"output_tokens\":1}}}\n\n",
	"event: content_block_delta\n",
	"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
	"event: content_block_delta\n",
	"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"lo \"}}\n\n",
	"event: content_block_delta\n",
	"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"you\"}}\n\n",
	"event: message_delta\n",
	"data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":42}}\n\n",
	"event: message_stop\n",
	"data: {\"type\":\"message_stop\"}\n\n",
);

struct Pipeline {
	_dir: tempfile::TempDir,
	db: std::path::PathBuf,
	queue: Arc<PersistQueue>,
	hub: Arc<Hub>,
}

fn pipeline(queue: PersistQueue) -> (Pipeline, writer::WriterHandle) {
	let dir = tempfile::tempdir().unwrap();
	let db = dir.path().join("langley.db");
	let queue = Arc::new(queue);
	let hub = Arc::new(Hub::default());
	let handle = writer::spawn(
		db.clone(),
		queue.clone(),
		hub.clone(),
		Arc::new(FlowLedger::default()),
		Arc::new(PricingTable::seeded()),
		PersistenceConfig::default(),
		RetentionConfig::default(),
	)
	.unwrap();
	(
		Pipeline {
			_dir: dir,
			db,
			queue,
			hub,
		},
		handle,
	)
}

fn skeleton(flow_id: &str, redactor: &Redactor) -> Flow {
	let mut headers = http::HeaderMap::new();
	headers.insert(
		"authorization",
		"Bearer sk-ant-api03-XXXXYYYY".parse().unwrap(),
	);
	headers.insert("content-type", "application/json".parse().unwrap());
	let raw_body = r#"{"model":"claude-3-5-sonnet-20241022","stream":true,"api_key":"sk-ant-api03-XXXXYYYY"}"#;
	Flow {
		id: flow_id.to_string(),
		host: "api.anthropic.com".to_string(),
		method: "POST".to_string(),
		path: "/v1/messages".to_string(),
		url: "https://api.anthropic.com/v1/messages".to_string(),
		timestamp: Utc::now(),
		timestamp_mono: mono_now(),
		duration_ms: None,
		status: None,
		status_text: None,
		is_streaming: true,
		integrity: Integrity::Complete,
		events_dropped: 0,
		request_body: BodyCapture {
			content: Some(redactor.redact_body(raw_body).into_owned()),
			truncated: false,
		},
		response_body: BodyCapture::default(),
		request_headers: redactor.redact_headers(&headers),
		response_headers: vec![],
		task_id: Some("T1".to_string()),
		task_source: Some(TaskSource::Explicit),
		request_signature: None,
		provider: Provider::Anthropic,
		model: Some("claude-3-5-sonnet-20241022".to_string()),
		usage: Usage::default(),
		total_cost: None,
		cost_source: None,
		created_at: Utc::now(),
		expires_at: None,
	}
}

/// Scenario: a streamed Anthropic response is captured as one flow with six
/// ordered events, extracted usage, an exact cost, and redacted credentials.
#[test]
fn anthropic_streaming_capture() {
	let (p, handle) = pipeline(PersistQueue::new(10_000, 1 << 26, 1 << 24));
	let redactor = Redactor::new(&RedactionConfig::default(), 1 << 20).unwrap();
	let registry = Registry::new();
	let provider = registry.get(Provider::Anthropic).unwrap();
	let flow_id = new_flow_id();

	p.queue
		.push(WorkItem::FlowSkeleton(Box::new(skeleton(&flow_id, &redactor))));

	// Feed the SSE bytes through the streaming parser the way the response
	// tee does, enqueueing each classified frame.
	let mut parser = SseParser::default();
	let mut sequence = 0u64;
	let mut frames = parser.push(ANTHROPIC_STREAM.as_bytes());
	frames.extend(parser.finish());
	for frame in frames {
		if let Some(parsed) = provider.classify_frame(&frame) {
			p.queue.push(WorkItem::Event(Box::new(Event {
				flow_id: flow_id.clone(),
				sequence,
				timestamp: Utc::now(),
				timestamp_mono: mono_now(),
				event_type: parsed.event_type,
				payload: parsed.payload,
				priority: parsed.priority,
			})));
			sequence += 1;
		}
	}
	assert_eq!(sequence, 6);

	let usage = provider.parse_usage(ANTHROPIC_STREAM.as_bytes(), true);
	assert_eq!(usage.usage.input_tokens, Some(137));
	assert_eq!(usage.usage.output_tokens, Some(42));

	let pricing = PricingTable::seeded();
	let (cost, source) = pricing
		.cost(Provider::Anthropic, usage.model.as_deref(), &usage.usage)
		.unwrap();
	assert_eq!(source, CostSource::Exact);
	let expected = 137.0 * 0.003 / 1000.0 + 42.0 * 0.015 / 1000.0;
	assert!((cost - expected).abs() < 1e-12);

	p.queue.push(WorkItem::FlowFinal(Box::new(FlowFinal {
		flow_id: flow_id.clone(),
		host: "api.anthropic.com".to_string(),
		method: "POST".to_string(),
		path: "/v1/messages".to_string(),
		task_id: Some("T1".to_string()),
		duration_ms: 900,
		status: Some(200),
		status_text: Some("OK".to_string()),
		is_streaming: true,
		integrity: Integrity::Complete,
		events_dropped: 0,
		response_body: BodyCapture::default(),
		response_headers: vec![("content-type".into(), "text/event-stream".into())],
		model: usage.model.clone(),
		usage: usage.usage,
		total_cost: Some(cost),
		cost_source: Some(source),
	})));
	p.queue.close();
	handle.join();

	let store = Store::open(&p.db).unwrap();
	let flow = store.get_flow(&flow_id).unwrap().unwrap();
	assert_eq!(flow.status, Some(200));
	assert!(flow.is_streaming);
	assert_eq!(flow.model.as_deref(), Some("claude-3-5-sonnet-20241022"));
	assert_eq!(flow.usage.input_tokens, Some(137));
	assert_eq!(flow.usage.output_tokens, Some(42));
	assert_eq!(flow.cost_source, Some(CostSource::Exact));
	assert!((flow.total_cost.unwrap() - expected).abs() < 1e-9);

	// Credentials never reach disk.
	let auth = flow
		.request_headers
		.iter()
		.find(|(name, _)| name == "authorization")
		.map(|(_, value)| value.as_str())
		.unwrap();
	assert_eq!(auth, "[REDACTED]");
	let body = flow.request_body.content.as_deref().unwrap();
	assert!(body.contains("sk-ant-[REDACTED]"));
	assert!(!body.contains("XXXXYYYY"));

	// Six events, in on-wire order.
	let events = store.get_events(&flow_id).unwrap();
	assert_eq!(events.len(), 6);
	let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
	assert_eq!(
		types,
		vec![
			"message_start",
			"content_block_delta",
			"content_block_delta",
			"content_block_delta",
			"message_delta",
			"message_stop",
		]
	);
	let seqs: Vec<u64> = events.iter().map(|e| e.sequence).collect();
	assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);
}

/// Scenario: a flow that floods the queue with LOW deltas loses some of
/// them, is marked partial, and the losses land in the drop log.
#[test]
fn backpressure_sheds_low_and_marks_partial() {
	// Tiny per-flow byte budget so LOW deltas overflow quickly.
	let (p, handle) = pipeline(PersistQueue::new(10_000, 1 << 26, 2_000));
	let redactor = Redactor::new(&RedactionConfig::default(), 1 << 20).unwrap();
	let flow_id = new_flow_id();
	p.queue
		.push(WorkItem::FlowSkeleton(Box::new(skeleton(&flow_id, &redactor))));

	let mut accepted = 0u64;
	let mut dropped = 0u64;
	let mut sequence = 0u64;
	for i in 0..500 {
		let result = p.queue.push(WorkItem::Event(Box::new(Event {
			flow_id: flow_id.clone(),
			sequence,
			timestamp: Utc::now(),
			timestamp_mono: mono_now(),
			event_type: "content_block_delta".to_string(),
			payload: serde_json::json!({"delta": {"text": format!("chunk {i}")}}),
			priority: Priority::Low,
		})));
		match result {
			Enqueue::Accepted => {
				accepted += 1;
				sequence += 1;
			},
			Enqueue::Dropped(_) => dropped += 1,
		}
	}
	assert!(accepted > 0, "some deltas must land");
	assert!(dropped > 0, "the per-flow budget must shed the rest");

	p.queue.push(WorkItem::FlowFinal(Box::new(FlowFinal {
		flow_id: flow_id.clone(),
		host: "api.anthropic.com".to_string(),
		method: "POST".to_string(),
		path: "/v1/messages".to_string(),
		task_id: Some("T1".to_string()),
		duration_ms: 5_000,
		status: Some(200),
		status_text: Some("OK".to_string()),
		is_streaming: true,
		integrity: Integrity::Partial,
		events_dropped: dropped,
		response_body: BodyCapture::default(),
		response_headers: vec![],
		model: None,
		usage: Usage::default(),
		total_cost: None,
		cost_source: None,
	})));
	p.queue.close();
	handle.join();

	let store = Store::open(&p.db).unwrap();
	let flow = store.get_flow(&flow_id).unwrap().unwrap();
	assert_eq!(flow.integrity, Integrity::Partial);
	assert!(flow.events_dropped >= dropped);

	let drops = store.recent_drops(1000).unwrap();
	assert!(!drops.is_empty());
	assert!(
		drops
			.iter()
			.all(|d| d.flow_id.as_deref() == Some(flow_id.as_str()))
	);

	// Accepted events all landed, in order, with no gaps in what survived.
	let events = store.get_events(&flow_id).unwrap();
	assert_eq!(events.len(), accepted as usize);
}

/// The hub sees the lifecycle only after the writer commits.
#[tokio::test]
async fn writer_broadcasts_after_commit() {
	let (p, handle) = pipeline(PersistQueue::new(1_000, 1 << 24, 1 << 22));
	let redactor = Redactor::new(&RedactionConfig::default(), 1 << 20).unwrap();
	let (_id, mut rx) = p.hub.subscribe();

	let flow_id = new_flow_id();
	p.queue
		.push(WorkItem::FlowSkeleton(Box::new(skeleton(&flow_id, &redactor))));
	p.queue.close();
	tokio::task::spawn_blocking(move || handle.join())
		.await
		.unwrap();

	match rx.recv().await {
		Some(HubMessage::FlowStart(summary)) => {
			assert_eq!(summary.id, flow_id);
			assert_eq!(summary.host, "api.anthropic.com");
		},
		other => panic!("expected FlowStart, got {other:?}"),
	}
}
