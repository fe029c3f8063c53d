//! Bounded, priority-classed persistence queue.
//!
//! Enqueue never blocks and returns accept/drop; the writer thread blocks on
//! the other end with a condvar. Priorities decide what is dropped under
//! pressure; commit order stays FIFO so events land in sequence order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Condvar, Mutex};

use crate::pricing::PricingEntry;
use crate::types::{
	BodyCapture, CostSource, DropLogEntry, Event, Flow, FlowId, Integrity, Priority, ToolInvocation,
	Usage,
};

/// Final update applied when a response completes or is interrupted.
#[derive(Debug, Clone)]
pub struct FlowFinal {
	pub flow_id: FlowId,
	pub host: String,
	pub method: String,
	pub path: String,
	pub task_id: Option<String>,
	pub duration_ms: i64,
	pub status: Option<u16>,
	pub status_text: Option<String>,
	pub is_streaming: bool,
	pub integrity: Integrity,
	pub events_dropped: u64,
	pub response_body: BodyCapture,
	pub response_headers: Vec<(String, String)>,
	pub model: Option<String>,
	pub usage: Usage,
	pub total_cost: Option<f64>,
	pub cost_source: Option<CostSource>,
}

#[derive(Debug, Clone)]
pub enum WorkItem {
	FlowSkeleton(Box<Flow>),
	FlowFinal(Box<FlowFinal>),
	Event(Box<Event>),
	Tools(Vec<ToolInvocation>),
	ReplacePricing(Vec<PricingEntry>),
	PutSetting(String, String),
	/// Periodic TTL sweep, executed by the writer so it stays the sole
	/// mutator of store rows.
	RetentionSweep(chrono::DateTime<Utc>),
}

impl WorkItem {
	pub fn priority(&self) -> Priority {
		match self {
			WorkItem::FlowSkeleton(_) | WorkItem::FlowFinal(_) => Priority::High,
			WorkItem::Event(e) => e.priority,
			WorkItem::Tools(_) => Priority::Medium,
			WorkItem::ReplacePricing(_) | WorkItem::PutSetting(..) => Priority::High,
			WorkItem::RetentionSweep(_) => Priority::Medium,
		}
	}

	pub fn flow_id(&self) -> Option<&str> {
		match self {
			WorkItem::FlowSkeleton(f) => Some(&f.id),
			WorkItem::FlowFinal(f) => Some(&f.flow_id),
			WorkItem::Event(e) => Some(&e.flow_id),
			WorkItem::Tools(tools) => tools.first().map(|t| t.flow_id.as_str()),
			_ => None,
		}
	}

	/// Payload-byte estimate used by the queue's byte caps.
	pub fn cost_bytes(&self) -> usize {
		match self {
			WorkItem::FlowSkeleton(f) => {
				f.request_body.content.as_deref().map_or(0, str::len) + f.url.len() + 256
			},
			WorkItem::FlowFinal(f) => f.response_body.content.as_deref().map_or(0, str::len) + 128,
			WorkItem::Event(e) => e.payload.to_string().len() + e.event_type.len() + 64,
			WorkItem::Tools(tools) => tools.len() * 128,
			WorkItem::ReplacePricing(entries) => entries.len() * 64,
			WorkItem::PutSetting(k, v) => k.len() + v.len(),
			WorkItem::RetentionSweep(_) => 16,
		}
	}

	fn kind(&self) -> String {
		match self {
			WorkItem::FlowSkeleton(_) => "flow_skeleton".to_string(),
			WorkItem::FlowFinal(_) => "flow_final".to_string(),
			WorkItem::Event(e) => e.event_type.clone(),
			WorkItem::Tools(_) => "tool_invocations".to_string(),
			WorkItem::ReplacePricing(_) => "pricing".to_string(),
			WorkItem::PutSetting(..) => "setting".to_string(),
			WorkItem::RetentionSweep(_) => "retention_sweep".to_string(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
	Accepted,
	Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
	/// 95-99% full: LOW is shed first.
	Saturated,
	/// Completely full.
	Full,
	/// The flow exceeded its per-flow enqueued-bytes budget.
	FlowBudget,
	/// The queue was closed during shutdown.
	Closed,
}

impl DropReason {
	fn as_str(&self) -> &'static str {
		match self {
			DropReason::Saturated => "queue saturated",
			DropReason::Full => "queue full",
			DropReason::FlowBudget => "per-flow byte budget exceeded",
			DropReason::Closed => "queue closed",
		}
	}
}

#[derive(Debug, Default)]
pub struct QueueStats {
	pub submitted: AtomicU64,
	pub dropped: AtomicU64,
	/// Oldest-HIGH evictions under a fully HIGH queue.
	pub critical_drops: AtomicU64,
}

struct Inner {
	items: VecDeque<WorkItem>,
	bytes: usize,
	flow_bytes: HashMap<FlowId, usize>,
	drops: Vec<DropLogEntry>,
	penalties: Vec<(FlowId, Priority)>,
	first_enqueued: Option<Instant>,
	warn_level: u8,
	closed: bool,
}

pub struct PersistQueue {
	inner: Mutex<Inner>,
	cond: Condvar,
	capacity: usize,
	max_bytes: usize,
	per_flow_max_bytes: usize,
	pub stats: QueueStats,
}

impl PersistQueue {
	pub fn new(capacity: usize, max_bytes: usize, per_flow_max_bytes: usize) -> PersistQueue {
		PersistQueue {
			inner: Mutex::new(Inner {
				items: VecDeque::new(),
				bytes: 0,
				flow_bytes: HashMap::new(),
				drops: Vec::new(),
				penalties: Vec::new(),
				first_enqueued: None,
				warn_level: 0,
				closed: false,
			}),
			cond: Condvar::new(),
			capacity,
			max_bytes,
			per_flow_max_bytes,
			stats: QueueStats::default(),
		}
	}

	fn fill(&self, inner: &Inner) -> f64 {
		let items = inner.items.len() as f64 / self.capacity as f64;
		let bytes = inner.bytes as f64 / self.max_bytes as f64;
		items.max(bytes)
	}

	/// Current fill ratio; the writer shrinks batches above 80%.
	pub fn pressure(&self) -> f64 {
		let inner = self.inner.lock();
		self.fill(&inner)
	}

	/// Non-blocking enqueue. Returns within a bounded time regardless of
	/// queue depth.
	pub fn push(&self, item: WorkItem) -> Enqueue {
		self.stats.submitted.fetch_add(1, Ordering::Relaxed);
		let mut inner = self.inner.lock();
		if inner.closed {
			return self.reject(&mut inner, item, DropReason::Closed);
		}

		let priority = item.priority();
		let bytes = item.cost_bytes();

		// Per-flow budget sheds LOW before the global caps are even close.
		if priority == Priority::Low
			&& let Some(flow) = item.flow_id()
			&& inner.flow_bytes.get(flow).copied().unwrap_or(0) + bytes > self.per_flow_max_bytes
		{
			return self.reject(&mut inner, item, DropReason::FlowBudget);
		}

		let fill = self.fill(&inner);
		self.warn_transitions(&mut inner, fill);

		if fill >= 1.0 {
			if priority != Priority::High {
				return self.reject(&mut inner, item, DropReason::Full);
			}
			// Make room: evict the oldest non-HIGH item, or the oldest HIGH
			// when every band is HIGH (the critical-drop path).
			let victim_idx = inner.items.iter().position(|i| i.priority() != Priority::High);
			let all_high = victim_idx.is_none();
			let idx = victim_idx.unwrap_or(0);
			if let Some(victim) = inner.items.remove(idx) {
				self.account_remove(&mut inner, &victim);
				if all_high {
					self.stats.critical_drops.fetch_add(1, Ordering::Relaxed);
					tracing::error!(kind = %victim.kind(), "queue full of HIGH items; dropping oldest");
				}
				self.record_drop(&mut inner, &victim, DropReason::Full);
			}
		} else if fill >= 0.95 && priority == Priority::Low {
			return self.reject(&mut inner, item, DropReason::Saturated);
		}

		if let Some(flow) = item.flow_id() {
			*inner.flow_bytes.entry(flow.to_string()).or_insert(0) += bytes;
		}
		inner.bytes += bytes;
		if inner.items.is_empty() {
			inner.first_enqueued = Some(Instant::now());
		}
		inner.items.push_back(item);
		self.cond.notify_one();
		Enqueue::Accepted
	}

	fn reject(&self, inner: &mut Inner, item: WorkItem, reason: DropReason) -> Enqueue {
		self.record_drop(inner, &item, reason);
		Enqueue::Dropped(reason)
	}

	fn record_drop(&self, inner: &mut Inner, item: &WorkItem, reason: DropReason) {
		self.stats.dropped.fetch_add(1, Ordering::Relaxed);
		let priority = item.priority();
		inner.drops.push(DropLogEntry {
			flow_id: item.flow_id().map(str::to_string),
			event_type: item.kind(),
			priority,
			reason: reason.as_str().to_string(),
			timestamp: Utc::now(),
		});
		// The writer turns these into integrity downgrades: HIGH lost means
		// corrupted, anything else partial.
		if let Some(flow) = item.flow_id() {
			inner.penalties.push((flow.to_string(), priority));
		}
		self.cond.notify_one();
	}

	fn account_remove(&self, inner: &mut Inner, item: &WorkItem) {
		let bytes = item.cost_bytes();
		inner.bytes = inner.bytes.saturating_sub(bytes);
		if let Some(flow) = item.flow_id()
			&& let Some(entry) = inner.flow_bytes.get_mut(flow)
		{
			*entry = entry.saturating_sub(bytes);
		}
	}

	fn warn_transitions(&self, inner: &mut Inner, fill: f64) {
		let level = if fill >= 0.95 {
			2
		} else if fill >= 0.80 {
			1
		} else {
			0
		};
		if level > inner.warn_level {
			match level {
				1 => tracing::warn!(fill = %format!("{:.0}%", fill * 100.0), "persistence queue under pressure; shrinking batches"),
				_ => tracing::warn!(fill = %format!("{:.0}%", fill * 100.0), "persistence queue saturated; shedding LOW events"),
			}
		}
		inner.warn_level = level;
	}

	/// Blocking pop for the writer thread. Returns when a HIGH item is
	/// present (flow inserts commit immediately), the batch is full, or the
	/// oldest item has waited `interval`. `None` once closed and drained.
	pub fn pop_batch(&self, max_items: usize, interval: Duration) -> Option<Vec<WorkItem>> {
		let mut inner = self.inner.lock();
		loop {
			let flush = if inner.items.is_empty() {
				inner.closed && inner.drops.is_empty() && inner.penalties.is_empty()
			} else {
				inner.closed
					|| inner.items.len() >= max_items
					|| inner.items.iter().any(|i| i.priority() == Priority::High)
					|| inner
						.first_enqueued
						.is_some_and(|t| t.elapsed() >= interval)
			};
			if flush {
				if inner.items.is_empty() && inner.closed {
					if inner.drops.is_empty() && inner.penalties.is_empty() {
						return None;
					}
					// Final drain still has drop-log rows to flush.
					return Some(Vec::new());
				}
				let take = inner.items.len().min(max_items);
				let batch: Vec<WorkItem> = inner.items.drain(..take).collect();
				inner.first_enqueued = if inner.items.is_empty() {
					None
				} else {
					Some(Instant::now())
				};
				return Some(batch);
			}
			// Sidecar work (drops/penalties) with no items still needs the
			// writer to wake periodically.
			if inner.items.is_empty() && (!inner.drops.is_empty() || !inner.penalties.is_empty()) {
				return Some(Vec::new());
			}
			self.cond.wait_for(&mut inner, interval);
		}
	}

	/// Release per-flow byte accounting after the writer's durable commit.
	pub fn commit_release(&self, released: &[(FlowId, usize)]) {
		let mut inner = self.inner.lock();
		for (flow, bytes) in released {
			inner.bytes = inner.bytes.saturating_sub(*bytes);
			if let Some(entry) = inner.flow_bytes.get_mut(flow) {
				*entry = entry.saturating_sub(*bytes);
				if *entry == 0 {
					inner.flow_bytes.remove(flow);
				}
			}
		}
	}

	/// Release global byte accounting for items with no flow.
	pub fn commit_release_bytes(&self, bytes: usize) {
		let mut inner = self.inner.lock();
		inner.bytes = inner.bytes.saturating_sub(bytes);
	}

	pub fn drain_drops(&self) -> Vec<DropLogEntry> {
		std::mem::take(&mut self.inner.lock().drops)
	}

	pub fn drain_penalties(&self) -> Vec<(FlowId, Priority)> {
		std::mem::take(&mut self.inner.lock().penalties)
	}

	pub fn close(&self) {
		self.inner.lock().closed = true;
		self.cond.notify_all();
	}

	pub fn len(&self) -> usize {
		self.inner.lock().items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{mono_now, new_flow_id};

	fn event(flow: &str, seq: u64, priority: Priority) -> WorkItem {
		WorkItem::Event(Box::new(Event {
			flow_id: flow.to_string(),
			sequence: seq,
			timestamp: Utc::now(),
			timestamp_mono: mono_now(),
			event_type: "content_block_delta".to_string(),
			payload: serde_json::json!({"seq": seq}),
			priority,
		}))
	}

	fn skeleton(flow: &str) -> WorkItem {
		WorkItem::FlowSkeleton(Box::new(crate::types::Flow {
			id: flow.to_string(),
			host: "api.anthropic.com".to_string(),
			method: "POST".to_string(),
			path: "/v1/messages".to_string(),
			url: "https://api.anthropic.com/v1/messages".to_string(),
			timestamp: Utc::now(),
			timestamp_mono: mono_now(),
			duration_ms: None,
			status: None,
			status_text: None,
			is_streaming: false,
			integrity: Integrity::Complete,
			events_dropped: 0,
			request_body: BodyCapture::default(),
			response_body: BodyCapture::default(),
			request_headers: vec![],
			response_headers: vec![],
			task_id: None,
			task_source: None,
			request_signature: None,
			provider: crate::types::Provider::Anthropic,
			model: None,
			usage: Usage::default(),
			total_cost: None,
			cost_source: None,
			created_at: Utc::now(),
			expires_at: None,
		}))
	}

	#[test]
	fn accepts_below_capacity() {
		let q = PersistQueue::new(10, 1 << 20, 1 << 16);
		assert_eq!(q.push(event("f", 0, Priority::Low)), Enqueue::Accepted);
		assert_eq!(q.len(), 1);
	}

	#[test]
	fn sheds_low_at_95_percent() {
		let q = PersistQueue::new(20, 1 << 30, 1 << 30);
		for i in 0..19 {
			assert_eq!(q.push(event("f", i, Priority::Medium)), Enqueue::Accepted);
		}
		// 19/20 = 95%: LOW shed, MEDIUM still accepted.
		assert_eq!(
			q.push(event("f", 100, Priority::Low)),
			Enqueue::Dropped(DropReason::Saturated)
		);
		assert_eq!(q.push(event("f", 101, Priority::Medium)), Enqueue::Accepted);
		assert!(!q.drain_drops().is_empty());
	}

	#[test]
	fn full_queue_of_high_drops_oldest_high() {
		let q = PersistQueue::new(2, 1 << 30, 1 << 30);
		assert_eq!(q.push(event("f", 0, Priority::High)), Enqueue::Accepted);
		assert_eq!(q.push(event("f", 1, Priority::High)), Enqueue::Accepted);
		assert_eq!(q.push(event("f", 2, Priority::High)), Enqueue::Accepted);
		assert_eq!(q.len(), 2);
		assert_eq!(q.stats.critical_drops.load(Ordering::Relaxed), 1);
		// The oldest (sequence 0) was the victim.
		let batch = q.pop_batch(10, Duration::from_millis(1)).unwrap();
		let seqs: Vec<u64> = batch
			.iter()
			.filter_map(|i| match i {
				WorkItem::Event(e) => Some(e.sequence),
				_ => None,
			})
			.collect();
		assert_eq!(seqs, vec![1, 2]);
	}

	#[test]
	fn full_queue_rejects_non_high() {
		let q = PersistQueue::new(2, 1 << 30, 1 << 30);
		q.push(event("f", 0, Priority::Medium));
		q.push(event("f", 1, Priority::Medium));
		assert_eq!(
			q.push(event("f", 2, Priority::Low)),
			Enqueue::Dropped(DropReason::Full)
		);
	}

	#[test]
	fn per_flow_budget_sheds_low_and_records_penalty() {
		let q = PersistQueue::new(1000, 1 << 30, 200);
		let flow = new_flow_id();
		let mut dropped = 0;
		for i in 0..10 {
			if let Enqueue::Dropped(reason) = q.push(event(&flow, i, Priority::Low)) {
				assert_eq!(reason, DropReason::FlowBudget);
				dropped += 1;
			}
		}
		assert!(dropped > 0);
		// HIGH events for the same flow still pass.
		assert_eq!(q.push(event(&flow, 99, Priority::High)), Enqueue::Accepted);
		let penalties = q.drain_penalties();
		assert!(penalties.iter().all(|(f, p)| f == &flow && *p == Priority::Low));
	}

	#[test]
	fn pop_batch_flushes_immediately_on_high() {
		let q = PersistQueue::new(100, 1 << 30, 1 << 30);
		q.push(skeleton("f1"));
		// Interval is long; the HIGH item must not wait for it.
		let start = Instant::now();
		let batch = q.pop_batch(50, Duration::from_secs(30)).unwrap();
		assert_eq!(batch.len(), 1);
		assert!(start.elapsed() < Duration::from_secs(1));
	}

	#[test]
	fn pop_batch_returns_none_after_close_and_drain() {
		let q = PersistQueue::new(100, 1 << 30, 1 << 30);
		q.push(event("f", 0, Priority::Low));
		q.close();
		let batch = q.pop_batch(50, Duration::from_millis(10)).unwrap();
		assert_eq!(batch.len(), 1);
		// Drop/penalty sidecars may need one more empty drain.
		loop {
			match q.pop_batch(50, Duration::from_millis(10)) {
				None => break,
				Some(batch) => assert!(batch.is_empty()),
			}
		}
	}

	#[test]
	fn commit_release_frees_flow_budget() {
		let q = PersistQueue::new(1000, 1 << 30, 200);
		let flow = "f".to_string();
		let item = event(&flow, 0, Priority::Low);
		let bytes = item.cost_bytes();
		q.push(item);
		q.commit_release(&[(flow.clone(), bytes)]);
		// Budget released: another LOW of the same size fits again.
		assert_eq!(q.push(event(&flow, 1, Priority::Low)), Enqueue::Accepted);
	}
}
