//! Fan-out of flow lifecycle messages to connected observers.
//!
//! Broadcast never blocks the caller: each observer has a bounded outbox and
//! a full outbox marks the observer for removal. Removal happens under the
//! write lock with a membership re-check so a racing unsubscribe cannot
//! double-close.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::types::{Flow, Integrity};

pub const DEFAULT_OUTBOX: usize = 256;
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Summaries only; bodies never leave the store through the hub.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSummary {
	pub id: String,
	pub host: String,
	pub method: String,
	pub path: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub task_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub input_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub output_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub total_cost: Option<f64>,
	pub is_streaming: bool,
	pub integrity: Integrity,
}

impl From<&Flow> for FlowSummary {
	fn from(flow: &Flow) -> FlowSummary {
		FlowSummary {
			id: flow.id.clone(),
			host: flow.host.clone(),
			method: flow.method.clone(),
			path: flow.path.clone(),
			status: flow.status,
			model: flow.model.clone(),
			task_id: flow.task_id.clone(),
			input_tokens: flow.usage.input_tokens,
			output_tokens: flow.usage.output_tokens,
			total_cost: flow.total_cost,
			is_streaming: flow.is_streaming,
			integrity: flow.integrity,
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSummary {
	pub flow_id: String,
	pub sequence: u64,
	pub event_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
	FlowStart(FlowSummary),
	FlowUpdate {
		id: String,
		integrity: Integrity,
		events_dropped: u64,
	},
	FlowComplete(FlowSummary),
	Event(EventSummary),
	Ping,
}

struct Observer {
	tx: mpsc::Sender<HubMessage>,
}

pub struct Hub {
	observers: RwLock<HashMap<u64, Observer>>,
	next_id: AtomicU64,
	outbox_capacity: usize,
	dropped_messages: AtomicU64,
}

impl Default for Hub {
	fn default() -> Self {
		Hub::new(DEFAULT_OUTBOX)
	}
}

impl Hub {
	pub fn new(outbox_capacity: usize) -> Hub {
		Hub {
			observers: RwLock::new(HashMap::new()),
			next_id: AtomicU64::new(1),
			outbox_capacity,
			dropped_messages: AtomicU64::new(0),
		}
	}

	pub fn subscribe(&self) -> (u64, mpsc::Receiver<HubMessage>) {
		let (tx, rx) = mpsc::channel(self.outbox_capacity);
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		self.observers.write().insert(id, Observer { tx });
		tracing::debug!(observer = id, "observer subscribed");
		(id, rx)
	}

	pub fn unsubscribe(&self, id: u64) {
		if self.observers.write().remove(&id).is_some() {
			tracing::debug!(observer = id, "observer unsubscribed");
		}
	}

	pub fn observer_count(&self) -> usize {
		self.observers.read().len()
	}

	/// Two-phase broadcast: send under the read lock, then remove the slow
	/// observers under the write lock with a membership re-check.
	pub fn broadcast(&self, msg: HubMessage) {
		let mut stale: Vec<u64> = Vec::new();
		{
			let observers = self.observers.read();
			for (id, observer) in observers.iter() {
				match observer.tx.try_send(msg.clone()) {
					Ok(()) => {},
					Err(mpsc::error::TrySendError::Full(_)) => {
						self.dropped_messages.fetch_add(1, Ordering::Relaxed);
						stale.push(*id);
					},
					Err(mpsc::error::TrySendError::Closed(_)) => stale.push(*id),
				}
			}
		}
		if !stale.is_empty() {
			let mut observers = self.observers.write();
			for id in stale {
				if observers.remove(&id).is_some() {
					tracing::warn!(observer = id, "removing observer with full or closed outbox");
				}
			}
		}
	}

	/// Periodic ping so dead observers are detected and reaped.
	pub async fn run_pinger(self: Arc<Hub>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
		let mut tick = tokio::time::interval(PING_INTERVAL);
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
		loop {
			tokio::select! {
				_ = tick.tick() => self.broadcast(HubMessage::Ping),
				_ = shutdown.changed() => break,
			}
		}
	}

	/// Close every outbox. Receivers see the stream end and drain what is
	/// already buffered.
	pub fn shutdown(&self) {
		self.observers.write().clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn summary(id: &str) -> FlowSummary {
		FlowSummary {
			id: id.to_string(),
			host: "api.anthropic.com".to_string(),
			method: "POST".to_string(),
			path: "/v1/messages".to_string(),
			status: Some(200),
			model: None,
			task_id: None,
			input_tokens: None,
			output_tokens: None,
			total_cost: None,
			is_streaming: true,
			integrity: Integrity::Complete,
		}
	}

	#[tokio::test]
	async fn broadcast_reaches_all_observers() {
		let hub = Hub::new(8);
		let (_a, mut rx_a) = hub.subscribe();
		let (_b, mut rx_b) = hub.subscribe();
		hub.broadcast(HubMessage::FlowStart(summary("f1")));
		assert!(matches!(rx_a.recv().await, Some(HubMessage::FlowStart(_))));
		assert!(matches!(rx_b.recv().await, Some(HubMessage::FlowStart(_))));
	}

	#[tokio::test]
	async fn slow_observer_is_removed_without_delaying_others() {
		let hub = Hub::new(1);
		let (_slow, _rx_kept_unread) = hub.subscribe();
		let (_fast, mut rx_fast) = hub.subscribe();
		// First message fills the slow outbox (capacity 1), second overflows it.
		hub.broadcast(HubMessage::Ping);
		hub.broadcast(HubMessage::FlowStart(summary("f1")));
		assert_eq!(hub.observer_count(), 1);
		// The fast observer still got both.
		assert!(matches!(rx_fast.recv().await, Some(HubMessage::Ping)));
		assert!(matches!(rx_fast.recv().await, Some(HubMessage::FlowStart(_))));
	}

	#[tokio::test]
	async fn closed_observer_is_reaped_on_next_broadcast() {
		let hub = Hub::new(8);
		let (_id, rx) = hub.subscribe();
		drop(rx);
		hub.broadcast(HubMessage::Ping);
		assert_eq!(hub.observer_count(), 0);
	}

	#[tokio::test]
	async fn shutdown_ends_streams() {
		let hub = Hub::new(8);
		let (_id, mut rx) = hub.subscribe();
		hub.broadcast(HubMessage::Ping);
		hub.shutdown();
		assert!(matches!(rx.recv().await, Some(HubMessage::Ping)));
		assert!(rx.recv().await.is_none());
	}

	#[test]
	fn messages_serialize_with_type_tag() {
		let msg = HubMessage::FlowComplete(summary("f9"));
		let json = serde_json::to_value(&msg).unwrap();
		assert_eq!(json["type"], "flow_complete");
		assert_eq!(json["id"], "f9");
	}
}
