//! Core records shared by the ingest pipeline, the store, and the read-side API.

use std::time::Instant;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// Flow identifiers are opaque strings (UUID v4 in practice).
pub type FlowId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
	Anthropic,
	Openai,
	Bedrock,
	Gemini,
	Other,
}

impl Provider {
	pub fn as_str(&self) -> &'static str {
		match self {
			Provider::Anthropic => "anthropic",
			Provider::Openai => "openai",
			Provider::Bedrock => "bedrock",
			Provider::Gemini => "gemini",
			Provider::Other => "other",
		}
	}

	pub fn parse(s: &str) -> Provider {
		match s {
			"anthropic" => Provider::Anthropic,
			"openai" => Provider::Openai,
			"bedrock" => Provider::Bedrock,
			"gemini" => Provider::Gemini,
			_ => Provider::Other,
		}
	}
}

/// Data-completeness state of a flow.
///
/// `Partial` means some MEDIUM/LOW events were lost; `Corrupted` means at
/// least one HIGH item was lost; `Interrupted` means the connection ended
/// mid-stream. Corrupted is sticky and never downgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Integrity {
	Complete,
	Partial,
	Corrupted,
	Interrupted,
}

impl Integrity {
	pub fn as_str(&self) -> &'static str {
		match self {
			Integrity::Complete => "complete",
			Integrity::Partial => "partial",
			Integrity::Corrupted => "corrupted",
			Integrity::Interrupted => "interrupted",
		}
	}

	pub fn parse(s: &str) -> Integrity {
		match s {
			"partial" => Integrity::Partial,
			"corrupted" => Integrity::Corrupted,
			"interrupted" => Integrity::Interrupted,
			_ => Integrity::Complete,
		}
	}

	/// Merge a degradation into the current state, keeping the worst.
	pub fn degrade(self, other: Integrity) -> Integrity {
		fn rank(i: Integrity) -> u8 {
			match i {
				Integrity::Complete => 0,
				Integrity::Partial => 1,
				Integrity::Interrupted => 2,
				Integrity::Corrupted => 3,
			}
		}
		if rank(other) > rank(self) { other } else { self }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
	Low,
	Medium,
	High,
}

impl Priority {
	pub fn as_str(&self) -> &'static str {
		match self {
			Priority::High => "high",
			Priority::Medium => "medium",
			Priority::Low => "low",
		}
	}

	pub fn parse(s: &str) -> Priority {
		match s {
			"high" => Priority::High,
			"medium" => Priority::Medium,
			_ => Priority::Low,
		}
	}
}

/// How a flow was attributed to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
	Explicit,
	Metadata,
	Inferred,
}

impl TaskSource {
	pub fn as_str(&self) -> &'static str {
		match self {
			TaskSource::Explicit => "explicit",
			TaskSource::Metadata => "metadata",
			TaskSource::Inferred => "inferred",
		}
	}

	pub fn parse(s: &str) -> Option<TaskSource> {
		match s {
			"explicit" => Some(TaskSource::Explicit),
			"metadata" => Some(TaskSource::Metadata),
			"inferred" => Some(TaskSource::Inferred),
			_ => None,
		}
	}
}

/// Where the flow's total cost came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostSource {
	Exact,
	Estimated,
}

impl CostSource {
	pub fn as_str(&self) -> &'static str {
		match self {
			CostSource::Exact => "exact",
			CostSource::Estimated => "estimated",
		}
	}

	pub fn parse(s: &str) -> Option<CostSource> {
		match s {
			"exact" => Some(CostSource::Exact),
			"estimated" => Some(CostSource::Estimated),
			_ => None,
		}
	}
}

/// Token counts extracted from a provider response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub input_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub output_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_creation_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_read_tokens: Option<u64>,
}

impl Usage {
	pub fn is_empty(&self) -> bool {
		self.input_tokens.is_none()
			&& self.output_tokens.is_none()
			&& self.cache_creation_tokens.is_none()
			&& self.cache_read_tokens.is_none()
	}

	/// Later observations win field-by-field, so a final `message_delta` can
	/// complete what `message_start` began.
	pub fn merge(&mut self, other: Usage) {
		if other.input_tokens.is_some() {
			self.input_tokens = other.input_tokens;
		}
		if other.output_tokens.is_some() {
			self.output_tokens = other.output_tokens;
		}
		if other.cache_creation_tokens.is_some() {
			self.cache_creation_tokens = other.cache_creation_tokens;
		}
		if other.cache_read_tokens.is_some() {
			self.cache_read_tokens = other.cache_read_tokens;
		}
	}
}

/// A captured body prefix together with its truncation marker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodyCapture {
	pub content: Option<String>,
	pub truncated: bool,
}

/// One observed HTTP exchange end-to-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
	pub id: FlowId,
	pub host: String,
	pub method: String,
	pub path: String,
	pub url: String,
	pub timestamp: DateTime<Utc>,
	/// Process-monotonic nanosecond stamp; tie-break for analytics.
	pub timestamp_mono: i64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub duration_ms: Option<i64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status_text: Option<String>,
	pub is_streaming: bool,
	pub integrity: Integrity,
	pub events_dropped: u64,
	#[serde(default)]
	pub request_body: BodyCapture,
	#[serde(default)]
	pub response_body: BodyCapture,
	/// Redacted request headers, in on-wire order.
	pub request_headers: Vec<(String, String)>,
	/// Redacted response headers; empty until the response completes.
	#[serde(default)]
	pub response_headers: Vec<(String, String)>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub task_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub task_source: Option<TaskSource>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub request_signature: Option<String>,
	pub provider: Provider,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub model: Option<String>,
	#[serde(default)]
	pub usage: Usage,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub total_cost: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cost_source: Option<CostSource>,
	pub created_at: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub expires_at: Option<DateTime<Utc>>,
}

/// One parsed element of a streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
	pub flow_id: FlowId,
	/// Unique per flow; reflects on-wire order.
	pub sequence: u64,
	pub timestamp: DateTime<Utc>,
	pub timestamp_mono: i64,
	pub event_type: String,
	pub payload: serde_json::Value,
	pub priority: Priority,
}

/// A tool/function call extracted from parsed events after the stream completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
	pub flow_id: FlowId,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub task_id: Option<String>,
	pub tool_name: String,
	pub tool_type: String,
	pub timestamp: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub duration_ms: Option<i64>,
	/// Tri-state: Some(true)/Some(false)/unknown.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub success: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub input_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub output_tokens: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cost: Option<f64>,
}

/// An event the pipeline discarded, kept briefly for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropLogEntry {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub flow_id: Option<FlowId>,
	pub event_type: String,
	pub priority: Priority,
	pub reason: String,
	pub timestamp: DateTime<Utc>,
}

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic nanoseconds since process start. Strictly non-decreasing within
/// the process, unlike wall time.
pub fn mono_now() -> i64 {
	PROCESS_START.elapsed().as_nanos() as i64
}

pub fn new_flow_id() -> FlowId {
	uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn integrity_degrade_keeps_worst() {
		let i = Integrity::Complete.degrade(Integrity::Partial);
		assert_eq!(i, Integrity::Partial);
		let i = i.degrade(Integrity::Corrupted);
		assert_eq!(i, Integrity::Corrupted);
		// sticky: a later partial loss does not downgrade corruption
		assert_eq!(i.degrade(Integrity::Partial), Integrity::Corrupted);
		assert_eq!(i.degrade(Integrity::Interrupted), Integrity::Corrupted);
	}

	#[test]
	fn usage_merge_prefers_later_fields() {
		let mut u = Usage {
			input_tokens: Some(137),
			output_tokens: Some(1),
			..Default::default()
		};
		u.merge(Usage {
			output_tokens: Some(42),
			..Default::default()
		});
		assert_eq!(u.input_tokens, Some(137));
		assert_eq!(u.output_tokens, Some(42));
	}

	#[test]
	fn mono_now_is_monotonic() {
		let a = mono_now();
		let b = mono_now();
		assert!(b >= a);
	}
}
