//! Task attribution: every flow gets a task id from an ordered rule set.
//!
//! Rules, first match wins: the `X-Langley-Task` header, then JSON
//! `metadata.user_id` in the request body, then a per-host idle-gap
//! heuristic that groups bursts of traffic into a minted task.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use http::HeaderMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::types::TaskSource;

pub const TASK_HEADER: &str = "x-langley-task";

#[derive(Debug)]
struct HostState {
	last_seen: Instant,
	current_task: String,
}

#[derive(Debug)]
struct Inner {
	idle_gap: Duration,
	hosts: HashMap<String, HostState>,
	counter: u64,
}

/// Attributes flows to tasks. The map update is serialized under one mutex
/// so the per-host task id is stable for every request arriving before the
/// gap expires.
#[derive(Debug)]
pub struct TaskAssigner {
	inner: Mutex<Inner>,
}

impl TaskAssigner {
	pub fn new(idle_gap_minutes: u64) -> TaskAssigner {
		TaskAssigner {
			inner: Mutex::new(Inner {
				idle_gap: Duration::from_secs(idle_gap_minutes.clamp(1, 60) * 60),
				hosts: HashMap::new(),
				counter: 0,
			}),
		}
	}

	/// Runtime-updatable via the settings endpoint. Clamped to 1..=60 min.
	pub fn set_idle_gap_minutes(&self, minutes: u64) {
		self.inner.lock().idle_gap = Duration::from_secs(minutes.clamp(1, 60) * 60);
	}

	pub fn idle_gap_minutes(&self) -> u64 {
		self.inner.lock().idle_gap.as_secs() / 60
	}

	pub fn assign(&self, host: &str, headers: &HeaderMap, body: Option<&[u8]>) -> (String, TaskSource) {
		self.assign_at(Instant::now(), host, headers, body)
	}

	fn assign_at(
		&self,
		now: Instant,
		host: &str,
		headers: &HeaderMap,
		body: Option<&[u8]>,
	) -> (String, TaskSource) {
		if let Some(value) = headers.get(TASK_HEADER)
			&& let Ok(value) = value.to_str()
			&& !value.is_empty()
		{
			return (value.to_string(), TaskSource::Explicit);
		}

		if let Some(body) = body
			&& let Ok(json) = serde_json::from_slice::<serde_json::Value>(body)
			&& let Some(user_id) = json
				.get("metadata")
				.and_then(|m| m.get("user_id"))
				.and_then(|v| v.as_str())
			&& !user_id.is_empty()
		{
			return (user_id.to_string(), TaskSource::Metadata);
		}

		(self.infer(now, host), TaskSource::Inferred)
	}

	fn infer(&self, now: Instant, host: &str) -> String {
		let mut inner = self.inner.lock();
		let gap = inner.idle_gap;
		match inner.hosts.get_mut(host) {
			// An arrival at exactly last_seen + gap continues the task.
			Some(state) if now.saturating_duration_since(state.last_seen) <= gap => {
				state.last_seen = now;
				state.current_task.clone()
			},
			_ => {
				inner.counter += 1;
				let task = format!("{}-{}", host_shortname(host), base36(inner.counter));
				inner.hosts.insert(
					host.to_string(),
					HostState {
						last_seen: now,
						current_task: task.clone(),
					},
				);
				task
			},
		}
	}
}

/// `api.anthropic.com` -> `anthropic`; bare or single-label hosts pass through.
fn host_shortname(host: &str) -> String {
	let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
	let labels: Vec<&str> = host.split('.').collect();
	if labels.len() >= 2 {
		labels[labels.len() - 2].to_string()
	} else {
		host.to_string()
	}
}

fn base36(mut n: u64) -> String {
	const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
	if n == 0 {
		return "0".to_string();
	}
	let mut out = Vec::new();
	while n > 0 {
		out.push(DIGITS[(n % 36) as usize]);
		n /= 36;
	}
	out.reverse();
	String::from_utf8(out).unwrap_or_default()
}

/// Opt-in request signature: SHA-256 over method, path, and the sorted tool
/// names the request carries.
pub fn request_signature(method: &str, path: &str, tool_names: &[String]) -> String {
	let mut sorted = tool_names.to_vec();
	sorted.sort();
	let mut hasher = Sha256::new();
	hasher.update(method.as_bytes());
	hasher.update(b"\n");
	hasher.update(path.as_bytes());
	for name in &sorted {
		hasher.update(b"\n");
		hasher.update(name.as_bytes());
	}
	hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
	use super::*;
	use http::HeaderValue;

	fn headers_with_task(task: &str) -> HeaderMap {
		let mut h = HeaderMap::new();
		h.insert(TASK_HEADER, HeaderValue::from_str(task).unwrap());
		h
	}

	#[test]
	fn explicit_header_wins() {
		let a = TaskAssigner::new(5);
		let (task, source) = a.assign("api.anthropic.com", &headers_with_task("T1"), None);
		assert_eq!(task, "T1");
		assert_eq!(source, TaskSource::Explicit);
	}

	#[test]
	fn metadata_user_id_next() {
		let a = TaskAssigner::new(5);
		let body = br#"{"metadata":{"user_id":"T2"},"model":"m"}"#;
		let (task, source) = a.assign("api.anthropic.com", &HeaderMap::new(), Some(body));
		assert_eq!(task, "T2");
		assert_eq!(source, TaskSource::Metadata);
	}

	#[test]
	fn empty_metadata_falls_through_to_inferred() {
		let a = TaskAssigner::new(5);
		let body = br#"{"metadata":{"user_id":""}}"#;
		let (task, source) = a.assign("api.anthropic.com", &HeaderMap::new(), Some(body));
		assert_eq!(source, TaskSource::Inferred);
		assert!(task.starts_with("anthropic-"));
	}

	#[test]
	fn inferred_stable_within_gap_new_after() {
		let a = TaskAssigner::new(5);
		let gap = Duration::from_secs(5 * 60);
		let t0 = Instant::now();
		let h = HeaderMap::new();

		let (first, _) = a.assign_at(t0, "api.anthropic.com", &h, None);
		let (second, _) = a.assign_at(t0 + Duration::from_secs(1), "api.anthropic.com", &h, None);
		assert_eq!(first, second);

		// Exactly at the boundary: same task.
		let (third, _) = a.assign_at(t0 + Duration::from_secs(1) + gap, "api.anthropic.com", &h, None);
		assert_eq!(first, third);

		// Past the boundary: a fresh task is minted.
		let (fourth, _) = a.assign_at(
			t0 + Duration::from_secs(2) + gap + gap,
			"api.anthropic.com",
			&h,
			None,
		);
		assert_ne!(first, fourth);
	}

	#[test]
	fn distinct_hosts_get_distinct_tasks() {
		let a = TaskAssigner::new(5);
		let h = HeaderMap::new();
		let now = Instant::now();
		let (one, _) = a.assign_at(now, "api.anthropic.com", &h, None);
		let (two, _) = a.assign_at(now, "api.openai.com", &h, None);
		assert_ne!(one, two);
		assert!(one.starts_with("anthropic-"));
		assert!(two.starts_with("openai-"));
	}

	#[test]
	fn shortname_handles_ports_and_bare_hosts() {
		assert_eq!(host_shortname("api.anthropic.com:443"), "anthropic");
		assert_eq!(host_shortname("localhost"), "localhost");
		assert_eq!(
			host_shortname("bedrock-runtime.us-east-1.amazonaws.com"),
			"amazonaws"
		);
	}

	#[test]
	fn base36_counter_shape() {
		assert_eq!(base36(1), "1");
		assert_eq!(base36(35), "z");
		assert_eq!(base36(36), "10");
	}

	#[test]
	fn signature_is_order_insensitive() {
		let a = request_signature(
			"POST",
			"/v1/messages",
			&["bash".to_string(), "edit".to_string()],
		);
		let b = request_signature(
			"POST",
			"/v1/messages",
			&["edit".to_string(), "bash".to_string()],
		);
		assert_eq!(a, b);
		assert_eq!(a.len(), 64);
	}
}
