//! Threshold rules over recorded flows. Detection is read-only; findings
//! are computed on demand for the API and never written back.

use serde::Serialize;

use crate::config::AnalyticsConfig;
use crate::store::{Store, StoreError};
use crate::types::{Flow, Integrity, ToolInvocation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
	Info,
	Warning,
	Critical,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
	pub rule: &'static str,
	pub severity: Severity,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub flow_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub task_id: Option<String>,
	pub value: f64,
	pub threshold: f64,
}

pub struct AnomalyDetector {
	config: AnalyticsConfig,
}

impl AnomalyDetector {
	pub fn new(config: AnalyticsConfig) -> AnomalyDetector {
		AnomalyDetector { config }
	}

	pub fn config(&self) -> &AnalyticsConfig {
		&self.config
	}

	/// Per-flow rules. `tools` are the flow's extracted invocations.
	pub fn check_flow(&self, flow: &Flow, tools: &[ToolInvocation]) -> Vec<Anomaly> {
		let mut found = Vec::new();
		let mk = |rule, severity, value: f64, threshold: f64| Anomaly {
			rule,
			severity,
			flow_id: Some(flow.id.clone()),
			task_id: flow.task_id.clone(),
			value,
			threshold,
		};

		if let Some(input) = flow.usage.input_tokens
			&& input > self.config.anomaly_context_tokens
		{
			found.push(mk(
				"large_context",
				Severity::Warning,
				input as f64,
				self.config.anomaly_context_tokens as f64,
			));
		}
		if let Some(duration) = flow.duration_ms
			&& duration > self.config.anomaly_tool_delay_ms
		{
			found.push(mk(
				"slow_response",
				Severity::Info,
				duration as f64,
				self.config.anomaly_tool_delay_ms as f64,
			));
		}
		if let Some(cost) = flow.total_cost
			&& cost > self.config.anomaly_cost_usd
		{
			found.push(mk(
				"high_cost",
				Severity::Warning,
				cost,
				self.config.anomaly_cost_usd,
			));
		}
		if tools.len() > self.config.anomaly_tool_calls {
			found.push(mk(
				"many_tool_calls",
				Severity::Info,
				tools.len() as f64,
				self.config.anomaly_tool_calls as f64,
			));
		}
		if tools.iter().any(|t| t.success == Some(false)) {
			let failures = tools.iter().filter(|t| t.success == Some(false)).count();
			found.push(mk("tool_failure", Severity::Warning, failures as f64, 0.0));
		}
		if flow.events_dropped > 0 {
			// A corrupted flow lost at least one HIGH item.
			let severity = if flow.integrity == Integrity::Corrupted {
				Severity::Critical
			} else {
				Severity::Warning
			};
			found.push(mk(
				"dropped_events",
				severity,
				flow.events_dropped as f64,
				0.0,
			));
		}
		found
	}

	/// Cross-flow rule: N flows with identical (host, path, task) inside the
	/// sliding window.
	pub fn check_rapid_repeats(&self, store: &Store) -> Result<Vec<Anomaly>, StoreError> {
		let window = std::time::Duration::from_secs(self.config.anomaly_rapid_calls_window_s);
		let threshold = self.config.anomaly_rapid_calls_threshold;
		let groups = store.rapid_repeat_groups(window, threshold)?;
		Ok(
			groups
				.into_iter()
				.map(|(_host, _path, task_id, count)| Anomaly {
					rule: "rapid_repeats",
					severity: Severity::Warning,
					flow_id: None,
					task_id,
					value: count as f64,
					threshold: threshold as f64,
				})
				.collect(),
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;
	use crate::types::{BodyCapture, Provider, Usage, mono_now};

	fn flow() -> Flow {
		Flow {
			id: "f1".to_string(),
			host: "api.openai.com".to_string(),
			method: "POST".to_string(),
			path: "/v1/chat/completions".to_string(),
			url: "https://api.openai.com/v1/chat/completions".to_string(),
			timestamp: Utc::now(),
			timestamp_mono: mono_now(),
			duration_ms: Some(100),
			status: Some(200),
			status_text: None,
			is_streaming: false,
			integrity: Integrity::Complete,
			events_dropped: 0,
			request_body: BodyCapture::default(),
			response_body: BodyCapture::default(),
			request_headers: vec![],
			response_headers: vec![],
			task_id: Some("T3".to_string()),
			task_source: Some(crate::types::TaskSource::Explicit),
			request_signature: None,
			provider: Provider::Openai,
			model: Some("gpt-4o".to_string()),
			usage: Usage::default(),
			total_cost: None,
			cost_source: None,
			created_at: Utc::now(),
			expires_at: None,
		}
	}

	fn tool(success: Option<bool>) -> ToolInvocation {
		ToolInvocation {
			flow_id: "f1".to_string(),
			task_id: None,
			tool_name: "bash".to_string(),
			tool_type: "function".to_string(),
			timestamp: Utc::now(),
			duration_ms: None,
			success,
			error: None,
			input_tokens: None,
			output_tokens: None,
			cost: None,
		}
	}

	#[test]
	fn quiet_flow_raises_nothing() {
		let d = AnomalyDetector::new(AnalyticsConfig::default());
		assert!(d.check_flow(&flow(), &[]).is_empty());
	}

	#[test]
	fn large_context_and_cost() {
		let d = AnomalyDetector::new(AnalyticsConfig::default());
		let mut f = flow();
		f.usage.input_tokens = Some(150_000);
		f.total_cost = Some(2.5);
		let found = d.check_flow(&f, &[]);
		let rules: Vec<&str> = found.iter().map(|a| a.rule).collect();
		assert!(rules.contains(&"large_context"));
		assert!(rules.contains(&"high_cost"));
		assert!(found.iter().all(|a| a.severity == Severity::Warning));
	}

	#[test]
	fn slow_response_is_info() {
		let d = AnomalyDetector::new(AnalyticsConfig::default());
		let mut f = flow();
		f.duration_ms = Some(31_000);
		let found = d.check_flow(&f, &[]);
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].rule, "slow_response");
		assert_eq!(found[0].severity, Severity::Info);
	}

	#[test]
	fn tool_failure_flags() {
		let d = AnomalyDetector::new(AnalyticsConfig::default());
		let tools = vec![tool(Some(true)), tool(Some(false)), tool(None)];
		let found = d.check_flow(&flow(), &tools);
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].rule, "tool_failure");
	}

	#[test]
	fn dropped_events_severity_tracks_integrity() {
		let d = AnomalyDetector::new(AnalyticsConfig::default());
		let mut f = flow();
		f.events_dropped = 3;
		f.integrity = Integrity::Partial;
		assert_eq!(d.check_flow(&f, &[])[0].severity, Severity::Warning);
		f.integrity = Integrity::Corrupted;
		assert_eq!(d.check_flow(&f, &[])[0].severity, Severity::Critical);
	}

	#[test]
	fn rapid_repeats_over_store() {
		use crate::store::queue::{PersistQueue, WorkItem};
		use crate::store::{FlowLedger, writer};
		use std::sync::Arc;

		let dir = tempfile::tempdir().unwrap();
		let db = dir.path().join("t.db");
		let queue = Arc::new(PersistQueue::new(1000, 1 << 24, 1 << 20));
		let handle = writer::spawn(
			db.clone(),
			queue.clone(),
			Arc::new(crate::hub::Hub::default()),
			Arc::new(FlowLedger::default()),
			Arc::new(crate::pricing::PricingTable::seeded()),
			crate::config::PersistenceConfig::default(),
			crate::config::RetentionConfig::default(),
		)
		.unwrap();
		for i in 0..5 {
			let mut f = flow();
			f.id = format!("f{i}");
			queue.push(WorkItem::FlowSkeleton(Box::new(f)));
		}
		queue.close();
		handle.join();

		let store = Store::open(&db).unwrap();
		let d = AnomalyDetector::new(AnalyticsConfig::default());
		let found = d.check_rapid_repeats(&store).unwrap();
		assert_eq!(found.len(), 1);
		assert_eq!(found[0].rule, "rapid_repeats");
		assert_eq!(found[0].value, 5.0);
		assert_eq!(found[0].threshold, 5.0);
		assert_eq!(found[0].task_id.as_deref(), Some("T3"));
	}
}
