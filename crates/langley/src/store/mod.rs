//! Embedded SQLite persistence.
//!
//! The writer thread (`writer`) is the only component that mutates rows;
//! everything else reads through [`Store`], whose connection is guarded by a
//! mutex and driven from async handlers via `spawn_blocking`. WAL mode keeps
//! readers and the writer out of each other's way.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::pricing::PricingEntry;
use crate::types::{
	BodyCapture, CostSource, DropLogEntry, Event, Flow, Integrity, Priority, Provider, TaskSource,
	ToolInvocation, Usage,
};

pub mod migrations;
pub mod queue;
pub mod retention;
pub mod writer;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("sqlite: {0}")]
	Sqlite(#[from] rusqlite::Error),
	#[error("row decode: {0}")]
	Decode(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Fixed-width UTC timestamp text; lexicographic order equals time order.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
	dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

pub(crate) fn parse_ts(raw: &str) -> DateTime<Utc> {
	DateTime::parse_from_rfc3339(raw)
		.map(|dt| dt.with_timezone(&Utc))
		.unwrap_or_default()
}

/// Shared connection setup: WAL, relaxed sync, a busy timeout covering the
/// writer's retry window, and enforced foreign keys.
pub(crate) fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
	// journal_mode returns the resulting mode as a row.
	let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
	conn.pragma_update(None, "synchronous", "NORMAL")?;
	conn.pragma_update(None, "foreign_keys", "ON")?;
	conn.busy_timeout(Duration::from_secs(30))?;
	Ok(())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlowFilter {
	pub host: Option<String>,
	pub task_id: Option<String>,
	pub model: Option<String>,
	pub provider: Option<Provider>,
	pub since: Option<DateTime<Utc>>,
	pub until: Option<DateTime<Utc>>,
	/// Status class as its hundreds digit (2 = 2xx, 4 = 4xx, ...).
	pub status_class: Option<u16>,
	pub offset: u64,
	pub limit: u64,
}

impl FlowFilter {
	fn where_clause(&self) -> (String, Vec<SqlValue>) {
		let mut clauses: Vec<String> = Vec::new();
		let mut values: Vec<SqlValue> = Vec::new();
		if let Some(host) = &self.host {
			clauses.push("host = ?".into());
			values.push(SqlValue::Text(host.clone()));
		}
		if let Some(task) = &self.task_id {
			clauses.push("task_id = ?".into());
			values.push(SqlValue::Text(task.clone()));
		}
		if let Some(model) = &self.model {
			clauses.push("model = ?".into());
			values.push(SqlValue::Text(model.clone()));
		}
		if let Some(provider) = self.provider {
			clauses.push("provider = ?".into());
			values.push(SqlValue::Text(provider.as_str().to_string()));
		}
		if let Some(since) = &self.since {
			clauses.push("timestamp >= ?".into());
			values.push(SqlValue::Text(ts(since)));
		}
		if let Some(until) = &self.until {
			clauses.push("timestamp < ?".into());
			values.push(SqlValue::Text(ts(until)));
		}
		if let Some(class) = self.status_class {
			clauses.push("status BETWEEN ? AND ?".into());
			values.push(SqlValue::Integer(i64::from(class) * 100));
			values.push(SqlValue::Integer(i64::from(class) * 100 + 99));
		}
		if clauses.is_empty() {
			(String::new(), values)
		} else {
			(format!(" WHERE {}", clauses.join(" AND ")), values)
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
	pub task_id: String,
	pub task_source: Option<TaskSource>,
	pub flows: u64,
	pub first_seen: DateTime<Utc>,
	pub last_seen: DateTime<Utc>,
	pub total_cost: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatsGroup {
	Task,
	Model,
	Provider,
	Host,
}

impl StatsGroup {
	fn column(&self) -> &'static str {
		match self {
			StatsGroup::Task => "task_id",
			StatsGroup::Model => "model",
			StatsGroup::Provider => "provider",
			StatsGroup::Host => "host",
		}
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsRow {
	pub key: Option<String>,
	pub flows: u64,
	pub input_tokens: u64,
	pub output_tokens: u64,
	pub total_cost: f64,
}

const FLOW_COLUMNS: &str = "id, host, method, path, url, timestamp, timestamp_mono, duration_ms, \
	status, status_text, is_streaming, integrity, events_dropped, request_body, \
	request_body_truncated, response_body, response_body_truncated, request_headers, \
	response_headers, task_id, task_source, request_signature, provider, model, input_tokens, \
	output_tokens, cache_creation_tokens, cache_read_tokens, total_cost, cost_source, created_at, \
	expires_at";

pub struct Store {
	read: Mutex<Connection>,
}

impl Store {
	/// Open the read handle. The schema must already exist (the writer
	/// migrates before anything else starts); opening also migrates so tests
	/// and tooling can use a store stand-alone.
	pub fn open(path: &Path) -> Result<Store> {
		let mut conn = Connection::open(path)?;
		configure_connection(&conn)?;
		migrations::migrate(&mut conn)?;
		Ok(Store {
			read: Mutex::new(conn),
		})
	}

	pub fn list_flows(&self, filter: &FlowFilter) -> Result<Vec<Flow>> {
		let (where_sql, mut values) = filter.where_clause();
		let limit = if filter.limit == 0 { 100 } else { filter.limit };
		let sql = format!(
			"SELECT {FLOW_COLUMNS} FROM flows{where_sql} ORDER BY timestamp DESC, timestamp_mono DESC \
			 LIMIT ? OFFSET ?"
		);
		values.push(SqlValue::Integer(limit as i64));
		values.push(SqlValue::Integer(filter.offset as i64));
		let conn = self.read.lock();
		let mut stmt = conn.prepare_cached(&sql)?;
		let rows = stmt.query_map(params_from_iter(values.iter()), flow_from_row)?;
		collect(rows)
	}

	pub fn count_flows(&self, filter: &FlowFilter) -> Result<u64> {
		let (where_sql, values) = filter.where_clause();
		let sql = format!("SELECT COUNT(*) FROM flows{where_sql}");
		let conn = self.read.lock();
		let count: i64 = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
		Ok(count as u64)
	}

	pub fn get_flow(&self, id: &str) -> Result<Option<Flow>> {
		let conn = self.read.lock();
		let sql = format!("SELECT {FLOW_COLUMNS} FROM flows WHERE id = ?");
		let mut stmt = conn.prepare_cached(&sql)?;
		let mut rows = stmt.query_map(params![id], flow_from_row)?;
		match rows.next() {
			Some(row) => Ok(Some(row?)),
			None => Ok(None),
		}
	}

	pub fn get_events(&self, flow_id: &str) -> Result<Vec<Event>> {
		let conn = self.read.lock();
		let mut stmt = conn.prepare_cached(
			"SELECT flow_id, sequence, timestamp, timestamp_mono, event_type, payload, priority \
			 FROM events WHERE flow_id = ? ORDER BY sequence",
		)?;
		let rows = stmt.query_map(params![flow_id], event_from_row)?;
		collect(rows)
	}

	pub fn get_tool_invocations(&self, flow_id: &str) -> Result<Vec<ToolInvocation>> {
		let conn = self.read.lock();
		let mut stmt = conn.prepare_cached(
			"SELECT flow_id, task_id, tool_name, tool_type, timestamp, duration_ms, success, error, \
			 input_tokens, output_tokens, cost FROM tool_invocations WHERE flow_id = ? ORDER BY timestamp",
		)?;
		let rows = stmt.query_map(params![flow_id], tool_from_row)?;
		collect(rows)
	}

	pub fn get_tool_invocations_by_name(&self, name: &str, limit: u64) -> Result<Vec<ToolInvocation>> {
		let conn = self.read.lock();
		let mut stmt = conn.prepare_cached(
			"SELECT flow_id, task_id, tool_name, tool_type, timestamp, duration_ms, success, error, \
			 input_tokens, output_tokens, cost FROM tool_invocations WHERE tool_name = ? \
			 ORDER BY timestamp DESC LIMIT ?",
		)?;
		let rows = stmt.query_map(params![name, limit as i64], tool_from_row)?;
		collect(rows)
	}

	pub fn recent_drops(&self, limit: u64) -> Result<Vec<DropLogEntry>> {
		let conn = self.read.lock();
		let mut stmt = conn.prepare_cached(
			"SELECT flow_id, event_type, priority, reason, timestamp FROM drop_log \
			 ORDER BY timestamp DESC LIMIT ?",
		)?;
		let rows = stmt.query_map(params![limit as i64], |row| {
			Ok(DropLogEntry {
				flow_id: row.get(0)?,
				event_type: row.get(1)?,
				priority: Priority::parse(&row.get::<_, String>(2)?),
				reason: row.get(3)?,
				timestamp: parse_ts(&row.get::<_, String>(4)?),
			})
		})?;
		collect(rows)
	}

	pub fn list_tasks(&self, limit: u64) -> Result<Vec<TaskSummary>> {
		let conn = self.read.lock();
		let mut stmt = conn.prepare_cached(
			"SELECT task_id, MIN(task_source), COUNT(*), MIN(timestamp), MAX(timestamp), \
			 SUM(total_cost) FROM flows WHERE task_id IS NOT NULL GROUP BY task_id \
			 ORDER BY MAX(timestamp) DESC LIMIT ?",
		)?;
		let rows = stmt.query_map(params![limit as i64], |row| {
			Ok(TaskSummary {
				task_id: row.get(0)?,
				task_source: row
					.get::<_, Option<String>>(1)?
					.and_then(|s| TaskSource::parse(&s)),
				flows: row.get::<_, i64>(2)? as u64,
				first_seen: parse_ts(&row.get::<_, String>(3)?),
				last_seen: parse_ts(&row.get::<_, String>(4)?),
				total_cost: row.get(5)?,
			})
		})?;
		collect(rows)
	}

	pub fn stats(&self, filter: &FlowFilter, group: StatsGroup) -> Result<Vec<StatsRow>> {
		let (where_sql, values) = filter.where_clause();
		let column = group.column();
		let sql = format!(
			"SELECT {column}, COUNT(*), COALESCE(SUM(input_tokens),0), \
			 COALESCE(SUM(output_tokens),0), COALESCE(SUM(total_cost),0) \
			 FROM flows{where_sql} GROUP BY {column} ORDER BY COUNT(*) DESC"
		);
		let conn = self.read.lock();
		let mut stmt = conn.prepare_cached(&sql)?;
		let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
			Ok(StatsRow {
				key: row.get(0)?,
				flows: row.get::<_, i64>(1)? as u64,
				input_tokens: row.get::<_, i64>(2)? as u64,
				output_tokens: row.get::<_, i64>(3)? as u64,
				total_cost: row.get(4)?,
			})
		})?;
		collect(rows)
	}

	pub fn pricing_entries(&self) -> Result<Vec<PricingEntry>> {
		let conn = self.read.lock();
		let mut stmt = conn.prepare_cached(
			"SELECT provider, pattern, input_per_1k, output_per_1k, cache_creation_per_1k, \
			 cache_read_per_1k, effective_date FROM pricing ORDER BY provider, pattern",
		)?;
		let rows = stmt.query_map([], |row| {
			Ok(PricingEntry {
				provider: Provider::parse(&row.get::<_, String>(0)?),
				pattern: row.get(1)?,
				input_per_1k: row.get(2)?,
				output_per_1k: row.get(3)?,
				cache_creation_per_1k: row.get(4)?,
				cache_read_per_1k: row.get(5)?,
				effective_date: row
					.get::<_, String>(6)?
					.parse()
					.unwrap_or_else(|_| chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()),
			})
		})?;
		collect(rows)
	}

	pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
		let conn = self.read.lock();
		let mut stmt = conn.prepare_cached("SELECT value FROM settings WHERE key = ?")?;
		let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
		match rows.next() {
			Some(v) => Ok(Some(v?)),
			None => Ok(None),
		}
	}

	/// Count of anomalies helpers: flows grouped by (host, path, task) within
	/// a window. Used by the rapid-repeat rule.
	pub fn rapid_repeat_groups(
		&self,
		window: Duration,
		threshold: usize,
	) -> Result<Vec<(String, String, Option<String>, u64)>> {
		let since = Utc::now() - chrono::Duration::from_std(window).unwrap_or_default();
		let conn = self.read.lock();
		let mut stmt = conn.prepare_cached(
			"SELECT host, path, task_id, COUNT(*) FROM flows WHERE timestamp >= ? \
			 GROUP BY host, path, task_id HAVING COUNT(*) >= ?",
		)?;
		let rows = stmt.query_map(params![ts(&since), threshold as i64], |row| {
			Ok((
				row.get(0)?,
				row.get(1)?,
				row.get(2)?,
				row.get::<_, i64>(3)? as u64,
			))
		})?;
		collect(rows)
	}
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
	let mut out = Vec::new();
	for row in rows {
		out.push(row?);
	}
	Ok(out)
}

pub(crate) fn headers_to_json(headers: &[(String, String)]) -> String {
	serde_json::to_string(headers).unwrap_or_else(|_| "[]".to_string())
}

fn headers_from_json(raw: Option<String>) -> Vec<(String, String)> {
	raw
		.and_then(|r| serde_json::from_str(&r).ok())
		.unwrap_or_default()
}

fn flow_from_row(row: &Row<'_>) -> rusqlite::Result<Flow> {
	Ok(Flow {
		id: row.get(0)?,
		host: row.get(1)?,
		method: row.get(2)?,
		path: row.get(3)?,
		url: row.get(4)?,
		timestamp: parse_ts(&row.get::<_, String>(5)?),
		timestamp_mono: row.get(6)?,
		duration_ms: row.get(7)?,
		status: row.get::<_, Option<i64>>(8)?.map(|s| s as u16),
		status_text: row.get(9)?,
		is_streaming: row.get(10)?,
		integrity: Integrity::parse(&row.get::<_, String>(11)?),
		events_dropped: row.get::<_, i64>(12)? as u64,
		request_body: BodyCapture {
			content: row.get(13)?,
			truncated: row.get(14)?,
		},
		response_body: BodyCapture {
			content: row.get(15)?,
			truncated: row.get(16)?,
		},
		request_headers: headers_from_json(row.get(17)?),
		response_headers: headers_from_json(row.get(18)?),
		task_id: row.get(19)?,
		task_source: row
			.get::<_, Option<String>>(20)?
			.and_then(|s| TaskSource::parse(&s)),
		request_signature: row.get(21)?,
		provider: Provider::parse(&row.get::<_, String>(22)?),
		model: row.get(23)?,
		usage: Usage {
			input_tokens: row.get::<_, Option<i64>>(24)?.map(|v| v as u64),
			output_tokens: row.get::<_, Option<i64>>(25)?.map(|v| v as u64),
			cache_creation_tokens: row.get::<_, Option<i64>>(26)?.map(|v| v as u64),
			cache_read_tokens: row.get::<_, Option<i64>>(27)?.map(|v| v as u64),
		},
		total_cost: row.get(28)?,
		cost_source: row
			.get::<_, Option<String>>(29)?
			.and_then(|s| CostSource::parse(&s)),
		created_at: parse_ts(&row.get::<_, String>(30)?),
		expires_at: row.get::<_, Option<String>>(31)?.map(|s| parse_ts(&s)),
	})
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
	Ok(Event {
		flow_id: row.get(0)?,
		sequence: row.get::<_, i64>(1)? as u64,
		timestamp: parse_ts(&row.get::<_, String>(2)?),
		timestamp_mono: row.get(3)?,
		event_type: row.get(4)?,
		payload: serde_json::from_str(&row.get::<_, String>(5)?)
			.unwrap_or(serde_json::Value::Null),
		priority: Priority::parse(&row.get::<_, String>(6)?),
	})
}

fn tool_from_row(row: &Row<'_>) -> rusqlite::Result<ToolInvocation> {
	Ok(ToolInvocation {
		flow_id: row.get(0)?,
		task_id: row.get(1)?,
		tool_name: row.get(2)?,
		tool_type: row.get(3)?,
		timestamp: parse_ts(&row.get::<_, String>(4)?),
		duration_ms: row.get(5)?,
		success: row.get::<_, Option<i64>>(6)?.map(|v| v != 0),
		error: row.get(7)?,
		input_tokens: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
		output_tokens: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
		cost: row.get(10)?,
	})
}

/// Map of per-flow highest committed sequence, shared between the writer and
/// the queue so per-flow byte accounting releases only after durable commit.
#[derive(Debug, Default)]
pub struct FlowLedger {
	persisted: Mutex<HashMap<String, u64>>,
}

impl FlowLedger {
	pub fn mark(&self, flow_id: &str, sequence: u64) {
		let mut map = self.persisted.lock();
		let entry = map.entry(flow_id.to_string()).or_insert(0);
		if sequence > *entry {
			*entry = sequence;
		}
	}

	pub fn last_persisted(&self, flow_id: &str) -> Option<u64> {
		self.persisted.lock().get(flow_id).copied()
	}

	pub fn forget(&self, flow_id: &str) {
		self.persisted.lock().remove(flow_id);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ts_is_lexicographically_ordered() {
		let a = Utc::now();
		let b = a + chrono::Duration::milliseconds(5);
		assert!(ts(&a) < ts(&b));
		let parsed = parse_ts(&ts(&a));
		assert_eq!(parsed.timestamp_micros(), a.timestamp_micros());
	}

	#[test]
	fn open_and_query_empty() {
		let dir = tempfile::tempdir().unwrap();
		let store = Store::open(&dir.path().join("t.db")).unwrap();
		assert_eq!(store.count_flows(&FlowFilter::default()).unwrap(), 0);
		assert!(store.list_flows(&FlowFilter::default()).unwrap().is_empty());
		assert!(store.get_flow("missing").unwrap().is_none());
	}
}
