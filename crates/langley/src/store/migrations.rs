//! Versioned, idempotent schema migrations over `PRAGMA user_version`.
//!
//! The writer applies pending migrations inside one EXCLUSIVE transaction,
//! which is the logical lock that serializes concurrent boots: the loser
//! blocks on the busy timeout, then sees the bumped version and applies
//! nothing.

use rusqlite::{Connection, TransactionBehavior};

const MIGRATIONS: &[&str] = &[
	// v1: core tables and indexes
	r#"
	CREATE TABLE IF NOT EXISTS flows (
		id TEXT PRIMARY KEY,
		host TEXT NOT NULL,
		method TEXT NOT NULL,
		path TEXT NOT NULL,
		url TEXT NOT NULL,
		timestamp TEXT NOT NULL,
		timestamp_mono INTEGER NOT NULL,
		duration_ms INTEGER,
		status INTEGER,
		status_text TEXT,
		is_streaming INTEGER NOT NULL DEFAULT 0,
		integrity TEXT NOT NULL DEFAULT 'complete'
			CHECK (integrity IN ('complete','partial','corrupted','interrupted')),
		events_dropped INTEGER NOT NULL DEFAULT 0,
		request_body TEXT,
		request_body_truncated INTEGER NOT NULL DEFAULT 0,
		response_body TEXT,
		response_body_truncated INTEGER NOT NULL DEFAULT 0,
		request_headers TEXT NOT NULL CHECK (json_valid(request_headers)),
		response_headers TEXT CHECK (response_headers IS NULL OR json_valid(response_headers)),
		task_id TEXT,
		task_source TEXT CHECK (task_source IN ('explicit','metadata','inferred')),
		request_signature TEXT,
		provider TEXT NOT NULL
			CHECK (provider IN ('anthropic','openai','bedrock','gemini','other')),
		model TEXT,
		input_tokens INTEGER,
		output_tokens INTEGER,
		cache_creation_tokens INTEGER,
		cache_read_tokens INTEGER,
		total_cost REAL,
		cost_source TEXT CHECK (cost_source IS NULL OR cost_source IN ('exact','estimated')),
		created_at TEXT NOT NULL,
		expires_at TEXT,
		CHECK ((task_id IS NULL) = (task_source IS NULL))
	);
	CREATE INDEX IF NOT EXISTS idx_flows_timestamp ON flows(timestamp DESC);
	CREATE INDEX IF NOT EXISTS idx_flows_task ON flows(task_id, timestamp DESC);
	CREATE INDEX IF NOT EXISTS idx_flows_host ON flows(host, timestamp DESC);
	CREATE INDEX IF NOT EXISTS idx_flows_model ON flows(model, timestamp);
	CREATE INDEX IF NOT EXISTS idx_flows_expires ON flows(expires_at)
		WHERE expires_at IS NOT NULL;

	CREATE TABLE IF NOT EXISTS events (
		id INTEGER PRIMARY KEY AUTOINCREMENT,
		flow_id TEXT NOT NULL REFERENCES flows(id) ON DELETE CASCADE,
		sequence INTEGER NOT NULL,
		timestamp TEXT NOT NULL,
		timestamp_mono INTEGER NOT NULL,
		event_type TEXT NOT NULL,
		payload TEXT NOT NULL CHECK (json_valid(payload)),
		priority TEXT NOT NULL CHECK (priority IN ('high','medium','low')),
		expires_at TEXT,
		UNIQUE (flow_id, sequence)
	);
	CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type, timestamp);

	CREATE TABLE IF NOT EXISTS tool_invocations (
		id INTEGER PRIMARY KEY AUTOINCREMENT,
		flow_id TEXT NOT NULL REFERENCES flows(id) ON DELETE CASCADE,
		task_id TEXT,
		tool_name TEXT NOT NULL,
		tool_type TEXT NOT NULL,
		timestamp TEXT NOT NULL,
		duration_ms INTEGER,
		success INTEGER,
		error TEXT,
		input_tokens INTEGER,
		output_tokens INTEGER,
		cost REAL,
		expires_at TEXT
	);
	CREATE INDEX IF NOT EXISTS idx_tools_name ON tool_invocations(tool_name, timestamp);
	CREATE INDEX IF NOT EXISTS idx_tools_task ON tool_invocations(task_id, timestamp);

	CREATE TABLE IF NOT EXISTS drop_log (
		id INTEGER PRIMARY KEY AUTOINCREMENT,
		flow_id TEXT,
		event_type TEXT NOT NULL,
		priority TEXT NOT NULL CHECK (priority IN ('high','medium','low')),
		reason TEXT NOT NULL,
		timestamp TEXT NOT NULL
	);
	CREATE INDEX IF NOT EXISTS idx_drop_log_timestamp ON drop_log(timestamp);

	CREATE TABLE IF NOT EXISTS pricing (
		provider TEXT NOT NULL
			CHECK (provider IN ('anthropic','openai','bedrock','gemini','other')),
		pattern TEXT NOT NULL,
		input_per_1k REAL NOT NULL,
		output_per_1k REAL NOT NULL,
		cache_creation_per_1k REAL,
		cache_read_per_1k REAL,
		effective_date TEXT NOT NULL,
		PRIMARY KEY (provider, pattern, effective_date)
	);

	CREATE TABLE IF NOT EXISTS settings (
		key TEXT PRIMARY KEY,
		value TEXT NOT NULL
	);
	"#,
];

/// Apply pending migrations. Running twice leaves `user_version` unchanged.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<()> {
	let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
	let version: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
	for (i, migration) in MIGRATIONS.iter().enumerate().skip(version as usize) {
		tx.execute_batch(migration)?;
		tx.pragma_update(None, "user_version", (i + 1) as i64)?;
	}
	tx.commit()
}

pub fn schema_version(conn: &Connection) -> rusqlite::Result<i64> {
	conn.query_row("PRAGMA user_version", [], |row| row.get(0))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn migrate_is_idempotent() {
		let mut conn = Connection::open_in_memory().unwrap();
		migrate(&mut conn).unwrap();
		let v1 = schema_version(&conn).unwrap();
		migrate(&mut conn).unwrap();
		let v2 = schema_version(&conn).unwrap();
		assert_eq!(v1, v2);
		assert_eq!(v1, MIGRATIONS.len() as i64);
	}

	#[test]
	fn enum_checks_reject_bad_rows() {
		let mut conn = Connection::open_in_memory().unwrap();
		migrate(&mut conn).unwrap();
		let err = conn.execute(
			"INSERT INTO flows (id, host, method, path, url, timestamp, timestamp_mono,
				request_headers, provider, created_at, integrity)
			 VALUES ('f1','h','GET','/','u','2026-01-01T00:00:00Z',0,'[]','nonsense','2026-01-01T00:00:00Z','complete')",
			[],
		);
		assert!(err.is_err());
	}

	#[test]
	fn task_id_and_source_are_paired() {
		let mut conn = Connection::open_in_memory().unwrap();
		migrate(&mut conn).unwrap();
		let err = conn.execute(
			"INSERT INTO flows (id, host, method, path, url, timestamp, timestamp_mono,
				request_headers, provider, created_at, task_id)
			 VALUES ('f1','h','GET','/','u','2026-01-01T00:00:00Z',0,'[]','other','2026-01-01T00:00:00Z','T1')",
			[],
		);
		assert!(err.is_err());
	}
}
