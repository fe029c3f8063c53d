//! The single writer task. Drains the persistence queue, commits batches,
//! and is the only component that mutates store rows. Telemetry failures
//! here never fail an exchange: after the retry budget the batch is dropped
//! and the proxy keeps forwarding.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{Connection, Transaction, params};

use super::queue::{FlowFinal, PersistQueue, WorkItem};
use super::{FlowLedger, configure_connection, headers_to_json, migrations, ts};
use crate::config::{PersistenceConfig, RetentionConfig};
use crate::errors::{ActionableError, InitError};
use crate::hub::{EventSummary, FlowSummary, Hub, HubMessage};
use crate::pricing::{PricingEntry, PricingTable, seed_entries};
use crate::types::{DropLogEntry, Event, Flow, Priority, Provider, ToolInvocation};

const COMMIT_RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(50);
/// Reclaim pages only when at least this share of the file is free.
const VACUUM_FREE_RATIO: f64 = 0.25;

pub struct WriterHandle {
	thread: Option<std::thread::JoinHandle<()>>,
}

impl WriterHandle {
	/// Blocks until the writer has flushed and exited. Call after
	/// `queue.close()`.
	pub fn join(mut self) {
		if let Some(thread) = self.thread.take() {
			let _ = thread.join();
		}
	}
}

pub struct Writer {
	conn: Connection,
	queue: Arc<PersistQueue>,
	hub: Arc<Hub>,
	ledger: Arc<FlowLedger>,
	pricing: Arc<PricingTable>,
	persistence: PersistenceConfig,
	retention: RetentionConfig,
}

/// Spawn the writer thread. Migrations (and the pricing seed) run before
/// this returns, so a schema or lock problem surfaces as a classified init
/// error instead of a background panic.
pub fn spawn(
	db_path: PathBuf,
	queue: Arc<PersistQueue>,
	hub: Arc<Hub>,
	ledger: Arc<FlowLedger>,
	pricing: Arc<PricingTable>,
	persistence: PersistenceConfig,
	retention: RetentionConfig,
) -> Result<WriterHandle, InitError> {
	let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<(), InitError>>();
	let thread = std::thread::Builder::new()
		.name("langley-writer".to_string())
		.spawn(move || {
			let mut writer = match Writer::open(
				&db_path,
				queue,
				hub,
				ledger,
				pricing,
				persistence,
				retention,
			) {
				Ok(writer) => {
					let _ = ready_tx.send(Ok(()));
					writer
				},
				Err(e) => {
					let _ = ready_tx.send(Err(e));
					return;
				},
			};
			writer.run();
		})
		.map_err(|e| {
			InitError::Io(ActionableError::new(
				"cannot spawn writer thread",
				e.to_string(),
				"check process resource limits",
			))
		})?;
	match ready_rx.recv() {
		Ok(Ok(())) => Ok(WriterHandle {
			thread: Some(thread),
		}),
		Ok(Err(e)) => Err(e),
		Err(_) => Err(InitError::Io(ActionableError::new(
			"writer thread exited during startup",
			"initialization channel closed",
			"check earlier log lines for the underlying error",
		))),
	}
}

impl Writer {
	fn open(
		db_path: &Path,
		queue: Arc<PersistQueue>,
		hub: Arc<Hub>,
		ledger: Arc<FlowLedger>,
		pricing: Arc<PricingTable>,
		persistence: PersistenceConfig,
		retention: RetentionConfig,
	) -> Result<Writer, InitError> {
		let mut conn = Connection::open(db_path).map_err(|e| classify_sqlite(db_path, e))?;
		configure_connection(&conn).map_err(|e| classify_sqlite(db_path, e))?;
		migrations::migrate(&mut conn).map_err(|e| classify_sqlite(db_path, e))?;
		let writer = Writer {
			conn,
			queue,
			hub,
			ledger,
			pricing,
			persistence,
			retention,
		};
		writer.seed_pricing().map_err(|e| classify_sqlite(db_path, e))?;
		Ok(writer)
	}

	fn seed_pricing(&self) -> rusqlite::Result<()> {
		let count: i64 = self
			.conn
			.query_row("SELECT COUNT(*) FROM pricing", [], |row| row.get(0))?;
		if count == 0 {
			for entry in seed_entries() {
				insert_pricing(&self.conn, &entry)?;
			}
		}
		// Mirror whatever the store holds into the data plane's table.
		let mut stmt = self.conn.prepare(
			"SELECT provider, pattern, input_per_1k, output_per_1k, cache_creation_per_1k, \
			 cache_read_per_1k, effective_date FROM pricing",
		)?;
		let entries = stmt
			.query_map([], |row| {
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
			})?
			.collect::<rusqlite::Result<Vec<_>>>()?;
		self.pricing.replace(entries);
		Ok(())
	}

	fn batch_size(&self) -> usize {
		// Under pressure, flush smaller batches so the queue drains sooner.
		if self.queue.pressure() >= 0.80 {
			(self.persistence.batch_size / 5).max(5)
		} else {
			self.persistence.batch_size
		}
	}

	fn run(&mut self) {
		let interval = Duration::from_millis(self.persistence.batch_interval_ms);
		loop {
			let Some(batch) = self.queue.pop_batch(self.batch_size(), interval) else {
				break;
			};
			let drops = self.queue.drain_drops();
			let penalties = self.queue.drain_penalties();
			if batch.is_empty() && drops.is_empty() && penalties.is_empty() {
				continue;
			}
			self.commit_with_retry(&batch, &drops, &penalties);
		}
		tracing::info!("writer drained and exiting");
	}

	fn commit_with_retry(
		&mut self,
		batch: &[WorkItem],
		drops: &[DropLogEntry],
		penalties: &[(String, Priority)],
	) {
		let mut attempt = 0;
		loop {
			match self.commit_once(batch, drops, penalties) {
				Ok(()) => {
					self.post_commit(batch, penalties);
					return;
				},
				Err(e) if attempt < COMMIT_RETRIES => {
					attempt += 1;
					let backoff = RETRY_BASE * 2u32.pow(attempt - 1);
					tracing::warn!(attempt, error = %e, "batch commit failed; retrying");
					std::thread::sleep(backoff);
				},
				Err(e) => {
					// The proxy must not stall on persistence: drop the batch.
					tracing::error!(items = batch.len(), error = %e, "batch commit failed permanently; dropping batch");
					self.release(batch);
					return;
				},
			}
		}
	}

	fn commit_once(
		&mut self,
		batch: &[WorkItem],
		drops: &[DropLogEntry],
		penalties: &[(String, Priority)],
	) -> rusqlite::Result<()> {
		let mut sweep: Option<DateTime<Utc>> = None;
		{
			let tx = self.conn.transaction()?;
			for item in batch {
				match item {
					WorkItem::FlowSkeleton(flow) => {
						insert_flow(&tx, flow, &self.retention)?;
					},
					WorkItem::FlowFinal(fin) => {
						ensure_flow(&tx, &fin.flow_id, &self.retention)?;
						finalize_flow(&tx, fin)?;
					},
					WorkItem::Event(event) => {
						ensure_flow(&tx, &event.flow_id, &self.retention)?;
						insert_event(&tx, event, &self.retention)?;
					},
					WorkItem::Tools(tools) => {
						for tool in tools {
							ensure_flow(&tx, &tool.flow_id, &self.retention)?;
							insert_tool(&tx, tool, &self.retention)?;
						}
					},
					WorkItem::ReplacePricing(entries) => {
						tx.execute("DELETE FROM pricing", [])?;
						for entry in entries {
							insert_pricing(&tx, entry)?;
						}
					},
					WorkItem::PutSetting(key, value) => {
						tx.execute(
							"INSERT INTO settings (key, value) VALUES (?1, ?2) \
							 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
							params![key, value],
						)?;
					},
					WorkItem::RetentionSweep(now) => {
						run_sweep(&tx, now, &self.retention)?;
						sweep = Some(*now);
					},
				}
			}
			for drop in drops {
				insert_drop(&tx, drop)?;
			}
			for (flow_id, priority) in penalties {
				apply_penalty(&tx, flow_id, *priority)?;
			}
			tx.commit()?;
		}
		if sweep.is_some() {
			self.maybe_vacuum()?;
		}
		Ok(())
	}

	fn post_commit(&self, batch: &[WorkItem], penalties: &[(String, Priority)]) {
		let mut released: Vec<(String, usize)> = Vec::new();
		let mut free_bytes = 0usize;
		for item in batch {
			match item.flow_id() {
				Some(flow) => released.push((flow.to_string(), item.cost_bytes())),
				None => free_bytes += item.cost_bytes(),
			}
			match item {
				WorkItem::FlowSkeleton(flow) => {
					self.ledger.mark(&flow.id, 0);
					self.hub.broadcast(HubMessage::FlowStart(FlowSummary::from(flow.as_ref())));
				},
				WorkItem::FlowFinal(fin) => {
					self.ledger.forget(&fin.flow_id);
					self.hub.broadcast(HubMessage::FlowComplete(final_summary(fin)));
				},
				WorkItem::Event(event) => {
					self.ledger.mark(&event.flow_id, event.sequence);
					self.hub.broadcast(HubMessage::Event(EventSummary {
						flow_id: event.flow_id.clone(),
						sequence: event.sequence,
						event_type: event.event_type.clone(),
					}));
				},
				WorkItem::ReplacePricing(entries) => {
					self.pricing.replace(entries.clone());
				},
				_ => {},
			}
		}
		for (flow_id, priority) in penalties {
			let integrity = if *priority == Priority::High {
				crate::types::Integrity::Corrupted
			} else {
				crate::types::Integrity::Partial
			};
			self.hub.broadcast(HubMessage::FlowUpdate {
				id: flow_id.clone(),
				integrity,
				events_dropped: 0,
			});
		}
		self.queue.commit_release(&released);
		if free_bytes > 0 {
			self.queue.commit_release_bytes(free_bytes);
		}
	}

	fn release(&self, batch: &[WorkItem]) {
		let mut released: Vec<(String, usize)> = Vec::new();
		let mut free_bytes = 0usize;
		for item in batch {
			match item.flow_id() {
				Some(flow) => released.push((flow.to_string(), item.cost_bytes())),
				None => free_bytes += item.cost_bytes(),
			}
		}
		self.queue.commit_release(&released);
		if free_bytes > 0 {
			self.queue.commit_release_bytes(free_bytes);
		}
	}

	fn maybe_vacuum(&self) -> rusqlite::Result<()> {
		let free: i64 = self
			.conn
			.query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
		let total: i64 = self
			.conn
			.query_row("PRAGMA page_count", [], |row| row.get(0))?;
		if total > 0 && (free as f64 / total as f64) > VACUUM_FREE_RATIO {
			tracing::info!(free, total, "reclaiming free pages");
			self.conn.execute_batch("VACUUM")?;
		}
		Ok(())
	}
}

fn classify_sqlite(path: &Path, e: rusqlite::Error) -> InitError {
	let msg = e.to_string();
	if msg.contains("locked") || msg.contains("busy") {
		InitError::DatabaseLocked(ActionableError::new(
			format!("database {} is locked", path.display()),
			msg,
			"another langley instance may be running; stop it or use a different db_path",
		))
	} else {
		InitError::Io(ActionableError::new(
			format!("cannot open database {}", path.display()),
			msg,
			"check the path exists and is writable",
		))
	}
}

fn expires(from: DateTime<Utc>, days: u32) -> String {
	ts(&(from + ChronoDuration::days(i64::from(days))))
}

fn insert_flow(tx: &Transaction<'_>, flow: &Flow, retention: &RetentionConfig) -> rusqlite::Result<()> {
	tx.execute(
		"INSERT INTO flows (id, host, method, path, url, timestamp, timestamp_mono, \
		 is_streaming, integrity, events_dropped, request_body, request_body_truncated, \
		 request_headers, task_id, task_source, request_signature, provider, model, created_at, \
		 expires_at) \
		 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20) \
		 ON CONFLICT(id) DO NOTHING",
		params![
			flow.id,
			flow.host,
			flow.method,
			flow.path,
			flow.url,
			ts(&flow.timestamp),
			flow.timestamp_mono,
			flow.is_streaming,
			flow.integrity.as_str(),
			flow.events_dropped as i64,
			flow.request_body.content,
			flow.request_body.truncated,
			headers_to_json(&flow.request_headers),
			flow.task_id,
			flow.task_source.map(|s| s.as_str()),
			flow.request_signature,
			flow.provider.as_str(),
			flow.model,
			ts(&flow.created_at),
			expires(flow.created_at, retention.flows_ttl_days),
		],
	)?;
	Ok(())
}

/// A skeleton row is still created when the original skeleton was lost, so
/// events and the final update have a parent to reference.
fn ensure_flow(tx: &Transaction<'_>, flow_id: &str, retention: &RetentionConfig) -> rusqlite::Result<()> {
	let now = Utc::now();
	tx.execute(
		"INSERT INTO flows (id, host, method, path, url, timestamp, timestamp_mono, \
		 request_headers, provider, integrity, created_at, expires_at) \
		 VALUES (?1, 'unknown', '', '', '', ?2, 0, '[]', 'other', 'corrupted', ?2, ?3) \
		 ON CONFLICT(id) DO NOTHING",
		params![flow_id, ts(&now), expires(now, retention.flows_ttl_days)],
	)?;
	Ok(())
}

fn finalize_flow(tx: &Transaction<'_>, fin: &FlowFinal) -> rusqlite::Result<()> {
	tx.execute(
		"UPDATE flows SET \
			duration_ms = ?2, status = ?3, status_text = ?4, is_streaming = ?5, \
			integrity = CASE \
				WHEN integrity = 'corrupted' OR ?6 = 'corrupted' THEN 'corrupted' \
				WHEN integrity = 'interrupted' OR ?6 = 'interrupted' THEN 'interrupted' \
				WHEN integrity = 'partial' OR ?6 = 'partial' THEN 'partial' \
				ELSE 'complete' END, \
			events_dropped = MAX(events_dropped, ?7), \
			response_body = ?8, response_body_truncated = ?9, response_headers = ?10, \
			model = COALESCE(?11, model), input_tokens = ?12, output_tokens = ?13, \
			cache_creation_tokens = ?14, cache_read_tokens = ?15, total_cost = ?16, \
			cost_source = ?17 \
		 WHERE id = ?1",
		params![
			fin.flow_id,
			fin.duration_ms,
			fin.status.map(i64::from),
			fin.status_text,
			fin.is_streaming,
			fin.integrity.as_str(),
			fin.events_dropped as i64,
			fin.response_body.content,
			fin.response_body.truncated,
			headers_to_json(&fin.response_headers),
			fin.model,
			fin.usage.input_tokens.map(|v| v as i64),
			fin.usage.output_tokens.map(|v| v as i64),
			fin.usage.cache_creation_tokens.map(|v| v as i64),
			fin.usage.cache_read_tokens.map(|v| v as i64),
			fin.total_cost,
			fin.cost_source.map(|s| s.as_str()),
		],
	)?;
	Ok(())
}

fn insert_event(tx: &Transaction<'_>, event: &Event, retention: &RetentionConfig) -> rusqlite::Result<()> {
	tx.execute(
		"INSERT INTO events (flow_id, sequence, timestamp, timestamp_mono, event_type, payload, \
		 priority, expires_at) VALUES (?1,?2,?3,?4,?5,?6,?7,?8) \
		 ON CONFLICT(flow_id, sequence) DO NOTHING",
		params![
			event.flow_id,
			event.sequence as i64,
			ts(&event.timestamp),
			event.timestamp_mono,
			event.event_type,
			event.payload.to_string(),
			event.priority.as_str(),
			expires(event.timestamp, retention.events_ttl_days),
		],
	)?;
	Ok(())
}

fn insert_tool(
	tx: &Transaction<'_>,
	tool: &ToolInvocation,
	retention: &RetentionConfig,
) -> rusqlite::Result<()> {
	tx.execute(
		"INSERT INTO tool_invocations (flow_id, task_id, tool_name, tool_type, timestamp, \
		 duration_ms, success, error, input_tokens, output_tokens, cost, expires_at) \
		 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)",
		params![
			tool.flow_id,
			tool.task_id,
			tool.tool_name,
			tool.tool_type,
			ts(&tool.timestamp),
			tool.duration_ms,
			tool.success.map(i64::from),
			tool.error,
			tool.input_tokens.map(|v| v as i64),
			tool.output_tokens.map(|v| v as i64),
			tool.cost,
			expires(tool.timestamp, retention.flows_ttl_days),
		],
	)?;
	Ok(())
}

fn insert_drop(tx: &Transaction<'_>, entry: &DropLogEntry) -> rusqlite::Result<()> {
	tx.execute(
		"INSERT INTO drop_log (flow_id, event_type, priority, reason, timestamp) \
		 VALUES (?1,?2,?3,?4,?5)",
		params![
			entry.flow_id,
			entry.event_type,
			entry.priority.as_str(),
			entry.reason,
			ts(&entry.timestamp),
		],
	)?;
	Ok(())
}

fn apply_penalty(tx: &Transaction<'_>, flow_id: &str, lost: Priority) -> rusqlite::Result<()> {
	let proposed = if lost == Priority::High {
		"corrupted"
	} else {
		"partial"
	};
	tx.execute(
		"UPDATE flows SET \
			integrity = CASE \
				WHEN integrity = 'corrupted' OR ?2 = 'corrupted' THEN 'corrupted' \
				WHEN integrity = 'interrupted' THEN 'interrupted' \
				ELSE ?2 END, \
			events_dropped = events_dropped + 1 \
		 WHERE id = ?1",
		params![flow_id, proposed],
	)?;
	Ok(())
}

fn insert_pricing(conn: &Connection, entry: &PricingEntry) -> rusqlite::Result<()> {
	conn.execute(
		"INSERT INTO pricing (provider, pattern, input_per_1k, output_per_1k, \
		 cache_creation_per_1k, cache_read_per_1k, effective_date) VALUES (?1,?2,?3,?4,?5,?6,?7) \
		 ON CONFLICT(provider, pattern, effective_date) DO UPDATE SET \
		 input_per_1k = excluded.input_per_1k, output_per_1k = excluded.output_per_1k, \
		 cache_creation_per_1k = excluded.cache_creation_per_1k, \
		 cache_read_per_1k = excluded.cache_read_per_1k",
		params![
			entry.provider.as_str(),
			entry.pattern,
			entry.input_per_1k,
			entry.output_per_1k,
			entry.cache_creation_per_1k,
			entry.cache_read_per_1k,
			entry.effective_date.to_string(),
		],
	)?;
	Ok(())
}

fn run_sweep(
	tx: &Transaction<'_>,
	now: &DateTime<Utc>,
	retention: &RetentionConfig,
) -> rusqlite::Result<()> {
	let now_s = ts(now);
	// Cascades purge events and tool invocations.
	let flows = tx.execute(
		"DELETE FROM flows WHERE expires_at IS NOT NULL AND expires_at < ?1",
		params![now_s],
	)?;
	let events = tx.execute(
		"DELETE FROM events WHERE expires_at IS NOT NULL AND expires_at < ?1",
		params![now_s],
	)?;
	let cutoff = ts(&(*now - ChronoDuration::days(i64::from(retention.drop_log_ttl_days))));
	let drops = tx.execute("DELETE FROM drop_log WHERE timestamp < ?1", params![cutoff])?;
	if flows + events + drops > 0 {
		tracing::info!(flows, events, drops, "retention sweep removed expired rows");
	}
	Ok(())
}

fn final_summary(fin: &FlowFinal) -> FlowSummary {
	FlowSummary {
		id: fin.flow_id.clone(),
		host: fin.host.clone(),
		method: fin.method.clone(),
		path: fin.path.clone(),
		status: fin.status,
		model: fin.model.clone(),
		task_id: fin.task_id.clone(),
		input_tokens: fin.usage.input_tokens,
		output_tokens: fin.usage.output_tokens,
		total_cost: fin.total_cost,
		is_streaming: fin.is_streaming,
		integrity: fin.integrity,
	}
}
