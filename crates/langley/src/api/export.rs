//! Flow export: NDJSON streams unbounded, JSON and CSV are bounded.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;

use super::{ApiError, ApiState, ListQuery, blocking};
use crate::store::FlowFilter;
use crate::types::Flow;

const BOUNDED_MAX_ROWS: u64 = 10_000;
const PAGE_SIZE: u64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
	Ndjson,
	Json,
	Csv,
}

#[derive(Deserialize)]
pub struct ExportQuery {
	#[serde(default = "default_format")]
	format: ExportFormat,
	#[serde(default)]
	include_bodies: bool,
	max_rows: Option<u64>,
}

fn default_format() -> ExportFormat {
	ExportFormat::Ndjson
}

pub async fn export_flows(
	State(state): State<Arc<ApiState>>,
	Query(query): Query<ExportQuery>,
	Query(list): Query<ListQuery>,
) -> Result<Response, ApiError> {
	let mut filter = list.filter();
	filter.offset = 0;
	match query.format {
		ExportFormat::Ndjson => Ok(stream_ndjson(state, filter, query)),
		ExportFormat::Json => {
			let rows = bounded_rows(&state, filter, &query).await?;
			let body = serde_json::to_vec(&rows).map_err(|e| ApiError::BadRequest(e.to_string()))?;
			Ok(
				(
					StatusCode::OK,
					[(header::CONTENT_TYPE, "application/json")],
					body,
				)
					.into_response(),
			)
		},
		ExportFormat::Csv => {
			let rows = bounded_rows(&state, filter, &query).await?;
			let mut out = String::new();
			out.push_str(CSV_HEADER);
			out.push('\n');
			for flow in &rows {
				csv_row(&mut out, flow, query.include_bodies);
			}
			Ok(
				(
					StatusCode::OK,
					[
						(header::CONTENT_TYPE, "text/csv"),
						(header::CONTENT_DISPOSITION, "attachment; filename=\"flows.csv\""),
					],
					out,
				)
					.into_response(),
			)
		},
	}
}

async fn bounded_rows(
	state: &Arc<ApiState>,
	mut filter: FlowFilter,
	query: &ExportQuery,
) -> Result<Vec<Flow>, ApiError> {
	filter.limit = query
		.max_rows
		.unwrap_or(BOUNDED_MAX_ROWS)
		.min(BOUNDED_MAX_ROWS);
	let include_bodies = query.include_bodies;
	let store = state.store.clone();
	let mut rows = blocking(move || store.list_flows(&filter)).await?;
	if !include_bodies {
		for flow in &mut rows {
			strip_bodies(flow);
		}
	}
	Ok(rows)
}

fn stream_ndjson(state: Arc<ApiState>, filter: FlowFilter, query: ExportQuery) -> Response {
	struct PageState {
		state: Arc<ApiState>,
		filter: FlowFilter,
		offset: u64,
		remaining: Option<u64>,
		include_bodies: bool,
		done: bool,
	}
	let initial = PageState {
		state,
		filter,
		offset: 0,
		remaining: query.max_rows,
		include_bodies: query.include_bodies,
		done: false,
	};
	let stream = futures_util::stream::unfold(initial, |mut st| async move {
		if st.done {
			return None;
		}
		let page = st.remaining.unwrap_or(PAGE_SIZE).min(PAGE_SIZE);
		if page == 0 {
			return None;
		}
		let mut filter = st.filter.clone();
		filter.offset = st.offset;
		filter.limit = page;
		let store = st.state.store.clone();
		let rows = match tokio::task::spawn_blocking(move || store.list_flows(&filter)).await {
			Ok(Ok(rows)) => rows,
			_ => return None,
		};
		if rows.is_empty() {
			return None;
		}
		let count = rows.len() as u64;
		st.offset += count;
		if let Some(remaining) = st.remaining.as_mut() {
			*remaining = remaining.saturating_sub(count);
		}
		if count < page {
			st.done = true;
		}
		let mut buf = String::new();
		for mut flow in rows {
			if !st.include_bodies {
				strip_bodies(&mut flow);
			}
			if let Ok(line) = serde_json::to_string(&flow) {
				buf.push_str(&line);
				buf.push('\n');
			}
		}
		Some((Ok::<Bytes, std::convert::Infallible>(Bytes::from(buf)), st))
	});
	(
		StatusCode::OK,
		[(header::CONTENT_TYPE, "application/x-ndjson")],
		Body::from_stream(stream),
	)
		.into_response()
}

fn strip_bodies(flow: &mut Flow) {
	flow.request_body.content = None;
	flow.response_body.content = None;
}

const CSV_HEADER: &str = "id,timestamp,host,method,path,status,provider,model,task_id,\
	input_tokens,output_tokens,cache_creation_tokens,cache_read_tokens,total_cost,duration_ms,\
	integrity,is_streaming,request_body,response_body";

fn csv_row(out: &mut String, flow: &Flow, include_bodies: bool) {
	let fields: Vec<String> = vec![
		flow.id.clone(),
		flow.timestamp.to_rfc3339(),
		flow.host.clone(),
		flow.method.clone(),
		flow.path.clone(),
		flow.status.map(|s| s.to_string()).unwrap_or_default(),
		flow.provider.as_str().to_string(),
		flow.model.clone().unwrap_or_default(),
		flow.task_id.clone().unwrap_or_default(),
		opt_num(flow.usage.input_tokens),
		opt_num(flow.usage.output_tokens),
		opt_num(flow.usage.cache_creation_tokens),
		opt_num(flow.usage.cache_read_tokens),
		flow.total_cost.map(|c| format!("{c:.6}")).unwrap_or_default(),
		flow.duration_ms.map(|d| d.to_string()).unwrap_or_default(),
		flow.integrity.as_str().to_string(),
		flow.is_streaming.to_string(),
		if include_bodies {
			flow.request_body.content.clone().unwrap_or_default()
		} else {
			String::new()
		},
		if include_bodies {
			flow.response_body.content.clone().unwrap_or_default()
		} else {
			String::new()
		},
	];
	let escaped: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
	out.push_str(&escaped.join(","));
	out.push('\n');
}

fn opt_num(v: Option<u64>) -> String {
	v.map(|n| n.to_string()).unwrap_or_default()
}

fn csv_escape(field: &str) -> String {
	if field.contains([',', '"', '\n', '\r']) {
		format!("\"{}\"", field.replace('"', "\"\""))
	} else {
		field.to_string()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn csv_escaping() {
		assert_eq!(csv_escape("plain"), "plain");
		assert_eq!(csv_escape("a,b"), "\"a,b\"");
		assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
		assert_eq!(csv_escape("line\nbreak"), "\"line\nbreak\"");
	}

	#[test]
	fn header_matches_row_arity() {
		let columns = CSV_HEADER.split(',').count();
		assert_eq!(columns, 19);
	}
}
