//! Provider recognition and response parsing.
//!
//! A provider is a small capability set: recognize the target host, extract
//! usage/model from a response body, and classify streaming frames into
//! typed, priority-tagged events. Providers are held in a registry in
//! detection order; adding one is data, not new dispatch machinery.

use serde_json::Value;

use crate::parse::sse::{SseFrame, SseParser};
use crate::types::{Priority, Provider as ProviderTag, Usage};

pub mod anthropic;
pub mod bedrock;
pub mod gemini;
pub mod openai;

/// Usage and model pulled from one response body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageExtract {
	pub usage: Usage,
	pub model: Option<String>,
}

/// One streaming frame, typed by the provider's event convention.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
	pub event_type: String,
	pub payload: Value,
	pub priority: Priority,
}

pub trait ProviderParser: Send + Sync {
	fn name(&self) -> ProviderTag;

	/// Host recognition with domain-boundary safety: only the provider's
	/// registrable domain matches, never a lookalike suffix or prefix.
	fn matches(&self, host: &str) -> bool;

	/// Extract usage from a complete (possibly SSE) body. Unknown or empty
	/// payloads yield zero usage with no error.
	fn parse_usage(&self, body: &[u8], is_sse: bool) -> UsageExtract;

	/// Classify one SSE frame. `None` for frames carrying nothing worth
	/// recording (keepalives).
	fn classify_frame(&self, frame: &SseFrame) -> Option<ParsedEvent>;
}

pub struct Registry {
	providers: Vec<Box<dyn ProviderParser>>,
}

impl Default for Registry {
	fn default() -> Self {
		Registry::new()
	}
}

impl Registry {
	pub fn new() -> Registry {
		Registry {
			providers: vec![
				Box::new(anthropic::Provider),
				Box::new(openai::Provider),
				Box::new(bedrock::Provider),
				Box::new(gemini::Provider),
			],
		}
	}

	pub fn detect(&self, host: &str) -> ProviderTag {
		self
			.providers
			.iter()
			.find(|p| p.matches(host))
			.map(|p| p.name())
			.unwrap_or(ProviderTag::Other)
	}

	pub fn get(&self, tag: ProviderTag) -> Option<&dyn ProviderParser> {
		self
			.providers
			.iter()
			.find(|p| p.name() == tag)
			.map(|p| p.as_ref())
	}

	pub fn for_host(&self, host: &str) -> Option<&dyn ProviderParser> {
		self.providers.iter().find(|p| p.matches(host)).map(|p| p.as_ref())
	}
}

/// True when `host` is `domain` or a subdomain of it. `foo-domain.com` and
/// `domain.com.evil.com` never match.
pub(crate) fn host_on_domain(host: &str, domain: &str) -> bool {
	let host = strip_port(host).to_ascii_lowercase();
	host == domain
		|| host
			.strip_suffix(domain)
			.is_some_and(|prefix| prefix.ends_with('.'))
}

pub(crate) fn strip_port(host: &str) -> &str {
	match host.rsplit_once(':') {
		Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
		_ => host,
	}
}

pub(crate) fn first_label(host: &str) -> &str {
	strip_port(host).split('.').next().unwrap_or(host)
}

/// Walk `paths` in order and return the first u64 found. Mirrors the loose
/// shapes providers actually emit rather than one canonical schema.
pub(crate) fn first_u64_at_paths(value: &Value, paths: &[&[&str]]) -> Option<u64> {
	paths
		.iter()
		.find_map(|path| value_at_path(value, path).and_then(Value::as_u64))
}

pub(crate) fn first_str_at_paths(value: &Value, paths: &[&[&str]]) -> Option<String> {
	paths.iter().find_map(|path| {
		value_at_path(value, path)
			.and_then(Value::as_str)
			.map(str::to_string)
	})
}

fn value_at_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
	let mut current = value;
	for seg in path {
		current = current.get(*seg)?;
	}
	Some(current)
}

/// Run the extractor over every frame of an SSE body, merging what each
/// frame contributes. Later frames win field-by-field.
pub(crate) fn sse_usage(body: &[u8], extract: impl Fn(&Value) -> UsageExtract) -> UsageExtract {
	let mut parser = SseParser::default();
	let mut merged = UsageExtract::default();
	let mut frames = parser.push(body);
	frames.extend(parser.finish());
	for frame in frames {
		let Ok(json) = serde_json::from_str::<Value>(&frame.data) else {
			continue;
		};
		let found = extract(&json);
		merged.usage.merge(found.usage);
		if found.model.is_some() {
			merged.model = found.model;
		}
	}
	merged
}

pub(crate) fn json_payload(frame: &SseFrame) -> Value {
	serde_json::from_str(&frame.data).unwrap_or_else(|_| Value::String(frame.data.clone()))
}
