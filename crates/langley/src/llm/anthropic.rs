use serde_json::Value;

use super::{
	ParsedEvent, ProviderParser, UsageExtract, first_str_at_paths, first_u64_at_paths, host_on_domain,
	json_payload, sse_usage,
};
use crate::parse::sse::SseFrame;
use crate::types::{Priority, Provider as ProviderTag, Usage};

pub const DEFAULT_HOST: &str = "api.anthropic.com";

pub struct Provider;

impl ProviderParser for Provider {
	fn name(&self) -> ProviderTag {
		ProviderTag::Anthropic
	}

	fn matches(&self, host: &str) -> bool {
		host_on_domain(host, "anthropic.com")
	}

	fn parse_usage(&self, body: &[u8], is_sse: bool) -> UsageExtract {
		if is_sse {
			return sse_usage(body, extract);
		}
		match serde_json::from_slice::<Value>(body) {
			Ok(json) => extract(&json),
			Err(_) => UsageExtract::default(),
		}
	}

	fn classify_frame(&self, frame: &SseFrame) -> Option<ParsedEvent> {
		// https://docs.anthropic.com/en/docs/build-with-claude/streaming
		let payload = json_payload(frame);
		let event_type = frame
			.event
			.clone()
			.or_else(|| first_str_at_paths(&payload, &[&["type"]]))
			.unwrap_or_else(|| "unknown".to_string());
		let priority = match event_type.as_str() {
			"message_start" | "message_delta" | "message_stop" | "error" => Priority::High,
			"content_block_start" | "content_block_stop" => Priority::Medium,
			"content_block_delta" => Priority::Low,
			"ping" => return None,
			_ => Priority::Low,
		};
		Some(ParsedEvent {
			event_type,
			payload,
			priority,
		})
	}
}

fn extract(json: &Value) -> UsageExtract {
	UsageExtract {
		usage: Usage {
			input_tokens: first_u64_at_paths(
				json,
				&[
					&["usage", "input_tokens"],
					&["message", "usage", "input_tokens"],
				],
			),
			output_tokens: first_u64_at_paths(
				json,
				&[
					&["usage", "output_tokens"],
					&["message", "usage", "output_tokens"],
				],
			),
			cache_creation_tokens: first_u64_at_paths(
				json,
				&[
					&["usage", "cache_creation_input_tokens"],
					&["message", "usage", "cache_creation_input_tokens"],
				],
			),
			cache_read_tokens: first_u64_at_paths(
				json,
				&[
					&["usage", "cache_read_input_tokens"],
					&["message", "usage", "cache_read_input_tokens"],
				],
			),
		},
		model: first_str_at_paths(json, &[&["model"], &["message", "model"]]),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_native_usage() {
		let body = br#"{"model":"claude-3-5-sonnet-20241022","usage":{"input_tokens":137,"output_tokens":42,"cache_read_input_tokens":10}}"#;
		let out = Provider.parse_usage(body, false);
		assert_eq!(out.usage.input_tokens, Some(137));
		assert_eq!(out.usage.output_tokens, Some(42));
		assert_eq!(out.usage.cache_read_tokens, Some(10));
		assert_eq!(out.model.as_deref(), Some("claude-3-5-sonnet-20241022"));
	}

	#[test]
	fn merges_usage_across_stream() {
		let body = concat!(
			"event: message_start\n",
			"data: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-3-5-sonnet-20241022\",\"usage\":{\"input_tokens\":137,\"output_tokens\":1}}}\n\n",
			"event: content_block_delta\n",
			"data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi\"}}\n\n",
			"event: message_delta\n",
			"data: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":42}}\n\n",
			"event: message_stop\n",
			"data: {\"type\":\"message_stop\"}\n\n",
		);
		let out = Provider.parse_usage(body.as_bytes(), true);
		assert_eq!(out.usage.input_tokens, Some(137));
		assert_eq!(out.usage.output_tokens, Some(42));
		assert_eq!(out.model.as_deref(), Some("claude-3-5-sonnet-20241022"));
	}

	#[test]
	fn frame_priorities() {
		let mk = |event: &str, data: &str| SseFrame {
			event: Some(event.to_string()),
			data: data.to_string(),
		};
		let hi = Provider.classify_frame(&mk("message_start", "{}")).unwrap();
		assert_eq!(hi.priority, Priority::High);
		let mid = Provider
			.classify_frame(&mk("content_block_start", "{}"))
			.unwrap();
		assert_eq!(mid.priority, Priority::Medium);
		let low = Provider
			.classify_frame(&mk("content_block_delta", "{}"))
			.unwrap();
		assert_eq!(low.priority, Priority::Low);
		assert!(Provider.classify_frame(&mk("ping", "{}")).is_none());
	}
}
