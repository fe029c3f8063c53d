use serde_json::Value;

use super::{
	ParsedEvent, ProviderParser, UsageExtract, first_label, first_str_at_paths, first_u64_at_paths,
	host_on_domain, json_payload, sse_usage,
};
use crate::parse::sse::SseFrame;
use crate::types::{Priority, Provider as ProviderTag, Usage};

pub struct Provider;

impl ProviderParser for Provider {
	fn name(&self) -> ProviderTag {
		ProviderTag::Bedrock
	}

	fn matches(&self, host: &str) -> bool {
		// bedrock-runtime.<region>.amazonaws.com; lookalike prefixes and
		// suffix domains must not match.
		host_on_domain(host, "amazonaws.com") && first_label(host) == "bedrock-runtime"
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
		let payload = json_payload(frame);
		let event_type = frame
			.event
			.clone()
			.or_else(|| first_str_at_paths(&payload, &[&["type"]]))
			.unwrap_or_else(|| "chunk".to_string());
		let priority = match event_type.as_str() {
			"messageStart" | "messageStop" | "metadata" | "message_start" | "message_delta"
			| "message_stop" => Priority::High,
			"contentBlockStart" | "contentBlockStop" | "content_block_start" | "content_block_stop" => {
				Priority::Medium
			},
			_ if payload.get("usage").is_some() => Priority::High,
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
			// Converse, InvokeModel, and Claude-passthrough shapes in that order.
			input_tokens: first_u64_at_paths(
				json,
				&[
					&["usage", "inputTokens"],
					&["inputTokenCount"],
					&["usage", "input_tokens"],
					&["message", "usage", "input_tokens"],
				],
			),
			output_tokens: first_u64_at_paths(
				json,
				&[
					&["usage", "outputTokens"],
					&["outputTokenCount"],
					&["usage", "output_tokens"],
					&["message", "usage", "output_tokens"],
				],
			),
			cache_creation_tokens: first_u64_at_paths(
				json,
				&[
					&["usage", "cacheWriteInputTokens"],
					&["usage", "cache_creation_input_tokens"],
				],
			),
			cache_read_tokens: first_u64_at_paths(
				json,
				&[
					&["usage", "cacheReadInputTokens"],
					&["usage", "cache_read_input_tokens"],
				],
			),
		},
		model: first_str_at_paths(json, &[&["model"], &["modelId"], &["message", "model"]]),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn converse_usage() {
		let body = br#"{"usage":{"inputTokens":120,"outputTokens":33},"stopReason":"end_turn"}"#;
		let out = Provider.parse_usage(body, false);
		assert_eq!(out.usage.input_tokens, Some(120));
		assert_eq!(out.usage.output_tokens, Some(33));
	}

	#[test]
	fn invoke_model_usage() {
		let body = br#"{"inputTokenCount":11,"outputTokenCount":7,"results":[]}"#;
		let out = Provider.parse_usage(body, false);
		assert_eq!(out.usage.input_tokens, Some(11));
		assert_eq!(out.usage.output_tokens, Some(7));
	}

	#[test]
	fn claude_passthrough_usage() {
		let body =
			br#"{"model":"anthropic.claude-3-sonnet","usage":{"input_tokens":5,"output_tokens":9}}"#;
		let out = Provider.parse_usage(body, false);
		assert_eq!(out.usage.input_tokens, Some(5));
		assert_eq!(out.usage.output_tokens, Some(9));
		assert_eq!(out.model.as_deref(), Some("anthropic.claude-3-sonnet"));
	}

	#[test]
	fn host_matching_is_strict() {
		assert!(Provider.matches("bedrock-runtime.us-east-1.amazonaws.com"));
		assert!(Provider.matches("bedrock-runtime.eu-west-2.amazonaws.com:443"));
		assert!(!Provider.matches("bedrock-runtime.us-east-1.notamazonaws.com"));
		assert!(!Provider.matches("fake-bedrock-runtime.us-east-1.amazonaws.com"));
		assert!(!Provider.matches("bedrock-runtime.us-east-1.amazonaws.com.evil.com"));
		assert!(!Provider.matches("s3.us-east-1.amazonaws.com"));
	}
}
