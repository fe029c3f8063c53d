use serde_json::Value;

use super::{
	ParsedEvent, ProviderParser, UsageExtract, first_str_at_paths, first_u64_at_paths, host_on_domain,
	json_payload, sse_usage,
};
use crate::parse::sse::SseFrame;
use crate::types::{Priority, Provider as ProviderTag, Usage};

pub const DEFAULT_HOST: &str = "api.openai.com";

pub struct Provider;

impl ProviderParser for Provider {
	fn name(&self) -> ProviderTag {
		ProviderTag::Openai
	}

	fn matches(&self, host: &str) -> bool {
		host_on_domain(host, "openai.com")
	}

	fn parse_usage(&self, body: &[u8], is_sse: bool) -> UsageExtract {
		if is_sse {
			// Usage arrives in the final chunk, and only when the client set
			// stream_options.include_usage.
			return sse_usage(body, extract);
		}
		match serde_json::from_slice::<Value>(body) {
			Ok(json) => extract(&json),
			Err(_) => UsageExtract::default(),
		}
	}

	fn classify_frame(&self, frame: &SseFrame) -> Option<ParsedEvent> {
		if frame.data == "[DONE]" {
			return Some(ParsedEvent {
				event_type: "done".to_string(),
				payload: Value::Null,
				priority: Priority::High,
			});
		}
		let payload = json_payload(frame);
		let (event_type, priority) = if payload.get("usage").is_some_and(|u| !u.is_null()) {
			("usage".to_string(), Priority::High)
		} else if payload
			.get("choices")
			.and_then(|c| c.get(0))
			.and_then(|c| c.get("finish_reason"))
			.is_some_and(|f| !f.is_null())
		{
			("finish".to_string(), Priority::Medium)
		} else {
			("delta".to_string(), Priority::Low)
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
			input_tokens: first_u64_at_paths(json, &[&["usage", "prompt_tokens"]]),
			output_tokens: first_u64_at_paths(json, &[&["usage", "completion_tokens"]]),
			cache_creation_tokens: None,
			cache_read_tokens: first_u64_at_paths(
				json,
				&[&["usage", "prompt_tokens_details", "cached_tokens"]],
			),
		},
		model: first_str_at_paths(json, &[&["model"]]),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_completion_usage() {
		let body = br#"{"model":"gpt-4o-2024-08-06","usage":{"prompt_tokens":9,"completion_tokens":12,"total_tokens":21}}"#;
		let out = Provider.parse_usage(body, false);
		assert_eq!(out.usage.input_tokens, Some(9));
		assert_eq!(out.usage.output_tokens, Some(12));
		assert_eq!(out.model.as_deref(), Some("gpt-4o-2024-08-06"));
	}

	#[test]
	fn stream_usage_in_final_chunk() {
		let body = concat!(
			"data: {\"choices\":[{\"delta\":{\"content\":\"a\"},\"finish_reason\":null}],\"usage\":null}\n\n",
			"data: {\"choices\":[],\"model\":\"gpt-4o\",\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":7}}\n\n",
			"data: [DONE]\n\n",
		);
		let out = Provider.parse_usage(body.as_bytes(), true);
		assert_eq!(out.usage.input_tokens, Some(5));
		assert_eq!(out.usage.output_tokens, Some(7));
		assert_eq!(out.model.as_deref(), Some("gpt-4o"));
	}

	#[test]
	fn done_marker_is_high() {
		let frame = SseFrame {
			event: None,
			data: "[DONE]".to_string(),
		};
		let ev = Provider.classify_frame(&frame).unwrap();
		assert_eq!(ev.event_type, "done");
		assert_eq!(ev.priority, Priority::High);
	}

	#[test]
	fn delta_chunks_are_low() {
		let frame = SseFrame {
			event: None,
			data: r#"{"choices":[{"delta":{"content":"x"},"finish_reason":null}]}"#.to_string(),
		};
		let ev = Provider.classify_frame(&frame).unwrap();
		assert_eq!(ev.event_type, "delta");
		assert_eq!(ev.priority, Priority::Low);
	}
}
