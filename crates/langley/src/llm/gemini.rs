use serde_json::Value;

use super::{
	ParsedEvent, ProviderParser, UsageExtract, first_label, first_str_at_paths, first_u64_at_paths,
	host_on_domain, json_payload, sse_usage,
};
use crate::parse::sse::SseFrame;
use crate::types::{Priority, Provider as ProviderTag, Usage};

pub const DEFAULT_HOST: &str = "generativelanguage.googleapis.com";

pub struct Provider;

impl ProviderParser for Provider {
	fn name(&self) -> ProviderTag {
		ProviderTag::Gemini
	}

	fn matches(&self, host: &str) -> bool {
		host_on_domain(host, "googleapis.com") && first_label(host) == "generativelanguage"
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
		let (event_type, priority) = if payload.get("usageMetadata").is_some() {
			("usage".to_string(), Priority::High)
		} else if payload
			.get("candidates")
			.and_then(|c| c.get(0))
			.and_then(|c| c.get("finishReason"))
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
			input_tokens: first_u64_at_paths(json, &[&["usageMetadata", "promptTokenCount"]]),
			output_tokens: first_u64_at_paths(json, &[&["usageMetadata", "candidatesTokenCount"]]),
			cache_creation_tokens: None,
			cache_read_tokens: first_u64_at_paths(json, &[&["usageMetadata", "cachedContentTokenCount"]]),
		},
		model: first_str_at_paths(json, &[&["modelVersion"], &["model"]]),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_usage_metadata() {
		let body = br#"{"modelVersion":"gemini-2.0-flash","usageMetadata":{"promptTokenCount":14,"candidatesTokenCount":28}}"#;
		let out = Provider.parse_usage(body, false);
		assert_eq!(out.usage.input_tokens, Some(14));
		assert_eq!(out.usage.output_tokens, Some(28));
		assert_eq!(out.model.as_deref(), Some("gemini-2.0-flash"));
	}

	#[test]
	fn only_generativelanguage_hosts_match() {
		assert!(Provider.matches("generativelanguage.googleapis.com"));
		assert!(!Provider.matches("storage.googleapis.com"));
		assert!(!Provider.matches("generativelanguage.googleapis.com.evil.com"));
		assert!(!Provider.matches("fake-generativelanguage.googleapis.com"));
	}

	#[test]
	fn usage_frames_are_high() {
		let frame = SseFrame {
			event: None,
			data: r#"{"usageMetadata":{"promptTokenCount":1,"candidatesTokenCount":2}}"#.to_string(),
		};
		let ev = Provider.classify_frame(&frame).unwrap();
		assert_eq!(ev.event_type, "usage");
		assert_eq!(ev.priority, Priority::High);
	}
}
