//! Pricing rules and the cost calculator.
//!
//! Rules live in the store (user-editable) and are mirrored here so the
//! data plane never touches SQLite. Lookup is longest-pattern-wins glob
//! match, tie-broken by the most recent effective date. A bare `%` pattern
//! is the provider-wide fallback; costs computed from one are tagged
//! `estimated` rather than `exact`.

use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{CostSource, Provider, Usage};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingEntry {
	pub provider: Provider,
	/// Glob over model names; `%` matches any run of characters.
	pub pattern: String,
	pub input_per_1k: f64,
	pub output_per_1k: f64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_creation_per_1k: Option<f64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub cache_read_per_1k: Option<f64>,
	pub effective_date: NaiveDate,
}

pub struct PricingTable {
	entries: RwLock<Vec<PricingEntry>>,
}

impl PricingTable {
	pub fn new(entries: Vec<PricingEntry>) -> PricingTable {
		PricingTable {
			entries: RwLock::new(entries),
		}
	}

	pub fn seeded() -> PricingTable {
		PricingTable::new(seed_entries())
	}

	pub fn entries(&self) -> Vec<PricingEntry> {
		self.entries.read().clone()
	}

	pub fn replace(&self, entries: Vec<PricingEntry>) {
		*self.entries.write() = entries;
	}

	/// Most-specific match: longest literal pattern, then newest effective date.
	pub fn lookup(&self, provider: Provider, model: &str) -> Option<PricingEntry> {
		let entries = self.entries.read();
		entries
			.iter()
			.filter(|e| e.provider == provider && glob_match(&e.pattern, model))
			.max_by_key(|e| (literal_len(&e.pattern), e.effective_date))
			.cloned()
	}

	/// Total cost across the four token classes, skipping classes the matched
	/// row has no rate for. `None` when no rule matched or usage is absent.
	pub fn cost(
		&self,
		provider: Provider,
		model: Option<&str>,
		usage: &Usage,
	) -> Option<(f64, CostSource)> {
		if usage.is_empty() {
			return None;
		}
		let entry = self.lookup(provider, model?)?;
		let mut total = 0.0;
		if let Some(tokens) = usage.input_tokens {
			total += tokens as f64 * entry.input_per_1k / 1000.0;
		}
		if let Some(tokens) = usage.output_tokens {
			total += tokens as f64 * entry.output_per_1k / 1000.0;
		}
		if let (Some(tokens), Some(rate)) = (usage.cache_creation_tokens, entry.cache_creation_per_1k) {
			total += tokens as f64 * rate / 1000.0;
		}
		if let (Some(tokens), Some(rate)) = (usage.cache_read_tokens, entry.cache_read_per_1k) {
			total += tokens as f64 * rate / 1000.0;
		}
		let source = if entry.pattern == "%" {
			CostSource::Estimated
		} else {
			CostSource::Exact
		};
		Some((total, source))
	}
}

/// `%` matches any run of characters; everything else is literal.
fn glob_match(pattern: &str, value: &str) -> bool {
	let segments: Vec<&str> = pattern.split('%').collect();
	if segments.len() == 1 {
		return pattern == value;
	}
	let mut rest = value;
	for (i, seg) in segments.iter().enumerate() {
		if seg.is_empty() {
			continue;
		}
		if i == 0 {
			match rest.strip_prefix(seg) {
				Some(r) => rest = r,
				None => return false,
			}
		} else if i == segments.len() - 1 {
			return rest.ends_with(seg);
		} else {
			match rest.find(seg) {
				Some(pos) => rest = &rest[pos + seg.len()..],
				None => return false,
			}
		}
	}
	true
}

fn literal_len(pattern: &str) -> usize {
	pattern.chars().filter(|c| *c != '%').count()
}

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
	NaiveDate::from_ymd_opt(y, m, day).expect("valid seed date")
}

fn entry(
	provider: Provider,
	pattern: &str,
	input: f64,
	output: f64,
	cache_creation: Option<f64>,
	cache_read: Option<f64>,
	date: NaiveDate,
) -> PricingEntry {
	PricingEntry {
		provider,
		pattern: pattern.to_string(),
		input_per_1k: input,
		output_per_1k: output,
		cache_creation_per_1k: cache_creation,
		cache_read_per_1k: cache_read,
		effective_date: date,
	}
}

/// Published per-1k rates; the `%` rows are provider-wide estimates.
pub fn seed_entries() -> Vec<PricingEntry> {
	use Provider::*;
	vec![
		entry(
			Anthropic,
			"claude-3-5-sonnet%",
			0.003,
			0.015,
			Some(0.00375),
			Some(0.0003),
			d(2024, 10, 22),
		),
		entry(
			Anthropic,
			"claude-3-5-haiku%",
			0.0008,
			0.004,
			Some(0.001),
			Some(0.00008),
			d(2024, 11, 4),
		),
		entry(
			Anthropic,
			"claude-3-opus%",
			0.015,
			0.075,
			Some(0.01875),
			Some(0.0015),
			d(2024, 3, 4),
		),
		entry(
			Anthropic,
			"claude-sonnet-4%",
			0.003,
			0.015,
			Some(0.00375),
			Some(0.0003),
			d(2025, 5, 22),
		),
		entry(
			Anthropic,
			"claude-opus-4%",
			0.015,
			0.075,
			Some(0.01875),
			Some(0.0015),
			d(2025, 5, 22),
		),
		entry(Anthropic, "%", 0.003, 0.015, None, None, d(2024, 1, 1)),
		entry(
			Openai,
			"gpt-4o-mini%",
			0.00015,
			0.0006,
			None,
			Some(0.000075),
			d(2024, 7, 18),
		),
		entry(
			Openai,
			"gpt-4o%",
			0.0025,
			0.01,
			None,
			Some(0.00125),
			d(2024, 10, 1),
		),
		entry(
			Openai,
			"gpt-4.1%",
			0.002,
			0.008,
			None,
			Some(0.0005),
			d(2025, 4, 14),
		),
		entry(Openai, "%", 0.0025, 0.01, None, None, d(2024, 1, 1)),
		entry(
			Bedrock,
			"anthropic.claude%",
			0.003,
			0.015,
			Some(0.00375),
			Some(0.0003),
			d(2024, 10, 22),
		),
		entry(Bedrock, "%", 0.003, 0.015, None, None, d(2024, 1, 1)),
		entry(
			Gemini,
			"gemini-2.0-flash%",
			0.0001,
			0.0004,
			None,
			Some(0.000025),
			d(2025, 2, 5),
		),
		entry(
			Gemini,
			"gemini-1.5-pro%",
			0.00125,
			0.005,
			None,
			Some(0.0003125),
			d(2024, 10, 1),
		),
		entry(Gemini, "%", 0.0005, 0.0015, None, None, d(2024, 1, 1)),
	]
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn longest_pattern_wins() {
		let table = PricingTable::new(vec![
			entry(Provider::Anthropic, "claude-%", 1.0, 1.0, None, None, d(2024, 1, 1)),
			entry(
				Provider::Anthropic,
				"claude-3-5-sonnet%",
				0.003,
				0.015,
				None,
				None,
				d(2024, 10, 22),
			),
		]);
		let hit = table
			.lookup(Provider::Anthropic, "claude-3-5-sonnet-20241022")
			.unwrap();
		assert_eq!(hit.pattern, "claude-3-5-sonnet%");
	}

	#[test]
	fn newer_effective_date_breaks_ties() {
		let table = PricingTable::new(vec![
			entry(Provider::Openai, "gpt-4o%", 9.0, 9.0, None, None, d(2024, 5, 1)),
			entry(Provider::Openai, "gpt-4o%", 0.0025, 0.01, None, None, d(2024, 10, 1)),
		]);
		let hit = table.lookup(Provider::Openai, "gpt-4o-2024-11-20").unwrap();
		assert_eq!(hit.input_per_1k, 0.0025);
	}

	#[test]
	fn exact_cost_is_token_weighted_sum() {
		let table = PricingTable::seeded();
		let usage = Usage {
			input_tokens: Some(137),
			output_tokens: Some(42),
			..Default::default()
		};
		let (cost, source) = table
			.cost(
				Provider::Anthropic,
				Some("claude-3-5-sonnet-20241022"),
				&usage,
			)
			.unwrap();
		let expected = 137.0 * 0.003 / 1000.0 + 42.0 * 0.015 / 1000.0;
		assert!((cost - expected).abs() < 1e-12);
		assert_eq!(source, CostSource::Exact);
	}

	#[test]
	fn classes_without_rates_are_skipped() {
		let table = PricingTable::new(vec![entry(
			Provider::Openai,
			"gpt-4o%",
			0.0025,
			0.01,
			None,
			None,
			d(2024, 10, 1),
		)]);
		let usage = Usage {
			input_tokens: Some(1000),
			output_tokens: Some(1000),
			cache_read_tokens: Some(1_000_000),
			..Default::default()
		};
		let (cost, _) = table.cost(Provider::Openai, Some("gpt-4o"), &usage).unwrap();
		assert!((cost - (0.0025 + 0.01)).abs() < 1e-12);
	}

	#[test]
	fn wildcard_match_is_estimated() {
		let table = PricingTable::seeded();
		let usage = Usage {
			input_tokens: Some(10),
			output_tokens: Some(10),
			..Default::default()
		};
		let (_, source) = table
			.cost(Provider::Anthropic, Some("claude-9-experimental"), &usage)
			.unwrap();
		assert_eq!(source, CostSource::Estimated);
	}

	#[test]
	fn no_match_or_no_usage_is_none() {
		let table = PricingTable::new(vec![]);
		let usage = Usage {
			input_tokens: Some(10),
			..Default::default()
		};
		assert!(table.cost(Provider::Openai, Some("gpt-4o"), &usage).is_none());

		let table = PricingTable::seeded();
		assert!(
			table
				.cost(Provider::Openai, Some("gpt-4o"), &Usage::default())
				.is_none()
		);
		assert!(table.cost(Provider::Openai, None, &usage).is_none());
	}

	#[rstest::rstest]
	#[case("claude-%", "claude-3", true)]
	#[case("%", "anything", true)]
	#[case("gpt-4o", "gpt-4o", true)]
	#[case("gpt-4o", "gpt-4o-mini", false)]
	#[case("%sonnet%", "claude-3-5-sonnet-20241022", true)]
	#[case("claude-%", "gpt-4o", false)]
	fn glob_match_shapes(#[case] pattern: &str, #[case] model: &str, #[case] expected: bool) {
		assert_eq!(glob_match(pattern, model), expected);
	}
}
