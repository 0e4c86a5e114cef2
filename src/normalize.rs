use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::domain::TrialRecord;
use crate::registry::RegistryClient;

#[derive(Debug, Clone, Default)]
pub struct NormalizedBatch {
    pub records: Vec<TrialRecord>,
    /// Malformed entries dropped from an otherwise good response. Counted,
    /// never fatal to the batch.
    pub skipped: usize,
}

/// Runs the client's own schema mapping over every raw entry, counting the
/// ones it rejects so nothing is dropped silently.
pub fn normalize_batch(client: &dyn RegistryClient, raws: &[Value]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for raw in raws {
        match client.normalize(raw) {
            Some(record) => batch.records.push(record),
            None => batch.skipped += 1,
        }
    }
    batch
}

fn tag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").unwrap())
}

fn whitespace_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Strips HTML/markup tags and collapses whitespace. Every free-text field on
/// a canonical record goes through this.
pub fn clean_text(value: &str) -> String {
    let stripped = tag_regex().replace_all(value, " ");
    whitespace_regex()
        .replace_all(&stripped, " ")
        .trim()
        .to_string()
}

/// Cleans a text field, mapping empty results to absent.
pub fn clean_optional(value: Option<&str>) -> Option<String> {
    let cleaned = clean_text(value?);
    (!cleaned.is_empty()).then_some(cleaned)
}
