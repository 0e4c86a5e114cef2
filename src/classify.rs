use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::LabelThresholds;
use crate::domain::{Relevance, RelevanceLabel, TrialRecord};
use crate::error::TrialScopeError;

const ANTHROPIC_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const SUMMARY_LIMIT: usize = 500;

/// What one record contributes to a scoring prompt.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub title: String,
    pub summary: String,
    pub conditions: String,
}

impl BatchEntry {
    pub fn from_record(record: &TrialRecord) -> Self {
        let mut summary = record.summary.clone().unwrap_or_default();
        // Bound the prompt contribution per record, as the scorer request
        // size is the batch bound we care about. The cut must land on a
        // char boundary; abstracts routinely carry multibyte text.
        if summary.len() > SUMMARY_LIMIT {
            let cut = summary
                .char_indices()
                .map(|(index, _)| index)
                .take_while(|&index| index <= SUMMARY_LIMIT)
                .last()
                .unwrap_or(0);
            summary.truncate(cut);
        }
        Self {
            title: record.title.clone(),
            summary,
            conditions: record.structured.conditions.join(", "),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchScore {
    pub score: u8,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifyFailure {
    MissingCredential,
    Http { status: u16 },
    Network { detail: String },
    Malformed { detail: String },
}

impl fmt::Display for ClassifyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifyFailure::MissingCredential => write!(f, "missing credential"),
            ClassifyFailure::Http { status } => write!(f, "http status {status}"),
            ClassifyFailure::Network { detail } => write!(f, "network error: {detail}"),
            ClassifyFailure::Malformed { detail } => write!(f, "malformed response: {detail}"),
        }
    }
}

/// External scoring capability, substitutable with a deterministic stub in
/// tests.
pub trait ScoreBackend: Send + Sync {
    fn score_batch(
        &self,
        entries: &[BatchEntry],
        query: &str,
    ) -> Result<Vec<BatchScore>, ClassifyFailure>;
}

/// Anthropic Messages API backend: one prompt per batch, strict JSON array
/// reply located in the completion text.
pub struct AnthropicBackend {
    client: Client,
    model: String,
    base_url: String,
}

impl AnthropicBackend {
    pub fn new(
        api_key: &str,
        model: String,
        timeout: Duration,
    ) -> Result<Self, TrialScopeError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(api_key.trim())
                .map_err(|err| TrialScopeError::HttpClient(err.to_string()))?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| TrialScopeError::HttpClient(err.to_string()))?;
        Ok(Self {
            client,
            model,
            base_url: ANTHROPIC_BASE.to_string(),
        })
    }

    fn build_prompt(entries: &[BatchEntry], query: &str) -> String {
        let mut prompt = format!(
            "Rate the relevance of each clinical study below to the query \"{query}\".\n\
             Reply with only a JSON array, one object per study in order:\n\
             [{{\"index\": 1, \"relevance_score\": 0-100, \"confidence\": 0-100}}, ...]\n\n"
        );
        for (position, entry) in entries.iter().enumerate() {
            prompt.push_str(&format!(
                "Study {}:\nTitle: {}\nConditions: {}\nAbstract: {}\n\n",
                position + 1,
                entry.title,
                entry.conditions,
                entry.summary
            ));
        }
        prompt
    }
}

impl ScoreBackend for AnthropicBackend {
    fn score_batch(
        &self,
        entries: &[BatchEntry],
        query: &str,
    ) -> Result<Vec<BatchScore>, ClassifyFailure> {
        let body = json!({
            "model": self.model,
            "max_tokens": 1024,
            "messages": [{ "role": "user", "content": Self::build_prompt(entries, query) }]
        });
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .json(&body)
            .send()
            .map_err(|err| ClassifyFailure::Network {
                detail: err.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ClassifyFailure::Http {
                status: response.status().as_u16(),
            });
        }
        let payload: Value = response.json().map_err(|err| ClassifyFailure::Malformed {
            detail: err.to_string(),
        })?;
        let text = payload
            .get("content")
            .and_then(|v| v.as_array())
            .and_then(|blocks| blocks.first())
            .and_then(|block| block.get("text"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ClassifyFailure::Malformed {
                detail: "missing content text".to_string(),
            })?;
        extract_scores(text, entries.len())
    }
}

fn json_array_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\[.*\]").unwrap())
}

/// Pulls the JSON array out of the completion text and maps it onto batch
/// positions. Any mismatch fails the whole batch; partial scoring of a batch
/// is not a thing.
pub fn extract_scores(text: &str, expected: usize) -> Result<Vec<BatchScore>, ClassifyFailure> {
    let matched = json_array_regex()
        .find(text)
        .ok_or_else(|| ClassifyFailure::Malformed {
            detail: "no JSON array in completion".to_string(),
        })?;
    let parsed: Vec<Value> =
        serde_json::from_str(matched.as_str()).map_err(|err| ClassifyFailure::Malformed {
            detail: err.to_string(),
        })?;
    if parsed.len() != expected {
        return Err(ClassifyFailure::Malformed {
            detail: format!("expected {expected} scores, got {}", parsed.len()),
        });
    }

    let mut scores = vec![None; expected];
    for (position, item) in parsed.iter().enumerate() {
        let score = item
            .get("relevance_score")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| ClassifyFailure::Malformed {
                detail: "missing relevance_score".to_string(),
            })?;
        let confidence = item
            .get("confidence")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| ClassifyFailure::Malformed {
                detail: "missing confidence".to_string(),
            })?;
        let slot = item
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|index| index as usize)
            .and_then(|index| index.checked_sub(1))
            .filter(|&index| index < expected)
            .unwrap_or(position);
        scores[slot] = Some(BatchScore {
            score: score.clamp(0.0, 100.0).round() as u8,
            confidence: normalize_confidence(confidence),
        });
    }
    scores
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| ClassifyFailure::Malformed {
            detail: "duplicate or missing index in scores".to_string(),
        })
}

/// Scorers answer on a 0-100 or 0-1 scale; either way the record carries
/// 0.0-1.0.
pub fn normalize_confidence(value: f64) -> f64 {
    let scaled = if value > 1.0 { value / 100.0 } else { value };
    scaled.clamp(0.0, 1.0)
}

/// Deterministic, monotonic score-to-label mapping.
pub fn label_for(score: u8, thresholds: &LabelThresholds) -> RelevanceLabel {
    if score >= thresholds.highly {
        RelevanceLabel::HighlyRelevant
    } else if score >= thresholds.relevant {
        RelevanceLabel::Relevant
    } else if score >= thresholds.less {
        RelevanceLabel::LessRelevant
    } else {
        RelevanceLabel::NotRelevant
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchState {
    Scored,
    Failed { reason: ClassifyFailure },
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatus {
    pub batch: usize,
    pub records: usize,
    #[serde(flatten)]
    pub state: BatchState,
}

/// Optional relevance stage. Without a backend it is an explicit no-op; with
/// one, records flow through in fixed-size batches and a failed batch
/// degrades only its own records to unscored.
pub struct RelevanceClassifier {
    backend: Option<Box<dyn ScoreBackend>>,
    thresholds: LabelThresholds,
    batch_size: usize,
}

impl RelevanceClassifier {
    pub fn new(
        backend: Option<Box<dyn ScoreBackend>>,
        thresholds: LabelThresholds,
        batch_size: usize,
    ) -> Self {
        Self {
            backend,
            thresholds,
            batch_size: batch_size.max(1),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, LabelThresholds::default(), 1)
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn classify(&self, records: &mut [TrialRecord], query: &str) -> Vec<BatchStatus> {
        let Some(backend) = self.backend.as_deref() else {
            return Vec::new();
        };

        let mut statuses = Vec::new();
        for (batch_index, chunk) in records.chunks_mut(self.batch_size).enumerate() {
            let entries: Vec<BatchEntry> = chunk.iter().map(BatchEntry::from_record).collect();
            match backend.score_batch(&entries, query) {
                Ok(scores) => {
                    for (record, score) in chunk.iter_mut().zip(scores) {
                        record.relevance = Some(Relevance {
                            score: score.score,
                            label: label_for(score.score, &self.thresholds),
                            confidence: score.confidence,
                        });
                    }
                    debug!(batch = batch_index, records = chunk.len(), "batch scored");
                    statuses.push(BatchStatus {
                        batch: batch_index,
                        records: chunk.len(),
                        state: BatchState::Scored,
                    });
                }
                Err(reason) => {
                    warn!(batch = batch_index, %reason, "batch scoring failed");
                    statuses.push(BatchStatus {
                        batch: batch_index,
                        records: chunk.len(),
                        state: BatchState::Failed { reason },
                    });
                }
            }
        }
        statuses
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::Source;

    fn record(title: &str) -> TrialRecord {
        TrialRecord::new(
            title.to_string(),
            title.to_string(),
            Source::ClinicalTrialsGov,
            "https://example.org".to_string(),
        )
    }

    struct StubBackend;

    impl ScoreBackend for StubBackend {
        fn score_batch(
            &self,
            entries: &[BatchEntry],
            _query: &str,
        ) -> Result<Vec<BatchScore>, ClassifyFailure> {
            Ok(entries
                .iter()
                .enumerate()
                .map(|(index, _)| BatchScore {
                    score: (index * 30) as u8,
                    confidence: 0.9,
                })
                .collect())
        }
    }

    struct FailingBackend;

    impl ScoreBackend for FailingBackend {
        fn score_batch(
            &self,
            _entries: &[BatchEntry],
            _query: &str,
        ) -> Result<Vec<BatchScore>, ClassifyFailure> {
            Err(ClassifyFailure::Http { status: 401 })
        }
    }

    #[test]
    fn label_mapping_is_monotonic() {
        let thresholds = LabelThresholds::default();
        let mut previous = label_for(0, &thresholds);
        for score in 1..=100u8 {
            let label = label_for(score, &thresholds);
            assert!(label >= previous, "label regressed at score {score}");
            previous = label;
        }
        assert_eq!(label_for(80, &thresholds), RelevanceLabel::HighlyRelevant);
        assert_eq!(label_for(79, &thresholds), RelevanceLabel::Relevant);
        assert_eq!(label_for(20, &thresholds), RelevanceLabel::LessRelevant);
        assert_eq!(label_for(19, &thresholds), RelevanceLabel::NotRelevant);
    }

    #[test]
    fn classify_without_backend_is_noop() {
        let classifier = RelevanceClassifier::disabled();
        let mut records = vec![record("a"), record("b")];
        let statuses = classifier.classify(&mut records, "query");
        assert!(statuses.is_empty());
        assert!(records.iter().all(|r| r.relevance.is_none()));
    }

    #[test]
    fn classify_populates_full_relevance_triple() {
        let classifier =
            RelevanceClassifier::new(Some(Box::new(StubBackend)), LabelThresholds::default(), 2);
        let mut records = vec![record("a"), record("b"), record("c")];
        let statuses = classifier.classify(&mut records, "query");

        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.state == BatchState::Scored));
        for record in &records {
            let relevance = record.relevance.unwrap();
            assert_eq!(relevance.label, label_for(relevance.score, &LabelThresholds::default()));
            assert!((0.0..=1.0).contains(&relevance.confidence));
        }
    }

    #[test]
    fn failed_batch_degrades_to_unscored() {
        let classifier = RelevanceClassifier::new(
            Some(Box::new(FailingBackend)),
            LabelThresholds::default(),
            10,
        );
        let mut records = vec![record("a"), record("b")];
        let statuses = classifier.classify(&mut records, "query");

        assert_eq!(statuses.len(), 1);
        assert_matches!(
            &statuses[0].state,
            BatchState::Failed {
                reason: ClassifyFailure::Http { status: 401 }
            }
        );
        assert!(records.iter().all(|r| r.relevance.is_none()));
    }

    #[test]
    fn extract_scores_reads_array_embedded_in_prose() {
        let text = "Here are the ratings:\n\
            [{\"index\": 1, \"relevance_score\": 85, \"confidence\": 90},\n\
             {\"index\": 2, \"relevance_score\": 30, \"confidence\": 0.6}]\n\
            Let me know if you need more detail.";
        let scores = extract_scores(text, 2).unwrap();
        assert_eq!(scores[0], BatchScore { score: 85, confidence: 0.9 });
        assert_eq!(scores[1], BatchScore { score: 30, confidence: 0.6 });
    }

    #[test]
    fn extract_scores_rejects_count_mismatch() {
        let text = "[{\"index\": 1, \"relevance_score\": 85, \"confidence\": 90}]";
        let err = extract_scores(text, 2).unwrap_err();
        assert_matches!(err, ClassifyFailure::Malformed { .. });
    }

    #[test]
    fn extract_scores_rejects_missing_array() {
        let err = extract_scores("no structured reply", 1).unwrap_err();
        assert_matches!(err, ClassifyFailure::Malformed { .. });
    }

    #[test]
    fn summary_truncation_respects_char_boundaries() {
        // An accented char straddling the byte limit must not split.
        let mut spanning = record("multibyte");
        spanning.summary = Some(format!("{}{}", "a".repeat(SUMMARY_LIMIT - 1), "é".repeat(40)));
        let entry = BatchEntry::from_record(&spanning);
        assert!(entry.summary.len() <= SUMMARY_LIMIT);
        assert!(entry.summary.is_char_boundary(entry.summary.len()));

        let mut ascii = record("ascii");
        ascii.summary = Some("b".repeat(SUMMARY_LIMIT + 100));
        let entry = BatchEntry::from_record(&ascii);
        assert_eq!(entry.summary.len(), SUMMARY_LIMIT);

        let mut short = record("short");
        short.summary = Some("unchanged".to_string());
        let entry = BatchEntry::from_record(&short);
        assert_eq!(entry.summary, "unchanged");
    }

    #[test]
    fn confidence_scale_is_normalized() {
        assert_eq!(normalize_confidence(90.0), 0.9);
        assert_eq!(normalize_confidence(0.45), 0.45);
        assert_eq!(normalize_confidence(250.0), 1.0);
        assert_eq!(normalize_confidence(-3.0), 0.0);
    }
}
