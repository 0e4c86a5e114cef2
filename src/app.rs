use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::classify::{AnthropicBackend, BatchStatus, RelevanceClassifier, ScoreBackend};
use crate::config::PipelineConfig;
use crate::dedup::Deduplicator;
use crate::dispatch::QueryDispatcher;
use crate::domain::{FetchFailure, SearchRequest, Source, TrialRecord};
use crate::error::TrialScopeError;
use crate::normalize::normalize_batch;
use crate::registry::{RegistryClient, build_clients};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Per-source fetch accounting: every selected source gets exactly one entry
/// in the final report, success or failure.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: Source,
    pub fetched: usize,
    pub normalized: usize,
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FetchFailure>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassifierOutcome {
    pub invoked: bool,
    pub batches: Vec<BatchStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchReport {
    pub query: String,
    pub sources: Vec<SourceStatus>,
    pub duplicates_merged: usize,
    pub classifier: ClassifierOutcome,
    pub records: Vec<TrialRecord>,
}

pub struct App {
    config: PipelineConfig,
}

impl App {
    pub fn new(config: PipelineConfig) -> Result<Self, TrialScopeError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Runs the full pipeline against the live sources. Request validation
    /// happens before any client is constructed, so a bad request never
    /// touches the network.
    pub fn search(
        &self,
        request: &SearchRequest,
        sink: &dyn ProgressSink,
    ) -> Result<SearchReport, TrialScopeError> {
        request.validate()?;
        let clients = build_clients(&request.ordered_sources(), self.config.source_timeout())?;
        let backend: Option<Box<dyn ScoreBackend>> = match request.api_key.as_deref() {
            Some(key) => Some(Box::new(AnthropicBackend::new(
                key,
                self.config.classifier.model.clone(),
                self.config.batch_timeout(),
            )?)),
            None => None,
        };
        self.search_with(&clients, backend, request, sink)
    }

    /// Pipeline core with injectable sources and scorer.
    pub fn search_with(
        &self,
        clients: &[Arc<dyn RegistryClient>],
        backend: Option<Box<dyn ScoreBackend>>,
        request: &SearchRequest,
        sink: &dyn ProgressSink,
    ) -> Result<SearchReport, TrialScopeError> {
        request.validate()?;
        let started = Instant::now();

        sink.event(ProgressEvent {
            message: format!("phase=Fetch; querying {} sources", clients.len()),
            elapsed: None,
        });
        let dispatcher = QueryDispatcher::new(self.config.global_timeout());
        let mut outcomes = dispatcher.dispatch(clients, &request.query, request.max_results);

        sink.event(ProgressEvent {
            message: "phase=Normalize; mapping raw entries".to_string(),
            elapsed: Some(started.elapsed()),
        });
        let mut sources = Vec::with_capacity(clients.len());
        let mut records = Vec::new();
        // Client order is the priority order; record order before dedup is
        // source-major and within a source follows the source's own ranking.
        for client in clients {
            let source = client.source();
            match outcomes.remove(&source) {
                Some(Ok(raws)) => {
                    let batch = normalize_batch(client.as_ref(), &raws);
                    sources.push(SourceStatus {
                        source,
                        fetched: raws.len(),
                        normalized: batch.records.len(),
                        skipped: batch.skipped,
                        failure: None,
                    });
                    records.extend(batch.records);
                }
                Some(Err(failure)) => sources.push(SourceStatus {
                    source,
                    fetched: 0,
                    normalized: 0,
                    skipped: 0,
                    failure: Some(failure),
                }),
                None => sources.push(SourceStatus {
                    source,
                    fetched: 0,
                    normalized: 0,
                    skipped: 0,
                    failure: Some(FetchFailure::Timeout),
                }),
            }
        }

        sink.event(ProgressEvent {
            message: format!("phase=Dedup; {} records in", records.len()),
            elapsed: Some(started.elapsed()),
        });
        let before = records.len();
        let deduplicator = Deduplicator::new(self.config.dedup.title_similarity);
        let mut records = deduplicator.deduplicate(records);
        let duplicates_merged = before - records.len();

        let classifier = match backend {
            Some(backend) => RelevanceClassifier::new(
                Some(backend),
                self.config.classifier.thresholds.clone(),
                self.config.classifier.batch_size,
            ),
            None => RelevanceClassifier::disabled(),
        };
        let invoked = classifier.is_enabled();
        sink.event(ProgressEvent {
            message: if invoked {
                format!("phase=Classify; scoring {} records", records.len())
            } else {
                "phase=Classify; skipped (no credential)".to_string()
            },
            elapsed: Some(started.elapsed()),
        });
        let batches = classifier.classify(&mut records, &request.query);

        // Scored records first, highest score first. The sort is stable, so
        // unscored records keep their pre-classification order at the tail.
        records.sort_by(|a, b| match (a.relevance, b.relevance) {
            (Some(x), Some(y)) => y.score.cmp(&x.score),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });

        sink.event(ProgressEvent {
            message: format!("phase=Done; {} records out", records.len()),
            elapsed: Some(started.elapsed()),
        });
        Ok(SearchReport {
            query: request.query.clone(),
            sources,
            duplicates_merged,
            classifier: ClassifierOutcome { invoked, batches },
            records,
        })
    }
}

