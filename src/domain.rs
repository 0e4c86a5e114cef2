use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::TrialScopeError;

/// Catalog of supported registries and literature indexes. The declaration
/// order is the source priority order: trial registries before literature
/// indexes, so dedup conflict resolution and dispatch reporting stay stable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[value(name = "ctgov")]
    ClinicalTrialsGov,
    #[value(name = "euctis")]
    EuCtis,
    #[value(name = "pubmed")]
    PubMed,
    #[value(name = "europepmc")]
    EuropePmc,
}

impl Source {
    pub fn id(&self) -> &'static str {
        match self {
            Source::ClinicalTrialsGov => "ctgov",
            Source::EuCtis => "euctis",
            Source::PubMed => "pubmed",
            Source::EuropePmc => "europepmc",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Source::ClinicalTrialsGov => "ClinicalTrials.gov",
            Source::EuCtis => "EU Clinical Trial Information System",
            Source::PubMed => "PubMed",
            Source::EuropePmc => "Europe PMC",
        }
    }

    pub fn is_registry(&self) -> bool {
        matches!(self, Source::ClinicalTrialsGov | Source::EuCtis)
    }

    pub fn all() -> &'static [Source] {
        &[
            Source::ClinicalTrialsGov,
            Source::EuCtis,
            Source::PubMed,
            Source::EuropePmc,
        ]
    }

    pub fn info(&self) -> SourceInfo {
        match self {
            Source::ClinicalTrialsGov => SourceInfo {
                id: "ctgov",
                name: "ClinicalTrials.gov",
                coverage: "United States and global interventional/observational trials",
                approximate_records: 450_000,
                kind: SourceKind::Registry,
            },
            Source::EuCtis => SourceInfo {
                id: "euctis",
                name: "EU Clinical Trial Information System",
                coverage: "European Union and EEA clinical trials",
                approximate_records: 85_000,
                kind: SourceKind::Registry,
            },
            Source::PubMed => SourceInfo {
                id: "pubmed",
                name: "PubMed",
                coverage: "Biomedical literature citations, global",
                approximate_records: 37_000_000,
                kind: SourceKind::Literature,
            },
            Source::EuropePmc => SourceInfo {
                id: "europepmc",
                name: "Europe PMC",
                coverage: "Life-science literature with full abstracts, global",
                approximate_records: 45_000_000,
                kind: SourceKind::Literature,
            },
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

impl FromStr for Source {
    type Err = TrialScopeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "ctgov" | "clinicaltrials" | "clinicaltrials.gov" => Ok(Source::ClinicalTrialsGov),
            "euctis" | "ctis" => Ok(Source::EuCtis),
            "pubmed" => Ok(Source::PubMed),
            "europepmc" | "epmc" => Ok(Source::EuropePmc),
            _ => Err(TrialScopeError::UnknownSource(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Registry,
    Literature,
}

/// Static catalog entry: configuration data about one source, not runtime
/// state.
#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub coverage: &'static str,
    pub approximate_records: u64,
    pub kind: SourceKind,
}

/// Why one source failed. Failures are data at the fetch boundary, never
/// errors that abort the whole request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FetchFailure {
    Timeout,
    Http { status: u16 },
    Malformed { detail: String },
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::Timeout => write!(f, "timeout"),
            FetchFailure::Http { status } => write!(f, "http status {status}"),
            FetchFailure::Malformed { detail } => write!(f, "malformed response: {detail}"),
        }
    }
}

/// Optional attributes a source schema may or may not supply. Absence is
/// valid; fields are never defaulted during normalization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredFields {
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub sponsor: Option<String>,
    #[serde(default)]
    pub interventions: Vec<String>,
    /// Cross-registry identifiers found in the payload (NCT numbers, CTIS
    /// numbers), used for dedup matching.
    #[serde(default)]
    pub registry_ids: Vec<String>,
}

impl StructuredFields {
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
            && self.phase.is_none()
            && self.status.is_none()
            && self.start_date.is_none()
            && self.sponsor.is_none()
            && self.interventions.is_empty()
            && self.registry_ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelevanceLabel {
    NotRelevant,
    LessRelevant,
    Relevant,
    HighlyRelevant,
}

impl RelevanceLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelevanceLabel::HighlyRelevant => "Highly Relevant",
            RelevanceLabel::Relevant => "Relevant",
            RelevanceLabel::LessRelevant => "Less Relevant",
            RelevanceLabel::NotRelevant => "Not Relevant",
        }
    }
}

impl fmt::Display for RelevanceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fully populated or entirely absent on a record; no partial scoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Relevance {
    pub score: u8,
    pub label: RelevanceLabel,
    pub confidence: f64,
}

/// Canonical record shape every source normalizes into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Source-scoped key (NCT id, CTIS number, PMID, Europe PMC id).
    /// Provenance only; dedup matches on extracted registry keys and titles.
    pub identifier: String,
    pub title: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub source: Source,
    #[serde(default)]
    pub merged_sources: BTreeSet<Source>,
    pub url: String,
    #[serde(default)]
    pub structured: StructuredFields,
    #[serde(default)]
    pub relevance: Option<Relevance>,
}

impl TrialRecord {
    pub fn new(identifier: String, title: String, source: Source, url: String) -> Self {
        let mut merged_sources = BTreeSet::new();
        merged_sources.insert(source);
        Self {
            identifier,
            title,
            summary: None,
            source,
            merged_sources,
            url,
            structured: StructuredFields::default(),
            relevance: None,
        }
    }
}

/// One search invocation. Constructed per query, never persisted.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub sources: Vec<Source>,
    pub max_results: usize,
    pub api_key: Option<String>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, sources: Vec<Source>, max_results: usize) -> Self {
        Self {
            query: query.into(),
            sources,
            max_results,
            api_key: None,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }

    /// The only failure class that aborts a request, checked before any
    /// network call.
    pub fn validate(&self) -> Result<(), TrialScopeError> {
        if self.query.trim().is_empty() {
            return Err(TrialScopeError::EmptyQuery);
        }
        if self.sources.is_empty() {
            return Err(TrialScopeError::NoSourcesSelected);
        }
        if self.max_results == 0 {
            return Err(TrialScopeError::InvalidMaxResults(self.max_results));
        }
        Ok(())
    }

    /// Selected sources in catalog priority order, deduplicated.
    pub fn ordered_sources(&self) -> Vec<Source> {
        let set: BTreeSet<Source> = self.sources.iter().copied().collect();
        set.into_iter().collect()
    }
}
