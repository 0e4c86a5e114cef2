use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;
use tracing::debug;

use crate::domain::{FetchFailure, Source, TrialRecord};
use crate::error::TrialScopeError;
use crate::normalize::clean_optional;
use crate::registry::{RegistryClient, RequestPacer, decode_json, handle_status, send_with_retries};

const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

/// PubMed E-utilities client: esearch resolves PMIDs, esummary hydrates them.
/// NCBI allows 3 requests/second without an API key, hence the pacer.
pub struct PubMedClient {
    client: Client,
    pacer: RequestPacer,
    base_url: String,
}

impl PubMedClient {
    pub fn new(timeout: Duration) -> Result<Self, TrialScopeError> {
        Ok(Self {
            client: crate::registry::http_client(timeout)?,
            pacer: RequestPacer::new(Duration::from_millis(334)),
            base_url: EUTILS_BASE.to_string(),
        })
    }

    fn esearch(&self, query: &str, max_results: usize) -> Result<Vec<String>, FetchFailure> {
        self.pacer.pace();
        let url = format!("{}/esearch.fcgi", self.base_url);
        let term = format!("{query}[Title/Abstract] AND clinical trial[Publication Type]");
        let response = send_with_retries(|| {
            self.client.get(&url).query(&[
                ("db", "pubmed"),
                ("term", &term),
                ("retmax", &max_results.to_string()),
                ("retmode", "json"),
                ("sort", "relevance"),
            ])
        })?;
        let response = handle_status(response)?;
        let payload = decode_json(response)?;
        let ids = payload
            .get("esearchresult")
            .and_then(|v| v.get("idlist"))
            .and_then(|v| v.as_array())
            .ok_or_else(|| FetchFailure::Malformed {
                detail: "missing esearchresult.idlist".to_string(),
            })?;
        Ok(ids
            .iter()
            .filter_map(|v| v.as_str())
            .map(|v| v.to_string())
            .collect())
    }

    fn esummary(&self, pmids: &[String]) -> Result<Vec<Value>, FetchFailure> {
        self.pacer.pace();
        let url = format!("{}/esummary.fcgi", self.base_url);
        let id_list = pmids.join(",");
        let response = send_with_retries(|| {
            self.client.get(&url).query(&[
                ("db", "pubmed"),
                ("id", &id_list),
                ("retmode", "json"),
            ])
        })?;
        let response = handle_status(response)?;
        let payload = decode_json(response)?;
        let result = payload
            .get("result")
            .ok_or_else(|| FetchFailure::Malformed {
                detail: "missing esummary result".to_string(),
            })?;

        // Keep esearch relevance order, not JSON object order.
        let mut entries = Vec::new();
        for pmid in pmids {
            if let Some(entry) = result.get(pmid.as_str()) {
                entries.push(entry.clone());
            }
        }
        Ok(entries)
    }
}

impl RegistryClient for PubMedClient {
    fn source(&self) -> Source {
        Source::PubMed
    }

    fn fetch(&self, query: &str, max_results: usize) -> Result<Vec<Value>, FetchFailure> {
        let pmids = self.esearch(query, max_results)?;
        if pmids.is_empty() {
            return Ok(Vec::new());
        }
        debug!(count = pmids.len(), "pubmed ids resolved");
        self.esummary(&pmids)
    }

    fn normalize(&self, raw: &Value) -> Option<TrialRecord> {
        normalize_summary(raw)
    }
}

/// Maps one esummary entry into a canonical record. esummary carries no
/// abstract text, so the summary stays absent rather than fabricated.
pub fn normalize_summary(raw: &Value) -> Option<TrialRecord> {
    let pmid = raw.get("uid").and_then(|v| v.as_str())?;
    let title = clean_optional(raw.get("title").and_then(|v| v.as_str()))?;

    let url = format!("https://pubmed.ncbi.nlm.nih.gov/{pmid}/");
    let mut record = TrialRecord::new(pmid.to_string(), title, Source::PubMed, url);

    record.structured.start_date = raw
        .get("pubdate")
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    if let Some(ids) = raw.get("articleids").and_then(|v| v.as_array()) {
        for entry in ids {
            let id_type = entry.get("idtype").and_then(|v| v.as_str());
            let value = entry.get("value").and_then(|v| v.as_str());
            if let (Some("doi"), Some(doi)) = (id_type, value) {
                record.structured.registry_ids.push(format!("doi:{doi}"));
            }
        }
    }

    Some(record)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn normalize_summary_maps_fields() {
        let raw = json!({
            "uid": "38012345",
            "title": "Gemcitabine plus nab-paclitaxel in pancreatic cancer.",
            "pubdate": "2024 Feb",
            "articleids": [
                { "idtype": "pubmed", "value": "38012345" },
                { "idtype": "doi", "value": "10.1000/example.2024" }
            ]
        });
        let record = normalize_summary(&raw).unwrap();
        assert_eq!(record.identifier, "38012345");
        assert_eq!(record.source, Source::PubMed);
        assert_eq!(record.url, "https://pubmed.ncbi.nlm.nih.gov/38012345/");
        assert_eq!(record.structured.start_date.as_deref(), Some("2024 Feb"));
        assert_eq!(
            record.structured.registry_ids,
            vec!["doi:10.1000/example.2024"]
        );
        assert!(record.summary.is_none());
    }

    #[test]
    fn normalize_summary_rejects_missing_title() {
        let raw = json!({ "uid": "1", "title": "" });
        assert!(normalize_summary(&raw).is_none());
    }
}
