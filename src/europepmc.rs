use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;
use tracing::debug;

use crate::domain::{FetchFailure, Source, TrialRecord};
use crate::error::TrialScopeError;
use crate::normalize::clean_optional;
use crate::registry::{RegistryClient, RequestPacer, decode_json, handle_status, send_with_retries};

const EPMC_BASE: &str = "https://www.ebi.ac.uk/europepmc/webservices/rest";
const PAGE_SIZE: usize = 100;

/// Europe PMC REST client. `resultType=core` is the variant that carries
/// abstract text.
pub struct EuropePmcClient {
    client: Client,
    pacer: RequestPacer,
    base_url: String,
}

impl EuropePmcClient {
    pub fn new(timeout: Duration) -> Result<Self, TrialScopeError> {
        Ok(Self {
            client: crate::registry::http_client(timeout)?,
            pacer: RequestPacer::new(Duration::from_millis(200)),
            base_url: EPMC_BASE.to_string(),
        })
    }

    fn fetch_page(&self, query: &str, page_size: usize, cursor: &str) -> Result<Value, FetchFailure> {
        self.pacer.pace();
        let url = format!("{}/search", self.base_url);
        let response = send_with_retries(|| {
            self.client.get(&url).query(&[
                ("query", query),
                ("format", "json"),
                ("resultType", "core"),
                ("pageSize", &page_size.to_string()),
                ("cursorMark", cursor),
            ])
        })?;
        let response = handle_status(response)?;
        decode_json(response)
    }
}

impl RegistryClient for EuropePmcClient {
    fn source(&self) -> Source {
        Source::EuropePmc
    }

    fn fetch(&self, query: &str, max_results: usize) -> Result<Vec<Value>, FetchFailure> {
        let mut results = Vec::new();
        let mut cursor = "*".to_string();

        loop {
            let remaining = max_results - results.len();
            let page = self.fetch_page(query, remaining.min(PAGE_SIZE), &cursor)?;
            let batch = page
                .get("resultList")
                .and_then(|v| v.get("result"))
                .and_then(|v| v.as_array())
                .ok_or_else(|| FetchFailure::Malformed {
                    detail: "missing resultList.result".to_string(),
                })?;
            results.extend(batch.iter().cloned());
            debug!(total = results.len(), "europepmc page fetched");

            if results.len() >= max_results || batch.is_empty() {
                results.truncate(max_results);
                break;
            }
            match page.get("nextCursorMark").and_then(|v| v.as_str()) {
                Some(next) if next != cursor => cursor = next.to_string(),
                _ => break,
            }
        }

        Ok(results)
    }

    fn normalize(&self, raw: &Value) -> Option<TrialRecord> {
        normalize_result(raw)
    }
}

pub fn normalize_result(raw: &Value) -> Option<TrialRecord> {
    let id = raw.get("id").and_then(|v| v.as_str())?;
    let title = clean_optional(raw.get("title").and_then(|v| v.as_str()))?;

    let source_db = raw.get("source").and_then(|v| v.as_str()).unwrap_or("MED");
    let url = format!("https://europepmc.org/article/{source_db}/{id}");
    let mut record = TrialRecord::new(id.to_string(), title, Source::EuropePmc, url);

    record.summary = clean_optional(raw.get("abstractText").and_then(|v| v.as_str()));
    record.structured.start_date = raw
        .get("firstPublicationDate")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    if let Some(doi) = raw.get("doi").and_then(|v| v.as_str()) {
        record.structured.registry_ids.push(format!("doi:{doi}"));
    }
    // Trial registration accessions (NCT numbers and the like) surface as
    // nested cross-reference objects on core results.
    if let Some(references) = raw
        .get("dbCrossReferenceList")
        .and_then(|v| v.get("dbCrossReference"))
        .and_then(|v| v.as_array())
    {
        for reference in references {
            let Some(infos) = reference
                .get("dbCrossReferenceInfo")
                .and_then(|v| v.as_array())
            else {
                continue;
            };
            for accession in infos
                .iter()
                .filter_map(|info| info.get("info1"))
                .filter_map(|v| v.as_str())
            {
                record.structured.registry_ids.push(accession.to_string());
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
    fn normalize_result_maps_fields() {
        let raw = json!({
            "id": "39000001",
            "source": "MED",
            "title": "A phase III trial of <sup>177</sup>Lu therapy.",
            "abstractText": "<h4>Background</h4>Neuroendocrine tumors respond.",
            "doi": "10.1000/epmc.1",
            "firstPublicationDate": "2024-05-12"
        });
        let record = normalize_result(&raw).unwrap();
        assert_eq!(record.identifier, "39000001");
        assert_eq!(record.title, "A phase III trial of 177 Lu therapy.");
        assert_eq!(record.url, "https://europepmc.org/article/MED/39000001");
        assert_eq!(
            record.summary.as_deref(),
            Some("Background Neuroendocrine tumors respond.")
        );
        assert_eq!(record.structured.registry_ids, vec!["doi:10.1000/epmc.1"]);
    }

    #[test]
    fn normalize_result_extracts_trial_registration_accessions() {
        let raw = json!({
            "id": "39000002",
            "source": "MED",
            "title": "Outcomes of a registered trial.",
            "dbCrossReferenceList": {
                "dbCrossReference": [
                    {
                        "dbName": "CTX",
                        "dbCrossReferenceInfo": [
                            { "info1": "NCT04567890" }
                        ]
                    }
                ]
            }
        });
        let record = normalize_result(&raw).unwrap();
        assert_eq!(record.structured.registry_ids, vec!["NCT04567890"]);
    }

    #[test]
    fn normalize_result_rejects_entry_without_id() {
        let raw = json!({ "title": "Orphan entry" });
        assert!(normalize_result(&raw).is_none());
    }
}
