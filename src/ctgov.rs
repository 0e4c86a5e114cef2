use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;
use tracing::debug;

use crate::domain::{FetchFailure, Source, TrialRecord};
use crate::error::TrialScopeError;
use crate::normalize::{clean_optional, clean_text};
use crate::registry::{RegistryClient, RequestPacer, decode_json, handle_status, send_with_retries};

const CTGOV_BASE: &str = "https://clinicaltrials.gov/api/v2";
const PAGE_SIZE: usize = 100;

/// ClinicalTrials.gov v2 API client. Pagination is token-based; the client
/// stops as soon as `max_results` studies are collected or the registry
/// stops returning a next-page token.
pub struct CtGovClient {
    client: Client,
    pacer: RequestPacer,
    base_url: String,
}

impl CtGovClient {
    pub fn new(timeout: Duration) -> Result<Self, TrialScopeError> {
        Ok(Self {
            client: crate::registry::http_client(timeout)?,
            pacer: RequestPacer::new(Duration::from_millis(1_000)),
            base_url: CTGOV_BASE.to_string(),
        })
    }

    fn fetch_page(
        &self,
        query: &str,
        page_size: usize,
        page_token: Option<&str>,
    ) -> Result<Value, FetchFailure> {
        self.pacer.pace();
        let url = format!("{}/studies", self.base_url);
        let response = send_with_retries(|| {
            let mut request = self.client.get(&url).query(&[
                ("query.term", query),
                ("format", "json"),
                ("pageSize", &page_size.to_string()),
            ]);
            if let Some(token) = page_token {
                request = request.query(&[("pageToken", token)]);
            }
            request
        })?;
        let response = handle_status(response)?;
        decode_json(response)
    }
}

impl RegistryClient for CtGovClient {
    fn source(&self) -> Source {
        Source::ClinicalTrialsGov
    }

    fn fetch(&self, query: &str, max_results: usize) -> Result<Vec<Value>, FetchFailure> {
        let mut studies = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let remaining = max_results - studies.len();
            let page = self.fetch_page(query, remaining.min(PAGE_SIZE), page_token.as_deref())?;
            let batch = page
                .get("studies")
                .and_then(|value| value.as_array())
                .ok_or_else(|| FetchFailure::Malformed {
                    detail: "missing studies array".to_string(),
                })?;
            studies.extend(batch.iter().cloned());
            debug!(total = studies.len(), "ctgov page fetched");

            if studies.len() >= max_results {
                studies.truncate(max_results);
                break;
            }
            page_token = page
                .get("nextPageToken")
                .and_then(|value| value.as_str())
                .map(|value| value.to_string());
            if page_token.is_none() || batch.is_empty() {
                break;
            }
        }

        Ok(studies)
    }

    fn normalize(&self, raw: &Value) -> Option<TrialRecord> {
        normalize_study(raw)
    }
}

/// Maps one v2 study payload into the canonical record. Requires an NCT id
/// and a title; everything else is optional and omitted when the registry
/// leaves it out.
pub fn normalize_study(raw: &Value) -> Option<TrialRecord> {
    let protocol = raw.get("protocolSection")?;
    let identification = protocol.get("identificationModule")?;

    let nct_id = identification.get("nctId").and_then(|v| v.as_str())?;
    let title = identification
        .get("briefTitle")
        .or_else(|| identification.get("officialTitle"))
        .and_then(|v| v.as_str())
        .map(clean_text)
        .filter(|title| !title.is_empty())?;

    let url = format!("https://clinicaltrials.gov/study/{nct_id}");
    let mut record = TrialRecord::new(nct_id.to_string(), title, Source::ClinicalTrialsGov, url);

    let description = protocol.get("descriptionModule");
    record.summary = description
        .and_then(|v| v.get("briefSummary"))
        .or_else(|| description.and_then(|v| v.get("detailedDescription")))
        .and_then(|v| v.as_str())
        .and_then(|text| clean_optional(Some(text)));

    if let Some(conditions) = protocol
        .get("conditionsModule")
        .and_then(|v| v.get("conditions"))
        .and_then(|v| v.as_array())
    {
        record.structured.conditions = conditions
            .iter()
            .filter_map(|v| v.as_str())
            .map(clean_text)
            .filter(|c| !c.is_empty())
            .collect();
    }

    record.structured.phase = protocol
        .get("designModule")
        .and_then(|v| v.get("phases"))
        .and_then(|v| v.as_array())
        .and_then(|phases| phases.first())
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    let status = protocol.get("statusModule");
    record.structured.status = status
        .and_then(|v| v.get("overallStatus"))
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());
    record.structured.start_date = status
        .and_then(|v| v.get("startDateStruct"))
        .and_then(|v| v.get("date"))
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    record.structured.sponsor = protocol
        .get("sponsorCollaboratorsModule")
        .and_then(|v| v.get("leadSponsor"))
        .and_then(|v| v.get("name"))
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    if let Some(interventions) = protocol
        .get("armsInterventionsModule")
        .and_then(|v| v.get("interventions"))
        .and_then(|v| v.as_array())
    {
        record.structured.interventions = interventions
            .iter()
            .filter_map(|v| v.get("name"))
            .filter_map(|v| v.as_str())
            .map(clean_text)
            .filter(|name| !name.is_empty())
            .collect();
    }

    record.structured.registry_ids = vec![nct_id.to_string()];
    Some(record)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn study() -> Value {
        json!({
            "protocolSection": {
                "identificationModule": {
                    "nctId": "NCT01234567",
                    "briefTitle": "Gemcitabine in <i>Pancreatic</i> Cancer"
                },
                "descriptionModule": {
                    "briefSummary": "<p>A phase II study of\n gemcitabine.</p>"
                },
                "conditionsModule": { "conditions": ["Pancreatic Cancer"] },
                "designModule": { "phases": ["PHASE2"] },
                "statusModule": {
                    "overallStatus": "RECRUITING",
                    "startDateStruct": { "date": "2024-03-01" }
                },
                "sponsorCollaboratorsModule": {
                    "leadSponsor": { "name": "Example University" }
                },
                "armsInterventionsModule": {
                    "interventions": [{ "name": "Gemcitabine" }, { "name": "Placebo" }]
                }
            }
        })
    }

    #[test]
    fn normalize_study_maps_all_fields() {
        let record = normalize_study(&study()).unwrap();
        assert_eq!(record.identifier, "NCT01234567");
        assert_eq!(record.title, "Gemcitabine in Pancreatic Cancer");
        assert_eq!(record.url, "https://clinicaltrials.gov/study/NCT01234567");
        assert_eq!(
            record.summary.as_deref(),
            Some("A phase II study of gemcitabine.")
        );
        assert_eq!(record.structured.phase.as_deref(), Some("PHASE2"));
        assert_eq!(record.structured.status.as_deref(), Some("RECRUITING"));
        assert_eq!(record.structured.start_date.as_deref(), Some("2024-03-01"));
        assert_eq!(
            record.structured.sponsor.as_deref(),
            Some("Example University")
        );
        assert_eq!(record.structured.interventions.len(), 2);
        assert_eq!(record.structured.registry_ids, vec!["NCT01234567"]);
    }

    #[test]
    fn normalize_study_requires_nct_id() {
        let raw = json!({
            "protocolSection": {
                "identificationModule": { "briefTitle": "No id" }
            }
        });
        assert!(normalize_study(&raw).is_none());
    }

    #[test]
    fn normalize_study_omits_absent_fields() {
        let raw = json!({
            "protocolSection": {
                "identificationModule": {
                    "nctId": "NCT00000001",
                    "officialTitle": "Bare Study"
                }
            }
        });
        let record = normalize_study(&raw).unwrap();
        assert!(record.summary.is_none());
        assert!(record.structured.phase.is_none());
        assert!(record.structured.conditions.is_empty());
    }
}
