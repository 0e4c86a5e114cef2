use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::domain::{FetchFailure, Source, TrialRecord};
use crate::error::TrialScopeError;
use crate::normalize::{clean_optional, clean_text};
use crate::registry::{RegistryClient, RequestPacer, decode_json, handle_status, send_with_retries};

const CTIS_BASE: &str = "https://euclinicaltrials.eu/ctis-public-api";
const PAGE_SIZE: usize = 50;

/// EU CTIS public-search client. The search endpoint is a JSON POST with
/// numbered pages.
pub struct EuCtisClient {
    client: Client,
    pacer: RequestPacer,
    base_url: String,
}

impl EuCtisClient {
    pub fn new(timeout: Duration) -> Result<Self, TrialScopeError> {
        Ok(Self {
            client: crate::registry::http_client(timeout)?,
            pacer: RequestPacer::new(Duration::from_millis(500)),
            base_url: CTIS_BASE.to_string(),
        })
    }

    fn fetch_page(&self, query: &str, page: usize, size: usize) -> Result<Value, FetchFailure> {
        self.pacer.pace();
        let url = format!("{}/search", self.base_url);
        let body = json!({
            "pagination": { "page": page, "size": size },
            "searchCriteria": { "containAll": query },
            "sort": { "property": "decisionDate", "direction": "DESC" }
        });
        let response = send_with_retries(|| self.client.post(&url).json(&body))?;
        let response = handle_status(response)?;
        decode_json(response)
    }
}

impl RegistryClient for EuCtisClient {
    fn source(&self) -> Source {
        Source::EuCtis
    }

    fn fetch(&self, query: &str, max_results: usize) -> Result<Vec<Value>, FetchFailure> {
        let mut trials = Vec::new();
        let mut page = 1usize;

        loop {
            let remaining = max_results - trials.len();
            let payload = self.fetch_page(query, page, remaining.min(PAGE_SIZE))?;
            let batch = payload
                .get("data")
                .and_then(|v| v.as_array())
                .ok_or_else(|| FetchFailure::Malformed {
                    detail: "missing data array".to_string(),
                })?;
            trials.extend(batch.iter().cloned());
            debug!(total = trials.len(), "euctis page fetched");

            if trials.len() >= max_results || batch.is_empty() {
                trials.truncate(max_results);
                break;
            }
            let total_pages = payload
                .get("pagination")
                .and_then(|v| v.get("totalPages"))
                .and_then(|v| v.as_u64())
                .unwrap_or(page as u64);
            if page as u64 >= total_pages {
                break;
            }
            page += 1;
        }

        Ok(trials)
    }

    fn normalize(&self, raw: &Value) -> Option<TrialRecord> {
        normalize_trial(raw)
    }
}

pub fn normalize_trial(raw: &Value) -> Option<TrialRecord> {
    let ct_number = raw.get("ctNumber").and_then(|v| v.as_str())?;
    let title = clean_optional(
        raw.get("ctTitle")
            .or_else(|| raw.get("shortTitle"))
            .and_then(|v| v.as_str()),
    )?;

    let url = format!("https://euclinicaltrials.eu/ctis-public/view/{ct_number}");
    let mut record = TrialRecord::new(ct_number.to_string(), title, Source::EuCtis, url);

    record.summary = clean_optional(raw.get("shortTitle").and_then(|v| v.as_str()));
    record.structured.phase = raw
        .get("trialPhase")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());
    record.structured.status = raw
        .get("ctStatus")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());
    record.structured.start_date = raw
        .get("startDate")
        .or_else(|| raw.get("decisionDate"))
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());
    record.structured.sponsor = raw
        .get("sponsor")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());

    if let Some(conditions) = raw.get("conditions").and_then(|v| v.as_str()) {
        record.structured.conditions = conditions
            .split(',')
            .map(clean_text)
            .filter(|c| !c.is_empty())
            .collect();
    }

    record.structured.registry_ids = vec![ct_number.to_string()];
    Some(record)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn normalize_trial_maps_fields() {
        let raw = json!({
            "ctNumber": "2024-512345-26-00",
            "ctTitle": "A study of adjuvant therapy in NSCLC",
            "shortTitle": "Adjuvant NSCLC",
            "trialPhase": "Phase III",
            "ctStatus": "Ongoing",
            "decisionDate": "2024-01-17",
            "sponsor": "Example Pharma AG",
            "conditions": "Non-Small Cell Lung Cancer, Carcinoma"
        });
        let record = normalize_trial(&raw).unwrap();
        assert_eq!(record.identifier, "2024-512345-26-00");
        assert_eq!(record.source, Source::EuCtis);
        assert_eq!(
            record.url,
            "https://euclinicaltrials.eu/ctis-public/view/2024-512345-26-00"
        );
        assert_eq!(record.structured.phase.as_deref(), Some("Phase III"));
        assert_eq!(record.structured.start_date.as_deref(), Some("2024-01-17"));
        assert_eq!(record.structured.conditions.len(), 2);
        assert_eq!(record.structured.registry_ids, vec!["2024-512345-26-00"]);
    }

    #[test]
    fn normalize_trial_rejects_missing_ct_number() {
        let raw = json!({ "ctTitle": "No number" });
        assert!(normalize_trial(&raw).is_none());
    }
}
