use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::domain::{FetchFailure, Source, TrialRecord};
use crate::error::TrialScopeError;
use crate::{ctgov, euctis, europepmc, pubmed};

/// One external registry or literature index: request construction and
/// pagination on one side, raw-schema mapping on the other. Adding a source
/// means adding an implementation, never branching on source type in shared
/// logic.
pub trait RegistryClient: Send + Sync {
    fn source(&self) -> Source;

    /// Fetches up to `max_results` raw entries. Failures come back as data;
    /// this boundary never panics or propagates transport errors upward.
    fn fetch(&self, query: &str, max_results: usize) -> Result<Vec<Value>, FetchFailure>;

    /// Maps one raw entry into the canonical record shape. `None` marks a
    /// malformed entry, which the caller counts and skips.
    fn normalize(&self, raw: &Value) -> Option<TrialRecord>;
}

/// Builds the concrete client for every selected source, in the given order.
pub fn build_clients(
    sources: &[Source],
    timeout: Duration,
) -> Result<Vec<Arc<dyn RegistryClient>>, TrialScopeError> {
    let mut clients: Vec<Arc<dyn RegistryClient>> = Vec::with_capacity(sources.len());
    for source in sources {
        let client: Arc<dyn RegistryClient> = match source {
            Source::ClinicalTrialsGov => Arc::new(ctgov::CtGovClient::new(timeout)?),
            Source::EuCtis => Arc::new(euctis::EuCtisClient::new(timeout)?),
            Source::PubMed => Arc::new(pubmed::PubMedClient::new(timeout)?),
            Source::EuropePmc => Arc::new(europepmc::EuropePmcClient::new(timeout)?),
        };
        clients.push(client);
    }
    Ok(clients)
}

pub fn http_client(timeout: Duration) -> Result<Client, TrialScopeError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("trialscope/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| TrialScopeError::HttpClient(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|err| TrialScopeError::HttpClient(err.to_string()))
}

/// Fixed-interval request spacing, one per client so no rate-limit state is
/// shared across sources.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub fn pace(&self) {
        let mut last = self.last.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                thread::sleep(self.min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

pub(crate) fn send_with_retries<F>(
    mut make_req: F,
) -> Result<reqwest::blocking::Response, FetchFailure>
where
    F: FnMut() -> reqwest::blocking::RequestBuilder,
{
    const MAX_RETRIES: usize = 3;
    let mut attempt = 0usize;
    loop {
        let response = make_req().send();
        match response {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if attempt < MAX_RETRIES && is_retryable_status(status) {
                    thread::sleep(retry_delay(attempt));
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if attempt < MAX_RETRIES && is_retryable_error(&err) {
                    thread::sleep(retry_delay(attempt));
                    attempt += 1;
                    continue;
                }
                return Err(classify_transport_error(&err));
            }
        }
    }
}

/// Exponential backoff, doubling from the base delay per attempt.
fn retry_delay(attempt: usize) -> Duration {
    const BASE_DELAY_MS: u64 = 200;
    Duration::from_millis(BASE_DELAY_MS << attempt.min(8))
}

pub(crate) fn handle_status(
    response: reqwest::blocking::Response,
) -> Result<reqwest::blocking::Response, FetchFailure> {
    if response.status().is_success() {
        return Ok(response);
    }
    Err(FetchFailure::Http {
        status: response.status().as_u16(),
    })
}

pub(crate) fn decode_json(response: reqwest::blocking::Response) -> Result<Value, FetchFailure> {
    response.json().map_err(|err| FetchFailure::Malformed {
        detail: err.to_string(),
    })
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn classify_transport_error(err: &reqwest::Error) -> FetchFailure {
    if err.is_timeout() {
        FetchFailure::Timeout
    } else {
        FetchFailure::Malformed {
            detail: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pacer_spaces_consecutive_requests() {
        let pacer = RequestPacer::new(Duration::from_millis(30));
        let start = Instant::now();
        pacer.pace();
        pacer.pace();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn retry_delay_doubles_per_attempt() {
        assert_eq!(retry_delay(0), Duration::from_millis(200));
        assert_eq!(retry_delay(1), Duration::from_millis(400));
        assert_eq!(retry_delay(2), Duration::from_millis(800));
    }

    #[test]
    fn retryable_status_covers_throttling_and_server_errors() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(400));
    }
}
