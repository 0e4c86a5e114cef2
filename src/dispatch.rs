use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{FetchFailure, Source};
use crate::registry::RegistryClient;

/// Fans one query out to every selected source concurrently. Each fetch runs
/// on its own thread with its own client and rate-limit state; one source's
/// failure never blocks another's result.
pub struct QueryDispatcher {
    global_timeout: Duration,
}

impl QueryDispatcher {
    pub fn new(global_timeout: Duration) -> Self {
        Self { global_timeout }
    }

    /// Returns an entry for every selected source, success or failure.
    /// Sources still outstanding at the global deadline are recorded as
    /// timed out; their threads are abandoned and their late results dropped.
    pub fn dispatch(
        &self,
        clients: &[Arc<dyn RegistryClient>],
        query: &str,
        max_results: usize,
    ) -> BTreeMap<Source, Result<Vec<Value>, FetchFailure>> {
        let deadline = Instant::now() + self.global_timeout;
        let (tx, rx) = mpsc::channel::<(Source, Result<Vec<Value>, FetchFailure>)>();

        let mut pending: BTreeSet<Source> = BTreeSet::new();
        for client in clients {
            pending.insert(client.source());
            let client = Arc::clone(client);
            let tx = tx.clone();
            let query = query.to_string();
            thread::spawn(move || {
                let started = Instant::now();
                let result = client.fetch(&query, max_results);
                debug!(
                    source = %client.source(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "source fetch finished"
                );
                // Receiver is gone once the deadline passed; late results
                // are intentionally discarded.
                let _ = tx.send((client.source(), result));
            });
        }
        drop(tx);

        let mut outcomes: BTreeMap<Source, Result<Vec<Value>, FetchFailure>> = BTreeMap::new();
        while !pending.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match rx.recv_timeout(remaining) {
                Ok((source, result)) => {
                    pending.remove(&source);
                    outcomes.insert(source, result);
                }
                Err(_) => break,
            }
        }

        for source in pending {
            warn!(source = %source, "source missed the dispatch deadline");
            outcomes.insert(source, Err(FetchFailure::Timeout));
        }

        outcomes
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::domain::TrialRecord;

    struct StubClient {
        source: Source,
        delay: Duration,
        result: Result<Vec<Value>, FetchFailure>,
    }

    impl RegistryClient for StubClient {
        fn source(&self) -> Source {
            self.source
        }

        fn fetch(&self, _query: &str, _max_results: usize) -> Result<Vec<Value>, FetchFailure> {
            thread::sleep(self.delay);
            self.result.clone()
        }

        fn normalize(&self, _raw: &Value) -> Option<TrialRecord> {
            None
        }
    }

    #[test]
    fn dispatch_returns_entry_for_every_source() {
        let clients: Vec<Arc<dyn RegistryClient>> = vec![
            Arc::new(StubClient {
                source: Source::ClinicalTrialsGov,
                delay: Duration::ZERO,
                result: Ok(vec![json!({"id": 1})]),
            }),
            Arc::new(StubClient {
                source: Source::PubMed,
                delay: Duration::ZERO,
                result: Err(FetchFailure::Http { status: 502 }),
            }),
        ];
        let dispatcher = QueryDispatcher::new(Duration::from_secs(5));
        let outcomes = dispatcher.dispatch(&clients, "asthma", 10);

        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes[&Source::ClinicalTrialsGov].as_ref().unwrap().len(),
            1
        );
        assert_eq!(
            outcomes[&Source::PubMed].as_ref().unwrap_err(),
            &FetchFailure::Http { status: 502 }
        );
    }

    #[test]
    fn dispatch_marks_slow_source_as_timeout_and_keeps_fast_results() {
        let clients: Vec<Arc<dyn RegistryClient>> = vec![
            Arc::new(StubClient {
                source: Source::ClinicalTrialsGov,
                delay: Duration::ZERO,
                result: Ok(vec![json!({"id": 1}), json!({"id": 2})]),
            }),
            Arc::new(StubClient {
                source: Source::EuropePmc,
                delay: Duration::from_secs(2),
                result: Ok(vec![json!({"id": 3})]),
            }),
        ];
        let dispatcher = QueryDispatcher::new(Duration::from_millis(100));
        let started = Instant::now();
        let outcomes = dispatcher.dispatch(&clients, "asthma", 10);

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcomes.len(), 2);
        assert_eq!(
            outcomes[&Source::ClinicalTrialsGov].as_ref().unwrap().len(),
            2
        );
        assert_eq!(
            outcomes[&Source::EuropePmc].as_ref().unwrap_err(),
            &FetchFailure::Timeout
        );
    }
}
