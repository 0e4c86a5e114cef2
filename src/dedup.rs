use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::domain::TrialRecord;

/// Merges records that describe the same underlying study. Identity is a
/// graph-clustering problem: records are nodes, shared registry keys and
/// near-identical titles are edges, and each connected component collapses
/// into one canonical record. Union-find keeps the result transitive and
/// independent of input ordering.
pub struct Deduplicator {
    title_similarity: f64,
}

impl Deduplicator {
    pub fn new(title_similarity: f64) -> Self {
        Self { title_similarity }
    }

    pub fn deduplicate(&self, records: Vec<TrialRecord>) -> Vec<TrialRecord> {
        if records.len() < 2 {
            return records;
        }

        let mut uf = UnionFind::new(records.len());

        let mut seen_keys: HashMap<String, usize> = HashMap::new();
        for (index, record) in records.iter().enumerate() {
            for key in registry_keys(record) {
                match seen_keys.get(&key) {
                    Some(&other) => uf.union(index, other),
                    None => {
                        seen_keys.insert(key, index);
                    }
                }
            }
        }

        let token_sets: Vec<BTreeSet<String>> = records
            .iter()
            .map(|record| title_tokens(&record.title))
            .collect();
        for left in 0..records.len() {
            for right in (left + 1)..records.len() {
                if uf.find(left) == uf.find(right) {
                    continue;
                }
                let similarity = jaccard(&token_sets[left], &token_sets[right]);
                if similarity >= self.title_similarity {
                    uf.union(left, right);
                }
            }
        }

        let mut groups: HashMap<usize, Vec<usize>> = HashMap::new();
        for index in 0..records.len() {
            groups.entry(uf.find(index)).or_default().push(index);
        }

        let mut merged: Vec<(usize, TrialRecord)> = groups
            .into_values()
            .map(|mut members| {
                // Canonical representative: highest-priority source, then
                // first seen. Dispatch feeds records in stable source order,
                // so this is reproducible.
                members.sort_by_key(|&index| (records[index].source, index));
                let lead = members[0];
                (lead, merge_group(&members, &records))
            })
            .collect();
        merged.sort_by_key(|&(lead, _)| (records[lead].source, lead));

        let result: Vec<TrialRecord> = merged.into_iter().map(|(_, record)| record).collect();
        debug!(
            input = records.len(),
            unique = result.len(),
            "deduplication complete"
        );
        result
    }
}

/// Merged record: canonical text from the lead record, structured fields
/// unioned with priority-ordered conflict resolution, provenance unioned.
fn merge_group(members: &[usize], records: &[TrialRecord]) -> TrialRecord {
    let mut merged = records[members[0]].clone();

    for &index in &members[1..] {
        let other = &records[index];
        merged.merged_sources.extend(other.merged_sources.iter());

        if merged.summary.is_none() {
            merged.summary = other.summary.clone();
        }
        let structured = &mut merged.structured;
        if structured.phase.is_none() {
            structured.phase = other.structured.phase.clone();
        }
        if structured.status.is_none() {
            structured.status = other.structured.status.clone();
        }
        if structured.start_date.is_none() {
            structured.start_date = other.structured.start_date.clone();
        }
        if structured.sponsor.is_none() {
            structured.sponsor = other.structured.sponsor.clone();
        }
        extend_unique(&mut structured.conditions, &other.structured.conditions);
        extend_unique(
            &mut structured.interventions,
            &other.structured.interventions,
        );
        extend_unique(&mut structured.registry_ids, &other.structured.registry_ids);
    }

    merged
}

fn extend_unique(target: &mut Vec<String>, extra: &[String]) {
    for value in extra {
        if !target.iter().any(|existing| existing == value) {
            target.push(value.clone());
        }
    }
}

fn nct_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bNCT\d{7,8}\b").unwrap())
}

fn ctis_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{4}-\d{6}-\d{2}(?:-\d{2})?\b").unwrap())
}

/// Normalized registry keys found on one record: its own identifier, any
/// cross-registry ids the source supplied, and ids embedded in the URL.
pub fn registry_keys(record: &TrialRecord) -> Vec<String> {
    let mut keys = BTreeSet::new();
    let haystacks = [record.identifier.as_str(), record.url.as_str()];
    for text in haystacks
        .into_iter()
        .chain(record.structured.registry_ids.iter().map(|id| id.as_str()))
    {
        for capture in nct_regex().find_iter(text) {
            keys.insert(capture.as_str().to_uppercase());
        }
        for capture in ctis_regex().find_iter(text) {
            // CTIS numbers may or may not carry the two-digit site suffix;
            // compare on the stem.
            let stem: String = capture.as_str().chars().take(14).collect();
            keys.insert(stem);
        }
        if let Some(doi) = text.strip_prefix("doi:") {
            keys.insert(format!("DOI:{}", doi.to_lowercase()));
        }
    }
    keys.into_iter().collect()
}

fn title_tokens(title: &str) -> BTreeSet<String> {
    title
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .map(|token| token.to_string())
        .collect()
}

fn jaccard(left: &BTreeSet<String>, right: &BTreeSet<String>) -> f64 {
    if left.is_empty() && right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(right).count();
    let union = left.len() + right.len() - intersection;
    intersection as f64 / union as f64
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(size: usize) -> Self {
        Self {
            parent: (0..size).collect(),
        }
    }

    fn find(&mut self, index: usize) -> usize {
        if self.parent[index] != index {
            let root = self.find(self.parent[index]);
            self.parent[index] = root;
        }
        self.parent[index]
    }

    fn union(&mut self, left: usize, right: usize) {
        let left_root = self.find(left);
        let right_root = self.find(right);
        if left_root != right_root {
            // Attach to the smaller index so roots stay stable.
            if left_root < right_root {
                self.parent[right_root] = left_root;
            } else {
                self.parent[left_root] = right_root;
            }
        }
    }
}
