use std::fs;
use std::io::Write;

use camino::Utf8Path;
use chrono::Local;
use tracing::info;

use crate::domain::TrialRecord;
use crate::error::TrialScopeError;

/// Fixed artifact schema. Column set and order are part of the output
/// contract and never vary with record content.
pub const COLUMNS: [&str; 14] = [
    "Title",
    "URL",
    "Source",
    "Abstract",
    "AI_Score",
    "AI_Classification",
    "Confidence",
    "Conditions",
    "Phase",
    "Status",
    "Start_Date",
    "Sponsor",
    "Interventions",
    "NCT_ID",
];

pub fn default_artifact_name() -> String {
    format!(
        "clinical_trials_search_{}.csv",
        Local::now().format("%Y%m%d_%H%M%S")
    )
}

/// Renders the full CSV text. Zero records still yields the header row.
pub fn render_csv(records: &[TrialRecord]) -> String {
    let mut out = String::new();
    out.push_str(&COLUMNS.join(","));
    out.push_str("\r\n");
    for record in records {
        let row = record_row(record);
        let escaped: Vec<String> = row.iter().map(|field| csv_escape(field)).collect();
        out.push_str(&escaped.join(","));
        out.push_str("\r\n");
    }
    out
}

/// Writes the artifact atomically: render into a temp file in the target
/// directory, then rename into place.
pub fn write_csv(records: &[TrialRecord], path: &Utf8Path) -> Result<(), TrialScopeError> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(directory)
        .map_err(|err| TrialScopeError::Filesystem(format!("{directory}: {err}")))?;
    let mut temp = tempfile::NamedTempFile::new_in(directory)
        .map_err(|err| TrialScopeError::Filesystem(format!("{directory}: {err}")))?;
    temp.write_all(render_csv(records).as_bytes())
        .map_err(|err| TrialScopeError::Filesystem(format!("{path}: {err}")))?;
    temp.persist(path)
        .map_err(|err| TrialScopeError::Filesystem(format!("{path}: {err}")))?;
    info!(path = %path, records = records.len(), "wrote csv artifact");
    Ok(())
}

fn record_row(record: &TrialRecord) -> [String; 14] {
    let (score, label, confidence) = match record.relevance {
        Some(relevance) => (
            relevance.score.to_string(),
            relevance.label.as_str().to_string(),
            format!("{:.2}", relevance.confidence),
        ),
        None => (String::new(), String::new(), String::new()),
    };
    [
        record.title.clone(),
        record.url.clone(),
        record.source.display_name().to_string(),
        record.summary.clone().unwrap_or_default(),
        score,
        label,
        confidence,
        record.structured.conditions.join(", "),
        record.structured.phase.clone().unwrap_or_default(),
        record.structured.status.clone().unwrap_or_default(),
        record.structured.start_date.clone().unwrap_or_default(),
        record.structured.sponsor.clone().unwrap_or_default(),
        record.structured.interventions.join(", "),
        record
            .structured
            .registry_ids
            .first()
            .cloned()
            .unwrap_or_else(|| record.identifier.clone()),
    ]
}

/// RFC 4180 quoting: only fields containing a comma, quote, or newline get
/// quoted, with embedded quotes doubled.
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Relevance, RelevanceLabel, Source};

    fn record(title: &str) -> TrialRecord {
        TrialRecord::new(
            "NCT00000001".to_string(),
            title.to_string(),
            Source::ClinicalTrialsGov,
            "https://clinicaltrials.gov/study/NCT00000001".to_string(),
        )
    }

    #[test]
    fn zero_records_yields_header_only() {
        let csv = render_csv(&[]);
        assert_eq!(csv, format!("{}\r\n", COLUMNS.join(",")));
    }

    #[test]
    fn row_has_fixed_width_regardless_of_content() {
        let sparse = record("Sparse trial");
        let csv = render_csv(&[sparse]);
        let data_row = csv.lines().nth(1).unwrap();
        assert_eq!(data_row.split(',').count(), COLUMNS.len());
    }

    #[test]
    fn unscored_record_leaves_ai_columns_empty() {
        let csv = render_csv(&[record("Unscored")]);
        let data_row = csv.lines().nth(1).unwrap();
        let fields: Vec<&str> = data_row.split(',').collect();
        assert_eq!(fields[4], "");
        assert_eq!(fields[5], "");
        assert_eq!(fields[6], "");
    }

    #[test]
    fn scored_record_fills_all_three_ai_columns() {
        let mut scored = record("Scored");
        scored.relevance = Some(Relevance {
            score: 85,
            label: RelevanceLabel::HighlyRelevant,
            confidence: 0.9,
        });
        let csv = render_csv(&[scored]);
        let data_row = csv.lines().nth(1).unwrap();
        let fields: Vec<&str> = data_row.split(',').collect();
        assert_eq!(fields[4], "85");
        assert_eq!(fields[5], "Highly Relevant");
        assert_eq!(fields[6], "0.90");
    }

    #[test]
    fn commas_and_quotes_are_escaped() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a, b"), "\"a, b\"");
        assert_eq!(csv_escape("she said \"hi\""), "\"she said \"\"hi\"\"\"");
        assert_eq!(csv_escape("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn nct_id_falls_back_to_identifier() {
        let mut with_registry_id = record("Has registry id");
        with_registry_id.structured.registry_ids = vec!["NCT99999999".to_string()];
        let csv = render_csv(&[with_registry_id, record("No registry id")]);
        let rows: Vec<&str> = csv.lines().collect();
        assert!(rows[1].ends_with("NCT99999999"));
        assert!(rows[2].ends_with("NCT00000001"));
    }

    #[test]
    fn write_is_atomic_into_target_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("out.csv")).unwrap();
        write_csv(&[record("Persisted")], &path).unwrap();
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("Title,URL,Source"));
        assert!(written.contains("Persisted"));
    }
}
