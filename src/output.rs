use std::io::{self, Write};

use serde::Serialize;

use crate::app::SearchReport;
use crate::domain::SourceInfo;

#[derive(Debug, Clone, Serialize)]
pub struct SourcesResult {
    pub sources: Vec<SourceInfo>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_search(report: &SearchReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_sources(result: &SourcesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl crate::app::ProgressSink for JsonOutput {
    fn event(&self, _event: crate::app::ProgressEvent) {}
}

/// Progress sink that forwards nothing, for callers that only want the
/// final report.
pub struct SilentProgress;

impl crate::app::ProgressSink for SilentProgress {
    fn event(&self, _event: crate::app::ProgressEvent) {}
}
