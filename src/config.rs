use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TrialScopeError;

/// Score-to-label cut points. Policy, not mechanism: configurable, but the
/// loader enforces monotonicity so a higher score can never map to a less
/// relevant label.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct LabelThresholds {
    #[serde(default = "default_highly")]
    pub highly: u8,
    #[serde(default = "default_relevant")]
    pub relevant: u8,
    #[serde(default = "default_less")]
    pub less: u8,
}

impl Default for LabelThresholds {
    fn default() -> Self {
        Self {
            highly: default_highly(),
            relevant: default_relevant(),
            less: default_less(),
        }
    }
}

fn default_highly() -> u8 {
    80
}

fn default_relevant() -> u8 {
    50
}

fn default_less() -> u8 {
    20
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
    #[serde(default)]
    pub thresholds: LabelThresholds,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            batch_size: default_batch_size(),
            batch_timeout_secs: default_batch_timeout_secs(),
            thresholds: LabelThresholds::default(),
        }
    }
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_batch_size() -> usize {
    12
}

fn default_batch_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DedupConfig {
    #[serde(default = "default_title_similarity")]
    pub title_similarity: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            title_similarity: default_title_similarity(),
        }
    }
}

fn default_title_similarity() -> f64 {
    0.90
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    #[serde(default = "default_source_timeout_secs")]
    pub source_timeout_secs: u64,
    /// Wall-clock bound on the whole fan-out. Defaults to twice the
    /// per-source timeout when absent.
    #[serde(default)]
    pub global_timeout_secs: Option<u64>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            source_timeout_secs: default_source_timeout_secs(),
            global_timeout_secs: None,
        }
    }
}

fn default_source_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

impl PipelineConfig {
    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch.source_timeout_secs)
    }

    pub fn global_timeout(&self) -> Duration {
        match self.dispatch.global_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(self.dispatch.source_timeout_secs * 2),
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.classifier.batch_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), TrialScopeError> {
        let t = &self.classifier.thresholds;
        if !(t.less < t.relevant && t.relevant < t.highly) {
            return Err(TrialScopeError::InvalidThresholds(format!(
                "less ({}) < relevant ({}) < highly ({}) required",
                t.less, t.relevant, t.highly
            )));
        }
        let similarity = self.dedup.title_similarity;
        if !(similarity > 0.0 && similarity <= 1.0) {
            return Err(TrialScopeError::InvalidSimilarity(similarity));
        }
        if self.classifier.batch_size == 0 {
            return Err(TrialScopeError::InvalidBatchSize);
        }
        Ok(())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `trialscope.json` when present, defaults otherwise. An explicit
    /// path must exist.
    pub fn resolve(path: Option<&str>) -> Result<PipelineConfig, TrialScopeError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from("trialscope.json"),
        };

        if path.is_none() && !config_path.exists() {
            let config = PipelineConfig::default();
            config.validate()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| TrialScopeError::ConfigRead(config_path.clone()))?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .map_err(|err| TrialScopeError::ConfigParse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::error::TrialScopeError;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.classifier.thresholds.highly, 80);
        assert_eq!(config.classifier.batch_size, 12);
        assert_eq!(config.global_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"classifier": {"batch_size": 20}}"#).unwrap();
        assert_eq!(config.classifier.batch_size, 20);
        assert_eq!(config.classifier.thresholds.relevant, 50);
        assert_eq!(config.dedup.title_similarity, 0.90);
    }

    #[test]
    fn non_monotonic_thresholds_rejected() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"classifier": {"thresholds": {"highly": 40, "relevant": 50, "less": 20}}}"#,
        )
        .unwrap();
        assert_matches!(
            config.validate().unwrap_err(),
            TrialScopeError::InvalidThresholds(_)
        );
    }

    #[test]
    fn similarity_out_of_range_rejected() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"dedup": {"title_similarity": 1.5}}"#).unwrap();
        assert_matches!(
            config.validate().unwrap_err(),
            TrialScopeError::InvalidSimilarity(_)
        );
    }

    #[test]
    fn explicit_global_timeout_wins() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"dispatch": {"source_timeout_secs": 10, "global_timeout_secs": 45}}"#,
        )
        .unwrap();
        assert_eq!(config.global_timeout(), Duration::from_secs(45));
    }
}
