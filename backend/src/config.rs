//! Import job configuration.
//!
//! Loaded from a JSON file (every field optional) and then overridden from
//! `ONBOARD_*` environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ImportError, JobResult};
use crate::retry::RetryPolicy;
use crate::services::RoleMap;

pub const ENV_CHUNK_SIZE: &str = "ONBOARD_CHUNK_SIZE";
pub const ENV_AFFILIATE_ID: &str = "ONBOARD_AFFILIATE_ID";
pub const ENV_MAX_ERROR_SAMPLES: &str = "ONBOARD_MAX_ERROR_SAMPLES";

/// Bounds used to derive the job deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobLimits {
    /// Largest upload the calling layer accepts.
    pub max_upload_bytes: u64,
    /// Smallest plausible data line, used to bound the row count.
    pub min_row_bytes: u64,
    pub per_row_budget_ms: u64,
    pub base_budget_ms: u64,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
            min_row_bytes: 32,
            per_row_budget_ms: 10,
            base_budget_ms: 5_000,
        }
    }
}

impl JobLimits {
    /// Most rows an accepted upload can hold.
    pub fn max_rows(&self) -> u64 {
        self.max_upload_bytes / self.min_row_bytes.max(1)
    }

    /// Wall-clock budget for a whole job.
    pub fn deadline(&self) -> Duration {
        let rows_ms = self.per_row_budget_ms.saturating_mul(self.max_rows());
        Duration::from_millis(self.base_budget_ms.saturating_add(rows_ms))
    }
}

/// Everything an import run needs besides its input and repositories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Rows per chunk. Must be at least 1.
    pub chunk_size: usize,
    /// Failed-row messages kept in the summary's error sample.
    pub max_error_samples: usize,
    /// Affiliate for rows without an `affiliate_id` value.
    pub default_affiliate_id: Uuid,
    /// Forced delimiter; detected from the header when unset.
    pub delimiter: Option<char>,
    pub role_map: RoleMap,
    pub blacklisted_domains: Vec<String>,
    pub retry: RetryPolicy,
    pub limits: JobLimits,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            chunk_size: 200,
            max_error_samples: 100,
            default_affiliate_id: Uuid::nil(),
            delimiter: None,
            role_map: RoleMap::default(),
            blacklisted_domains: Vec::new(),
            retry: RetryPolicy::default(),
            limits: JobLimits::default(),
        }
    }
}

impl ImportConfig {
    pub fn from_json_str(json: &str) -> JobResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ImportError::InvalidConfig(format!("bad config JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> JobResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ImportError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&content)
    }

    /// Apply `ONBOARD_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> JobResult<()> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> JobResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_CHUNK_SIZE) {
            self.chunk_size = parse_var(ENV_CHUNK_SIZE, &value)?;
        }
        if let Some(value) = lookup(ENV_MAX_ERROR_SAMPLES) {
            self.max_error_samples = parse_var(ENV_MAX_ERROR_SAMPLES, &value)?;
        }
        if let Some(value) = lookup(ENV_AFFILIATE_ID) {
            self.default_affiliate_id = parse_var(ENV_AFFILIATE_ID, &value)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> JobResult<()> {
        if self.chunk_size == 0 {
            return Err(ImportError::InvalidConfig(
                "chunk_size must be at least 1".to_string(),
            ));
        }
        if self.limits.min_row_bytes == 0 {
            return Err(ImportError::InvalidConfig(
                "limits.min_row_bytes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> JobResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ImportError::InvalidConfig(format!("{}={:?}: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EmploymentStatus;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ImportConfig::default();
        assert_eq!(config.chunk_size, 200);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.validate().is_ok());
        // 5s base + 10ms for each of the 327_680 possible rows
        assert_eq!(config.limits.deadline(), Duration::from_millis(5_000 + 3_276_800));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ImportConfig::from_json_str(
            r#"{
                "chunk_size": 50,
                "blacklisted_domains": ["spam.test"],
                "role_map": { "by_status": { "active": ["member", "voter"] } }
            }"#,
        )
        .unwrap();

        assert_eq!(config.chunk_size, 50);
        assert_eq!(config.max_error_samples, 100);
        assert_eq!(config.blacklisted_domains, vec!["spam.test"]);
        assert_eq!(
            config
                .role_map
                .roles_for(Some(EmploymentStatus::Active), None)
                .len(),
            2
        );
    }

    #[test]
    fn test_zero_chunk_size_is_invalid() {
        let err = ImportConfig::from_json_str(r#"{ "chunk_size": 0 }"#).unwrap_err();
        assert!(matches!(err, ImportError::InvalidConfig(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "max_error_samples": 5 }}"#).unwrap();

        let config = ImportConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_error_samples, 5);

        let missing = ImportConfig::from_file("/nonexistent/onboard.json");
        assert!(matches!(missing, Err(ImportError::InvalidConfig(_))));
    }

    #[test]
    fn test_overrides() {
        let affiliate = Uuid::new_v4();
        let vars = HashMap::from([
            (ENV_CHUNK_SIZE, "25".to_string()),
            (ENV_AFFILIATE_ID, affiliate.to_string()),
        ]);
        let mut config = ImportConfig::default();
        config
            .apply_overrides(|key| vars.get(key).cloned())
            .unwrap();

        assert_eq!(config.chunk_size, 25);
        assert_eq!(config.default_affiliate_id, affiliate);

        let bad = HashMap::from([(ENV_CHUNK_SIZE, "many".to_string())]);
        assert!(config.apply_overrides(|key| bad.get(key).cloned()).is_err());
    }
}
