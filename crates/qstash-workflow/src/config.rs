// Workflow configuration
//
// Queue credentials and signing keys, loaded from environment variables.

use std::collections::BTreeMap;
use std::env;

use crate::headers::DEFAULT_RETRIES;
use crate::publisher::{HttpPublisher, DEFAULT_QSTASH_URL};
use crate::receiver::{Receiver, Region, SigningKeys};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value '{value}' for {name}")]
    InvalidValue { name: &'static str, value: String },
}

/// Configuration for serving and triggering workflows
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Queue service base url
    pub qstash_url: String,

    /// Bearer token for the queue API
    pub qstash_token: Option<String>,

    /// Keys used when the request region has no keys of its own
    pub signing_keys: Option<SigningKeys>,

    /// Per-region keys
    pub region_keys: BTreeMap<Region, SigningKeys>,

    /// Origin replacing the request origin when building the workflow url
    pub workflow_url_base: Option<String>,

    /// Queue retries per published step
    pub retries: u32,
}

impl WorkflowConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `QSTASH_URL`: queue base url (default: https://qstash.upstash.io)
    /// - `QSTASH_TOKEN`: queue API token
    /// - `QSTASH_CURRENT_SIGNING_KEY` / `QSTASH_NEXT_SIGNING_KEY`: default signing keys
    /// - `<REGION>_QSTASH_CURRENT_SIGNING_KEY` / `<REGION>_QSTASH_NEXT_SIGNING_KEY`:
    ///   keys for `EU_CENTRAL_1` or `US_EAST_1`
    /// - `UPSTASH_WORKFLOW_URL`: origin override for the workflow url
    /// - `QSTASH_WORKFLOW_RETRIES`: retries per step (default: 3)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build from any variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let key_pair = |prefix: &str| {
            let current = non_empty(&format!("{prefix}QSTASH_CURRENT_SIGNING_KEY"))?;
            let next = non_empty(&format!("{prefix}QSTASH_NEXT_SIGNING_KEY"))?;
            Some(SigningKeys::new(current, next))
        };

        let region_keys = Region::ALL
            .into_iter()
            .filter_map(|region| Some((region, key_pair(&format!("{}_", region.as_str()))?)))
            .collect();

        let retries = match non_empty("QSTASH_WORKFLOW_RETRIES") {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue {
                    name: "QSTASH_WORKFLOW_RETRIES",
                    value,
                })?,
            None => DEFAULT_RETRIES,
        };

        Ok(Self {
            qstash_url: non_empty("QSTASH_URL").unwrap_or_else(|| DEFAULT_QSTASH_URL.to_string()),
            qstash_token: non_empty("QSTASH_TOKEN"),
            signing_keys: key_pair(""),
            region_keys,
            workflow_url_base: non_empty("UPSTASH_WORKFLOW_URL"),
            retries,
        })
    }

    /// Receiver for the configured keys, if any are configured
    pub fn receiver(&self) -> Option<Receiver> {
        if self.signing_keys.is_none() && self.region_keys.is_empty() {
            return None;
        }

        let mut receiver = Receiver::default();
        if let Some(keys) = &self.signing_keys {
            receiver = receiver.with_default_keys(keys.clone());
        }
        for (region, keys) in &self.region_keys {
            receiver = receiver.with_region_keys(*region, keys.clone());
        }
        Some(receiver)
    }

    /// Publisher for the configured queue
    pub fn publisher(&self) -> Result<HttpPublisher, ConfigError> {
        let token = self
            .qstash_token
            .clone()
            .ok_or(ConfigError::Missing("QSTASH_TOKEN"))?;
        Ok(HttpPublisher::new(&self.qstash_url, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<WorkflowConfig, ConfigError> {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkflowConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.qstash_url, DEFAULT_QSTASH_URL);
        assert_eq!(config.qstash_token, None);
        assert_eq!(config.retries, 3);
        assert!(config.receiver().is_none());
        assert_eq!(
            config.publisher().unwrap_err(),
            ConfigError::Missing("QSTASH_TOKEN")
        );
    }

    #[test]
    fn test_keys_need_both_halves() {
        let config = config(&[("QSTASH_CURRENT_SIGNING_KEY", "sig_current")]).unwrap();
        assert!(config.signing_keys.is_none());
        assert!(config.receiver().is_none());
    }

    #[test]
    fn test_regional_keys() {
        let config = config(&[
            ("QSTASH_CURRENT_SIGNING_KEY", "c"),
            ("QSTASH_NEXT_SIGNING_KEY", "n"),
            ("US_EAST_1_QSTASH_CURRENT_SIGNING_KEY", "us_c"),
            ("US_EAST_1_QSTASH_NEXT_SIGNING_KEY", "us_n"),
        ])
        .unwrap();

        assert_eq!(config.region_keys.len(), 1);
        let receiver = config.receiver().unwrap();
        assert_eq!(
            receiver.resolve_keys(Some("us-east-1")).unwrap().current,
            "us_c"
        );
        assert_eq!(
            receiver.resolve_keys(Some("eu-central-1")).unwrap().current,
            "c"
        );
    }

    #[test]
    fn test_invalid_retries() {
        let err = config(&[("QSTASH_WORKFLOW_RETRIES", "many")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                name: "QSTASH_WORKFLOW_RETRIES",
                value: "many".to_string()
            }
        );
    }
}
