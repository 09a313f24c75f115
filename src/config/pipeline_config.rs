use dicom_core::dictionary::DataDictionary;
use dicom_dictionary_std::StandardDataDictionary;
use dimse::RemoteNode;
use serde::Deserialize;
use std::time::Duration;

use crate::config::ConfigError;
use crate::relay::RetryPolicy;

/// Represents the `[inference]` section
#[derive(Debug, Deserialize)]
pub struct InferenceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a submitted run may take before the work item fails
    #[serde(default = "default_result_timeout_ms")]
    pub result_timeout_ms: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model_id: String::new(),
            api_key: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            result_timeout_ms: default_result_timeout_ms(),
        }
    }
}

impl InferenceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::MissingInferenceSetting("base_url"));
        }
        if self.model_id.trim().is_empty() {
            return Err(ConfigError::MissingInferenceSetting("model_id"));
        }
        url::Url::parse(&self.base_url)
            .map_err(|e| ConfigError::InvalidValue(format!("inference.base_url: {}", e)))?;
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_millis(self.result_timeout_ms)
    }
}

/// Represents the `[relay]` section: worker pool, retries and reply target
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Port the original sender listens on for the reply
    #[serde(default = "default_reply_port")]
    pub reply_port: u16,
    /// Fixed reply destination; otherwise the calling AE at the peer address
    #[serde(default)]
    pub destination: Option<RemoteNode>,
    /// How long a worker's claim on an item holds without progress
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            reply_port: default_reply_port(),
            destination: None,
            claim_lease_secs: default_claim_lease_secs(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::NoRetryAttempts);
        }
        if self.reply_port == 0 {
            return Err(ConfigError::InvalidPort("relay.reply_port must be greater than 0".into()));
        }
        if self.claim_lease_secs == 0 {
            return Err(ConfigError::InvalidValue("relay.claim_lease_secs must be at least 1".into()));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::InvalidValue(
                "relay.base_backoff_ms cannot exceed relay.max_backoff_ms".into(),
            ));
        }
        if let Some(destination) = &self.destination {
            destination
                .validate()
                .map_err(|e| ConfigError::InvalidValue(format!("relay.destination: {}", e)))?;
        }
        Ok(())
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}

/// Represents the `[channels]` section
#[derive(Debug, Deserialize)]
pub struct ChannelsConfig {
    /// Attribute keyword whose value names the channel of each instance
    #[serde(default = "default_channel_tag")]
    pub tag: String,
    /// Channels that must be present before a session is forwarded
    #[serde(default)]
    pub required: Vec<String>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            tag: default_channel_tag(),
            required: Vec::new(),
        }
    }
}

impl ChannelsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if StandardDataDictionary.by_name(self.tag.trim()).is_none() {
            return Err(ConfigError::InvalidValue(format!(
                "channels.tag '{}' is not a DICOM attribute keyword",
                self.tag
            )));
        }
        if self.required.iter().any(|c| c.trim().is_empty()) {
            return Err(ConfigError::InvalidValue("channels.required has a blank entry".into()));
        }
        Ok(())
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_result_timeout_ms() -> u64 {
    3_600_000 // 1 hour
}

fn default_workers() -> usize {
    2
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_reply_port() -> u16 {
    104
}

fn default_claim_lease_secs() -> u64 {
    600
}

fn default_channel_tag() -> String {
    "Modality".to_string()
}
