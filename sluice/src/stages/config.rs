//! Strongly typed per-pipeline and per-stage configuration.
//!
//! Every knob has an explicit default and is validated at registration
//! time, not at run time.

use crate::errors::EtlError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Effective configuration for one pipeline's executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Records per transform/load batch for finite extractions.
    pub batch_size: usize,
    /// Abort the run on the first batch/element failure instead of
    /// accumulating failures.
    pub stop_on_error: bool,
    /// Maximum recorded errors before a continuing run is failed anyway.
    pub max_errors: usize,
    /// Retries per stage operation after the initial attempt.
    pub max_retries: usize,
    /// Base delay between retries; grows with backoff.
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    /// Extractor-specific settings.
    pub extractor: ExtractorConfig,
    /// Transformer-specific settings.
    pub transformer: TransformerConfig,
    /// Loader-specific settings.
    pub loader: LoaderConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            stop_on_error: false,
            max_errors: 100,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            extractor: ExtractorConfig::default(),
            transformer: TransformerConfig::default(),
            loader: LoaderConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the stop-on-error flag.
    #[must_use]
    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    /// Sets the error budget for continuing runs.
    #[must_use]
    pub fn with_max_errors(mut self, max_errors: usize) -> Self {
        self.max_errors = max_errors;
        self
    }

    /// Sets the per-operation retry count.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the base retry delay.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the extractor config.
    #[must_use]
    pub fn with_extractor(mut self, extractor: ExtractorConfig) -> Self {
        self.extractor = extractor;
        self
    }

    /// Sets the transformer config.
    #[must_use]
    pub fn with_transformer(mut self, transformer: TransformerConfig) -> Self {
        self.transformer = transformer;
        self
    }

    /// Sets the loader config.
    #[must_use]
    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    /// Validates the configuration. Called at registration.
    pub fn validate(&self) -> Result<(), EtlError> {
        if self.batch_size == 0 {
            return Err(EtlError::InvalidDefinition(
                "batch_size must be at least 1".to_string(),
            ));
        }
        if !self.stop_on_error && self.max_errors == 0 {
            return Err(EtlError::InvalidDefinition(
                "max_errors must be at least 1 when stop_on_error is false".to_string(),
            ));
        }
        self.extractor.validate()?;
        Ok(())
    }
}

/// Extractor-side settings: request budget against the external source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractorConfig {
    /// Requests-per-second budget; `None` means unthrottled.
    pub requests_per_second: Option<u32>,
    /// Requests-per-minute budget; the stricter of the two wins.
    pub requests_per_minute: Option<u32>,
}

impl ExtractorConfig {
    /// Creates an unthrottled extractor config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-second budget.
    #[must_use]
    pub fn with_requests_per_second(mut self, rps: u32) -> Self {
        self.requests_per_second = Some(rps);
        self
    }

    /// Sets the per-minute budget.
    #[must_use]
    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = Some(rpm);
        self
    }

    fn validate(&self) -> Result<(), EtlError> {
        if self.requests_per_second == Some(0) || self.requests_per_minute == Some(0) {
            return Err(EtlError::InvalidDefinition(
                "rate limits must be non-zero when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Transformer-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// Drop `null` records from transformer output instead of loading
    /// them. On by default; transformers signal "filter me out" by
    /// returning `null` in place of a record.
    pub skip_nulls: bool,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self { skip_nulls: true }
    }
}

impl TransformerConfig {
    /// Creates a transformer config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets null-record filtering.
    #[must_use]
    pub fn with_skip_nulls(mut self, skip: bool) -> Self {
        self.skip_nulls = skip;
        self
    }
}

/// Loader-side settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Hint that the destination should update existing rows rather than
    /// insert blindly. Loaders read this from the stage context.
    pub upsert: bool,
}

impl LoaderConfig {
    /// Creates a loader config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the upsert hint.
    #[must_use]
    pub fn with_upsert(mut self, upsert: bool) -> Self {
        self.upsert = upsert;
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        u64::try_from(d.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.batch_size, 100);
        assert!(!config.stop_on_error);
        assert_eq!(config.max_retries, 3);
        assert!(config.transformer.skip_nulls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = PipelineConfig::new().with_batch_size(0);
        assert!(matches!(
            config.validate(),
            Err(EtlError::InvalidDefinition(_))
        ));
    }

    #[test]
    fn test_zero_error_budget_rejected_when_continuing() {
        let config = PipelineConfig::new().with_max_errors(0);
        assert!(config.validate().is_err());

        // With stop_on_error the budget is unused.
        let config = PipelineConfig::new().with_max_errors(0).with_stop_on_error(true);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_rate_limit_rejected() {
        let config = PipelineConfig::new()
            .with_extractor(ExtractorConfig::new().with_requests_per_second(0));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_delay_roundtrips_through_json() {
        let config = PipelineConfig::new().with_retry_delay(Duration::from_millis(250));
        let json = serde_json::to_value(&config).unwrap();
        let back: PipelineConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.retry_delay, Duration::from_millis(250));
    }
}
