//! Configuration management for the extraction pipeline

use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{DEFAULT_CAPACITY, DEFAULT_TTL};
use crate::ensemble::{FusionConfig, ScoringWeights};
use crate::recognition::{PreprocessingVariant, ProviderKind};
use crate::routing::{ModelTier, RouterConfig, TierId};

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub providers: ProvidersConfig,
    pub recognition: RecognitionConfig,
    pub decision: ScoringWeights,
    pub fusion: FusionConfig,
    pub router: RouterConfig,
    pub tiers: TiersConfig,
    pub cache: CacheConfig,
    /// Static reliability priors by provider kind
    pub reliability: BTreeMap<ProviderKind, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvidersConfig {
    pub enabled: Vec<ProviderKind>,
    pub tesseract_language: String,
    pub ollama_url: String,
    pub ollama_model: String,
    pub openai_base_url: String,
    #[serde(skip_serializing)]
    pub openai_api_key: Option<String>,
    pub openai_vision_model: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            enabled: vec![ProviderKind::Tesseract, ProviderKind::Ollama, ProviderKind::OpenAiVision],
            tesseract_language: "ces+eng".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3.2-vision".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            openai_api_key: None,
            openai_vision_model: "gpt-4o".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecognitionConfig {
    pub variants: Vec<PreprocessingVariant>,
    pub timeout_secs: u64,
    /// Maximum concurrent recognition tasks; 0 means unbounded
    pub max_concurrency: usize,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            variants: vec![
                PreprocessingVariant::Original,
                PreprocessingVariant::Contrast,
                PreprocessingVariant::Binarize,
            ],
            timeout_secs: 60,
            max_concurrency: 0,
        }
    }
}

impl RecognitionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TiersConfig {
    pub catalog: Vec<ModelTier>,
    /// Overrides of the default fallback chains
    pub fallbacks: BTreeMap<TierId, Vec<TierId>>,
}

impl Default for TiersConfig {
    fn default() -> Self {
        Self {
            catalog: ModelTier::defaults(),
            fallbacks: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl_secs: DEFAULT_TTL.as_secs(),
        }
    }
}

impl Config {
    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load a JSON config file; environment variables still take precedence
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&raw)?;
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = env::var("ENSEMBLE_PROVIDERS") {
            self.providers.enabled = parse_list(&value, "ENSEMBLE_PROVIDERS", ProviderKind::parse)?;
        }
        if let Ok(value) = env::var("ENSEMBLE_VARIANTS") {
            self.recognition.variants = parse_list(&value, "ENSEMBLE_VARIANTS", PreprocessingVariant::parse)?;
        }
        if let Ok(value) = env::var("ENSEMBLE_TESSERACT_LANG") {
            self.providers.tesseract_language = value;
        }
        if let Ok(value) = env::var("OLLAMA_URL") {
            self.providers.ollama_url = value;
        }
        if let Ok(value) = env::var("OLLAMA_MODEL") {
            self.providers.ollama_model = value;
        }
        if let Ok(value) = env::var("OPENAI_BASE_URL") {
            self.providers.openai_base_url = value;
        }
        self.providers.openai_api_key = env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .or(self.providers.openai_api_key.take());

        if let Some(secs) = parse_var::<u64>("ENSEMBLE_OCR_TIMEOUT_SECS")? {
            self.recognition.timeout_secs = secs;
        }
        if let Some(secs) = parse_var::<u64>("ENSEMBLE_MODEL_TIMEOUT_SECS")? {
            self.router.model_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>("ENSEMBLE_CACHE_TTL_SECS")? {
            self.cache.ttl_secs = secs;
            self.router.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(capacity) = parse_var::<usize>("ENSEMBLE_CACHE_CAPACITY")? {
            self.cache.capacity = capacity;
        }
        if let Some(slots) = parse_var::<usize>("ENSEMBLE_MAX_CONCURRENCY")? {
            self.recognition.max_concurrency = slots;
        }
        if let Ok(value) = env::var("ENSEMBLE_TARGET_LANGUAGE") {
            self.router.target_language = value;
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

fn parse_list<T>(value: &str, name: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Vec<T>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            parse(s).ok_or_else(|| ConfigError::InvalidValue {
                name: name.to_string(),
                value: s.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.decision.validate().is_ok());
        assert_eq!(config.cache.ttl_secs, 24 * 60 * 60);
        assert_eq!(config.router.model_timeout, Duration::from_secs(30));
        assert_eq!(config.tiers.catalog.len(), 6);
        assert!(config.providers.enabled.contains(&ProviderKind::Tesseract));
    }

    #[test]
    fn test_parse_list() {
        let kinds = parse_list("tesseract, ollama", "X", ProviderKind::parse).unwrap();
        assert_eq!(kinds, vec![ProviderKind::Tesseract, ProviderKind::Ollama]);

        let err = parse_list("tesseract,abbyy", "X", ProviderKind::parse).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref value, .. } if value == "abbyy"));
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "recognition": {{ "variants": ["original", "binarize"], "maxConcurrency": 4 }},
                "router": {{ "modelTimeout": 10, "targetLanguage": "de" }},
                "cache": {{ "capacity": 50 }}
            }}"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(
            config.recognition.variants,
            vec![PreprocessingVariant::Original, PreprocessingVariant::Binarize]
        );
        assert_eq!(config.recognition.max_concurrency, 4);
        assert_eq!(config.cache.capacity, 50);
        // untouched sections keep their defaults
        assert_eq!(config.recognition.timeout_secs, 60);
        assert_eq!(config.tiers.catalog.len(), 6);
    }

    #[test]
    fn test_from_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(Config::from_file(file.path()), Err(ConfigError::Parse(_))));
    }
}
