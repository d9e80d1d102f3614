use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Process-wide settings. Every field has a default; YAML and environment override them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub llm_base_url: String,
    pub llm_model: String,
    pub llm_api_key: Option<String>,
    pub llm_temperature: f32,
    pub llm_max_tokens: usize,
    pub llm_timeout_secs: u64,

    /// Unset means the built-in hashed embedding.
    pub embedding_base_url: Option<String>,
    pub embedding_model: String,
    pub embedding_api_key: Option<String>,
    pub embed_dim: usize,
    /// Texts per `/embeddings` request.
    pub embedding_batch_size: usize,

    pub vector_store_path: PathBuf,
    /// Write `indexed_content.json` next to each saved index.
    pub dump_indexed_content: bool,
    pub retrieval_k: usize,
    pub max_fix_attempts: u32,
    pub summary_sample_rows: usize,
    pub default_max_rows: usize,

    pub api_host: String,
    pub api_port: u16,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            llm_base_url: "https://api.openai.com/v1".into(),
            llm_model: "gpt-4".into(),
            llm_api_key: None,
            llm_temperature: 0.1,
            llm_max_tokens: 2000,
            llm_timeout_secs: 60,
            embedding_base_url: None,
            embedding_model: "text-embedding-3-small".into(),
            embedding_api_key: None,
            embed_dim: 1024,
            embedding_batch_size: 1000,
            vector_store_path: PathBuf::from("./data/vector_store"),
            dump_indexed_content: false,
            retrieval_k: 10,
            max_fix_attempts: 5,
            summary_sample_rows: 10,
            default_max_rows: 100,
            api_host: "0.0.0.0".into(),
            api_port: 5556,
            log_level: "info".into(),
        }
    }
}

fn parse_var<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value })
}

impl Settings {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_yaml::from_str(&text)?)
    }

    /// `GENBI_CONFIG` file (if set) with environment overrides on top.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    pub fn load_with(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut settings = match var("GENBI_CONFIG") {
            Some(path) => Self::from_path(path)?,
            None => Self::default(),
        };
        settings.apply_overrides(var)?;
        Ok(settings)
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = var("LLM_BASE_URL") {
            self.llm_base_url = v;
        }
        if let Some(v) = var("LLM_MODEL") {
            self.llm_model = v;
        }
        if let Some(v) = var("LLM_API_KEY") {
            self.llm_api_key = Some(v);
        }
        if let Some(v) = var("LLM_TIMEOUT_SECS") {
            self.llm_timeout_secs = parse_var("LLM_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = var("EMBEDDING_BASE_URL") {
            self.embedding_base_url = Some(v).filter(|s| !s.is_empty());
        }
        if let Some(v) = var("EMBEDDING_MODEL") {
            self.embedding_model = v;
        }
        if let Some(v) = var("EMBEDDING_API_KEY") {
            self.embedding_api_key = Some(v);
        }
        if let Some(v) = var("EMBED_DIM") {
            self.embed_dim = parse_var("EMBED_DIM", v)?;
        }
        if let Some(v) = var("EMBEDDING_BATCH_SIZE") {
            self.embedding_batch_size = parse_var("EMBEDDING_BATCH_SIZE", v)?;
        }
        if let Some(v) = var("VECTOR_STORE_PATH") {
            self.vector_store_path = PathBuf::from(v);
        }
        if let Some(v) = var("DUMP_INDEXED_CONTENT") {
            self.dump_indexed_content = parse_var("DUMP_INDEXED_CONTENT", v.to_lowercase())?;
        }
        if let Some(v) = var("MAX_FIX_ATTEMPTS") {
            self.max_fix_attempts = parse_var("MAX_FIX_ATTEMPTS", v)?;
        }
        if let Some(v) = var("API_HOST") {
            self.api_host = v;
        }
        if let Some(v) = var("API_PORT") {
            self.api_port = parse_var("API_PORT", v)?;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v.to_lowercase();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_without_env() {
        let s = Settings::load_with(|_| None).unwrap();
        assert_eq!(s.api_port, 5556);
        assert_eq!(s.max_fix_attempts, 5);
        assert_eq!(s.retrieval_k, 10);
        assert!(s.embedding_base_url.is_none());
        assert_eq!(s.embedding_batch_size, 1000);
        assert!(!s.dump_indexed_content);
    }

    #[test]
    fn batch_size_and_dump_from_env() {
        let env: HashMap<&str, &str> = [("EMBEDDING_BATCH_SIZE", "250"), ("DUMP_INDEXED_CONTENT", "TRUE")]
            .into_iter()
            .collect();
        let s = Settings::load_with(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(s.embedding_batch_size, 250);
        assert!(s.dump_indexed_content);
    }

    #[test]
    fn yaml_then_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genbi.yaml");
        fs::write(&path, "llm_model: local-llama\nmax_fix_attempts: 3\napi_port: 9000\n").unwrap();

        let env: HashMap<&str, String> = [
            ("GENBI_CONFIG", path.display().to_string()),
            ("API_PORT", "7000".to_string()),
            ("LOG_LEVEL", "DEBUG".to_string()),
        ]
        .into_iter()
        .collect();
        let s = Settings::load_with(|k| env.get(k).cloned()).unwrap();
        assert_eq!(s.llm_model, "local-llama");
        assert_eq!(s.max_fix_attempts, 3);
        assert_eq!(s.api_port, 7000);
        assert_eq!(s.log_level, "debug");
        assert_eq!(s.embed_dim, 1024);
    }

    #[test]
    fn bad_number_is_reported() {
        let err = Settings::load_with(|k| (k == "EMBED_DIM").then(|| "wide".to_string())).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { key: "EMBED_DIM", .. }));
    }
}
