use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reindex: ReindexConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap_tokens")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    400
}
fn default_overlap_tokens() -> usize {
    40
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Vector dimensionality; required for models without a built-in entry.
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashed".to_string(),
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: default_url(),
            api_key_env: default_api_key_env(),
        }
    }
}

fn default_provider() -> String {
    "hashed".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_url() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReindexConfig {
    /// Concurrent rebuild jobs across all collections.
    #[serde(default = "default_max_concurrent_rebuilds")]
    pub max_concurrent_rebuilds: usize,
}

impl Default for ReindexConfig {
    fn default() -> Self {
        Self {
            max_concurrent_rebuilds: default_max_concurrent_rebuilds(),
        }
    }
}

fn default_max_concurrent_rebuilds() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_similarity_threshold")]
    pub default_similarity_threshold: f32,
    /// Per-query wall-clock budget; 0 disables the timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_similarity_threshold: default_similarity_threshold(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_limit() -> usize {
    10
}
fn default_similarity_threshold() -> f32 {
    0.7
}
fn default_timeout_ms() -> u64 {
    0
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0 when set");
    }
    match config.embedding.provider.as_str() {
        "remote" | "hashed" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be remote or hashed.",
            other
        ),
    }

    if config.reindex.max_concurrent_rebuilds == 0 {
        anyhow::bail!("reindex.max_concurrent_rebuilds must be > 0");
    }

    if !(1..=100).contains(&config.search.default_limit) {
        anyhow::bail!("search.default_limit must be in [1, 100]");
    }
    if !(0.0..=1.0).contains(&config.search.default_similarity_threshold) {
        anyhow::bail!("search.default_similarity_threshold must be in [0.0, 1.0]");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.chunking.max_tokens, 400);
        assert_eq!(config.chunking.overlap_tokens, 40);
        assert_eq!(config.embedding.provider, "hashed");
        assert_eq!(config.embedding.batch_size, 64);
        assert_eq!(config.reindex.max_concurrent_rebuilds, 4);
        assert_eq!(config.search.default_limit, 10);
        assert!((config.search.default_similarity_threshold - 0.7).abs() < 1e-6);
    }

    #[test]
    fn partial_sections_fill_in() {
        let config: Config = toml::from_str(
            r#"
            [chunking]
            max_tokens = 200

            [embedding]
            provider = "remote"
            dims = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.chunking.max_tokens, 200);
        assert_eq!(config.chunking.overlap_tokens, 40);
        assert_eq!(config.embedding.provider, "remote");
        assert_eq!(config.embedding.dims, Some(8));
        assert_eq!(config.embedding.max_retries, 5);
    }

    #[test]
    fn load_rejects_bad_values() {
        let dir = std::env::temp_dir();
        let path = dir.join("corpora-config-test.toml");
        std::fs::write(&path, "[chunking]\nmax_tokens = 0\n").unwrap();
        assert!(load_config(&path).is_err());
        std::fs::write(&path, "[embedding]\nprovider = \"quantum\"\n").unwrap();
        assert!(load_config(&path).is_err());
        std::fs::write(&path, "[search]\ndefault_limit = 500\n").unwrap();
        assert!(load_config(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
