use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default = "default_corpora")]
    pub corpora: Vec<String>,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

fn default_corpora() -> Vec<String> {
    vec!["gazette".to_string(), "ruling".to_string()]
}

/// Blob store settings. The `backend` picks the adapter: `s3` talks to an
/// S3-compatible endpoint with SigV4 signing, `filesystem` keeps blobs under
/// a local root (used in tests and single-machine deployments).
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Root directory for the `filesystem` backend.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            root: None,
        }
    }
}

fn default_backend() -> String {
    "s3".to_string()
}
fn default_region() -> String {
    "us-east-1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    /// Directory holding one `<corpus>.vectors.json` snapshot per corpus.
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,
    /// Worker pool size for blob fetches during a cold build.
    #[serde(default = "default_fetch_workers")]
    pub fetch_workers: usize,
    /// Per-fetch timeout in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: default_snapshot_dir(),
            fetch_workers: default_fetch_workers(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("./data/cache")
}
fn default_fetch_workers() -> usize {
    12
}
fn default_fetch_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_limit")]
    pub default_limit: i64,
    #[serde(default)]
    pub score_threshold: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            score_threshold: 0.0,
        }
    }
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7410".to_string()
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    /// Look up a corpus by name, erroring on anything not configured.
    pub fn corpus(&self, name: &str) -> Result<String> {
        if self.corpora.iter().any(|c| c == name) {
            Ok(name.to_string())
        } else {
            anyhow::bail!(
                "Unknown corpus: '{}'. Configured corpora: {}",
                name,
                self.corpora.join(", ")
            )
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.corpora.is_empty() {
        anyhow::bail!("corpora must list at least one corpus");
    }

    // Corpus names become table names, so keep them to safe identifiers.
    for corpus in &config.corpora {
        if corpus.is_empty()
            || !corpus
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            anyhow::bail!(
                "Invalid corpus name '{}': use lowercase ascii, digits, and underscores",
                corpus
            );
        }
    }

    match config.storage.backend.as_str() {
        "s3" => {
            if config.storage.bucket.is_empty() {
                anyhow::bail!("storage.bucket must be set when backend is 's3'");
            }
        }
        "filesystem" => {
            if config.storage.root.is_none() {
                anyhow::bail!("storage.root must be set when backend is 'filesystem'");
            }
        }
        other => anyhow::bail!(
            "Unknown storage backend: '{}'. Must be s3 or filesystem.",
            other
        ),
    }

    if config.cache.fetch_workers == 0 {
        anyhow::bail!("cache.fetch_workers must be > 0");
    }

    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("lexh.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (tmp, path)
    }

    #[test]
    fn test_minimal_filesystem_config() {
        let (_tmp, path) = write_config(
            r#"
[db]
path = "./data/lexh.sqlite"

[storage]
backend = "filesystem"
root = "./blobs"
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.corpora, vec!["gazette", "ruling"]);
        assert_eq!(cfg.cache.fetch_workers, 12);
        assert_eq!(cfg.search.default_limit, 50);
        assert!(!cfg.embedding.is_enabled());
    }

    #[test]
    fn test_rejects_bad_corpus_name() {
        let (_tmp, path) = write_config(
            r#"
corpora = ["gazette", "Bad-Name"]

[db]
path = "./data/lexh.sqlite"

[storage]
backend = "filesystem"
root = "./blobs"
"#,
        );
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("Invalid corpus name"));
    }

    #[test]
    fn test_s3_requires_bucket() {
        let (_tmp, path) = write_config(
            r#"
[db]
path = "./data/lexh.sqlite"

[storage]
backend = "s3"
"#,
        );
        let err = load_config(&path).unwrap_err().to_string();
        assert!(err.contains("storage.bucket"));
    }

    #[test]
    fn test_unknown_corpus_lookup_fails() {
        let (_tmp, path) = write_config(
            r#"
corpora = ["gazette"]

[db]
path = "./data/lexh.sqlite"

[storage]
backend = "filesystem"
root = "./blobs"
"#,
        );
        let cfg = load_config(&path).unwrap();
        assert!(cfg.corpus("gazette").is_ok());
        assert!(cfg.corpus("ruling").is_err());
    }
}
