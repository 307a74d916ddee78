//! Blob store adapters.
//!
//! The pipeline core consumes a small blob-store contract: resolve a key to
//! a fetchable URL, fetch bytes, check existence, delete. Absence is always
//! a normal (non-exceptional) outcome; only missing credentials are fatal,
//! and they fail at construction time rather than masquerading as `false`.
//!
//! Two backends implement [`BlobStore`]:
//!
//! - **[`S3BlobStore`]** — talks to an S3-compatible endpoint using the REST
//!   API with AWS Signature V4 authentication. Uses only pure-Rust
//!   dependencies (`hmac`, `sha2`) for signing, and supports custom
//!   endpoints for MinIO / LocalStack.
//! - **[`FsBlobStore`]** — keeps blobs under a local directory root. Used in
//!   tests and single-machine deployments.
//!
//! # Environment Variables (S3)
//!
//! - `AWS_ACCESS_KEY_ID` — required
//! - `AWS_SECRET_ACCESS_KEY` — required
//! - `AWS_SESSION_TOKEN` — optional (for temporary credentials / IAM roles)
//!
//! # Ambiguous 403s
//!
//! Some S3-compatible providers answer `HEAD` on a key with `403` whether or
//! not the object exists, depending on bucket policy. A `403` is therefore
//! treated as *uncertain* and verified with a one-byte ranged `GET` probe
//! before reporting existence.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{CacheConfig, StorageConfig};

type HmacSha256 = Hmac<Sha256>;

/// The blob-store contract consumed by the reconciler and the cache build.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Backend identifier for logs (`"s3"` or `"filesystem"`).
    fn backend(&self) -> &str;

    /// Resolve a key to a fetchable URL, or `None` when the key can never
    /// resolve (empty key).
    fn resolve_url(&self, key: &str) -> Option<String>;

    /// Fetch a blob by resolved URL. `Ok(None)` means the blob does not
    /// exist; `Err` is a transport failure.
    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>>;

    /// Check whether a key exists. Absence is `Ok(false)`, never an error.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete a key. Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Build the configured blob store backend.
///
/// S3 credentials are read from the environment here, so a missing
/// configuration fails at the first operation that needs the store instead
/// of turning every later check into a silent `false`.
pub fn create_store(
    storage: &StorageConfig,
    cache: &CacheConfig,
) -> Result<Arc<dyn BlobStore>> {
    match storage.backend.as_str() {
        "s3" => Ok(Arc::new(S3BlobStore::new(
            storage.clone(),
            Duration::from_secs(cache.fetch_timeout_secs),
        )?)),
        "filesystem" => {
            let root = storage
                .root
                .clone()
                .ok_or_else(|| anyhow::anyhow!("storage.root required for filesystem backend"))?;
            Ok(Arc::new(FsBlobStore { root }))
        }
        other => anyhow::bail!("Unknown storage backend: {}", other),
    }
}

// ============ Filesystem backend ============

/// Blob store rooted at a local directory; keys are relative paths.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn backend(&self) -> &str {
        "filesystem"
    }

    fn resolve_url(&self, key: &str) -> Option<String> {
        if key.is_empty() {
            return None;
        }
        Some(self.key_path(key).to_string_lossy().to_string())
    }

    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(url).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read blob at {}", url)),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        Ok(tokio::fs::try_exists(self.key_path(key)).await?)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.key_path(key)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to delete blob {}", key)),
        }
    }
}

// ============ S3 backend ============

/// AWS credentials loaded from environment variables.
struct AwsCredentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsCredentials {
    fn from_env() -> Result<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID")
            .context("AWS_ACCESS_KEY_ID environment variable not set")?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY")
            .context("AWS_SECRET_ACCESS_KEY environment variable not set")?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok();

        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token,
        })
    }
}

/// S3-compatible blob store using SigV4-signed REST calls.
pub struct S3BlobStore {
    config: StorageConfig,
    creds: AwsCredentials,
    client: reqwest::Client,
}

impl S3BlobStore {
    pub fn new(config: StorageConfig, timeout: Duration) -> Result<Self> {
        let creds = AwsCredentials::from_env()?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            config,
            creds,
            client,
        })
    }

    /// Compute the S3 hostname for the configured bucket and region.
    ///
    /// A custom `endpoint_url` (MinIO, LocalStack) overrides the standard
    /// `<bucket>.s3.<region>.amazonaws.com` host.
    fn host(&self) -> String {
        if let Some(ref endpoint) = self.config.endpoint_url {
            endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .trim_end_matches('/')
                .to_string()
        } else {
            format!(
                "{}.s3.{}.amazonaws.com",
                self.config.bucket, self.config.region
            )
        }
    }

    fn object_url(&self, key: &str) -> String {
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        format!("https://{}/{}", self.host(), encoded_key)
    }

    /// Recover the raw object key from a URL produced by [`Self::object_url`].
    ///
    /// The URL path is percent-encoded; the key must be decoded here or
    /// [`Self::signed_request`] would encode it a second time (`%20` →
    /// `%2520`) and sign a request for a nonexistent object.
    fn key_from_url(&self, url: &str) -> Option<String> {
        let prefix = format!("https://{}/", self.host());
        url.strip_prefix(prefix.as_str()).map(uri_decode)
    }

    /// Build a SigV4-signed request for one object.
    fn signed_request(
        &self,
        method: reqwest::Method,
        key: &str,
        extra_headers: &[(&str, &str)],
    ) -> reqwest::RequestBuilder {
        let host = self.host();
        let encoded_key = key.split('/').map(uri_encode).collect::<Vec<_>>().join("/");
        let url = format!("https://{}/{}", host, encoded_key);

        let now = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let payload_hash = hex_sha256(b"");

        let mut headers = vec![
            ("host".to_string(), host.clone()),
            ("x-amz-content-sha256".to_string(), payload_hash.clone()),
            ("x-amz-date".to_string(), amz_date.clone()),
        ];
        for (k, v) in extra_headers {
            headers.push((k.to_lowercase(), v.to_string()));
        }
        if let Some(ref token) = self.creds.session_token {
            headers.push(("x-amz-security-token".to_string(), token.clone()));
        }
        headers.sort_by(|a, b| a.0.cmp(&b.0));

        let signed_headers: String = headers
            .iter()
            .map(|(k, _)| k.as_str())
            .collect::<Vec<_>>()
            .join(";");

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v))
            .collect();

        let canonical_uri = format!("/{}", encoded_key);
        let canonical_request = format!(
            "{}\n{}\n\n{}\n{}\n{}",
            method.as_str(),
            canonical_uri,
            canonical_headers,
            signed_headers,
            payload_hash
        );

        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            credential_scope,
            hex_sha256(canonical_request.as_bytes())
        );

        let signing_key = derive_signing_key(
            &self.creds.secret_access_key,
            &date_stamp,
            &self.config.region,
            "s3",
        );
        let signature = hex_hmac_sha256(&signing_key, string_to_sign.as_bytes());

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.creds.access_key_id, credential_scope, signed_headers, signature
        );

        let mut req = self
            .client
            .request(method, &url)
            .header("Authorization", &authorization)
            .header("x-amz-content-sha256", &payload_hash)
            .header("x-amz-date", &amz_date);

        for (k, v) in extra_headers {
            req = req.header(*k, *v);
        }
        if let Some(ref token) = self.creds.session_token {
            req = req.header("x-amz-security-token", token);
        }
        req
    }

    /// Verify an ambiguous `HEAD` answer with a one-byte ranged `GET`.
    async fn probe_with_ranged_get(&self, key: &str) -> Result<bool> {
        let resp = self
            .signed_request(reqwest::Method::GET, key, &[("Range", "bytes=0-0")])
            .send()
            .await
            .with_context(|| format!("Ranged GET probe failed for key '{}'", key))?;

        let status = resp.status();
        Ok(status.is_success() || status.as_u16() == 206)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn backend(&self) -> &str {
        "s3"
    }

    fn resolve_url(&self, key: &str) -> Option<String> {
        if key.is_empty() {
            return None;
        }
        Some(self.object_url(key))
    }

    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let key = self
            .key_from_url(url)
            .ok_or_else(|| anyhow::anyhow!("URL '{}' does not belong to this bucket", url))?;

        let resp = self
            .signed_request(reqwest::Method::GET, &key, &[])
            .send()
            .await
            .with_context(|| format!("GetObject failed for key '{}'", key))?;

        let status = resp.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            anyhow::bail!("S3 GetObject failed (HTTP {}) for key '{}'", status, key);
        }

        Ok(Some(resp.bytes().await?.to_vec()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }

        let resp = self
            .signed_request(reqwest::Method::HEAD, key, &[])
            .send()
            .await
            .with_context(|| format!("HeadObject failed for key '{}'", key))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(true);
        }
        if status.as_u16() == 404 {
            return Ok(false);
        }
        // Bucket-policy dependent: some providers answer HEAD with 403 for
        // both present and missing keys. Uncertain — verify with a probe.
        if status.as_u16() == 403 {
            return self.probe_with_ranged_get(key).await;
        }
        anyhow::bail!("S3 HeadObject failed (HTTP {}) for key '{}'", status, key);
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        if key.is_empty() {
            return Ok(false);
        }

        let existed = self.exists(key).await.unwrap_or(false);
        let resp = self
            .signed_request(reqwest::Method::DELETE, key, &[])
            .send()
            .await
            .with_context(|| format!("DeleteObject failed for key '{}'", key))?;

        let status = resp.status();
        if !status.is_success() && status.as_u16() != 404 {
            anyhow::bail!("S3 DeleteObject failed (HTTP {}) for key '{}'", status, key);
        }
        Ok(existed)
    }
}

// ============ AWS SigV4 helpers ============

fn hex_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hex_hmac_sha256(key: &[u8], data: &[u8]) -> String {
    hex::encode(hmac_sha256(key, data))
}

/// Derive the AWS SigV4 signing key for a given date, region, and service.
///
/// ```text
/// kDate    = HMAC("AWS4" + secret, dateStamp)
/// kRegion  = HMAC(kDate, region)
/// kService = HMAC(kRegion, service)
/// kSigning = HMAC(kService, "aws4_request")
/// ```
fn derive_signing_key(secret_key: &str, date_stamp: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac_sha256(
        format!("AWS4{}", secret_key).as_bytes(),
        date_stamp.as_bytes(),
    );
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, service.as_bytes());
    hmac_sha256(&k_service, b"aws4_request")
}

/// URI-encode a string per RFC 3986 (used in SigV4 canonical requests).
fn uri_encode(s: &str) -> String {
    let mut result = String::new();
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                result.push(byte as char);
            }
            _ => {
                result.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    result
}

/// Percent-decode a string produced by [`uri_encode`]. Works on raw bytes
/// so multi-byte UTF-8 sequences reassemble correctly.
fn uri_decode(s: &str) -> String {
    fn hex_val(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ============ Pass-scoped existence cache ============

/// Memoizes existence checks for the duration of one reconciliation pass.
///
/// Created by the pass, passed by value into it, and dropped at the end —
/// results never leak across unrelated passes. A failed check is recorded
/// as "does not exist" for that key and logged once.
pub struct ExistenceCache {
    seen: HashMap<String, bool>,
}

impl ExistenceCache {
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
        }
    }

    /// Check a key, consulting the memo first.
    pub async fn check(&mut self, store: &dyn BlobStore, key: &str) -> bool {
        if let Some(&cached) = self.seen.get(key) {
            return cached;
        }
        let exists = match store.exists(key).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, error = %e, "existence check failed; treating as absent");
                false
            }
        };
        self.seen.insert(key.to_string(), exists);
        exists
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for ExistenceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_store_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path().to_path_buf());

        std::fs::write(tmp.path().join("raw_1.pdf"), b"pdf bytes").unwrap();

        assert!(store.exists("raw_1.pdf").await.unwrap());
        assert!(!store.exists("raw_2.pdf").await.unwrap());

        let url = store.resolve_url("raw_1.pdf").unwrap();
        let bytes = store.fetch(&url).await.unwrap();
        assert_eq!(bytes, Some(b"pdf bytes".to_vec()));

        assert!(store.delete("raw_1.pdf").await.unwrap());
        assert!(!store.delete("raw_1.pdf").await.unwrap());
        assert!(!store.exists("raw_1.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_store_absence_is_not_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path().to_path_buf());

        let url = store.resolve_url("missing.bin").unwrap();
        assert_eq!(store.fetch(&url).await.unwrap(), None);
        assert!(!store.exists("missing.bin").await.unwrap());
        assert_eq!(store.resolve_url(""), None);
    }

    #[tokio::test]
    async fn test_existence_cache_memoizes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsBlobStore::new(tmp.path().to_path_buf());
        std::fs::write(tmp.path().join("a.bin"), b"x").unwrap();

        let mut cache = ExistenceCache::new();
        assert!(cache.check(&store, "a.bin").await);

        // Delete out-of-band; the memoized answer must hold for the pass.
        std::fs::remove_file(tmp.path().join("a.bin")).unwrap();
        assert!(cache.check(&store, "a.bin").await);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_uri_encode_preserves_unreserved() {
        assert_eq!(uri_encode("abc-123_~.X"), "abc-123_~.X");
        assert_eq!(uri_encode("a b/c"), "a%20b%2Fc");
    }

    #[test]
    fn test_uri_decode_inverts_encode() {
        for raw in ["JO 45.pdf", "arrêt_2024.pdf", "a+b&c (final).bin", "plain"] {
            assert_eq!(uri_decode(&uri_encode(raw)), raw);
        }
        // Stray percent signs pass through untouched.
        assert_eq!(uri_decode("100%"), "100%");
        assert_eq!(uri_decode("%zz"), "%zz");
    }

    #[test]
    fn test_s3_key_url_roundtrip_with_reserved_characters() {
        std::env::set_var("AWS_ACCESS_KEY_ID", "test-key");
        std::env::set_var("AWS_SECRET_ACCESS_KEY", "test-secret");

        let store = S3BlobStore::new(
            StorageConfig {
                backend: "s3".to_string(),
                bucket: "legal-artifacts".to_string(),
                ..StorageConfig::default()
            },
            Duration::from_secs(5),
        )
        .unwrap();

        // Keys with spaces and non-ASCII bytes, typical of gazette
        // filenames, must survive resolve_url → key_from_url unchanged so
        // the signed fetch targets the real object.
        for key in ["gazette/JO 45.pdf", "ruling/arrêt_2024.pdf", "raw_1.pdf"] {
            let url = store.resolve_url(key).unwrap();
            assert_eq!(store.key_from_url(&url).as_deref(), Some(key));
        }
        assert_eq!(store.key_from_url("https://elsewhere.example/k"), None);
    }

    #[test]
    fn test_derive_signing_key_is_deterministic() {
        let a = derive_signing_key("secret", "20260826", "eu-west-1", "s3");
        let b = derive_signing_key("secret", "20260826", "eu-west-1", "s3");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }
}
