use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evintake_contracts::canonical::is_sha256_hex;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use ulid::Ulid;

type HmacSha256 = Hmac<Sha256>;

const MAX_PATH_LEN: usize = 512;
const PATH_PREFIXES: [&str; 2] = ["evidence/", "exports/"];

#[derive(Debug)]
pub enum BlobError {
    Io(std::io::Error),
    InvalidPath(String),
    InvalidKey,
    NotFound,
    InvalidSignature,
    Expired,
}

impl std::fmt::Display for BlobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobError::Io(err) => write!(f, "blob io error: {}", err),
            BlobError::InvalidPath(path) => write!(f, "invalid blob path `{}`", path),
            BlobError::InvalidKey => write!(f, "presign key is not usable"),
            BlobError::NotFound => write!(f, "blob not found"),
            BlobError::InvalidSignature => write!(f, "blob url signature is invalid"),
            BlobError::Expired => write!(f, "blob url has expired"),
        }
    }
}

impl std::error::Error for BlobError {}

impl From<std::io::Error> for BlobError {
    fn from(value: std::io::Error) -> Self {
        if value.kind() == std::io::ErrorKind::NotFound {
            return BlobError::NotFound;
        }
        BlobError::Io(value)
    }
}

/// Object storage for evidence files and export packages.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores content-addressed bytes and returns the storage path. Storing the
    /// same hash twice is a no-op that returns the same path.
    async fn put(&self, bytes: &[u8], sha256_hex: &str, mime: &str) -> Result<String, BlobError>;

    async fn put_at(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError>;

    async fn get(&self, path: &str) -> Result<Vec<u8>, BlobError>;

    /// Removing a missing path succeeds.
    async fn delete(&self, path: &str) -> Result<(), BlobError>;

    fn presign(&self, path: &str, ttl: Duration) -> Result<String, BlobError>;

    async fn health(&self) -> bool;
}

pub fn evidence_path(sha256_hex: &str) -> String {
    format!("evidence/{}/{}", &sha256_hex[..2], sha256_hex)
}

pub fn export_path(export_id: &str) -> String {
    format!("exports/{}.zip", export_id)
}

pub fn validate_path(path: &str) -> Result<(), BlobError> {
    let invalid = || BlobError::InvalidPath(path.chars().take(64).collect());

    if path.is_empty() || path.len() > MAX_PATH_LEN {
        return Err(invalid());
    }
    if !PATH_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return Err(invalid());
    }
    for segment in path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(invalid());
        }
        if !segment
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Signs and verifies time-limited blob URLs:
/// `{base}/v1/blobs/{path}?expires=<unix>&sig=<hex hmac(path \n expires)>`.
#[derive(Clone)]
pub struct UrlSigner {
    mac: HmacSha256,
    base_url: String,
}

impl UrlSigner {
    pub fn new(secret: &[u8], base_url: &str) -> Result<Self, BlobError> {
        if secret.is_empty() {
            return Err(BlobError::InvalidKey);
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| BlobError::InvalidKey)?;
        Ok(Self {
            mac,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn signature(&self, path: &str, expires: i64) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(path.as_bytes());
        mac.update(b"\n");
        mac.update(expires.to_string().as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    pub fn presign_at(
        &self,
        path: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, BlobError> {
        validate_path(path)?;
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = now.timestamp().saturating_add(ttl_secs);
        let sig = hex::encode(self.signature(path, expires));
        Ok(format!(
            "{}/v1/blobs/{}?expires={}&sig={}",
            self.base_url, path, expires, sig
        ))
    }

    pub fn verify_at(
        &self,
        path: &str,
        expires: i64,
        sig_hex: &str,
        now: DateTime<Utc>,
    ) -> Result<(), BlobError> {
        validate_path(path)?;
        let provided = hex::decode(sig_hex.trim()).map_err(|_| BlobError::InvalidSignature)?;
        let expected = self.signature(path, expires);
        if !bool::from(provided.as_slice().ct_eq(expected.as_slice())) {
            return Err(BlobError::InvalidSignature);
        }
        if now.timestamp() > expires {
            return Err(BlobError::Expired);
        }
        Ok(())
    }
}

/// Blob store rooted at a local directory.
#[derive(Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    signer: UrlSigner,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, signer: UrlSigner) -> Self {
        Self {
            root: root.into(),
            signer,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, BlobError> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }

    async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<(), BlobError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = target.with_extension(format!("tmp-{}", Ulid::new()));
        if let Err(err) = tokio::fs::write(&tmp, bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(BlobError::Io(err));
        }
        if let Err(err) = tokio::fs::rename(&tmp, target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(BlobError::Io(err));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: &[u8], sha256_hex: &str, mime: &str) -> Result<String, BlobError> {
        if !is_sha256_hex(sha256_hex) {
            return Err(BlobError::InvalidPath(sha256_hex.chars().take(64).collect()));
        }
        let path = evidence_path(sha256_hex);
        let target = self.resolve(&path)?;

        if tokio::fs::try_exists(&target).await? {
            tracing::debug!(storage_path = %path, "blob.put already present");
            return Ok(path);
        }

        Self::write_atomic(&target, bytes).await?;
        tracing::debug!(storage_path = %path, mime, size_bytes = bytes.len(), "blob.put");
        Ok(path)
    }

    async fn put_at(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError> {
        let target = self.resolve(path)?;
        Self::write_atomic(&target, bytes).await
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, BlobError> {
        let target = self.resolve(path)?;
        Ok(tokio::fs::read(&target).await?)
    }

    async fn delete(&self, path: &str) -> Result<(), BlobError> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    fn presign(&self, path: &str, ttl: Duration) -> Result<String, BlobError> {
        self.signer.presign_at(path, ttl, Utc::now())
    }

    async fn health(&self) -> bool {
        if tokio::fs::create_dir_all(&self.root).await.is_err() {
            return false;
        }
        let probe = self.root.join(format!(".health-{}", Ulid::new()));
        let written = tokio::fs::write(&probe, b"ok").await.is_ok();
        let _ = tokio::fs::remove_file(&probe).await;
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use evintake_contracts::canonical::sha256_hex;

    fn signer() -> UrlSigner {
        UrlSigner::new(b"0123456789abcdef0123456789abcdef", "http://blobs.test/")
            .expect("signer should build")
    }

    fn query_param<'a>(url: &'a str, name: &str) -> &'a str {
        let query = url.split_once('?').map(|(_, q)| q).unwrap_or("");
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix(name).and_then(|v| v.strip_prefix('=')))
            .expect("query parameter should be present")
    }

    #[test]
    fn path_validation_rejects_traversal_and_foreign_prefixes() {
        assert!(validate_path("evidence/ab/abcdef").is_ok());
        assert!(validate_path("exports/export_01.zip").is_ok());
        assert!(validate_path("evidence/../secrets").is_err());
        assert!(validate_path("evidence//x").is_err());
        assert!(validate_path("tmp/x").is_err());
        assert!(validate_path("evidence/a b").is_err());
        assert!(validate_path("").is_err());
    }

    #[test]
    fn presigned_url_verifies_until_expiry() {
        let signer = signer();
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let url = signer
            .presign_at("evidence/ab/abc", Duration::from_secs(60), now)
            .expect("presign should succeed");
        assert!(url.starts_with("http://blobs.test/v1/blobs/evidence/ab/abc?expires="));

        let expires: i64 = query_param(&url, "expires").parse().expect("expires is numeric");
        let sig = query_param(&url, "sig");
        assert_eq!(expires, now.timestamp() + 60);

        signer
            .verify_at("evidence/ab/abc", expires, sig, now)
            .expect("fresh signature should verify");

        let later = now + chrono::Duration::seconds(61);
        assert!(matches!(
            signer.verify_at("evidence/ab/abc", expires, sig, later),
            Err(BlobError::Expired)
        ));
        assert!(matches!(
            signer.verify_at("evidence/ab/abd", expires, sig, now),
            Err(BlobError::InvalidSignature)
        ));
        assert!(matches!(
            signer.verify_at("evidence/ab/abc", expires + 1, sig, now),
            Err(BlobError::InvalidSignature)
        ));
        assert!(matches!(
            signer.verify_at("evidence/ab/abc", expires, "zz", now),
            Err(BlobError::InvalidSignature)
        ));
    }

    #[test]
    fn signer_rejects_empty_secret() {
        assert!(matches!(
            UrlSigner::new(b"", "http://x"),
            Err(BlobError::InvalidKey)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fs_store_is_content_addressed_and_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = FsBlobStore::new(dir.path(), signer());
        let bytes = b"%PDF-1.4 evidence".to_vec();
        let hash = sha256_hex(&bytes);

        let first = store
            .put(&bytes, &hash, "application/pdf")
            .await
            .expect("first put should succeed");
        let second = store
            .put(&bytes, &hash, "application/pdf")
            .await
            .expect("second put should succeed");
        assert_eq!(first, second);
        assert_eq!(first, format!("evidence/{}/{}", &hash[..2], hash));
        assert_eq!(store.get(&first).await.expect("get should succeed"), bytes);

        store.delete(&first).await.expect("delete should succeed");
        assert!(matches!(store.get(&first).await, Err(BlobError::NotFound)));
        store
            .delete(&first)
            .await
            .expect("deleting a missing blob should succeed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fs_store_rejects_bad_hash_and_reports_health() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let store = FsBlobStore::new(dir.path().join("nested"), signer());

        assert!(store.put(b"x", "not-a-hash", "text/plain").await.is_err());
        assert!(store.get("evidence/../../etc/passwd").await.is_err());
        assert!(store.health().await);

        store
            .put_at("exports/export_01.zip", b"PK")
            .await
            .expect("put_at should succeed");
        assert_eq!(
            store
                .get("exports/export_01.zip")
                .await
                .expect("get should succeed"),
            b"PK".to_vec()
        );
    }
}
