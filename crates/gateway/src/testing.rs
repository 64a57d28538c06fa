//! In-memory stand-ins for the ledger and blob store.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use evintake_ledger::{AuditEntry, EvidenceRecord, LedgerError};

use crate::storage::{BlobError, BlobStore, evidence_path, validate_path};
use crate::store::EvidenceStore;
use crate::upload::{BodyError, UploadBody};

const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Default)]
pub struct MemBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemBlobStore {
    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        self.blobs
            .lock()
            .expect("blob map lock")
            .insert(path.to_string(), bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().expect("blob map lock").is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.blobs.lock().expect("blob map lock").contains_key(path)
    }
}

#[async_trait]
impl BlobStore for MemBlobStore {
    async fn put(&self, bytes: &[u8], sha256_hex: &str, _mime: &str) -> Result<String, BlobError> {
        let path = evidence_path(sha256_hex);
        self.blobs
            .lock()
            .expect("blob map lock")
            .entry(path.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(path)
    }

    async fn put_at(&self, path: &str, bytes: &[u8]) -> Result<(), BlobError> {
        validate_path(path)?;
        self.insert(path, bytes.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .lock()
            .expect("blob map lock")
            .get(path)
            .cloned()
            .ok_or(BlobError::NotFound)
    }

    async fn delete(&self, path: &str) -> Result<(), BlobError> {
        self.blobs.lock().expect("blob map lock").remove(path);
        Ok(())
    }

    fn presign(&self, path: &str, ttl: Duration) -> Result<String, BlobError> {
        Ok(format!(
            "http://blobs.test/v1/blobs/{}?expires={}&sig=test",
            path,
            ttl.as_secs()
        ))
    }

    async fn health(&self) -> bool {
        true
    }
}

#[derive(Default)]
pub struct MemEvidenceStore {
    records: Mutex<Vec<EvidenceRecord>>,
    audits: Mutex<Vec<AuditEntry>>,
    responses: Mutex<HashMap<(String, String), String>>,
    next_insert_error: Mutex<Option<LedgerError>>,
}

impl MemEvidenceStore {
    pub fn records(&self) -> Vec<EvidenceRecord> {
        self.records.lock().expect("records lock").clone()
    }

    pub fn audits(&self) -> Vec<AuditEntry> {
        self.audits.lock().expect("audits lock").clone()
    }

    /// The next `insert_evidence` call fails with `err`.
    pub fn fail_inserts(&self, err: LedgerError) {
        *self.next_insert_error.lock().expect("error lock") = Some(err);
    }

    /// Moves every stored record's creation time into the past.
    pub fn age_records(&self, by: chrono::Duration) {
        for record in self.records.lock().expect("records lock").iter_mut() {
            record.created_at -= by;
        }
    }
}

#[async_trait]
impl EvidenceStore for MemEvidenceStore {
    async fn cached_response(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
    ) -> Result<Option<String>, LedgerError> {
        Ok(self
            .responses
            .lock()
            .expect("responses lock")
            .get(&(tenant_id.to_string(), idempotency_key.to_string()))
            .cloned())
    }

    async fn cache_response(
        &self,
        tenant_id: &str,
        idempotency_key: &str,
        response_json: &str,
    ) -> Result<(), LedgerError> {
        self.responses
            .lock()
            .expect("responses lock")
            .entry((tenant_id.to_string(), idempotency_key.to_string()))
            .or_insert_with(|| response_json.to_string());
        Ok(())
    }

    async fn evidence_exists(
        &self,
        tenant_id: &str,
        evidence_id: &str,
    ) -> Result<bool, LedgerError> {
        Ok(self
            .records
            .lock()
            .expect("records lock")
            .iter()
            .any(|r| r.tenant_id == tenant_id && r.evidence_id == evidence_id))
    }

    async fn find_recent_by_hash(
        &self,
        tenant_id: &str,
        sha256_hash_server: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<String>, LedgerError> {
        Ok(self
            .records
            .lock()
            .expect("records lock")
            .iter()
            .filter(|r| {
                r.tenant_id == tenant_id
                    && r.sha256_hash_server == sha256_hash_server
                    && r.created_at >= since
            })
            .max_by_key(|r| r.created_at)
            .map(|r| r.evidence_id.clone()))
    }

    async fn insert_evidence(
        &self,
        record: &EvidenceRecord,
        audit: &AuditEntry,
    ) -> Result<(), LedgerError> {
        if let Some(err) = self.next_insert_error.lock().expect("error lock").take() {
            return Err(err);
        }

        let mut records = self.records.lock().expect("records lock");
        if records
            .iter()
            .any(|r| r.tenant_id == record.tenant_id && r.evidence_id == record.evidence_id)
        {
            return Err(LedgerError::UniqueViolation(
                "evintake_evidence_pkey".to_string(),
            ));
        }
        records.push(record.clone());
        self.audits.lock().expect("audits lock").push(audit.clone());
        Ok(())
    }

    async fn storage_references(&self, storage_path: &str) -> Result<i64, LedgerError> {
        Ok(self
            .records
            .lock()
            .expect("records lock")
            .iter()
            .filter(|r| r.storage_path == storage_path)
            .count() as i64)
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<String, LedgerError> {
        let mut audits = self.audits.lock().expect("audits lock");
        audits.push(entry.clone());
        Ok(format!("audit-{}", audits.len()))
    }
}

/// A pre-split upload body.
pub struct StaticBody {
    metadata: Option<String>,
    chunks: VecDeque<Bytes>,
    metadata_read: bool,
}

impl StaticBody {
    pub fn new(metadata: Option<String>, file: Option<Vec<u8>>) -> Self {
        let chunks = file
            .map(|bytes| {
                bytes
                    .chunks(CHUNK_SIZE)
                    .map(Bytes::copy_from_slice)
                    .collect::<VecDeque<_>>()
            })
            .unwrap_or_default();
        Self {
            metadata,
            chunks,
            metadata_read: false,
        }
    }

    pub fn metadata_read(&self) -> bool {
        self.metadata_read
    }

    pub fn chunks_remaining(&self) -> usize {
        self.chunks.len()
    }
}

#[async_trait]
impl UploadBody for StaticBody {
    async fn metadata(&mut self) -> Result<String, BodyError> {
        self.metadata_read = true;
        self.metadata.take().ok_or(BodyError::Missing("metadata"))
    }

    async fn next_file_chunk(&mut self) -> Result<Option<Bytes>, BodyError> {
        Ok(self.chunks.pop_front())
    }
}

/// A PDF-signed payload of exactly `len` bytes whose content depends on `len`.
pub fn pdf_bytes(len: usize) -> Vec<u8> {
    let mut bytes = b"%PDF-1.4\n".to_vec();
    let fill = len.saturating_sub(bytes.len());
    bytes.extend((0..fill).map(|i| b'a' + ((i * 7 + len) % 26) as u8));
    bytes.truncate(len.max(5));
    bytes
}

/// A minimal JFIF JPEG with no APP1 segment.
pub fn jpeg_without_exif() -> Vec<u8> {
    let mut bytes = vec![
        0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00, 0x01, 0x01, 0x00, 0x00,
        0x01, 0x00, 0x01, 0x00, 0x00,
    ];
    bytes.extend_from_slice(&[0u8; 64]);
    bytes.extend_from_slice(&[0xFF, 0xD9]);
    bytes
}

pub fn evidence_record(evidence_id: &str, storage_path: &str, mime_detected: &str) -> EvidenceRecord {
    let now = Utc::now();
    EvidenceRecord {
        tenant_id: "tenant-a".to_string(),
        evidence_id: evidence_id.to_string(),
        application_id: "app_01".to_string(),
        evidence_type: "document".to_string(),
        mime_type: mime_detected.to_string(),
        mime_type_detected: mime_detected.to_string(),
        file_size_bytes: 3,
        sha256_hash_device: "a".repeat(64),
        sha256_hash_server: "a".repeat(64),
        captured_at_device: now,
        captured_at_server: now,
        time_drift_seconds: 0.0,
        gps_latitude: 47.6,
        gps_longitude: -122.3,
        gps_accuracy_meters: 10.0,
        exif_present: false,
        exif_data: None,
        exif_gps_latitude: None,
        exif_gps_longitude: None,
        exif_datetime: None,
        uploader_id: "user-1".to_string(),
        uploader_role: "inspector".to_string(),
        storage_path: storage_path.to_string(),
        integrity_passed: true,
        integrity_issues: Vec::new(),
        correlation_id: "corr-1".to_string(),
        created_at: now,
    }
}
