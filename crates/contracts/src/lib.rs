use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod canonical;
pub mod decision;
pub mod export;
pub mod facts;

pub const EVIDENCE_ID_MAX_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceType {
    Photo,
    Video,
    Document,
}

impl EvidenceType {
    pub fn as_str(self) -> &'static str {
        match self {
            EvidenceType::Photo => "photo",
            EvidenceType::Video => "video",
            EvidenceType::Document => "document",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    ApplicantOwner,
    Inspector,
    Supervisor,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::ApplicantOwner => "applicant_owner",
            Role::Inspector => "inspector",
            Role::Supervisor => "supervisor",
            Role::Admin => "admin",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "applicant_owner" => Some(Role::ApplicantOwner),
            "inspector" => Some(Role::Inspector),
            "supervisor" => Some(Role::Supervisor),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Rejected,
    Failure,
}

impl AuditResult {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditResult::Success => "success",
            AuditResult::Rejected => "rejected",
            AuditResult::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsCoordinates {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_meters: f64,
}

impl GpsCoordinates {
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err("gps_coordinates.latitude must be between -90 and 90");
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err("gps_coordinates.longitude must be between -180 and 180");
        }
        if !self.accuracy_meters.is_finite() || self.accuracy_meters <= 0.0 {
            return Err("gps_coordinates.accuracy_meters must be greater than 0");
        }
        Ok(())
    }
}

/// Client-declared metadata sent alongside an evidence file.
///
/// Uploader identity and role are intentionally absent: they always come from
/// the authenticated principal. Unknown fields (for example a client-side
/// `uploader_role`) are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct EvidenceUploadRequest {
    pub evidence_id: String,
    pub application_id: String,
    pub evidence_type: EvidenceType,
    pub sha256_hash_device: String,
    pub captured_at_device: String,
    pub gps_coordinates: GpsCoordinates,
    pub mime_type: String,
    pub file_size_bytes: u64,
    #[serde(default)]
    pub exif_data: Option<serde_json::Value>,
}

/// Upload metadata after field validation and normalisation.
#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceMetadata {
    pub evidence_id: String,
    pub application_id: String,
    pub evidence_type: EvidenceType,
    pub sha256_hash_device: String,
    pub captured_at_device: DateTime<Utc>,
    pub gps: GpsCoordinates,
    pub mime_type: String,
    pub file_size_bytes: u64,
    pub exif_data: Option<serde_json::Value>,
}

impl EvidenceUploadRequest {
    pub fn validate(self) -> Result<EvidenceMetadata, String> {
        let evidence_id = self.evidence_id.trim().to_string();
        if evidence_id.is_empty() || evidence_id.len() > EVIDENCE_ID_MAX_LEN {
            return Err(format!(
                "evidence_id must be 1..={} characters",
                EVIDENCE_ID_MAX_LEN
            ));
        }
        if !evidence_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        {
            return Err("evidence_id may only contain A-Z, a-z, 0-9, '.', '_' and '-'".to_string());
        }

        let application_id = self.application_id.trim().to_string();
        if application_id.is_empty() || application_id.len() > EVIDENCE_ID_MAX_LEN {
            return Err(format!(
                "application_id must be 1..={} characters",
                EVIDENCE_ID_MAX_LEN
            ));
        }

        let sha256_hash_device = canonical::normalize_sha256_hex(&self.sha256_hash_device);
        if !canonical::is_sha256_hex(&sha256_hash_device) {
            return Err("sha256_hash_device must be 64 hex characters".to_string());
        }

        let captured_at_device = parse_device_timestamp(&self.captured_at_device)
            .ok_or_else(|| "captured_at_device must be an ISO-8601 timestamp".to_string())?;

        self.gps_coordinates.validate()?;

        let mime_type = self.mime_type.trim().to_ascii_lowercase();
        if mime_type.is_empty() || mime_type.len() > EVIDENCE_ID_MAX_LEN {
            return Err("mime_type must be non-empty".to_string());
        }

        if self.file_size_bytes == 0 {
            return Err("file_size_bytes must be greater than 0".to_string());
        }

        Ok(EvidenceMetadata {
            evidence_id,
            application_id,
            evidence_type: self.evidence_type,
            sha256_hash_device,
            captured_at_device,
            gps: self.gps_coordinates,
            mime_type,
            file_size_bytes: self.file_size_bytes,
            exif_data: self.exif_data,
        })
    }
}

/// Parses a device capture timestamp. Values without an offset are UTC.
pub fn parse_device_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    None
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityCheckResult {
    pub hash_match: bool,
    pub mime_valid: bool,
    pub file_size_ok: bool,
    pub exif_ok: bool,
    pub exif_present: bool,
    pub gps_accuracy_ok: bool,
    pub time_drift_ok: bool,
    pub time_drift_seconds: f64,
    pub integrity_passed: bool,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceResponse {
    pub evidence_id: String,
    pub application_id: String,
    pub storage_uri: String,
    pub integrity_passed: bool,
    pub integrity_check: IntegrityCheckResult,
    pub created_at: DateTime<Utc>,
}

/// Result of asking a [`Signer`] to sign a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestSignature {
    Signed(String),
    Unsigned,
}

impl ManifestSignature {
    pub fn as_signed(&self) -> Option<&str> {
        match self {
            ManifestSignature::Signed(sig) => Some(sig.as_str()),
            ManifestSignature::Unsigned => None,
        }
    }
}

pub trait Signer: Send + Sync {
    fn sign(&self, manifest: &serde_json::Value) -> ManifestSignature;

    fn public_key_pem(&self) -> Option<&str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload_request() -> EvidenceUploadRequest {
        serde_json::from_value(serde_json::json!({
            "evidence_id": "ev-001",
            "application_id": "app_01",
            "evidence_type": "document",
            "sha256_hash_device": "A".repeat(64),
            "captured_at_device": "2026-03-01T12:00:00",
            "gps_coordinates": {"latitude": 47.6, "longitude": -122.3, "accuracy_meters": 10.0},
            "uploader_role": "admin",
            "mime_type": "Application/PDF",
            "file_size_bytes": 1000
        }))
        .expect("upload request should deserialize")
    }

    #[test]
    fn validate_normalizes_hash_mime_and_naive_timestamp() {
        let metadata = upload_request()
            .validate()
            .expect("upload request should validate");

        assert_eq!(metadata.sha256_hash_device, "a".repeat(64));
        assert_eq!(metadata.mime_type, "application/pdf");
        assert_eq!(
            metadata.captured_at_device.to_rfc3339(),
            "2026-03-01T12:00:00+00:00"
        );
    }

    #[test]
    fn validate_rejects_out_of_range_gps() {
        let mut req = upload_request();
        req.gps_coordinates.latitude = 91.0;
        let err = req.validate().expect_err("latitude 91 must be rejected");
        assert!(err.contains("latitude"));

        let mut req = upload_request();
        req.gps_coordinates.accuracy_meters = 0.0;
        let err = req.validate().expect_err("zero accuracy must be rejected");
        assert!(err.contains("accuracy_meters"));
    }

    #[test]
    fn validate_rejects_short_hash_and_zero_size() {
        let mut req = upload_request();
        req.sha256_hash_device = "abc".to_string();
        assert!(req.validate().is_err());

        let mut req = upload_request();
        req.file_size_bytes = 0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_path_like_evidence_ids() {
        for bad in ["../../x", "ev/1", "ev 1", "ev\\1"] {
            let mut req = upload_request();
            req.evidence_id = bad.to_string();
            let err = req.validate().expect_err("path-like id must be rejected");
            assert!(err.contains("evidence_id"), "{}", err);
        }

        let mut req = upload_request();
        req.evidence_id = "EV_2026.03-01".to_string();
        assert!(req.validate().is_ok());
    }

    #[test]
    fn unknown_evidence_type_fails_to_deserialize() {
        let err = serde_json::from_value::<EvidenceUploadRequest>(serde_json::json!({
            "evidence_id": "ev-001",
            "application_id": "app_01",
            "evidence_type": "audio",
            "sha256_hash_device": "a".repeat(64),
            "captured_at_device": "2026-03-01T12:00:00Z",
            "gps_coordinates": {"latitude": 0.0, "longitude": 0.0, "accuracy_meters": 1.0},
            "mime_type": "audio/mpeg",
            "file_size_bytes": 1
        }));
        assert!(err.is_err());
    }

    #[test]
    fn device_timestamp_accepts_offsets_and_rejects_garbage() {
        let ts = parse_device_timestamp("2026-03-01T14:00:00+02:00")
            .expect("offset timestamp should parse");
        assert_eq!(ts.to_rfc3339(), "2026-03-01T12:00:00+00:00");
        assert!(parse_device_timestamp("yesterday").is_none());
        assert!(parse_device_timestamp("").is_none());
    }
}
