use chrono::{DateTime, Utc};
use evintake_contracts::{EvidenceMetadata, EvidenceType, IntegrityCheckResult};

use crate::metadata::ExifMetadata;
use crate::mime::sniff_mime;
use crate::policy::{IntegrityThresholds, policy_for};

pub struct IntegrityInput<'a> {
    pub metadata: &'a EvidenceMetadata,
    pub server_sha256: &'a str,
    pub server_size_bytes: u64,
    pub bytes: &'a [u8],
    pub exif: &'a ExifMetadata,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityVerdict {
    pub result: IntegrityCheckResult,
    pub detected_mime: &'static str,
}

/// Runs all six sub-checks and collects every issue; nothing short-circuits.
pub fn validate_integrity(
    input: &IntegrityInput<'_>,
    thresholds: &IntegrityThresholds,
) -> IntegrityVerdict {
    let metadata = input.metadata;
    let policy = policy_for(metadata.evidence_type);
    let mut issues = Vec::new();

    let hash_match = input.server_sha256 == metadata.sha256_hash_device;
    if !hash_match {
        issues.push(format!(
            "Hash mismatch: device={}... server={}...",
            prefix(&metadata.sha256_hash_device, 16),
            prefix(input.server_sha256, 16)
        ));
    }

    let detected_mime = sniff_mime(input.bytes);
    let mime_valid = policy.allows(detected_mime);
    if !mime_valid {
        issues.push(format!(
            "MIME type not allowed for {}: {} (allowed: {})",
            metadata.evidence_type.as_str(),
            detected_mime,
            policy.allowed_mime_types.join(", ")
        ));
    }
    if detected_mime != metadata.mime_type {
        issues.push(format!(
            "MIME mismatch: client={} server={}",
            metadata.mime_type, detected_mime
        ));
    }

    let mut file_size_ok = true;
    if input.server_size_bytes > policy.max_size_bytes {
        file_size_ok = false;
        issues.push(format!(
            "File exceeds {} limit: {} bytes (max: {})",
            metadata.evidence_type.as_str(),
            input.server_size_bytes,
            policy.max_size_bytes
        ));
    }
    if input.server_size_bytes != metadata.file_size_bytes {
        file_size_ok = false;
        issues.push(format!(
            "File size mismatch: claimed={} actual={}",
            metadata.file_size_bytes, input.server_size_bytes
        ));
    }

    let exif_present = input.exif.has_exif;
    let exif_ok = if metadata.evidence_type == EvidenceType::Photo {
        check_photo_exif(metadata, input.exif, thresholds, &mut issues)
    } else {
        true
    };

    let accuracy = metadata.gps.accuracy_meters;
    let gps_accuracy_ok = accuracy <= thresholds.min_gps_accuracy_meters;
    if !gps_accuracy_ok {
        issues.push(format!(
            "GPS accuracy insufficient: {:.1}m (max: {:.1}m)",
            accuracy, thresholds.min_gps_accuracy_meters
        ));
    }

    let time_drift_seconds = drift_seconds(input.received_at, metadata.captured_at_device);
    let time_drift_ok = time_drift_seconds <= thresholds.max_time_drift_secs;
    if !time_drift_ok {
        issues.push(format!(
            "Time drift excessive: {:.1}s (max: {:.1}s)",
            time_drift_seconds, thresholds.max_time_drift_secs
        ));
    }

    let integrity_passed =
        hash_match && mime_valid && file_size_ok && exif_ok && gps_accuracy_ok && time_drift_ok;

    IntegrityVerdict {
        result: IntegrityCheckResult {
            hash_match,
            mime_valid,
            file_size_ok,
            exif_ok,
            exif_present,
            gps_accuracy_ok,
            time_drift_ok,
            time_drift_seconds,
            integrity_passed,
            issues,
        },
        detected_mime,
    }
}

fn check_photo_exif(
    metadata: &EvidenceMetadata,
    exif: &ExifMetadata,
    thresholds: &IntegrityThresholds,
    issues: &mut Vec<String>,
) -> bool {
    if !exif.has_exif {
        issues.push("EXIF data required for photos but not found".to_string());
        return false;
    }

    // Cross-check mismatches are reported but do not fail the EXIF check.
    if let (Some(lat), Some(lon)) = (exif.gps_latitude, exif.gps_longitude) {
        let lat_diff = (lat - metadata.gps.latitude).abs();
        let lon_diff = (lon - metadata.gps.longitude).abs();
        if lat_diff > thresholds.gps_tolerance_degrees || lon_diff > thresholds.gps_tolerance_degrees
        {
            issues.push(format!(
                "GPS mismatch: EXIF ({:.6}, {:.6}) vs declared ({:.6}, {:.6})",
                lat, lon, metadata.gps.latitude, metadata.gps.longitude
            ));
        }
    }

    if let Some(captured) = exif.captured_at {
        let exif_time = captured.and_utc();
        let diff = drift_seconds(exif_time, metadata.captured_at_device);
        if diff > thresholds.exif_time_tolerance_secs {
            issues.push(format!(
                "Timestamp mismatch: EXIF {} vs declared {} ({:.0}s apart)",
                exif_time.to_rfc3339(),
                metadata.captured_at_device.to_rfc3339(),
                diff
            ));
        }
    }

    true
}

/// Absolute difference in seconds, never negative.
pub fn drift_seconds(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    let delta = a.signed_duration_since(b);
    (delta.num_milliseconds() as f64 / 1000.0).abs()
}

fn prefix(s: &str, n: usize) -> &str {
    s.get(..n).unwrap_or(s)
}

/// Names of the sub-checks that failed, for metrics and audit detail.
pub fn failed_checks(result: &IntegrityCheckResult) -> Vec<&'static str> {
    [
        ("hash_match", result.hash_match),
        ("mime_valid", result.mime_valid),
        ("file_size_ok", result.file_size_ok),
        ("exif_ok", result.exif_ok),
        ("gps_accuracy_ok", result.gps_accuracy_ok),
        ("time_drift_ok", result.time_drift_ok),
    ]
    .into_iter()
    .filter(|(_, ok)| !ok)
    .map(|(name, _)| name)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use evintake_contracts::GpsCoordinates;
    use evintake_contracts::canonical::sha256_hex;

    use crate::metadata::extract_exif;
    use crate::metadata::tests::jpeg_with_exif;

    fn received_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 10)
            .single()
            .expect("fixed timestamp should be valid")
    }

    fn document_metadata(bytes: &[u8]) -> EvidenceMetadata {
        EvidenceMetadata {
            evidence_id: "ev-1".to_string(),
            application_id: "app_1".to_string(),
            evidence_type: EvidenceType::Document,
            sha256_hash_device: sha256_hex(bytes),
            captured_at_device: Utc
                .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
                .single()
                .expect("fixed timestamp should be valid"),
            gps: GpsCoordinates {
                latitude: 47.6,
                longitude: -122.33,
                accuracy_meters: 10.0,
            },
            mime_type: "application/pdf".to_string(),
            file_size_bytes: bytes.len() as u64,
            exif_data: None,
        }
    }

    fn run(metadata: &EvidenceMetadata, bytes: &[u8]) -> IntegrityVerdict {
        let exif = if metadata.evidence_type == EvidenceType::Photo {
            extract_exif(bytes)
        } else {
            ExifMetadata::default()
        };
        let server_sha256 = sha256_hex(bytes);
        validate_integrity(
            &IntegrityInput {
                metadata,
                server_sha256: &server_sha256,
                server_size_bytes: bytes.len() as u64,
                bytes,
                exif: &exif,
                received_at: received_at(),
            },
            &IntegrityThresholds::default(),
        )
    }

    fn pdf_bytes() -> Vec<u8> {
        let mut bytes = b"%PDF-1.4\n".to_vec();
        bytes.resize(1000, b' ');
        bytes
    }

    #[test]
    fn clean_document_passes_with_no_issues() {
        let bytes = pdf_bytes();
        let verdict = run(&document_metadata(&bytes), &bytes);

        assert!(verdict.result.integrity_passed, "{:?}", verdict.result.issues);
        assert!(verdict.result.issues.is_empty());
        assert_eq!(verdict.detected_mime, "application/pdf");
        assert_eq!(verdict.result.time_drift_seconds, 10.0);
        assert!(!verdict.result.exif_present);
    }

    #[test]
    fn hash_mismatch_fails_and_is_itemized() {
        let bytes = pdf_bytes();
        let mut metadata = document_metadata(&bytes);
        metadata.sha256_hash_device = "a".repeat(64);

        let verdict = run(&metadata, &bytes);
        assert!(!verdict.result.hash_match);
        assert!(!verdict.result.integrity_passed);
        assert!(
            verdict.result.issues[0].starts_with("Hash mismatch: device=aaaaaaaaaaaaaaaa..."),
            "{:?}",
            verdict.result.issues
        );
    }

    #[test]
    fn every_failing_check_contributes_an_issue() {
        let bytes = b"just some text, not a pdf".to_vec();
        let mut metadata = document_metadata(&bytes);
        metadata.sha256_hash_device = "b".repeat(64);
        metadata.file_size_bytes = 5;
        metadata.gps.accuracy_meters = 75.0;
        metadata.captured_at_device = received_at() - chrono::Duration::seconds(120);

        let verdict = run(&metadata, &bytes);
        let result = &verdict.result;
        assert_eq!(
            failed_checks(result),
            vec![
                "hash_match",
                "mime_valid",
                "file_size_ok",
                "gps_accuracy_ok",
                "time_drift_ok"
            ]
        );
        assert!(result.exif_ok, "exif is not enforced for documents");
        assert!(result.issues.iter().any(|i| i.starts_with("MIME mismatch: client=application/pdf server=text/plain")));
        assert!(result.issues.iter().any(|i| i == "File size mismatch: claimed=5 actual=25"));
        assert!(result.issues.iter().any(|i| i == "GPS accuracy insufficient: 75.0m (max: 50.0m)"));
        assert!(result.issues.iter().any(|i| i == "Time drift excessive: 120.0s (max: 30.0s)"));
        assert_eq!(result.time_drift_seconds, 120.0);
    }

    #[test]
    fn drift_is_symmetric_for_future_device_clocks() {
        let bytes = pdf_bytes();
        let mut metadata = document_metadata(&bytes);
        metadata.captured_at_device = received_at() + chrono::Duration::seconds(5);
        let verdict = run(&metadata, &bytes);
        assert_eq!(verdict.result.time_drift_seconds, 5.0);
        assert!(verdict.result.time_drift_ok);
    }

    #[test]
    fn photo_without_exif_fails_exif_check() {
        let bytes = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];
        let mut metadata = document_metadata(&bytes);
        metadata.evidence_type = EvidenceType::Photo;
        metadata.mime_type = "image/jpeg".to_string();

        let verdict = run(&metadata, &bytes);
        assert!(!verdict.result.exif_ok);
        assert!(!verdict.result.exif_present);
        assert!(!verdict.result.integrity_passed);
        assert!(
            verdict
                .result
                .issues
                .contains(&"EXIF data required for photos but not found".to_string())
        );
    }

    #[test]
    fn photo_exif_is_cross_checked_against_declared_gps_and_time() {
        let bytes = jpeg_with_exif("2026:03:01 12:00:00", [47, 36, 0], b'N', [122, 19, 48], b'W');
        let mut metadata = document_metadata(&bytes);
        metadata.evidence_type = EvidenceType::Photo;
        metadata.mime_type = "image/jpeg".to_string();

        let verdict = run(&metadata, &bytes);
        assert!(verdict.result.exif_present);
        assert!(verdict.result.exif_ok, "{:?}", verdict.result.issues);
        assert!(verdict.result.integrity_passed);

        metadata.gps.latitude = 47.61;
        let verdict = run(&metadata, &bytes);
        assert!(verdict.result.exif_ok, "{:?}", verdict.result.issues);
        assert!(verdict.result.integrity_passed);
        assert_eq!(verdict.result.issues.len(), 1);
        assert!(verdict.result.issues[0].starts_with("GPS mismatch"));

        // EXIF clock two minutes behind the declared capture time.
        let bytes = jpeg_with_exif("2026:03:01 11:58:00", [47, 36, 0], b'N', [122, 19, 48], b'W');
        metadata.sha256_hash_device = sha256_hex(&bytes);
        metadata.file_size_bytes = bytes.len() as u64;
        let verdict = run(&metadata, &bytes);
        let result = &verdict.result;
        assert!(result.exif_ok);
        assert!(result.time_drift_ok);
        assert!(result.integrity_passed, "{:?}", result.issues);
        assert!(failed_checks(result).is_empty());
        assert!(result.issues.iter().any(|i| i.starts_with("GPS mismatch")));
        assert!(result.issues.iter().any(|i| i.starts_with("Timestamp mismatch")));
    }

    #[test]
    fn declared_mime_mismatch_is_an_issue_but_not_a_failure() {
        let bytes = jpeg_with_exif("2026:03:01 12:00:00", [47, 36, 0], b'N', [122, 19, 48], b'W');
        let mut metadata = document_metadata(&bytes);
        metadata.evidence_type = EvidenceType::Photo;
        metadata.mime_type = "image/jpg".to_string();

        let verdict = run(&metadata, &bytes);
        let result = &verdict.result;
        assert_eq!(verdict.detected_mime, "image/jpeg");
        assert!(result.mime_valid);
        assert!(result.integrity_passed, "{:?}", result.issues);
        assert_eq!(
            result.issues,
            vec!["MIME mismatch: client=image/jpg server=image/jpeg".to_string()]
        );

        let bytes = jpeg_with_exif("2026:03:01 11:58:00", [47, 36, 0], b'N', [122, 19, 48], b'W');
        metadata.sha256_hash_device = sha256_hex(&bytes);
        metadata.file_size_bytes = bytes.len() as u64;
        metadata.gps.longitude = -122.34;
        let verdict = run(&metadata, &bytes);
        let result = &verdict.result;
        assert!(result.integrity_passed, "{:?}", result.issues);
        assert_eq!(result.issues.len(), 3);
        assert!(result.issues.iter().any(|i| i.starts_with("GPS mismatch")));
        assert!(result.issues.iter().any(|i| i.starts_with("Timestamp mismatch")));
    }
}
