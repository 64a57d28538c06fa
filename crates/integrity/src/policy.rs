use evintake_contracts::EvidenceType;

const MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvidencePolicy {
    pub allowed_mime_types: &'static [&'static str],
    pub max_size_bytes: u64,
}

impl EvidencePolicy {
    pub fn allows(&self, mime: &str) -> bool {
        self.allowed_mime_types.contains(&mime)
    }
}

pub const PHOTO_POLICY: EvidencePolicy = EvidencePolicy {
    allowed_mime_types: &["image/jpeg"],
    max_size_bytes: 10 * MB,
};

pub const VIDEO_POLICY: EvidencePolicy = EvidencePolicy {
    allowed_mime_types: &["video/mp4", "video/quicktime"],
    max_size_bytes: 50 * MB,
};

pub const DOCUMENT_POLICY: EvidencePolicy = EvidencePolicy {
    allowed_mime_types: &["application/pdf"],
    max_size_bytes: 25 * MB,
};

pub fn policy_for(evidence_type: EvidenceType) -> &'static EvidencePolicy {
    match evidence_type {
        EvidenceType::Photo => &PHOTO_POLICY,
        EvidenceType::Video => &VIDEO_POLICY,
        EvidenceType::Document => &DOCUMENT_POLICY,
    }
}

/// Largest per-type ceiling; used to reject oversized requests before reading the body.
pub fn global_max_size_bytes() -> u64 {
    [EvidenceType::Photo, EvidenceType::Video, EvidenceType::Document]
        .into_iter()
        .map(|t| policy_for(t).max_size_bytes)
        .max()
        .unwrap_or(VIDEO_POLICY.max_size_bytes)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntegrityThresholds {
    pub max_time_drift_secs: f64,
    pub min_gps_accuracy_meters: f64,
    pub gps_tolerance_degrees: f64,
    pub exif_time_tolerance_secs: f64,
}

impl Default for IntegrityThresholds {
    fn default() -> Self {
        Self {
            max_time_drift_secs: 30.0,
            min_gps_accuracy_meters: 50.0,
            gps_tolerance_degrees: 0.001,
            exif_time_tolerance_secs: 60.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_type_limits_match_policy_table() {
        assert_eq!(policy_for(EvidenceType::Photo).max_size_bytes, 10 * MB);
        assert_eq!(policy_for(EvidenceType::Video).max_size_bytes, 50 * MB);
        assert_eq!(policy_for(EvidenceType::Document).max_size_bytes, 25 * MB);
        assert_eq!(global_max_size_bytes(), 50 * MB);
    }

    #[test]
    fn mime_allow_lists_are_per_type() {
        assert!(policy_for(EvidenceType::Video).allows("video/quicktime"));
        assert!(!policy_for(EvidenceType::Photo).allows("image/png"));
        assert!(!policy_for(EvidenceType::Document).allows("image/jpeg"));
    }
}
