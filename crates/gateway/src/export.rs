use std::io::{Cursor, Write};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use evintake_contracts::canonical::canonical_json_string;
use evintake_contracts::export::extension_for_mime;
use evintake_contracts::{ManifestSignature, Signer};
use evintake_ledger::{EvidenceLedger, EvidenceRecord, LedgerError};
use tracing::Instrument;
use zip::write::SimpleFileOptions;

use crate::storage::{BlobError, BlobStore, export_path};

pub const UNSIGNED_PREFIX: &str = "UNSIGNED_DEV_MODE:";
pub const NO_EVIDENCE_MESSAGE: &str = "no evidence found for application";

#[derive(Debug)]
pub enum ExportError {
    NoEvidence,
    Zip(zip::result::ZipError),
    Io(std::io::Error),
    Blob(BlobError),
    Ledger(LedgerError),
}

impl std::fmt::Display for ExportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExportError::NoEvidence => write!(f, "{}", NO_EVIDENCE_MESSAGE),
            ExportError::Zip(err) => write!(f, "zip assembly failed: {}", err),
            ExportError::Io(err) => write!(f, "zip write failed: {}", err),
            ExportError::Blob(err) => write!(f, "package upload failed: {}", err),
            ExportError::Ledger(err) => write!(f, "export bookkeeping failed: {}", err),
        }
    }
}

impl std::error::Error for ExportError {}

impl From<zip::result::ZipError> for ExportError {
    fn from(value: zip::result::ZipError) -> Self {
        ExportError::Zip(value)
    }
}

impl From<std::io::Error> for ExportError {
    fn from(value: std::io::Error) -> Self {
        ExportError::Io(value)
    }
}

#[derive(Debug, Clone)]
pub struct PackageRequest {
    pub export_id: String,
    pub application_id: String,
    pub include_metadata: bool,
    pub sign_package: bool,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct ExportPackage {
    pub bytes: Vec<u8>,
    pub file_count: usize,
    pub manifest: serde_json::Value,
    /// `None` when signing was not requested.
    pub signature: Option<ManifestSignature>,
}

struct PackedFile {
    name: String,
    bytes: Vec<u8>,
}

fn readme(req: &PackageRequest) -> String {
    format!(
        "Evidence Export Package\n\
         =======================\n\
         \n\
         Application ID: {}\n\
         Export ID: {}\n\
         Generated: {}\n\
         \n\
         evidence/        evidence files, numbered in upload order\n\
         manifest.json    per-file metadata and server-side hashes\n\
         signature.txt    RS256 JWT over the canonical manifest\n\
         public_key.pem   key for verifying signature.txt, when provided\n",
        req.application_id,
        req.export_id,
        req.generated_at.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

/// Collects evidence bytes and assembles the ZIP. Blobs that cannot be read
/// are logged and left out of both the archive and the manifest.
pub async fn build_package(
    blobs: &dyn BlobStore,
    signer: &dyn Signer,
    req: &PackageRequest,
    evidence: &[EvidenceRecord],
) -> Result<ExportPackage, ExportError> {
    if evidence.is_empty() {
        return Err(ExportError::NoEvidence);
    }

    let mut files = Vec::with_capacity(evidence.len());
    let mut entries = Vec::with_capacity(evidence.len());

    for (idx, record) in evidence.iter().enumerate() {
        let bytes = match blobs.get(&record.storage_path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(
                    export_id = %req.export_id,
                    evidence_id = %record.evidence_id,
                    storage_path = %record.storage_path,
                    error = %err,
                    "export.skip_unreadable_evidence"
                );
                continue;
            }
        };

        let name = format!(
            "evidence/{:03}_{}{}",
            idx + 1,
            file_stem(&record.evidence_id),
            extension_for_mime(&record.mime_type_detected)
        );
        entries.push(serde_json::json!({
            "evidence_id": record.evidence_id,
            "filename": name,
            "evidence_type": record.evidence_type,
            "mime_type": record.mime_type_detected,
            "file_size_bytes": record.file_size_bytes,
            "sha256_hash": record.sha256_hash_server,
            "captured_at": record.captured_at_device.to_rfc3339_opts(SecondsFormat::Secs, true),
            "gps_latitude": record.gps_latitude,
            "gps_longitude": record.gps_longitude,
            "integrity_passed": record.integrity_passed,
            "uploader_role": record.uploader_role,
        }));
        files.push(PackedFile { name, bytes });
    }

    let manifest = serde_json::json!({
        "export_id": req.export_id,
        "application_id": req.application_id,
        "generated_at": req.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        "evidence_count": entries.len(),
        "evidence": entries,
    });

    let signature = req.sign_package.then(|| signer.sign(&manifest));
    let signature_text = signature.as_ref().map(|sig| match sig {
        ManifestSignature::Signed(token) => token.clone(),
        ManifestSignature::Unsigned => {
            format!("{}{}", UNSIGNED_PREFIX, canonical_json_string(&manifest))
        }
    });

    let file_count = files.len();
    let bytes = assemble_zip(
        &readme(req),
        &files,
        req.include_metadata.then_some(&manifest),
        signature_text.as_deref(),
        signature.as_ref().and(signer.public_key_pem()),
    )?;

    Ok(ExportPackage {
        bytes,
        file_count,
        manifest,
        signature,
    })
}

/// Keeps archive entry names flat: anything outside `[A-Za-z0-9._-]` becomes `_`.
fn file_stem(evidence_id: &str) -> String {
    let stem = evidence_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>();
    stem.replace("..", "__")
}

fn assemble_zip(
    readme: &str,
    files: &[PackedFile],
    manifest: Option<&serde_json::Value>,
    signature: Option<&str>,
    public_key_pem: Option<&str>,
) -> Result<Vec<u8>, ExportError> {
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));

    writer.start_file("README.txt", options)?;
    writer.write_all(readme.as_bytes())?;

    for file in files {
        writer.start_file(file.name.as_str(), options)?;
        writer.write_all(&file.bytes)?;
    }

    if let Some(manifest) = manifest {
        let pretty = serde_json::to_vec_pretty(manifest)
            .map_err(|err| ExportError::Io(std::io::Error::other(err)))?;
        writer.start_file("manifest.json", options)?;
        writer.write_all(&pretty)?;
    }

    if let Some(signature) = signature {
        writer.start_file("signature.txt", options)?;
        writer.write_all(signature.as_bytes())?;
    }

    if let Some(pem) = public_key_pem {
        writer.start_file("public_key.pem", options)?;
        writer.write_all(pem.as_bytes())?;
    }

    Ok(writer.finish()?.into_inner())
}

/// Drives one export from `pending` to `completed` or `failed`.
pub async fn run_export(
    ledger: EvidenceLedger,
    blobs: Arc<dyn BlobStore>,
    signer: Arc<dyn Signer>,
    tenant_id: String,
    req: PackageRequest,
) {
    let span = tracing::info_span!(
        "export.run",
        export_id = %req.export_id,
        application_id = %req.application_id,
        tenant_id = %tenant_id,
        outcome = tracing::field::Empty,
    );

    async move {
        let export_id = req.export_id.clone();
        match package_and_store(&ledger, blobs.as_ref(), signer.as_ref(), &tenant_id, &req).await {
            Ok(()) => {
                tracing::Span::current().record("outcome", "completed");
            }
            Err(err) => {
                tracing::Span::current().record("outcome", "failed");
                tracing::warn!(error = %err, "export.failed");
                if let Err(mark_err) = ledger.fail_export(&export_id, &err.to_string()).await {
                    tracing::warn!(error = %mark_err, "export.fail_mark_failed");
                }
            }
        }
    }
    .instrument(span)
    .await
}

async fn package_and_store(
    ledger: &EvidenceLedger,
    blobs: &dyn BlobStore,
    signer: &dyn Signer,
    tenant_id: &str,
    req: &PackageRequest,
) -> Result<(), ExportError> {
    ledger
        .mark_export_processing(&req.export_id)
        .await
        .map_err(ExportError::Ledger)?;

    let evidence = ledger
        .list_evidence_for_application(tenant_id, &req.application_id)
        .await
        .map_err(ExportError::Ledger)?;

    let package = build_package(blobs, signer, req, &evidence).await?;

    let path = export_path(&req.export_id);
    blobs
        .put_at(&path, &package.bytes)
        .await
        .map_err(ExportError::Blob)?;

    let signature = package
        .signature
        .as_ref()
        .and_then(ManifestSignature::as_signed);
    ledger
        .complete_export(
            &req.export_id,
            i32::try_from(package.file_count).unwrap_or(i32::MAX),
            i64::try_from(package.bytes.len()).unwrap_or(i64::MAX),
            &path,
            signature,
        )
        .await
        .map_err(ExportError::Ledger)?;

    tracing::info!(
        file_count = package.file_count,
        size_bytes = package.bytes.len(),
        signed = signature.is_some(),
        "export.completed"
    );
    Ok(())
}
