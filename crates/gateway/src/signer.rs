use std::path::Path;

use evintake_contracts::canonical::canonicalize_json_value;
use evintake_contracts::{ManifestSignature, Signer};
use jsonwebtoken::{Algorithm, EncodingKey, Header};

use crate::config::StartupError;

/// Signs manifests as compact RS256 JWTs whose claims are the canonicalized
/// manifest.
pub struct Rs256Signer {
    key: EncodingKey,
    public_key_pem: Option<String>,
}

impl Rs256Signer {
    pub fn from_pem(private_pem: &[u8], public_key_pem: Option<String>) -> Result<Self, StartupError> {
        let key = EncodingKey::from_rsa_pem(private_pem).map_err(|err| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("signing key is not a usable RSA PEM: {}", err),
        })?;
        Ok(Self {
            key,
            public_key_pem,
        })
    }

    pub fn load(private_path: &Path, public_path: Option<&Path>) -> Result<Self, StartupError> {
        let private_pem = std::fs::read(private_path).map_err(|err| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!(
                "failed to read signing key {}: {}",
                private_path.display(),
                err
            ),
        })?;
        let public_key_pem = match public_path {
            None => None,
            Some(path) => Some(std::fs::read_to_string(path).map_err(|err| StartupError {
                code: "ERR_INVALID_CONFIG",
                message: format!("failed to read public key {}: {}", path.display(), err),
            })?),
        };
        Self::from_pem(&private_pem, public_key_pem)
    }
}

impl Signer for Rs256Signer {
    fn sign(&self, manifest: &serde_json::Value) -> ManifestSignature {
        let claims = canonicalize_json_value(manifest);
        match jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.key) {
            Ok(token) => ManifestSignature::Signed(token),
            Err(err) => {
                tracing::warn!(error = %err, "manifest signing failed; recording unsigned");
                ManifestSignature::Unsigned
            }
        }
    }

    fn public_key_pem(&self) -> Option<&str> {
        self.public_key_pem.as_deref()
    }
}

/// Used when no signing key is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsignedSigner;

impl Signer for UnsignedSigner {
    fn sign(&self, _manifest: &serde_json::Value) -> ManifestSignature {
        ManifestSignature::Unsigned
    }
}
