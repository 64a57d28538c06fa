use std::sync::Arc;
use std::time::{Duration, Instant};

use evintake_contracts::Role;
use http::HeaderMap;
use http::header;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde_json::Value;
use tokio::sync::RwLock;

pub const DEV_TENANT_ID: &str = "dev_tenant";
pub const DEV_USER_ID: &str = "dev_user";

/// The authenticated caller. Always trusted over any identity in a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub tenant_id: String,
    pub role: Role,
}

impl Principal {
    /// Identity used when authentication is optional and no token was sent.
    pub fn development() -> Self {
        Self {
            user_id: DEV_USER_ID.to_string(),
            tenant_id: DEV_TENANT_ID.to_string(),
            role: Role::ApplicantOwner,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuthError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Clone)]
pub struct ClaimMapping {
    pub user_id_claim: String,
    pub tenant_claim: Option<String>,
    pub tenant_id_static: Option<String>,
    pub role_claim: String,
}

impl Default for ClaimMapping {
    fn default() -> Self {
        Self {
            user_id_claim: "sub".to_string(),
            tenant_claim: Some("tenant_id".to_string()),
            tenant_id_static: None,
            role_claim: "role".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Hs256Config {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub clock_skew: Duration,
    pub claims: ClaimMapping,
}

#[derive(Debug, Clone)]
pub struct OidcConfig {
    pub issuer: String,
    pub audience: Option<String>,
    pub jwks_url: Option<String>,
    pub jwks_json: Option<String>,
    pub jwks_timeout: Duration,
    pub jwks_refresh_ttl: Duration,
    pub clock_skew: Duration,
    pub claims: ClaimMapping,
}

/// Resolves bearer credentials into a [`Principal`].
#[derive(Clone)]
pub enum Authenticator {
    /// No verification; every request runs as the development principal.
    Disabled,
    Hs256(Hs256Authenticator),
    Oidc(OidcAuthenticator),
}

impl Authenticator {
    /// `Ok(None)` when no credential was presented (or auth is disabled).
    /// A credential that is present but invalid is always an error.
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<Option<Principal>, AuthError> {
        if matches!(self, Authenticator::Disabled) || !headers.contains_key(header::AUTHORIZATION)
        {
            return Ok(None);
        }

        let principal = match self {
            Authenticator::Disabled => return Ok(None),
            Authenticator::Hs256(auth) => auth.authenticate(headers)?,
            Authenticator::Oidc(auth) => auth.authenticate(headers).await?,
        };
        Ok(Some(principal))
    }
}

#[derive(Clone)]
pub struct Hs256Authenticator {
    config: Hs256Config,
    key: DecodingKey,
}

impl Hs256Authenticator {
    pub fn new(config: Hs256Config) -> Result<Self, AuthError> {
        if config.secret.trim().len() < 16 {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "jwt secret must be at least 16 characters".to_string(),
            });
        }
        validate_claim_mapping(&config.claims)?;

        let key = DecodingKey::from_secret(config.secret.as_bytes());
        Ok(Self { config, key })
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = bearer_token(headers)?;

        let mut validation = Validation::new(Algorithm::HS256);
        configure_validation(
            &mut validation,
            self.config.issuer.as_deref(),
            self.config.audience.as_deref(),
            self.config.clock_skew,
        );

        let decoded = decode::<Value>(&token, &self.key, &validation).map_err(|_| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "JWT validation failed".to_string(),
        })?;

        principal_from_claims(&decoded.claims, &self.config.claims)
    }
}

#[derive(Clone)]
pub struct OidcAuthenticator {
    config: OidcConfig,
    http: reqwest::Client,
    jwks: Arc<RwLock<JwksCache>>,
}

#[derive(Debug)]
struct JwksCache {
    jwks: Option<JwkSet>,
    fetched_at: Option<Instant>,
}

impl OidcAuthenticator {
    pub async fn new(config: OidcConfig) -> Result<Self, AuthError> {
        if config.issuer.trim().is_empty() {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "oidc issuer must be non-empty".to_string(),
            });
        }
        validate_claim_mapping(&config.claims)?;

        let http = reqwest::Client::builder()
            .timeout(config.jwks_timeout)
            .build()
            .map_err(|_| AuthError {
                code: "ERR_INTERNAL",
                message: "failed to initialize oidc http client".to_string(),
            })?;

        let mut cache = JwksCache {
            jwks: None,
            fetched_at: None,
        };
        cache.refresh(&http, &config).await?;

        Ok(Self {
            config,
            http,
            jwks: Arc::new(RwLock::new(cache)),
        })
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = bearer_token(headers)?;

        let header = decode_header(&token).map_err(|_| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "invalid JWT header".to_string(),
        })?;

        if header.alg != Algorithm::RS256 {
            return Err(AuthError {
                code: "ERR_AUTH_INVALID",
                message: "unsupported JWT alg (expected RS256)".to_string(),
            });
        }

        let kid = header.kid.ok_or_else(|| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "JWT header missing kid".to_string(),
        })?;

        let decoding_key = self.decoding_key_for_kid(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        configure_validation(
            &mut validation,
            Some(self.config.issuer.as_str()),
            self.config.audience.as_deref(),
            self.config.clock_skew,
        );

        let decoded =
            decode::<Value>(&token, &decoding_key, &validation).map_err(|_| AuthError {
                code: "ERR_AUTH_INVALID",
                message: "JWT validation failed".to_string(),
            })?;

        principal_from_claims(&decoded.claims, &self.config.claims)
    }

    async fn decoding_key_for_kid(&self, kid: &str) -> Result<DecodingKey, AuthError> {
        {
            let cache = self.jwks.read().await;
            if let Some(jwk) = cache.jwk_for_kid(kid) {
                return DecodingKey::from_jwk(jwk).map_err(|_| AuthError {
                    code: "ERR_AUTH_INVALID",
                    message: "failed to parse JWK decoding key".to_string(),
                });
            }
        }

        {
            let mut cache = self.jwks.write().await;
            let refresh_needed = cache
                .fetched_at
                .map(|t| t.elapsed() > self.config.jwks_refresh_ttl)
                .unwrap_or(true);
            if refresh_needed {
                cache.refresh(&self.http, &self.config).await?;
            }

            if let Some(jwk) = cache.jwk_for_kid(kid) {
                return DecodingKey::from_jwk(jwk).map_err(|_| AuthError {
                    code: "ERR_AUTH_INVALID",
                    message: "failed to parse JWK decoding key".to_string(),
                });
            }
        }

        Err(AuthError {
            code: "ERR_AUTH_INVALID",
            message: "JWT kid not found in JWKS".to_string(),
        })
    }
}

impl JwksCache {
    fn jwk_for_kid(&self, kid: &str) -> Option<&jsonwebtoken::jwk::Jwk> {
        self.jwks.as_ref()?.find(kid)
    }

    async fn refresh(
        &mut self,
        http: &reqwest::Client,
        config: &OidcConfig,
    ) -> Result<(), AuthError> {
        let jwks = if let Some(jwks_json) = config.jwks_json.as_ref() {
            serde_json::from_str::<JwkSet>(jwks_json).map_err(|_| AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "EVINTAKE_OIDC_JWKS_JSON is not valid JWKS JSON".to_string(),
            })?
        } else if let Some(url) = config.jwks_url.as_ref() {
            http.get(url)
                .send()
                .await
                .map_err(|_| AuthError {
                    code: "ERR_AUTH_UNAVAILABLE",
                    message: "failed to fetch JWKS".to_string(),
                })?
                .error_for_status()
                .map_err(|_| AuthError {
                    code: "ERR_AUTH_UNAVAILABLE",
                    message: "JWKS endpoint returned non-success status".to_string(),
                })?
                .json::<JwkSet>()
                .await
                .map_err(|_| AuthError {
                    code: "ERR_AUTH_UNAVAILABLE",
                    message: "failed to parse JWKS JSON".to_string(),
                })?
        } else {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "oidc requires jwks_url or jwks_json".to_string(),
            });
        };

        self.jwks = Some(jwks);
        self.fetched_at = Some(Instant::now());
        Ok(())
    }
}

fn configure_validation(
    validation: &mut Validation,
    issuer: Option<&str>,
    audience: Option<&str>,
    clock_skew: Duration,
) {
    if let Some(issuer) = issuer {
        validation.set_issuer(&[issuer]);
    }
    match audience {
        Some(audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }
    validation.leeway = clock_skew.as_secs();
}

fn validate_claim_mapping(claims: &ClaimMapping) -> Result<(), AuthError> {
    if claims.user_id_claim.trim().is_empty() || claims.role_claim.trim().is_empty() {
        return Err(AuthError {
            code: "ERR_INVALID_CONFIG",
            message: "user id and role claims must be non-empty".to_string(),
        });
    }
    if claims.tenant_claim.is_none() && claims.tenant_id_static.is_none() {
        return Err(AuthError {
            code: "ERR_INVALID_CONFIG",
            message: "auth requires tenant mapping via tenant_claim or tenant_id_static"
                .to_string(),
        });
    }
    Ok(())
}

fn principal_from_claims(claims: &Value, mapping: &ClaimMapping) -> Result<Principal, AuthError> {
    let user_id = claim_string(claims, &mapping.user_id_claim)?;

    let tenant_id = match (&mapping.tenant_id_static, &mapping.tenant_claim) {
        (Some(tenant_id), _) => tenant_id.clone(),
        (None, Some(claim)) => claim_string(claims, claim)?,
        (None, None) => {
            return Err(AuthError {
                code: "ERR_INVALID_CONFIG",
                message: "no tenant mapping configured".to_string(),
            });
        }
    };

    let role_raw = claim_string(claims, &mapping.role_claim)?;
    let role = Role::parse(&role_raw).ok_or_else(|| AuthError {
        code: "ERR_AUTH_INVALID",
        message: format!("unknown role `{}`", role_raw),
    })?;

    Ok(Principal {
        user_id,
        tenant_id,
        role,
    })
}

fn bearer_token(headers: &HeaderMap) -> Result<String, AuthError> {
    let authz = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AuthError {
            code: "ERR_AUTH_REQUIRED",
            message: "missing Authorization header".to_string(),
        })?;

    let token = authz
        .strip_prefix("Bearer ")
        .or_else(|| authz.strip_prefix("bearer "))
        .ok_or_else(|| AuthError {
            code: "ERR_AUTH_INVALID",
            message: "Authorization must be a Bearer token".to_string(),
        })?;

    if token.trim().is_empty() {
        return Err(AuthError {
            code: "ERR_AUTH_INVALID",
            message: "Bearer token is empty".to_string(),
        });
    }

    Ok(token.trim().to_string())
}

fn claim_string(claims: &Value, claim: &str) -> Result<String, AuthError> {
    claims
        .get(claim)
        .and_then(|v| v.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .ok_or_else(|| AuthError {
            code: "ERR_AUTH_INVALID",
            message: format!("required claim `{}` is missing or not a string", claim),
        })
}
