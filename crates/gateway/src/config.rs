use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use evintake_auth::{ClaimMapping, Hs256Config, OidcConfig};
use evintake_integrity::IntegrityThresholds;

/// Upper bound for any day-count window (replay, retention).
pub const MAX_WINDOW_DAYS: u64 = 3650;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub db_url: String,
    pub environment: Environment,
    pub auth_mode: AuthMode,
    pub auth_required: bool,
    pub hs256: Option<Hs256Config>,
    pub oidc: Option<OidcConfig>,
    pub thresholds: IntegrityThresholds,
    pub replay_window_days: u64,
    pub idempotency_retention_days: u64,
    pub idempotency_sweep_interval_secs: u64,
    pub blob_root: PathBuf,
    pub public_base_url: String,
    pub presign_secret: Option<String>,
    pub presign_ttl_secs: u64,
    pub signing_key_path: Option<PathBuf>,
    pub signing_public_key_path: Option<PathBuf>,
    pub export_retention_days: u64,
    pub ledger_write_timeout_ms: u64,
    pub rate_limit_per_minute: usize,
    pub rate_limit_per_hour: usize,
    pub metrics_require_auth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Hs256,
    Oidc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

fn invalid(message: impl Into<String>) -> StartupError {
    StartupError {
        code: "ERR_INVALID_CONFIG",
        message: message.into(),
    }
}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("EVINTAKE_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("EVINTAKE_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "EVINTAKE_BIND_ADDR",
        )?;

        let environment = parse_environment(kv.get("EVINTAKE_ENVIRONMENT"))?;
        let auth_mode = parse_auth_mode(kv.get("EVINTAKE_AUTH_MODE"))?;

        let auth_required = match environment {
            Environment::Production => true,
            Environment::Development => parse_flag(kv, "EVINTAKE_AUTH_REQUIRED", false)?,
        };
        if auth_required && auth_mode == AuthMode::None {
            return Err(invalid(
                "authentication is required but EVINTAKE_AUTH_MODE is none",
            ));
        }

        let dev_allow_nonlocal_bind = parse_flag(kv, "EVINTAKE_DEV_ALLOW_NONLOCAL_BIND", false)?;

        if !bind_addr.ip().is_loopback() && auth_mode == AuthMode::None {
            if dev_allow_nonlocal_bind && is_unspecified_ip(bind_addr.ip()) {
                // Explicit dev-only escape hatch for local containers.
            } else {
                return Err(StartupError {
                    code: "ERR_NONLOCAL_BIND_REQUIRES_AUTH",
                    message: "non-local bind requires an auth mode; refuse startup".to_string(),
                });
            }
        }

        let db_url = require_nonempty(kv, "EVINTAKE_DB_URL")?;

        let hs256 = if auth_mode == AuthMode::Hs256 {
            Some(parse_hs256_config(kv)?)
        } else {
            None
        };
        let oidc = if auth_mode == AuthMode::Oidc {
            Some(parse_oidc_config(kv)?)
        } else {
            None
        };

        let max_time_drift_secs = parse_f64(
            kv.get("EVINTAKE_MAX_TIME_DRIFT_SECS"),
            30.0,
            "EVINTAKE_MAX_TIME_DRIFT_SECS",
        )?;
        let min_gps_accuracy_meters = parse_f64(
            kv.get("EVINTAKE_MIN_GPS_ACCURACY_METERS"),
            50.0,
            "EVINTAKE_MIN_GPS_ACCURACY_METERS",
        )?;
        for (key, value) in [
            ("EVINTAKE_MAX_TIME_DRIFT_SECS", max_time_drift_secs),
            ("EVINTAKE_MIN_GPS_ACCURACY_METERS", min_gps_accuracy_meters),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(invalid(format!("{} must be a positive number", key)));
            }
        }
        let thresholds = IntegrityThresholds {
            max_time_drift_secs,
            min_gps_accuracy_meters,
            ..IntegrityThresholds::default()
        };

        let replay_window_days = parse_u64(
            kv.get("EVINTAKE_REPLAY_WINDOW_DAYS"),
            30,
            "EVINTAKE_REPLAY_WINDOW_DAYS",
        )?;
        if replay_window_days > MAX_WINDOW_DAYS {
            return Err(invalid(format!(
                "EVINTAKE_REPLAY_WINDOW_DAYS must be <= {}",
                MAX_WINDOW_DAYS
            )));
        }
        let idempotency_retention_days = parse_u64(
            kv.get("EVINTAKE_IDEMPOTENCY_RETENTION_DAYS"),
            31,
            "EVINTAKE_IDEMPOTENCY_RETENTION_DAYS",
        )?;
        if idempotency_retention_days == 0 {
            return Err(invalid("EVINTAKE_IDEMPOTENCY_RETENTION_DAYS must be >= 1"));
        }
        let idempotency_sweep_interval_secs = parse_u64(
            kv.get("EVINTAKE_IDEMPOTENCY_SWEEP_INTERVAL_SECS"),
            3600,
            "EVINTAKE_IDEMPOTENCY_SWEEP_INTERVAL_SECS",
        )?;

        let blob_root = PathBuf::from(optional_string(kv, "EVINTAKE_BLOB_ROOT").unwrap_or_else(
            || "./data/blobs".to_string(),
        ));

        let public_base_url = optional_string(kv, "EVINTAKE_PUBLIC_BASE_URL")
            .unwrap_or_else(|| format!("http://{}", bind_addr))
            .trim_end_matches('/')
            .to_string();
        if !public_base_url.starts_with("http://") && !public_base_url.starts_with("https://") {
            return Err(invalid("EVINTAKE_PUBLIC_BASE_URL must be an http(s) URL"));
        }

        let presign_secret = optional_string(kv, "EVINTAKE_PRESIGN_SECRET");
        if environment == Environment::Production && presign_secret.is_none() {
            return Err(invalid(
                "EVINTAKE_PRESIGN_SECRET is required in production",
            ));
        }
        if let Some(secret) = presign_secret.as_ref()
            && secret.len() < 16
        {
            return Err(invalid(
                "EVINTAKE_PRESIGN_SECRET must be at least 16 characters",
            ));
        }
        let presign_ttl_secs = parse_u64(
            kv.get("EVINTAKE_PRESIGN_TTL_SECS"),
            3600,
            "EVINTAKE_PRESIGN_TTL_SECS",
        )?;
        if presign_ttl_secs == 0 {
            return Err(invalid("EVINTAKE_PRESIGN_TTL_SECS must be >= 1"));
        }

        let signing_key_path = optional_string(kv, "EVINTAKE_SIGNING_KEY_PATH").map(PathBuf::from);
        let signing_public_key_path =
            optional_string(kv, "EVINTAKE_SIGNING_PUBLIC_KEY_PATH").map(PathBuf::from);

        let export_retention_days = parse_u64(
            kv.get("EVINTAKE_EXPORT_RETENTION_DAYS"),
            7,
            "EVINTAKE_EXPORT_RETENTION_DAYS",
        )?;
        if export_retention_days == 0 {
            return Err(invalid("EVINTAKE_EXPORT_RETENTION_DAYS must be >= 1"));
        }

        let ledger_write_timeout_ms = parse_u64(
            kv.get("EVINTAKE_LEDGER_WRITE_TIMEOUT_MS"),
            2000,
            "EVINTAKE_LEDGER_WRITE_TIMEOUT_MS",
        )?;

        let rate_limit_per_minute = parse_usize(
            kv.get("EVINTAKE_RATE_LIMIT_PER_MINUTE"),
            60,
            "EVINTAKE_RATE_LIMIT_PER_MINUTE",
        )?;
        let rate_limit_per_hour = parse_usize(
            kv.get("EVINTAKE_RATE_LIMIT_PER_HOUR"),
            1000,
            "EVINTAKE_RATE_LIMIT_PER_HOUR",
        )?;

        let metrics_require_auth = parse_flag(kv, "EVINTAKE_METRICS_REQUIRE_AUTH", false)?;

        Ok(Self {
            bind_addr,
            db_url,
            environment,
            auth_mode,
            auth_required,
            hs256,
            oidc,
            thresholds,
            replay_window_days,
            idempotency_retention_days,
            idempotency_sweep_interval_secs,
            blob_root,
            public_base_url,
            presign_secret,
            presign_ttl_secs,
            signing_key_path,
            signing_public_key_path,
            export_retention_days,
            ledger_write_timeout_ms,
            rate_limit_per_minute,
            rate_limit_per_hour,
            metrics_require_auth,
        })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional_string(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn optional_string(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<SocketAddr>()
            .map_err(|_| invalid(format!("{} must be a valid host:port socket address", key))),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| invalid(format!("{} must be an integer", key))),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid(format!("{} must be an integer", key))),
    }
}

fn parse_f64(value: Option<&String>, default: f64, key: &'static str) -> Result<f64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid(format!("{} must be a number", key))),
    }
}

fn parse_environment(value: Option<&String>) -> Result<Environment, StartupError> {
    let env = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("development");

    match env {
        "development" => Ok(Environment::Development),
        "production" => Ok(Environment::Production),
        _ => Err(invalid(
            "EVINTAKE_ENVIRONMENT must be development or production",
        )),
    }
}

fn parse_auth_mode(value: Option<&String>) -> Result<AuthMode, StartupError> {
    let mode = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("none");

    match mode {
        "none" => Ok(AuthMode::None),
        "hs256" => Ok(AuthMode::Hs256),
        "oidc" => Ok(AuthMode::Oidc),
        _ => Err(invalid("EVINTAKE_AUTH_MODE must be none, hs256 or oidc")),
    }
}

fn parse_hs256_config(kv: &HashMap<String, String>) -> Result<Hs256Config, StartupError> {
    let secret = require_nonempty(kv, "EVINTAKE_JWT_SECRET")?;
    if secret.len() < 16 {
        return Err(invalid(
            "EVINTAKE_JWT_SECRET must be at least 16 characters",
        ));
    }

    let clock_skew_secs = parse_u64(
        kv.get("EVINTAKE_JWT_CLOCK_SKEW_SECS"),
        30,
        "EVINTAKE_JWT_CLOCK_SKEW_SECS",
    )?;

    Ok(Hs256Config {
        secret,
        issuer: optional_string(kv, "EVINTAKE_JWT_ISSUER"),
        audience: optional_string(kv, "EVINTAKE_JWT_AUDIENCE"),
        clock_skew: Duration::from_secs(clock_skew_secs),
        claims: ClaimMapping::default(),
    })
}

fn parse_oidc_config(kv: &HashMap<String, String>) -> Result<OidcConfig, StartupError> {
    let issuer = require_nonempty(kv, "EVINTAKE_OIDC_ISSUER")?;

    let jwks_json = optional_string(kv, "EVINTAKE_OIDC_JWKS_JSON");
    let jwks_url = optional_string(kv, "EVINTAKE_OIDC_JWKS_URL");

    if jwks_json.is_none() && jwks_url.is_none() {
        return Err(invalid(
            "oidc requires EVINTAKE_OIDC_JWKS_URL or EVINTAKE_OIDC_JWKS_JSON",
        ));
    }

    let defaults = ClaimMapping::default();
    let tenant_id_static = optional_string(kv, "EVINTAKE_OIDC_TENANT_ID_STATIC");
    let tenant_claim = optional_string(kv, "EVINTAKE_OIDC_TENANT_CLAIM").or(defaults.tenant_claim);

    let claims = ClaimMapping {
        user_id_claim: optional_string(kv, "EVINTAKE_OIDC_USER_ID_CLAIM")
            .unwrap_or(defaults.user_id_claim),
        tenant_claim,
        tenant_id_static,
        role_claim: optional_string(kv, "EVINTAKE_OIDC_ROLE_CLAIM").unwrap_or(defaults.role_claim),
    };

    let jwks_timeout_ms = parse_u64(
        kv.get("EVINTAKE_OIDC_JWKS_TIMEOUT_MS"),
        2000,
        "EVINTAKE_OIDC_JWKS_TIMEOUT_MS",
    )?;
    let jwks_refresh_ttl_secs = parse_u64(
        kv.get("EVINTAKE_OIDC_JWKS_REFRESH_TTL_SECS"),
        300,
        "EVINTAKE_OIDC_JWKS_REFRESH_TTL_SECS",
    )?;
    let clock_skew_secs = parse_u64(
        kv.get("EVINTAKE_OIDC_CLOCK_SKEW_SECS"),
        60,
        "EVINTAKE_OIDC_CLOCK_SKEW_SECS",
    )?;

    Ok(OidcConfig {
        issuer,
        audience: optional_string(kv, "EVINTAKE_OIDC_AUDIENCE"),
        jwks_url,
        jwks_json,
        jwks_timeout: Duration::from_millis(jwks_timeout_ms),
        jwks_refresh_ttl: Duration::from_secs(jwks_refresh_ttl_secs),
        clock_skew: Duration::from_secs(clock_skew_secs),
        claims,
    })
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn parse_flag(
    kv: &HashMap<String, String>,
    key: &'static str,
    default: bool,
) -> Result<bool, StartupError> {
    match kv.get(key).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(default),
        Some(_) => parse_bool(kv.get(key)).ok_or_else(|| invalid(format!("{} must be a boolean", key))),
    }
}

fn is_unspecified_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}
