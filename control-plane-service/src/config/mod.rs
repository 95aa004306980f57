use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub idp: IdpConfig,
    pub impersonation: ImpersonationConfig,
    pub pagination: PaginationConfig,
    pub export: ExportConfig,
    pub heartbeat: HeartbeatConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    /// Symmetric HMAC signing secret; process-wide and immutable after startup.
    pub secret: String,
    pub issuer: String,
    pub expiration_hours: i64,
    pub refresh_expiration_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdpConfig {
    pub base_url: String,
    pub management_client_id: String,
    pub management_client_secret: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImpersonationConfig {
    /// Default consent window, in hours.
    pub default_consent_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationConfig {
    pub default_page_size: i64,
    pub systems_default_page_size: i64,
    pub max_page_size: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    pub max_export_rows: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    /// Minutes without a heartbeat before a system is reported offline.
    pub timeout_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::Config(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = ServiceConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("control-plane-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", Some("1"), is_prod)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", None, is_prod)?,
            },
            jwt: JwtConfig {
                secret: get_env("JWT_SECRET", None, true)?,
                issuer: get_env("JWT_ISSUER", Some("control-plane"), is_prod)?,
                expiration_hours: parse_env("JWT_EXPIRATION_HOURS", Some("24"), is_prod)?,
                refresh_expiration_hours: parse_env(
                    "JWT_REFRESH_EXPIRATION_HOURS",
                    Some("168"),
                    is_prod,
                )?,
            },
            idp: IdpConfig {
                base_url: get_env("IDP_BASE_URL", None, is_prod)?,
                management_client_id: get_env("IDP_MANAGEMENT_CLIENT_ID", None, is_prod)?,
                management_client_secret: get_env("IDP_MANAGEMENT_CLIENT_SECRET", None, is_prod)?,
                request_timeout_seconds: parse_env("IDP_REQUEST_TIMEOUT_SECONDS", Some("10"), is_prod)?,
            },
            impersonation: ImpersonationConfig {
                default_consent_hours: parse_env(
                    "IMPERSONATION_DEFAULT_CONSENT_HOURS",
                    Some("1"),
                    is_prod,
                )?,
            },
            pagination: PaginationConfig {
                default_page_size: parse_env("PAGINATION_DEFAULT_PAGE_SIZE", Some("20"), is_prod)?,
                systems_default_page_size: parse_env(
                    "PAGINATION_SYSTEMS_DEFAULT_PAGE_SIZE",
                    Some("50"),
                    is_prod,
                )?,
                max_page_size: parse_env("PAGINATION_MAX_PAGE_SIZE", Some("100"), is_prod)?,
            },
            export: ExportConfig {
                max_export_rows: parse_env("MAX_EXPORT_ROWS", Some("10000"), is_prod)?,
            },
            heartbeat: HeartbeatConfig {
                timeout_minutes: parse_env("HEARTBEAT_TIMEOUT_MINUTES", Some("15"), is_prod)?,
            },
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .collect(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::Config(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.secret.len() < 32 {
            return Err(AppError::Config(anyhow::anyhow!(
                "JWT_SECRET must be at least 32 bytes"
            )));
        }

        if self.jwt.expiration_hours <= 0 || self.jwt.refresh_expiration_hours <= 0 {
            return Err(AppError::Config(anyhow::anyhow!(
                "JWT expirations must be positive"
            )));
        }

        if self.impersonation.default_consent_hours <= 0 {
            return Err(AppError::Config(anyhow::anyhow!(
                "IMPERSONATION_DEFAULT_CONSENT_HOURS must be positive"
            )));
        }

        if self.pagination.max_page_size < self.pagination.default_page_size
            || self.pagination.max_page_size < self.pagination.systems_default_page_size
        {
            return Err(AppError::Config(anyhow::anyhow!(
                "PAGINATION_MAX_PAGE_SIZE must be >= default page sizes"
            )));
        }

        if self.environment == Environment::Prod
            && self.security.allowed_origins.iter().any(|o| o == "*")
        {
            return Err(AppError::Config(anyhow::anyhow!(
                "Wildcard CORS origin not allowed in production"
            )));
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::Config(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::Config(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    key: &str,
    default: Option<&str>,
    is_prod: bool,
) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    get_env(key, default, is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::Config(anyhow::anyhow!("{}: {}", key, e)))
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
