use std::env;

use crate::{models::AppError, password::DEFAULT_ROUNDS};

/// Secret used when `JWT_SECRET` is unset. Only acceptable outside production.
pub const DEV_JWT_SECRET: &str = "dev-only-secret-change-me-0123456789abcdef";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct JwtConfig {
    pub secret: String,
    pub refresh_secret: String,
    pub expiry_hours: i64,
    pub refresh_expiry_hours: i64,
}

impl JwtConfig {
    pub fn uses_dev_secret(&self) -> bool { self.secret == DEV_JWT_SECRET }
}

#[derive(Clone, Debug)]
pub struct SecurityConfig {
    pub bcrypt_cost: u32,
    pub rate_limit_window_secs: u64,
    pub rate_limit_max: u32,
    pub login_rate_limit_max: u32,
    pub csrf_enforce: bool,
    pub csrf_ttl_secs: u64,
    pub cors_origins: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct UploadConfig {
    pub max_bytes: usize,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    pub security: SecurityConfig,
    pub upload: UploadConfig,
    pub seed_demo_data: bool,
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig { host: "0.0.0.0".to_string(), port: 8080 },
            jwt: JwtConfig {
                secret: DEV_JWT_SECRET.to_string(),
                refresh_secret: format!("{}-refresh", DEV_JWT_SECRET),
                expiry_hours: 1,
                refresh_expiry_hours: 24 * 7,
            },
            security: SecurityConfig {
                bcrypt_cost: DEFAULT_ROUNDS,
                rate_limit_window_secs: 15 * 60,
                rate_limit_max: 100,
                login_rate_limit_max: 10,
                csrf_enforce: false,
                csrf_ttl_secs: 60 * 60,
                cors_origins: vec!["http://localhost:3000".to_string(), "http://localhost:5173".to_string()],
            },
            upload: UploadConfig { max_bytes: 5 * 1024 * 1024 },
            seed_demo_data: true,
            environment: "development".to_string(),
        }
    }
}

impl AppConfig {
    /// Reads the environment on top of [`AppConfig::default`].
    pub fn from_env() -> Result<Self, AppError> {
        let mut cfg = Self::default();

        if let Ok(host) = env::var("HOST") { cfg.server.host = host; }
        cfg.server.port = parse_var("PORT")?.unwrap_or(cfg.server.port);

        if let Ok(secret) = env::var("JWT_SECRET") {
            if secret.len() < 32 {
                return Err(AppError::Validation("JWT_SECRET must be at least 32 characters".into()));
            }
            cfg.jwt.refresh_secret = format!("{}-refresh", secret);
            cfg.jwt.secret = secret;
        }
        if let Ok(secret) = env::var("JWT_REFRESH_SECRET") { cfg.jwt.refresh_secret = secret; }
        cfg.jwt.expiry_hours = parse_var("JWT_EXPIRY_HOURS")?.unwrap_or(cfg.jwt.expiry_hours);
        cfg.jwt.refresh_expiry_hours = parse_var("JWT_REFRESH_EXPIRY_HOURS")?.unwrap_or(cfg.jwt.refresh_expiry_hours);

        cfg.security.bcrypt_cost = parse_var("BCRYPT_COST")?.unwrap_or(cfg.security.bcrypt_cost);
        if !(4..=31).contains(&cfg.security.bcrypt_cost) {
            return Err(AppError::Validation("BCRYPT_COST must be between 4 and 31".into()));
        }
        cfg.security.rate_limit_window_secs =
            parse_var("RATE_LIMIT_WINDOW_SECS")?.unwrap_or(cfg.security.rate_limit_window_secs);
        cfg.security.rate_limit_max = parse_var("RATE_LIMIT_MAX")?.unwrap_or(cfg.security.rate_limit_max);
        cfg.security.login_rate_limit_max =
            parse_var("LOGIN_RATE_LIMIT_MAX")?.unwrap_or(cfg.security.login_rate_limit_max);
        cfg.security.csrf_enforce = parse_var("CSRF_ENFORCE")?.unwrap_or(cfg.security.csrf_enforce);
        if let Ok(origins) = env::var("CORS_ORIGINS") {
            cfg.security.cors_origins = parse_cors_origins(&origins)?;
        }

        cfg.upload.max_bytes = parse_var("UPLOAD_MAX_BYTES")?.unwrap_or(cfg.upload.max_bytes);
        cfg.seed_demo_data = parse_var("SEED_DEMO_DATA")?.unwrap_or(cfg.seed_demo_data);
        if let Ok(environment) = env::var("APP_ENV") { cfg.environment = environment; }

        if cfg.is_production() && cfg.jwt.uses_dev_secret() {
            return Err(AppError::Validation("JWT_SECRET is required in production".into()));
        }
        Ok(cfg)
    }

    pub fn is_production(&self) -> bool { self.environment.eq_ignore_ascii_case("production") }
}

/// Comma-separated origin list. Credentialed CORS cannot use a wildcard, so `*` is rejected.
fn parse_cors_origins(raw: &str) -> Result<Vec<String>, AppError> {
    let origins: Vec<String> = raw.split(',').map(str::trim).filter(|o| !o.is_empty()).map(String::from).collect();
    if origins.iter().any(|o| o.contains('*')) {
        return Err(AppError::Validation("CORS_ORIGINS must list explicit origins, not *".into()));
    }
    Ok(origins)
}

/// `Ok(None)` when unset; an error when set but unparsable.
fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, AppError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| AppError::Validation(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_development_friendly() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 8080);
        assert!(cfg.jwt.uses_dev_secret());
        assert!(!cfg.is_production());
        assert!(!cfg.security.csrf_enforce);
        assert_eq!(cfg.security.rate_limit_max, 100);
        assert_eq!(cfg.security.login_rate_limit_max, 10);
    }

    #[test]
    fn cors_origins_reject_wildcards() {
        assert_eq!(
            parse_cors_origins(" http://a.test , ,http://b.test").unwrap(),
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
        assert!(matches!(parse_cors_origins("*"), Err(AppError::Validation(_))));
        assert!(parse_cors_origins("http://a.test,*").is_err());
    }

    #[test]
    fn parse_var_reports_bad_values() {
        // Unique names so parallel tests do not interfere.
        env::set_var("CRUD_SERVER_TEST_PORT_OK", "8081");
        env::set_var("CRUD_SERVER_TEST_PORT_BAD", "eighty");
        assert_eq!(parse_var::<u16>("CRUD_SERVER_TEST_PORT_OK").unwrap(), Some(8081));
        assert!(parse_var::<u16>("CRUD_SERVER_TEST_PORT_BAD").is_err());
        assert_eq!(parse_var::<u16>("CRUD_SERVER_TEST_PORT_UNSET").unwrap(), None);
    }
}
