use crate::error::ConfigurationError;
use crate::util;
use std::env;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|it| it.parse().ok())
        .unwrap_or(default)
}

fn default_mongodb_uri() -> String {
    env_or("MONGODB_URI", "mongodb://localhost:27017")
}

fn default_mongodb_db() -> String {
    env_or("MONGODB_DB_NAME", "eduportal")
}

fn default_environment() -> Environment {
    match env::var("APP_ENV").as_deref() {
        Ok("production") => Environment::Production,
        Ok("test") => Environment::Test,
        _ => Environment::Development,
    }
}

fn default_public_url() -> String {
    env_or("PUBLIC_URL", "http://localhost:8000")
}

fn default_admin_emails() -> Vec<String> {
    env::var("ADMIN_EMAILS")
        .map(|it| {
            it.split(',')
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn default_jwt_secret() -> Option<String> {
    env::var("JWT_SECRET").ok().filter(|it| !it.is_empty())
}

fn default_security_dir() -> PathBuf {
    PathBuf::from(env_or("SECURITY_DIR", "./security"))
}

fn default_jwt_lifetime_hours() -> i64 {
    env_parse("JWT_LIFETIME_HOURS", 24 * 7)
}

fn default_two_factor() -> bool {
    env_parse("TWO_FACTOR_DEFAULT", true)
}

fn default_allowed_subjects() -> Vec<String> {
    ["math", "science", "history", "literature", "art"]
        .iter()
        .map(|it| it.to_string())
        .collect()
}

fn default_media_dir() -> PathBuf {
    PathBuf::from(env_or("MEDIA_DIR", "./public/media"))
}

fn default_max_upload_mb() -> u64 {
    env_parse("MAX_UPLOAD_SIZE", 50)
}

fn default_realtime_capacity() -> usize {
    env_parse("REALTIME_CAPACITY", 256)
}

fn default_smtp() -> Option<SmtpConfig> {
    let username = env::var("EMAIL_USER").ok()?;
    let password = env::var("EMAIL_PASS").ok()?;
    Some(SmtpConfig {
        host: env_or("SMTP_HOST", "smtp.gmail.com"),
        port: env_parse("SMTP_PORT", 587),
        from: env_or("EMAIL_FROM", &username),
        username,
        password,
    })
}

fn default_cloudinary() -> Option<CloudinaryConfig> {
    Some(CloudinaryConfig {
        cloud_name: env::var("CLOUDINARY_CLOUD_NAME").ok()?,
        api_key: env::var("CLOUDINARY_API_KEY").ok()?,
        api_secret: env::var("CLOUDINARY_API_SECRET").ok()?,
    })
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Test,
    Production,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseRetry {
    pub max_attempts: u32,
    pub interval_ms: u64,
}

impl Default for DatabaseRetry {
    fn default() -> Self {
        DatabaseRetry {
            max_attempts: 5,
            interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip)]
    file_path: PathBuf,

    #[serde(default = "default_mongodb_uri")]
    pub mongodb_uri: String,
    #[serde(default = "default_mongodb_db")]
    pub mongodb_db: String,
    #[serde(default)]
    pub database_retry: DatabaseRetry,

    #[serde(default = "default_environment")]
    pub environment: Environment,
    /// Externally reachable base URL used in emailed links.
    #[serde(default = "default_public_url")]
    pub public_url: String,
    #[serde(default)]
    pub expose_error_details: Option<bool>,

    #[serde(default = "default_admin_emails")]
    pub admin_emails: Vec<String>,

    /// HS256 secret. When unset, PS256 keys from `security_dir` are used.
    #[serde(default = "default_jwt_secret", skip_serializing)]
    pub jwt_secret: Option<String>,
    #[serde(default = "default_security_dir")]
    pub security_dir: PathBuf,
    #[serde(default = "default_jwt_lifetime_hours")]
    pub jwt_lifetime_hours: i64,
    #[serde(default = "default_two_factor")]
    pub two_factor_default: bool,

    #[serde(default = "default_allowed_subjects")]
    pub allowed_subjects: Vec<String>,

    #[serde(default = "default_smtp", skip_serializing)]
    pub smtp: Option<SmtpConfig>,
    #[serde(default = "default_cloudinary", skip_serializing)]
    pub cloudinary: Option<CloudinaryConfig>,
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: u64,

    #[serde(default = "default_realtime_capacity")]
    pub realtime_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            file_path: config_dir().join("settings.yml"),
            mongodb_uri: default_mongodb_uri(),
            mongodb_db: default_mongodb_db(),
            database_retry: DatabaseRetry::default(),
            environment: default_environment(),
            public_url: default_public_url(),
            expose_error_details: None,
            admin_emails: default_admin_emails(),
            jwt_secret: default_jwt_secret(),
            security_dir: default_security_dir(),
            jwt_lifetime_hours: default_jwt_lifetime_hours(),
            two_factor_default: default_two_factor(),
            allowed_subjects: default_allowed_subjects(),
            smtp: default_smtp(),
            cloudinary: default_cloudinary(),
            media_dir: default_media_dir(),
            max_upload_mb: default_max_upload_mb(),
            realtime_capacity: default_realtime_capacity(),
        }
    }
}

#[inline]
fn config_dir() -> PathBuf {
    PathBuf::from(env::var("CONFIG_DIR").unwrap_or("./config".to_string()))
}

impl Config {
    pub fn load() -> Result<Config, ConfigurationError> {
        let config_file = util::find_first_subpath(
            config_dir(),
            &["settings.yml", "settings.yaml"],
            Path::exists,
        )
        .ok_or_else(|| ConfigurationError::NotFound(config_dir()))?;

        let file = File::open(&config_file)?;
        let mut config: Config = serde_yaml::from_reader(BufReader::new(file))?;
        config.file_path = config_file;

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigurationError> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&self.file_path)?;
        let mut out = BufWriter::new(file);
        serde_yaml::to_writer(&mut out, self)?;
        out.flush()?;
        Ok(())
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    pub fn expose_error_details(&self) -> bool {
        self.expose_error_details.unwrap_or(!self.is_production())
    }

    pub fn is_admin_email(&self, email: &str) -> bool {
        self.admin_emails
            .iter()
            .any(|it| it.eq_ignore_ascii_case(email))
    }

    pub fn allows_subject(&self, subject: &str) -> bool {
        self.allowed_subjects
            .iter()
            .any(|it| it.eq_ignore_ascii_case(subject))
    }

    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb * 1024 * 1024
    }

    /// Absolute link into the API, used for emailed verification and reset links.
    pub fn api_link(&self, path: &str) -> String {
        format!(
            "{}/api/v1/{}",
            self.public_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Config with no external collaborators, used by tests.
    pub fn for_tests() -> Config {
        Config {
            environment: Environment::Test,
            jwt_secret: Some("test-secret-which-is-long-enough".to_string()),
            smtp: None,
            cloudinary: None,
            admin_emails: vec!["admin@example.com".to_string()],
            media_dir: env::temp_dir().join("eduportal-test-media"),
            ..Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let config: Config = serde_yaml::from_str("mongodb_db: custom\nmax_upload_mb: 5\n")
            .expect("valid yaml");
        assert_eq!(config.mongodb_db, "custom");
        assert_eq!(config.max_upload_bytes(), 5 * 1024 * 1024);
        assert_eq!(config.allowed_subjects.len(), 5);
        assert_eq!(config.database_retry.max_attempts, 5);
    }

    #[test]
    fn error_details_follow_environment() {
        let mut config = Config::for_tests();
        assert!(config.expose_error_details());
        config.environment = Environment::Production;
        assert!(!config.expose_error_details());
        config.expose_error_details = Some(true);
        assert!(config.expose_error_details());
    }

    #[test]
    fn api_links_are_joined_cleanly() {
        let mut config = Config::for_tests();
        config.public_url = "https://portal.example.com/".to_string();
        assert_eq!(
            config.api_link("/auth/verify-email/abc"),
            "https://portal.example.com/api/v1/auth/verify-email/abc"
        );
    }

    #[test]
    fn subject_and_admin_checks_ignore_case() {
        let config = Config::for_tests();
        assert!(config.allows_subject("Math"));
        assert!(!config.allows_subject("chemistry"));
        assert!(config.is_admin_email("ADMIN@example.com"));
    }
}
