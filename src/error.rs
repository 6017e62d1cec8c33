use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("configuration file not found in '{0}'")]
    NotFound(PathBuf),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("unable to read or write key material: {0}")]
    Io(#[from] std::io::Error),
    #[error("JWT key material is invalid: {0}")]
    InvalidKey(#[from] jsonwebtoken::errors::Error),
    #[error("JWT signing keys not found in '{0}'")]
    MissingKeys(PathBuf),
    #[cfg(feature = "generate-security")]
    #[error("unable to generate RSA keys: {0}")]
    Generate(String),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("unable to reach MongoDB after {attempts} attempts: {source}")]
    DatabaseUnreachable {
        attempts: u32,
        #[source]
        source: mongodb::error::Error,
    },

    #[error("invalid CORS settings: {0}")]
    Cors(#[from] rocket_cors::Error),

    // External errors
    #[error(transparent)]
    Database(#[from] mongodb::error::Error),
    #[error(transparent)]
    Mail(#[from] crate::service::mail::MailError),
    #[error(transparent)]
    Media(#[from] crate::service::media::MediaError),
}
