use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey};
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::SecurityError;

const USER_AUTH_PUBLIC: &str = "user_auth.pem.pub";
const USER_AUTH_PRIVATE: &str = "user_auth.pem";

#[derive(Clone)]
pub struct JwtKeys {
    pub algorithm: Algorithm,
    pub encoding: EncodingKey,
    pub decoding: DecodingKey,
}

impl JwtKeys {
    pub fn hmac(secret: impl AsRef<[u8]>) -> JwtKeys {
        JwtKeys {
            algorithm: Algorithm::HS256,
            encoding: EncodingKey::from_secret(secret.as_ref()),
            decoding: DecodingKey::from_secret(secret.as_ref()),
        }
    }

    pub fn rsa_pem(private: &[u8], public: &[u8]) -> Result<JwtKeys, SecurityError> {
        Ok(JwtKeys {
            algorithm: Algorithm::PS256,
            encoding: EncodingKey::from_rsa_pem(private)?,
            decoding: DecodingKey::from_rsa_pem(public)?,
        })
    }
}

impl std::fmt::Debug for JwtKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JwtKeys({:?})", self.algorithm)
    }
}

#[derive(Debug, Clone)]
pub struct Security {
    pub jwt_keys: JwtKeys,
    pub token_lifetime: chrono::Duration,
}

impl Security {
    pub fn load(config: &Config) -> Result<Security, SecurityError> {
        let token_lifetime = chrono::Duration::hours(config.jwt_lifetime_hours);

        if let Some(secret) = &config.jwt_secret {
            tracing::info!("Using HS256 JWT secret from configuration.");
            return Ok(Security {
                jwt_keys: JwtKeys::hmac(secret),
                token_lifetime,
            });
        }

        tracing::info!("Loading JWT signing keys...");
        let dir = config.security_dir.as_path();
        let pub_key = fs::read(dir.join(USER_AUTH_PUBLIC)).ok();
        let priv_key = fs::read(dir.join(USER_AUTH_PRIVATE)).ok();

        let jwt_keys = match (pub_key, priv_key) {
            (Some(public), Some(private)) => {
                tracing::info!("Loaded JWT keys.");
                JwtKeys::rsa_pem(&private, &public)?
            }
            #[cfg(feature = "generate-security")]
            _ => generate_rsa_keys(dir)?,
            #[cfg(not(feature = "generate-security"))]
            _ => return Err(SecurityError::MissingKeys(dir.to_path_buf())),
        };

        Ok(Security {
            jwt_keys,
            token_lifetime,
        })
    }
}

#[cfg(feature = "generate-security")]
fn generate_rsa_keys(dir: &Path) -> Result<JwtKeys, SecurityError> {
    use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
    use rsa::pkcs8::EncodePublicKey;

    tracing::info!("Unable to load private and/or public user auth key(s). Generating a new pair.");
    fs::create_dir_all(dir)?;

    tracing::info!("Generating a private RSA key. This will take a while...");
    let mut rng = rand::thread_rng();
    let rsa_sk = rsa::RsaPrivateKey::new(&mut rng, 2048)
        .map_err(|e| SecurityError::Generate(e.to_string()))?;

    tracing::info!("Creating PS256 private key...");
    let private = rsa_sk
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| SecurityError::Generate(e.to_string()))?
        .to_string()
        .into_bytes();
    fs::write(dir.join(USER_AUTH_PRIVATE), private.as_slice())?;

    tracing::info!("Creating PS256 public key...");
    let public = rsa_sk
        .to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| SecurityError::Generate(e.to_string()))?
        .into_bytes();
    fs::write(dir.join(USER_AUTH_PUBLIC), public.as_slice())?;

    tracing::info!("Done generating JWT keys.");
    JwtKeys::rsa_pem(&private, &public)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_secret_selects_hmac() {
        let security = Security::load(&Config::for_tests()).expect("hmac keys");
        assert_eq!(security.jwt_keys.algorithm, Algorithm::HS256);
        assert_eq!(security.token_lifetime, chrono::Duration::hours(24 * 7));
    }

    #[cfg(not(feature = "generate-security"))]
    #[test]
    fn missing_keys_without_generation_is_an_error() {
        let mut config = Config::for_tests();
        config.jwt_secret = None;
        config.security_dir = std::env::temp_dir().join("eduportal-no-keys");
        assert!(matches!(
            Security::load(&config),
            Err(SecurityError::MissingKeys(_))
        ));
    }
}
