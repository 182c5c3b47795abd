//! Process-wide settings, read once at startup
use super::error::ConfigError;
use argon2::password_hash::SaltString;
use std::path::PathBuf;

pub const DEFAULT_DB_PATH: &str = "storefront.db";
pub const DEFAULT_HASH_SALT: &str = "c3RvcmVmcm9udHNhbHQ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: PathBuf,
    pub hash_salt: String, // base64 without padding, shared by every password hash
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            hash_salt: DEFAULT_HASH_SALT.to_string(),
        }
    }
}

impl Config {
    /// Reads `APP_DB_PATH` and `APP_HASH_SALT`, loading a `.env` file first when present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let config = Self {
            db_path: std::env::var("APP_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            hash_salt: std::env::var("APP_HASH_SALT").unwrap_or(defaults.hash_salt),
        };
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.salt().map(|_| ())
    }

    pub(crate) fn salt(&self) -> Result<SaltString, ConfigError> {
        SaltString::from_b64(&self.hash_salt).map_err(|e| ConfigError::InvalidSalt(e.to_string()))
    }
}
