//! Accounts and the password capability
use super::config::Config;
use super::error::{ConfigError, StoreError, ValidationError};
use super::store::Record;
use super::types::TimeStamp;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::Utc;

pub const DEFAULT_IMAGE: &str = "/user-no-img.jpg";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    #[n(0)]
    Admin,
    #[n(1)]
    User,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Account {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7
    #[n(1)]
    pub handle: String, // unique
    #[n(2)]
    pub password_digest: String, // argon2 PHC string
    #[n(3)]
    pub role: Role,
    #[n(4)]
    pub blocked: bool,
    #[n(5)]
    pub version: u64,
    #[n(6)]
    pub image: String,
    #[n(7)]
    pub created_at: TimeStamp<Utc>,
    #[n(8)]
    pub updated_at: TimeStamp<Utc>,
}

/// Handle and password as submitted at registration or login.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub handle: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct PasswordChange {
    pub password: String,
    pub new_password: String,
}

impl Record for Account {
    const TREE: &'static str = "accounts";
    const KIND: &'static str = "account";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Account {
    pub fn new(id: String, handle: String, password_digest: String) -> Self {
        let now = TimeStamp::new();
        Self {
            id,
            handle,
            password_digest,
            role: Role::User,
            blocked: false,
            version: 0,
            image: DEFAULT_IMAGE.to_string(),
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Any change that must invalidate outstanding sessions goes through here.
    pub fn bump_version(&mut self) {
        self.version += 1;
        self.updated_at = TimeStamp::new();
    }

    pub fn set_password_digest(&mut self, digest: String) {
        self.password_digest = digest;
        self.bump_version();
    }

    pub fn toggle_blocked(&mut self) {
        self.blocked = !self.blocked;
        self.bump_version();
    }
}

impl Credentials {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let handle_len = self.handle.chars().count();
        if !(8..=20).contains(&handle_len) {
            return Err(ValidationError::HandleLength);
        }
        let password_len = self.password.chars().count();
        if !(8..=100).contains(&password_len) {
            return Err(ValidationError::PasswordLength);
        }
        Ok(())
    }
}

impl PasswordChange {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.new_password.chars().count() < 8 {
            return Err(ValidationError::PasswordLength);
        }
        Ok(())
    }
}

/// Hashes and verifies passwords with the salt configured at startup.
pub struct Passwords {
    salt: SaltString,
    argon2: Argon2<'static>,
}

impl Passwords {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            salt: config.salt()?,
            argon2: Argon2::default(),
        })
    }

    pub fn hash(&self, password: &str) -> Result<String, StoreError> {
        self.argon2
            .hash_password(password.as_bytes(), &self.salt)
            .map(|hash| hash.to_string())
            .map_err(|e| StoreError::Persistence(format!("failed to hash password: {e}")))
    }

    pub fn verify(&self, password: &str, digest: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(digest) else {
            return false;
        };
        self.argon2
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}
