use std::convert::Infallible;

/// Every failure a storefront operation can surface to its caller.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),
    #[error("{kind} {id} doesn't exist")]
    NotFound { kind: &'static str, id: String },
    // never names the guard that failed
    #[error("Not authorized")]
    Unauthorized,
    #[error("{0}")]
    Conflict(#[from] ConflictError),
    #[error("Storage failure: {0}")]
    Persistence(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Handle must be 8 to 20 characters")]
    HandleLength,
    #[error("Password must be 8 to 100 characters")]
    PasswordLength,
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("Product must have at least 1 item")]
    NoItems,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConflictError {
    #[error("Transaction was already confirmed / canceled")]
    AlreadySettled,
    #[error("Transaction is for a {found} product, couldn't be confirmed as {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("Handle is already taken")]
    HandleTaken,
    #[error("Couldn't block the account. Account is an admin")]
    AdminNotBlockable,
    #[error("Already authenticated")]
    AlreadyAuthenticated,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("APP_HASH_SALT is not a usable salt: {0}")]
    InvalidSalt(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<minicbor::decode::Error> for StoreError {
    fn from(err: minicbor::decode::Error) -> Self {
        Self::Persistence(format!("corrupt record: {err}"))
    }
}

impl From<minicbor::encode::Error<Infallible>> for StoreError {
    fn from(err: minicbor::encode::Error<Infallible>) -> Self {
        Self::Persistence(format!("failed to encode record: {err}"))
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Persistence(format!("{err:#}"))
    }
}
