//! Service layer API: request gate and account operations
use super::accounts::{Account, Credentials, PasswordChange, Passwords, Role};
use super::audit::{AuditLog, LogType};
use super::config::Config;
use super::error::{ConfigError, ConflictError, StoreError};
use super::session::{Session, SessionSnapshot, authorize, is_fresh};
use super::store::Store;
use super::utils::{ACCOUNT_PREFIX, new_uuid_to_bech32};
use std::sync::Arc;
use tracing::instrument;

pub struct StoreService {
    pub(crate) store: Store,
    pub(crate) audit: AuditLog,
    passwords: Passwords,
}

impl StoreService {
    pub fn new(instance: Arc<sled::Db>, config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            store: Store::new(instance.clone()),
            audit: AuditLog::new(instance),
            passwords: Passwords::new(config)?,
        })
    }

    /// Opens the database at `config.db_path`.
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        let db = sled::open(&config.db_path)?;
        Ok(Self::new(Arc::new(db), config)?)
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Admits the caller if their snapshot is still fresh against the stored
    /// account and satisfies `required`. Returns the live account.
    pub(crate) fn guard(&self, session: &Session, required: &[Role]) -> Result<Account, StoreError> {
        let snapshot = session.snapshot();
        let live = match snapshot {
            Some(snapshot) => self.store.find_account_by_handle(&snapshot.handle)?,
            None => None,
        };
        let fresh = snapshot.is_some_and(|snapshot| is_fresh(snapshot, live.as_ref()));

        if !authorize(snapshot, required, fresh) {
            tracing::debug!(handle = snapshot.map(|s| s.handle.as_str()), fresh, "request refused by gate");
            return Err(StoreError::Unauthorized);
        }
        live.ok_or(StoreError::Unauthorized)
    }

    /// Refuses to authenticate over a session that is still fresh. A stale
    /// snapshot counts as absent and is replaced by the new one.
    fn ensure_signed_out(&self, session: &Session) -> Result<(), StoreError> {
        let Some(snapshot) = session.snapshot() else {
            return Ok(());
        };
        let live = self.store.find_account_by_handle(&snapshot.handle)?;
        if is_fresh(snapshot, live.as_ref()) {
            return Err(ConflictError::AlreadyAuthenticated.into());
        }
        Ok(())
    }

    #[instrument(skip(self, session, credentials), fields(handle = %credentials.handle))]
    pub fn register(&self, session: &mut Session, credentials: Credentials) -> Result<Account, StoreError> {
        self.ensure_signed_out(session)?;
        credentials.validate()?;

        let account = Account::new(
            new_uuid_to_bech32(ACCOUNT_PREFIX)?,
            credentials.handle,
            self.passwords.hash(&credentials.password)?,
        );
        self.store.register_account(&account)?;

        session.set(SessionSnapshot::from(&account));
        self.audit
            .record(LogType::Register, format!("{} registered", account.handle));

        Ok(account)
    }

    /// Creates an admin account outside of any session, for bootstrapping.
    #[instrument(skip(self, credentials), fields(handle = %credentials.handle))]
    pub fn seed_admin(&self, credentials: Credentials) -> Result<Account, StoreError> {
        credentials.validate()?;

        let mut account = Account::new(
            new_uuid_to_bech32(ACCOUNT_PREFIX)?,
            credentials.handle,
            self.passwords.hash(&credentials.password)?,
        );
        account.role = Role::Admin;
        self.store.register_account(&account)?;
        tracing::info!(id = %account.id, "seeded admin account");

        Ok(account)
    }

    #[instrument(skip(self, session, credentials), fields(handle = %credentials.handle))]
    pub fn login(&self, session: &mut Session, credentials: Credentials) -> Result<Account, StoreError> {
        self.ensure_signed_out(session)?;

        let account = self
            .store
            .find_account_by_handle(&credentials.handle)?
            .filter(|account| {
                self.passwords
                    .verify(&credentials.password, &account.password_digest)
            })
            .ok_or(StoreError::Unauthorized)?;

        session.set(SessionSnapshot::from(&account));
        self.audit
            .record(LogType::Login, format!("{} logged in", account.handle));

        Ok(account)
    }

    /// Drops whatever snapshot the session holds, stale or not, so a caller
    /// whose account changed underneath them can always sign out.
    #[instrument(skip(self, session))]
    pub fn logout(&self, session: &mut Session) -> Result<(), StoreError> {
        let Some(snapshot) = session.snapshot() else {
            return Err(StoreError::Unauthorized);
        };
        let handle = snapshot.handle.clone();

        session.destroy();
        self.audit
            .record(LogType::Logout, format!("{handle} logged out"));

        Ok(())
    }

    /// Changing the password bumps the account version, so every session
    /// including the caller's must log in again.
    #[instrument(skip(self, session, change))]
    pub fn change_password(&self, session: &Session, change: PasswordChange) -> Result<(), StoreError> {
        let account = self.guard(session, &[])?;
        change.validate()?;

        if !self
            .passwords
            .verify(&change.password, &account.password_digest)
        {
            return Err(StoreError::Unauthorized);
        }
        let digest = self.passwords.hash(&change.new_password)?;

        self.store.update_if::<Account, _>(&account.id, |current| {
            if current.version != account.version {
                return Err(StoreError::Unauthorized);
            }
            let mut next = current.clone();
            next.set_password_digest(digest.clone());
            Ok(next)
        })?;
        self.audit.record(
            LogType::ChangePassword,
            format!("{} changed their password", account.handle),
        );

        Ok(())
    }

    /// Toggles the blocked flag of a non-admin account.
    #[instrument(skip(self, session))]
    pub fn block_user(&self, session: &Session, handle: &str) -> Result<Account, StoreError> {
        let admin = self.guard(session, &[Role::Admin])?;

        let target = self
            .store
            .find_account_by_handle(handle)?
            .ok_or_else(|| StoreError::not_found("account", handle))?;
        if target.role == Role::Admin {
            return Err(ConflictError::AdminNotBlockable.into());
        }

        let updated = self.store.update_if::<Account, _>(&target.id, |current| {
            let mut next = current.clone();
            next.toggle_blocked();
            Ok(next)
        })?;
        let verb = if updated.blocked { "blocked" } else { "unblocked" };
        self.audit.record(
            LogType::Block,
            format!("{} {verb} {}", admin.handle, updated.handle),
        );

        Ok(updated)
    }

    pub fn me(&self, session: &Session) -> Result<Account, StoreError> {
        self.guard(session, &[])
    }
}
