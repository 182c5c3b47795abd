//! Session snapshots and the freshness/role gate
use super::accounts::{Account, Role};

/// Copy of the account's privilege state captured at login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub handle: String,
    pub role: Role,
    pub blocked: bool,
    pub version: u64,
}

/// Per-connection session storage. Holds at most one snapshot.
#[derive(Debug, Default)]
pub struct Session {
    snapshot: Option<SessionSnapshot>,
}

impl From<&Account> for SessionSnapshot {
    fn from(account: &Account) -> Self {
        Self {
            handle: account.handle.clone(),
            role: account.role,
            blocked: account.blocked,
            version: account.version,
        }
    }
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn snapshot(&self) -> Option<&SessionSnapshot> {
        self.snapshot.as_ref()
    }
    // a new login replaces the old snapshot wholesale
    pub fn set(&mut self, snapshot: SessionSnapshot) {
        self.snapshot = Some(snapshot);
    }
    pub fn destroy(&mut self) {
        self.snapshot = None;
    }
}

/// A snapshot is authoritative only while it matches the live account version.
/// A missing account is never fresh.
pub fn is_fresh(snapshot: &SessionSnapshot, live: Option<&Account>) -> bool {
    live.is_some_and(|account| account.version == snapshot.version)
}

/// Decides whether a caller may proceed. Staleness dominates role matching,
/// and an empty `required` set admits any fresh snapshot, blocked or not.
pub fn authorize(snapshot: Option<&SessionSnapshot>, required: &[Role], is_fresh: bool) -> bool {
    let Some(snapshot) = snapshot else {
        return false;
    };
    if !is_fresh {
        return false;
    }
    if required.is_empty() {
        return true;
    }
    if snapshot.blocked {
        return false;
    }
    required.contains(&snapshot.role)
}
