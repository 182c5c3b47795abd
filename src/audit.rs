//! Append-only audit trail
use super::error::StoreError;
use super::types::TimeStamp;
use chrono::Utc;
use std::sync::Arc;
use uuid7::uuid7;

const AUDIT_TREE: &str = "audit";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    #[n(0)]
    Login,
    #[n(1)]
    Register,
    #[n(2)]
    Logout,
    #[n(3)]
    ChangePassword,
    #[n(4)]
    Block,
    #[n(5)]
    AddProduct,
    #[n(6)]
    EditProduct,
    #[n(7)]
    BuyItem,
    #[n(8)]
    ConfirmCash,
    #[n(9)]
    ConfirmVoucher,
    #[n(10)]
    CancelTransaction,
    #[n(11)]
    CancelMyTransaction,
    #[n(12)]
    AddProofOfPayment,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    #[n(0)]
    pub id: String, // uuid7, time ordered
    #[n(1)]
    pub log_type: LogType,
    #[n(2)]
    pub message: String,
    #[n(3)]
    pub created_at: TimeStamp<Utc>,
}

/// Audit sink backed by its own sled tree, keyed by raw uuid7 bytes so
/// iteration yields entries in the order they were recorded.
pub struct AuditLog {
    instance: Arc<sled::Db>,
}

impl LogType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogType::Login => "login",
            LogType::Register => "register",
            LogType::Logout => "logout",
            LogType::ChangePassword => "change_password",
            LogType::Block => "block",
            LogType::AddProduct => "add_product",
            LogType::EditProduct => "edit_product",
            LogType::BuyItem => "buy_item",
            LogType::ConfirmCash => "confirm_cash",
            LogType::ConfirmVoucher => "confirm_voucher",
            LogType::CancelTransaction => "cancel_transaction",
            LogType::CancelMyTransaction => "cancel_my_transaction",
            LogType::AddProofOfPayment => "add_proof_of_payment",
        }
    }
}

impl AuditLog {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    /// Fire-and-forget: a failed write is logged and never fails the caller.
    pub fn record(&self, log_type: LogType, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(log_type = log_type.as_str(), %message, "audit");

        if let Err(err) = self.append(log_type, message) {
            tracing::warn!(log_type = log_type.as_str(), error = %err, "failed to append audit entry");
        }
    }

    fn append(&self, log_type: LogType, message: String) -> Result<(), StoreError> {
        let key = uuid7();
        let entry = AuditEntry {
            id: key.to_string(),
            log_type,
            message,
            created_at: TimeStamp::new(),
        };
        self.instance
            .open_tree(AUDIT_TREE)?
            .insert(key.as_bytes(), minicbor::to_vec(&entry)?)?;
        Ok(())
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> Result<Vec<AuditEntry>, StoreError> {
        self.instance
            .open_tree(AUDIT_TREE)?
            .iter()
            .values()
            .map(|value| -> Result<AuditEntry, StoreError> { Ok(minicbor::decode(&value?)?) })
            .collect()
    }
}
