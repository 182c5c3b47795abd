//! Transaction lifecycle: purchase, proof of payment, confirmation and cancellation
use super::accounts::{Account, Role};
use super::audit::LogType;
use super::catalog::{Product, ProductType, Variant};
use super::error::{ConflictError, StoreError, ValidationError};
use super::service::StoreService;
use super::session::Session;
use super::store::Record;
use super::types::TimeStamp;
use super::utils::{TRANSACTION_PREFIX, new_uuid_to_bech32};
use chrono::Utc;
use std::collections::HashSet;
use tracing::instrument;

pub const AWAITING_PROOF: &str = "Order not processed yet, please upload proof of payment";
pub const PROCESSING: &str = "Order is being processed";
pub const COMPLETED: &str = "Order completed";
pub const CANCELED_BY_ADMIN: &str = "Order canceled by admin";
pub const CANCELED_BY_BUYER: &str = "Order canceled by you";

/// Purchase record. Product and variant fields are copied at purchase time so
/// later catalog edits never rewrite history.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub account_id: String, // buyer
    #[n(2)]
    pub variant_id: String,
    #[n(3)]
    pub product_name: String,
    #[n(4)]
    pub product_type: ProductType,
    #[n(5)]
    pub item_value: String,
    #[n(6)]
    pub item_price: u64,
    #[n(7)]
    pub primary_form_name: Option<String>,
    #[n(8)]
    pub secondary_form_name: Option<String>,
    #[n(9)]
    pub primary_form_value: Option<String>,
    #[n(10)]
    pub secondary_form_value: Option<String>,
    #[n(11)]
    pub proof_of_payment: Option<String>,
    #[n(12)]
    pub voucher: Option<String>,
    #[n(13)]
    pub message: String,
    #[n(14)]
    pub pending: bool,
    #[n(15)]
    pub success: bool,
    #[n(16)]
    pub created_at: TimeStamp<Utc>,
    #[n(17)]
    pub updated_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Pending,
    Confirmed,
    Canceled,
}

/// A terminal transition requested by an admin or the buyer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    ConfirmCash { message: Option<String> },
    ConfirmVoucher { voucher: String, message: Option<String> },
    Cancel { message: String },
}

#[derive(Debug, Clone, Default)]
pub struct Purchase {
    pub variant_id: String,
    pub primary_form_value: Option<String>,
    pub secondary_form_value: Option<String>,
}

/// Target and optional status message shared by the admin settlement operations.
#[derive(Debug, Clone)]
pub struct SettleArgs {
    pub id: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VoucherArgs {
    pub settle: SettleArgs,
    pub voucher: String,
}

#[derive(Debug, Clone)]
pub struct ProofOfPayment {
    pub id: String,
    pub image: String, // opaque reference to the uploaded proof
}

impl Record for Transaction {
    const TREE: &'static str = "transactions";
    const KIND: &'static str = "transaction";

    fn id(&self) -> &str {
        &self.id
    }
}

impl VoucherArgs {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.voucher.trim().is_empty() {
            return Err(ValidationError::Empty("voucher"));
        }
        Ok(())
    }
}

impl ProofOfPayment {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.image.trim().is_empty() {
            return Err(ValidationError::Empty("proof of payment"));
        }
        Ok(())
    }
}

impl Transaction {
    pub fn purchase(
        id: String,
        buyer: &Account,
        product: &Product,
        variant: &Variant,
        purchase: Purchase,
    ) -> Self {
        let now = TimeStamp::new();
        Self {
            id,
            account_id: buyer.id.clone(),
            variant_id: variant.id.clone(),
            product_name: product.details.name.clone(),
            product_type: product.details.product_type,
            item_value: variant.value.clone(),
            item_price: variant.price,
            primary_form_name: product.details.primary_form_name.clone(),
            secondary_form_name: product.details.secondary_form_name.clone(),
            primary_form_value: purchase.primary_form_value,
            secondary_form_value: purchase.secondary_form_value,
            proof_of_payment: None,
            voucher: None,
            message: AWAITING_PROOF.to_string(),
            pending: true,
            success: false,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn state(&self) -> TransactionState {
        match (self.pending, self.success) {
            (true, _) => TransactionState::Pending,
            (false, true) => TransactionState::Confirmed,
            (false, false) => TransactionState::Canceled,
        }
    }

    fn expect_type(&self, expected: ProductType) -> Result<(), ConflictError> {
        if self.product_type != expected {
            return Err(ConflictError::TypeMismatch {
                expected: expected.as_str(),
                found: self.product_type.as_str(),
            });
        }
        Ok(())
    }

    /// Computes the terminal record for `settlement`, refusing anything that
    /// is no longer pending or has the wrong product type.
    pub fn settle(&self, settlement: &Settlement) -> Result<Transaction, ConflictError> {
        if self.state() != TransactionState::Pending {
            return Err(ConflictError::AlreadySettled);
        }

        let mut next = self.clone();
        match settlement {
            Settlement::ConfirmCash { message } => {
                self.expect_type(ProductType::Cash)?;
                next.success = true;
                next.message = message.clone().unwrap_or_else(|| COMPLETED.to_string());
            }
            Settlement::ConfirmVoucher { voucher, message } => {
                self.expect_type(ProductType::Voucher)?;
                next.success = true;
                next.voucher = Some(voucher.clone());
                next.message = message.clone().unwrap_or_else(|| COMPLETED.to_string());
            }
            Settlement::Cancel { message } => {
                next.success = false;
                next.message = message.clone();
            }
        }
        next.pending = false;
        next.updated_at = TimeStamp::new();

        Ok(next)
    }

    pub fn with_proof(&self, image: &str) -> Transaction {
        let mut next = self.clone();
        next.proof_of_payment = Some(image.to_string());
        next.message = PROCESSING.to_string();
        next.updated_at = TimeStamp::new();
        next
    }
}

fn newest_first(transactions: &mut [Transaction]) {
    transactions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

impl StoreService {
    #[instrument(skip(self, session, purchase), fields(variant_id = %purchase.variant_id))]
    pub fn buy_item(&self, session: &Session, purchase: Purchase) -> Result<Transaction, StoreError> {
        let buyer = self.guard(session, &[Role::User])?;

        let (product, variant) = self
            .store
            .find_variant(&purchase.variant_id)?
            .filter(|(_, variant)| !variant.deleted)
            .ok_or_else(|| StoreError::not_found("item", &purchase.variant_id))?;

        let transaction = Transaction::purchase(
            new_uuid_to_bech32(TRANSACTION_PREFIX)?,
            &buyer,
            &product,
            &variant,
            purchase,
        );
        self.store.save(&transaction)?;
        self.audit.record(
            LogType::BuyItem,
            format!("{} bought item {}", buyer.handle, variant.id),
        );

        Ok(transaction)
    }

    #[instrument(skip(self, session, proof), fields(id = %proof.id))]
    pub fn add_proof_of_payment(
        &self,
        session: &Session,
        proof: ProofOfPayment,
    ) -> Result<Transaction, StoreError> {
        let owner = self.guard(session, &[Role::User])?;
        proof.validate()?;

        let transaction = self.store.update_if::<Transaction, _>(&proof.id, |current| {
            if current.account_id != owner.id {
                return Err(StoreError::Unauthorized);
            }
            Ok(current.with_proof(&proof.image))
        })?;
        self.audit.record(
            LogType::AddProofOfPayment,
            format!("{} sent proof of payment for transaction {}", owner.handle, transaction.id),
        );

        Ok(transaction)
    }

    #[instrument(skip(self, session, args), fields(id = %args.id))]
    pub fn confirm_cash(&self, session: &Session, args: SettleArgs) -> Result<Transaction, StoreError> {
        let admin = self.guard(session, &[Role::Admin])?;
        let settlement = Settlement::ConfirmCash {
            message: args.message,
        };
        self.settle_as_admin(&admin, &args.id, settlement, LogType::ConfirmCash, "confirmed")
    }

    #[instrument(skip(self, session, args), fields(id = %args.settle.id))]
    pub fn confirm_voucher(&self, session: &Session, args: VoucherArgs) -> Result<Transaction, StoreError> {
        let admin = self.guard(session, &[Role::Admin])?;
        args.validate()?;
        let settlement = Settlement::ConfirmVoucher {
            voucher: args.voucher,
            message: args.settle.message,
        };
        self.settle_as_admin(&admin, &args.settle.id, settlement, LogType::ConfirmVoucher, "confirmed")
    }

    #[instrument(skip(self, session, args), fields(id = %args.id))]
    pub fn cancel_transaction(&self, session: &Session, args: SettleArgs) -> Result<Transaction, StoreError> {
        let admin = self.guard(session, &[Role::Admin])?;
        let settlement = Settlement::Cancel {
            message: args.message.unwrap_or_else(|| CANCELED_BY_ADMIN.to_string()),
        };
        self.settle_as_admin(&admin, &args.id, settlement, LogType::CancelTransaction, "canceled")
    }

    #[instrument(skip(self, session))]
    pub fn cancel_my_transaction(&self, session: &Session, id: &str) -> Result<Transaction, StoreError> {
        let owner = self.guard(session, &[])?;
        let settlement = Settlement::Cancel {
            message: CANCELED_BY_BUYER.to_string(),
        };

        let transaction = self.store.update_if::<Transaction, _>(id, |current| {
            if current.account_id != owner.id {
                return Err(StoreError::Unauthorized);
            }
            Ok(current.settle(&settlement)?)
        })?;
        self.audit.record(
            LogType::CancelMyTransaction,
            format!("{} canceled transaction {}", owner.handle, transaction.id),
        );

        Ok(transaction)
    }

    // Transactions of blocked buyers are hidden from admins entirely. The
    // buyer is re-read on every attempt of the conditional write.
    fn settle_as_admin(
        &self,
        admin: &Account,
        id: &str,
        settlement: Settlement,
        log_type: LogType,
        verb: &str,
    ) -> Result<Transaction, StoreError> {
        let transaction = self.store.update_if::<Transaction, _>(id, |current| {
            let buyer = self.store.find_by_id::<Account>(&current.account_id)?;
            if buyer.is_none_or(|buyer| buyer.blocked) {
                return Err(StoreError::not_found(Transaction::KIND, id));
            }
            Ok(current.settle(&settlement)?)
        })?;
        self.audit.record(
            log_type,
            format!("{} {verb} transaction {}", admin.handle, transaction.id),
        );

        Ok(transaction)
    }

    /// The caller's own transactions, newest first.
    pub fn my_transactions(&self, session: &Session) -> Result<Vec<Transaction>, StoreError> {
        let me = self.guard(session, &[])?;
        let mut transactions = self
            .store
            .find_where::<Transaction>(|transaction| transaction.account_id == me.id)?;
        newest_first(&mut transactions);
        Ok(transactions)
    }

    /// Every transaction whose buyer isn't blocked, newest first.
    pub fn transactions(&self, session: &Session) -> Result<Vec<Transaction>, StoreError> {
        self.guard(session, &[Role::Admin])?;
        let blocked: HashSet<String> = self
            .store
            .find_where::<Account>(|account| account.blocked)?
            .into_iter()
            .map(|account| account.id)
            .collect();

        let mut transactions = self
            .store
            .find_where::<Transaction>(|transaction| !blocked.contains(&transaction.account_id))?;
        newest_first(&mut transactions);
        Ok(transactions)
    }
}
