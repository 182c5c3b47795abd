use anyhow::Context;
use sled::open;
use std::sync::Arc;
use storefront_orders::{
    accounts::{Credentials, PasswordChange},
    audit::LogType,
    catalog::{NewProduct, ProductDetails, ProductEdit, ProductType, VariantEdit, VariantFields},
    config::Config,
    error::{ConflictError, StoreError, ValidationError},
    lifecycle::{ProofOfPayment, Purchase, SettleArgs, TransactionState, VoucherArgs},
    service::StoreService,
    session::Session,
};

use tempfile::{TempDir, tempdir}; // Use for test db cleanup.

// Sled locks its database directory, so every test opens its own db under a
// temp dir. The TempDir is returned so it outlives the service.
fn service(name: &str) -> anyhow::Result<(TempDir, StoreService)> {
    let temp_dir = tempdir()?;
    let db = open(temp_dir.path().join(name))?;
    let service = StoreService::new(Arc::new(db), &Config::default())?;
    Ok((temp_dir, service))
}

fn credentials(handle: &str) -> Credentials {
    Credentials {
        handle: handle.into(),
        password: "password123".into(),
    }
}

fn admin_session(service: &StoreService) -> anyhow::Result<Session> {
    service.seed_admin(credentials("storeadmin"))?;
    let mut session = Session::new();
    service.login(&mut session, credentials("storeadmin"))?;
    Ok(session)
}

fn buyer_session(service: &StoreService, handle: &str) -> anyhow::Result<Session> {
    let mut session = Session::new();
    service.register(&mut session, credentials(handle))?;
    Ok(session)
}

fn new_product(product_type: ProductType, items: &[(&str, u64)]) -> NewProduct {
    NewProduct {
        details: ProductDetails {
            name: "Game Credits".into(),
            product_type,
            primary_form_name: Some("Player ID".into()),
            secondary_form_name: None,
            image: "/img/credits.png".into(),
            banner: "/img/credits-banner.png".into(),
            description: "In-game currency".into(),
            helper_image: None,
            helper_text: None,
        },
        items: items
            .iter()
            .map(|(value, price)| VariantFields {
                value: value.to_string(),
                price: *price,
            })
            .collect(),
    }
}

fn purchase(variant_id: &str) -> Purchase {
    Purchase {
        variant_id: variant_id.into(),
        primary_form_value: Some("player-42".into()),
        secondary_form_value: None,
    }
}

fn settle(id: &str) -> SettleArgs {
    SettleArgs {
        id: id.into(),
        message: None,
    }
}

#[test]
fn open_uses_configured_path() -> anyhow::Result<()> {
    let temp_dir = tempdir()?;
    let config = Config {
        db_path: temp_dir.path().join("configured.db"),
        ..Config::default()
    };

    let service = StoreService::open(&config)?;
    let mut session = Session::new();
    service.register(&mut session, credentials("customer01"))?;

    assert!(config.db_path.exists());
    assert_eq!(service.me(&session)?.handle, "customer01");

    Ok(())
}

#[test]
fn blocked_user_is_locked_out_despite_old_snapshot() -> anyhow::Result<()> {
    let (_dir, service) = service("blocked.db")?;
    let admin = admin_session(&service)?;

    let mut buyer = Session::new();
    let account = service.register(&mut buyer, credentials("customer01"))?;
    assert_eq!(account.version, 0);
    service.logout(&mut buyer)?;
    service.login(&mut buyer, credentials("customer01"))?;
    assert_eq!(buyer.snapshot().map(|s| s.version), Some(0));

    let blocked = service
        .block_user(&admin, "customer01")
        .context("Failed to block: ")?;
    assert!(blocked.blocked);
    assert_eq!(blocked.version, 1);

    // the stale snapshot still claims blocked=false, role=user
    assert!(matches!(service.me(&buyer), Err(StoreError::Unauthorized)));
    assert!(matches!(
        service.my_transactions(&buyer),
        Err(StoreError::Unauthorized)
    ));

    // a fresh login works, but role restricted operations stay closed
    let mut relogged = Session::new();
    service.login(&mut relogged, credentials("customer01"))?;
    assert!(service.me(&relogged)?.blocked);
    assert!(matches!(
        service.buy_item(&relogged, purchase("item_any")),
        Err(StoreError::Unauthorized)
    ));

    Ok(())
}

#[test]
fn admins_cannot_be_blocked_and_users_cannot_block() -> anyhow::Result<()> {
    let (_dir, service) = service("block_rules.db")?;
    let admin = admin_session(&service)?;
    let buyer = buyer_session(&service, "customer01")?;

    assert!(matches!(
        service.block_user(&admin, "storeadmin"),
        Err(StoreError::Conflict(ConflictError::AdminNotBlockable))
    ));
    assert!(matches!(
        service.block_user(&buyer, "storeadmin"),
        Err(StoreError::Unauthorized)
    ));
    assert!(matches!(
        service.block_user(&admin, "nobody_here"),
        Err(StoreError::NotFound { .. })
    ));

    // blocking twice unblocks again
    service.block_user(&admin, "customer01")?;
    let unblocked = service.block_user(&admin, "customer01")?;
    assert!(!unblocked.blocked);
    assert_eq!(unblocked.version, 2);

    Ok(())
}

#[test]
fn password_change_invalidates_sessions() -> anyhow::Result<()> {
    let (_dir, service) = service("password.db")?;
    let mut first = buyer_session(&service, "customer01")?;
    let mut second = Session::new();
    service.login(&mut second, credentials("customer01"))?;

    let wrong = PasswordChange {
        password: "not my password".into(),
        new_password: "another123".into(),
    };
    assert!(matches!(
        service.change_password(&first, wrong),
        Err(StoreError::Unauthorized)
    ));

    let change = PasswordChange {
        password: "password123".into(),
        new_password: "another123".into(),
    };
    service.change_password(&first, change)?;

    assert!(matches!(service.me(&first), Err(StoreError::Unauthorized)));
    assert!(matches!(service.me(&second), Err(StoreError::Unauthorized)));

    // a stale session can still sign out, and a fresh login replaces it
    service.logout(&mut first)?;
    assert!(first.snapshot().is_none());
    assert!(matches!(service.logout(&mut first), Err(StoreError::Unauthorized)));
    assert!(matches!(
        service.login(&mut first, credentials("customer01")),
        Err(StoreError::Unauthorized)
    ));
    let new_credentials = Credentials {
        handle: "customer01".into(),
        password: "another123".into(),
    };
    service.login(&mut first, new_credentials.clone())?;
    assert_eq!(service.me(&first)?.version, 1);

    // logging in over the stale snapshot works without logging out first
    service.login(&mut second, new_credentials.clone())?;
    assert_eq!(second.snapshot().map(|s| s.version), Some(1));
    assert!(matches!(
        service.login(&mut second, new_credentials),
        Err(StoreError::Conflict(ConflictError::AlreadyAuthenticated))
    ));

    Ok(())
}

#[test]
fn registration_rules() -> anyhow::Result<()> {
    let (_dir, service) = service("register.db")?;
    let mut session = buyer_session(&service, "customer01")?;

    assert!(matches!(
        service.register(&mut session, credentials("customer02")),
        Err(StoreError::Conflict(ConflictError::AlreadyAuthenticated))
    ));

    let mut other = Session::new();
    assert!(matches!(
        service.register(&mut other, credentials("customer01")),
        Err(StoreError::Conflict(ConflictError::HandleTaken))
    ));
    assert!(other.snapshot().is_none());

    assert!(matches!(
        service.register(&mut other, credentials("short")),
        Err(StoreError::Validation(ValidationError::HandleLength))
    ));

    Ok(())
}

#[test]
fn cash_purchase_is_confirmed_once() -> anyhow::Result<()> {
    let (_dir, service) = service("cash.db")?;
    let admin = admin_session(&service)?;
    let buyer = buyer_session(&service, "customer01")?;

    let product = service.add_product(&admin, new_product(ProductType::Cash, &[("100 credits", 10)]))?;
    let variant_id = product.variants[0].id.clone();

    let transaction = service
        .buy_item(&buyer, purchase(&variant_id))
        .context("Failed on purchase: ")?;
    assert!(transaction.pending);
    assert!(!transaction.success);
    assert_eq!(transaction.item_price, 10);
    assert_eq!(transaction.primary_form_value.as_deref(), Some("player-42"));

    let transaction = service.add_proof_of_payment(
        &buyer,
        ProofOfPayment {
            id: transaction.id,
            image: "/uploads/receipt.png".into(),
        },
    )?;
    assert_eq!(transaction.state(), TransactionState::Pending);

    let confirmed = service.confirm_cash(&admin, settle(&transaction.id))?;
    assert!(!confirmed.pending);
    assert!(confirmed.success);

    let again = service.confirm_cash(&admin, settle(&transaction.id));
    assert!(matches!(
        again,
        Err(StoreError::Conflict(ConflictError::AlreadySettled))
    ));
    let cancel = service.cancel_transaction(&admin, settle(&transaction.id));
    assert!(matches!(
        cancel,
        Err(StoreError::Conflict(ConflictError::AlreadySettled))
    ));

    let stored = service.my_transactions(&buyer)?;
    assert_eq!(stored, vec![confirmed]);

    Ok(())
}

#[test]
fn voucher_purchase_requires_voucher_confirmation() -> anyhow::Result<()> {
    let (_dir, service) = service("voucher.db")?;
    let admin = admin_session(&service)?;
    let buyer = buyer_session(&service, "customer01")?;

    let product = service.add_product(&admin, new_product(ProductType::Voucher, &[("Gift card", 50)]))?;
    let transaction = service.buy_item(&buyer, purchase(&product.variants[0].id))?;

    assert!(matches!(
        service.confirm_cash(&admin, settle(&transaction.id)),
        Err(StoreError::Conflict(ConflictError::TypeMismatch { .. }))
    ));
    assert!(matches!(
        service.confirm_voucher(
            &admin,
            VoucherArgs {
                settle: settle(&transaction.id),
                voucher: " ".into(),
            }
        ),
        Err(StoreError::Validation(ValidationError::Empty("voucher")))
    ));

    let anonymous = service.confirm_voucher(
        &Session::new(),
        VoucherArgs {
            settle: settle(&transaction.id),
            voucher: "".into(),
        },
    );
    assert!(matches!(anonymous, Err(StoreError::Unauthorized)));

    let confirmed = service.confirm_voucher(
        &admin,
        VoucherArgs {
            settle: settle(&transaction.id),
            voucher: "GIFT-0001".into(),
        },
    )?;
    assert_eq!(confirmed.state(), TransactionState::Confirmed);
    assert_eq!(confirmed.voucher.as_deref(), Some("GIFT-0001"));

    Ok(())
}

#[test]
fn buyers_only_touch_their_own_transactions() -> anyhow::Result<()> {
    let (_dir, service) = service("ownership.db")?;
    let admin = admin_session(&service)?;
    let owner = buyer_session(&service, "customer01")?;
    let stranger = buyer_session(&service, "customer02")?;

    let product = service.add_product(&admin, new_product(ProductType::Cash, &[("100 credits", 10)]))?;
    let transaction = service.buy_item(&owner, purchase(&product.variants[0].id))?;

    assert!(matches!(
        service.cancel_my_transaction(&stranger, &transaction.id),
        Err(StoreError::Unauthorized)
    ));
    assert!(matches!(
        service.add_proof_of_payment(
            &stranger,
            ProofOfPayment {
                id: transaction.id.clone(),
                image: "/uploads/fake.png".into(),
            }
        ),
        Err(StoreError::Unauthorized)
    ));
    assert!(service.my_transactions(&stranger)?.is_empty());

    let canceled = service.cancel_my_transaction(&owner, &transaction.id)?;
    assert_eq!(canceled.state(), TransactionState::Canceled);

    assert!(matches!(
        service.cancel_my_transaction(&owner, &transaction.id),
        Err(StoreError::Conflict(ConflictError::AlreadySettled))
    ));
    assert!(matches!(
        service.cancel_my_transaction(&owner, "txn_missing"),
        Err(StoreError::NotFound { .. })
    ));

    Ok(())
}

#[test]
fn admins_cannot_buy_and_buyers_cannot_settle() -> anyhow::Result<()> {
    let (_dir, service) = service("roles.db")?;
    let admin = admin_session(&service)?;
    let buyer = buyer_session(&service, "customer01")?;

    let product = service.add_product(&admin, new_product(ProductType::Cash, &[("100 credits", 10)]))?;
    let variant_id = product.variants[0].id.clone();

    assert!(matches!(
        service.buy_item(&admin, purchase(&variant_id)),
        Err(StoreError::Unauthorized)
    ));
    let transaction = service.buy_item(&buyer, purchase(&variant_id))?;
    assert!(matches!(
        service.confirm_cash(&buyer, settle(&transaction.id)),
        Err(StoreError::Unauthorized)
    ));
    assert!(matches!(
        service.transactions(&buyer),
        Err(StoreError::Unauthorized)
    ));
    assert!(matches!(
        service.add_product(&buyer, new_product(ProductType::Cash, &[("x", 1)])),
        Err(StoreError::Unauthorized)
    ));
    assert!(matches!(
        service.buy_item(&Session::new(), purchase(&variant_id)),
        Err(StoreError::Unauthorized)
    ));

    Ok(())
}

#[test]
fn blocked_buyers_disappear_from_admin_views() -> anyhow::Result<()> {
    let (_dir, service) = service("blocked_views.db")?;
    let admin = admin_session(&service)?;
    let first = buyer_session(&service, "customer01")?;
    let second = buyer_session(&service, "customer02")?;

    let product = service.add_product(&admin, new_product(ProductType::Cash, &[("100 credits", 10)]))?;
    let variant_id = product.variants[0].id.clone();
    let older = service.buy_item(&first, purchase(&variant_id))?;
    let newer = service.buy_item(&second, purchase(&variant_id))?;

    let listed: Vec<String> = service.transactions(&admin)?.into_iter().map(|t| t.id).collect();
    assert_eq!(listed, vec![newer.id.clone(), older.id.clone()]);

    service.block_user(&admin, "customer02")?;

    let listed: Vec<String> = service.transactions(&admin)?.into_iter().map(|t| t.id).collect();
    assert_eq!(listed, vec![older.id.clone()]);
    assert!(matches!(
        service.cancel_transaction(&admin, settle(&newer.id)),
        Err(StoreError::NotFound { .. })
    ));
    assert!(matches!(
        service.confirm_cash(&admin, settle(&newer.id)),
        Err(StoreError::NotFound { .. })
    ));

    // unblocking brings the transaction back, still pending
    service.block_user(&admin, "customer02")?;
    let confirmed = service.confirm_cash(&admin, settle(&newer.id))?;
    assert_eq!(confirmed.state(), TransactionState::Confirmed);

    Ok(())
}

#[test]
fn buyers_see_their_transactions_newest_first() -> anyhow::Result<()> {
    let (_dir, service) = service("my_transactions.db")?;
    let admin = admin_session(&service)?;
    let buyer = buyer_session(&service, "customer01")?;
    let other = buyer_session(&service, "customer02")?;

    let product = service.add_product(&admin, new_product(ProductType::Cash, &[("100 credits", 10)]))?;
    let variant_id = product.variants[0].id.clone();
    let first = service.buy_item(&buyer, purchase(&variant_id))?;
    service.buy_item(&other, purchase(&variant_id))?;
    let second = service.buy_item(&buyer, purchase(&variant_id))?;

    let listed: Vec<String> = service.my_transactions(&buyer)?.into_iter().map(|t| t.id).collect();
    assert_eq!(listed, vec![second.id, first.id]);

    Ok(())
}

#[test]
fn empty_product_is_rejected_and_not_persisted() -> anyhow::Result<()> {
    let (_dir, service) = service("empty_product.db")?;
    let admin = admin_session(&service)?;

    let result = service.add_product(&admin, new_product(ProductType::Cash, &[]));

    assert!(matches!(
        result,
        Err(StoreError::Validation(ValidationError::NoItems))
    ));
    assert!(service.products()?.is_empty());

    Ok(())
}

#[test]
fn editing_items_keeps_purchase_history_intact() -> anyhow::Result<()> {
    let (_dir, service) = service("edit_items.db")?;
    let admin = admin_session(&service)?;
    let buyer = buyer_session(&service, "customer01")?;

    let product = service.add_product(
        &admin,
        new_product(ProductType::Cash, &[("100 credits", 10), ("500 credits", 45)]),
    )?;
    let kept = product.variants[0].id.clone();
    let removed = product.variants[1].id.clone();
    let bought = service.buy_item(&buyer, purchase(&removed))?;

    let mut edit = ProductEdit::new(product.id.clone());
    edit.items = Some(vec![
        VariantEdit {
            id: Some(kept.clone()),
            fields: VariantFields {
                value: "120 credits".into(),
                price: 10,
            },
        },
        VariantEdit {
            id: None,
            fields: VariantFields {
                value: "1000 credits".into(),
                price: 80,
            },
        },
    ]);
    let edited = service.edit_product(&admin, edit)?;

    assert_eq!(edited.variants.len(), 3);
    assert!(edited.variants[1].deleted);
    assert_eq!(edited.details.name, "Game Credits");

    let visible = service.product(&product.id)?;
    let values: Vec<&str> = visible.variants.iter().map(|v| v.value.as_str()).collect();
    assert_eq!(values, vec!["120 credits", "1000 credits"]);

    // the removed variant can't be bought any more
    assert!(matches!(
        service.buy_item(&buyer, purchase(&removed)),
        Err(StoreError::NotFound { .. })
    ));
    // the new one can, through the index
    let new_id = visible.variants[1].id.clone();
    assert_eq!(service.buy_item(&buyer, purchase(&new_id))?.item_price, 80);

    // history still shows what was bought
    let history = service.my_transactions(&buyer)?;
    let old = history.iter().find(|t| t.id == bought.id).context("missing transaction")?;
    assert_eq!(old.item_value, "500 credits");
    assert_eq!(old.item_price, 45);

    Ok(())
}

#[test]
fn deleted_products_leave_the_storefront() -> anyhow::Result<()> {
    let (_dir, service) = service("delete_product.db")?;
    let admin = admin_session(&service)?;
    let buyer = buyer_session(&service, "customer01")?;

    let product = service.add_product(&admin, new_product(ProductType::Cash, &[("100 credits", 10)]))?;
    assert_eq!(service.products()?.len(), 1);

    let mut edit = ProductEdit::new(product.id.clone());
    edit.deleted = Some(true);
    service.edit_product(&admin, edit)?;

    assert!(service.products()?.is_empty());
    assert!(matches!(
        service.buy_item(&buyer, purchase(&product.variants[0].id)),
        Err(StoreError::NotFound { .. })
    ));
    assert!(matches!(
        service.edit_product(&admin, ProductEdit::new("prod_missing")),
        Err(StoreError::NotFound { .. })
    ));

    Ok(())
}

#[test]
fn racing_cancellations_settle_exactly_once() -> anyhow::Result<()> {
    let (_dir, service) = service("race.db")?;
    let admin = admin_session(&service)?;
    let buyer = buyer_session(&service, "customer01")?;

    let product = service.add_product(&admin, new_product(ProductType::Cash, &[("100 credits", 10)]))?;
    let transaction = service.buy_item(&buyer, purchase(&product.variants[0].id))?;
    let id = transaction.id.as_str();

    let (by_admin, by_buyer) = std::thread::scope(|scope| {
        let admin_cancel = scope.spawn(|| service.cancel_transaction(&admin, settle(id)));
        let buyer_cancel = scope.spawn(|| service.cancel_my_transaction(&buyer, id));
        (admin_cancel.join(), buyer_cancel.join())
    });
    let results = [
        by_admin.map_err(|_| anyhow::anyhow!("admin thread panicked"))?,
        by_buyer.map_err(|_| anyhow::anyhow!("buyer thread panicked"))?,
    ];

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(StoreError::Conflict(ConflictError::AlreadySettled))
    )));

    Ok(())
}

#[test]
fn racing_product_edits_build_on_each_other() -> anyhow::Result<()> {
    let (_dir, service) = service("race_edit.db")?;
    let admin = admin_session(&service)?;

    for round in 0..10 {
        let product = service.add_product(&admin, new_product(ProductType::Cash, &[("100 credits", 10)]))?;
        let existing = product.variants[0].id.clone();
        let edit_adding = |value: String| {
            let mut edit = ProductEdit::new(product.id.clone());
            edit.items = Some(vec![
                VariantEdit {
                    id: Some(existing.clone()),
                    fields: VariantFields {
                        value: "100 credits".into(),
                        price: 10,
                    },
                },
                VariantEdit {
                    id: None,
                    fields: VariantFields { value, price: 20 },
                },
            ]);
            edit
        };

        let (left, right) = std::thread::scope(|scope| {
            let left = scope.spawn(|| service.edit_product(&admin, edit_adding(format!("left {round}"))));
            let right = scope.spawn(|| service.edit_product(&admin, edit_adding(format!("right {round}"))));
            (left.join(), right.join())
        });
        let left = left.map_err(|_| anyhow::anyhow!("left thread panicked"))??;
        let right = right.map_err(|_| anyhow::anyhow!("right thread panicked"))??;

        // whichever edit committed second was re-applied on top of the first,
        // so the first edit's new item is still on the product, soft-deleted
        let (earlier, later) = if left.variants.len() < right.variants.len() {
            (left, right)
        } else {
            (right, left)
        };
        assert_eq!(earlier.variants.len(), 2, "round {round}");
        assert_eq!(later.variants.len(), 3, "round {round}");
        assert_eq!(later.variants[1].id, earlier.variants[1].id);
        assert!(later.variants[1].deleted);

        let visible = service.product(&product.id)?;
        assert_eq!(visible.variants.len(), 2);
        assert_eq!(visible.variants[1].id, later.variants[2].id);
    }

    Ok(())
}

#[test]
fn every_mutation_is_audited_once() -> anyhow::Result<()> {
    let (_dir, service) = service("audit.db")?;
    let admin = admin_session(&service)?;
    let mut buyer = buyer_session(&service, "customer01")?;

    let product = service.add_product(&admin, new_product(ProductType::Cash, &[("100 credits", 10)]))?;
    let transaction = service.buy_item(&buyer, purchase(&product.variants[0].id))?;
    service.confirm_cash(&admin, settle(&transaction.id))?;
    // refused operations leave no trace
    let _ = service.confirm_cash(&admin, settle(&transaction.id));
    service.logout(&mut buyer)?;

    let types: Vec<LogType> = service.audit().entries()?.iter().map(|e| e.log_type).collect();
    assert_eq!(
        types,
        vec![
            LogType::Login,
            LogType::Register,
            LogType::AddProduct,
            LogType::BuyItem,
            LogType::ConfirmCash,
            LogType::Logout,
        ]
    );

    Ok(())
}
