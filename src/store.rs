//! sled-backed repository for accounts, products and transactions
use super::accounts::Account;
use super::catalog::{Product, Variant};
use super::error::{ConflictError, StoreError};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionResult};
use std::sync::Arc;

const HANDLE_INDEX: &str = "account_handles"; // handle -> account id
const VARIANT_INDEX: &str = "variant_index"; // variant id -> product id

/// A persisted entity: CBOR encoded and stored under its id in its own tree.
pub trait Record: minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()> {
    const TREE: &'static str;
    const KIND: &'static str;

    fn id(&self) -> &str;
}

pub struct Store {
    instance: Arc<sled::Db>,
}

impl Store {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }

    fn tree<T: Record>(&self) -> Result<sled::Tree, StoreError> {
        Ok(self.instance.open_tree(T::TREE)?)
    }

    pub fn find_by_id<T: Record>(&self, id: &str) -> Result<Option<T>, StoreError> {
        match self.tree::<T>()?.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(minicbor::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Like [`Store::find_by_id`] but a missing record is a `NotFound` error.
    pub fn get<T: Record>(&self, id: &str) -> Result<T, StoreError> {
        self.find_by_id(id)?
            .ok_or_else(|| StoreError::not_found(T::KIND, id))
    }

    pub fn find_where<T: Record>(&self, predicate: impl Fn(&T) -> bool) -> Result<Vec<T>, StoreError> {
        let mut found = vec![];
        for value in self.tree::<T>()?.iter().values() {
            let record: T = minicbor::decode(&value?)?;
            if predicate(&record) {
                found.push(record);
            }
        }
        Ok(found)
    }

    pub fn save<T: Record>(&self, record: &T) -> Result<(), StoreError> {
        self.tree::<T>()?
            .insert(record.id().as_bytes(), minicbor::to_vec(record)?)?;
        Ok(())
    }

    /// Atomic conditional update. `transition` inspects the stored record and
    /// either returns its replacement or refuses with an error. The write only
    /// lands if the stored bytes are still the ones `transition` saw; otherwise
    /// `transition` runs again against the newer record.
    pub fn update_if<T, F>(&self, id: &str, transition: F) -> Result<T, StoreError>
    where
        T: Record,
        F: Fn(&T) -> Result<T, StoreError>,
    {
        let tree = self.tree::<T>()?;
        loop {
            let Some(current_bytes) = tree.get(id.as_bytes())? else {
                return Err(StoreError::not_found(T::KIND, id));
            };
            let current: T = minicbor::decode(&current_bytes)?;
            let next = transition(&current)?;
            let next_bytes = minicbor::to_vec(&next)?;

            match tree.compare_and_swap(id.as_bytes(), Some(&current_bytes), Some(next_bytes))? {
                Ok(()) => return Ok(next),
                Err(_) => tracing::debug!(kind = T::KIND, id, "record changed during update, re-evaluating"),
            }
        }
    }

    /// Inserts a new account, failing with `HandleTaken` if the handle is in use.
    pub fn register_account(&self, account: &Account) -> Result<(), StoreError> {
        let accounts = self.tree::<Account>()?;
        let handles = self.instance.open_tree(HANDLE_INDEX)?;
        let bytes = minicbor::to_vec(account)?;

        let result = (&accounts, &handles).transaction(
            |(accounts, handles)| -> ConflictableTransactionResult<(), ConflictError> {
                if handles.get(account.handle.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(ConflictError::HandleTaken));
                }
                accounts.insert(account.id.as_bytes(), bytes.as_slice())?;
                handles.insert(account.handle.as_bytes(), account.id.as_bytes())?;
                Ok(())
            },
        );
        flatten(result)
    }

    pub fn find_account_by_handle(&self, handle: &str) -> Result<Option<Account>, StoreError> {
        let handles = self.instance.open_tree(HANDLE_INDEX)?;
        let Some(id) = handles.get(handle.as_bytes())? else {
            return Ok(None);
        };
        let id = std::str::from_utf8(&id)
            .map_err(|e| StoreError::Persistence(format!("corrupt handle index: {e}")))?;
        self.find_by_id(id)
    }

    /// Writes the product and indexes each of its variants in one transaction.
    pub fn save_product(&self, product: &Product) -> Result<(), StoreError> {
        let products = self.tree::<Product>()?;
        let index = self.instance.open_tree(VARIANT_INDEX)?;
        let bytes = minicbor::to_vec(product)?;

        let result = (&products, &index).transaction(
            |(products, index)| -> ConflictableTransactionResult<(), StoreError> {
                products.insert(product.id.as_bytes(), bytes.as_slice())?;
                for variant in &product.variants {
                    index.insert(variant.id.as_bytes(), product.id.as_bytes())?;
                }
                Ok(())
            },
        );
        flatten(result)
    }

    /// [`Store::update_if`] for products: the product and its variant index
    /// entries are written in one transaction, and only if the stored product
    /// is still the one `transition` saw.
    pub fn update_product<F>(&self, id: &str, transition: F) -> Result<Product, StoreError>
    where
        F: Fn(&Product) -> Result<Product, StoreError>,
    {
        let products = self.tree::<Product>()?;
        let index = self.instance.open_tree(VARIANT_INDEX)?;
        loop {
            let Some(current_bytes) = products.get(id.as_bytes())? else {
                return Err(StoreError::not_found(Product::KIND, id));
            };
            let current: Product = minicbor::decode(&current_bytes)?;
            let next = transition(&current)?;
            let next_bytes = minicbor::to_vec(&next)?;

            let result = (&products, &index).transaction(
                |(products, index)| -> ConflictableTransactionResult<bool, StoreError> {
                    if products.get(id.as_bytes())?.as_ref() != Some(&current_bytes) {
                        return Ok(false);
                    }
                    products.insert(id.as_bytes(), next_bytes.as_slice())?;
                    for variant in &next.variants {
                        index.insert(variant.id.as_bytes(), next.id.as_bytes())?;
                    }
                    Ok(true)
                },
            );
            if flatten(result)? {
                return Ok(next);
            }
            tracing::debug!(kind = Product::KIND, id, "record changed during update, re-evaluating");
        }
    }

    /// Looks a variant up through the index, returning it with its parent product.
    pub fn find_variant(&self, variant_id: &str) -> Result<Option<(Product, Variant)>, StoreError> {
        let index = self.instance.open_tree(VARIANT_INDEX)?;
        let Some(product_id) = index.get(variant_id.as_bytes())? else {
            return Ok(None);
        };
        let product_id = std::str::from_utf8(&product_id)
            .map_err(|e| StoreError::Persistence(format!("corrupt variant index: {e}")))?;
        let Some(product) = self.find_by_id::<Product>(product_id)? else {
            return Ok(None);
        };
        let variant = product.variants.iter().find(|v| v.id == variant_id).cloned();

        Ok(variant.map(|variant| (product, variant)))
    }
}

fn flatten<T, E: Into<StoreError>>(result: TransactionResult<T, E>) -> Result<T, StoreError> {
    result.map_err(|err| match err {
        sled::transaction::TransactionError::Abort(e) => e.into(),
        sled::transaction::TransactionError::Storage(e) => e.into(),
    })
}
