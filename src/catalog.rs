//! Catalog entities and the product editor
use super::accounts::Role;
use super::audit::LogType;
use super::error::{StoreError, ValidationError};
use super::reconcile::reconcile;
use super::service::StoreService;
use super::session::Session;
use super::store::Record;
use super::types::TimeStamp;
use super::utils::{PRODUCT_PREFIX, VARIANT_PREFIX, new_uuid_to_bech32};
use chrono::Utc;
use tracing::instrument;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductType {
    #[n(0)]
    Cash,
    #[n(1)]
    Voucher,
}

/// Descriptive fields shared by stored products and product creation input.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ProductDetails {
    #[n(0)]
    pub name: String,
    #[n(1)]
    pub product_type: ProductType,
    #[n(2)]
    pub primary_form_name: Option<String>, // label of the first field a buyer fills in
    #[n(3)]
    pub secondary_form_name: Option<String>,
    #[n(4)]
    pub image: String,
    #[n(5)]
    pub banner: String,
    #[n(6)]
    pub description: String,
    #[n(7)]
    pub helper_image: Option<String>,
    #[n(8)]
    pub helper_text: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Product {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub details: ProductDetails,
    #[n(2)]
    pub variants: Vec<Variant>,
    #[n(3)]
    pub deleted: bool,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
    #[n(5)]
    pub updated_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub product_id: String,
    #[n(2)]
    pub value: String,
    #[n(3)]
    pub price: u64,
    #[n(4)]
    pub deleted: bool,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    pub updated_at: TimeStamp<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantFields {
    pub value: String,
    pub price: u64,
}

/// One entry of an edit list. Entries without an id create new variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantEdit {
    pub id: Option<String>,
    pub fields: VariantFields,
}

#[derive(Debug, Clone)]
pub struct NewProduct {
    pub details: ProductDetails,
    pub items: Vec<VariantFields>,
}

/// Change to a single field during a partial update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Patch<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

#[derive(Debug, Clone, Default)]
pub struct ProductEdit {
    pub id: String,
    pub name: Patch<String>,
    pub product_type: Patch<ProductType>,
    pub primary_form_name: Patch<String>,
    pub secondary_form_name: Patch<String>,
    pub image: Patch<String>,
    pub banner: Patch<String>,
    pub description: Patch<String>,
    pub helper_image: Patch<String>,
    pub helper_text: Patch<String>,
    // an empty list is treated the same as no list at all
    pub items: Option<Vec<VariantEdit>>,
    pub deleted: Option<bool>,
}

impl ProductType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductType::Cash => "cash",
            ProductType::Voucher => "voucher",
        }
    }
}

impl Record for Product {
    const TREE: &'static str = "products";
    const KIND: &'static str = "product";

    fn id(&self) -> &str {
        &self.id
    }
}

impl Variant {
    pub fn new(id: String, product_id: &str, fields: &VariantFields) -> Self {
        let now = TimeStamp::new();
        Self {
            id,
            product_id: product_id.to_string(),
            value: fields.value.clone(),
            price: fields.price,
            deleted: false,
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

impl<T> Patch<T> {
    fn apply_required(self, target: &mut T) {
        // Clear on a required field never passes validation
        if let Patch::Set(value) = self {
            *target = value;
        }
    }

    fn apply_optional(self, target: &mut Option<T>) {
        match self {
            Patch::Keep => {}
            Patch::Set(value) => *target = Some(value),
            Patch::Clear => *target = None,
        }
    }
}

fn require_text(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty(field));
    }
    Ok(())
}

fn require_patch(field: &'static str, patch: &Patch<String>) -> Result<(), ValidationError> {
    match patch {
        Patch::Keep => Ok(()),
        Patch::Set(value) => require_text(field, value),
        Patch::Clear => Err(ValidationError::Empty(field)),
    }
}

impl VariantFields {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("item value", &self.value)
    }
}

impl ProductDetails {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("name", &self.name),
            ("image", &self.image),
            ("banner", &self.banner),
            ("description", &self.description),
        ] {
            require_text(field, value)?;
        }
        Ok(())
    }
}

impl NewProduct {
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.details.validate()?;
        if self.items.is_empty() {
            return Err(ValidationError::NoItems);
        }
        self.items.iter().try_for_each(VariantFields::validate)
    }
}

impl ProductEdit {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, patch) in [
            ("name", &self.name),
            ("image", &self.image),
            ("banner", &self.banner),
            ("description", &self.description),
        ] {
            require_patch(field, patch)?;
        }
        if self.product_type == Patch::Clear {
            return Err(ValidationError::Empty("type"));
        }
        self.items
            .iter()
            .flatten()
            .try_for_each(|edit| edit.fields.validate())
    }

    fn reconciles_items(&self) -> bool {
        self.items.as_ref().is_some_and(|items| !items.is_empty())
    }
}

impl Product {
    pub fn new(id: String, details: ProductDetails, variants: Vec<Variant>) -> Self {
        let now = TimeStamp::new();
        Self {
            id,
            details,
            variants,
            deleted: false,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// The product as buyers see it: soft-deleted variants hidden.
    pub fn visible(mut self) -> Self {
        self.variants.retain(|variant| !variant.deleted);
        self
    }

    /// Applies a validated edit. Variants are only touched when the edit
    /// carries a non-empty item list or soft-deletes the product.
    pub fn apply<F>(&mut self, edit: ProductEdit, new_id: F) -> Result<(), StoreError>
    where
        F: FnMut() -> Result<String, StoreError>,
    {
        let reconciles_items = edit.reconciles_items();
        let details = &mut self.details;

        edit.name.apply_required(&mut details.name);
        edit.product_type.apply_required(&mut details.product_type);
        edit.primary_form_name
            .apply_optional(&mut details.primary_form_name);
        edit.secondary_form_name
            .apply_optional(&mut details.secondary_form_name);
        edit.image.apply_required(&mut details.image);
        edit.banner.apply_required(&mut details.banner);
        edit.description.apply_required(&mut details.description);
        edit.helper_image.apply_optional(&mut details.helper_image);
        edit.helper_text.apply_optional(&mut details.helper_text);

        if reconciles_items {
            let existing = std::mem::take(&mut self.variants);
            let items = edit.items.unwrap_or_default();
            self.variants = reconcile(&self.id, existing, &items, new_id)?;
        }

        if let Some(deleted) = edit.deleted {
            self.deleted = deleted;
        }
        if self.deleted {
            for variant in self.variants.iter_mut().filter(|v| !v.deleted) {
                variant.deleted = true;
                variant.updated_at = TimeStamp::new();
            }
        }

        self.updated_at = TimeStamp::new();
        Ok(())
    }
}

impl StoreService {
    /// Products visible in the storefront, oldest first.
    pub fn products(&self) -> Result<Vec<Product>, StoreError> {
        let mut products = self.store.find_where::<Product>(|product| !product.deleted)?;
        products.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(products.into_iter().map(Product::visible).collect())
    }

    pub fn product(&self, id: &str) -> Result<Product, StoreError> {
        Ok(self.store.get::<Product>(id)?.visible())
    }

    #[instrument(skip(self, session, input), fields(name = %input.details.name))]
    pub fn add_product(&self, session: &Session, input: NewProduct) -> Result<Product, StoreError> {
        let actor = self.guard(session, &[Role::Admin])?;
        input.validate()?;

        let product_id = new_uuid_to_bech32(PRODUCT_PREFIX)?;
        let variants = input
            .items
            .iter()
            .map(|fields| -> Result<Variant, StoreError> {
                Ok(Variant::new(new_uuid_to_bech32(VARIANT_PREFIX)?, &product_id, fields))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        let product = Product::new(product_id, input.details, variants);

        self.store.save_product(&product)?;
        self.audit.record(
            LogType::AddProduct,
            format!("{} added product {}", actor.handle, product.id),
        );

        Ok(product)
    }

    #[instrument(skip(self, session, edit), fields(id = %edit.id))]
    pub fn edit_product(&self, session: &Session, edit: ProductEdit) -> Result<Product, StoreError> {
        let actor = self.guard(session, &[Role::Admin])?;
        edit.validate()?;

        let product = self.store.update_product(&edit.id, |current| {
            let mut next = current.clone();
            next.apply(edit.clone(), || Ok(new_uuid_to_bech32(VARIANT_PREFIX)?))?;
            Ok(next)
        })?;
        self.audit.record(
            LogType::EditProduct,
            format!("{} edited product {}", actor.handle, product.id),
        );

        Ok(product)
    }
}
