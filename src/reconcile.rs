//! Merging a product's variant edit list into its persisted variants
use super::catalog::{Variant, VariantEdit};
use super::types::TimeStamp;

/// Merges `edits` into `existing`.
///
/// Existing variants are matched to edit entries by id. A match overwrites
/// value and price in place; an existing variant with no matching entry is
/// soft-deleted but kept, since past transactions still point at it. Entries
/// without an id become new variants with ids from `new_id`, appended after
/// the existing ones. Entries carrying an id that matches nothing are ignored.
pub fn reconcile<F, E>(
    product_id: &str,
    existing: Vec<Variant>,
    edits: &[VariantEdit],
    mut new_id: F,
) -> Result<Vec<Variant>, E>
where
    F: FnMut() -> Result<String, E>,
{
    let now = TimeStamp::new();
    let mut merged = Vec::with_capacity(existing.len() + edits.len());

    for mut variant in existing {
        match edits
            .iter()
            .find(|edit| edit.id.as_deref() == Some(variant.id.as_str()))
        {
            Some(edit) => {
                variant.value = edit.fields.value.clone();
                variant.price = edit.fields.price;
                variant.updated_at = now.clone();
            }
            None if !variant.deleted => {
                variant.deleted = true;
                variant.updated_at = now.clone();
            }
            None => {}
        }
        merged.push(variant);
    }

    for edit in edits.iter().filter(|edit| edit.id.is_none()) {
        merged.push(Variant::new(new_id()?, product_id, &edit.fields));
    }

    Ok(merged)
}
