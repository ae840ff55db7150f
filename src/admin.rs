//! Admin operations over the store: upsert, delete, export, import, and
//! duplicate-filtered bulk merge.
//!
//! Every mutation is a read-modify-write of the whole collection followed
//! by a single `write`, so other contexts see one change per operation.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::product::{DEFAULT_CATEGORY, Listing, Product, coerce_price, fresh_id, normalize};
use crate::store::ProductStore;

/// Suggested file name for exports.
pub const EXPORT_FILE_NAME: &str = "truespeed-products.json";

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("title, image and description are required")]
    MissingFields,

    #[error("import is not a JSON product list: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Raw admin form input; every field is the untrimmed text the operator
/// entered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductForm {
    /// Empty for a new product.
    pub id: String,
    pub title: String,
    pub category: String,
    pub price: String,
    /// `"true"` marks the product as featured.
    pub featured: String,
    pub image: String,
    pub description: String,
}

impl ProductForm {
    /// Prefill a form from a scraped listing. The category is always the
    /// default one; scrapers do not report it reliably.
    #[must_use]
    pub fn from_listing(listing: &Listing) -> Self {
        Self {
            id: String::new(),
            title: listing.title.clone().unwrap_or_default(),
            category: DEFAULT_CATEGORY.to_owned(),
            price: listing.price.map(|p| p.to_string()).unwrap_or_default(),
            featured: String::new(),
            image: listing.image.clone().unwrap_or_default(),
            description: listing.description.clone().unwrap_or_default(),
        }
    }

    /// Validate and convert into a product, minting an id when blank.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::MissingFields`] when title, image or
    /// description is blank.
    pub fn into_product(self, taken: &HashSet<String>) -> Result<Product, AdminError> {
        let title = self.title.trim().to_owned();
        let image = self.image.trim().to_owned();
        let description = self.description.trim().to_owned();
        if title.is_empty() || image.is_empty() || description.is_empty() {
            return Err(AdminError::MissingFields);
        }

        let id = match self.id.trim() {
            "" => fresh_id(taken),
            id => id.to_owned(),
        };
        let category = match self.category.trim() {
            "" => DEFAULT_CATEGORY.to_owned(),
            category => category.to_owned(),
        };

        Ok(Product {
            id,
            title,
            category,
            price: coerce_price(&self.price),
            featured: self.featured.trim() == "true",
            image,
            description,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Added,
    Updated,
}

fn ids(products: &[Product]) -> HashSet<String> {
    products.iter().map(|p| p.id.clone()).collect()
}

/// Add a product, or replace the one with the same id in place.
///
/// # Errors
///
/// Returns [`AdminError::MissingFields`] for incomplete forms; the store is
/// not touched.
pub fn upsert(store: &ProductStore, form: ProductForm) -> Result<(Upserted, Product), AdminError> {
    let mut products = store.read();
    let product = form.into_product(&ids(&products))?;

    let outcome = match products.iter().position(|p| p.id == product.id) {
        Some(index) => {
            products[index] = product.clone();
            Upserted::Updated
        }
        None => {
            products.push(product.clone());
            Upserted::Added
        }
    };

    info!(id = %product.id, ?outcome, "product saved");
    store.write(products);
    Ok((outcome, product))
}

/// Remove the product with `id`. Returns whether one was removed.
pub fn delete(store: &ProductStore, id: &str) -> bool {
    let mut products = store.read();
    let before = products.len();
    products.retain(|p| p.id != id);
    if products.len() == before {
        return false;
    }
    info!(%id, "product deleted");
    store.write(products);
    true
}

/// Pretty-printed JSON array of the current collection.
///
/// # Errors
///
/// Returns [`AdminError::InvalidJson`] if serialization fails.
pub fn export_json(store: &ProductStore) -> Result<String, AdminError> {
    Ok(serde_json::to_string_pretty(&store.read())?)
}

/// Replace the whole collection with a JSON array. Returns the new size.
///
/// Incomplete records are skipped and duplicate ids re-minted.
///
/// # Errors
///
/// Returns [`AdminError::InvalidJson`] when `text` is not a JSON array of
/// listings; the store is not touched.
pub fn import_json(store: &ProductStore, text: &str) -> Result<usize, AdminError> {
    let listings: Vec<Listing> = serde_json::from_str(text)?;
    let products = normalize(listings, &mut HashSet::new());
    let count = products.len();
    info!(count, "products imported; collection replaced");
    store.write(products);
    Ok(count)
}

/// Append listings whose title is not already present. Returns how many
/// were added. Titles added earlier in the same batch count as present.
pub fn merge_listings(store: &ProductStore, listings: Vec<Listing>) -> usize {
    let mut products = store.read();
    let mut titles: HashSet<String> = products.iter().map(|p| p.title.clone()).collect();
    let mut taken = ids(&products);

    // Titles are claimed only by listings that survive validation.
    let added: Vec<Product> = normalize(listings, &mut taken)
        .into_iter()
        .filter(|product| titles.insert(product.title.clone()))
        .collect();
    let count = added.len();

    products.extend(added);
    info!(count, "bulk import merged");
    store.write(products);
    count
}

#[cfg(test)]
#[path = "admin_test.rs"]
mod tests;
