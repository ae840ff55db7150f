//! Product records: the only entity the store holds.
//!
//! DESIGN
//! ======
//! `Product` is the strict, validated shape kept in the cache and on the
//! mirror. `Listing` is the lenient shape accepted from bulk imports and
//! scraped payloads, where any field may be missing and prices may arrive
//! as strings. `normalize` turns listings into products and is the only
//! place ids are minted for imported data. `decode_collection` reads stored
//! or mirrored collections strictly first and falls back to listing rules,
//! so a scraped string price never reads as a corrupt collection.

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

/// Category assigned when a record arrives without one.
pub const DEFAULT_CATEGORY: &str = "Motorcycles";

// =============================================================================
// PRODUCT
// =============================================================================

/// A single vehicle listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub title: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub featured: bool,
    pub image: String,
    pub description: String,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_owned()
}

fn sample(id: &str, title: &str, price: f64, description: &str, seed: u8, featured: bool) -> Product {
    Product {
        id: id.to_owned(),
        title: title.to_owned(),
        category: default_category(),
        price,
        featured,
        image: format!("https://picsum.photos/seed/truespeed-{seed}/1200/900"),
        description: description.to_owned(),
    }
}

/// The fixed sample set used to seed an empty cache and by reset.
#[must_use]
pub fn default_products() -> Vec<Product> {
    vec![
        sample(
            "p1",
            "Custom Cafe Racer",
            8200.0,
            "Hand-built cafe racer with retro styling and modern performance parts.",
            1,
            true,
        ),
        sample(
            "p2",
            "Vintage Bobber",
            9600.0,
            "Classic bobber style with chopped fenders and a low stance.",
            2,
            false,
        ),
        sample(
            "p3",
            "Adventure Touring Bike",
            14500.0,
            "Ready for long-distance travel with panniers, crash bars, and LED lighting.",
            3,
            true,
        ),
        sample(
            "p4",
            "Sport Bike 1000cc",
            12500.0,
            "High-performance sport bike with aggressive design and top-tier handling.",
            4,
            false,
        ),
        sample(
            "p5",
            "Classic Cruiser",
            11000.0,
            "Comfortable cruiser with a V-twin engine, perfect for relaxed rides.",
            5,
            false,
        ),
        sample(
            "p6",
            "Dual-Sport Motorcycle",
            7800.0,
            "Street-legal dirt bike designed for both off-road adventures and city riding.",
            6,
            false,
        ),
    ]
}

// =============================================================================
// IDS AND COERCION
// =============================================================================

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

/// Mint a timestamp-based id (`p_<unix millis>`) not present in `taken`.
///
/// Several ids minted within the same millisecond get a numeric suffix.
#[must_use]
pub fn fresh_id(taken: &HashSet<String>) -> String {
    let base = format!("p_{}", now_millis());
    if !taken.contains(&base) {
        return base;
    }
    let mut suffix = 1u32;
    loop {
        let candidate = format!("{base}_{suffix}");
        if !taken.contains(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

/// Coerce free-form price input into a non-negative number.
///
/// Blank, unparseable, non-finite and negative input all become `0`. A
/// leading `$` and thousands separators are tolerated.
#[must_use]
pub fn coerce_price(raw: &str) -> f64 {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('$')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    if cleaned.is_empty() {
        return 0.0;
    }
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => value,
        _ => 0.0,
    }
}

// =============================================================================
// LISTING (LENIENT INPUT)
// =============================================================================

/// Imported record as produced by the scraper, with every field optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient_price")]
    pub price: Option<f64>,
    #[serde(default)]
    pub featured: Option<bool>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Site the listing was scraped from, when the scraper reports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

fn lenient_price<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_f64().map(|v| if v.is_finite() && v >= 0.0 { v } else { 0.0 }),
        Some(Value::String(s)) => Some(coerce_price(&s)),
        _ => None,
    })
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

impl Listing {
    /// Trimmed, non-empty title.
    #[must_use]
    pub fn title(&self) -> Option<String> {
        non_blank(self.title.as_ref())
    }

    /// Build a product, reserving its id in `taken`.
    ///
    /// Returns `None` when title, image or description is missing. The
    /// listing keeps its own id unless that id is blank or already taken.
    pub fn into_product(self, taken: &mut HashSet<String>) -> Option<Product> {
        let title = self.title()?;
        let image = non_blank(self.image.as_ref())?;
        let description = non_blank(self.description.as_ref())?;

        let id = match non_blank(self.id.as_ref()) {
            Some(id) if !taken.contains(&id) => id,
            _ => fresh_id(taken),
        };
        taken.insert(id.clone());

        Some(Product {
            id,
            title,
            category: non_blank(self.category.as_ref()).unwrap_or_else(default_category),
            price: self.price.unwrap_or(0.0),
            featured: self.featured.unwrap_or(false),
            image,
            description,
        })
    }
}

/// Turn listings into products with unique ids, skipping incomplete ones.
///
/// `taken` holds ids already used by the collection the products will join.
pub fn normalize(listings: Vec<Listing>, taken: &mut HashSet<String>) -> Vec<Product> {
    let mut products = Vec::with_capacity(listings.len());
    for listing in listings {
        let title = listing.title.clone().unwrap_or_default();
        match listing.into_product(taken) {
            Some(product) => products.push(product),
            None => warn!(%title, "skipping listing without title, image or description"),
        }
    }
    products
}

/// Decode a JSON array of products.
///
/// Arrays that fail strict decoding are read as listings and normalized;
/// the flag is `true` when that happened. Incomplete records are dropped.
///
/// # Errors
///
/// Returns the strict decoding error when the value is not an array of
/// objects, or when it holds records and none of them survive.
pub fn decode_collection(value: &Value) -> Result<(Vec<Product>, bool), serde_json::Error> {
    let strict = match Vec::<Product>::deserialize(value) {
        Ok(products) => return Ok((products, false)),
        Err(e) => e,
    };
    let Ok(listings) = Vec::<Listing>::deserialize(value) else {
        return Err(strict);
    };
    let total = listings.len();
    let products = normalize(listings, &mut HashSet::new());
    if products.is_empty() && total > 0 {
        return Err(strict);
    }
    Ok((products, true))
}

#[cfg(test)]
#[path = "product_test.rs"]
mod tests;
