//! Storefront catalog queries: category list, search, category filter, sort.

use std::cmp::Ordering;
use std::str::FromStr;

use crate::product::Product;

/// Category filter value meaning "no filter".
pub const ALL_CATEGORIES: &str = "all";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Featured listings first, otherwise collection order.
    #[default]
    Featured,
    PriceAsc,
    PriceDesc,
    /// Case-insensitive title order.
    Alpha,
}

impl SortOrder {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Featured => "featured",
            Self::PriceAsc => "price-asc",
            Self::PriceDesc => "price-desc",
            Self::Alpha => "alpha",
        }
    }
}

impl FromStr for SortOrder {
    type Err = std::convert::Infallible;

    /// Unknown keys fall back to [`SortOrder::Featured`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "price-asc" => Self::PriceAsc,
            "price-desc" => Self::PriceDesc,
            "alpha" => Self::Alpha,
            _ => Self::Featured,
        })
    }
}

/// Dollar amount with thousands separators, e.g. `$12,500` or `$9.5`.
///
/// Fractions are rounded to cents and trailing zeros dropped. Anything not
/// representable as a non-negative amount renders as `$0`.
#[must_use]
pub fn format_price(price: f64) -> String {
    let cents = (price * 100.0).round();
    if !cents.is_finite() || cents < 0.0 || cents > 1e17 {
        return "$0".to_owned();
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let cents = cents as u64;

    let digits = (cents / 100).to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    match cents % 100 {
        0 => format!("${grouped}"),
        tenths if tenths % 10 == 0 => format!("${grouped}.{}", tenths / 10),
        frac => format!("${grouped}.{frac:02}"),
    }
}

/// Unique categories in first-seen order.
#[must_use]
pub fn categories(products: &[Product]) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for product in products {
        if !seen.iter().any(|c| *c == product.category) {
            seen.push(product.category.clone());
        }
    }
    seen
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogQuery {
    /// Case-insensitive search across title, description and category.
    pub term: String,
    /// Exact category; `None` or `"all"` matches every category.
    pub category: Option<String>,
    pub sort: SortOrder,
}

impl CatalogQuery {
    fn matches(&self, product: &Product, term: &str) -> bool {
        let matches_term = term.is_empty() || {
            let haystack = format!("{} {} {}", product.title, product.description, product.category);
            haystack.to_lowercase().contains(term)
        };
        let matches_category = match self.category.as_deref() {
            None | Some(ALL_CATEGORIES) => true,
            Some(category) => product.category == category,
        };
        matches_term && matches_category
    }

    /// Filter and sort a snapshot. Sorting is stable.
    #[must_use]
    pub fn apply(&self, products: &[Product]) -> Vec<Product> {
        let term = self.term.trim().to_lowercase();
        let mut result: Vec<Product> = products
            .iter()
            .filter(|p| self.matches(p, &term))
            .cloned()
            .collect();

        match self.sort {
            SortOrder::Featured => result.sort_by_key(|p| !p.featured),
            SortOrder::PriceAsc => result.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal)),
            SortOrder::PriceDesc => result.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(Ordering::Equal)),
            SortOrder::Alpha => result.sort_by(|a, b| {
                a.title
                    .to_lowercase()
                    .cmp(&b.title.to_lowercase())
                    .then_with(|| a.title.cmp(&b.title))
            }),
        }
        result
    }
}

#[cfg(test)]
#[path = "catalog_test.rs"]
mod tests;
