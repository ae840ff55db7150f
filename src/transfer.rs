//! Transfer payloads handed to the admin surface by scraper bookmarklets.
//!
//! Three hand-off routes exist:
//!
//! - `#scraped=<percent-encoded JSON object>` carries one listing.
//! - `#bulk=<base64 of percent-encoded JSON array>` carries many listings.
//! - `#bulk=localStorage` says the same bulk payload is waiting in the
//!   `bulk_transfer` cache slot because it was too big for a URL.
//!
//! Separately, a plain JSON array may be left in the `truespeed_bulk_import`
//! slot and is picked up by [`take_pending_import`].
//!
//! ERROR HANDLING
//! ==============
//! Decoding failures never touch the store. A slot whose payload fails to
//! decode is left in place so the operator can inspect it.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use percent_encoding::percent_decode_str;
use tracing::{info, warn};

use crate::admin::{self, ProductForm, Upserted};
use crate::cache::{CacheError, LocalCache};
use crate::product::{Listing, Product};
use crate::store::ProductStore;

/// Slot holding a plain JSON array queued for import.
pub const BULK_IMPORT_KEY: &str = "truespeed_bulk_import";
/// Slot holding an encoded bulk payload referenced by `#bulk=localStorage`.
pub const BULK_TRANSFER_KEY: &str = "bulk_transfer";

const BULK_PREFIX: &str = "bulk=";
const SCRAPED_PREFIX: &str = "scraped=";
const SLOT_MARKER: &str = "localStorage";

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("bulk payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid listing JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transfer {
    Bulk(Vec<Listing>),
    /// Bulk payload waiting in the [`BULK_TRANSFER_KEY`] slot.
    BulkSlot,
    Scraped(Listing),
}

/// What applying a transfer did.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    /// Bulk listings merged; the count of new products.
    Merged(usize),
    /// A scraped listing prefilled the form; `saved` is set when it was
    /// also saved.
    Prefilled { form: ProductForm, saved: Option<(Upserted, Product)> },
    /// The referenced slot was empty.
    Empty,
}

// =============================================================================
// DECODING
// =============================================================================

fn percent_decoded(text: &str) -> Result<String, TransferError> {
    Ok(percent_decode_str(text).decode_utf8()?.into_owned())
}

/// Decode a bulk payload: base64, then percent-encoding, then a JSON array.
///
/// # Errors
///
/// Returns the [`TransferError`] for the first layer that fails.
pub fn decode_bulk_payload(text: &str) -> Result<Vec<Listing>, TransferError> {
    let bytes = STANDARD.decode(text.trim())?;
    let json = percent_decoded(std::str::from_utf8(&bytes)?)?;
    Ok(serde_json::from_str(&json)?)
}

/// Parse a URL fragment, with or without the leading `#`.
///
/// Returns `Ok(None)` for fragments that carry no transfer.
///
/// # Errors
///
/// Returns [`TransferError`] when a transfer fragment fails to decode.
pub fn parse_fragment(fragment: &str) -> Result<Option<Transfer>, TransferError> {
    let fragment = fragment.trim();
    let fragment = fragment.strip_prefix('#').unwrap_or(fragment);

    if let Some(payload) = fragment.strip_prefix(BULK_PREFIX) {
        if payload == SLOT_MARKER {
            return Ok(Some(Transfer::BulkSlot));
        }
        return Ok(Some(Transfer::Bulk(decode_bulk_payload(payload)?)));
    }
    if let Some(payload) = fragment.strip_prefix(SCRAPED_PREFIX) {
        let listing = serde_json::from_str(&percent_decoded(payload)?)?;
        return Ok(Some(Transfer::Scraped(listing)));
    }
    Ok(None)
}

// =============================================================================
// CACHE SLOTS
// =============================================================================

fn take_slot<T>(
    cache: &LocalCache,
    key: &str,
    decode: impl FnOnce(&str) -> Result<T, TransferError>,
) -> Result<Option<T>, TransferError> {
    let Some(raw) = cache.get(key)? else {
        return Ok(None);
    };
    match decode(&raw) {
        Ok(value) => {
            cache.remove(key)?;
            Ok(Some(value))
        }
        Err(e) => {
            warn!(slot = key, error = %e, "transfer slot undecodable; left in place");
            Err(e)
        }
    }
}

/// Read, decode and clear the [`BULK_TRANSFER_KEY`] slot.
///
/// # Errors
///
/// Returns [`TransferError`] when the slot cannot be read or decoded.
pub fn take_bulk_slot(cache: &LocalCache) -> Result<Option<Vec<Listing>>, TransferError> {
    take_slot(cache, BULK_TRANSFER_KEY, decode_bulk_payload)
}

/// Read, parse and clear the [`BULK_IMPORT_KEY`] slot.
///
/// # Errors
///
/// Returns [`TransferError`] when the slot cannot be read or parsed.
pub fn take_pending_import(cache: &LocalCache) -> Result<Option<Vec<Listing>>, TransferError> {
    take_slot(cache, BULK_IMPORT_KEY, |raw| Ok(serde_json::from_str(raw)?))
}

// =============================================================================
// APPLY
// =============================================================================

/// Apply a decoded transfer to the store.
///
/// Bulk listings are merged with title de-duplication. A scraped listing
/// becomes a prefilled form; with `auto_save` it is also upserted, provided
/// it has a title and an image.
///
/// # Errors
///
/// Returns [`TransferError`] when the bulk slot cannot be read or decoded.
/// An incomplete scraped listing is not an error; it is prefilled but not
/// saved.
pub fn apply_transfer(
    store: &ProductStore,
    transfer: Transfer,
    auto_save: bool,
) -> Result<TransferOutcome, TransferError> {
    match transfer {
        Transfer::Bulk(listings) => Ok(TransferOutcome::Merged(admin::merge_listings(store, listings))),
        Transfer::BulkSlot => match take_bulk_slot(store.cache())? {
            Some(listings) => Ok(TransferOutcome::Merged(admin::merge_listings(store, listings))),
            None => {
                info!("bulk transfer slot is empty");
                Ok(TransferOutcome::Empty)
            }
        },
        Transfer::Scraped(listing) => {
            let form = ProductForm::from_listing(&listing);
            info!(
                title = %form.title,
                source = listing.source.as_deref().unwrap_or("website"),
                "scraped listing received"
            );
            let ready = !form.title.trim().is_empty() && !form.image.trim().is_empty();
            let saved = if auto_save && ready {
                match admin::upsert(store, form.clone()) {
                    Ok(saved) => Some(saved),
                    Err(e) => {
                        warn!(error = %e, "scraped listing not auto-saved");
                        None
                    }
                }
            } else {
                None
            };
            Ok(TransferOutcome::Prefilled { form, saved })
        }
    }
}

#[cfg(test)]
#[path = "transfer_test.rs"]
mod tests;
