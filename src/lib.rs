//! Product catalog store for a small vehicle dealership.
//!
//! Every context (CLI invocation, admin tool, long-running watcher) keeps the
//! full product collection in a durable local cache, tells other contexts
//! about changes over a named channel, and optionally mirrors the collection
//! to a remote JSON bin that acts as the shared copy.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`store`] | [`ProductStore`]: read, write, subscribe, mirror sync |
//! | [`product`] | Product and lenient listing records, defaults |
//! | [`cache`] | Durable slot-file cache |
//! | [`channel`] | Cross-context change channel (file log or in-process) |
//! | [`remote`] | Remote mirror trait and HTTP client |
//! | [`sync`] | Push coalescing queue, sync status, periodic refresh |
//! | [`catalog`] | Storefront search, category filter and sort |
//! | [`admin`] | Upsert, delete, export, import, bulk merge |
//! | [`transfer`] | Scraper hand-off payload decoding |
//! | [`mirror_server`] | Self-hosted mirror HTTP service |
//! | [`config`] | Environment configuration |

pub mod admin;
pub mod cache;
pub mod catalog;
pub mod channel;
pub mod config;
pub mod mirror_server;
pub mod product;
pub mod remote;
pub mod store;
pub mod sync;
pub mod transfer;

pub use product::{Listing, Product};
pub use store::{ProductStore, StoreError, SubscriptionId};
