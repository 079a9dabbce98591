//! Core of the larder kitchen backend.
//!
//! Every syncable row (recipes, pantry items, shopping lists and items, meal
//! plans and entries) carries a per-row `sync_version`, a server-stamped
//! `updated_at` and a soft-delete marker. On top of that shape this crate
//! provides delta extraction for pull sync, the per-entity conflict policy used
//! when client and server copies diverge, and the transactional
//! shopping-list-to-pantry completion workflow.

pub mod category;
pub mod conflict;
pub mod db;
pub mod error;
pub mod models;
pub mod service;

pub use error::{Error, Result};
