//! # microproto-store
//!
//! SQLite persistence for properties flagged `persistent`.
//!
//! Values are stored in their wire encoding next to a JSON signature of the
//! property type; a row whose signature no longer matches the registered type
//! is ignored on load.

#![deny(unsafe_code)]

pub mod database;
pub mod error;
pub mod property_values;
mod schema;

pub use database::Database;
pub use error::StoreError;
pub use property_values::{PropertyValueRepo, StoredProperty};
