//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite database operations
//! - Keyset pagination over ULID-keyed tables

mod database;
mod models;
pub mod pagination;

pub use database::Database;
pub use models::*;
pub use pagination::{Cursor, Direction, Filter, Page, PageLinks, PageRequest};
