//! BIM Module
//!
//! The block-structured note store: entries owning an ordered list of
//! heterogeneous content blocks (text, image, code, headings), persisted
//! with full-replace update semantics and a self-healing primary-key
//! allocator for the blocks table.
//!
//! # Usage
//!
//! ```rust,ignore
//! use bimstore::bim;
//!
//! // Get the migrations to run
//! for (name, sql) in bim::migrations() {
//!     // Run migration...
//! }
//!
//! // Mount the routes
//! let app = Router::new()
//!     .merge(bim::routes())
//!     .with_state(app_state);
//!
//! // Use the store directly
//! let store = bim::BimStore::new(&pool)?;
//! let entry = store.create_entry(&title, &tags, &blocks).await?;
//! ```

mod allocator;
pub mod handler;
mod lib;
pub mod normalize;
mod routes;

pub use lib::*;
pub use routes::routes;

/// Returns the migrations for the bim module.
///
/// These are applied once at pool initialization, before the first
/// request is served.
pub fn migrations() -> &'static [(&'static str, &'static str)] {
    &[("bim_001_schema.sql", include_str!("migrations/001_schema.sql"))]
}
