//! Database module: query filters and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: filters and row slices passed to or returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules should import from `blog_api::db`; the repository API and
//! the filter types are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::PostFilter;
