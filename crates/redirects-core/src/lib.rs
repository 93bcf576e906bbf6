//! # Redirects Core
//!
//! Runtime-free logic for the redirects service: the redirect data model,
//! content-tree diffing, redirect chain analysis, consolidation of derived
//! and persisted redirects, the flattening pass and the storage abstraction.
//!
//! This crate contains no tokio, sqlx, HTTP or filesystem dependencies.
//! Everything here operates on data that has already been fetched into
//! memory; callers are responsible for serializing writes per dimension.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | `RedirectDefinition` and its value types |
//! | [`error`] | `RedirectError` and the crate `Result` alias |
//! | [`tree`] | Content tree flattening and old/new diffing |
//! | [`chain`] | Cycle detection and final-target resolution |
//! | [`consolidate`] | Merging derived redirects into the persisted set |
//! | [`flatten`] | Multi-hop flattening of an active redirect set |
//! | [`store`] | `RedirectStore` trait and the in-memory store |

pub mod chain;
pub mod consolidate;
pub mod error;
pub mod flatten;
pub mod models;
pub mod store;
pub mod tree;

pub use error::{RedirectError, Result};
pub use models::{
    Dimension, EntityId, Redirect, RedirectCode, RedirectDefinition, RedirectionType,
    RedirectsBySource,
};
