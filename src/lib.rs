//! # Redirects
//!
//! A redirect service for content-driven sites.
//!
//! When pages move in the content tree, the service derives permanent
//! redirects from the old and new trees, consolidates them with the
//! redirects already stored (propagating chains, marking cycles stale,
//! dropping dead redirects) and answers matching HTTP requests from an
//! in-memory index that reloads whenever the stored set changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Content diff │──▶│ Consolidate  │──▶│  SQLite   │
//! │ (old / new)  │   │ + flatten    │   │ redirects │
//! └──────────────┘   └──────┬───────┘   └────┬─────┘
//!                           │ signal          │ load
//!                           ▼                 ▼
//!                     ┌──────────┐      ┌──────────┐
//!                     │  Index   │◀─────│ Reloader │
//!                     └────┬─────┘      └──────────┘
//!                          ▼
//!                   ┌──────────────┐
//!                   │  Middleware  │  GET → 301/302/307/404/410
//!                   └──────────────┘
//! ```
//!
//! The pure algorithms live in the `redirects-core` crate; this crate adds
//! persistence, the index, request resolution, the command API and the
//! HTTP server.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite-backed redirect store |
//! | [`bounded_store`] | Timeout decorator for any store |
//! | [`signal`] | Change notification |
//! | [`index`] | In-memory redirect index and reload loop |
//! | [`resolver`] | Request normalization and matching |
//! | [`middleware`] | Axum redirect middleware |
//! | [`commands`] | Write commands and their middleware |
//! | [`api`] | Facade over commands and queries |
//! | [`server`] | HTTP server |

pub mod api;
pub mod bounded_store;
pub mod commands;
pub mod config;
pub mod db;
pub mod index;
pub mod middleware;
pub mod migrate;
pub mod resolver;
pub mod server;
pub mod signal;
pub mod sqlite_store;
