//! Database module: view models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: view models returned by listing queries.
//! - `repo`: SQL-only functions that map rows into domain entities.
//!
//! External modules should import from `tg_enrollbot::db`; the repository API
//! and the view models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{PendingRequest, StatusCounts};
