//! Core data models for the transfer service.
//!
//! Records map to SQLite rows via `sqlx::FromRow` and serialize as JSON via
//! `serde`.

pub mod blob;
pub mod notification;
pub mod transfer;
