//! # stokid common library
//!
//! Persistence layer shared by the stokid engine and its tools:
//! - Error type and result alias
//! - Configuration resolution (CLI > ENV > TOML > default)
//! - Identity generation for stock variants
//! - Database init, declarative table schemas, migrations and row models

pub mod config;
pub mod db;
pub mod error;
pub mod identity;

pub use error::{Error, Result};
