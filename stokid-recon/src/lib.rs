//! stokid reconciliation engine
//!
//! Keeps one stable identity per sellable stock variant:
//! - [`deduplicator`] merges duplicate rows and re-points their sales
//! - [`reconciler`] folds import and backup batches into the live store
//! - [`sale_resolver`] decides which variant a scanned barcode sells
//! - [`integrity`] reports invariant violations without writing
//!
//! All of them match through [`matcher`] and write through [`store`].

pub mod batch;
pub mod config;
pub mod deduplicator;
pub mod error;
pub mod integrity;
pub mod matcher;
pub mod reconciler;
pub mod sale_resolver;
pub mod store;
pub mod utils;

pub use crate::error::{Candidate, ReconError, ReconResult};
pub use crate::store::IdentityStore;
