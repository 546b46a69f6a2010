//! Core types shared by the sweeper crates.
//!
//! This crate defines:
//! - Application configuration and the derived run mode
//! - Account ids and bucket tasks
//! - The listing/deletion scope filter

pub mod config;
pub mod error;
pub mod filter;
pub mod model;

pub use config::{AppConfig, DANGER_SENTINEL, RunMode};
pub use error::{Error, Result};
pub use filter::{FilterEngine, FilterRules};
pub use model::{AccountId, AccountRef, AccountStatus, BucketTask};

/// Suffix appended to a key while it is being re-encrypted.
pub const TEMP_SUFFIX: &str = "%%%";
