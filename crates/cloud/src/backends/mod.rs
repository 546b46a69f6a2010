//! Cloud API backends.

pub mod aws;
pub mod memory;
