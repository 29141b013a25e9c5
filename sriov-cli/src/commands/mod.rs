//! CLI command implementations

pub mod numvfs;
pub mod provision;

pub use provision::provision;
