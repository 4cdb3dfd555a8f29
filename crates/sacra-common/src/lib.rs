//! Sacra Common Library
//!
//! Shared utilities and error handling for the Sacra workspace.
//!
//! # Overview
//!
//! This crate provides common functionality used across all Sacra workspace members:
//!
//! - **Error Handling**: Common error type and result alias
//! - **Checksums**: SHA-256 content digests for uploaded files and record fingerprints
//! - **Logging**: Centralized tracing subscriber configuration
//!
//! # Example
//!
//! ```no_run
//! use sacra_common::{checksum, Result};
//!
//! fn fingerprint_upload(path: &str) -> Result<()> {
//!     let digest = checksum::compute_file_checksum(path)?;
//!     tracing::info!(%digest, "Upload checksum computed");
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, SacraError};
