//! # Skiff Platform
//!
//! Shared error types and diagnostics for the Skiff SSH workspace.
//!
//! This crate provides:
//! - The unified error type ([`SkiffError`], [`SkiffResult`])
//! - The append-only diagnostic sink ([`ErrorLog`]) the session worker
//!   pushes structured error records into
//!
//! # Examples
//!
//! ```
//! use skiff_platform::{SkiffError, SkiffResult};
//!
//! fn example_function() -> SkiffResult<String> {
//!     Ok("Hello, Skiff!".to_string())
//! }
//!
//! # fn main() -> SkiffResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Skiff!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{ErrorLog, ErrorRecord, SkiffError, SkiffResult};

/// Platform version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
