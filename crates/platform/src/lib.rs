//! # Tern Platform
//!
//! Core platform types shared by the tern SSH client stack.
//!
//! This crate provides the unified error type (`TernError`) and result alias
//! (`TernResult`) used by every protocol layer.
//!
//! # Examples
//!
//! ```
//! use tern_platform::{TernError, TernResult};
//!
//! fn example_function() -> TernResult<String> {
//!     Ok("Hello, tern!".to_string())
//! }
//!
//! # fn main() -> TernResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, tern!");
//! assert!(TernError::Timeout.is_timeout());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{TernError, TernResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
