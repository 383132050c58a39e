//! # Tern Platform
//!
//! Shared types for the Tern SSH client stack.
//!
//! This crate provides the unified error taxonomy (`TernError`, `TernResult`)
//! used by every protocol layer.
//!
//! # Examples
//!
//! ```
//! use tern_platform::{TernError, TernResult};
//!
//! fn negotiate() -> TernResult<String> {
//!     Err(TernError::NoCommonAlgorithm {
//!         category: "kex".to_string(),
//!         client: vec!["ecdh-sha2-nistp256".to_string()],
//!         server: vec![],
//!     })
//! }
//!
//! let err = negotiate().unwrap_err();
//! assert!(err.is_fatal());
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{TernError, TernResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
