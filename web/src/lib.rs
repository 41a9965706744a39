//! Axum integration for the souk order fabric.
//!
//! Bridges domain errors to the platform's HTTP contract and provides the
//! extractors for the identity headers the gateway forwards downstream
//! (`X-User-ID` after bearer-token verification, `X-Admin-Key` for the
//! flash-sale admin surface).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod extractors;

pub use error::AppError;
pub use extractors::{AdminKey, UserId};
