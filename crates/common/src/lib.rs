//! Common types for the document assistant workspace

mod secret;
mod error;

pub use secret::Secret;
pub use error::{Error, Result};
