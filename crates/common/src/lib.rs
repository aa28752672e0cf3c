//! Common types shared by the companion auction collector crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
