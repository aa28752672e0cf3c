//! Credential bundles and session minting for the companion auction API
//!
//! A `CredentialBundle` is one usable identity: a WAL session ticket paired
//! with captured message auth material. Bundles are minted through the
//! `SessionMinter` trait and persisted by `BundleStore` so that per-bundle
//! request sequence numbers survive restarts.
//!
//! Minting flow (`WalSessionMinter`):
//! 1. Persona access token (JWT) supplied by the operator
//! 2. `ticket::login()` exchanges it for a session ticket at the WAL endpoint
//! 3. Next captured auth material is taken from `CapturedAuthPool`
//! 4. Expiry is the JWT `exp` claim capped by the configured ticket lifetime

pub mod captured;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod jwt;
pub mod minter;
pub mod store;
pub mod ticket;

pub use captured::{CapturedAuth, CapturedAuthPool};
pub use constants::*;
pub use credentials::{AuthMaterial, CredentialBundle, now_millis};
pub use error::{Error, Result};
pub use minter::{PersonaContext, SessionMinter, WalSessionMinter};
pub use store::BundleStore;
pub use ticket::{SessionLogin, login};
