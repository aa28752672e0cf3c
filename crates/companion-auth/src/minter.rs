//! Session minting
//!
//! `SessionMinter` is the seam between the credential pool and whatever
//! produces fresh bundles. The pool only ever calls `mint`; test code swaps
//! in counting or failing minters.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use tracing::{info, warn};

use crate::captured::CapturedAuthPool;
use crate::constants::{
    DEFAULT_BLAZE_ID, DEFAULT_PRODUCT_NAME, DEFAULT_TICKET_LIFETIME_SECS, WAL_LOGIN_ENDPOINT,
};
use crate::credentials::{CredentialBundle, now_millis};
use crate::error::{Error, Result};
use crate::{jwt, ticket};

/// Identity material a minter needs to obtain a fresh session.
#[derive(Debug, Clone)]
pub struct PersonaContext {
    pub access_token: Secret<String>,
    pub persona_id: Option<u64>,
    /// Cookie blob copied onto every bundle minted for this persona
    pub cookie: Option<Secret<String>>,
}

impl PersonaContext {
    pub fn new(access_token: impl Into<Secret<String>>) -> Self {
        Self {
            access_token: access_token.into(),
            persona_id: None,
            cookie: None,
        }
    }
}

/// Produces new credential bundles.
pub trait SessionMinter: Send + Sync {
    /// Identifier for logs and metrics (e.g. "wal").
    fn id(&self) -> &str;

    /// Obtain one fresh bundle. Errors are `Error::MintFailed` or more specific
    /// auth errors when the persona's access token was refused.
    fn mint<'a>(
        &'a self,
        persona: &'a PersonaContext,
    ) -> Pin<Box<dyn Future<Output = Result<CredentialBundle>> + Send + 'a>>;
}

/// Mints bundles by logging in at the WAL endpoint and pairing the ticket
/// with the next captured auth material.
pub struct WalSessionMinter {
    client: reqwest::Client,
    materials: Arc<CapturedAuthPool>,
    endpoint: String,
    product_name: String,
    blaze_id: String,
    ticket_lifetime: Duration,
}

impl WalSessionMinter {
    pub fn new(client: reqwest::Client, materials: Arc<CapturedAuthPool>) -> Self {
        Self {
            client,
            materials,
            endpoint: WAL_LOGIN_ENDPOINT.to_string(),
            product_name: DEFAULT_PRODUCT_NAME.to_string(),
            blaze_id: DEFAULT_BLAZE_ID.to_string(),
            ticket_lifetime: Duration::from_secs(DEFAULT_TICKET_LIFETIME_SECS),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_product_name(mut self, product_name: impl Into<String>) -> Self {
        self.product_name = product_name.into();
        self
    }

    pub fn with_blaze_id(mut self, blaze_id: impl Into<String>) -> Self {
        self.blaze_id = blaze_id.into();
        self
    }

    pub fn with_ticket_lifetime(mut self, lifetime: Duration) -> Self {
        self.ticket_lifetime = lifetime;
        self
    }

    /// Ticket expiry: configured lifetime, capped by the access token's `exp`.
    fn expiry_for(&self, access_token: &str, issued_at: u64) -> Result<u64> {
        let lifetime_ms = u64::try_from(self.ticket_lifetime.as_millis()).unwrap_or(u64::MAX);
        let by_lifetime = issued_at.saturating_add(lifetime_ms);
        let expires_at = match jwt::expiry_millis(access_token) {
            Some(exp) if exp <= issued_at => {
                return Err(Error::InvalidCredentials(
                    "persona access token has expired".into(),
                ));
            }
            Some(exp) => exp.min(by_lifetime),
            None => by_lifetime,
        };
        Ok(expires_at)
    }

    async fn mint_inner(&self, persona: &PersonaContext) -> Result<CredentialBundle> {
        let access_token = persona.access_token.expose();
        let issued_at = now_millis();
        let expires_at = self.expiry_for(access_token, issued_at)?;
        let material = self.materials.next_material()?;

        let session = ticket::login(
            &self.client,
            &self.endpoint,
            access_token,
            &self.product_name,
            &self.blaze_id,
        )
        .await?;

        let id = format!("bnd_{}", uuid::Uuid::new_v4().simple());
        let bundle = CredentialBundle::new(id, session.ticket, material, issued_at, expires_at)?
            .with_cookie(persona.cookie.clone())
            .with_sequence_seed(u64::from(rand::random::<u32>()));

        info!(
            bundle_id = %bundle.id,
            fingerprint = %bundle.fingerprint(),
            blaze_id = session.blaze_id,
            persona_id = ?persona.persona_id,
            expires_at,
            "minted session bundle"
        );
        Ok(bundle)
    }
}

impl SessionMinter for WalSessionMinter {
    fn id(&self) -> &str {
        "wal"
    }

    fn mint<'a>(
        &'a self,
        persona: &'a PersonaContext,
    ) -> Pin<Box<dyn Future<Output = Result<CredentialBundle>> + Send + 'a>> {
        Box::pin(async move {
            self.mint_inner(persona).await.map_err(|e| match e {
                Error::InvalidCredentials(_) | Error::MintFailed(_) => e,
                other => {
                    warn!(error = %other, "session mint failed");
                    Error::MintFailed(other.to_string())
                }
            })
        })
    }
}
