//! Credential bundle: one usable auth identity
//!
//! Timestamps are unix milliseconds. A bundle is usable while it is neither
//! expired nor dead; the pool evicts it as soon as either stops being true.

use common::Secret;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Current wall-clock time as unix milliseconds.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Message auth material attached to each request (`messageAuthData`).
///
/// Opaque to the core: it is replayed verbatim into the request template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMaterial {
    pub code: Secret<String>,
    pub data: Secret<String>,
    pub auth_type: u32,
}

/// A session ticket plus auth material, with per-bundle health counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub id: String,
    pub ticket: Secret<String>,
    pub auth_material: AuthMaterial,
    /// Opaque cookie blob (e.g. `ak_bmsc`) sent alongside the ticket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<Secret<String>>,
    pub issued_at: u64,
    pub expires_at: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_used_at: Option<u64>,
    #[serde(default)]
    pub last_success_at: Option<u64>,
    /// Last sequence number handed out for this bundle
    #[serde(default)]
    pub request_sequence: u64,
    /// Set on auth rejection; a rejected ticket never works again
    #[serde(default)]
    pub rejected: bool,
}

impl CredentialBundle {
    /// Build a fresh bundle. Fails unless `expires_at > issued_at`.
    pub fn new(
        id: impl Into<String>,
        ticket: Secret<String>,
        auth_material: AuthMaterial,
        issued_at: u64,
        expires_at: u64,
    ) -> Result<Self> {
        let bundle = Self {
            id: id.into(),
            ticket,
            auth_material,
            cookie: None,
            issued_at,
            expires_at,
            consecutive_failures: 0,
            last_used_at: None,
            last_success_at: None,
            request_sequence: 0,
            rejected: false,
        };
        bundle.validate()?;
        Ok(bundle)
    }

    pub fn with_cookie(mut self, cookie: Option<Secret<String>>) -> Self {
        self.cookie = cookie;
        self
    }

    /// Start the sequence counter at `seed`; the first issued number is `seed + 1`.
    pub fn with_sequence_seed(mut self, seed: u64) -> Self {
        self.request_sequence = seed;
        self
    }

    /// Check structural invariants (non-empty id, `expires_at > issued_at`).
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidBundle("bundle id must not be empty".into()));
        }
        if self.expires_at <= self.issued_at {
            return Err(Error::InvalidBundle(format!(
                "bundle {} expires_at ({}) must be after issued_at ({})",
                self.id, self.expires_at, self.issued_at
            )));
        }
        Ok(())
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub fn is_dead(&self, failure_threshold: u32) -> bool {
        self.rejected || self.consecutive_failures >= failure_threshold
    }

    /// Eligible for selection: not dead and not expired.
    pub fn is_usable(&self, now: u64, failure_threshold: u32) -> bool {
        !self.is_expired(now) && !self.is_dead(failure_threshold)
    }

    /// Milliseconds until expiry, zero once expired.
    pub fn remaining_ms(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    /// Short SHA-256 digest of the ticket for log correlation.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.ticket.expose().as_bytes());
        digest[..6].iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn material(suffix: &str) -> AuthMaterial {
        AuthMaterial {
            code: format!("code_{suffix}").into(),
            data: format!("data_{suffix}").into(),
            auth_type: crate::DEFAULT_AUTH_TYPE,
        }
    }

    #[test]
    fn new_rejects_expiry_not_after_issue() {
        let err = CredentialBundle::new("b", "t".into(), material("b"), 1_000, 1_000).unwrap_err();
        assert!(matches!(err, Error::InvalidBundle(_)), "got: {err}");

        let err = CredentialBundle::new("b", "t".into(), material("b"), 2_000, 1_000).unwrap_err();
        assert!(err.to_string().contains("must be after issued_at"));
    }

    #[test]
    fn new_rejects_blank_id() {
        let err = CredentialBundle::new("  ", "t".into(), material("b"), 1, 2).unwrap_err();
        assert!(matches!(err, Error::InvalidBundle(_)));
    }

    #[test]
    fn expired_exactly_at_expires_at() {
        let bundle = CredentialBundle::new("b", "t".into(), material("b"), 1_000, 5_000).unwrap();
        assert!(!bundle.is_expired(4_999));
        assert!(bundle.is_expired(5_000));
        assert!(bundle.is_expired(9_000));
        assert_eq!(bundle.remaining_ms(4_000), 1_000);
        assert_eq!(bundle.remaining_ms(6_000), 0);
    }

    #[test]
    fn dead_by_counter_or_rejection() {
        let mut bundle = CredentialBundle::new("b", "t".into(), material("b"), 1, 2).unwrap();
        bundle.consecutive_failures = 2;
        assert!(!bundle.is_dead(3));
        bundle.consecutive_failures = 3;
        assert!(bundle.is_dead(3));

        bundle.consecutive_failures = 0;
        bundle.rejected = true;
        assert!(bundle.is_dead(3), "rejection overrides the counter");
    }

    #[test]
    fn sequence_seed_and_cookie_builders() {
        let bundle = CredentialBundle::new("b", "t".into(), material("b"), 1, 2)
            .unwrap()
            .with_sequence_seed(41)
            .with_cookie(Some("ak_bmsc=xyz".into()));
        assert_eq!(bundle.request_sequence, 41);
        assert_eq!(bundle.cookie.as_ref().unwrap().expose(), "ak_bmsc=xyz");
    }

    #[test]
    fn fingerprint_is_stable_and_hides_ticket() {
        let a = CredentialBundle::new("a", "ticket-1".into(), material("a"), 1, 2).unwrap();
        let b = CredentialBundle::new("b", "ticket-1".into(), material("b"), 1, 2).unwrap();
        let c = CredentialBundle::new("c", "ticket-2".into(), material("c"), 1, 2).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint().len(), 12);
        assert!(!a.fingerprint().contains("ticket"));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let bundle = CredentialBundle::new("bnd_1", "ticket-secret".into(), material("x"), 1, 2)
            .unwrap();
        let debug = format!("{bundle:?}");
        assert!(debug.contains("bnd_1"));
        assert!(!debug.contains("ticket-secret"));
        assert!(!debug.contains("code_x"));
    }

    #[test]
    fn deserializes_with_missing_counters() {
        let json = r#"{
            "id": "bnd_legacy",
            "ticket": "t",
            "auth_material": {"code": "c", "data": "d", "auth_type": 17039361},
            "issued_at": 1,
            "expires_at": 2
        }"#;
        let bundle: CredentialBundle = serde_json::from_str(json).unwrap();
        assert_eq!(bundle.consecutive_failures, 0);
        assert_eq!(bundle.request_sequence, 0);
        assert!(!bundle.rejected);
        assert!(bundle.cookie.is_none());
    }
}
