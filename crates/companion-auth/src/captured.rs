//! Captured message auth material
//!
//! `messageAuthData` cannot be generated locally; it is captured from real
//! companion app traffic and replayed. The capture file is a JSON array of
//! `{auth_code, auth_data, auth_type, source_timestamp}` records. Entries are
//! handed out round-robin so no single capture is reused back to back.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::credentials::AuthMaterial;
use crate::error::{Error, Result};

/// One captured `messageAuthData` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedAuth {
    pub auth_code: String,
    pub auth_data: String,
    pub auth_type: u32,
    #[serde(default)]
    pub source_timestamp: f64,
}

impl CapturedAuth {
    fn to_material(&self) -> AuthMaterial {
        AuthMaterial {
            code: self.auth_code.clone().into(),
            data: self.auth_data.clone().into(),
            auth_type: self.auth_type,
        }
    }
}

/// Round-robin rotation over captured auth records.
#[derive(Debug)]
pub struct CapturedAuthPool {
    entries: Vec<CapturedAuth>,
    next: AtomicUsize,
}

impl CapturedAuthPool {
    /// Load captures from a JSON array file. The file must exist.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::CapturedAuth(format!("reading {}: {e}", path.display()))
        })?;
        let entries: Vec<CapturedAuth> = serde_json::from_str(&contents).map_err(|e| {
            Error::CredentialParse(format!("parsing {}: {e}", path.display()))
        })?;

        info!(path = %path.display(), pool_size = entries.len(), "captured auth loaded");
        Ok(Self::from_entries(entries))
    }

    pub fn from_entries(entries: Vec<CapturedAuth>) -> Self {
        Self {
            entries,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Next capture in rotation, as bundle auth material.
    pub fn next_material(&self) -> Result<AuthMaterial> {
        if self.entries.is_empty() {
            return Err(Error::CapturedAuth("captured auth pool is empty".into()));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.entries.len();
        debug!(pool_index = index, pool_size = self.entries.len(), "captured auth retrieved");
        Ok(self.entries[index].to_material())
    }
}
