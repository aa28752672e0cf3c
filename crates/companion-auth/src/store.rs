//! Persisted credential pool state
//!
//! The pool is written as a JSON array of bundle records (each keyed by its
//! `id`) in arrival order. All writes use atomic temp-file + rename so a
//! crash mid-write never leaves a truncated file, and the file is created
//! with 0600 permissions since it holds live session tickets.
//!
//! The store itself is stateless: the pool owns the in-memory bundles and
//! calls `save` under its own lock after every mutation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info, warn};

use crate::credentials::CredentialBundle;
use crate::error::{Error, Result};

/// File-backed persistence for the credential pool.
#[derive(Debug, Clone)]
pub struct BundleStore {
    path: PathBuf,
}

impl BundleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted bundles in their stored order.
    ///
    /// A missing file is a cold start: it is created as `[]`. Records that
    /// fail to parse or violate bundle invariants are skipped with a warning,
    /// as are duplicate ids (first occurrence wins).
    pub async fn load(&self) -> Result<Vec<CredentialBundle>> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "pool state file not found, starting empty");
            write_atomic(&self.path, &[]).await?;
            return Ok(Vec::new());
        }

        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Io(format!("reading pool state: {e}")))?;
        let records: Vec<serde_json::Value> = serde_json::from_str(&contents)
            .map_err(|e| Error::CredentialParse(format!("parsing pool state: {e}")))?;

        let mut seen = HashSet::new();
        let mut bundles = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            let bundle: CredentialBundle = match serde_json::from_value(record) {
                Ok(b) => b,
                Err(e) => {
                    warn!(index, error = %e, "skipping unparseable pool record");
                    continue;
                }
            };
            if let Err(e) = bundle.validate() {
                warn!(index, error = %e, "skipping invalid pool record");
                continue;
            }
            if !seen.insert(bundle.id.clone()) {
                warn!(bundle_id = %bundle.id, "skipping duplicate pool record");
                continue;
            }
            bundles.push(bundle);
        }

        info!(path = %self.path.display(), bundles = bundles.len(), "loaded pool state");
        Ok(bundles)
    }

    /// Persist the full ordered pool.
    pub async fn save(&self, bundles: &[CredentialBundle]) -> Result<()> {
        write_atomic(&self.path, bundles).await
    }
}

/// Write bundles to `path` atomically with 0600 permissions.
async fn write_atomic(path: &Path, bundles: &[CredentialBundle]) -> Result<()> {
    let json = serde_json::to_string_pretty(bundles)
        .map_err(|e| Error::CredentialParse(format!("serializing pool state: {e}")))?;

    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::Io(format!("creating pool state directory: {e}")))?;

    let tmp_path = temp_path_for(&dir, path);

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp pool state: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting pool state permissions: {e}")))?;
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(Error::Io(format!("renaming temp pool state: {e}")));
    }

    debug!(path = %path.display(), bundles = bundles.len(), "persisted pool state");
    Ok(())
}

/// Sibling temp file named after the target and unique per write.
fn temp_path_for(dir: &Path, path: &Path) -> PathBuf {
    static WRITES: AtomicU64 = AtomicU64::new(0);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pool-state".into());
    let n = WRITES.fetch_add(1, Ordering::Relaxed);
    dir.join(format!(".{name}.tmp.{}.{n}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::tests::material;

    fn bundle(id: &str, expires_at: u64) -> CredentialBundle {
        CredentialBundle::new(id, format!("ticket_{id}").into(), material(id), 1_000, expires_at)
            .unwrap()
    }

    #[tokio::test]
    async fn cold_start_creates_empty_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("pool.json");
        let store = BundleStore::new(&path);

        let bundles = store.load().await.unwrap();
        assert!(bundles.is_empty());
        assert!(path.exists());
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&contents).unwrap();
        assert!(parsed.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_preserves_order_and_counters() {
        let dir = tempfile::tempdir().unwrap();
        let store = BundleStore::new(dir.path().join("pool.json"));

        let mut second = bundle("b", 9_000);
        second.request_sequence = 77;
        second.consecutive_failures = 2;
        second.last_success_at = Some(4_000);
        store.save(&[bundle("a", 8_000), second]).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "a");
        assert_eq!(loaded[1].id, "b");
        assert_eq!(loaded[1].request_sequence, 77);
        assert_eq!(loaded[1].consecutive_failures, 2);
        assert_eq!(loaded[1].last_success_at, Some(4_000));
        assert_eq!(loaded[1].ticket.expose(), "ticket_b");
    }

    #[tokio::test]
    async fn load_skips_invalid_and_duplicate_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        let good = serde_json::to_value(bundle("good", 5_000)).unwrap();
        let mut inverted = good.clone();
        inverted["id"] = "inverted".into();
        inverted["expires_at"] = 10.into();
        let records = serde_json::json!([good, {"id": "broken"}, inverted, good]);
        tokio::fs::write(&path, records.to_string()).await.unwrap();

        let loaded = BundleStore::new(&path).load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "good");
    }

    #[tokio::test]
    async fn load_rejects_non_array_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        tokio::fs::write(&path, "{\"a\": 1}").await.unwrap();

        let err = BundleStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err, Error::CredentialParse(_)), "got: {err}");
    }

    #[tokio::test]
    async fn temp_files_are_named_after_the_target() {
        let dir = tempfile::tempdir().unwrap();
        let a = temp_path_for(dir.path(), &dir.path().join("east.json"));
        let b = temp_path_for(dir.path(), &dir.path().join("west.json"));
        let a_name = a.file_name().unwrap().to_string_lossy().into_owned();
        assert!(a_name.starts_with(".east.json.tmp."), "got {a_name}");
        assert!(b.file_name().unwrap().to_string_lossy().starts_with(".west.json.tmp."));
        assert_ne!(a, temp_path_for(dir.path(), &dir.path().join("east.json")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stores_sharing_a_directory_do_not_clobber_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let east = BundleStore::new(dir.path().join("east.json"));
        let west = BundleStore::new(dir.path().join("west.json"));

        let mut writers = tokio::task::JoinSet::new();
        for round in 0..50u64 {
            for (store, id) in [(east.clone(), "e"), (west.clone(), "w")] {
                writers.spawn(async move {
                    let mut b = bundle(id, 9_000);
                    b.request_sequence = round;
                    store.save(&[b]).await
                });
            }
        }
        while let Some(result) = writers.join_next().await {
            result.unwrap().unwrap();
        }

        let east_loaded = east.load().await.unwrap();
        let west_loaded = west.load().await.unwrap();
        assert_eq!(east_loaded.len(), 1);
        assert_eq!(east_loaded[0].id, "e");
        assert_eq!(west_loaded.len(), 1);
        assert_eq!(west_loaded[0].id, "w");

        let mut leftovers = tokio::fs::read_dir(dir.path()).await.unwrap();
        while let Some(entry) = leftovers.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().into_owned();
            assert!(!name.contains(".tmp."), "stray temp file {name}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn state_file_permissions_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.json");
        BundleStore::new(&path)
            .save(&[bundle("a", 5_000)])
            .await
            .unwrap();

        let mode = tokio::fs::metadata(&path).await.unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "pool state must be 0600, got {mode:o}");
    }
}
