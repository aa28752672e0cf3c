//! Bundle selection, health tracking, and coalesced repair
//!
//! All bundle mutation happens under one `tokio::sync::Mutex` so failure
//! counters, eviction, and sequence numbers never race. Repair is guarded
//! separately: an `AtomicBool` marks a mint in flight and the cooldown clock
//! is measured from the start of the previous repair, so any number of
//! concurrent `ensure_capacity` callers produce at most one mint.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use companion_auth::{BundleStore, CredentialBundle, PersonaContext, SessionMinter, now_millis};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Usable bundles below this count trigger a repair
    pub min_pool_size: usize,
    /// Minimum gap between the starts of two repair mints
    pub refresh_cooldown: Duration,
    /// Consecutive failures after which a bundle is dead
    pub failure_threshold: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_pool_size: 2,
            refresh_cooldown: Duration::from_secs(10),
            failure_threshold: 3,
        }
    }
}

/// Failure reported against a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Server refused the ticket. The bundle is dead immediately.
    AuthRejected,
    /// Unclassifiable response while using the bundle.
    Fatal,
}

impl FailureKind {
    pub fn label(&self) -> &'static str {
        match self {
            FailureKind::AuthRejected => "auth_rejected",
            FailureKind::Fatal => "fatal",
        }
    }
}

/// What `ensure_capacity` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairTrigger {
    /// Enough usable bundles
    NotNeeded,
    /// This call started a repair mint
    Started,
    /// Another caller's repair is still running
    InFlight,
    /// Last repair started too recently
    CoolingDown { remaining: Duration },
}

/// Pool of minted credential bundles, shared via `Arc`.
pub struct CredentialPool {
    bundles: Mutex<Vec<CredentialBundle>>,
    settings: PoolSettings,
    minter: Arc<dyn SessionMinter>,
    persona: PersonaContext,
    store: Option<BundleStore>,
    repairing: AtomicBool,
    last_repair_start: std::sync::Mutex<Option<Instant>>,
}

impl CredentialPool {
    /// Create an empty in-memory pool.
    pub fn new(
        settings: PoolSettings,
        minter: Arc<dyn SessionMinter>,
        persona: PersonaContext,
    ) -> Self {
        info!(
            minter = minter.id(),
            min_pool_size = settings.min_pool_size,
            failure_threshold = settings.failure_threshold,
            "credential pool initialized"
        );
        Self {
            bundles: Mutex::new(Vec::new()),
            settings,
            minter,
            persona,
            store: None,
            repairing: AtomicBool::new(false),
            last_repair_start: std::sync::Mutex::new(None),
        }
    }

    /// Create a pool backed by `store`, restoring persisted bundles.
    ///
    /// Restored bundles keep their failure counters and sequence numbers.
    /// Dead or expired ones are evicted right away.
    pub async fn open(
        settings: PoolSettings,
        minter: Arc<dyn SessionMinter>,
        persona: PersonaContext,
        store: BundleStore,
    ) -> Result<Self> {
        let restored = store.load().await?;
        let mut pool = Self::new(settings, minter, persona);
        pool.store = Some(store);
        {
            let mut bundles = pool.bundles.lock().await;
            *bundles = restored;
            let evicted = pool.evict_locked(&mut bundles, now_millis());
            if evicted > 0 {
                pool.persist(&bundles).await;
            }
            info!(bundles = bundles.len(), evicted, "credential pool restored");
        }
        Ok(pool)
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Select the healthiest usable bundle and mark it used.
    ///
    /// Order: fewest consecutive failures, then most recent success, then
    /// arrival order. Returns a clone; report outcomes by id.
    pub async fn acquire(&self) -> Result<CredentialBundle> {
        let now = now_millis();
        let mut bundles = self.bundles.lock().await;
        let evicted = self.evict_locked(&mut bundles, now);

        let chosen = bundles
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.consecutive_failures
                    .cmp(&b.consecutive_failures)
                    .then_with(|| b.last_success_at.cmp(&a.last_success_at))
            })
            .map(|(idx, _)| idx);

        let Some(idx) = chosen else {
            if evicted > 0 {
                self.persist(&bundles).await;
            }
            return Err(Error::PoolExhausted(exhausted_message(&bundles, evicted)));
        };

        let bundle = &mut bundles[idx];
        bundle.last_used_at = Some(now);
        let selected = bundle.clone();
        debug!(
            bundle_id = %selected.id,
            fingerprint = %selected.fingerprint(),
            failures = selected.consecutive_failures,
            "bundle acquired"
        );
        if evicted > 0 {
            self.persist(&bundles).await;
        }
        Ok(selected)
    }

    /// Reset the failure counter and stamp the success time.
    pub async fn report_success(&self, bundle_id: &str) -> Result<()> {
        let mut bundles = self.bundles.lock().await;
        let bundle = find_mut(&mut bundles, bundle_id)?;
        bundle.consecutive_failures = 0;
        bundle.last_success_at = Some(now_millis());
        self.persist(&bundles).await;
        Ok(())
    }

    /// Count a failure against a bundle; auth rejections kill it outright.
    pub async fn report_failure(&self, bundle_id: &str, kind: FailureKind) -> Result<()> {
        let mut bundles = self.bundles.lock().await;
        let bundle = find_mut(&mut bundles, bundle_id)?;
        bundle.consecutive_failures = bundle.consecutive_failures.saturating_add(1);
        if kind == FailureKind::AuthRejected {
            bundle.rejected = true;
        }
        warn!(
            bundle_id,
            kind = kind.label(),
            failures = bundle.consecutive_failures,
            "bundle failure reported"
        );
        self.evict_locked(&mut bundles, now_millis());
        self.persist(&bundles).await;
        Ok(())
    }

    /// Issue the next request sequence number for a bundle.
    ///
    /// Strictly increasing per bundle and persisted before it is returned, so
    /// a restart never reissues a number. If the save fails the increment is
    /// undone and the store error is returned instead.
    pub async fn next_sequence(&self, bundle_id: &str) -> Result<u64> {
        let mut bundles = self.bundles.lock().await;
        let bundle = find_mut(&mut bundles, bundle_id)?;
        let previous = bundle.request_sequence;
        let sequence = previous.saturating_add(1);
        bundle.request_sequence = sequence;

        if let Err(e) = self.try_persist(&bundles).await {
            find_mut(&mut bundles, bundle_id)?.request_sequence = previous;
            error!(bundle_id, error = %e, "sequence not persisted, withholding it");
            return Err(e);
        }
        Ok(sequence)
    }

    /// Append a bundle in arrival order.
    pub async fn insert(&self, bundle: CredentialBundle) -> Result<()> {
        bundle
            .validate()
            .map_err(|e| Error::Invalid(e.to_string()))?;
        let mut bundles = self.bundles.lock().await;
        if bundles.iter().any(|b| b.id == bundle.id) {
            return Err(Error::Duplicate(bundle.id));
        }
        info!(
            bundle_id = %bundle.id,
            fingerprint = %bundle.fingerprint(),
            "bundle added to pool"
        );
        bundles.push(bundle);
        self.persist(&bundles).await;
        Ok(())
    }

    /// Drop dead and expired bundles now. Returns how many were removed.
    pub async fn evict(&self) -> usize {
        let mut bundles = self.bundles.lock().await;
        let evicted = self.evict_locked(&mut bundles, now_millis());
        if evicted > 0 {
            self.persist(&bundles).await;
        }
        evicted
    }

    /// Start a repair mint if usable bundles are below `min_pool_size`.
    ///
    /// Never blocks on the mint: it runs on a spawned task. Concurrent callers
    /// coalesce onto the in-flight repair, and a new repair is refused until
    /// `refresh_cooldown` has elapsed since the previous one started.
    pub async fn ensure_capacity(self: &Arc<Self>) -> RepairTrigger {
        let usable = self.healthy_count().await;
        if usable >= self.settings.min_pool_size {
            return RepairTrigger::NotNeeded;
        }

        if self
            .repairing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(usable, "repair already in flight");
            return RepairTrigger::InFlight;
        }

        if let Some(remaining) = self.claim_repair_slot() {
            self.repairing.store(false, Ordering::Release);
            debug!(usable, remaining_ms = remaining.as_millis() as u64, "repair cooling down");
            return RepairTrigger::CoolingDown { remaining };
        }

        info!(
            usable,
            min_pool_size = self.settings.min_pool_size,
            "pool below minimum, starting repair"
        );
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = pool.mint_and_insert().await {
                error!(error = %e, "repair mint failed");
            }
            pool.repairing.store(false, Ordering::Release);
        });
        RepairTrigger::Started
    }

    /// Mint one bundle inline, bypassing coalescing. Used for start-up
    /// warm-up. Still stamps the cooldown clock.
    pub async fn repair_now(&self) -> Result<String> {
        if let Ok(mut last) = self.last_repair_start.lock() {
            *last = Some(Instant::now());
        }
        self.mint_and_insert().await
    }

    /// Whether a spawned repair is still running.
    pub fn repair_in_flight(&self) -> bool {
        self.repairing.load(Ordering::Acquire)
    }

    /// Number of bundles held, including ones not yet evicted.
    pub async fn len(&self) -> usize {
        self.bundles.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Bundles that are neither dead nor expired.
    pub async fn healthy_count(&self) -> usize {
        let now = now_millis();
        let threshold = self.settings.failure_threshold;
        let count = self
            .bundles
            .lock()
            .await
            .iter()
            .filter(|b| b.is_usable(now, threshold))
            .count();
        metrics::gauge!("credential_pool_healthy").set(count as f64);
        count
    }

    /// Clone of every bundle in arrival order.
    pub async fn snapshot(&self) -> Vec<CredentialBundle> {
        self.bundles.lock().await.clone()
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: usable ≥ min_pool_size → healthy, some usable →
    /// degraded, none usable → unhealthy. Tickets are shown by fingerprint.
    pub async fn health(&self) -> serde_json::Value {
        let now = now_millis();
        let threshold = self.settings.failure_threshold;
        let bundles = self.bundles.lock().await;

        let mut usable = 0usize;
        let mut entries = Vec::with_capacity(bundles.len());
        for bundle in bundles.iter() {
            let status = if bundle.is_dead(threshold) {
                "dead"
            } else if bundle.is_expired(now) {
                "expired"
            } else {
                usable += 1;
                "usable"
            };
            entries.push(serde_json::json!({
                "id": bundle.id,
                "fingerprint": bundle.fingerprint(),
                "status": status,
                "consecutive_failures": bundle.consecutive_failures,
                "expires_in_secs": bundle.remaining_ms(now) / 1000,
                "last_success_at": bundle.last_success_at,
                "request_sequence": bundle.request_sequence,
            }));
        }

        let pool_status = if usable >= self.settings.min_pool_size && usable > 0 {
            "healthy"
        } else if usable > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": pool_status,
            "bundles_total": bundles.len(),
            "bundles_usable": usable,
            "min_pool_size": self.settings.min_pool_size,
            "repair_in_flight": self.repair_in_flight(),
            "bundles": entries,
        })
    }

    /// Stamp the repair clock, or return the time left in the cooldown.
    fn claim_repair_slot(&self) -> Option<Duration> {
        let now = Instant::now();
        let Ok(mut last) = self.last_repair_start.lock() else {
            return None;
        };
        if let Some(started) = *last {
            let elapsed = now.saturating_duration_since(started);
            if elapsed < self.settings.refresh_cooldown {
                return Some(self.settings.refresh_cooldown - elapsed);
            }
        }
        *last = Some(now);
        None
    }

    async fn mint_and_insert(&self) -> Result<String> {
        match self.minter.mint(&self.persona).await {
            Ok(bundle) => {
                metrics::counter!("credential_pool_mints_total", "result" => "ok").increment(1);
                let id = bundle.id.clone();
                self.insert(bundle).await?;
                self.healthy_count().await;
                Ok(id)
            }
            Err(e) => {
                metrics::counter!("credential_pool_mints_total", "result" => "error").increment(1);
                Err(Error::MintFailed(e.to_string()))
            }
        }
    }

    fn evict_locked(&self, bundles: &mut Vec<CredentialBundle>, now: u64) -> usize {
        let threshold = self.settings.failure_threshold;
        let before = bundles.len();
        bundles.retain(|b| {
            if b.is_usable(now, threshold) {
                return true;
            }
            let reason = if b.is_dead(threshold) { "dead" } else { "expired" };
            info!(
                bundle_id = %b.id,
                fingerprint = %b.fingerprint(),
                reason,
                failures = b.consecutive_failures,
                "bundle evicted"
            );
            false
        });
        let evicted = before - bundles.len();
        if evicted > 0 {
            metrics::counter!("credential_pool_evictions_total").increment(evicted as u64);
            metrics::gauge!("credential_pool_healthy").set(bundles.len() as f64);
        }
        evicted
    }

    /// Best-effort save for state that is safe to lose on a crash.
    async fn persist(&self, bundles: &[CredentialBundle]) {
        if let Err(e) = self.try_persist(bundles).await {
            warn!(error = %e, "failed to persist pool state");
        }
    }

    async fn try_persist(&self, bundles: &[CredentialBundle]) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.save(bundles).await.map_err(|e| {
            Error::Store(format!("{}: {e}", store.path().display()))
        })
    }
}

fn find_mut<'a>(
    bundles: &'a mut [CredentialBundle],
    bundle_id: &str,
) -> Result<&'a mut CredentialBundle> {
    bundles
        .iter_mut()
        .find(|b| b.id == bundle_id)
        .ok_or_else(|| Error::NotFound(bundle_id.to_string()))
}

/// Build the exhausted error message JSON.
fn exhausted_message(bundles: &[CredentialBundle], evicted: usize) -> String {
    serde_json::json!({
        "error": {
            "type": "pool_exhausted",
            "message": "No usable credential bundles",
            "pool": {
                "bundles_total": bundles.len(),
                "bundles_usable": 0,
                "evicted_now": evicted,
            }
        }
    })
    .to_string()
}
