//! Cache & Quota Store — last-known-good snapshots with trust tiers and
//! daily call quotas.
//!
//! Guarantees that every configured provider always yields *some*
//! snapshot: fresh cache, aged cache with a downgraded tier, or the
//! provider's static defaults. The SQLite connection is shared behind a
//! `Mutex` and locked only for the brief synchronous calls that need
//! it, never held across `.await` points.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::clock;
use crate::provider::{Metric, ProviderId, Reading, SourceSnapshot, TrustTier};
use crate::store::{Result, Store, StoreError};

/// Hours of defaulted readings synthesized when no cache exists.
const DEFAULT_HORIZON_HOURS: i64 = 24;

/// Per-provider cache/quota profile, derived from deployment config.
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub id: ProviderId,
    /// Daily call cap; `None` means the provider is not rate limited.
    pub daily_quota: Option<u32>,
    /// Static fallback value per metric, used when no usable cache
    /// exists. Providers with an empty map default to an empty snapshot.
    pub defaults: BTreeMap<Metric, f64>,
}

/// Cache and quota store over the shared SQLite connection.
pub struct CacheStore {
    store: Arc<Mutex<Store>>,
    profiles: HashMap<ProviderId, ProviderProfile>,
    utc_offset_minutes: i32,
}

impl CacheStore {
    pub fn new(
        store: Arc<Mutex<Store>>,
        profiles: impl IntoIterator<Item = ProviderProfile>,
        utc_offset_minutes: i32,
    ) -> Self {
        Self {
            store,
            profiles: profiles.into_iter().map(|p| (p.id.clone(), p)).collect(),
            utc_offset_minutes,
        }
    }

    /// The provider ids this store is configured for.
    pub fn providers(&self) -> impl Iterator<Item = &ProviderId> {
        self.profiles.keys()
    }

    fn profile(&self, provider: &str) -> Result<&ProviderProfile> {
        self.profiles
            .get(provider)
            .ok_or_else(|| StoreError::UnknownProvider(provider.to_string()))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.store
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    /// Overwrite the provider's cache entry. Success-only: callers
    /// invoke this exclusively after a successful fetch, so an entry is
    /// never cleared, only superseded.
    pub fn put(&self, provider: &str, snapshot: &SourceSnapshot) -> Result<()> {
        self.profile(provider)?;
        self.lock()?
            .save_lkg(provider, snapshot.fetched_at, snapshot)?;
        log::debug!("[CacheStore] LKG saved for {}", provider);
        Ok(())
    }

    /// Read the provider's snapshot with its computed trust tier.
    ///
    /// No side effects. Entries older than 24 h are past their useful
    /// life; like a missing entry, they resolve to the provider's
    /// static defaults tagged DEFAULT.
    pub fn get(&self, provider: &str, now: i64) -> Result<(SourceSnapshot, TrustTier)> {
        let profile = self.profile(provider)?;
        let entry = self.lock()?.load_lkg(provider)?;

        if let Some((fetched_at, mut snapshot)) = entry {
            let tier = TrustTier::from_age_secs(now - fetched_at);
            if tier != TrustTier::Default {
                let age_h = (now - fetched_at) as f64 / 3600.0;
                match tier {
                    TrustTier::Stale => {
                        log::warn!("[CacheStore] {}: using STALE data ({:.1}h old)", provider, age_h)
                    }
                    TrustTier::Acceptable => {
                        log::info!("[CacheStore] {}: using cached data ({:.1}h old)", provider, age_h)
                    }
                    _ => {}
                }
                snapshot.trust_tier = tier;
                return Ok((snapshot, tier));
            }
        }

        log::warn!("[CacheStore] {}: no usable cache, using DEFAULT values", provider);
        Ok((default_snapshot(profile, now), TrustTier::Default))
    }

    /// Charge one call against the provider's daily quota.
    ///
    /// Returns false once the configured cap is reached for the local
    /// day; the counter resets when the local day index advances.
    /// Providers without a cap are always allowed and not counted.
    pub fn charge_quota(&self, provider: &str, now: i64) -> Result<bool> {
        let profile = self.profile(provider)?;
        let Some(cap) = profile.daily_quota else {
            return Ok(true);
        };

        let today = clock::local_day_index(now, self.utc_offset_minutes);
        let store = self.lock()?;

        let used = match store.quota_counter(provider)? {
            Some((day, used)) if day == today => used,
            Some(_) => {
                log::info!("[CacheStore] {}: new local day, quota counter reset", provider);
                0
            }
            None => 0,
        };

        if used >= cap {
            log::info!(
                "[CacheStore] {}: daily quota exhausted ({}/{} calls)",
                provider,
                used,
                cap
            );
            return Ok(false);
        }

        store.set_quota_counter(provider, today, used + 1)?;
        log::debug!("[CacheStore] {}: quota charge {}/{}", provider, used + 1, cap);
        Ok(true)
    }
}

/// Build a snapshot from the provider's static defaults: one reading
/// per configured metric for each of the next 24 hour-slots.
fn default_snapshot(profile: &ProviderProfile, now: i64) -> SourceSnapshot {
    let start = clock::hour_floor(now);
    let mut readings = Vec::with_capacity(profile.defaults.len() * DEFAULT_HORIZON_HOURS as usize);
    for h in 0..DEFAULT_HORIZON_HOURS {
        let ts = start + h * clock::HOUR_SECS;
        for (&metric, &value) in &profile.defaults {
            readings.push(Reading::new(profile.id.clone(), ts, metric, value));
        }
    }
    SourceSnapshot {
        provider: profile.id.clone(),
        readings,
        fetched_at: now,
        trust_tier: TrustTier::Default,
        is_synthesized: true,
    }
}
