use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use tracing::{debug, info, warn};

use homeloc_common::{places, GeocodeResult, SelfReportedLocation, User};

use crate::geocode_cache::{GeocodeCache, GeocodeResolver};
use crate::store::JsonMapStore;

#[derive(Debug, Default, Clone)]
pub struct SelfReportStats {
    pub users: usize,
    pub already_accepted: usize,
    pub accepted: usize,
    pub vague: usize,
    pub empty: usize,
    pub failed: usize,
}

impl fmt::Display for SelfReportStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Self-Reported Locations ===")?;
        writeln!(f, "Users:            {}", self.users)?;
        writeln!(f, "Already accepted: {}", self.already_accepted)?;
        writeln!(f, "Accepted:         {}", self.accepted)?;
        writeln!(f, "Vague:            {}", self.vague)?;
        writeln!(f, "Empty:            {}", self.empty)?;
        write!(f, "Geocode failed:   {}", self.failed)
    }
}

/// Users whose self-report was not accepted, keyed by id.
#[derive(Debug, Default)]
pub struct SelfReportOutcome {
    pub needs_evidence: BTreeMap<String, User>,
    pub stats: SelfReportStats,
}

/// Geocode each user's self-reported location and accept the specific ones.
///
/// Users already in `store` are skipped. A geocode failure routes the user
/// to `needs_evidence` for this run without recording anything, so a later
/// run retries the lookup. The store and the cache each checkpoint every
/// `checkpoint_every` new entries.
pub async fn classify_self_reports<'u>(
    users: impl IntoIterator<Item = &'u User>,
    store: &mut JsonMapStore<SelfReportedLocation>,
    cache: &mut GeocodeCache,
    resolver: &GeocodeResolver<'_>,
    checkpoint_every: usize,
) -> Result<SelfReportOutcome> {
    let checkpoint_every = checkpoint_every.max(1);
    let mut out = SelfReportOutcome::default();
    let mut unsaved = 0usize;

    for user in users {
        out.stats.users += 1;
        if store.contains(&user.id) {
            out.stats.already_accepted += 1;
            continue;
        }

        let Some(raw) = user.self_location() else {
            out.stats.empty += 1;
            out.needs_evidence.insert(user.id.clone(), user.clone());
            continue;
        };

        let parsed = match resolver.resolve(cache, raw).await {
            Ok(result) => {
                if cache.unsaved() >= checkpoint_every {
                    cache.persist()?;
                }
                result
            }
            Err(e) => {
                warn!(user_id = user.id.as_str(), raw, error = %e, "Self-report geocoding failed");
                out.stats.failed += 1;
                out.needs_evidence.insert(user.id.clone(), user.clone());
                continue;
            }
        };

        let place = match parsed {
            GeocodeResult::Place(place) if !places::is_vague_location(&place) => place,
            _ => {
                out.stats.vague += 1;
                out.needs_evidence.insert(user.id.clone(), user.clone());
                continue;
            }
        };

        debug!(user_id = user.id.as_str(), raw, place = place.as_str(), "Self-report accepted");
        store.insert(
            user.id.clone(),
            SelfReportedLocation {
                username: user.username.clone(),
                parsed_location: place,
                raw_location: raw.to_string(),
            },
        );
        out.stats.accepted += 1;
        unsaved += 1;
        if unsaved >= checkpoint_every {
            store.persist()?;
            cache.persist()?;
            unsaved = 0;
        }
    }

    store.persist()?;
    if cache.unsaved() > 0 {
        cache.persist()?;
    }
    info!(
        accepted = out.stats.accepted,
        needs_evidence = out.needs_evidence.len(),
        "Self-reported locations classified"
    );
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use gmaps_geocoder::GeocodeError;

    use crate::retry::RetryPolicy;
    use crate::testing::MockGeocoder;
    use crate::traits::Geocoder;

    fn located(id: &str, username: &str, raw: Option<&str>) -> User {
        User {
            id: id.into(),
            username: username.into(),
            raw_location: raw.map(str::to_string),
            followers_count: 0,
            following_count: 0,
        }
    }

    fn geocoder() -> MockGeocoder {
        MockGeocoder::new()
            .on("Michigan", "Michigan")
            .on("USA", "United States")
            .on("kzoo", "Kalamazoo, MI")
            .on("Mars", "non-location")
    }

    #[tokio::test]
    async fn vague_results_need_more_evidence() {
        let dir = tempfile::tempdir().unwrap();
        let geocoder = geocoder();
        let resolver = GeocodeResolver::new(&geocoder, RetryPolicy::none(), 50);
        let mut cache = GeocodeCache::load(dir.path(), dir.path().join("c.json")).unwrap();
        let mut store = JsonMapStore::load(dir.path().join("self.json")).unwrap();

        let users = vec![
            located("1", "a", Some("Michigan")),
            located("2", "b", Some("USA")),
            located("3", "c", Some("kzoo")),
            located("4", "d", Some("Mars")),
            located("5", "e", Some("  ")),
            located("6", "f", None),
        ];
        let out = classify_self_reports(&users, &mut store, &mut cache, &resolver, 10)
            .await
            .unwrap();

        assert_eq!(out.stats.accepted, 1);
        assert_eq!(out.stats.vague, 3);
        assert_eq!(out.stats.empty, 2);
        assert_eq!(out.needs_evidence.keys().collect::<Vec<_>>(), vec!["1", "2", "4", "5", "6"]);
        let accepted = store.get("3").unwrap();
        assert_eq!(accepted.parsed_location, "Kalamazoo, MI");
        assert_eq!(accepted.raw_location, "kzoo");
    }

    #[tokio::test]
    async fn rerun_skips_accepted_users() {
        let dir = tempfile::tempdir().unwrap();
        let geocoder = geocoder();
        let resolver = GeocodeResolver::new(&geocoder, RetryPolicy::none(), 50);
        let users = vec![located("3", "c", Some("kzoo")), located("1", "a", Some("Michigan"))];

        {
            let mut cache = GeocodeCache::load(dir.path(), dir.path().join("geocode_cache_t.json")).unwrap();
            let mut store = JsonMapStore::load(dir.path().join("self.json")).unwrap();
            classify_self_reports(&users, &mut store, &mut cache, &resolver, 1)
                .await
                .unwrap();
        }
        assert_eq!(geocoder.call_count(), 2);

        let mut cache = GeocodeCache::load(dir.path(), dir.path().join("geocode_cache_t.json")).unwrap();
        let mut store = JsonMapStore::load(dir.path().join("self.json")).unwrap();
        let out = classify_self_reports(&users, &mut store, &mut cache, &resolver, 1)
            .await
            .unwrap();

        assert_eq!(out.stats.already_accepted, 1);
        assert_eq!(out.stats.vague, 1);
        assert_eq!(geocoder.call_count(), 2);
    }

    #[tokio::test]
    async fn failed_lookups_are_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let geocoder = MockGeocoder::new().failing("Gotham");
        let resolver = GeocodeResolver::new(&geocoder, RetryPolicy::none(), 50);
        let mut cache = GeocodeCache::load(dir.path(), dir.path().join("c.json")).unwrap();
        let mut store = JsonMapStore::load(dir.path().join("self.json")).unwrap();

        let users = vec![located("9", "bat", Some("Gotham"))];
        let out = classify_self_reports(&users, &mut store, &mut cache, &resolver, 10)
            .await
            .unwrap();

        assert_eq!(out.stats.failed, 1);
        assert!(out.needs_evidence.contains_key("9"));
        assert!(store.is_empty());
        assert!(!cache.contains("Gotham"));
    }

    /// Answers non-location and notes whether the cache file existed at each call.
    struct CacheFileWatcher {
        path: PathBuf,
        seen: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl Geocoder for CacheFileWatcher {
        async fn geocode(&self, _text: &str) -> Result<GeocodeResult, GeocodeError> {
            self.seen.lock().unwrap().push(self.path.exists());
            Ok(GeocodeResult::NonLocation)
        }
    }

    #[tokio::test]
    async fn cache_checkpoints_without_accepted_users() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("geocode_cache_t.json");
        let watcher = CacheFileWatcher {
            path: cache_path.clone(),
            seen: Mutex::new(Vec::new()),
        };
        let resolver = GeocodeResolver::new(&watcher, RetryPolicy::none(), 50);
        let mut cache = GeocodeCache::load(dir.path(), cache_path).unwrap();
        let mut store = JsonMapStore::load(dir.path().join("self.json")).unwrap();

        let users = vec![
            located("1", "a", Some("Mars")),
            located("2", "b", Some("Venus")),
            located("3", "c", Some("Pluto")),
        ];
        let out = classify_self_reports(&users, &mut store, &mut cache, &resolver, 2)
            .await
            .unwrap();

        assert_eq!(out.stats.vague, 3);
        assert_eq!(*watcher.seen.lock().unwrap(), vec![false, false, true]);
    }
}
