// Persistent geocode cache and batch resolution.
//
// The cache loads every `geocode_cache*.json` in the state directory and
// writes back to the cohort's own file. Entries are immutable once written:
// a string always maps to the same result for the rest of the run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use gmaps_geocoder::GeocodeError;
use homeloc_common::GeocodeResult;
use twitterapi_client::GraphUser;

use crate::retry::{RetryAction, RetryPolicy};
use crate::store::{read_json, write_json_atomic, OrderedMap};
use crate::traits::Geocoder;

const LEGACY_CACHE_FILE: &str = "geocode_cache.json";
const CACHE_PREFIX: &str = "geocode_cache_";

/// Cache keys ignore surrounding whitespace.
pub fn cache_key(text: &str) -> &str {
    text.trim()
}

// ---------------------------------------------------------------------------
// GeocodeCache
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct GeocodeCache {
    path: PathBuf,
    entries: BTreeMap<String, GeocodeResult>,
    unsaved: usize,
}

impl GeocodeCache {
    /// Merge every cache file in `dir`; persist to `path`.
    ///
    /// Files are read in name order after the legacy file; the first value
    /// seen for a key wins.
    pub fn load(dir: &Path, path: impl Into<PathBuf>) -> Result<Self> {
        let mut files = Vec::new();
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry.with_context(|| format!("Failed to list {}", dir.display()))?;
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if name.starts_with(CACHE_PREFIX) && name.ends_with(".json") {
                        files.push(entry.path());
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Failed to list {}", dir.display())),
        }
        files.sort();
        files.insert(0, dir.join(LEGACY_CACHE_FILE));

        let mut entries = BTreeMap::new();
        let mut loaded_files = 0;
        for file in &files {
            match read_json::<BTreeMap<String, GeocodeResult>>(file) {
                Ok(Some(data)) => {
                    loaded_files += 1;
                    for (k, v) in data {
                        entries.entry(cache_key(&k).to_string()).or_insert(v);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(file = %file.display(), error = %e, "Skipping unreadable cache file"),
            }
        }
        info!(entries = entries.len(), files = loaded_files, "Geocode cache loaded");

        Ok(Self {
            path: path.into(),
            entries,
            unsaved: 0,
        })
    }

    pub fn get(&self, text: &str) -> Option<&GeocodeResult> {
        self.entries.get(cache_key(text))
    }

    pub fn contains(&self, text: &str) -> bool {
        self.entries.contains_key(cache_key(text))
    }

    /// Store a result unless the key is already cached. Returns whether it was stored.
    pub fn insert(&mut self, text: &str, result: GeocodeResult) -> bool {
        let key = cache_key(text);
        if key.is_empty() || self.entries.contains_key(key) {
            return false;
        }
        self.entries.insert(key.to_string(), result);
        self.unsaved += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries added since the last persist.
    pub fn unsaved(&self) -> usize {
        self.unsaved
    }

    pub fn persist(&mut self) -> Result<()> {
        write_json_atomic(&self.path, &self.entries)?;
        self.unsaved = 0;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct GeocodeStats {
    pub distinct: usize,
    pub cached: usize,
    pub geocoded: usize,
    pub failed: usize,
    pub users_written: usize,
    pub users_deferred: usize,
}

impl fmt::Display for GeocodeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Friend Geocoding ===")?;
        writeln!(f, "Distinct strings:  {}", self.distinct)?;
        writeln!(f, "Already cached:    {}", self.cached)?;
        writeln!(f, "Geocoded:          {}", self.geocoded)?;
        writeln!(f, "Failed:            {}", self.failed)?;
        writeln!(f, "Users written:     {}", self.users_written)?;
        write!(f, "Users deferred:    {}", self.users_deferred)
    }
}

/// Cache-first geocoding with retries around the external call.
pub struct GeocodeResolver<'a> {
    geocoder: &'a dyn Geocoder,
    retry: RetryPolicy,
    checkpoint_every: usize,
}

impl<'a> GeocodeResolver<'a> {
    pub fn new(geocoder: &'a dyn Geocoder, retry: RetryPolicy, checkpoint_every: usize) -> Self {
        Self {
            geocoder,
            retry,
            checkpoint_every: checkpoint_every.max(1),
        }
    }

    /// Resolve one string. Empty text is `NonLocation` and never reaches the
    /// geocoder; a failure is returned uncached so it is retried next run.
    pub async fn resolve(&self, cache: &mut GeocodeCache, text: &str) -> Result<GeocodeResult, GeocodeError> {
        let key = cache_key(text);
        if key.is_empty() {
            return Ok(GeocodeResult::NonLocation);
        }
        if let Some(hit) = cache.get(key) {
            return Ok(hit.clone());
        }
        let result = self.call(key).await?;
        cache.insert(key, result.clone());
        Ok(result)
    }

    /// Geocode every distinct uncached string once, checkpointing the cache
    /// every `checkpoint_every` new entries.
    pub async fn resolve_batch<'t>(
        &self,
        cache: &mut GeocodeCache,
        texts: impl IntoIterator<Item = &'t str>,
    ) -> Result<GeocodeStats> {
        let distinct: BTreeSet<&str> = texts
            .into_iter()
            .map(cache_key)
            .filter(|k| !k.is_empty())
            .collect();

        let mut stats = GeocodeStats {
            distinct: distinct.len(),
            ..Default::default()
        };
        let pending: Vec<&str> = distinct
            .into_iter()
            .filter(|k| {
                let hit = cache.contains(k);
                if hit {
                    stats.cached += 1;
                }
                !hit
            })
            .collect();
        info!(distinct = stats.distinct, cached = stats.cached, pending = pending.len(), "Batch geocoding");

        for text in pending {
            match self.call(text).await {
                Ok(result) => {
                    cache.insert(text, result);
                    stats.geocoded += 1;
                    if stats.geocoded % self.checkpoint_every == 0 {
                        cache.persist()?;
                        info!(geocoded = stats.geocoded, "Geocode cache checkpoint");
                    }
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(text, error = %e, "Geocoding failed, left uncached");
                }
            }
        }

        if cache.unsaved() > 0 {
            cache.persist()?;
        }
        Ok(stats)
    }

    async fn call(&self, text: &str) -> Result<GeocodeResult, GeocodeError> {
        let geocoder = self.geocoder;
        self.retry
            .run(
                text,
                move || async move { geocoder.geocode(text).await },
                |e: &GeocodeError| {
                    if e.is_retryable() {
                        RetryAction::Backoff
                    } else {
                        RetryAction::Fail
                    }
                },
            )
            .await
    }
}

// ---------------------------------------------------------------------------
// Friend-location stage
// ---------------------------------------------------------------------------

fn friend_location_text(profile: &GraphUser) -> &str {
    profile.location.as_deref().map(str::trim).unwrap_or("")
}

/// Geocode friend locations for `usernames` and write one friend-location
/// file per user.
///
/// All distinct strings are resolved (and cached) before any per-user file
/// is written. A user whose friends include a string that failed to geocode
/// is deferred with no file, so the next run retries it.
pub async fn geocode_friend_locations(
    usernames: &[String],
    info_dir: &Path,
    location_dir: &Path,
    cache: &mut GeocodeCache,
    resolver: &GeocodeResolver<'_>,
) -> Result<GeocodeStats> {
    let mut profiles: Vec<(&String, OrderedMap<GraphUser>)> = Vec::new();
    for username in usernames {
        if location_dir.join(format!("{username}.json")).exists() {
            continue;
        }
        let info_file = info_dir.join(format!("{username}.json"));
        if let Some(friends) = read_json::<OrderedMap<GraphUser>>(&info_file)? {
            profiles.push((username, friends));
        }
    }

    let texts = profiles
        .iter()
        .flat_map(|(_, friends)| friends.values().map(friend_location_text));
    let mut stats = resolver.resolve_batch(cache, texts).await?;

    for (username, friends) in &profiles {
        let mut locations = OrderedMap::new();
        let mut complete = true;
        for (friend, profile) in friends.iter() {
            let text = friend_location_text(profile);
            let result = if text.is_empty() {
                GeocodeResult::NonLocation
            } else {
                match cache.get(text) {
                    Some(r) => r.clone(),
                    None => {
                        complete = false;
                        break;
                    }
                }
            };
            locations.insert(friend.clone(), result);
        }

        if complete {
            write_json_atomic(&location_dir.join(format!("{username}.json")), &locations)?;
            stats.users_written += 1;
        } else {
            stats.users_deferred += 1;
        }
    }

    info!(
        written = stats.users_written,
        deferred = stats.users_deferred,
        "Friend locations applied"
    );
    Ok(stats)
}
