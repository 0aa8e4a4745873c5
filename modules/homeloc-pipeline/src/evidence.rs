// Evidence extraction from raw post records.
//
// Each user keeps the author snapshot from the first post seen. Post-level
// signals (geo tag, mentioned/replied-to user locations, high-probability
// text places) are tallied across all of that user's posts.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Deserializer};
use tracing::info;

use homeloc_common::{LocationSignal, PipelineConfig, PipelineError, PostSignal, PostsLocation, SignalOrigin, User};

use crate::store::read_json;

// ---------------------------------------------------------------------------
// Raw post records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostRecord {
    #[serde(default)]
    pub author: Option<PostAuthor>,
    #[serde(default)]
    pub place: Option<PostPlace>,
    #[serde(default)]
    pub network_locations: Option<NetworkLocations>,
    #[serde(default)]
    pub location_signals: Option<LocationSignals>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostAuthor {
    #[serde(default, deserialize_with = "id_string")]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub public_metrics: Option<PublicMetrics>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublicMetrics {
    #[serde(default)]
    pub followers_count: Option<u64>,
    #[serde(default)]
    pub following_count: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostPlace {
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkLocations {
    #[serde(default)]
    pub mentioned_users_locations: Vec<MentionedUserLocation>,
    #[serde(default)]
    pub replied_to_user_location: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MentionedUserLocation {
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocationSignals {
    #[serde(default)]
    pub text_annotated_places: Vec<TextAnnotatedPlace>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextAnnotatedPlace {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub probability: f64,
}

/// Author ids arrive as strings in most exports and as numbers in some.
fn id_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<String>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(d)?;
    Ok(match value {
        Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Load a cohort's posts file. A missing file is fatal for the cohort.
pub fn load_posts(path: &Path) -> Result<Vec<PostRecord>> {
    read_json(path)?.ok_or_else(|| PipelineError::MissingInput(path.to_path_buf()).into())
}

// ---------------------------------------------------------------------------
// Tally
// ---------------------------------------------------------------------------

/// Occurrence counts that remember first-seen order, so ties resolve to the
/// value encountered first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tally {
    counts: Vec<(String, u32)>,
}

impl Tally {
    pub fn add(&mut self, value: &str) {
        match self.counts.iter_mut().find(|(v, _)| v == value) {
            Some((_, n)) => *n += 1,
            None => self.counts.push((value.to_string(), 1)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Distinct values seen.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Sum of all counts.
    pub fn total(&self) -> u32 {
        self.counts.iter().map(|(_, n)| n).sum()
    }

    /// Values with their counts, in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.counts.iter().map(|(v, n)| (v.as_str(), *n))
    }

    /// Highest count; earliest value on ties.
    pub fn top(&self) -> Option<(&str, u32)> {
        let mut best: Option<(&str, u32)> = None;
        for (value, n) in &self.counts {
            let better = match best {
                Some((_, b)) => *n > b,
                None => true,
            };
            if better {
                best = Some((value.as_str(), *n));
            }
        }
        best
    }

    pub fn signals(&self, origin: SignalOrigin) -> Vec<LocationSignal> {
        self.counts
            .iter()
            .map(|(value, n)| LocationSignal {
                origin,
                value: value.clone(),
                strength: *n,
            })
            .collect()
    }
}

impl<'a> FromIterator<&'a str> for Tally {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut tally = Tally::default();
        for v in iter {
            tally.add(v);
        }
        tally
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UserEvidence {
    pub user: User,
    pub geo_tagged: Tally,
    pub network: Tally,
    pub text_annotated: Tally,
}

impl UserEvidence {
    fn new(user: User) -> Self {
        Self {
            user,
            geo_tagged: Tally::default(),
            network: Tally::default(),
            text_annotated: Tally::default(),
        }
    }

    /// All aggregated post-level signals for this user.
    pub fn signals(&self) -> Vec<LocationSignal> {
        let mut out = self.geo_tagged.signals(SignalOrigin::GeoTagged);
        out.extend(self.network.signals(SignalOrigin::NetworkMention));
        out.extend(self.text_annotated.signals(SignalOrigin::TextAnnotated));
        out
    }
}

/// Per-user evidence in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    users: Vec<UserEvidence>,
    index: HashMap<String, usize>,
}

impl Evidence {
    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn get(&self, user_id: &str) -> Option<&UserEvidence> {
        self.index.get(user_id).map(|&i| &self.users[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserEvidence> {
        self.users.iter()
    }

    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.iter().map(|e| &e.user)
    }
}

/// Fold posts into per-user evidence. Posts without an author id are skipped.
pub fn extract_evidence(posts: &[PostRecord], min_text_probability: f64) -> Evidence {
    let mut evidence = Evidence::default();

    for post in posts {
        let Some(author) = &post.author else { continue };
        let Some(id) = author.id.as_deref() else { continue };

        let slot = match evidence.index.get(id) {
            Some(&i) => i,
            None => {
                let metrics = author.public_metrics.clone().unwrap_or_default();
                let user = User {
                    id: id.to_string(),
                    username: author.username.clone().unwrap_or_default(),
                    raw_location: author.location.clone(),
                    followers_count: metrics.followers_count.unwrap_or(0),
                    following_count: metrics.following_count.unwrap_or(0),
                };
                evidence.users.push(UserEvidence::new(user));
                evidence.index.insert(id.to_string(), evidence.users.len() - 1);
                evidence.users.len() - 1
            }
        };
        let entry = &mut evidence.users[slot];

        if let Some(name) = post.place.as_ref().and_then(|p| non_empty(&p.full_name)) {
            entry.geo_tagged.add(name);
        }

        if let Some(network) = &post.network_locations {
            for mention in &network.mentioned_users_locations {
                if let Some(loc) = non_empty(&mention.location) {
                    entry.network.add(loc);
                }
            }
            if let Some(loc) = non_empty(&network.replied_to_user_location) {
                entry.network.add(loc);
            }
        }

        if let Some(signals) = &post.location_signals {
            for place in &signals.text_annotated_places {
                if place.probability <= min_text_probability {
                    continue;
                }
                if let Some(text) = non_empty(&place.text) {
                    entry.text_annotated.add(text);
                }
            }
        }
    }

    evidence
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalThresholds {
    pub network_min_count: u32,
    pub text_min_count: u32,
    pub text_min_probability: f64,
}

impl From<&PipelineConfig> for SignalThresholds {
    fn from(c: &PipelineConfig) -> Self {
        Self {
            network_min_count: c.network_min_count,
            text_min_count: c.text_min_count,
            text_min_probability: c.text_min_probability,
        }
    }
}

impl Default for SignalThresholds {
    fn default() -> Self {
        (&PipelineConfig::default()).into()
    }
}

/// Pick one location from post signals.
///
/// Any geo tag wins. Otherwise network mentions win when the top value was
/// seen at least `network_min_count` times; text places are the fallback and
/// need `text_min_count` occurrences.
pub fn resolve_post_location(
    evidence: &UserEvidence,
    thresholds: &SignalThresholds,
) -> Option<(String, PostSignal)> {
    if let Some((place, _)) = evidence.geo_tagged.top() {
        return Some((place.to_string(), PostSignal::GeoTagged));
    }

    if let Some((loc, n)) = evidence.network.top() {
        if n >= thresholds.network_min_count {
            return Some((loc.to_string(), PostSignal::Network));
        }
    }

    match evidence.text_annotated.top() {
        Some((text, n)) if n >= thresholds.text_min_count => {
            Some((text.to_string(), PostSignal::TextMention))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Posts stage
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct PostsStats {
    pub candidates: usize,
    pub geo_tagged: usize,
    pub network: usize,
    pub text_mention: usize,
    pub unlocated: usize,
}

impl fmt::Display for PostsStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Posts Location ===")?;
        writeln!(f, "Users without self-report: {}", self.candidates)?;
        writeln!(f, "Geo-tagged:                {}", self.geo_tagged)?;
        writeln!(f, "Network mentions:          {}", self.network)?;
        writeln!(f, "Text mentions:             {}", self.text_mention)?;
        write!(f, "No usable post signal:     {}", self.unlocated)
    }
}

#[derive(Debug, Default)]
pub struct PostsOutcome {
    pub located: BTreeMap<String, PostsLocation>,
    pub unlocated: BTreeMap<String, User>,
    pub stats: PostsStats,
}

/// Resolve post-derived locations for every user not already placed by a
/// self-report.
pub fn locate_from_posts(
    evidence: &Evidence,
    self_reported: &BTreeSet<String>,
    thresholds: &SignalThresholds,
) -> PostsOutcome {
    let mut out = PostsOutcome::default();

    for ev in evidence.iter() {
        if self_reported.contains(&ev.user.id) {
            continue;
        }
        out.stats.candidates += 1;

        match resolve_post_location(ev, thresholds) {
            Some((location, signal)) => {
                match signal {
                    PostSignal::GeoTagged => out.stats.geo_tagged += 1,
                    PostSignal::Network => out.stats.network += 1,
                    PostSignal::TextMention => out.stats.text_mention += 1,
                }
                out.located.insert(
                    ev.user.id.clone(),
                    PostsLocation {
                        username: ev.user.username.clone(),
                        location,
                        raw_location: ev.user.raw_location.clone(),
                        source: signal,
                        confidence: signal.confidence(),
                        followers_count: ev.user.followers_count,
                        following_count: ev.user.following_count,
                    },
                );
            }
            None => {
                out.stats.unlocated += 1;
                out.unlocated.insert(ev.user.id.clone(), ev.user.clone());
            }
        }
    }

    info!(
        located = out.located.len(),
        unlocated = out.unlocated.len(),
        "Post signals resolved"
    );
    out
}
