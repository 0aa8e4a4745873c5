use std::fmt;

use serde::{Deserialize, Serialize};

use crate::places;

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Point-in-time snapshot of an account, taken from the first post it authored.
///
/// `id` is the identity key. `username` is only a secondary lookup key and may
/// map to different ids across datasets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub raw_location: Option<String>,
    #[serde(default)]
    pub followers_count: u64,
    #[serde(default)]
    pub following_count: u64,
}

impl User {
    /// Self-reported location with surrounding whitespace removed, if non-empty.
    pub fn self_location(&self) -> Option<&str> {
        self.raw_location
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalOrigin {
    SelfReported,
    GeoTagged,
    NetworkMention,
    TextAnnotated,
    FriendNetwork,
}

/// One aggregated piece of location evidence: `value` seen `strength` times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationSignal {
    pub origin: SignalOrigin,
    pub value: String,
    pub strength: u32,
}

/// Which post-level signal class resolved a user's location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PostSignal {
    GeoTagged,
    Network,
    TextMention,
}

impl PostSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostSignal::GeoTagged => "geo-tagged",
            PostSignal::Network => "network",
            PostSignal::TextMention => "text-mention",
        }
    }

    pub fn confidence(&self) -> Confidence {
        match self {
            PostSignal::GeoTagged => Confidence::High,
            PostSignal::Network => Confidence::Medium,
            PostSignal::TextMention => Confidence::Low,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "geo-tagged" => Some(PostSignal::GeoTagged),
            "network" => Some(PostSignal::Network),
            "text-mention" => Some(PostSignal::TextMention),
            _ => None,
        }
    }
}

impl fmt::Display for PostSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Geocoding
// ---------------------------------------------------------------------------

pub const NON_LOCATION: &str = "non-location";

/// A standardized place string, or the sentinel for "could not resolve".
///
/// Persisted as a plain JSON string so cache and friend-location files stay
/// simple `string -> string` maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum GeocodeResult {
    Place(String),
    NonLocation,
}

impl GeocodeResult {
    pub fn place(&self) -> Option<&str> {
        match self {
            GeocodeResult::Place(p) => Some(p),
            GeocodeResult::NonLocation => None,
        }
    }

    /// Country-level, state-only, or unresolved. Too coarse for city analysis.
    pub fn is_vague(&self) -> bool {
        match self {
            GeocodeResult::Place(p) => places::is_vague_location(p),
            GeocodeResult::NonLocation => true,
        }
    }
}

impl From<Option<String>> for GeocodeResult {
    fn from(value: Option<String>) -> Self {
        value.map(GeocodeResult::from).unwrap_or(GeocodeResult::NonLocation)
    }
}

impl From<String> for GeocodeResult {
    fn from(s: String) -> Self {
        if s.is_empty() || s == NON_LOCATION {
            GeocodeResult::NonLocation
        } else {
            GeocodeResult::Place(s)
        }
    }
}

impl From<GeocodeResult> for String {
    fn from(r: GeocodeResult) -> Self {
        match r {
            GeocodeResult::Place(p) => p,
            GeocodeResult::NonLocation => NON_LOCATION.to_string(),
        }
    }
}

impl fmt::Display for GeocodeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeocodeResult::Place(p) => f.write_str(p),
            GeocodeResult::NonLocation => f.write_str(NON_LOCATION),
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AnalysisCategory {
    #[serde(rename = "City-level")]
    CityLevel,
    #[serde(rename = "State-level")]
    StateLevel,
    #[serde(rename = "Inferred from username")]
    InferredFromUsername,
    #[serde(rename = "Bot")]
    Bot,
}

impl AnalysisCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisCategory::CityLevel => "City-level",
            AnalysisCategory::StateLevel => "State-level",
            AnalysisCategory::InferredFromUsername => "Inferred from username",
            AnalysisCategory::Bot => "Bot",
        }
    }

    /// Confidence a friend-network estimate carries into the final record.
    pub fn confidence(&self) -> Confidence {
        match self {
            AnalysisCategory::CityLevel => Confidence::Medium,
            AnalysisCategory::StateLevel | AnalysisCategory::InferredFromUsername => {
                Confidence::Low
            }
            AnalysisCategory::Bot => Confidence::None,
        }
    }
}

impl fmt::Display for AnalysisCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub category: AnalysisCategory,
    pub estimated_location: Option<String>,
}

impl AnalysisResult {
    pub fn bot() -> Self {
        Self {
            category: AnalysisCategory::Bot,
            estimated_location: None,
        }
    }

    pub fn new(category: AnalysisCategory, location: impl Into<String>) -> Self {
        Self {
            category,
            estimated_location: Some(location.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
    None,
}

/// Accepted self-reported location, keyed by user id in the stage file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfReportedLocation {
    pub username: String,
    pub parsed_location: String,
    pub raw_location: String,
}

/// Location resolved from post metadata, keyed by user id in the stage file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostsLocation {
    pub username: String,
    pub location: String,
    #[serde(default)]
    pub raw_location: Option<String>,
    pub source: PostSignal,
    pub confidence: Confidence,
    #[serde(default)]
    pub followers_count: u64,
    #[serde(default)]
    pub following_count: u64,
}

/// Where a final record's location came from, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordSource {
    SelfReported,
    Posts(PostSignal),
    StarFriendAnalysis,
    FriendAnalysis,
    Unresolved,
}

impl fmt::Display for RecordSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordSource::SelfReported => f.write_str("self-reported"),
            RecordSource::Posts(signal) => write!(f, "posts-{signal}"),
            RecordSource::StarFriendAnalysis => f.write_str("star-friend-analysis"),
            RecordSource::FriendAnalysis => f.write_str("friend-analysis"),
            RecordSource::Unresolved => f.write_str("unresolved"),
        }
    }
}

impl std::str::FromStr for RecordSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "self-reported" => Ok(RecordSource::SelfReported),
            "star-friend-analysis" => Ok(RecordSource::StarFriendAnalysis),
            "friend-analysis" => Ok(RecordSource::FriendAnalysis),
            "unresolved" => Ok(RecordSource::Unresolved),
            other => other
                .strip_prefix("posts-")
                .and_then(PostSignal::parse)
                .map(RecordSource::Posts)
                .ok_or_else(|| format!("unknown record source: {other}")),
        }
    }
}

impl Serialize for RecordSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordSource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One merged record per user. Recomputed from scratch on every merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalRecord {
    pub user_id: String,
    pub username: String,
    pub location: Option<String>,
    #[serde(default)]
    pub raw_location: Option<String>,
    pub source: RecordSource,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<AnalysisCategory>,
    #[serde(default)]
    pub followers_count: u64,
}
