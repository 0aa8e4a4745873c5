// Per-user location inference from friends' geocoded locations.
//
// Decision order: repeated city, small-sample city, repeated state, username
// keyword, Bot. Country-level results never count as city evidence.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, info};

use homeloc_common::places;
use homeloc_common::{AnalysisCategory, AnalysisResult, GeocodeResult, PipelineConfig};

use crate::evidence::Tally;
use crate::store::{read_json, write_json_atomic, OrderedMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InferenceThresholds {
    /// A city seen this many times wins outright.
    pub city_min_count: u32,
    /// With at most this many city-level friend locations, a single
    /// occurrence is enough.
    pub small_sample_max: usize,
    pub state_min_count: u32,
}

impl From<&PipelineConfig> for InferenceThresholds {
    fn from(c: &PipelineConfig) -> Self {
        Self {
            city_min_count: c.city_min_count,
            small_sample_max: c.small_sample_max,
            state_min_count: c.state_min_count,
        }
    }
}

impl Default for InferenceThresholds {
    fn default() -> Self {
        (&PipelineConfig::default()).into()
    }
}

fn from_username(username: &str) -> AnalysisResult {
    match places::match_username(username) {
        Some(city) => AnalysisResult::new(AnalysisCategory::InferredFromUsername, city),
        None => AnalysisResult::bot(),
    }
}

/// Estimate a user's home location from their friends' locations, given in
/// friend order.
pub fn analyze<'a>(
    username: &str,
    friend_locations: impl IntoIterator<Item = &'a GeocodeResult>,
    thresholds: &InferenceThresholds,
) -> AnalysisResult {
    let cities: Tally = friend_locations
        .into_iter()
        .filter_map(GeocodeResult::place)
        .filter(|place| !places::is_country(place))
        .collect();

    let Some((top, count)) = cities.top() else {
        return from_username(username);
    };

    if count >= thresholds.city_min_count {
        return AnalysisResult::new(AnalysisCategory::CityLevel, top);
    }
    if count == 1 && cities.total() as usize <= thresholds.small_sample_max {
        return AnalysisResult::new(AnalysisCategory::CityLevel, top);
    }

    let mut states = Tally::default();
    for (place, n) in cities.iter() {
        if let Some(abbrev) = places::extract_state(place) {
            for _ in 0..n {
                states.add(abbrev);
            }
        }
    }
    if let Some((abbrev, n)) = states.top() {
        if n >= thresholds.state_min_count {
            let name = places::state_name(abbrev).unwrap_or(abbrev);
            return AnalysisResult::new(AnalysisCategory::StateLevel, name);
        }
    }

    from_username(username)
}

// ---------------------------------------------------------------------------
// Analysis stage
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct InferenceStats {
    pub users: usize,
    pub analyzed: usize,
    pub pending: usize,
    pub categories: BTreeMap<AnalysisCategory, usize>,
}

impl fmt::Display for InferenceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Friend Analysis ===")?;
        writeln!(f, "Users:     {}", self.users)?;
        writeln!(f, "Analyzed:  {}", self.analyzed)?;
        write!(f, "Pending:   {}", self.pending)?;
        for (category, n) in &self.categories {
            write!(f, "\n  {category}: {n}")?;
        }
        Ok(())
    }
}

/// Analyze every user with a friend-location file and write the results,
/// keyed by username, to `out`.
///
/// Users without a friend-location file have not finished the earlier stages
/// and are left out, so they stay unresolved until a later run.
pub fn analyze_users(
    usernames: &[String],
    location_dir: &Path,
    out: &Path,
    thresholds: &InferenceThresholds,
) -> Result<InferenceStats> {
    let mut stats = InferenceStats::default();
    let mut results: BTreeMap<String, AnalysisResult> = BTreeMap::new();

    for username in usernames {
        stats.users += 1;
        let file = location_dir.join(format!("{username}.json"));
        let Some(friends) = read_json::<OrderedMap<GeocodeResult>>(&file)? else {
            stats.pending += 1;
            debug!(username = username.as_str(), "No friend locations yet");
            continue;
        };

        let result = analyze(username, friends.values(), thresholds);
        *stats.categories.entry(result.category).or_default() += 1;
        stats.analyzed += 1;
        results.insert(username.clone(), result);
    }

    write_json_atomic(out, &results)?;
    info!(
        analyzed = stats.analyzed,
        pending = stats.pending,
        out = %out.display(),
        "Friend analysis written"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locs(values: &[&str]) -> Vec<GeocodeResult> {
        values.iter().map(|v| GeocodeResult::from(v.to_string())).collect()
    }

    fn run(username: &str, values: &[&str]) -> AnalysisResult {
        analyze(username, &locs(values), &InferenceThresholds::default())
    }

    #[test]
    fn repeated_city_wins() {
        let r = run("someone", &["Erie, PA", "Erie, PA", "Buffalo, NY"]);
        assert_eq!(r, AnalysisResult::new(AnalysisCategory::CityLevel, "Erie, PA"));
    }

    #[test]
    fn small_sample_takes_first_seen() {
        let r = run("someone", &["Austin, TX", "Erie, PA", "Paris, France"]);
        assert_eq!(r, AnalysisResult::new(AnalysisCategory::CityLevel, "Austin, TX"));
    }

    #[test]
    fn scattered_cities_without_state_repeat_fall_through() {
        let values = ["Austin, TX", "Erie, PA", "Paris, France", "Boise, ID"];
        assert_eq!(run("someone", &values), AnalysisResult::bot());
        assert_eq!(
            run("rockford_dad", &values),
            AnalysisResult::new(AnalysisCategory::InferredFromUsername, "Rockford, IL")
        );
    }

    #[test]
    fn repeated_state_is_state_level() {
        let r = run(
            "someone",
            &["Austin, TX", "Dallas, TX", "Erie, PA", "Boise, ID"],
        );
        assert_eq!(r, AnalysisResult::new(AnalysisCategory::StateLevel, "Texas"));
    }

    #[test]
    fn no_usable_locations() {
        assert_eq!(run("someone", &[]), AnalysisResult::bot());
        assert_eq!(run("someone", &["non-location", "non-location"]), AnalysisResult::bot());
        assert_eq!(
            run("buffalo_wings", &["United States", "Canada", "non-location"]),
            AnalysisResult::new(AnalysisCategory::InferredFromUsername, "Buffalo, NY")
        );
    }

    #[test]
    fn countries_do_not_count_toward_the_sample() {
        let r = run(
            "someone",
            &["USA", "USA", "Erie, PA", "United States", "Canada"],
        );
        assert_eq!(r, AnalysisResult::new(AnalysisCategory::CityLevel, "Erie, PA"));
    }

    #[test]
    fn stage_skips_users_without_location_files() {
        let dir = tempfile::tempdir().unwrap();
        let locations = dir.path().join("locs");
        let mut alice = OrderedMap::new();
        alice.insert("f1", GeocodeResult::Place("Erie, PA".into()));
        alice.insert("f2", GeocodeResult::Place("Erie, PA".into()));
        write_json_atomic(&locations.join("alice.json"), &alice).unwrap();
        write_json_atomic(&locations.join("lonely.json"), &OrderedMap::<GeocodeResult>::new()).unwrap();

        let out = dir.path().join("analysis.json");
        let users = vec!["alice".to_string(), "lonely".to_string(), "later".to_string()];
        let stats = analyze_users(&users, &locations, &out, &InferenceThresholds::default()).unwrap();

        assert_eq!(stats.analyzed, 2);
        assert_eq!(stats.pending, 1);
        let written: BTreeMap<String, AnalysisResult> = read_json(&out).unwrap().unwrap();
        assert_eq!(written["alice"].estimated_location.as_deref(), Some("Erie, PA"));
        assert_eq!(written["lonely"].category, AnalysisCategory::Bot);
        assert!(!written.contains_key("later"));
    }
}
