// Priority merge of every location source into one final record per user.
//
// Order: self-reported, posts (geo-tagged, network, text-mention), star
// friend analysis, regular friend analysis. The first source that has the
// user decides the record; lower sources are ignored, never blended.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use anyhow::Result;
use tracing::{info, warn};

use homeloc_common::places;
use homeloc_common::{
    AnalysisCategory, AnalysisResult, Confidence, FinalRecord, PostsLocation, RecordSource,
    SelfReportedLocation, User,
};

use crate::paths::CohortPaths;
use crate::store::read_json;
use crate::tiers::Tier;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Everything the merge reads. Self-reported and posts maps are keyed by user
/// id; analysis maps are keyed by username.
#[derive(Debug, Default, Clone)]
pub struct MergeInputs {
    pub self_reported: BTreeMap<String, SelfReportedLocation>,
    pub posts: BTreeMap<String, PostsLocation>,
    pub star_analysis: BTreeMap<String, AnalysisResult>,
    pub friend_analysis: BTreeMap<String, AnalysisResult>,
    /// Known user snapshots, in priority order for username lookups.
    pub users: Vec<User>,
}

impl MergeInputs {
    /// Load every stage file of a cohort. Missing files are empty. Chunked
    /// analysis files are folded in after the unchunked one; a later file
    /// replaces an earlier entry for the same username.
    pub fn load(paths: &CohortPaths) -> Result<Self> {
        let mut inputs = MergeInputs {
            self_reported: read_json(&paths.self_reported())?.unwrap_or_default(),
            posts: read_json(&paths.posts_location())?.unwrap_or_default(),
            ..Default::default()
        };

        for tier in Tier::ALL {
            let mut folded = BTreeMap::new();
            for file in paths.analysis_files(tier)? {
                let part: BTreeMap<String, AnalysisResult> = read_json(&file)?.unwrap_or_default();
                folded.extend(part);
            }
            match tier {
                Tier::Star => inputs.star_analysis = folded,
                Tier::Regular => inputs.friend_analysis = folded,
            }

            let tier_users: BTreeMap<String, User> =
                read_json(&paths.tier_users(tier))?.unwrap_or_default();
            inputs.users.extend(tier_users.into_values());
        }

        Ok(inputs)
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// `(place, users, summed followers)`.
pub type PlaceCount = (String, usize, u64);

#[derive(Debug, Default, Clone)]
pub struct MergeStats {
    pub total: usize,
    pub by_source: BTreeMap<RecordSource, usize>,
    /// Ran through friend analysis and got no location (Bot).
    pub no_location: usize,
    pub unresolved: usize,
    pub regular_cities: Vec<PlaceCount>,
    pub regular_states: Vec<PlaceCount>,
    pub star_cities: Vec<PlaceCount>,
    pub star_states: Vec<PlaceCount>,
}

impl MergeStats {
    pub fn located(&self, source: RecordSource) -> usize {
        self.by_source.get(&source).copied().unwrap_or(0)
    }
}

fn write_top(f: &mut fmt::Formatter<'_>, label: &str, rows: &[PlaceCount]) -> fmt::Result {
    if rows.is_empty() {
        return Ok(());
    }
    write!(f, "\n[{label}]")?;
    for (place, users, followers) in rows {
        write!(f, "\n  {place}: {users} users, {followers} followers")?;
    }
    Ok(())
}

impl fmt::Display for MergeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Merge ===")?;
        writeln!(f, "Total users: {}", self.total)?;
        for (source, n) in &self.by_source {
            writeln!(f, "  {source}: {n}")?;
        }
        writeln!(f, "No location (Bot): {}", self.no_location)?;
        write!(f, "Unresolved:        {}", self.unresolved)?;
        write_top(f, "Regular users: top cities", &self.regular_cities)?;
        write_top(f, "Regular users: top states", &self.regular_states)?;
        write_top(f, "Star users: top cities", &self.star_cities)?;
        write_top(f, "Star users: top states", &self.star_states)
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Profile {
    username: String,
    raw_location: Option<String>,
    followers_count: u64,
}

/// Username -> id, first snapshot wins.
fn index_usernames<'a>(entries: impl Iterator<Item = (&'a str, &'a str)>) -> HashMap<&'a str, &'a str> {
    let mut index: HashMap<&str, &str> = HashMap::new();
    for (username, id) in entries {
        if username.is_empty() {
            continue;
        }
        match index.get(username) {
            Some(existing) if *existing != id => {
                warn!(username, kept = *existing, ignored = id, "Username maps to several ids");
            }
            Some(_) => {}
            None => {
                index.insert(username, id);
            }
        }
    }
    index
}

fn analysis_record(
    user_id: &str,
    username: &str,
    profile: Option<&Profile>,
    result: &AnalysisResult,
    source: RecordSource,
) -> FinalRecord {
    let location = match result.category {
        AnalysisCategory::Bot => None,
        _ => result.estimated_location.clone().filter(|l| !l.is_empty()),
    };
    let confidence = match location {
        Some(_) => result.category.confidence(),
        None => Confidence::None,
    };
    FinalRecord {
        user_id: user_id.to_string(),
        username: username.to_string(),
        location,
        raw_location: profile.and_then(|p| p.raw_location.clone()),
        source,
        confidence,
        category: Some(result.category),
        followers_count: profile.map_or(0, |p| p.followers_count),
    }
}

/// Build one record per known user.
pub fn merge(inputs: &MergeInputs) -> (BTreeMap<String, FinalRecord>, MergeStats) {
    let mut profiles: BTreeMap<String, Profile> = BTreeMap::new();
    for user in &inputs.users {
        profiles.entry(user.id.clone()).or_insert_with(|| Profile {
            username: user.username.clone(),
            raw_location: user.raw_location.clone(),
            followers_count: user.followers_count,
        });
    }
    for (id, p) in &inputs.posts {
        profiles.entry(id.clone()).or_insert_with(|| Profile {
            username: p.username.clone(),
            raw_location: p.raw_location.clone(),
            followers_count: p.followers_count,
        });
    }

    let index = index_usernames(
        inputs
            .self_reported
            .iter()
            .map(|(id, s)| (s.username.as_str(), id.as_str()))
            .chain(inputs.posts.iter().map(|(id, p)| (p.username.as_str(), id.as_str())))
            .chain(inputs.users.iter().map(|u| (u.username.as_str(), u.id.as_str()))),
    );
    let id_for = |username: &str| -> String {
        index
            .get(username)
            .map(|id| id.to_string())
            .unwrap_or_else(|| format!("u_{username}"))
    };

    let mut records: BTreeMap<String, FinalRecord> = BTreeMap::new();

    for (id, s) in &inputs.self_reported {
        let profile = profiles.get(id);
        records.insert(
            id.clone(),
            FinalRecord {
                user_id: id.clone(),
                username: s.username.clone(),
                location: Some(s.parsed_location.clone()),
                raw_location: Some(s.raw_location.clone()),
                source: RecordSource::SelfReported,
                confidence: Confidence::High,
                category: None,
                followers_count: profile.map_or(0, |p| p.followers_count),
            },
        );
    }

    for (id, p) in &inputs.posts {
        if records.contains_key(id) {
            continue;
        }
        records.insert(
            id.clone(),
            FinalRecord {
                user_id: id.clone(),
                username: p.username.clone(),
                location: Some(p.location.clone()),
                raw_location: p.raw_location.clone(),
                source: RecordSource::Posts(p.source),
                confidence: p.confidence,
                category: None,
                followers_count: p.followers_count,
            },
        );
    }

    for (analysis, source) in [
        (&inputs.star_analysis, RecordSource::StarFriendAnalysis),
        (&inputs.friend_analysis, RecordSource::FriendAnalysis),
    ] {
        for (username, result) in analysis {
            let id = id_for(username);
            if records.contains_key(&id) {
                continue;
            }
            let record = analysis_record(&id, username, profiles.get(&id), result, source);
            records.insert(id, record);
        }
    }

    for (id, profile) in &profiles {
        if records.contains_key(id) {
            continue;
        }
        records.insert(
            id.clone(),
            FinalRecord {
                user_id: id.clone(),
                username: profile.username.clone(),
                location: None,
                raw_location: profile.raw_location.clone(),
                source: RecordSource::Unresolved,
                confidence: Confidence::None,
                category: None,
                followers_count: profile.followers_count,
            },
        );
    }

    let stats = summarize(&records);
    info!(
        total = stats.total,
        unresolved = stats.unresolved,
        no_location = stats.no_location,
        "Merge finished"
    );
    (records, stats)
}

// ---------------------------------------------------------------------------
// Distribution
// ---------------------------------------------------------------------------

/// `(city, state)` for a standardized place. The state is the last part that
/// names one: `"New York, NY"` -> `("New York, NY", "NY")`,
/// `"Paris, France"` -> `("Paris, France", None)`, `"Texas"` -> `(None, "TX")`.
fn split_place(place: &str) -> (Option<String>, Option<&'static str>) {
    let parts: Vec<&str> = place.split(',').map(str::trim).collect();

    if let Some((i, abbrev)) = parts
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, p)| places::state_abbrev(p).map(|a| (i, a)))
    {
        let city = (i > 0).then(|| format!("{}, {abbrev}", parts[0]));
        return (city, Some(abbrev));
    }

    match parts.as_slice() {
        [first, .., last] if !places::is_country(first) => (Some(format!("{first}, {last}")), None),
        _ => (None, None),
    }
}

fn top_places(counts: HashMap<String, (usize, u64)>, n: usize) -> Vec<PlaceCount> {
    let mut rows: Vec<PlaceCount> = counts
        .into_iter()
        .map(|(place, (users, followers))| (place, users, followers))
        .collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then(b.2.cmp(&a.2)).then(a.0.cmp(&b.0)));
    rows.truncate(n);
    rows
}

fn summarize(records: &BTreeMap<String, FinalRecord>) -> MergeStats {
    let mut stats = MergeStats {
        total: records.len(),
        ..Default::default()
    };

    let mut regular_cities = HashMap::new();
    let mut regular_states = HashMap::new();
    let mut star_cities = HashMap::new();
    let mut star_states = HashMap::new();

    for record in records.values() {
        if record.source == RecordSource::Unresolved {
            stats.unresolved += 1;
            continue;
        }
        let Some(location) = &record.location else {
            stats.no_location += 1;
            continue;
        };
        *stats.by_source.entry(record.source).or_default() += 1;

        let (cities, states) = if record.source == RecordSource::StarFriendAnalysis {
            (&mut star_cities, &mut star_states)
        } else {
            (&mut regular_cities, &mut regular_states)
        };
        let (city, state) = split_place(location);
        if let Some(city) = city {
            let slot: &mut (usize, u64) = cities.entry(city).or_default();
            slot.0 += 1;
            slot.1 += record.followers_count;
        }
        if let Some(state) = state {
            let slot: &mut (usize, u64) = states.entry(state.to_string()).or_default();
            slot.0 += 1;
            slot.1 += record.followers_count;
        }
    }

    stats.regular_cities = top_places(regular_cities, 5);
    stats.regular_states = top_places(regular_states, 5);
    stats.star_cities = top_places(star_cities, 5);
    stats.star_states = top_places(star_states, 5);
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::user;
    use homeloc_common::PostSignal;

    fn self_reported(username: &str, place: &str) -> SelfReportedLocation {
        SelfReportedLocation {
            username: username.into(),
            parsed_location: place.into(),
            raw_location: place.to_lowercase(),
        }
    }

    fn posts(username: &str, place: &str, source: PostSignal) -> PostsLocation {
        PostsLocation {
            username: username.into(),
            location: place.into(),
            raw_location: None,
            source,
            confidence: source.confidence(),
            followers_count: 7,
            following_count: 3,
        }
    }

    fn city(place: &str) -> AnalysisResult {
        AnalysisResult::new(AnalysisCategory::CityLevel, place)
    }

    #[test]
    fn self_report_beats_every_other_source() {
        let mut inputs = MergeInputs::default();
        inputs.self_reported.insert("1".into(), self_reported("alice", "Erie, PA"));
        inputs.posts.insert("1".into(), posts("alice", "Reno, NV", PostSignal::GeoTagged));
        inputs.star_analysis.insert("alice".into(), city("Austin, TX"));
        inputs.friend_analysis.insert("alice".into(), city("Boise, ID"));

        let (records, stats) = merge(&inputs);

        assert_eq!(records.len(), 1);
        let alice = &records["1"];
        assert_eq!(alice.source, RecordSource::SelfReported);
        assert_eq!(alice.location.as_deref(), Some("Erie, PA"));
        assert_eq!(alice.confidence, Confidence::High);
        assert_eq!(stats.located(RecordSource::SelfReported), 1);
    }

    #[test]
    fn posts_then_star_then_regular() {
        let mut inputs = MergeInputs::default();
        inputs.posts.insert("2".into(), posts("bob", "Reno, NV", PostSignal::Network));
        inputs.friend_analysis.insert("bob".into(), city("Boise, ID"));
        inputs.users.push(user("3", "carol", 2000, 2000));
        inputs.star_analysis.insert("carol".into(), city("Austin, TX"));
        inputs.friend_analysis.insert("carol".into(), city("Boise, ID"));

        let (records, _) = merge(&inputs);

        assert_eq!(records["2"].source, RecordSource::Posts(PostSignal::Network));
        assert_eq!(records["2"].confidence, Confidence::Medium);
        assert_eq!(records["3"].source, RecordSource::StarFriendAnalysis);
        assert_eq!(records["3"].location.as_deref(), Some("Austin, TX"));
        assert_eq!(records["3"].followers_count, 2000);
        assert_eq!(records["3"].category, Some(AnalysisCategory::CityLevel));
    }

    #[test]
    fn bots_and_unresolved_users_have_no_location() {
        let mut inputs = MergeInputs::default();
        inputs.users.push(user("4", "dave", 10, 10));
        inputs.users.push(user("5", "erin", 9000, 9000));
        inputs.friend_analysis.insert("dave".into(), AnalysisResult::bot());
        inputs.friend_analysis.insert(
            "stranger".into(),
            AnalysisResult::new(AnalysisCategory::StateLevel, "Texas"),
        );

        let (records, stats) = merge(&inputs);

        let dave = &records["4"];
        assert_eq!(dave.location, None);
        assert_eq!(dave.confidence, Confidence::None);
        assert_eq!(dave.source, RecordSource::FriendAnalysis);

        let erin = &records["5"];
        assert_eq!(erin.source, RecordSource::Unresolved);
        assert_eq!(erin.confidence, Confidence::None);

        let stranger = &records["u_stranger"];
        assert_eq!(stranger.confidence, Confidence::Low);
        assert_eq!(stranger.location.as_deref(), Some("Texas"));

        assert_eq!(stats.no_location, 1);
        assert_eq!(stats.unresolved, 1);
        assert_eq!(stats.total, 3);
    }

    #[test]
    fn first_snapshot_decides_username_ids() {
        let mut inputs = MergeInputs::default();
        inputs.users.push(user("10", "frank", 1, 1));
        inputs.users.push(user("11", "frank", 1, 1));
        inputs.friend_analysis.insert("frank".into(), city("Erie, PA"));

        let (records, _) = merge(&inputs);
        assert_eq!(records["10"].source, RecordSource::FriendAnalysis);
        assert_eq!(records["11"].source, RecordSource::Unresolved);
    }

    #[test]
    fn distribution_groups_cities_and_states() {
        let mut inputs = MergeInputs::default();
        inputs.posts.insert("1".into(), posts("a", "Erie, PA", PostSignal::GeoTagged));
        inputs.posts.insert("2".into(), posts("b", "Erie, Pennsylvania", PostSignal::GeoTagged));
        inputs.posts.insert("3".into(), posts("c", "Paris, France", PostSignal::GeoTagged));
        inputs.posts.insert("4".into(), posts("d", "Texas", PostSignal::GeoTagged));

        let (_, stats) = merge(&inputs);

        assert_eq!(stats.regular_cities[0], ("Erie, PA".to_string(), 2, 14));
        assert!(stats.regular_cities.contains(&("Paris, France".to_string(), 1, 7)));
        assert_eq!(stats.regular_states[0], ("PA".to_string(), 2, 14));
        assert!(stats.regular_states.contains(&("TX".to_string(), 1, 7)));
        assert!(stats.star_cities.is_empty());
    }
}
