use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use anyhow::Result;
use tracing::{debug, info, warn};

use twitterapi_client::GraphUser;

use crate::fetch::{FetchEngine, NetworkMaps};
use crate::store::{write_json_atomic, OrderedMap};

/// Mutual follows: accounts present in both lists, in follower order, with
/// the follower entry as the profile.
pub fn find_friends(followers: &[GraphUser], followings: &[GraphUser]) -> OrderedMap<GraphUser> {
    let following: HashSet<&str> = followings
        .iter()
        .filter_map(|u| u.user_name.as_deref())
        .collect();

    let mut friends = OrderedMap::new();
    for follower in followers {
        let Some(name) = follower.user_name.as_deref() else { continue };
        if following.contains(name) && friends.get(name).is_none() {
            friends.insert(name, follower.clone());
        }
    }
    friends
}

#[derive(Debug, Default, Clone)]
pub struct FriendStats {
    pub users: usize,
    pub written: usize,
    pub already_written: usize,
    pub friends_unknown: usize,
    pub friends_found: usize,
    pub profiles_fetched: usize,
    pub deferred: usize,
}

impl fmt::Display for FriendStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Friend Profiles ===")?;
        writeln!(f, "Users:              {}", self.users)?;
        writeln!(f, "Files written:      {}", self.written)?;
        writeln!(f, "Already written:    {}", self.already_written)?;
        writeln!(f, "Friends unknown:    {}", self.friends_unknown)?;
        writeln!(f, "Friends found:      {}", self.friends_found)?;
        writeln!(f, "Profiles looked up: {}", self.profiles_fetched)?;
        write!(f, "Deferred:           {}", self.deferred)
    }
}

/// Write one friend-info file per user into `out_dir`.
///
/// Users missing from either network map are "friends unknown": no file is
/// written, so a later run picks them up once both lists exist. When
/// `profile_lookup` is given, friends whose list entry carries no location
/// field are looked up individually; if any lookup fails the user's file is
/// not written, so the next run retries it.
pub async fn write_friend_profiles(
    usernames: &[String],
    maps: &NetworkMaps,
    out_dir: &Path,
    profile_lookup: Option<&FetchEngine>,
) -> Result<FriendStats> {
    let mut stats = FriendStats::default();

    for username in usernames {
        stats.users += 1;
        let out = out_dir.join(format!("{username}.json"));
        if out.exists() {
            stats.already_written += 1;
            continue;
        }

        let (Some(followers), Some(followings)) =
            (maps.followers.get(username), maps.followings.get(username))
        else {
            stats.friends_unknown += 1;
            debug!(username = username.as_str(), "Network lists incomplete, friends unknown");
            continue;
        };

        let mut friends = find_friends(followers, followings);

        let mut lookup_failed = false;
        if let Some(engine) = profile_lookup {
            let missing: Vec<String> = friends
                .iter()
                .filter(|(_, p)| p.location.is_none())
                .map(|(name, _)| name.clone())
                .collect();
            for name in missing {
                match engine.get_profile(&name).await {
                    Ok(Some(profile)) => {
                        stats.profiles_fetched += 1;
                        friends.insert(name, profile);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(friend = name.as_str(), error = %e, "Profile lookup failed");
                        lookup_failed = true;
                    }
                }
            }
        }
        if lookup_failed {
            stats.deferred += 1;
            debug!(username = username.as_str(), "Profile lookups failed, deferring friend file");
            continue;
        }

        stats.friends_found += friends.len();
        write_json_atomic(&out, &friends)?;
        stats.written += 1;
    }

    info!(
        written = stats.written,
        unknown = stats.friends_unknown,
        deferred = stats.deferred,
        friends = stats.friends_found,
        "Friend profiles extracted"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{located_page, page, MockGraph};
    use crate::rate_limit::RateLimiter;
    use crate::store::read_json;
    use std::sync::Arc;
    use std::time::Duration;

    fn keys(map: &OrderedMap<GraphUser>) -> Vec<&str> {
        map.iter().map(|(k, _)| k.as_str()).collect()
    }

    #[test]
    fn friends_are_the_intersection() {
        let friends = find_friends(&page(&["A", "B", "C"]), &page(&["B", "C", "D"]));
        assert_eq!(keys(&friends), vec!["B", "C"]);
    }

    #[test]
    fn follower_entry_is_the_profile() {
        let followers = located_page(&[("B", "Buffalo, NY")]);
        let followings = located_page(&[("B", "Elsewhere")]);
        let friends = find_friends(&followers, &followings);
        assert_eq!(friends.get("B").unwrap().location.as_deref(), Some("Buffalo, NY"));
    }

    fn maps_with(dir: &Path) -> NetworkMaps {
        let mut maps = NetworkMaps::load(&dir.join("f.json"), &dir.join("g.json")).unwrap();
        maps.followers.insert("alice", located_page(&[("B", "Buffalo"), ("C", "Erie")]));
        maps.followings.insert("alice", page(&["C", "B"]));
        maps.followers.insert("half", page(&["X"]));
        maps
    }

    #[tokio::test]
    async fn writes_files_and_skips_incomplete_users() {
        let dir = tempfile::tempdir().unwrap();
        let maps = maps_with(dir.path());
        let out = dir.path().join("friend-info");

        let users = vec!["alice".to_string(), "half".to_string()];
        let stats = write_friend_profiles(&users, &maps, &out, None).await.unwrap();

        assert_eq!(stats.written, 1);
        assert_eq!(stats.friends_unknown, 1);
        let alice: OrderedMap<GraphUser> = read_json(&out.join("alice.json")).unwrap().unwrap();
        assert_eq!(keys(&alice), vec!["B", "C"]);
        assert!(!out.join("half.json").exists());

        let again = write_friend_profiles(&users, &maps, &out, None).await.unwrap();
        assert_eq!(again.already_written, 1);
        assert_eq!(again.written, 0);
    }

    #[tokio::test]
    async fn missing_locations_are_looked_up_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let mut maps = NetworkMaps::load(&dir.path().join("f.json"), &dir.path().join("g.json")).unwrap();
        maps.followers.insert("alice", page(&["B"]));
        maps.followings.insert("alice", page(&["B"]));

        let graph = Arc::new(MockGraph::new().profile(GraphUser::named("B").with_location("Scranton, PA")));
        let engine = FetchEngine::builder()
            .graph(graph.clone())
            .limiter(Arc::new(RateLimiter::new(Duration::ZERO)))
            .build();

        let out = dir.path().join("friend-info");
        let stats = write_friend_profiles(&["alice".to_string()], &maps, &out, Some(&engine))
            .await
            .unwrap();

        assert_eq!(stats.profiles_fetched, 1);
        assert_eq!(graph.profile_calls(), vec!["B".to_string()]);
        let alice: OrderedMap<GraphUser> = read_json(&out.join("alice.json")).unwrap().unwrap();
        assert_eq!(alice.get("B").unwrap().location.as_deref(), Some("Scranton, PA"));
    }

    #[tokio::test]
    async fn failed_lookup_defers_the_user_until_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut maps = NetworkMaps::load(&dir.path().join("f.json"), &dir.path().join("g.json")).unwrap();
        maps.followers.insert("alice", page(&["B", "C"]));
        maps.followings.insert("alice", page(&["B", "C"]));
        let out = dir.path().join("friend-info");
        let users = vec!["alice".to_string()];

        let flaky = Arc::new(
            MockGraph::new()
                .profile(GraphUser::named("B").with_location("Scranton, PA"))
                .failing_profile("C"),
        );
        let engine = FetchEngine::builder()
            .graph(flaky)
            .limiter(Arc::new(RateLimiter::new(Duration::ZERO)))
            .build();
        let stats = write_friend_profiles(&users, &maps, &out, Some(&engine)).await.unwrap();

        assert_eq!(stats.deferred, 1);
        assert_eq!(stats.written, 0);
        assert!(!out.join("alice.json").exists());

        let healthy = Arc::new(
            MockGraph::new()
                .profile(GraphUser::named("B").with_location("Scranton, PA"))
                .profile(GraphUser::named("C").with_location("Erie, PA")),
        );
        let engine = FetchEngine::builder()
            .graph(healthy.clone())
            .limiter(Arc::new(RateLimiter::new(Duration::ZERO)))
            .build();
        let again = write_friend_profiles(&users, &maps, &out, Some(&engine)).await.unwrap();

        assert_eq!(again.written, 1);
        assert_eq!(healthy.profile_calls(), vec!["B".to_string(), "C".to_string()]);
        let alice: OrderedMap<GraphUser> = read_json(&out.join("alice.json")).unwrap().unwrap();
        assert_eq!(alice.get("C").unwrap().location.as_deref(), Some("Erie, PA"));
    }
}
