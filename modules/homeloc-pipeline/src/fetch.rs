// Network fetch engine.
//
// Pulls follower and following lists for a set of usernames through the
// SocialGraph seam. Workers run as a bounded `buffer_unordered` pool; every
// request waits on one shared RateLimiter. Results flow back to a single
// owner loop that merges them into the persisted maps and checkpoints every
// `checkpoint_every` completed users.
//
// Resume: a username already present in both maps is never re-fetched, and
// only the missing half is fetched for a username present in one.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::{self, StreamExt};
use tracing::{info, warn};
use typed_builder::TypedBuilder;

use homeloc_common::User;
use twitterapi_client::{GraphApiError, GraphUser, ListKind};

use crate::rate_limit::RateLimiter;
use crate::retry::{RetryAction, RetryPolicy};
use crate::store::JsonMapStore;
use crate::traits::SocialGraph;

// ---------------------------------------------------------------------------
// Persisted maps
// ---------------------------------------------------------------------------

/// Followers and followings keyed by username.
///
/// The two files are checkpointed together but carry no cross-file
/// guarantee; readers must tolerate a username present in only one.
pub struct NetworkMaps {
    pub followers: JsonMapStore<Vec<GraphUser>>,
    pub followings: JsonMapStore<Vec<GraphUser>>,
}

impl NetworkMaps {
    pub fn load(followers: &Path, followings: &Path) -> Result<Self> {
        Ok(Self {
            followers: JsonMapStore::load(followers)?,
            followings: JsonMapStore::load(followings)?,
        })
    }

    pub fn is_complete(&self, username: &str) -> bool {
        self.followers.contains(username) && self.followings.contains(username)
    }

    pub fn persist(&self) -> Result<()> {
        self.followers.persist()?;
        self.followings.persist()
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct FetchStats {
    pub requested: usize,
    pub already_fetched: usize,
    pub fetched: usize,
    pub abandoned: usize,
    pub checkpoints: usize,
    pub purged: usize,
}

impl fmt::Display for FetchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Network Fetch ===")?;
        writeln!(f, "Users requested:   {}", self.requested)?;
        writeln!(f, "Already fetched:   {}", self.already_fetched)?;
        writeln!(f, "Fetched this run:  {}", self.fetched)?;
        writeln!(f, "Abandoned:         {}", self.abandoned)?;
        writeln!(f, "Checkpoints:       {}", self.checkpoints)?;
        write!(f, "Purged as suspect: {}", self.purged)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct UserLists {
    followers: Option<Vec<GraphUser>>,
    followings: Option<Vec<GraphUser>>,
}

#[derive(TypedBuilder)]
pub struct FetchEngine {
    graph: Arc<dyn SocialGraph>,
    limiter: Arc<RateLimiter>,
    #[builder(default = RetryPolicy::none())]
    retry: RetryPolicy,
    #[builder(default = 1)]
    threads: usize,
    /// Truncate each list at this many accounts. `None` fetches everything.
    #[builder(default)]
    max_per_user: Option<usize>,
    #[builder(default = 10)]
    checkpoint_every: usize,
    /// Wait applied to a 429 that carries no reset header.
    #[builder(default = Duration::from_secs(5))]
    rate_limit_fallback: Duration,
    /// Added on top of a reset-header wait.
    #[builder(default = Duration::from_secs(5))]
    rate_limit_margin: Duration,
}

impl FetchEngine {
    /// Fetch every username not already complete in `maps`.
    ///
    /// A user whose fetch fails (after retries) is skipped for this pass and
    /// nothing is written for them, so the next invocation picks them up.
    pub async fn fetch_all(&self, usernames: &[String], maps: &mut NetworkMaps) -> Result<FetchStats> {
        let mut stats = FetchStats::default();
        let mut seen = HashSet::new();
        let mut jobs = Vec::new();

        for username in usernames {
            if username.is_empty() || !seen.insert(username.as_str()) {
                continue;
            }
            stats.requested += 1;
            if maps.is_complete(username) {
                stats.already_fetched += 1;
                continue;
            }
            jobs.push((
                username.clone(),
                !maps.followers.contains(username),
                !maps.followings.contains(username),
            ));
        }

        if jobs.is_empty() {
            info!(requested = stats.requested, "All network data already fetched");
            return Ok(stats);
        }

        let threads = self.threads.max(1);
        let checkpoint_every = self.checkpoint_every.max(1);
        let total = jobs.len();
        info!(pending = total, threads, cap = ?self.max_per_user, "Fetching followers/followings");

        let mut results = stream::iter(jobs)
            .map(|(username, need_followers, need_followings)| async move {
                let outcome = self.fetch_user(&username, need_followers, need_followings).await;
                (username, outcome)
            })
            .buffer_unordered(threads);

        let mut completed = 0usize;
        while let Some((username, outcome)) = results.next().await {
            match outcome {
                Ok(lists) => {
                    if let Some(followers) = lists.followers {
                        maps.followers.insert(username.clone(), followers);
                    }
                    if let Some(followings) = lists.followings {
                        maps.followings.insert(username.clone(), followings);
                    }
                    stats.fetched += 1;
                    completed += 1;

                    if completed % checkpoint_every == 0 {
                        maps.persist()?;
                        stats.checkpoints += 1;
                        info!(completed, total, "Checkpoint saved");
                    }
                }
                Err(e) => {
                    stats.abandoned += 1;
                    warn!(username = username.as_str(), error = %e, "Fetch failed, user left for next run");
                }
            }
        }

        maps.persist()?;
        info!(fetched = stats.fetched, abandoned = stats.abandoned, "Network fetch finished");
        Ok(stats)
    }

    /// Rate-limited, retried profile lookup.
    pub async fn get_profile(&self, username: &str) -> Result<Option<GraphUser>, GraphApiError> {
        let graph = &*self.graph;
        let limiter = &*self.limiter;
        self.retry
            .run(
                username,
                move || async move {
                    limiter.acquire().await;
                    graph.get_profile(username).await
                },
                |e: &GraphApiError| self.classify(e),
            )
            .await
    }

    async fn fetch_user(
        &self,
        username: &str,
        need_followers: bool,
        need_followings: bool,
    ) -> Result<UserLists, GraphApiError> {
        let followers = if need_followers {
            Some(self.fetch_list(ListKind::Followers, username).await?)
        } else {
            None
        };
        let followings = if need_followings {
            Some(self.fetch_list(ListKind::Followings, username).await?)
        } else {
            None
        };
        Ok(UserLists {
            followers,
            followings,
        })
    }

    async fn fetch_list(&self, kind: ListKind, username: &str) -> Result<Vec<GraphUser>, GraphApiError> {
        let mut users = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self.request_page(kind, username, cursor.as_deref()).await?;
            let next = page.continuation().map(str::to_string);
            users.extend(page.users);

            if let Some(max) = self.max_per_user {
                if users.len() >= max {
                    users.truncate(max);
                    break;
                }
            }
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        Ok(users)
    }

    async fn request_page(
        &self,
        kind: ListKind,
        username: &str,
        cursor: Option<&str>,
    ) -> Result<twitterapi_client::FollowPage, GraphApiError> {
        let graph = &*self.graph;
        let limiter = &*self.limiter;
        self.retry
            .run(
                username,
                move || async move {
                    limiter.acquire().await;
                    graph.list(kind, username, cursor).await
                },
                |e: &GraphApiError| self.classify(e),
            )
            .await
    }

    /// 429s wait and retry indefinitely; transport errors and 5xx back off;
    /// everything else abandons the request.
    fn classify(&self, err: &GraphApiError) -> RetryAction {
        match err {
            GraphApiError::RateLimited { retry_after } => RetryAction::WaitFor(
                retry_after
                    .map(|d| d + self.rate_limit_margin)
                    .unwrap_or(self.rate_limit_fallback),
            ),
            e if e.is_retryable() => RetryAction::Backoff,
            _ => RetryAction::Fail,
        }
    }
}

/// Drop users whose profile claims more than `threshold` followers but whose
/// fetched lists are both empty. Those are rate-limit artifacts, not real
/// zero-friend accounts; removing them makes the next run fetch them again.
pub fn purge_suspect_empty(maps: &mut NetworkMaps, users: &[User], threshold: u64) -> Vec<String> {
    let mut purged = Vec::new();
    for user in users {
        if user.followers_count <= threshold {
            continue;
        }
        let name = user.username.as_str();
        let followers = maps.followers.get(name).map_or(0, Vec::len);
        let followings = maps.followings.get(name).map_or(0, Vec::len);
        if followers > 0 || followings > 0 {
            continue;
        }
        let had_followers = maps.followers.remove(name).is_some();
        let had_followings = maps.followings.remove(name).is_some();
        if had_followers || had_followings {
            warn!(username = name, expected = user.followers_count, "Empty lists for a large account, purging for retry");
            purged.push(user.username.clone());
        }
    }
    purged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{page, MockGraph};

    fn names(list: &[GraphUser]) -> Vec<&str> {
        list.iter().filter_map(|u| u.user_name.as_deref()).collect()
    }

    fn engine(graph: Arc<MockGraph>) -> FetchEngine {
        FetchEngine::builder()
            .graph(graph)
            .limiter(Arc::new(RateLimiter::new(Duration::ZERO)))
            .retry(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(100),
                factor: 2,
                max_jitter: Duration::ZERO,
            })
            .build()
    }

    fn maps(dir: &Path) -> NetworkMaps {
        NetworkMaps::load(&dir.join("followers.json"), &dir.join("followings.json")).unwrap()
    }

    #[tokio::test]
    async fn follows_cursors_until_exhausted() {
        let graph = Arc::new(
            MockGraph::new()
                .followers("alice", vec![page(&["a", "b"]), page(&["c"])])
                .followings("alice", vec![page(&["b"])]),
        );
        let dir = tempfile::tempdir().unwrap();
        let mut m = maps(dir.path());

        let stats = engine(graph.clone()).fetch_all(&["alice".into()], &mut m).await.unwrap();
        assert_eq!(stats.fetched, 1);
        assert_eq!(names(m.followers.get("alice").unwrap()), vec!["a", "b", "c"]);
        assert_eq!(names(m.followings.get("alice").unwrap()), vec!["b"]);
    }

    #[tokio::test]
    async fn cap_truncates_without_error() {
        let graph = Arc::new(
            MockGraph::new()
                .followers("alice", vec![page(&["a", "b"]), page(&["c", "d"]), page(&["e"])])
                .followings("alice", vec![page(&["x"])]),
        );
        let dir = tempfile::tempdir().unwrap();
        let mut m = maps(dir.path());

        let engine = FetchEngine::builder()
            .graph(graph.clone())
            .limiter(Arc::new(RateLimiter::new(Duration::ZERO)))
            .max_per_user(Some(3))
            .build();
        engine.fetch_all(&["alice".into()], &mut m).await.unwrap();

        assert_eq!(names(m.followers.get("alice").unwrap()), vec!["a", "b", "c"]);
        assert_eq!(graph.list_calls("alice", ListKind::Followers), 2);
    }

    #[tokio::test]
    async fn second_run_fetches_nothing() {
        let graph = Arc::new(
            MockGraph::new()
                .followers("alice", vec![page(&["a"])])
                .followings("alice", vec![page(&["a"])]),
        );
        let dir = tempfile::tempdir().unwrap();

        let mut first = maps(dir.path());
        engine(graph.clone()).fetch_all(&["alice".into()], &mut first).await.unwrap();
        let before = std::fs::read_to_string(dir.path().join("followers.json")).unwrap();
        let calls = graph.total_calls();

        let mut second = maps(dir.path());
        let stats = engine(graph.clone()).fetch_all(&["alice".into()], &mut second).await.unwrap();
        let after = std::fs::read_to_string(dir.path().join("followers.json")).unwrap();

        assert_eq!(stats.already_fetched, 1);
        assert_eq!(stats.fetched, 0);
        assert_eq!(graph.total_calls(), calls);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn only_the_missing_half_is_fetched() {
        let graph = Arc::new(
            MockGraph::new()
                .followers("alice", vec![page(&["new"])])
                .followings("alice", vec![page(&["f"])]),
        );
        let dir = tempfile::tempdir().unwrap();
        let mut m = maps(dir.path());
        m.followers.insert("alice", vec![GraphUser::named("old")]);

        engine(graph.clone()).fetch_all(&["alice".into()], &mut m).await.unwrap();

        assert_eq!(graph.list_calls("alice", ListKind::Followers), 0);
        assert_eq!(names(m.followers.get("alice").unwrap()), vec!["old"]);
        assert_eq!(names(m.followings.get("alice").unwrap()), vec!["f"]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_waits_and_retries_same_request() {
        let graph = Arc::new(
            MockGraph::new()
                .followers("alice", vec![page(&["a"])])
                .followings("alice", vec![page(&["b"])])
                .rate_limit_first("alice", ListKind::Followers, 4, Some(Duration::from_secs(60))),
        );
        let dir = tempfile::tempdir().unwrap();
        let mut m = maps(dir.path());
        let start = tokio::time::Instant::now();

        let stats = engine(graph.clone()).fetch_all(&["alice".into()], &mut m).await.unwrap();

        assert_eq!(stats.abandoned, 0);
        assert_eq!(graph.list_calls("alice", ListKind::Followers), 5);
        assert!(start.elapsed() >= Duration::from_secs(4 * 65));
        assert!(m.followers.contains("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_back_off_then_succeed() {
        let graph = Arc::new(
            MockGraph::new()
                .followers("alice", vec![page(&["a"])])
                .followings("alice", vec![page(&["b"])])
                .fail_first("alice", ListKind::Followings, 2, 503),
        );
        let dir = tempfile::tempdir().unwrap();
        let mut m = maps(dir.path());

        let stats = engine(graph.clone()).fetch_all(&["alice".into()], &mut m).await.unwrap();
        assert_eq!(stats.fetched, 1);
        assert_eq!(graph.list_calls("alice", ListKind::Followings), 3);
    }

    #[tokio::test]
    async fn abandoned_user_leaves_no_partial_write() {
        let graph = Arc::new(
            MockGraph::new()
                .followers("alice", vec![page(&["a"])])
                .followings("alice", vec![page(&["b"])])
                .fail_first("alice", ListKind::Followings, 1, 404)
                .followers("bob", vec![page(&["c"])])
                .followings("bob", vec![page(&["c"])]),
        );
        let dir = tempfile::tempdir().unwrap();
        let mut m = maps(dir.path());

        let stats = engine(graph.clone())
            .fetch_all(&["alice".into(), "bob".into()], &mut m)
            .await
            .unwrap();

        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.fetched, 1);
        assert!(!m.followers.contains("alice"), "followers half must not be written");
        assert!(!m.followings.contains("alice"));
        assert!(m.is_complete("bob"));

        let reloaded = maps(dir.path());
        assert!(!reloaded.followers.contains("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_workers_share_the_limiter() {
        let mut graph = MockGraph::new();
        let users: Vec<String> = (0..6).map(|i| format!("u{i}")).collect();
        for u in &users {
            graph = graph
                .followers(u, vec![page(&["x"])])
                .followings(u, vec![page(&["x"])]);
        }
        let graph = Arc::new(graph);
        let dir = tempfile::tempdir().unwrap();
        let mut m = maps(dir.path());

        let engine = FetchEngine::builder()
            .graph(graph.clone())
            .limiter(Arc::new(RateLimiter::new(Duration::from_millis(300))))
            .threads(3)
            .checkpoint_every(2)
            .build();
        let stats = engine.fetch_all(&users, &mut m).await.unwrap();

        assert_eq!(stats.fetched, 6);
        assert_eq!(stats.checkpoints, 3);
        let mut starts = graph.call_instants();
        starts.sort();
        assert_eq!(starts.len(), 12);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(300));
        }
    }

    #[test]
    fn purge_removes_empty_large_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = maps(dir.path());
        m.followers.insert("big", vec![]);
        m.followings.insert("big", vec![]);
        m.followers.insert("small", vec![]);
        m.followings.insert("small", vec![]);
        m.followers.insert("real", vec![GraphUser::named("x")]);
        m.followings.insert("real", vec![]);

        let user = |name: &str, followers: u64| User {
            id: name.into(),
            username: name.into(),
            raw_location: None,
            followers_count: followers,
            following_count: 2000,
        };
        let purged = purge_suspect_empty(
            &mut m,
            &[user("big", 4000), user("small", 10), user("real", 4000)],
            1000,
        );

        assert_eq!(purged, vec!["big".to_string()]);
        assert!(!m.followers.contains("big"));
        assert!(m.followers.contains("small"));
        assert!(m.followers.contains("real"));
    }
}
