// Test mocks for the pipeline's two external seams.
//
// - MockGraph (SocialGraph): scripted follower/following pages per username,
//   queued failures (429s, HTTP statuses), profiles (some failing) and a call log with the
//   instant each request started.
// - MockGeocoder (Geocoder): text -> place answers, a failing set, and a call
//   counter for cache-reuse assertions.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use gmaps_geocoder::GeocodeError;
use homeloc_common::{GeocodeResult, User};
use twitterapi_client::{FollowPage, GraphApiError, GraphUser, ListKind};

use crate::traits::{Geocoder, SocialGraph};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// One page of bare accounts (username only).
pub fn page(names: &[&str]) -> Vec<GraphUser> {
    names.iter().map(|n| GraphUser::named(n)).collect()
}

/// One page of accounts with profile locations.
pub fn located_page(entries: &[(&str, &str)]) -> Vec<GraphUser> {
    entries
        .iter()
        .map(|(name, loc)| GraphUser::named(name).with_location(loc))
        .collect()
}

pub fn user(id: &str, username: &str, followers: u64, following: u64) -> User {
    User {
        id: id.to_string(),
        username: username.to_string(),
        raw_location: None,
        followers_count: followers,
        following_count: following,
    }
}

// ---------------------------------------------------------------------------
// MockGraph
// ---------------------------------------------------------------------------

type ListKey = (String, ListKind);

/// Pages are addressed by cursor = page index, so pagination runs through the
/// same `continuation()` logic as the real client. Unregistered usernames get
/// a 404.
#[derive(Default)]
pub struct MockGraph {
    lists: HashMap<ListKey, Vec<Vec<GraphUser>>>,
    profiles: HashMap<String, GraphUser>,
    failing_profiles: HashSet<String>,
    interrupts: Mutex<HashMap<ListKey, VecDeque<GraphApiError>>>,
    list_calls: Mutex<Vec<ListKey>>,
    profile_calls: Mutex<Vec<String>>,
    instants: Mutex<Vec<Instant>>,
}

impl MockGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn followers(mut self, username: &str, pages: Vec<Vec<GraphUser>>) -> Self {
        self.lists.insert((username.to_string(), ListKind::Followers), pages);
        self
    }

    pub fn followings(mut self, username: &str, pages: Vec<Vec<GraphUser>>) -> Self {
        self.lists.insert((username.to_string(), ListKind::Followings), pages);
        self
    }

    pub fn profile(mut self, profile: GraphUser) -> Self {
        if let Some(name) = profile.user_name.clone() {
            self.profiles.insert(name, profile);
        }
        self
    }

    /// Every profile lookup of `username` answers 403.
    pub fn failing_profile(mut self, username: &str) -> Self {
        self.failing_profiles.insert(username.to_string());
        self
    }

    /// The next `n` requests for this list answer 429.
    pub fn rate_limit_first(self, username: &str, kind: ListKind, n: usize, retry_after: Option<Duration>) -> Self {
        self.interrupt(username, kind, n, || GraphApiError::RateLimited { retry_after })
    }

    /// The next `n` requests for this list answer with `status`.
    pub fn fail_first(self, username: &str, kind: ListKind, n: usize, status: u16) -> Self {
        self.interrupt(username, kind, n, || GraphApiError::Api {
            status,
            message: "scripted failure".to_string(),
        })
    }

    fn interrupt(mut self, username: &str, kind: ListKind, n: usize, make: impl Fn() -> GraphApiError) -> Self {
        let queue = self
            .interrupts
            .get_mut()
            .unwrap()
            .entry((username.to_string(), kind))
            .or_default();
        for _ in 0..n {
            queue.push_back(make());
        }
        self
    }

    pub fn list_calls(&self, username: &str, kind: ListKind) -> usize {
        self.list_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, k)| u == username && *k == kind)
            .count()
    }

    pub fn profile_calls(&self) -> Vec<String> {
        self.profile_calls.lock().unwrap().clone()
    }

    pub fn total_calls(&self) -> usize {
        self.list_calls.lock().unwrap().len() + self.profile_calls.lock().unwrap().len()
    }

    /// Start instant of every request, in call order.
    pub fn call_instants(&self) -> Vec<Instant> {
        self.instants.lock().unwrap().clone()
    }

    fn serve(&self, kind: ListKind, username: &str, cursor: Option<&str>) -> Result<FollowPage, GraphApiError> {
        let key = (username.to_string(), kind);
        self.list_calls.lock().unwrap().push(key.clone());
        self.instants.lock().unwrap().push(Instant::now());

        if let Some(err) = self
            .interrupts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|q| q.pop_front())
        {
            return Err(err);
        }

        let pages = self.lists.get(&key).ok_or_else(|| GraphApiError::Api {
            status: 404,
            message: format!("MockGraph: no {kind} registered for {username}"),
        })?;
        let index: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let users = pages.get(index).cloned().unwrap_or_default();
        let has_next = index + 1 < pages.len();
        Ok(FollowPage {
            users,
            has_next,
            next_cursor: has_next.then(|| (index + 1).to_string()),
        })
    }
}

#[async_trait]
impl SocialGraph for MockGraph {
    async fn list_followers(&self, username: &str, cursor: Option<&str>) -> Result<FollowPage, GraphApiError> {
        self.serve(ListKind::Followers, username, cursor)
    }

    async fn list_followings(&self, username: &str, cursor: Option<&str>) -> Result<FollowPage, GraphApiError> {
        self.serve(ListKind::Followings, username, cursor)
    }

    async fn get_profile(&self, username: &str) -> Result<Option<GraphUser>, GraphApiError> {
        self.profile_calls.lock().unwrap().push(username.to_string());
        self.instants.lock().unwrap().push(Instant::now());
        if self.failing_profiles.contains(username) {
            return Err(GraphApiError::Api {
                status: 403,
                message: "scripted failure".to_string(),
            });
        }
        Ok(self.profiles.get(username).cloned())
    }
}

// ---------------------------------------------------------------------------
// MockGeocoder
// ---------------------------------------------------------------------------

/// Unregistered text resolves to `NonLocation`.
#[derive(Default)]
pub struct MockGeocoder {
    answers: HashMap<String, GeocodeResult>,
    failing: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl MockGeocoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, text: &str, place: &str) -> Self {
        self.answers
            .insert(text.to_string(), GeocodeResult::Place(place.to_string()));
        self
    }

    /// Every lookup of `text` fails with a non-retryable error.
    pub fn failing(mut self, text: &str) -> Self {
        self.failing.insert(text.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, text: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|t| *t == text).count()
    }
}

#[async_trait]
impl Geocoder for MockGeocoder {
    async fn geocode(&self, text: &str) -> Result<GeocodeResult, GeocodeError> {
        self.calls.lock().unwrap().push(text.to_string());
        if self.failing.contains(text) {
            return Err(GeocodeError::Api {
                status: "REQUEST_DENIED".to_string(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(self
            .answers
            .get(text)
            .cloned()
            .unwrap_or(GeocodeResult::NonLocation))
    }
}
