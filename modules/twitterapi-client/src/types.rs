use serde::{Deserialize, Serialize};

/// A user entry as returned inside follower/following pages and profile lookups.
///
/// Only the fields the location pipeline reads are modeled. `location` is
/// `None` when the field is missing entirely, which is distinct from an empty
/// string the user typed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphUser {
    #[serde(rename = "userName", alias = "screen_name", default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "followers_count", alias = "followers", default)]
    pub followers_count: Option<u64>,
    #[serde(rename = "following_count", alias = "following", default)]
    pub following_count: Option<u64>,
}

impl GraphUser {
    pub fn named(user_name: &str) -> Self {
        Self {
            user_name: Some(user_name.to_string()),
            ..Default::default()
        }
    }

    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }
}

/// Which side of the follow graph a page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Followers,
    Followings,
}

impl ListKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListKind::Followers => "followers",
            ListKind::Followings => "followings",
        }
    }
}

impl std::fmt::Display for ListKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page of a follower or following listing, normalized across both endpoints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FollowPage {
    pub users: Vec<GraphUser>,
    pub has_next: bool,
    pub next_cursor: Option<String>,
}

impl FollowPage {
    /// The cursor to request next, if pagination should continue.
    /// The API signals the end with a missing, empty, or `"0"` cursor.
    pub fn continuation(&self) -> Option<&str> {
        if !self.has_next {
            return None;
        }
        match self.next_cursor.as_deref() {
            Some(c) if !c.is_empty() && c != "0" => Some(c),
            _ => None,
        }
    }
}

// --- Wire types ---

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FollowersResponse {
    #[serde(default)]
    pub followers: Vec<GraphUser>,
    #[serde(default)]
    pub has_next_page: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct FollowingsResponse {
    #[serde(default)]
    pub followings: Vec<GraphUser>,
    #[serde(default)]
    pub has_next_page: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

impl From<FollowersResponse> for FollowPage {
    fn from(r: FollowersResponse) -> Self {
        Self {
            users: r.followers,
            has_next: r.has_next_page,
            next_cursor: r.next_cursor,
        }
    }
}

impl From<FollowingsResponse> for FollowPage {
    fn from(r: FollowingsResponse) -> Self {
        Self {
            users: r.followings,
            has_next: r.has_next_page,
            next_cursor: r.next_cursor,
        }
    }
}

/// Profile lookups come back either wrapped (`{"status": .., "data": {..}}`) or bare.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ProfileResponse {
    Wrapped { data: GraphUser },
    Bare(GraphUser),
}

impl ProfileResponse {
    /// A response without a username (e.g. `"data": null`) means no such profile.
    pub fn into_user(self) -> Option<GraphUser> {
        let user = match self {
            ProfileResponse::Wrapped { data } => data,
            ProfileResponse::Bare(user) => user,
        };
        user.user_name.is_some().then_some(user)
    }
}
