// Trait seams for the two external collaborators.
//
// SocialGraph: paginated follower/following listings plus profile lookup.
// Geocoder: free text to a standardized place or the non-location sentinel.
//
// The real clients implement these below; testing.rs provides scripted mocks.

use async_trait::async_trait;

use gmaps_geocoder::{GeocodeError, GoogleGeocoder};
use homeloc_common::GeocodeResult;
use twitterapi_client::{FollowPage, GraphApiError, GraphUser, ListKind, TwitterApiClient};

// ---------------------------------------------------------------------------
// SocialGraph
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SocialGraph: Send + Sync {
    async fn list_followers(
        &self,
        username: &str,
        cursor: Option<&str>,
    ) -> Result<FollowPage, GraphApiError>;

    async fn list_followings(
        &self,
        username: &str,
        cursor: Option<&str>,
    ) -> Result<FollowPage, GraphApiError>;

    /// `Ok(None)` when the account does not exist.
    async fn get_profile(&self, username: &str) -> Result<Option<GraphUser>, GraphApiError>;

    async fn list(
        &self,
        kind: ListKind,
        username: &str,
        cursor: Option<&str>,
    ) -> Result<FollowPage, GraphApiError> {
        match kind {
            ListKind::Followers => self.list_followers(username, cursor).await,
            ListKind::Followings => self.list_followings(username, cursor).await,
        }
    }
}

#[async_trait]
impl SocialGraph for TwitterApiClient {
    async fn list_followers(
        &self,
        username: &str,
        cursor: Option<&str>,
    ) -> Result<FollowPage, GraphApiError> {
        TwitterApiClient::list_followers(self, username, cursor).await
    }

    async fn list_followings(
        &self,
        username: &str,
        cursor: Option<&str>,
    ) -> Result<FollowPage, GraphApiError> {
        TwitterApiClient::list_followings(self, username, cursor).await
    }

    async fn get_profile(&self, username: &str) -> Result<Option<GraphUser>, GraphApiError> {
        TwitterApiClient::get_profile(self, username).await
    }
}

// ---------------------------------------------------------------------------
// Geocoder
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// A miss is `Ok(GeocodeResult::NonLocation)`, not an error.
    async fn geocode(&self, text: &str) -> Result<GeocodeResult, GeocodeError>;
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    async fn geocode(&self, text: &str) -> Result<GeocodeResult, GeocodeError> {
        Ok(GoogleGeocoder::geocode(self, text).await?.into())
    }
}
