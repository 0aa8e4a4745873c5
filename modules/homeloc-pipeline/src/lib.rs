pub mod chunk;
pub mod evidence;
pub mod fetch;
pub mod friends;
pub mod geocode_cache;
pub mod inference;
pub mod merge;
pub mod paths;
pub mod rate_limit;
pub mod retry;
pub mod runner;
pub mod self_report;
pub mod store;
pub mod tiers;
pub mod traits;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use chunk::ChunkSpec;
pub use runner::{CohortRunner, PipelineDeps, RunOptions, Stage};
pub use tiers::Tier;
pub use traits::{Geocoder, SocialGraph};
