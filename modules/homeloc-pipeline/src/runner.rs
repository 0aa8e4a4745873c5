// Stage orchestration for one cohort.
//
// Every stage reads its inputs from the cohort's state files and writes its
// outputs back, so any stage can be run alone and a whole run can resume
// after a crash from the last checkpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;
use typed_builder::TypedBuilder;

use homeloc_common::{PipelineConfig, SelfReportedLocation, User};

use crate::chunk::ChunkSpec;
use crate::evidence::{self, Evidence, PostsStats, SignalThresholds};
use crate::fetch::{purge_suspect_empty, FetchEngine, FetchStats, NetworkMaps};
use crate::friends::{write_friend_profiles, FriendStats};
use crate::geocode_cache::{geocode_friend_locations, GeocodeCache, GeocodeResolver, GeocodeStats};
use crate::inference::{analyze_users, InferenceStats, InferenceThresholds};
use crate::merge::{merge, MergeInputs, MergeStats};
use crate::paths::CohortPaths;
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;
use crate::self_report::{classify_self_reports, SelfReportStats};
use crate::store::{read_json, write_json_atomic, JsonMapStore};
use crate::tiers::{classify_tiers, star_eligible, Tier, TierSplit};
use crate::traits::{Geocoder, SocialGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Stage {
    SelfReport,
    Posts,
    Tiers,
    Fetch,
    Friends,
    Geocode,
    Analyze,
    Merge,
}

impl Stage {
    /// Stages that run once per tier.
    pub fn is_per_tier(&self) -> bool {
        matches!(
            self,
            Stage::Fetch | Stage::Friends | Stage::Geocode | Stage::Analyze
        )
    }
}

/// External collaborators and tunables shared by every cohort of a run.
///
/// One RateLimiter serves all cohorts so the request spacing holds across
/// the whole process.
#[derive(TypedBuilder)]
pub struct PipelineDeps {
    pub config: PipelineConfig,
    pub graph: Arc<dyn SocialGraph>,
    pub geocoder: Arc<dyn Geocoder>,
    #[builder(default = Arc::new(RateLimiter::new(config.min_request_interval())))]
    pub limiter: Arc<RateLimiter>,
}

/// Which slice of the pipeline to run for a cohort.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// `None` runs every stage in order.
    pub stage: Option<Stage>,
    /// `None` runs both tiers for per-tier stages.
    pub tier: Option<Tier>,
    pub chunk: Option<ChunkSpec>,
}

pub struct CohortRunner<'a> {
    deps: &'a PipelineDeps,
    paths: CohortPaths,
}

impl<'a> CohortRunner<'a> {
    pub fn new(cohort: &str, deps: &'a PipelineDeps) -> Self {
        Self {
            deps,
            paths: CohortPaths::new(cohort, &deps.config),
        }
    }

    pub fn paths(&self) -> &CohortPaths {
        &self.paths
    }

    fn config(&self) -> &PipelineConfig {
        &self.deps.config
    }

    fn cohort(&self) -> &str {
        self.paths.cohort()
    }

    pub async fn run(&self, options: RunOptions) -> Result<()> {
        let tiers: Vec<Tier> = match options.tier {
            Some(t) => vec![t],
            None => Tier::ALL.to_vec(),
        };

        let Some(stage) = options.stage else {
            return self.run_all(&tiers, options.chunk).await;
        };

        if stage.is_per_tier() {
            for &tier in &tiers {
                self.run_tier_stage(stage, tier, options.chunk).await?;
            }
            return Ok(());
        }

        match stage {
            Stage::SelfReport => {
                let evidence = self.load_evidence()?;
                self.self_report(&evidence).await?;
            }
            Stage::Posts => {
                let evidence = self.load_evidence()?;
                self.posts(&evidence)?;
            }
            Stage::Tiers => {
                self.tiers(None)?;
            }
            Stage::Merge => {
                self.merge(None)?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn run_all(&self, tiers: &[Tier], chunk: Option<ChunkSpec>) -> Result<()> {
        info!(cohort = self.cohort(), "Running all stages");
        let evidence = self.load_evidence()?;
        self.self_report(&evidence).await?;
        self.posts(&evidence)?;
        self.tiers(Some(&evidence))?;

        for &tier in tiers {
            for stage in [Stage::Fetch, Stage::Friends, Stage::Geocode, Stage::Analyze] {
                self.run_tier_stage(stage, tier, chunk).await?;
            }
        }

        self.merge(Some(&evidence))?;
        Ok(())
    }

    async fn run_tier_stage(&self, stage: Stage, tier: Tier, chunk: Option<ChunkSpec>) -> Result<()> {
        match stage {
            Stage::Fetch => {
                self.fetch(tier, chunk).await?;
            }
            Stage::Friends => {
                self.friends(tier, chunk).await?;
            }
            Stage::Geocode => {
                self.geocode(tier, chunk).await?;
            }
            Stage::Analyze => {
                self.analyze(tier, chunk)?;
            }
            _ => {}
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Evidence stages
    // -----------------------------------------------------------------------

    pub fn load_evidence(&self) -> Result<Evidence> {
        let posts = evidence::load_posts(&self.paths.posts())?;
        let evidence = evidence::extract_evidence(&posts, self.config().text_min_probability);
        info!(
            cohort = self.cohort(),
            posts = posts.len(),
            users = evidence.len(),
            "Evidence extracted"
        );
        Ok(evidence)
    }

    fn resolver(&self) -> GeocodeResolver<'_> {
        GeocodeResolver::new(
            &*self.deps.geocoder,
            RetryPolicy::from(&self.config().geocoder_retry),
            self.config().geocode_checkpoint_every,
        )
    }

    fn load_cache(&self) -> Result<GeocodeCache> {
        GeocodeCache::load(self.paths.state_dir(), self.paths.geocode_cache())
    }

    pub async fn self_report(&self, evidence: &Evidence) -> Result<SelfReportStats> {
        let mut store: JsonMapStore<SelfReportedLocation> = JsonMapStore::load(self.paths.self_reported())?;
        let mut cache = self.load_cache()?;
        let outcome = classify_self_reports(
            evidence.users(),
            &mut store,
            &mut cache,
            &self.resolver(),
            self.config().self_report_checkpoint_every,
        )
        .await?;
        info!(cohort = self.cohort(), "{}", outcome.stats);
        Ok(outcome.stats)
    }

    fn self_reported_ids(&self) -> Result<BTreeSet<String>> {
        let reported: BTreeMap<String, SelfReportedLocation> =
            read_json(&self.paths.self_reported())?.unwrap_or_default();
        Ok(reported.into_keys().collect())
    }

    pub fn posts(&self, evidence: &Evidence) -> Result<PostsStats> {
        let reported = self.self_reported_ids()?;
        let outcome = evidence::locate_from_posts(evidence, &reported, &SignalThresholds::from(self.config()));
        write_json_atomic(&self.paths.posts_location(), &outcome.located)?;
        write_json_atomic(&self.paths.no_location_users(), &outcome.unlocated)?;
        info!(cohort = self.cohort(), "{}", outcome.stats);
        Ok(outcome.stats)
    }

    /// Split users without a location into tiers.
    ///
    /// Reads the no-location file written by the posts stage. When it is
    /// missing, falls back to every posts user without a self-report.
    pub fn tiers(&self, evidence: Option<&Evidence>) -> Result<TierSplit> {
        let unlocated: BTreeMap<String, User> = match read_json(&self.paths.no_location_users())? {
            Some(users) => users,
            None => {
                info!(cohort = self.cohort(), "No-location file missing, using posts users without a self-report");
                let loaded;
                let evidence = match evidence {
                    Some(e) => e,
                    None => {
                        loaded = self.load_evidence()?;
                        &loaded
                    }
                };
                let reported = self.self_reported_ids()?;
                evidence
                    .users()
                    .filter(|u| !reported.contains(&u.id))
                    .map(|u| (u.id.clone(), u.clone()))
                    .collect()
            }
        };

        let split = classify_tiers(unlocated.into_values(), self.config().star_threshold);
        write_json_atomic(&self.paths.tier_users(Tier::Star), &split.star)?;
        write_json_atomic(&self.paths.tier_users(Tier::Regular), &split.regular)?;
        Ok(split)
    }

    // -----------------------------------------------------------------------
    // Network stages
    // -----------------------------------------------------------------------

    /// The tier's users in stored order, sliced to `chunk`. Star users above
    /// the follower ceiling are dropped after slicing so chunk boundaries do
    /// not move when the ceiling changes.
    pub fn tier_users(&self, tier: Tier, chunk: Option<ChunkSpec>) -> Result<Vec<User>> {
        let stored: BTreeMap<String, User> = read_json(&self.paths.tier_users(tier))?.unwrap_or_default();
        let all: Vec<User> = stored.into_values().collect();
        let slice = match chunk {
            Some(c) => c.slice(&all),
            None => &all[..],
        };

        let mut users = slice.to_vec();
        if tier == Tier::Star {
            let before = users.len();
            let ceiling = self.config().star_follower_ceiling;
            users.retain(|u| star_eligible(u, ceiling));
            if users.len() < before {
                info!(
                    cohort = self.cohort(),
                    skipped = before - users.len(),
                    ceiling,
                    "Star users above the follower ceiling skipped"
                );
            }
        }
        Ok(users)
    }

    fn usernames(users: &[User]) -> Vec<String> {
        users
            .iter()
            .filter(|u| !u.username.is_empty())
            .map(|u| u.username.clone())
            .collect()
    }

    fn engine(&self, tier: Tier) -> FetchEngine {
        let config = self.config();
        FetchEngine::builder()
            .graph(self.deps.graph.clone())
            .limiter(self.deps.limiter.clone())
            .retry(RetryPolicy::from(&config.graph_retry))
            .threads(config.threads)
            .max_per_user(match tier {
                Tier::Star => Some(config.star_max_fetch),
                Tier::Regular => None,
            })
            .checkpoint_every(config.checkpoint_every())
            .rate_limit_fallback(Duration::from_secs(config.rate_limit_fallback_secs))
            .rate_limit_margin(Duration::from_secs(config.rate_limit_margin_secs))
            .build()
    }

    fn network_maps(&self, tier: Tier) -> Result<NetworkMaps> {
        NetworkMaps::load(&self.paths.followers(tier), &self.paths.followings(tier))
    }

    pub async fn fetch(&self, tier: Tier, chunk: Option<ChunkSpec>) -> Result<FetchStats> {
        let users = self.tier_users(tier, chunk)?;
        let mut maps = self.network_maps(tier)?;
        info!(cohort = self.cohort(), %tier, chunk = ?chunk.map(|c| c.to_string()), users = users.len(), "Fetch stage");

        let mut stats = self.engine(tier).fetch_all(&Self::usernames(&users), &mut maps).await?;

        if tier == Tier::Star {
            let purged = purge_suspect_empty(&mut maps, &users, self.config().suspect_empty_threshold);
            if !purged.is_empty() {
                maps.persist()?;
            }
            stats.purged = purged.len();
        }
        info!(cohort = self.cohort(), %tier, "{stats}");
        Ok(stats)
    }

    pub async fn friends(&self, tier: Tier, chunk: Option<ChunkSpec>) -> Result<FriendStats> {
        let users = self.tier_users(tier, chunk)?;
        let maps = self.network_maps(tier)?;
        let engine = self.engine(tier);
        let lookup = self.config().fetch_missing_profiles.then_some(&engine);

        let stats = write_friend_profiles(
            &Self::usernames(&users),
            &maps,
            &self.paths.friend_info_dir(tier),
            lookup,
        )
        .await?;
        info!(cohort = self.cohort(), %tier, "{stats}");
        Ok(stats)
    }

    pub async fn geocode(&self, tier: Tier, chunk: Option<ChunkSpec>) -> Result<GeocodeStats> {
        let users = self.tier_users(tier, chunk)?;
        let mut cache = self.load_cache()?;
        let stats = geocode_friend_locations(
            &Self::usernames(&users),
            &self.paths.friend_info_dir(tier),
            &self.paths.friend_location_dir(tier),
            &mut cache,
            &self.resolver(),
        )
        .await?;
        info!(cohort = self.cohort(), %tier, "{stats}");
        Ok(stats)
    }

    pub fn analyze(&self, tier: Tier, chunk: Option<ChunkSpec>) -> Result<InferenceStats> {
        let users = self.tier_users(tier, chunk)?;
        let stats = analyze_users(
            &Self::usernames(&users),
            &self.paths.friend_location_dir(tier),
            &self.paths.analysis(tier, chunk),
            &InferenceThresholds::from(self.config()),
        )?;
        info!(cohort = self.cohort(), %tier, "{stats}");
        Ok(stats)
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    pub fn merge(&self, evidence: Option<&Evidence>) -> Result<MergeStats> {
        let mut inputs = MergeInputs::load(&self.paths)?;

        // Posts snapshots carry follower counts for self-reported users.
        match evidence {
            Some(e) => inputs.users.extend(e.users().cloned()),
            None if self.paths.posts().exists() => {
                inputs.users.extend(self.load_evidence()?.users().cloned());
            }
            None => {}
        }

        let (records, stats) = merge(&inputs);
        write_json_atomic(&self.paths.final_records(), &records)?;
        info!(cohort = self.cohort(), records = records.len(), "{stats}");
        Ok(stats)
    }
}

// ---------------------------------------------------------------------------
// Chunk preview
// ---------------------------------------------------------------------------

/// `[start, end)` of every chunk of each tier's user list. Reads only the
/// tier files.
pub fn preview_chunks(paths: &CohortPaths, count: usize) -> Result<Vec<(Tier, ChunkSpec, Range<usize>)>> {
    let specs = ChunkSpec::all(count)?;
    let mut out = Vec::new();
    for tier in Tier::ALL {
        let stored: BTreeMap<String, User> = read_json(&paths.tier_users(tier))?.unwrap_or_default();
        let len = stored.len();
        for spec in &specs {
            let range = spec.range(len);
            info!(
                cohort = paths.cohort(),
                %tier,
                chunk = %spec,
                start = range.start,
                end = range.end,
                size = range.len(),
                "Chunk"
            );
            out.push((tier, *spec, range));
        }
    }
    Ok(out)
}
