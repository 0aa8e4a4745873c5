use std::path::{Path, PathBuf};

use homeloc_common::PipelineConfig;

use crate::chunk::ChunkSpec;
use crate::tiers::Tier;

/// File layout for one cohort's stage outputs.
#[derive(Debug, Clone)]
pub struct CohortPaths {
    cohort: String,
    raw_dir: PathBuf,
    state_dir: PathBuf,
    final_dir: PathBuf,
    posts_file_name: String,
}

impl CohortPaths {
    pub fn new(cohort: &str, config: &PipelineConfig) -> Self {
        Self {
            cohort: cohort.to_string(),
            raw_dir: config.raw_data_dir.clone(),
            state_dir: config.state_dir.clone(),
            final_dir: config.final_dir.clone(),
            posts_file_name: config.posts_file_name.clone(),
        }
    }

    pub fn cohort(&self) -> &str {
        &self.cohort
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn posts(&self) -> PathBuf {
        self.raw_dir.join(&self.cohort).join(&self.posts_file_name)
    }

    fn state_file(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}_{}.json", self.cohort, name))
    }

    pub fn self_reported(&self) -> PathBuf {
        self.state_file("self-reported-location")
    }

    pub fn posts_location(&self) -> PathBuf {
        self.state_file("posts-location")
    }

    pub fn no_location_users(&self) -> PathBuf {
        self.state_file("no-location-users")
    }

    pub fn tier_users(&self, tier: Tier) -> PathBuf {
        match tier {
            Tier::Star => self.state_file("star-users"),
            Tier::Regular => self.state_file("remaining-users"),
        }
    }

    fn network_dir(&self, tier: Tier) -> PathBuf {
        self.raw_dir.join(format!("{}{}", self.cohort, tier.suffix()))
    }

    pub fn followers(&self, tier: Tier) -> PathBuf {
        self.network_dir(tier)
            .join(format!("follower_{}{}.json", self.cohort, tier.suffix()))
    }

    pub fn followings(&self, tier: Tier) -> PathBuf {
        self.network_dir(tier)
            .join(format!("following_{}{}.json", self.cohort, tier.suffix()))
    }

    pub fn friend_info_dir(&self, tier: Tier) -> PathBuf {
        self.state_dir
            .join(format!("{}{}_friend-info", self.cohort, tier.suffix()))
    }

    pub fn friend_location_dir(&self, tier: Tier) -> PathBuf {
        self.state_dir
            .join(format!("{}{}_friend-location", self.cohort, tier.suffix()))
    }

    pub fn geocode_cache(&self) -> PathBuf {
        self.state_dir.join(format!("geocode_cache_{}.json", self.cohort))
    }

    fn analysis_stem(&self, tier: Tier) -> String {
        match tier {
            Tier::Star => format!("{}_star-friend-analysis", self.cohort),
            Tier::Regular => format!("{}_friend-analysis", self.cohort),
        }
    }

    /// Analysis output; chunked runs write `_chunk{i}` siblings.
    pub fn analysis(&self, tier: Tier, chunk: Option<ChunkSpec>) -> PathBuf {
        let stem = self.analysis_stem(tier);
        match chunk {
            Some(c) => self.state_dir.join(format!("{stem}_chunk{}.json", c.index)),
            None => self.state_dir.join(format!("{stem}.json")),
        }
    }

    /// The unchunked analysis file followed by every chunk file present, in
    /// chunk order.
    pub fn analysis_files(&self, tier: Tier) -> std::io::Result<Vec<PathBuf>> {
        let stem = self.analysis_stem(tier);
        let prefix = format!("{stem}_chunk");

        let mut chunks: Vec<(usize, PathBuf)> = Vec::new();
        match std::fs::read_dir(&self.state_dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    let index = name
                        .strip_prefix(&prefix)
                        .and_then(|rest| rest.strip_suffix(".json"))
                        .and_then(|n| n.parse::<usize>().ok());
                    if let Some(index) = index {
                        chunks.push((index, entry.path()));
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        chunks.sort();

        let mut files = vec![self.analysis(tier, None)];
        files.extend(chunks.into_iter().map(|(_, p)| p));
        Ok(files)
    }

    pub fn final_records(&self) -> PathBuf {
        self.final_dir.join(format!("{}_final.json", self.cohort))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(state: &Path) -> CohortPaths {
        let config = PipelineConfig {
            state_dir: state.to_path_buf(),
            ..Default::default()
        };
        CohortPaths::new("buffalo", &config)
    }

    #[test]
    fn tier_suffixes_separate_network_files() {
        let p = paths(Path::new("state"));
        assert_eq!(
            p.followers(Tier::Star),
            Path::new("raw_x_data/buffalo_star/follower_buffalo_star.json")
        );
        assert_eq!(
            p.followings(Tier::Regular),
            Path::new("raw_x_data/buffalo/following_buffalo.json")
        );
        assert_eq!(
            p.friend_info_dir(Tier::Star),
            Path::new("state/buffalo_star_friend-info")
        );
    }

    #[test]
    fn chunk_files_are_discovered_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let p = paths(dir.path());
        for name in [
            "buffalo_friend-analysis_chunk10.json",
            "buffalo_friend-analysis_chunk2.json",
            "buffalo_star-friend-analysis_chunk1.json",
            "buffalo_friend-analysis_chunkX.json",
        ] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }

        let files = p.analysis_files(Tier::Regular).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            vec![
                "buffalo_friend-analysis.json",
                "buffalo_friend-analysis_chunk2.json",
                "buffalo_friend-analysis_chunk10.json",
            ]
        );
    }
}
