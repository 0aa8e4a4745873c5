use std::collections::BTreeMap;
use std::fmt;

use tracing::info;

use homeloc_common::User;

/// Processing tier for users that still need network evidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// High-degree accounts: capped fetches, skipped above the follower ceiling.
    Star,
    Regular,
}

impl Tier {
    pub const ALL: [Tier; 2] = [Tier::Star, Tier::Regular];

    /// Suffix appended to the cohort name for this tier's network files.
    pub fn suffix(&self) -> &'static str {
        match self {
            Tier::Star => "_star",
            Tier::Regular => "",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Star => "star",
            Tier::Regular => "regular",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "star" => Ok(Tier::Star),
            "regular" | "remaining" => Ok(Tier::Regular),
            other => Err(format!("unknown user type: {other}")),
        }
    }
}

/// Star when both counts strictly exceed `threshold`.
pub fn tier_of(user: &User, threshold: u64) -> Tier {
    if user.followers_count > threshold && user.following_count > threshold {
        Tier::Star
    } else {
        Tier::Regular
    }
}

#[derive(Debug, Default)]
pub struct TierSplit {
    pub star: BTreeMap<String, User>,
    pub regular: BTreeMap<String, User>,
}

impl TierSplit {
    pub fn get(&self, tier: Tier) -> &BTreeMap<String, User> {
        match tier {
            Tier::Star => &self.star,
            Tier::Regular => &self.regular,
        }
    }
}

pub fn classify_tiers(users: impl IntoIterator<Item = User>, threshold: u64) -> TierSplit {
    let mut split = TierSplit::default();
    for user in users {
        match tier_of(&user, threshold) {
            Tier::Star => split.star.insert(user.id.clone(), user),
            Tier::Regular => split.regular.insert(user.id.clone(), user),
        };
    }
    info!(
        star = split.star.len(),
        regular = split.regular.len(),
        threshold,
        "Users classified into tiers"
    );
    split
}

/// Star users above the follower ceiling are skipped this run and stay unresolved.
pub fn star_eligible(user: &User, follower_ceiling: u64) -> bool {
    user.followers_count <= follower_ceiling
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str, followers: u64, following: u64) -> User {
        User {
            id: id.into(),
            username: format!("user{id}"),
            raw_location: None,
            followers_count: followers,
            following_count: following,
        }
    }

    #[test]
    fn star_requires_both_counts_above_threshold() {
        let split = classify_tiers(
            vec![
                user("1", 1001, 1001),
                user("2", 1000, 5000),
                user("3", 5000, 10),
                user("4", 2000, 1500),
            ],
            1000,
        );
        assert_eq!(split.star.keys().collect::<Vec<_>>(), vec!["1", "4"]);
        assert_eq!(split.regular.len(), 2);
    }

    #[test]
    fn ceiling_guards_star_fetches() {
        assert!(star_eligible(&user("1", 5000, 2000), 5000));
        assert!(!star_eligible(&user("1", 5001, 2000), 5000));
    }
}
