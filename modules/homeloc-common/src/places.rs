// Static place tables: US states, country-level names, and the username
// keyword table used as the last-resort location heuristic.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

/// (abbreviation, name) for the 50 states plus DC.
const US_STATES: &[(&str, &str)] = &[
    ("AL", "Alabama"),
    ("AK", "Alaska"),
    ("AZ", "Arizona"),
    ("AR", "Arkansas"),
    ("CA", "California"),
    ("CO", "Colorado"),
    ("CT", "Connecticut"),
    ("DE", "Delaware"),
    ("DC", "District Of Columbia"),
    ("FL", "Florida"),
    ("GA", "Georgia"),
    ("HI", "Hawaii"),
    ("ID", "Idaho"),
    ("IL", "Illinois"),
    ("IN", "Indiana"),
    ("IA", "Iowa"),
    ("KS", "Kansas"),
    ("KY", "Kentucky"),
    ("LA", "Louisiana"),
    ("ME", "Maine"),
    ("MD", "Maryland"),
    ("MA", "Massachusetts"),
    ("MI", "Michigan"),
    ("MN", "Minnesota"),
    ("MS", "Mississippi"),
    ("MO", "Missouri"),
    ("MT", "Montana"),
    ("NE", "Nebraska"),
    ("NV", "Nevada"),
    ("NH", "New Hampshire"),
    ("NJ", "New Jersey"),
    ("NM", "New Mexico"),
    ("NY", "New York"),
    ("NC", "North Carolina"),
    ("ND", "North Dakota"),
    ("OH", "Ohio"),
    ("OK", "Oklahoma"),
    ("OR", "Oregon"),
    ("PA", "Pennsylvania"),
    ("RI", "Rhode Island"),
    ("SC", "South Carolina"),
    ("SD", "South Dakota"),
    ("TN", "Tennessee"),
    ("TX", "Texas"),
    ("UT", "Utah"),
    ("VT", "Vermont"),
    ("VA", "Virginia"),
    ("WA", "Washington"),
    ("WV", "West Virginia"),
    ("WI", "Wisconsin"),
    ("WY", "Wyoming"),
];

/// Geocoder outputs that only pin a user to a country.
const COUNTRY_LEVEL: &[&str] = &[
    "United States",
    "United Kingdom",
    "Canada",
    "Australia",
    "India",
    "Deutschland",
    "Danmark",
    "France",
    "Germany",
    "Spain",
    "Italy",
    "Mexico",
    "Brazil",
    "Japan",
    "China",
    "Korea",
    "USA",
    "US",
    "U.S.A.",
];

/// Username substrings that identify a home city. Checked in table order.
const CITY_KEYWORDS: &[(&str, &str)] = &[
    ("kalamazoo", "Kalamazoo, MI"),
    ("battlecreek", "Battle Creek, MI"),
    ("baltimore", "Baltimore, MD"),
    ("buffalo", "Buffalo, NY"),
    ("elpaso", "El Paso, TX"),
    ("el_paso", "El Paso, TX"),
    ("fayetteville", "Fayetteville, NC"),
    ("portland", "Portland, OR"),
    ("rockford", "Rockford, IL"),
    ("sanfrancisco", "San Francisco, CA"),
    ("san_francisco", "San Francisco, CA"),
    ("scranton", "Scranton, PA"),
    ("southbend", "South Bend, IN"),
    ("south_bend", "South Bend, IN"),
];

static STATE_BY_ABBREV: LazyLock<HashMap<&'static str, &'static str>> =
    LazyLock::new(|| US_STATES.iter().copied().collect());

static STATE_BY_NAME_LOWER: LazyLock<HashMap<String, &'static str>> = LazyLock::new(|| {
    US_STATES
        .iter()
        .map(|(abbrev, name)| (name.to_lowercase(), *abbrev))
        .collect()
});

static COUNTRIES: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| COUNTRY_LEVEL.iter().copied().collect());

static STATE_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([A-Z]{2})$").expect("Invalid state suffix regex"));

pub fn is_country(place: &str) -> bool {
    COUNTRIES.contains(place)
}

/// Bare state, by abbreviation (`"MI"`) or full name in any case (`"michigan"`).
pub fn is_bare_state(place: &str) -> bool {
    state_abbrev(place).is_some()
}

/// A geocoded place is vague when it is the unresolved sentinel, a bare
/// country, or a bare state.
pub fn is_vague_location(place: &str) -> bool {
    let place = place.trim();
    place.is_empty()
        || place == crate::types::NON_LOCATION
        || is_country(place)
        || is_bare_state(place)
}

/// US state abbreviation from a `"City, ST"` suffix.
pub fn extract_state(place: &str) -> Option<&'static str> {
    let caps = STATE_SUFFIX_RE.captures(place)?;
    let abbrev = caps.get(1)?.as_str();
    STATE_BY_ABBREV.get_key_value(abbrev).map(|(k, _)| *k)
}

/// Abbreviation for a state given either as `"MI"` or as a full name in any case.
pub fn state_abbrev(part: &str) -> Option<&'static str> {
    let part = part.trim();
    if let Some((abbrev, _)) = STATE_BY_ABBREV.get_key_value(part) {
        return Some(*abbrev);
    }
    STATE_BY_NAME_LOWER.get(&part.to_lowercase()).copied()
}

pub fn state_name(abbrev: &str) -> Option<&'static str> {
    STATE_BY_ABBREV.get(abbrev).copied()
}

/// First city whose keyword appears in the lowercased username.
pub fn match_username(username: &str) -> Option<&'static str> {
    let lower = username.to_lowercase();
    CITY_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, city)| *city)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_and_countries_are_vague() {
        assert!(is_vague_location("Michigan"));
        assert!(is_vague_location("new york"));
        assert!(is_vague_location("MI"));
        assert!(is_vague_location("United States"));
        assert!(is_vague_location("non-location"));
        assert!(!is_vague_location("Kalamazoo, MI"));
        assert!(!is_vague_location("London, United Kingdom"));
    }

    #[test]
    fn state_suffix_requires_known_abbreviation() {
        assert_eq!(extract_state("Kalamazoo, MI"), Some("MI"));
        assert_eq!(extract_state("Somewhere,TX"), Some("TX"));
        assert_eq!(extract_state("Paris, FR"), None);
        assert_eq!(extract_state("Michigan"), None);
    }

    #[test]
    fn state_abbrev_accepts_names_and_codes() {
        assert_eq!(state_abbrev("TX"), Some("TX"));
        assert_eq!(state_abbrev(" new mexico "), Some("NM"));
        assert_eq!(state_abbrev("tx"), None);
        assert_eq!(state_abbrev("Ontario"), None);
    }

    #[test]
    fn state_names_are_title_cased() {
        assert_eq!(state_name("MI"), Some("Michigan"));
        assert_eq!(state_name("NC"), Some("North Carolina"));
        assert_eq!(state_name("ZZ"), None);
    }

    #[test]
    fn username_keywords() {
        assert_eq!(match_username("BuffaloBillsFan"), Some("Buffalo, NY"));
        assert_eq!(match_username("the_san_francisco_guy"), Some("San Francisco, CA"));
        assert_eq!(match_username("randomperson"), None);
    }
}
