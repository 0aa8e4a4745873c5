pub mod error;
pub mod types;

use std::time::Duration;

pub use error::{GeocodeError, Result};
pub use types::{AddressComponent, GeocodeResponse, GeocodeResult};

const BASE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub struct GoogleGeocoder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GoogleGeocoder {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key,
            base_url,
        }
    }

    /// Geocode free text into a standardized place string.
    ///
    /// Returns `Ok(None)` when the text does not resolve to anything usable.
    /// Only the first (best) result is considered.
    pub async fn geocode(&self, text: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .get(&self.base_url)
            .query(&[("address", text), ("key", self.api_key.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GeocodeError::Http {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        let body: GeocodeResponse = resp.json().await?;
        match body.status.as_str() {
            "OK" => Ok(body.results.first().and_then(standardize)),
            "ZERO_RESULTS" => Ok(None),
            other => Err(GeocodeError::Api {
                status: other.to_string(),
                message: body.error_message.unwrap_or_default(),
            }),
        }
    }
}

/// Reduce a geocoding result to a canonical place string.
///
/// - US city with a state: `"Kalamazoo, MI"`
/// - US city, state unknown: `"Kalamazoo, USA"`
/// - other city: `"London, United Kingdom"`
/// - country only: `"Canada"`
///
/// A locality wins over the county (`administrative_area_level_2`) when both
/// are present.
pub fn standardize(result: &GeocodeResult) -> Option<String> {
    let mut locality = None;
    let mut county = None;
    let mut state_code = None;
    let mut country = None;
    let mut country_code = None;

    for component in &result.address_components {
        if component.has_type("locality") {
            locality = Some(component.long_name.as_str());
        } else if component.has_type("administrative_area_level_2") {
            county = Some(component.long_name.as_str());
        } else if component.has_type("administrative_area_level_1") {
            state_code = Some(component.short_name.as_str());
        } else if component.has_type("country") {
            country = Some(component.long_name.as_str());
            country_code = Some(component.short_name.as_str());
        }
    }

    let city = locality.or(county);
    match (city, country) {
        (Some(city), _) if country_code == Some("US") => {
            let state = state_code.filter(|s| s.len() == 2 && s.chars().all(|c| c.is_ascii_uppercase()));
            Some(match state {
                Some(state) => format!("{city}, {state}"),
                None => format!("{city}, USA"),
            })
        }
        (Some(city), Some(country)) => Some(format!("{city}, {country}")),
        (None, Some(country)) => Some(country.to_string()),
        _ => None,
    }
}
