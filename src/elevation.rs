use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio_retry::{strategy::FixedInterval, Retry};

use crate::{
    types::{Coordinates, HarvesterError},
    utils::jitter,
};

pub const GOOGLE_ELEVATION_URL: &str = "https://maps.googleapis.com/maps/api/elevation/json";

/// Elevation lookup for a group of points.
#[async_trait]
pub trait ElevationProvider: Send + Sync {
    /// Elevations in metres, aligned with `points`.
    async fn elevation(&self, points: &[Coordinates]) -> anyhow::Result<Vec<f64>>;
}

#[derive(Debug, Deserialize)]
struct ElevationResponse {
    #[serde(default)]
    results: Vec<ElevationResult>,
    status: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ElevationResult {
    elevation: f64,
}

pub struct GoogleElevation {
    client: Client,
    url: String,
    api_key: String,
}

impl GoogleElevation {
    pub fn new(api_key: &str) -> Self {
        Self::with_url(Client::new(), GOOGLE_ELEVATION_URL, api_key)
    }

    pub fn with_url(client: Client, url: &str, api_key: &str) -> Self {
        GoogleElevation {
            client,
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

/// `lat,lng|lat,lng|...` as expected by the `locations` parameter.
pub fn locations_param(points: &[Coordinates]) -> String {
    points
        .iter()
        .map(|p| format!("{},{}", p.latitude, p.longitude))
        .join("|")
}

#[async_trait]
impl ElevationProvider for GoogleElevation {
    async fn elevation(&self, points: &[Coordinates]) -> anyhow::Result<Vec<f64>> {
        let locations = locations_param(points);

        let retry_strategy = FixedInterval::new(Duration::from_millis(250))
            .map(jitter)
            .take(2);
        let res = Retry::spawn(retry_strategy, || {
            self.client
                .get(&self.url)
                .query(&[
                    ("locations", locations.as_str()),
                    ("key", self.api_key.as_str()),
                ])
                .timeout(Duration::from_secs(30))
                .send()
        })
        .await
        .map_err(|e| HarvesterError::EnrichmentCall(format!("elevation request failed: {}", e)))?;

        if res.status() != StatusCode::OK {
            return Err(HarvesterError::EnrichmentCall(format!(
                "elevation returned {}",
                res.status()
            ))
            .into());
        }

        let body = res.json::<ElevationResponse>().await.map_err(|e| {
            HarvesterError::EnrichmentCall(format!("malformed elevation response: {}", e))
        })?;

        match body.status.as_deref() {
            Some("OK") | None => {}
            Some(status) => {
                return Err(HarvesterError::EnrichmentCall(format!(
                    "elevation status {}: {}",
                    status,
                    body.error_message.unwrap_or_default()
                ))
                .into())
            }
        }

        Ok(body.results.into_iter().map(|r| r.elevation).collect())
    }
}
