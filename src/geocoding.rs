use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_retry::{strategy::FixedInterval, Retry};

use crate::{
    types::{Coordinates, HarvesterError},
    utils::{jitter, split_postal_code_city, USER_AGENT},
};

pub const MAPBOX_BATCH_URL: &str = "https://api.mapbox.com/search/geocode/v6/batch";
pub const MAPBOX_BATCH_LIMIT: usize = 1000;
pub const DETAIL_PAGE_BATCH_LIMIT: usize = 50;

/// A structured address as sent to the geocoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Address {
    pub address_line1: String,
    pub postcode: String,
    pub place: String,
    /// Detail page of the listing at this address.
    #[serde(skip)]
    pub link: Option<String>,
}

impl Address {
    /// Builds an address from a street line and a `"1234 AB City"` line.
    pub fn parse(street_name: &str, postal_code_city: &str) -> Result<Self, HarvesterError> {
        let street = street_name.trim();
        if street.is_empty() {
            return Err(HarvesterError::AddressParse(format!(
                "empty street for {:?}",
                postal_code_city
            )));
        }

        let (postcode, place) = split_postal_code_city(postal_code_city);
        let mut groups = postcode.split(' ');
        let digits = groups.next().unwrap_or_default();
        let letters = groups.next().unwrap_or_default();
        if digits.len() != 4
            || !digits.chars().all(|c| c.is_ascii_digit())
            || letters.len() != 2
            || !letters.chars().all(|c| c.is_ascii_alphabetic())
            || place.is_empty()
        {
            return Err(HarvesterError::AddressParse(format!(
                "incomplete postal code or place in {:?}",
                postal_code_city
            )));
        }

        Ok(Address {
            address_line1: street.to_string(),
            postcode,
            place,
            link: None,
        })
    }

    pub fn with_link(mut self, link: &str) -> Self {
        self.link = Some(link.to_string());
        self
    }
}

/// Forward geocoding of addresses in batches.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Largest number of addresses accepted in one call.
    fn batch_limit(&self) -> usize;

    /// Results are aligned with `addresses`; `None` marks an address without a match.
    async fn geocode(&self, addresses: &[Address]) -> anyhow::Result<Vec<Option<Coordinates>>>;
}

#[derive(Debug, Serialize)]
struct BatchQuery<'a> {
    #[serde(flatten)]
    address: &'a Address,
    country: &'a str,
    limit: u8,
}

#[derive(Debug, Deserialize)]
struct BatchResponse {
    batch: Vec<FeatureCollection>,
}

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    properties: FeatureProperties,
}

#[derive(Debug, Deserialize)]
struct FeatureProperties {
    coordinates: FeatureCoordinates,
}

#[derive(Debug, Deserialize)]
struct FeatureCoordinates {
    latitude: f64,
    longitude: f64,
}

pub struct MapboxGeocoder {
    client: Client,
    url: String,
    access_token: String,
    country: String,
}

impl MapboxGeocoder {
    pub fn new(access_token: &str) -> Self {
        Self::with_url(Client::new(), MAPBOX_BATCH_URL, access_token)
    }

    pub fn with_url(client: Client, url: &str, access_token: &str) -> Self {
        MapboxGeocoder {
            client,
            url: url.into(),
            access_token: access_token.into(),
            country: "nl".into(),
        }
    }
}

#[async_trait]
impl Geocoder for MapboxGeocoder {
    fn batch_limit(&self) -> usize {
        MAPBOX_BATCH_LIMIT
    }

    async fn geocode(&self, addresses: &[Address]) -> anyhow::Result<Vec<Option<Coordinates>>> {
        let queries = addresses
            .iter()
            .map(|address| BatchQuery {
                address,
                country: &self.country,
                limit: 1,
            })
            .collect::<Vec<BatchQuery>>();

        let retry_strategy = FixedInterval::new(Duration::from_millis(250))
            .map(jitter)
            .take(2);
        let res = Retry::spawn(retry_strategy, || {
            self.client
                .post(&self.url)
                .query(&[("access_token", self.access_token.as_str())])
                .json(&queries)
                .timeout(Duration::from_secs(60))
                .send()
        })
        .await
        .map_err(|e| HarvesterError::EnrichmentCall(format!("geocoding request failed: {}", e)))?;

        if res.status() != StatusCode::OK {
            let status = res.status();
            return Err(HarvesterError::EnrichmentCall(format!(
                "geocoding returned {}: {}",
                status,
                res.text().await.unwrap_or_default()
            ))
            .into());
        }

        let body = res.json::<BatchResponse>().await.map_err(|e| {
            HarvesterError::EnrichmentCall(format!("malformed geocoding response: {}", e))
        })?;

        if body.batch.len() != addresses.len() {
            warn!(
                "geocoding returned {} results for {} addresses",
                body.batch.len(),
                addresses.len()
            );
        }

        Ok(body
            .batch
            .into_iter()
            .map(|collection| {
                collection
                    .features
                    .into_iter()
                    .next()
                    .map(|f| {
                        Coordinates::new(
                            f.properties.coordinates.latitude,
                            f.properties.coordinates.longitude,
                        )
                    })
                    .filter(Coordinates::is_valid)
            })
            .collect())
    }
}

/// Cuts the map position out of a listing detail page, where it follows
/// a `{"Latitude":..,"Longitude":..}` key object as `},lat,lng,`.
pub fn parse_detail_coordinates(html: &str) -> Option<Coordinates> {
    let start = html.find(r#"{"Latitude""#)?;
    let rest = &html[start..];
    let values = &rest[rest.find("},")? + 2..];
    let mut numbers = values.splitn(3, ',');
    let latitude = numbers.next()?.trim().parse::<f64>().ok()?;
    let longitude = numbers.next()?.trim().parse::<f64>().ok()?;
    Some(Coordinates::new(latitude, longitude)).filter(Coordinates::is_valid)
}

/// Reads coordinates from each listing's own detail page; needs no api key.
pub struct DetailPageGeocoder {
    client: Client,
    concurrency: usize,
}

impl DetailPageGeocoder {
    pub fn new(concurrency: usize) -> anyhow::Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self::with_client(client, concurrency))
    }

    pub fn with_client(client: Client, concurrency: usize) -> Self {
        DetailPageGeocoder {
            client,
            concurrency: concurrency.max(1),
        }
    }

    async fn locate(&self, link: &str) -> anyhow::Result<Option<Coordinates>> {
        let retry_strategy = FixedInterval::new(Duration::from_millis(250))
            .map(jitter)
            .take(2);
        let res = Retry::spawn(retry_strategy, || {
            self.client
                .get(link)
                .timeout(Duration::from_secs(30))
                .send()
        })
        .await
        .map_err(|e| HarvesterError::EnrichmentCall(format!("{}: {}", link, e)))?;

        if !res.status().is_success() {
            return Err(HarvesterError::EnrichmentCall(format!(
                "{} returned {}",
                link,
                res.status()
            ))
            .into());
        }
        let html = res
            .text()
            .await
            .map_err(|e| HarvesterError::EnrichmentCall(format!("{}: {}", link, e)))?;
        Ok(parse_detail_coordinates(&html))
    }
}

#[async_trait]
impl Geocoder for DetailPageGeocoder {
    fn batch_limit(&self) -> usize {
        DETAIL_PAGE_BATCH_LIMIT
    }

    async fn geocode(&self, addresses: &[Address]) -> anyhow::Result<Vec<Option<Coordinates>>> {
        let lookups: Vec<_> = addresses
            .iter()
            .map(|address| async move {
                let Some(link) = &address.link else {
                    debug!("no detail page for {}", address.address_line1);
                    return None;
                };
                match self.locate(link).await {
                    Ok(coordinates) => {
                        if coordinates.is_none() {
                            debug!("no coordinates on detail page {}", link);
                        }
                        coordinates
                    }
                    Err(e) => {
                        warn!("could not read detail page: {:#}", e);
                        None
                    }
                }
            })
            .collect();
        let results = stream::iter(lookups)
            .buffered(self.concurrency)
            .collect::<Vec<Option<Coordinates>>>()
            .await;
        Ok(results)
    }
}
