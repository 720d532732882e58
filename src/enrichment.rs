use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

use crate::{
    elevation::ElevationProvider,
    geocoding::{Address, Geocoder},
    types::{ChangeSet, Coordinates, FieldChange, Record, Snapshot},
};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Enforces a minimum spacing between outbound requests.
pub struct Throttle {
    limiter: Option<DirectRateLimiter>,
}

impl Throttle {
    /// A zero interval disables throttling.
    pub fn new(interval: Duration) -> Self {
        Throttle {
            limiter: Quota::with_period(interval).map(RateLimiter::direct),
        }
    }

    pub async fn ready(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }
}

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct EnrichmentOptions {
    // minimum time between two geocoding batches
    #[builder(default = "Duration::from_millis(60)")]
    geocode_interval: Duration,
    // minimum time between two elevation requests
    #[builder(default = "Duration::from_millis(100)")]
    elevation_interval: Duration,
    // points per elevation request
    #[builder(default = "256")]
    elevation_chunk_size: usize,
}

impl EnrichmentOptions {
    pub fn default_builder() -> EnrichmentOptionsBuilder {
        EnrichmentOptionsBuilder::default()
    }
}

pub struct EnrichmentPipeline {
    geocoder: Arc<dyn Geocoder>,
    elevation: Arc<dyn ElevationProvider>,
    options: EnrichmentOptions,
    geocode_throttle: Throttle,
    elevation_throttle: Throttle,
}

impl EnrichmentPipeline {
    pub fn new(
        geocoder: Arc<dyn Geocoder>,
        elevation: Arc<dyn ElevationProvider>,
        options: EnrichmentOptions,
    ) -> Self {
        EnrichmentPipeline {
            geocoder,
            elevation,
            geocode_throttle: Throttle::new(options.geocode_interval),
            elevation_throttle: Throttle::new(options.elevation_interval),
            options,
        }
    }

    /// Geocodes `records`, then looks up the elevation of every record with valid coordinates.
    ///
    /// Every input record is returned, in the same order. A failed call leaves the
    /// affected records without the derived field; an unparseable address gets
    /// [`Coordinates::FALLBACK`].
    pub async fn enrich(&self, mut records: Vec<Record>) -> Vec<Record> {
        if records.is_empty() {
            return records;
        }
        self.geocode(&mut records).await;
        self.add_elevation(&mut records).await;
        records
    }

    async fn geocode(&self, records: &mut [Record]) {
        let mut queries = vec![];
        for (index, record) in records.iter_mut().enumerate() {
            match Address::parse(&record.street_name, &record.postal_code_city) {
                Ok(address) => queries.push((index, address.with_link(&record.link))),
                Err(e) => {
                    warn!("using fallback coordinates for {}: {}", record.link, e);
                    record.coordinates = Some(Coordinates::FALLBACK);
                }
            }
        }

        let batch_limit = self.geocoder.batch_limit().max(1);
        let batches = queries.len().div_ceil(batch_limit);
        for (n, batch) in queries.chunks(batch_limit).enumerate() {
            self.geocode_throttle.ready().await;
            let addresses = batch
                .iter()
                .map(|(_, address)| address.clone())
                .collect::<Vec<Address>>();

            match self.geocoder.geocode(&addresses).await {
                Ok(results) => {
                    let mut found = 0;
                    for (position, (index, _)) in batch.iter().enumerate() {
                        let coordinates = results.get(position).copied().flatten();
                        if coordinates.is_some() {
                            found += 1;
                        }
                        records[*index].coordinates =
                            Some(coordinates.unwrap_or(Coordinates::FALLBACK));
                    }
                    info!(
                        "geocoded batch {}/{}: {} of {} addresses found",
                        n + 1,
                        batches,
                        found,
                        batch.len()
                    );
                }
                Err(e) => error!(
                    "geocoding batch {}/{} of {} addresses failed: {:#}",
                    n + 1,
                    batches,
                    batch.len(),
                    e
                ),
            }
        }
    }

    async fn add_elevation(&self, records: &mut [Record]) {
        let points = records
            .iter()
            .enumerate()
            .filter_map(|(index, record)| {
                record
                    .coordinates
                    .filter(Coordinates::is_valid)
                    .map(|c| (index, c))
            })
            .collect::<Vec<(usize, Coordinates)>>();

        let chunk_size = self.options.elevation_chunk_size.max(1);
        for chunk in points.chunks(chunk_size) {
            let coordinates = chunk.iter().map(|(_, c)| *c).collect::<Vec<Coordinates>>();

            self.elevation_throttle.ready().await;
            match self.elevation.elevation(&coordinates).await {
                Ok(elevations) if elevations.len() == chunk.len() => {
                    for ((index, _), elevation) in chunk.iter().zip(elevations) {
                        records[*index].elevation = Some(elevation);
                    }
                    info!("added elevation to {} listings", chunk.len());
                }
                Ok(elevations) => error!(
                    "elevation returned {} results for {} points, skipping chunk",
                    elevations.len(),
                    chunk.len()
                ),
                Err(e) => error!(
                    "elevation lookup for {} points failed: {:#}",
                    chunk.len(),
                    e
                ),
            }
        }
    }

    /// Enriches inserts and flagged updates, then merges them back into the change set.
    ///
    /// Updates that keep their address take the derived fields of their stored version,
    /// unless that version has no valid coordinates either.
    pub async fn enrich_change_set(
        &self,
        changes: ChangeSet,
        field_changes: &[FieldChange],
        stored: &Snapshot,
    ) -> ChangeSet {
        let ChangeSet {
            to_insert,
            mut to_update,
            to_delete,
        } = changes;

        let regeocode = field_changes
            .iter()
            .filter(|c| c.needs_geocode)
            .map(|c| c.id.as_str())
            .collect::<HashSet<&str>>();

        let mut flagged = vec![];
        for record in to_update.iter_mut() {
            if regeocode.contains(record.id.as_str()) {
                flagged.push(record.clone());
                continue;
            }
            if let Some(previous) = stored.get(&record.id) {
                record.inherit_derived(previous);
            }
            // the stored version was never located, so there is nothing worth keeping
            if !record.has_valid_coordinates() {
                flagged.push(record.clone());
            }
        }

        info!(
            "enriching {} new and {} updated listings",
            to_insert.len(),
            flagged.len()
        );
        let to_insert = self.enrich(to_insert).await;
        let mut enriched = self
            .enrich(flagged)
            .await
            .into_iter()
            .map(|r| (r.id.clone(), r))
            .collect::<HashMap<String, Record>>();

        let to_update = to_update
            .into_iter()
            .map(|record| enriched.remove(&record.id).unwrap_or(record))
            .collect();

        ChangeSet {
            to_insert,
            to_update,
            to_delete,
        }
    }
}
