use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvesterError {
    #[error("transient_fetch: {url} ({reason})")]
    TransientFetch { url: String, reason: String },
    #[error("empty_extraction: no listings found at {0}")]
    EmptyExtraction(String),
    #[error("enrichment_call: {0}")]
    EnrichmentCall(String),
    #[error("address_parse: {0}")]
    AddressParse(String),
    #[error("persistence: {0}")]
    Persistence(String),
    #[error("run_in_progress")]
    RunInProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinates {
    /// Placeholder stored for records whose address could not be geocoded.
    /// It is never considered valid, so a later backfill picks the record up again.
    pub const FALLBACK: Coordinates = Coordinates {
        latitude: 0.0,
        longitude: 0.0,
    };

    pub fn new(latitude: f64, longitude: f64) -> Self {
        Coordinates {
            latitude,
            longitude,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
            && *self != Self::FALLBACK
    }
}

/// One harvested listing.
///
/// `coordinates` and `elevation` are derived by enrichment and are never part
/// of change detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub header: String,
    pub link: String,
    pub street_name: String,
    pub postal_code_city: String,
    pub price_sale: Option<u64>,
    pub living_area: Option<u32>,
    pub plot_area: Option<u32>,
    pub rooms: Option<u32>,
    pub energy_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
}

impl Record {
    pub fn new(link: impl Into<String>) -> Self {
        let link = link.into();
        Record {
            id: Self::id_for_link(&link),
            header: String::new(),
            link,
            street_name: String::new(),
            postal_code_city: String::new(),
            price_sale: None,
            living_area: None,
            plot_area: None,
            rooms: None,
            energy_label: None,
            coordinates: None,
            elevation: None,
        }
    }

    /// Stable identity of a listing: the hex sha256 of its canonical link.
    pub fn id_for_link(link: &str) -> String {
        format!("{:x}", Sha256::digest(link.as_bytes()))
    }

    pub fn has_valid_coordinates(&self) -> bool {
        self.coordinates.map(|c| c.is_valid()).unwrap_or(false)
    }

    /// Copies the derived fields of a previously stored version of this listing.
    pub fn inherit_derived(&mut self, stored: &Record) {
        self.coordinates = stored.coordinates;
        self.elevation = stored.elevation;
    }
}

/// All currently known live records, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    records: HashMap<String, Record>,
}

impl Snapshot {
    /// Folds records into a snapshot; on a duplicate id the last record wins.
    pub fn from_records(records: impl IntoIterator<Item = Record>) -> Self {
        let mut snapshot = Snapshot::default();
        for record in records {
            snapshot.insert(record);
        }
        snapshot
    }

    pub fn insert(&mut self, record: Record) -> Option<Record> {
        self.records.insert(record.id.clone(), record)
    }

    pub fn remove(&mut self, id: &str) -> Option<Record> {
        self.records.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Record)> {
        self.records.iter()
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.records.keys().cloned().collect()
    }

    /// Applies a change set: deletions first, then inserts and updates as upserts.
    pub fn apply(&mut self, changes: &ChangeSet) {
        for record in &changes.to_delete {
            self.remove(&record.id);
        }
        for record in changes.to_insert.iter().chain(changes.to_update.iter()) {
            self.insert(record.clone());
        }
    }

    /// Records sorted by id.
    pub fn into_records(self) -> Vec<Record> {
        let mut records = self.records.into_values().collect::<Vec<Record>>();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

impl FromIterator<Record> for Snapshot {
    fn from_iter<I: IntoIterator<Item = Record>>(iter: I) -> Self {
        Snapshot::from_records(iter)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSet {
    pub to_insert: Vec<Record>,
    pub to_update: Vec<Record>,
    pub to_delete: Vec<Record>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.to_insert.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            inserted: self.to_insert.len(),
            updated: self.to_update.len(),
            deleted: self.to_delete.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeCounts {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl fmt::Display for ChangeCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "to_insert: {}, to_update: {}, to_delete: {}",
            self.inserted, self.updated, self.deleted
        )
    }
}

/// Fields of an updated record that differ from its stored version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub id: String,
    pub changed_fields: BTreeSet<String>,
    pub needs_geocode: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// First page of a search query; its response reveals the remaining pages.
    Seed,
    Discovered,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CrawlTask {
    pub url: String,
    pub kind: TaskKind,
}

impl CrawlTask {
    pub fn seed(url: impl Into<String>) -> Self {
        CrawlTask {
            url: url.into(),
            kind: TaskKind::Seed,
        }
    }

    pub fn discovered(url: impl Into<String>) -> Self {
        CrawlTask {
            url: url.into(),
            kind: TaskKind::Discovered,
        }
    }

    pub fn is_seed(&self) -> bool {
        self.kind == TaskKind::Seed
    }
}

/// What one fetched search page yielded.
#[derive(Debug, Clone)]
pub struct PageResult {
    pub task: CrawlTask,
    pub records: Vec<Record>,
    pub discovered_urls: Vec<String>,
    /// Raw response body, only kept when the page produced no listings.
    pub raw_page: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub crawled: usize,
    pub pages: usize,
    pub abandoned_urls: usize,
    pub inserted: usize,
    pub updated: usize,
    pub regeocoded: usize,
    pub deleted: usize,
    /// Deletions held back because some urls were abandoned.
    pub deferred_deletes: usize,
    pub unchanged: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "crawled {} listings from {} pages ({} urls abandoned); inserted: {}, updated: {} ({} regeocoded), deleted: {} ({} deferred), unchanged: {}",
            self.crawled,
            self.pages,
            self.abandoned_urls,
            self.inserted,
            self.updated,
            self.regeocoded,
            self.deleted,
            self.deferred_deletes,
            self.unchanged
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn id_is_stable_for_a_link() {
        let a = Record::new("https://www.funda.nl/koop/utrecht/huis-1/");
        let b = Record::new("https://www.funda.nl/koop/utrecht/huis-1/");
        let c = Record::new("https://www.funda.nl/koop/utrecht/huis-2/");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.id.len(), 64);
    }

    #[test]
    fn snapshot_last_write_wins() {
        let first = Record {
            price_sale: Some(100),
            ..Record::new("https://example.com/a")
        };
        let second = Record {
            price_sale: Some(120),
            ..Record::new("https://example.com/a")
        };
        let snapshot = Snapshot::from_records(vec![first, second]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot
                .get(&Record::id_for_link("https://example.com/a"))
                .unwrap()
                .price_sale,
            Some(120)
        );
    }

    #[test]
    fn fallback_coordinates_are_not_valid() {
        assert!(!Coordinates::FALLBACK.is_valid());
        assert!(!Coordinates::new(f64::NAN, 5.1).is_valid());
        assert!(!Coordinates::new(91.0, 5.1).is_valid());
        assert!(Coordinates::new(52.09, 5.12).is_valid());
    }

    #[test]
    fn derived_fields_are_omitted_when_missing() {
        let json = serde_json::to_value(Record::new("https://example.com/a")).unwrap();
        assert!(json.get("coordinates").is_none());
        assert!(json.get("elevation").is_none());
        assert!(json.get("streetName").is_some());
    }

    #[test]
    fn apply_upserts_and_deletes() {
        let a = Record::new("https://example.com/a");
        let b = Record::new("https://example.com/b");
        let mut snapshot = Snapshot::from_records(vec![a.clone()]);
        snapshot.apply(&ChangeSet {
            to_insert: vec![b.clone()],
            to_update: vec![],
            to_delete: vec![a.clone()],
        });
        assert!(!snapshot.contains(&a.id));
        assert!(snapshot.contains(&b.id));
    }
}
