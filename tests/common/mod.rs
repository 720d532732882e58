#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use harvester::{
    crawler::{pagination_urls, PageFetcher},
    elevation::ElevationProvider,
    geocoding::{Address, Geocoder},
    store::ListingStore,
    types::{ChangeSet, Coordinates, CrawlTask, HarvesterError, PageResult, Record, Snapshot},
};

pub fn listing(path: &str, street: &str, price: u64) -> Record {
    Record {
        street_name: street.into(),
        postal_code_city: "3524 XG Utrecht".into(),
        price_sale: Some(price),
        rooms: Some(4),
        ..Record::new(format!("https://www.funda.nl/koop/utrecht/{}/", path))
    }
}

#[derive(Debug, Clone)]
pub enum Reply {
    Listings(Vec<Record>),
    Empty,
    Fail,
}

/// Scripted search pages. The last reply for a url repeats forever.
#[derive(Default)]
pub struct FakeFetcher {
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    result_counts: HashMap<String, usize>,
    page_size: usize,
    delay: Duration,
    calls: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl FakeFetcher {
    pub fn new(page_size: usize) -> Self {
        FakeFetcher {
            page_size,
            ..Default::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn page(self, url: &str, replies: Vec<Reply>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into());
        self
    }

    pub fn result_count(mut self, url: &str, count: usize) -> Self {
        self.result_counts.insert(url.to_string(), count);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, url: &str) -> usize {
        self.calls().iter().filter(|u| *u == url).count()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_reply(&self, url: &str) -> Reply {
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or(Reply::Empty),
            None => Reply::Empty,
        }
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch(&self, task: &CrawlTask) -> anyhow::Result<PageResult> {
        self.calls.lock().unwrap().push(task.url.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let records = match self.next_reply(&task.url) {
            Reply::Fail => {
                return Err(HarvesterError::TransientFetch {
                    url: task.url.clone(),
                    reason: "503 Service Unavailable".into(),
                }
                .into())
            }
            Reply::Empty => vec![],
            Reply::Listings(records) => records,
        };

        let discovered_urls = match (task.is_seed(), self.result_counts.get(&task.url)) {
            (true, Some(count)) => pagination_urls(&task.url, *count, self.page_size),
            _ => vec![],
        };
        let raw_page = records
            .is_empty()
            .then(|| "<html><body>Je bent bijna op de pagina die je zoekt</body></html>".to_string());

        Ok(PageResult {
            task: task.clone(),
            records,
            discovered_urls,
            raw_page,
        })
    }
}

/// Places every address on a line of latitudes derived from its house number.
#[derive(Default)]
pub struct FakeGeocoder {
    pub calls: AtomicUsize,
    pub geocoded: Mutex<Vec<String>>,
    pub links: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl Geocoder for FakeGeocoder {
    fn batch_limit(&self) -> usize {
        1000
    }

    async fn geocode(&self, addresses: &[Address]) -> anyhow::Result<Vec<Option<Coordinates>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut geocoded = self.geocoded.lock().unwrap();
        self.links
            .lock()
            .unwrap()
            .extend(addresses.iter().map(|a| a.link.clone()));
        Ok(addresses
            .iter()
            .map(|a| {
                geocoded.push(a.address_line1.clone());
                let number = a
                    .address_line1
                    .rsplit(' ')
                    .next()
                    .and_then(|n| n.parse::<f64>().ok())?;
                Some(Coordinates::new(52.0 + number / 1000.0, 5.1))
            })
            .collect())
    }
}

#[derive(Default)]
pub struct FakeElevation;

#[async_trait]
impl ElevationProvider for FakeElevation {
    async fn elevation(&self, points: &[Coordinates]) -> anyhow::Result<Vec<f64>> {
        Ok(points.iter().map(|_| 1.5).collect())
    }
}

/// An in-memory store that can be told to fail loads or writes.
#[derive(Default)]
pub struct MemoryStore {
    snapshot: Mutex<Snapshot>,
    pub fail_loads: bool,
    pub fail_writes: bool,
    pub writes: AtomicUsize,
}

impl MemoryStore {
    pub fn with_records(records: Vec<Record>) -> Self {
        MemoryStore {
            snapshot: Mutex::new(Snapshot::from_records(records)),
            ..Default::default()
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    pub fn unreadable(mut self) -> Self {
        self.fail_loads = true;
        self
    }

    pub fn get(&self, id: &str) -> Option<Record> {
        self.snapshot.lock().unwrap().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.lock().unwrap().len()
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn load_all(&self) -> anyhow::Result<Snapshot> {
        if self.fail_loads {
            return Err(anyhow!("connection refused"));
        }
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn apply_change_set(&self, changes: &ChangeSet) -> anyhow::Result<()> {
        if self.fail_writes {
            return Err(anyhow!("connection reset by peer"));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.snapshot.lock().unwrap().apply(changes);
        Ok(())
    }
}
