use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tokio::time::sleep;

use crate::{
    crawler::{seed_tasks, Crawler},
    enrichment::EnrichmentPipeline,
    feature_collection::FeatureCollection,
    reconcile::Reconciler,
    store::ListingStore,
    types::{ChangeSet, HarvesterError, RunSummary, Snapshot},
    utils::{FORMAT_STRING, SEARCH_URL},
};

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct RunnerOptions {
    // one seed search per area
    #[builder(default = "vec![]")]
    areas: Vec<String>,
    #[builder(default = "self.default_search_url()")]
    search_url: String,
    // replay dumps are written here when persisting fails
    #[builder(default = "self.default_output_dir()")]
    output_dir: PathBuf,
    // where the map client reads the listings from
    #[builder(default = "self.default_feature_collection_path()")]
    feature_collection_path: Option<PathBuf>,
}

impl RunnerOptions {
    pub fn default_builder() -> RunnerOptionsBuilder {
        RunnerOptionsBuilder::default()
    }
}

impl RunnerOptionsBuilder {
    fn default_search_url(&self) -> String {
        SEARCH_URL.into()
    }
    fn default_output_dir(&self) -> PathBuf {
        PathBuf::from("output")
    }
    fn default_feature_collection_path(&self) -> Option<PathBuf> {
        Some(PathBuf::from("public/listings_feature_collection.json"))
    }
}

/// Allows at most one run at a time. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    active: Arc<AtomicBool>,
}

/// Held for the duration of a run; dropping it frees the guard.
#[derive(Debug)]
pub struct RunPermit {
    active: Arc<AtomicBool>,
}

impl RunGuard {
    pub fn try_acquire(&self) -> Option<RunPermit> {
        self.active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunPermit {
                active: self.active.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Resolves once no run holds a permit.
    pub async fn wait_idle(&self, poll_interval: Duration) {
        while self.is_running() {
            sleep(poll_interval).await;
        }
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

pub struct Runner {
    crawler: Crawler,
    enrichment: EnrichmentPipeline,
    store: Arc<dyn ListingStore>,
    reconciler: Reconciler,
    guard: RunGuard,
    options: RunnerOptions,
}

impl Runner {
    pub fn new(
        crawler: Crawler,
        enrichment: EnrichmentPipeline,
        store: Arc<dyn ListingStore>,
        options: RunnerOptions,
    ) -> Self {
        Runner {
            crawler,
            enrichment,
            store,
            reconciler: Reconciler::default(),
            guard: RunGuard::default(),
            options,
        }
    }

    pub fn with_reconciler(mut self, reconciler: Reconciler) -> Self {
        self.reconciler = reconciler;
        self
    }

    pub fn guard(&self) -> RunGuard {
        self.guard.clone()
    }

    /// Runs a cycle unless one is already active, in which case
    /// [`HarvesterError::RunInProgress`] is returned straight away.
    pub async fn run_exclusive(&self) -> anyhow::Result<RunSummary> {
        let Some(_permit) = self.guard.try_acquire() else {
            warn!("a run is already in progress, rejecting trigger");
            return Err(HarvesterError::RunInProgress.into());
        };
        self.run_cycle().await
    }

    /// Crawls, reconciles against the store, enriches what changed and persists it.
    pub async fn run_cycle(&self) -> anyhow::Result<RunSummary> {
        let seeds = seed_tasks(&self.options.search_url, &self.options.areas);
        if seeds.is_empty() {
            warn!("no areas configured, nothing to crawl");
            return Ok(RunSummary::default());
        }

        let crawl = self.crawler.crawl(seeds).await;
        let mut summary = RunSummary {
            crawled: crawl.records.len(),
            pages: crawl.pages,
            abandoned_urls: crawl.abandoned.len(),
            ..Default::default()
        };

        // an empty crawl would delete every stored listing
        if crawl.records.is_empty() {
            error!(
                "crawl yielded no listings ({} urls abandoned), leaving stored listings untouched",
                crawl.abandoned.len()
            );
            return Ok(summary);
        }

        let current = Snapshot::from_records(crawl.records);
        let stored = match self.store.load_all().await {
            Ok(stored) => stored,
            Err(e) => {
                error!(
                    "could not load stored listings, {} crawled listings left unreconciled: {:#}",
                    current.len(),
                    e
                );
                self.save_replay(&current.into_records());
                return Err(
                    HarvesterError::Persistence(format!("loading listings: {:#}", e)).into(),
                );
            }
        };

        let mut changes = self.reconciler.diff(&current, &stored);
        // listings on abandoned pages look deleted; keep them until a complete crawl
        if !crawl.abandoned.is_empty() && !changes.to_delete.is_empty() {
            warn!(
                "{} urls abandoned, deferring deletion of {} listings",
                crawl.abandoned.len(),
                changes.to_delete.len()
            );
            summary.deferred_deletes = changes.to_delete.len();
            changes.to_delete.clear();
        }
        let field_changes = self.reconciler.field_changes(&changes, &stored);
        let counts = changes.counts();
        summary.inserted = counts.inserted;
        summary.updated = counts.updated;
        summary.deleted = counts.deleted;
        summary.regeocoded = field_changes.iter().filter(|c| c.needs_geocode).count();
        summary.unchanged = current.len() - counts.inserted - counts.updated;
        info!("reconciled {} listings: {}", current.len(), counts);

        if changes.is_empty() {
            info!("no changes since the last run");
            info!("{}", summary);
            return Ok(summary);
        }

        let merged = self
            .enrichment
            .enrich_change_set(changes, &field_changes, &stored)
            .await;

        self.persist(&merged).await?;

        let mut after = stored;
        after.apply(&merged);
        self.write_feature_collection(&after).await;

        info!("{}", summary);
        Ok(summary)
    }

    /// Geocodes stored listings that still lack valid coordinates.
    pub async fn backfill(&self) -> anyhow::Result<RunSummary> {
        let mut stored = self
            .store
            .load_all()
            .await
            .map_err(|e| HarvesterError::Persistence(format!("loading listings: {:#}", e)))?;

        let missing = stored
            .iter()
            .filter(|(_, r)| !r.has_valid_coordinates())
            .map(|(_, r)| r.clone())
            .collect::<Vec<_>>();
        info!(
            "backfilling {} of {} stored listings without coordinates",
            missing.len(),
            stored.len()
        );

        let changes = ChangeSet {
            to_update: self
                .enrichment
                .enrich(missing)
                .await
                .into_iter()
                .filter(|r| r.has_valid_coordinates())
                .collect(),
            ..Default::default()
        };
        let summary = RunSummary {
            updated: changes.to_update.len(),
            regeocoded: changes.to_update.len(),
            unchanged: stored.len() - changes.to_update.len(),
            ..Default::default()
        };

        if !changes.is_empty() {
            self.persist(&changes).await?;
            stored.apply(&changes);
            self.write_feature_collection(&stored).await;
        }

        info!("backfill finished: {}", summary);
        Ok(summary)
    }

    async fn persist(&self, changes: &ChangeSet) -> anyhow::Result<()> {
        if let Err(e) = self.store.apply_change_set(changes).await {
            error!(
                "could not persist change set ({}): {:#}",
                changes.counts(),
                e
            );
            self.save_replay(changes);
            return Err(HarvesterError::Persistence(format!("{:#}", e)).into());
        }
        Ok(())
    }

    fn save_replay<T: Serialize>(&self, value: &T) {
        match write_replay(&self.options.output_dir, value) {
            Ok(path) => error!("saved for replay at {:?}", path),
            Err(e) => error!("could not save replay: {:#}", e),
        }
    }

    async fn write_feature_collection(&self, snapshot: &Snapshot) {
        let Some(path) = &self.options.feature_collection_path else {
            return;
        };
        let mut records = snapshot.iter().map(|(_, r)| r).collect::<Vec<_>>();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        if let Err(e) = FeatureCollection::from_records(records).write(path).await {
            error!("could not write feature collection: {:#}", e);
        }
    }
}

fn write_replay<T: Serialize>(dir: &Path, value: &T) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).context(format!("could not create {:?}", dir))?;
    let path = dir.join(format!("replay-{}.json", Utc::now().format(FORMAT_STRING)));
    std::fs::write(&path, serde_json::to_vec_pretty(value)?)
        .context(format!("could not write {:?}", path))?;
    Ok(path)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn guard_admits_one_run() {
        let guard = RunGuard::default();
        let permit = guard.try_acquire();
        assert!(permit.is_some());
        assert!(guard.is_running());
        assert!(guard.clone().try_acquire().is_none());

        drop(permit);
        assert!(!guard.is_running());
        assert!(guard.try_acquire().is_some());
    }

    #[tokio::test]
    async fn wait_idle_resolves_when_permit_drops() {
        let guard = RunGuard::default();
        let permit = guard.try_acquire().unwrap();
        let run = tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            drop(permit);
        });

        guard.wait_idle(Duration::from_millis(5)).await;
        assert!(!guard.is_running());
        run.await.unwrap();

        // idle guard returns straight away
        guard.wait_idle(Duration::from_secs(60)).await;
    }

    #[test]
    fn replay_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let changes = ChangeSet {
            to_delete: vec![crate::types::Record::new("https://www.funda.nl/koop/a/")],
            ..Default::default()
        };
        let path = write_replay(&dir.path().join("output"), &changes).unwrap();
        let replay: ChangeSet = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(replay, changes);
    }

    #[test]
    fn options_defaults() {
        let options = RunnerOptions::default_builder()
            .areas(vec!["gemeente-utrecht".to_string()])
            .build()
            .unwrap();
        assert_eq!(options.search_url, SEARCH_URL);
        assert_eq!(options.output_dir, PathBuf::from("output"));
        assert_eq!(
            options.feature_collection_path,
            Some(PathBuf::from("public/listings_feature_collection.json"))
        );
    }
}
