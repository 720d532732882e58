use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use tokio::time::sleep;

use crate::{
    queue::{QueueEvent, QueueHandle, Task, WorkQueue},
    types::{CrawlTask, HarvesterError, PageResult, Record},
    utils::{jitter, FORMAT_STRING},
};

/// Fetches one search-results page and extracts its listings.
///
/// Implementations return an error for any non-success response and only
/// report `discovered_urls` for seed tasks.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, task: &CrawlTask) -> anyhow::Result<PageResult>;
}

#[derive(Builder, Debug, Clone)]
#[builder(setter(into))]
pub struct CrawlOptions {
    // maximum number of pages fetched at the same time
    #[builder(default = "4")]
    concurrency: usize,
    // retries per url after a failed or empty fetch
    #[builder(default = "3")]
    url_retries: u32,
    // base delay before a retried fetch, jittered
    #[builder(default = "Duration::from_millis(500)")]
    retry_delay: Duration,
    // where pages without listings are written for inspection
    #[builder(default = "None")]
    diagnostics_dir: Option<PathBuf>,
}

impl CrawlOptions {
    pub fn default_builder() -> CrawlOptionsBuilder {
        CrawlOptionsBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct CrawlResult {
    pub records: Vec<Record>,
    pub pages: usize,
    pub abandoned: HashSet<String>,
}

pub struct Crawler {
    fetcher: Arc<dyn PageFetcher>,
    options: CrawlOptions,
}

/// Bookkeeping for one crawl run.
#[derive(Default)]
struct CrawlState {
    known: HashMap<String, CrawlTask>,
    retries: HashMap<String, u32>,
    abandoned: HashSet<String>,
    empty_pages: usize,
}

impl Crawler {
    pub fn new(fetcher: Arc<dyn PageFetcher>, options: CrawlOptions) -> Self {
        Crawler { fetcher, options }
    }

    pub async fn crawl(&self, seeds: Vec<CrawlTask>) -> CrawlResult {
        let mut state = CrawlState::default();
        let mut tasks = vec![];
        for seed in seeds {
            if state.known.contains_key(&seed.url) {
                continue;
            }
            state.known.insert(seed.url.clone(), seed.clone());
            tasks.push(self.task(seed, false));
        }

        info!(
            "starting crawl of {} seeds with {} concurrent fetches and {} retries",
            tasks.len(),
            self.options.concurrency,
            self.options.url_retries
        );

        let queue = WorkQueue::new(tasks, self.options.concurrency);
        let outcome = queue
            .run(|event, handle| match event {
                QueueEvent::Completed {
                    result, progress, ..
                } => {
                    info!(
                        "finished checking url {} with {} listings ({}/{})",
                        result.task.url,
                        result.records.len(),
                        progress.completed + progress.failed,
                        progress.total
                    );
                    if result.records.is_empty() {
                        state.empty_pages += 1;
                        if let Some(raw) = &result.raw_page {
                            self.persist_empty_page(&result.task.url, raw, state.empty_pages);
                        }
                        let error = HarvesterError::EmptyExtraction(result.task.url.clone());
                        self.retry_or_abandon(&result.task, &error.to_string(), &mut state, handle);
                    }
                    self.add_discovered(&result.discovered_urls, &mut state, handle);
                }
                QueueEvent::Failed { key, error, .. } => {
                    match state.known.get(key).cloned() {
                        Some(task) => {
                            self.retry_or_abandon(&task, &format!("{:#}", error), &mut state, handle)
                        }
                        None => error!("failed task {} is unknown to the crawl", key),
                    }
                }
            })
            .await;

        let pages = outcome.completed.len();
        let records = outcome
            .completed
            .into_iter()
            .flat_map(|page| page.records)
            .collect::<Vec<Record>>();

        info!(
            "crawl finished: {} listings from {} pages, {} urls abandoned",
            records.len(),
            pages,
            state.abandoned.len()
        );
        if !state.abandoned.is_empty() {
            debug!("abandoned urls: {:#?}", state.abandoned);
        }

        CrawlResult {
            records,
            pages,
            abandoned: state.abandoned,
        }
    }

    fn task(&self, crawl_task: CrawlTask, is_retry: bool) -> Task<PageResult> {
        let fetcher = self.fetcher.clone();
        let delay = if is_retry {
            jitter(self.options.retry_delay)
        } else {
            Duration::ZERO
        };
        Task::new(crawl_task.url.clone(), async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            fetcher.fetch(&crawl_task).await
        })
    }

    fn retry_or_abandon(
        &self,
        task: &CrawlTask,
        reason: &str,
        state: &mut CrawlState,
        handle: &QueueHandle<PageResult>,
    ) {
        let attempt = state.retries.entry(task.url.clone()).or_insert(0);
        if *attempt >= self.options.url_retries {
            error!(
                "reached max retries for url {} ({}), giving up",
                task.url, reason
            );
            state.abandoned.insert(task.url.clone());
            return;
        }
        *attempt += 1;
        warn!(
            "retrying url {} after {}, attempt {} of {}",
            task.url, reason, attempt, self.options.url_retries
        );
        // the retried task keeps its kind so a seed still discovers its pages
        handle.add(vec![self.task(task.clone(), true)]);
    }

    fn add_discovered(
        &self,
        urls: &[String],
        state: &mut CrawlState,
        handle: &QueueHandle<PageResult>,
    ) {
        let mut tasks = vec![];
        for url in urls {
            if state.known.contains_key(url) {
                continue;
            }
            let task = CrawlTask::discovered(url.clone());
            state.known.insert(url.clone(), task.clone());
            tasks.push(self.task(task, false));
        }
        if !tasks.is_empty() {
            debug!("adding {} discovered pages to the queue", tasks.len());
            handle.add(tasks);
        }
    }

    fn persist_empty_page(&self, url: &str, raw: &str, sequence: usize) {
        let Some(dir) = &self.options.diagnostics_dir else {
            return;
        };
        match write_diagnostic_page(dir, raw, sequence) {
            Ok(path) => warn!("no listings found for url {}, page saved to {:?}", url, path),
            Err(e) => error!("could not save page without listings for {}: {:#}", url, e),
        }
    }
}

fn write_diagnostic_page(dir: &Path, raw: &str, sequence: usize) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(dir).context(format!("could not create {:?}", dir))?;
    let path = dir.join(format!(
        "no-listings-{}-{}.html",
        Utc::now().format(FORMAT_STRING),
        sequence
    ));
    fs::write(&path, raw).context(format!("could not write {:?}", path))?;
    Ok(path)
}

/// First page of the search for every area.
pub fn seed_tasks(search_url: &str, areas: &[String]) -> Vec<CrawlTask> {
    areas
        .iter()
        .map(|area| {
            let selected = format!("[\"{}\"]", area);
            CrawlTask::seed(format!(
                "{}?selected_area={}",
                search_url,
                urlencoding::encode(&selected)
            ))
        })
        .collect()
}

/// Urls for pages `2..=ceil(result_count / page_size)` of a search.
pub fn pagination_urls(seed_url: &str, result_count: usize, page_size: usize) -> Vec<String> {
    if page_size == 0 {
        return vec![];
    }
    let pages = result_count.div_ceil(page_size);
    (2..=pages)
        .map(|page| format!("{}&search_result={}", seed_url, page))
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pagination_of_140_results() {
        let urls = pagination_urls("https://example.com/?selected_area=x", 140, 15);
        assert_eq!(urls.len(), 9);
        assert_eq!(
            urls.first().unwrap(),
            "https://example.com/?selected_area=x&search_result=2"
        );
        assert_eq!(
            urls.last().unwrap(),
            "https://example.com/?selected_area=x&search_result=10"
        );
    }

    #[test]
    fn pagination_edges() {
        assert!(pagination_urls("u", 0, 15).is_empty());
        assert!(pagination_urls("u", 15, 15).is_empty());
        assert_eq!(pagination_urls("u", 16, 15).len(), 1);
        assert!(pagination_urls("u", 16, 0).is_empty());
    }

    #[test]
    fn seeds_encode_the_area() {
        let seeds = seed_tasks(
            "https://www.funda.nl/zoeken/koop",
            &["gemeente-utrecht".to_string()],
        );
        assert_eq!(seeds.len(), 1);
        assert!(seeds[0].is_seed());
        assert_eq!(
            seeds[0].url,
            "https://www.funda.nl/zoeken/koop?selected_area=%5B%22gemeente-utrecht%22%5D"
        );
    }
}
