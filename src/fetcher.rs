use async_trait::async_trait;
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};

use crate::{
    crawler::{pagination_urls, PageFetcher},
    types::{CrawlTask, HarvesterError, PageResult, Record},
    utils::{normalize_url, SITE_URL, USER_AGENT},
};

pub const SEARCH_RESULTS_PER_PAGE: usize = 15;

lazy_static! {
    static ref ITEM: Selector = Selector::parse("div[data-test-id=search-result-item]").unwrap();
    static ref HEADER: Selector = Selector::parse("header").unwrap();
    static ref LINK: Selector = Selector::parse("a[href]").unwrap();
    static ref STREET: Selector =
        Selector::parse("h2[data-test-id=street-name-house-number]").unwrap();
    static ref POSTAL_CODE_CITY: Selector =
        Selector::parse("div[data-test-id=postal-code-city]").unwrap();
    static ref PRICE: Selector = Selector::parse("p[data-test-id=price-sale]").unwrap();
    static ref LIST: Selector = Selector::parse("ul").unwrap();
    static ref LIST_ITEM: Selector = Selector::parse("li").unwrap();
    static ref TITLE: Selector = Selector::parse("h1").unwrap();
}

/// A token from a listing's feature list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingFeature {
    LivingArea(u32),
    PlotArea(u32),
    Rooms(u32),
    EnergyLabel(String),
    Unrecognized(String),
}

impl ListingFeature {
    /// Classifies the `position`-th token of a feature list.
    pub fn classify(content: &str, position: usize) -> Self {
        let content = content.trim();
        if content.contains("m²") {
            let area = parse_number(&content.replace("m²", ""));
            match (position, area) {
                (0, Some(a)) => return ListingFeature::LivingArea(a),
                (1, Some(a)) => return ListingFeature::PlotArea(a),
                _ => {}
            }
        }
        if content.starts_with(|c: char| c.is_ascii_digit()) {
            if let Some(rooms) = leading_number(content) {
                return ListingFeature::Rooms(rooms);
            }
        }
        if content.starts_with(|c: char| c.is_ascii_uppercase()) {
            return ListingFeature::EnergyLabel(content.to_string());
        }
        ListingFeature::Unrecognized(content.to_string())
    }

    fn apply(self, record: &mut Record) {
        match self {
            ListingFeature::LivingArea(a) => record.living_area = Some(a),
            ListingFeature::PlotArea(a) => record.plot_area = Some(a),
            ListingFeature::Rooms(r) => record.rooms = Some(r),
            ListingFeature::EnergyLabel(l) => record.energy_label = Some(l),
            ListingFeature::Unrecognized(token) => {
                debug!("ignoring unrecognized feature {:?} for {}", token, record.link)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SearchPage {
    pub records: Vec<Record>,
    pub result_count: Option<usize>,
}

/// Extracts listings and the total result count from a search-results page.
pub fn parse_search_page(html: &str, site_url: &str) -> SearchPage {
    let document = Html::parse_document(html);
    let records = document
        .select(&ITEM)
        .filter_map(|item| parse_item(item, site_url))
        .collect();

    let result_count = document
        .select(&TITLE)
        .next()
        .map(element_text)
        .and_then(|title| {
            title
                .split_whitespace()
                .next()
                .and_then(|count| count.replace('.', "").parse::<usize>().ok())
        });

    SearchPage {
        records,
        result_count,
    }
}

fn parse_item(item: ElementRef, site_url: &str) -> Option<Record> {
    let href = item.select(&LINK).next()?.value().attr("href")?;
    let Some(link) = normalize_url(site_url, href) else {
        debug!("skipping listing with unusable link {:?}", href);
        return None;
    };

    let mut record = Record::new(link);
    record.header = first_text(item, &HEADER);
    record.street_name = first_text(item, &STREET);
    record.postal_code_city = first_text(item, &POSTAL_CODE_CITY);
    record.price_sale = parse_number(
        &first_text(item, &PRICE)
            .replace('€', "")
            .replace("k.k.", "")
            .replace("v.o.n.", ""),
    )
    .map(u64::from);

    if let Some(features) = item.select(&LIST).nth(1) {
        for (position, li) in features.select(&LIST_ITEM).enumerate() {
            ListingFeature::classify(&element_text(li), position).apply(&mut record);
        }
    }

    Some(record)
}

fn first_text(element: ElementRef, selector: &Selector) -> String {
    element
        .select(selector)
        .next()
        .map(element_text)
        .unwrap_or_default()
}

fn element_text(element: ElementRef) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}

/// Parses a number written with `.` thousands separators, e.g. `"1.250"`.
fn parse_number(text: &str) -> Option<u32> {
    let digits = text.trim().replace('.', "");
    let digits = digits.trim();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<u32>().ok()
}

fn leading_number(text: &str) -> Option<u32> {
    text.chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()
}

pub struct HttpPageFetcher {
    client: Client,
    site_url: String,
    page_size: usize,
}

impl HttpPageFetcher {
    pub fn new(page_size: usize) -> anyhow::Result<Self> {
        let client = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self::with_client(client, SITE_URL, page_size))
    }

    pub fn with_client(client: Client, site_url: &str, page_size: usize) -> Self {
        HttpPageFetcher {
            client,
            site_url: site_url.into(),
            page_size,
        }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, task: &CrawlTask) -> anyhow::Result<PageResult> {
        let res = self
            .client
            .get(&task.url)
            .send()
            .await
            .map_err(|e| HarvesterError::TransientFetch {
                url: task.url.clone(),
                reason: e.to_string(),
            })?;

        let status = res.status();
        if !status.is_success() {
            return Err(HarvesterError::TransientFetch {
                url: task.url.clone(),
                reason: status.to_string(),
            }
            .into());
        }

        let html = res.text().await.map_err(|e| HarvesterError::TransientFetch {
            url: task.url.clone(),
            reason: e.to_string(),
        })?;
        let page = parse_search_page(&html, &self.site_url);

        let discovered_urls = match (task.is_seed(), page.result_count) {
            (true, Some(count)) => pagination_urls(&task.url, count, self.page_size),
            (true, None) => {
                warn!("no result count found on seed page {}", task.url);
                vec![]
            }
            (false, _) => vec![],
        };

        let raw_page = if page.records.is_empty() {
            Some(html)
        } else {
            None
        };

        Ok(PageResult {
            task: task.clone(),
            records: page.records,
            discovered_urls,
            raw_page,
        })
    }
}
