use reqwest::Url;
use std::{path::Path, time::Duration};

use anyhow::Context;
use rand::Rng;

pub const SEARCH_URL: &str = "https://www.funda.nl/zoeken/koop";
pub const SITE_URL: &str = "https://www.funda.nl";
pub const FORMAT_STRING: &str = "%Y%m%d%H%M%S%3f";
pub const USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Resolves `url` against `base_url` and strips the fragment.
pub fn normalize_url(base_url: &str, url: &str) -> Option<String> {
    let mut parsed = match Url::parse(url) {
        Ok(u) => u,
        Err(_) if url.starts_with('/') => Url::parse(base_url).ok()?.join(url).ok()?,
        Err(_) => return None,
    };
    parsed.set_fragment(None);
    Some(parsed.to_string())
}

pub fn jitter(duration: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let rndm = rng.gen_range(1.0..3.0);
    duration.mul_f64(rndm)
}

/// Splits `"1234 AB Some City"` into `("1234 AB", "Some City")`.
pub fn split_postal_code_city(postal_code_city: &str) -> (String, String) {
    let parts = postal_code_city.split_whitespace().collect::<Vec<&str>>();
    if parts.len() < 2 {
        return (String::new(), parts.join(" "));
    }
    (parts[..2].join(" "), parts[2..].join(" "))
}

/// Reads search areas, one per line. Blank lines and `#` comments are skipped.
pub fn read_areas(path: &Path) -> anyhow::Result<Vec<String>> {
    let content = std::fs::read_to_string(path)
        .context(format!("could not read areas file at {:?}", path))?;
    Ok(parse_areas(&content))
}

pub fn parse_areas(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect()
}
