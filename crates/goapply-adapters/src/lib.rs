//! Source adapter contract + careers-page adapters for every supported company.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use goapply_core::{dedup_by_id, Job, JobFields, MAX_REQUIREMENTS};
use goapply_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "goapply-adapters";

pub const KNOWN_SOURCES: &[&str] = &["posthog", "kraken", "coinbase", "railway", "airbnb"];

/// Requirement lines shorter than this are navigation noise, not requirements.
const MIN_REQUIREMENT_CHARS: usize = 10;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("timed out fetching {0}")]
    Timeout(String),
    #[error("http status {status} for {url}")]
    Http { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Message(String),
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout { url } => AdapterError::Timeout(url),
            FetchError::HttpStatus { status, url } => AdapterError::Http { status, url },
            FetchError::Request(err) => AdapterError::Request(err.to_string()),
        }
    }
}

/// One external job source. `collect` returns the complete, id-deduplicated set of
/// postings or an error; it never returns a silently partial result.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    async fn collect(&self) -> Result<Vec<Job>, AdapterError>;
}

/// Selector configuration for a careers site rendered as listing page + detail pages.
#[derive(Debug, Clone)]
pub struct CareersSite {
    pub source_id: String,
    pub listing_urls: Vec<String>,
    pub base_url: String,
    pub link_selector: String,
    pub link_must_contain: String,
    pub title_selector: Option<String>,
    pub location_selector: String,
    pub default_location: String,
    pub description_selector: String,
    pub requirements_selector: String,
    pub posting_date_selector: Option<String>,
    pub max_details_per_listing: usize,
}

impl CareersSite {
    fn new(source_id: &str, base_url: &str, listing_urls: &[&str], link_pattern: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            listing_urls: listing_urls.iter().map(|u| u.to_string()).collect(),
            base_url: base_url.to_string(),
            link_selector: format!(r#"a[href*="{link_pattern}"]"#),
            link_must_contain: link_pattern.to_string(),
            title_selector: None,
            location_selector: r#"[class*="location"], [data-testid*="location"]"#.to_string(),
            default_location: "Remote".to_string(),
            description_selector: r#"main, article, [class*="description"]"#.to_string(),
            requirements_selector: "main li, article li".to_string(),
            posting_date_selector: None,
            max_details_per_listing: 40,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingLink {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailFields {
    pub location: Option<String>,
    pub description: String,
    pub requirements: Vec<String>,
    pub posting_date: Option<String>,
}

pub struct HtmlCareersAdapter {
    site: CareersSite,
    http: Arc<HttpFetcher>,
}

impl HtmlCareersAdapter {
    pub fn new(site: CareersSite, http: Arc<HttpFetcher>) -> Self {
        Self { site, http }
    }

    pub fn site(&self) -> &CareersSite {
        &self.site
    }
}

#[async_trait]
impl SourceAdapter for HtmlCareersAdapter {
    fn source_id(&self) -> &str {
        &self.site.source_id
    }

    async fn collect(&self) -> Result<Vec<Job>, AdapterError> {
        let source_id = self.site.source_id.as_str();
        let mut seen = HashSet::new();
        let mut links = Vec::new();

        for listing_url in &self.site.listing_urls {
            let page = self.http.fetch_text(source_id, listing_url).await?;
            let found = parse_listing(&page.body, &self.site)?;
            info!(source = source_id, listing_url = %listing_url, found = found.len(), "parsed listing page");
            for link in found
                .into_iter()
                .filter(|l| &l.url != listing_url)
                .take(self.site.max_details_per_listing)
            {
                if seen.insert(link.url.clone()) {
                    links.push(link);
                }
            }
        }

        if links.is_empty() {
            warn!(source = source_id, "no job links found on listing pages");
            return Err(AdapterError::Parse(format!(
                "no job links found on {:?}",
                self.site.listing_urls
            )));
        }

        let scraped_at = Utc::now();
        let mut jobs = Vec::with_capacity(links.len());
        for link in links {
            let page = self.http.fetch_text(source_id, &link.url).await?;
            let detail = parse_detail(&page.body, &self.site)?;
            jobs.push(Job::new(
                source_id,
                JobFields {
                    title: link.title,
                    description: detail.description,
                    requirements: detail.requirements,
                    location: detail
                        .location
                        .unwrap_or_else(|| self.site.default_location.clone()),
                    url: link.url,
                    posting_date: detail.posting_date,
                },
                scraped_at,
            ));
        }

        let jobs = dedup_by_id(jobs);
        info!(source = source_id, count = jobs.len(), "collected jobs");
        Ok(jobs)
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(format!("selector {css:?}: {e}")))
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = normalize_whitespace(&element.text().collect::<String>());
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).find_map(element_text))
}

fn select_all_texts(document: &Html, css: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).filter_map(element_text).collect())
}

fn absolute_url(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if let Some(path) = href.strip_prefix('/') {
        format!("{}/{}", base_url.trim_end_matches('/'), path)
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), href)
    }
}

/// Extracts unique absolute detail links and their titles from a listing page.
pub fn parse_listing(html: &str, site: &CareersSite) -> Result<Vec<ListingLink>, AdapterError> {
    let document = Html::parse_document(html);
    let link_sel = selector(&site.link_selector)?;
    let title_sel = site.title_selector.as_deref().map(selector).transpose()?;

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for anchor in document.select(&link_sel) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if !href.contains(&site.link_must_contain) {
            continue;
        }
        let title = match &title_sel {
            Some(sel) => anchor.select(sel).find_map(element_text),
            None => element_text(anchor),
        };
        let Some(title) = title else {
            continue;
        };
        let url = absolute_url(&site.base_url, href);
        if seen.insert(url.clone()) {
            links.push(ListingLink { url, title });
        }
    }
    Ok(links)
}

pub fn parse_detail(html: &str, site: &CareersSite) -> Result<DetailFields, AdapterError> {
    let document = Html::parse_document(html);
    let location = select_first_text(&document, &site.location_selector)?;
    let description = select_first_text(&document, &site.description_selector)?.unwrap_or_default();
    let requirements = select_all_texts(&document, &site.requirements_selector)?
        .into_iter()
        .filter(|r| r.chars().count() > MIN_REQUIREMENT_CHARS)
        .take(MAX_REQUIREMENTS)
        .collect();
    let posting_date = match &site.posting_date_selector {
        Some(css) => select_first_text(&document, css)?,
        None => None,
    };
    Ok(DetailFields {
        location,
        description,
        requirements,
        posting_date,
    })
}

pub fn posthog_site() -> CareersSite {
    CareersSite::new(
        "posthog",
        "https://posthog.com",
        &["https://posthog.com/careers"],
        "/careers/",
    )
}

pub fn kraken_site() -> CareersSite {
    CareersSite {
        posting_date_selector: Some(r#"[class*="posted"], [class*="date"], time"#.to_string()),
        ..CareersSite::new(
            "kraken",
            "https://jobs.ashbyhq.com",
            &["https://jobs.ashbyhq.com/kraken.com?departmentId=5f67bd79-103b-4ac1-8d79-952b45ea47c9&employmentType=FullTime&locationId=0ae979f7-78d9-4e42-8cf1-831610586017"],
            "/kraken.com/",
        )
    }
}

pub fn coinbase_site() -> CareersSite {
    CareersSite::new(
        "coinbase",
        "https://www.coinbase.com",
        &[
            "https://www.coinbase.com/careers/positions?department=Engineering&location=remote",
            "https://www.coinbase.com/careers/positions?department=Engineering+-+Backend&location=remote",
            "https://www.coinbase.com/careers/positions?department=Engineering+-+Frontend&location=remote",
        ],
        "/careers/position",
    )
}

pub fn railway_site() -> CareersSite {
    CareersSite::new(
        "railway",
        "https://railway.com",
        &["https://railway.com/careers"],
        "/careers/",
    )
}

pub fn airbnb_site() -> CareersSite {
    CareersSite {
        description_selector: r#"main, article, [class*="description"], [class*="content"]"#.to_string(),
        ..CareersSite::new(
            "airbnb",
            "https://careers.airbnb.com",
            &["https://careers.airbnb.com/positions/?_departments=engineering"],
            "/positions/",
        )
    }
}

pub fn careers_site(source_id: &str) -> Option<CareersSite> {
    match source_id {
        "posthog" => Some(posthog_site()),
        "kraken" => Some(kraken_site()),
        "coinbase" => Some(coinbase_site()),
        "railway" => Some(railway_site()),
        "airbnb" => Some(airbnb_site()),
        _ => None,
    }
}

/// Static registry: source name to adapter constructor.
pub fn adapter_for_source(source_id: &str, http: Arc<HttpFetcher>) -> Option<Arc<dyn SourceAdapter>> {
    let site = careers_site(source_id)?;
    Some(Arc::new(HtmlCareersAdapter::new(site, http)))
}
