//! Source scrapers: page sources (live HTTP or saved fixtures) plus the
//! LinkedIn and TopJobs HTML parsers that turn pages into raw listings.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use jobsync_core::{derive_stable_id, RawListing, SourceKind, LISTING_ID_KEY};
use jobsync_store::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "jobsync-adapters";

pub const DEFAULT_MAX_LISTINGS: usize = 1000;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("source `{0}` has no pages configured")]
    NoPages(String),
}

/// One scrapeable job board.
#[async_trait]
pub trait SourceScraper: Send + Sync {
    fn source(&self) -> SourceKind;

    async fn scrape(&self) -> Result<Vec<RawListing>, ScrapeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeOptions {
    pub max_listings: usize,
    pub fetch_details: bool,
    pub max_detail_pages: usize,
}

impl Default for ScrapeOptions {
    fn default() -> Self {
        Self {
            max_listings: DEFAULT_MAX_LISTINGS,
            fetch_details: false,
            max_detail_pages: 25,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    pub location: String,
    pub body: String,
}

/// Where listing and detail HTML comes from.
#[derive(Debug, Clone)]
pub enum PageSource {
    Live {
        fetcher: Arc<HttpFetcher>,
        listing_urls: Vec<String>,
    },
    /// Saved pages; detail pages are looked up as `<detail_dir>/<stable id>.html`.
    Fixture {
        listing_paths: Vec<PathBuf>,
        detail_dir: Option<PathBuf>,
    },
}

async fn read_fixture(path: &PathBuf) -> Result<String, ScrapeError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ScrapeError::Fixture {
            path: path.clone(),
            source,
        })
}

impl PageSource {
    pub async fn listing_pages(&self, source_id: &str) -> Result<Vec<Page>, ScrapeError> {
        let mut pages = Vec::new();
        match self {
            PageSource::Live {
                fetcher,
                listing_urls,
            } => {
                for url in listing_urls {
                    let resp = fetcher.fetch_text(source_id, url).await?;
                    pages.push(Page {
                        location: resp.final_url,
                        body: resp.body,
                    });
                }
            }
            PageSource::Fixture { listing_paths, .. } => {
                for path in listing_paths {
                    pages.push(Page {
                        location: path.display().to_string(),
                        body: read_fixture(path).await?,
                    });
                }
            }
        }
        if pages.is_empty() {
            return Err(ScrapeError::NoPages(source_id.to_string()));
        }
        Ok(pages)
    }

    /// `Ok(None)` when no detail page exists for the listing.
    pub async fn detail_page(
        &self,
        source_id: &str,
        url: &str,
        listing_id: &str,
    ) -> Result<Option<String>, ScrapeError> {
        match self {
            PageSource::Live { fetcher, .. } => {
                if url.is_empty() {
                    return Ok(None);
                }
                Ok(Some(fetcher.fetch_text(source_id, url).await?.body))
            }
            PageSource::Fixture { detail_dir, .. } => {
                let Some(dir) = detail_dir else {
                    return Ok(None);
                };
                let stable_id = derive_stable_id(&SourceKind::parse(source_id), listing_id);
                let path = dir.join(format!("{stable_id}.html"));
                if !path.exists() {
                    return Ok(None);
                }
                read_fixture(&path).await.map(Some)
            }
        }
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn clean_text(raw: &str) -> Option<String> {
    let joined = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

fn element_text(el: ElementRef<'_>) -> Option<String> {
    clean_text(&el.text().collect::<String>())
}

fn select_first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope.select(sel).next().and_then(element_text)
}

fn select_all_texts(scope: ElementRef<'_>, sel: &Selector) -> Vec<String> {
    scope.select(sel).filter_map(element_text).collect()
}

fn select_first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(clean_text)
}

fn set_opt(listing: &mut RawListing, key: &str, value: Option<String>) {
    if let Some(value) = value {
        listing.set(key, value);
    }
}

/// Drops repeated native ids (first sighting wins) and caps the batch.
pub fn dedup_and_cap(listings: Vec<RawListing>, id_key: &str, max: usize) -> Vec<RawListing> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for listing in listings {
        if out.len() >= max {
            break;
        }
        match listing.get_str(id_key) {
            Some(id) if !seen.insert(id.clone()) => {
                debug!(listing_id = %id, "dropping repeated listing");
            }
            _ => out.push(listing),
        }
    }
    out
}

struct LinkedInListingSelectors {
    card: Selector,
    title: Selector,
    company_link: Selector,
    company: Selector,
    location: Selector,
    posted: Selector,
    link: Selector,
}

impl LinkedInListingSelectors {
    fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            card: selector("div.base-card")?,
            title: selector("h3.base-search-card__title")?,
            company_link: selector("h4.base-search-card__subtitle a")?,
            company: selector("h4.base-search-card__subtitle")?,
            location: selector("span.job-search-card__location")?,
            posted: selector("time.job-search-card__listdate")?,
            link: selector("a.base-card__full-link")?,
        })
    }
}

/// Parses a LinkedIn public job-search page. Cards without an entity URN are skipped.
pub fn parse_linkedin_listing(html: &str) -> Result<Vec<RawListing>, AdapterError> {
    let sels = LinkedInListingSelectors::new()?;
    let document = Html::parse_document(html);
    let mut listings = Vec::new();
    for card in document.select(&sels.card) {
        let Some(urn) = card.value().attr("data-entity-urn").and_then(clean_text) else {
            debug!("skipping card without entity urn");
            continue;
        };
        let mut listing = RawListing::new(SourceKind::LinkedIn).with_field(LISTING_ID_KEY, urn);
        set_opt(&mut listing, "title", select_first_text(card, &sels.title));
        set_opt(
            &mut listing,
            "company",
            select_first_text(card, &sels.company_link)
                .or_else(|| select_first_text(card, &sels.company)),
        );
        set_opt(&mut listing, "location", select_first_text(card, &sels.location));
        set_opt(&mut listing, "posted_date", select_first_text(card, &sels.posted));
        set_opt(&mut listing, "job_url", select_first_attr(card, &sels.link, "href"));
        listings.push(listing);
    }
    Ok(listings)
}

/// Enrichment read from a single LinkedIn job page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobDetail {
    pub description: Option<String>,
    pub seniority: Option<String>,
    pub employment_type: Option<String>,
    pub job_function: Option<String>,
    pub industries: Option<String>,
    pub skills: Vec<String>,
}

impl JobDetail {
    pub fn apply_to(self, listing: &mut RawListing) {
        set_opt(listing, "description", self.description);
        set_opt(listing, "seniority", self.seniority);
        set_opt(listing, "employment_type", self.employment_type);
        set_opt(listing, "job_function", self.job_function);
        set_opt(listing, "industries", self.industries);
        if !self.skills.is_empty() {
            listing.set(
                "skills",
                JsonValue::Array(self.skills.into_iter().map(JsonValue::String).collect()),
            );
        }
    }
}

pub fn parse_linkedin_detail(html: &str) -> Result<JobDetail, AdapterError> {
    let description = selector(".description__text")?;
    let criteria = selector(".description__job-criteria-text")?;
    let skills = selector(".skill-pill")?;
    let document = Html::parse_document(html);
    let root = document.root_element();

    let mut criteria = select_all_texts(root, &criteria).into_iter();
    Ok(JobDetail {
        description: select_first_text(root, &description),
        seniority: criteria.next(),
        employment_type: criteria.next(),
        job_function: criteria.next(),
        industries: criteria.next(),
        skills: select_all_texts(root, &skills),
    })
}

/// Parses the TopJobs vacancy table (`tr[id^='tr']` rows, seven cells each).
pub fn parse_topjobs_listing(html: &str) -> Result<Vec<RawListing>, AdapterError> {
    let row_sel = selector("tr[id^='tr']")?;
    let title_sel = selector("h2 span")?;
    let company_sel = selector("h1")?;
    let jc_sel = selector("span[id^='hdnJC']")?;
    let ec_sel = selector("span[id^='hdnEC']")?;
    let document = Html::parse_document(html);

    let mut listings = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<ElementRef<'_>> = row
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|el| el.value().name() == "td")
            .collect();
        if cells.len() < 7 {
            debug!(cells = cells.len(), "skipping short vacancy row");
            continue;
        }
        let mut listing = RawListing::new(SourceKind::TopJobs);
        set_opt(&mut listing, "listing_number", element_text(cells[0]));
        set_opt(&mut listing, "vacancy_number", element_text(cells[1]));
        set_opt(&mut listing, "job_title", select_first_text(cells[2], &title_sel));
        set_opt(&mut listing, "company", select_first_text(cells[2], &company_sel));
        set_opt(&mut listing, "description", element_text(cells[3]));
        set_opt(&mut listing, "opening_date", element_text(cells[4]));
        set_opt(&mut listing, "closing_date", element_text(cells[5]));
        set_opt(&mut listing, "location", element_text(cells[6]));
        set_opt(&mut listing, "hidden_jc", select_first_text(row, &jc_sel));
        set_opt(&mut listing, "hidden_ec", select_first_text(row, &ec_sel));
        set_opt(&mut listing, "onclick", row.value().attr("onclick").and_then(clean_text));
        listings.push(listing);
    }
    Ok(listings)
}

pub struct LinkedInScraper {
    pages: PageSource,
    options: ScrapeOptions,
}

impl LinkedInScraper {
    pub fn new(pages: PageSource, options: ScrapeOptions) -> Self {
        Self { pages, options }
    }

    async fn enrich(&self, listings: &mut [RawListing]) {
        let source_id = SourceKind::LinkedIn.to_string();
        let mut enriched = 0usize;
        for listing in listings.iter_mut().take(self.options.max_detail_pages) {
            let listing_id = listing.get_str(LISTING_ID_KEY).unwrap_or_default();
            let url = listing.get_str("job_url").unwrap_or_default();
            let body = match self.pages.detail_page(&source_id, &url, &listing_id).await {
                Ok(Some(body)) => body,
                Ok(None) => continue,
                Err(err) => {
                    warn!(listing_id = %listing_id, error = %err, "detail page unavailable");
                    continue;
                }
            };
            match parse_linkedin_detail(&body) {
                Ok(detail) => {
                    detail.apply_to(listing);
                    enriched += 1;
                }
                Err(err) => warn!(listing_id = %listing_id, error = %err, "detail page unparseable"),
            }
        }
        info!(enriched, "linkedin detail enrichment complete");
    }
}

#[async_trait]
impl SourceScraper for LinkedInScraper {
    fn source(&self) -> SourceKind {
        SourceKind::LinkedIn
    }

    async fn scrape(&self) -> Result<Vec<RawListing>, ScrapeError> {
        let pages = self.pages.listing_pages(SourceKind::LinkedIn.as_str()).await?;
        let mut listings = Vec::new();
        for page in &pages {
            let parsed = parse_linkedin_listing(&page.body)?;
            debug!(page = %page.location, cards = parsed.len(), "parsed listing page");
            listings.extend(parsed);
        }
        let mut listings = dedup_and_cap(listings, LISTING_ID_KEY, self.options.max_listings);
        if self.options.fetch_details {
            self.enrich(&mut listings).await;
        }
        Ok(listings)
    }
}

pub struct TopJobsScraper {
    pages: PageSource,
    options: ScrapeOptions,
}

impl TopJobsScraper {
    pub fn new(pages: PageSource, options: ScrapeOptions) -> Self {
        Self { pages, options }
    }
}

#[async_trait]
impl SourceScraper for TopJobsScraper {
    fn source(&self) -> SourceKind {
        SourceKind::TopJobs
    }

    async fn scrape(&self) -> Result<Vec<RawListing>, ScrapeError> {
        let pages = self.pages.listing_pages(SourceKind::TopJobs.as_str()).await?;
        let mut listings = Vec::new();
        for page in &pages {
            listings.extend(parse_topjobs_listing(&page.body)?);
        }
        Ok(dedup_and_cap(listings, "vacancy_number", self.options.max_listings))
    }
}

pub fn scraper_for_source(
    source_id: &str,
    pages: PageSource,
    options: ScrapeOptions,
) -> Option<Box<dyn SourceScraper>> {
    match SourceKind::parse(source_id) {
        SourceKind::LinkedIn => Some(Box::new(LinkedInScraper::new(pages, options))),
        SourceKind::TopJobs => Some(Box::new(TopJobsScraper::new(pages, options))),
        SourceKind::Other(_) => None,
    }
}
