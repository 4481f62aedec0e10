use std::path::{Path, PathBuf};

use jobsync_adapters::{scraper_for_source, PageSource, ScrapeError, ScrapeOptions};
use jobsync_core::{derive_stable_id, normalize_batch, SourceKind};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn sample(source_id: &str) -> PathBuf {
    workspace_root().join("fixtures").join(source_id).join("sample")
}

fn fixture_pages(source_id: &str, with_details: bool) -> PageSource {
    let dir = sample(source_id);
    PageSource::Fixture {
        listing_paths: vec![dir.join("listing.html")],
        detail_dir: with_details.then(|| dir.join("details")),
    }
}

#[tokio::test]
async fn linkedin_fixture_yields_unique_cards() {
    let scraper =
        scraper_for_source("linkedin", fixture_pages("linkedin", false), ScrapeOptions::default())
            .expect("linkedin scraper");
    let raws = scraper.scrape().await.expect("scrape");
    assert_eq!(raws.len(), 2, "repeated urn and urn-less card are dropped");

    let batch = normalize_batch(&raws);
    assert_eq!(batch.malformed, 0);
    let ids: Vec<u64> = batch.jobs.iter().map(|j| j.stable_id).collect();
    assert_eq!(ids, vec![4012345678, 4012345679]);

    let first = &batch.jobs[0];
    assert_eq!(first.source, SourceKind::LinkedIn);
    assert_eq!(first.title, "Senior Rust Engineer");
    assert_eq!(first.company, "Acme");
    assert_eq!(first.location, "Colombo, Western Province, Sri Lanka");
    assert_eq!(first.posted_date, "2 days ago");
    assert!(first.description.is_none());

    // "--new" cards carry a different time class
    assert_eq!(batch.jobs[1].posted_date, "");
}

#[tokio::test]
async fn linkedin_details_enrich_matching_listing() {
    let options = ScrapeOptions {
        fetch_details: true,
        ..ScrapeOptions::default()
    };
    let scraper = scraper_for_source("linkedin", fixture_pages("linkedin", true), options).unwrap();
    let batch = normalize_batch(&scraper.scrape().await.unwrap());

    let enriched = &batch.jobs[0];
    assert!(enriched
        .description
        .as_deref()
        .unwrap()
        .starts_with("Acme is hiring a Senior Rust Engineer"));
    assert_eq!(enriched.job_type.as_deref(), Some("Full-time"));
    assert_eq!(
        enriched.skills.as_deref(),
        Some(&["Rust".to_string(), "Tokio".to_string(), "PostgreSQL".to_string()][..])
    );

    let plain = &batch.jobs[1];
    assert!(plain.description.is_none());
    assert!(plain.skills.is_none());
}

#[tokio::test]
async fn listing_cap_applies_after_dedup() {
    let options = ScrapeOptions {
        max_listings: 1,
        ..ScrapeOptions::default()
    };
    let scraper = scraper_for_source("linkedin", fixture_pages("linkedin", false), options).unwrap();
    assert_eq!(scraper.scrape().await.unwrap().len(), 1);
}

#[tokio::test]
async fn topjobs_fixture_normalizes_vacancy_numbers() {
    let scraper =
        scraper_for_source("topjobs", fixture_pages("topjobs", false), ScrapeOptions::default())
            .unwrap();
    let batch = normalize_batch(&scraper.scrape().await.unwrap());
    assert_eq!(batch.jobs.len(), 3);

    let first = &batch.jobs[0];
    assert_eq!(first.stable_id, derive_stable_id(&SourceKind::TopJobs, "0000933455"));
    assert_eq!(first.listing_id, "0000933455");
    assert_eq!(first.title, "Software Engineer - Java");
    assert_eq!(first.company, "Virtusa (Pvt) Ltd");
    assert_eq!(first.posted_date, "Fri Oct 16 2026");

    let intern = &batch.jobs[2];
    assert_eq!(intern.company, "IFS R&D International");
    assert!(intern.description.is_none(), "placeholder description is dropped");
}

#[tokio::test]
async fn missing_fixture_is_a_source_error() {
    let tmp = tempfile::tempdir().unwrap();
    let pages = PageSource::Fixture {
        listing_paths: vec![tmp.path().join("absent.html")],
        detail_dir: None,
    };
    let scraper = scraper_for_source("topjobs", pages, ScrapeOptions::default()).unwrap();
    assert!(matches!(
        scraper.scrape().await,
        Err(ScrapeError::Fixture { .. })
    ));
}

#[tokio::test]
async fn fixture_from_temp_dir_is_parsed() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("page.html");
    std::fs::write(
        &path,
        r#"<div class="base-card" data-entity-urn="urn:li:jobPosting:42"><h3 class="base-search-card__title">Dev</h3></div>"#,
    )
    .unwrap();
    let pages = PageSource::Fixture {
        listing_paths: vec![path],
        detail_dir: None,
    };
    let raws = scraper_for_source("linkedin", pages, ScrapeOptions::default())
        .unwrap()
        .scrape()
        .await
        .unwrap();
    assert_eq!(raws.len(), 1);
    assert_eq!(raws[0].get_str("title").as_deref(), Some("Dev"));
}
