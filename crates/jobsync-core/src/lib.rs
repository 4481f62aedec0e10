//! Core domain model for job postings: canonical `Job`, raw scraped listings,
//! and the listing normalizer that derives stable identifiers.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "jobsync-core";

/// Payload key holding the source-native listing identifier.
pub const LISTING_ID_KEY: &str = "listing_id";
/// Payload key holding the first-sight timestamp used for expiry.
pub const PROCESSED_TIMESTAMP_KEY: &str = "processed_timestamp";
pub const SOURCE_KEY: &str = "source";

/// Provenance of a listing. Known sources get their own variant; anything else
/// is carried verbatim so new scrapers can be registered without a core change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SourceKind {
    LinkedIn,
    TopJobs,
    Other(String),
}

impl SourceKind {
    pub fn as_str(&self) -> &str {
        match self {
            SourceKind::LinkedIn => "linkedin",
            SourceKind::TopJobs => "topjobs",
            SourceKind::Other(name) => name,
        }
    }

    pub fn parse(input: &str) -> Self {
        let slug = input.trim().to_ascii_lowercase();
        match slug.as_str() {
            "linkedin" => SourceKind::LinkedIn,
            "topjobs" => SourceKind::TopJobs,
            _ => SourceKind::Other(slug),
        }
    }
}

impl From<String> for SourceKind {
    fn from(value: String) -> Self {
        SourceKind::parse(&value)
    }
}

impl From<SourceKind> for String {
    fn from(value: SourceKind) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scraper output before normalization. The field names are whatever the
/// source's scraper emits; the normalizer owns the mapping onto `Job`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub source: SourceKind,
    pub fields: JsonMap<String, JsonValue>,
}

impl RawListing {
    pub fn new(source: SourceKind) -> Self {
        Self {
            source,
            fields: JsonMap::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<JsonValue>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<JsonValue>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.fields.get(key).and_then(json_to_text)
    }
}

/// Canonical persisted job posting. Serialized as the flat vector-store payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub stable_id: u64,
    pub source: SourceKind,
    pub listing_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    pub posted_date: String,
    pub job_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_timestamp: Option<DateTime<Utc>>,
}

impl Job {
    /// Text fed to the embedding model: `title company location`.
    pub fn embedding_text(&self) -> String {
        embedding_text(&self.title, &self.company, &self.location)
    }

    pub fn to_payload(&self) -> Result<JsonMap<String, JsonValue>, serde_json::Error> {
        match serde_json::to_value(self)? {
            JsonValue::Object(map) => Ok(map),
            other => Err(serde::ser::Error::custom(format!(
                "job serialized to non-object payload: {other}"
            ))),
        }
    }
}

/// Joins the non-empty parts with single spaces; all-empty input yields "".
pub fn embedding_text(title: &str, company: &str, location: &str) -> String {
    [title, company, location]
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rebuilds the embedding text from a stored payload, tolerating missing keys.
pub fn embedding_text_from_payload(payload: &JsonMap<String, JsonValue>) -> String {
    let field = |key: &str| payload_str(payload, key).unwrap_or_default();
    embedding_text(&field("title"), &field("company"), &field("location"))
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("{source_kind} record has no native listing identifier")]
    MissingNativeId { source_kind: SourceKind },
}

/// Derives the vector-store key for a listing from its source and native id.
///
/// LinkedIn URNs (`urn:li:jobPosting:1234567`) and bare LinkedIn numbers map
/// to their trailing numeric segment. Every other identifier, and every
/// identifier from any other source, maps to a 63-bit hash of
/// `<source>:<native id>`, so equal native ids on different boards never
/// share a key.
pub fn derive_stable_id(source: &SourceKind, native_id: &str) -> u64 {
    let native_id = native_id.trim();
    let linkedin_numeric = match source {
        SourceKind::LinkedIn => numeric_suffix(native_id),
        _ => None,
    };
    linkedin_numeric.unwrap_or_else(|| hash_native_id(&format!("{source}:{native_id}")))
}

fn numeric_suffix(native_id: &str) -> Option<u64> {
    let suffix = native_id.trim().rsplit(':').next()?.trim();
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// First 8 bytes of SHA-256, top bit cleared. For n distinct identifiers the
/// collision probability is roughly n^2 / 2^64.
pub fn hash_native_id(native_id: &str) -> u64 {
    let digest = Sha256::digest(native_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix) & (i64::MAX as u64)
}

/// Ordered raw-key candidates for each canonical field of one source.
#[derive(Debug, Clone, Copy)]
struct FieldMap {
    listing_id: &'static [&'static str],
    title: &'static [&'static str],
    company: &'static [&'static str],
    location: &'static [&'static str],
    job_type: &'static [&'static str],
    posted_date: &'static [&'static str],
    job_url: &'static [&'static str],
    description: &'static [&'static str],
    skills: &'static [&'static str],
}

const LINKEDIN_FIELDS: FieldMap = FieldMap {
    listing_id: &["listing_id", "entity_urn", "data-entity-urn"],
    title: &["title"],
    company: &["company"],
    location: &["location"],
    job_type: &["job_type", "employment_type"],
    posted_date: &["posted_date"],
    job_url: &["job_url"],
    description: &["description"],
    skills: &["skills"],
};

const TOPJOBS_FIELDS: FieldMap = FieldMap {
    listing_id: &["vacancy_number", "listing_id", "listing_number"],
    title: &["job_title", "title"],
    company: &["company"],
    location: &["location"],
    job_type: &["job_type"],
    posted_date: &["opening_date", "posted_date"],
    job_url: &["job_url"],
    description: &["description"],
    skills: &["skills"],
};

const GENERIC_FIELDS: FieldMap = FieldMap {
    listing_id: &["listing_id", "id"],
    title: &["title", "job_title"],
    company: &["company"],
    location: &["location"],
    job_type: &["job_type"],
    posted_date: &["posted_date"],
    job_url: &["job_url", "url"],
    description: &["description"],
    skills: &["skills"],
};

fn field_map_for(source: &SourceKind) -> &'static FieldMap {
    match source {
        SourceKind::LinkedIn => &LINKEDIN_FIELDS,
        SourceKind::TopJobs => &TOPJOBS_FIELDS,
        SourceKind::Other(_) => &GENERIC_FIELDS,
    }
}

/// Scraper placeholders that mean "not found" rather than real content.
const PLACEHOLDER_VALUES: &[&str] = &[
    "no title",
    "no company",
    "no location",
    "no date",
    "no url",
    "no description",
    "no skills listed",
    "not specified",
    "not available",
];

fn json_to_text(value: &JsonValue) -> Option<String> {
    let text = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Array(items) => items
            .iter()
            .filter_map(json_to_text)
            .collect::<Vec<_>>()
            .join(", "),
        JsonValue::Null | JsonValue::Object(_) => return None,
    };
    if text.is_empty() || PLACEHOLDER_VALUES.contains(&text.to_ascii_lowercase().as_str()) {
        None
    } else {
        Some(text)
    }
}

fn first_text(raw: &RawListing, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| raw.fields.get(*key).and_then(json_to_text))
}

fn first_list(raw: &RawListing, keys: &[&str]) -> Option<Vec<String>> {
    let value = keys.iter().find_map(|key| raw.fields.get(*key))?;
    let items: Vec<String> = match value {
        JsonValue::Array(items) => items.iter().filter_map(json_to_text).collect(),
        other => json_to_text(other)
            .map(|s| {
                s.split(',')
                    .map(|part| part.trim().to_string())
                    .filter(|part| !part.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
    };
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// Maps one raw scraped record onto the canonical `Job` shape.
///
/// Pure: no I/O, no embedding. Missing text fields become empty strings;
/// only a missing native identifier is an error.
pub fn normalize(raw: &RawListing) -> Result<Job, NormalizeError> {
    let map = field_map_for(&raw.source);
    let listing_id = first_text(raw, map.listing_id).ok_or_else(|| NormalizeError::MissingNativeId {
        source_kind: raw.source.clone(),
    })?;
    let text = |keys: &[&str]| first_text(raw, keys).unwrap_or_default();

    Ok(Job {
        stable_id: derive_stable_id(&raw.source, &listing_id),
        source: raw.source.clone(),
        title: text(map.title),
        company: text(map.company),
        location: text(map.location),
        job_type: first_text(raw, map.job_type),
        posted_date: text(map.posted_date),
        job_url: text(map.job_url),
        description: first_text(raw, map.description),
        skills: first_list(raw, map.skills),
        processed_timestamp: None,
        listing_id,
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub jobs: Vec<Job>,
    pub malformed: usize,
}

/// Normalizes a scrape batch, logging and skipping records without identity.
pub fn normalize_batch(raws: &[RawListing]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for (index, raw) in raws.iter().enumerate() {
        match normalize(raw) {
            Ok(job) => batch.jobs.push(job),
            Err(err) => {
                warn!(source = %raw.source, index, error = %err, "skipping malformed listing");
                batch.malformed += 1;
            }
        }
    }
    batch
}

pub fn payload_str(payload: &JsonMap<String, JsonValue>, key: &str) -> Option<String> {
    payload.get(key).and_then(json_to_text)
}

/// Source recorded on a stored payload. Payloads written before sources were
/// tracked came from LinkedIn.
pub fn payload_source(payload: &JsonMap<String, JsonValue>) -> SourceKind {
    payload_str(payload, SOURCE_KEY)
        .map(|s| SourceKind::parse(&s))
        .unwrap_or(SourceKind::LinkedIn)
}

/// Number of payload entries carrying real content.
pub fn payload_completeness(payload: &JsonMap<String, JsonValue>) -> usize {
    payload
        .values()
        .filter(|value| match value {
            JsonValue::Null => false,
            JsonValue::String(s) => !s.trim().is_empty(),
            JsonValue::Array(items) => !items.is_empty(),
            JsonValue::Object(map) => !map.is_empty(),
            JsonValue::Bool(_) | JsonValue::Number(_) => true,
        })
        .count()
}

/// Parses RFC 3339, falling back to naive ISO-8601 (read as UTC).
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(input, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn payload_timestamp(payload: &JsonMap<String, JsonValue>) -> Option<DateTime<Utc>> {
    payload
        .get(PROCESSED_TIMESTAMP_KEY)
        .and_then(JsonValue::as_str)
        .and_then(parse_timestamp)
}
