//! Core job record model and per-source scrape status types for GoApply.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "goapply-core";

/// Descriptions longer than this are truncated, never rejected.
pub const MAX_DESCRIPTION_CHARS: usize = 5000;
pub const MAX_REQUIREMENTS: usize = 15;
const MAX_SLUG_CHARS: usize = 50;

/// A normalized job posting. Immutable once built; a re-scrape produces a new record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub source: String,
    pub title: String,
    pub description: String,
    pub requirements: Vec<String>,
    pub location: String,
    #[serde(default)]
    pub posting_date: Option<String>,
    #[serde(default)]
    pub tech_stack: BTreeSet<String>,
    pub url: String,
    pub scraped_at: DateTime<Utc>,
}

/// Extracted fields handed over by an adapter before bounds are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFields {
    pub title: String,
    pub description: String,
    pub requirements: Vec<String>,
    pub location: String,
    pub url: String,
    pub posting_date: Option<String>,
}

impl Job {
    pub fn new(source: &str, fields: JobFields, scraped_at: DateTime<Utc>) -> Self {
        let JobFields {
            title,
            description,
            mut requirements,
            location,
            url,
            posting_date,
        } = fields;
        requirements.truncate(MAX_REQUIREMENTS);
        Self {
            id: job_id(source, &title),
            source: source.to_string(),
            description: truncate_chars(description.trim(), MAX_DESCRIPTION_CHARS),
            title,
            requirements,
            location,
            posting_date,
            tech_stack: BTreeSet::new(),
            url,
            scraped_at,
        }
    }

    pub fn with_tech_stack(self, tech_stack: BTreeSet<String>) -> Self {
        Self { tech_stack, ..self }
    }

    /// Text the tagger looks at: description followed by every requirement.
    pub fn tagging_text(&self) -> String {
        let mut text = self.description.clone();
        for req in &self.requirements {
            text.push(' ');
            text.push_str(req);
        }
        text
    }
}

/// Stable id `{source}_{slug(title)}_{hash8}`; same `(source, title)` always yields the same id.
pub fn job_id(source: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{source}_{title}").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}_{}_{}", source, slugify(title), &digest[..8])
}

pub fn slugify(title: &str) -> String {
    let mapped = title
        .chars()
        .flat_map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().collect::<Vec<_>>()
            } else {
                vec!['_']
            }
        })
        .collect::<String>();
    let collapsed = mapped
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    truncate_chars(&collapsed, MAX_SLUG_CHARS)
        .trim_end_matches('_')
        .to_string()
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Keeps the first occurrence of every job id, preserving order.
pub fn dedup_by_id(jobs: Vec<Job>) -> Vec<Job> {
    let mut seen = HashSet::with_capacity(jobs.len());
    jobs.into_iter()
        .filter(|job| seen.insert(job.id.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScrapeState {
    Success,
    Failed,
    #[default]
    Unknown,
}

impl fmt::Display for ScrapeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScrapeState::Success => "success",
            ScrapeState::Failed => "failed",
            ScrapeState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Outcome of the most recent run for one source. Always written whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatus {
    pub last_scraped: Option<DateTime<Utc>>,
    pub status: ScrapeState,
    pub job_count: usize,
    pub error: Option<String>,
}

impl SourceStatus {
    pub fn new(status: ScrapeState, job_count: usize, error: Option<String>) -> Self {
        Self {
            last_scraped: Some(Utc::now()),
            status,
            job_count,
            error,
        }
    }

    /// Reported for a source that has never been scraped (or whose status expired).
    pub fn unknown() -> Self {
        Self {
            last_scraped: None,
            status: ScrapeState::Unknown,
            job_count: 0,
            error: None,
        }
    }
}

/// Aggregate view over the cache, rebuilt wholesale by every completed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub total_count: usize,
    pub filtered_count: usize,
    pub cached_at: Option<DateTime<Utc>>,
    pub companies: BTreeMap<String, SourceStatus>,
}

impl Metadata {
    /// Zero value returned when nothing has been cached yet.
    pub fn empty() -> Self {
        Self {
            total_count: 0,
            filtered_count: 0,
            cached_at: None,
            companies: BTreeMap::new(),
        }
    }

    pub fn from_run(
        total_count: usize,
        cached_at: DateTime<Utc>,
        companies: BTreeMap<String, SourceStatus>,
    ) -> Self {
        Self {
            total_count,
            filtered_count: total_count,
            cached_at: Some(cached_at),
            companies,
        }
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap()
    }

    fn fields(title: &str) -> JobFields {
        JobFields {
            title: title.to_string(),
            description: "Build things".into(),
            requirements: vec![],
            location: "Remote".into(),
            url: "https://example.com/jobs/1".into(),
            posting_date: None,
        }
    }

    #[test]
    fn job_id_is_stable_and_formatted() {
        let a = job_id("kraken", "Senior Backend Engineer (Rust)");
        let b = job_id("kraken", "Senior Backend Engineer (Rust)");
        assert_eq!(a, b);
        assert!(a.starts_with("kraken_senior_backend_engineer_rust_"));
        let hash = a.rsplit('_').next().unwrap();
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn job_id_depends_on_source() {
        assert_ne!(job_id("kraken", "Engineer"), job_id("coinbase", "Engineer"));
    }

    #[test]
    fn slug_is_truncated_to_fifty_chars() {
        let slug = slugify(&"very long title ".repeat(10));
        assert!(slug.chars().count() <= 50);
        assert!(!slug.ends_with('_'));
    }

    #[test]
    fn description_and_requirements_are_bounded() {
        let mut f = fields("Engineer");
        f.description = "x".repeat(MAX_DESCRIPTION_CHARS + 100);
        f.requirements = (0..20).map(|i| format!("req {i}")).collect();
        let job = Job::new("railway", f, ts());
        assert_eq!(job.description.chars().count(), MAX_DESCRIPTION_CHARS);
        assert_eq!(job.requirements.len(), MAX_REQUIREMENTS);
        assert_eq!(job.requirements[0], "req 0");
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let first = Job::new("airbnb", fields("Engineer"), ts());
        let mut dup = first.clone();
        dup.url = "https://example.com/other".into();
        let other = Job::new("airbnb", fields("Designer"), ts());
        let out = dedup_by_id(vec![first.clone(), dup, other]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].url, first.url);
    }

    #[test]
    fn metadata_zero_value_serializes_with_empty_companies() {
        let json = serde_json::to_value(Metadata::empty()).unwrap();
        assert_eq!(json["total_count"], 0);
        assert_eq!(json["companies"], serde_json::json!({}));
        assert!(json["cached_at"].is_null());
    }

    #[test]
    fn scrape_state_uses_lowercase_names() {
        let status = SourceStatus::new(ScrapeState::Failed, 2, Some("timeout".into()));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(SourceStatus::unknown().status.to_string(), "unknown");
    }
}
