//! Core domain model for reconstructing vacancy keyword trends from archived job boards.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "vtrend-core";

/// Job boards with a known extraction rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SiteKind {
    /// work.ua: `h2` items, title in the nested anchor.
    WorkUa,
    /// djinni.co: list layout changed on 2023-08-17.
    Djinni,
    /// linkedin.com public job search cards.
    LinkedIn,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported site: {url}")]
pub struct UnsupportedSite {
    pub url: String,
}

impl SiteKind {
    pub const ALL: [SiteKind; 3] = [SiteKind::WorkUa, SiteKind::Djinni, SiteKind::LinkedIn];

    /// Resolve the board variant from a configured site URL.
    pub fn resolve(url: &str) -> Result<Self, UnsupportedSite> {
        let host = host_of(url).to_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| host.contains(kind.host_marker()))
            .ok_or_else(|| UnsupportedSite {
                url: url.to_string(),
            })
    }

    pub fn host_marker(&self) -> &'static str {
        match self {
            SiteKind::WorkUa => "work.ua",
            SiteKind::Djinni => "djinni.co",
            SiteKind::LinkedIn => "linkedin.com",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SiteKind::WorkUa => "work-ua",
            SiteKind::Djinni => "djinni",
            SiteKind::LinkedIn => "linkedin",
        }
    }
}

impl fmt::Display for SiteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    rest.split(['/', '?', '#']).next().unwrap_or(rest)
}

/// Registrable-ish domain used for chart legends (`www.linkedin.com/...` -> `linkedin.com`).
pub fn site_label(url: &str) -> String {
    let host = host_of(url).to_lowercase();
    let host = host.split(':').next().unwrap_or_default();
    host.strip_prefix("www.").unwrap_or(host).to_string()
}

/// One archived capture to retrieve: a site URL on a calendar day.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub url: String,
    pub day: NaiveDate,
}

impl SnapshotRequest {
    pub fn new(url: impl Into<String>, day: NaiveDate) -> Self {
        Self {
            url: url.into(),
            day,
        }
    }

    /// Archive timestamp for the day, `YYYYMMDD`.
    pub fn timestamp(&self) -> String {
        self.day.format("%Y%m%d").to_string()
    }
}

/// Whitespace-collapsed, lowercased title used for matching and deduplication.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Distinct normalized titles containing `keyword`, case-insensitively.
///
/// The keyword goes through the same normalization as titles. Plain substring containment:
/// `"QA"` matches `"QAware"`.
pub fn match_keyword(postings: &[String], keyword: &str) -> BTreeSet<String> {
    let needle = normalize_title(keyword);
    postings
        .iter()
        .map(|p| normalize_title(p))
        .filter(|title| !title.is_empty() && title.contains(&needle))
        .collect()
}

pub fn percentage(quantity: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        quantity as f64 / denominator as f64 * 100.0
    }
}

/// Per-(site, day) aggregation unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRecord {
    pub site: String,
    pub day: NaiveDate,
    /// False when no usable snapshot existed for the day.
    pub observed: bool,
    pub total_postings_on_page: usize,
    /// Sum of per-keyword distinct counts; a posting matching two keywords counts twice.
    pub total_matched_across_keywords: usize,
    pub keyword_counts: BTreeMap<String, usize>,
}

impl DayRecord {
    pub fn accumulate(
        site: &str,
        day: NaiveDate,
        postings: &[String],
        keywords: &[String],
    ) -> Self {
        let keyword_counts: BTreeMap<String, usize> = keywords
            .iter()
            .map(|k| (k.clone(), match_keyword(postings, k).len()))
            .collect();
        let total_matched_across_keywords = keyword_counts.values().sum();
        Self {
            site: site.to_string(),
            day,
            observed: true,
            total_postings_on_page: postings.len(),
            total_matched_across_keywords,
            keyword_counts,
        }
    }

    /// Record for a day without data (missing snapshot, archive outage, broken markup).
    pub fn unobserved(site: &str, day: NaiveDate) -> Self {
        Self {
            site: site.to_string(),
            day,
            observed: false,
            total_postings_on_page: 0,
            total_matched_across_keywords: 0,
            keyword_counts: BTreeMap::new(),
        }
    }

    pub fn percentage_for(&self, keyword: &str) -> f64 {
        let quantity = self.keyword_counts.get(keyword).copied().unwrap_or(0);
        percentage(quantity, self.total_matched_across_keywords)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentageEntry {
    pub day: NaiveDate,
    pub percentage: f64,
    pub quantity: usize,
    pub total_matched_across_keywords: usize,
    /// Cumulative `total_matched_across_keywords` for the site up to and including `day`.
    pub running_total: usize,
}

/// Final nested structure handed to reporting: site -> keyword -> entries by day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub percentages: BTreeMap<String, BTreeMap<String, Vec<PercentageEntry>>>,
    pub total_postings_all: BTreeMap<String, BTreeMap<NaiveDate, usize>>,
    pub total_matched_across_keywords: BTreeMap<String, BTreeMap<NaiveDate, usize>>,
}

impl AggregateResult {
    pub fn sites(&self) -> impl Iterator<Item = &str> {
        self.total_postings_all.keys().map(String::as_str)
    }

    pub fn entries(&self, site: &str, keyword: &str) -> &[PercentageEntry] {
        self.percentages
            .get(site)
            .and_then(|by_keyword| by_keyword.get(keyword))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.total_postings_all.values().all(BTreeMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn titles(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn resolves_known_boards_and_rejects_others() {
        assert_eq!(SiteKind::resolve("https://work.ua/jobs-it/"), Ok(SiteKind::WorkUa));
        assert_eq!(SiteKind::resolve("https://djinni.co/jobs/"), Ok(SiteKind::Djinni));
        assert_eq!(
            SiteKind::resolve("https://www.linkedin.com/jobs/search/?keywords=rust"),
            Ok(SiteKind::LinkedIn)
        );
        let err = SiteKind::resolve("https://example.com/jobs").unwrap_err();
        assert_eq!(err.url, "https://example.com/jobs");
    }

    #[test]
    fn resolution_looks_at_host_only() {
        assert!(SiteKind::resolve("https://example.com/?ref=djinni.co").is_err());
    }

    #[test]
    fn site_label_strips_scheme_and_www() {
        assert_eq!(site_label("https://www.linkedin.com/jobs/search/"), "linkedin.com");
        assert_eq!(site_label("https://djinni.co/jobs/"), "djinni.co");
        assert_eq!(site_label("work.ua:443/jobs-it/"), "work.ua");
    }

    #[test]
    fn snapshot_timestamp_is_compact_date() {
        let req = SnapshotRequest::new("https://djinni.co/jobs/", day(2023, 3, 7));
        assert_eq!(req.timestamp(), "20230307");
    }

    #[test]
    fn matcher_is_substring_and_case_insensitive() {
        let postings = titles(&["QAware Tester", "Manual QA", "Developer"]);
        let matched = match_keyword(&postings, "qa");
        assert_eq!(
            matched.into_iter().collect::<Vec<_>>(),
            vec!["manual qa".to_string(), "qaware tester".to_string()]
        );
    }

    #[test]
    fn matcher_dedupes_by_normalized_title() {
        let postings = titles(&["Senior  Developer", "senior developer", " SENIOR DEVELOPER "]);
        assert_eq!(match_keyword(&postings, "Senior").len(), 1);
    }

    #[test]
    fn matcher_normalizes_keyword_whitespace() {
        let postings = titles(&["Senior  Developer", "Senior Developer Advocate", "Developer"]);
        assert_eq!(match_keyword(&postings, "Senior  Developer").len(), 2);
        assert_eq!(match_keyword(&postings, "  senior\tdeveloper ").len(), 2);
        assert!(match_keyword(&postings, "Senior Dev Rel").is_empty());
    }

    #[test]
    fn matcher_handles_cyrillic_case() {
        let postings = titles(&["Старший розробник", "старший аналітик"]);
        assert_eq!(match_keyword(&postings, "СТАРШИЙ").len(), 2);
    }

    #[test]
    fn board_a_scenario_splits_fifty_fifty() {
        let postings = titles(&["Senior Developer", "Junior QA Engineer", "senior developer"]);
        let keywords = titles(&["Senior", "Junior"]);
        let record = DayRecord::accumulate(
            "https://work.ua/jobs-it/",
            day(2023, 1, 1),
            &postings,
            &keywords,
        );

        assert_eq!(record.keyword_counts["Senior"], 1);
        assert_eq!(record.keyword_counts["Junior"], 1);
        assert_eq!(record.total_matched_across_keywords, 2);
        assert_eq!(record.total_postings_on_page, 3);
        assert_eq!(record.percentage_for("Senior"), 50.0);
        assert_eq!(record.percentage_for("Junior"), 50.0);
    }

    #[test]
    fn multi_keyword_postings_are_double_counted() {
        let postings = titles(&["Senior Lead Developer", "Lead Recruiter"]);
        let keywords = titles(&["Senior", "Lead"]);
        let record = DayRecord::accumulate("s", day(2023, 1, 1), &postings, &keywords);
        assert_eq!(record.total_matched_across_keywords, 3);
        let sum: usize = record.keyword_counts.values().sum();
        assert_eq!(sum, record.total_matched_across_keywords);
        let pct_sum = record.percentage_for("Senior") + record.percentage_for("Lead");
        assert!((pct_sum - 100.0).abs() < 1e-9);
    }

    #[test]
    fn zero_postings_give_zero_percentages() {
        let keywords = titles(&["Senior", "Junior"]);
        let record = DayRecord::accumulate("s", day(2023, 1, 1), &[], &keywords);
        assert_eq!(record.total_matched_across_keywords, 0);
        for k in &keywords {
            let pct = record.percentage_for(k);
            assert_eq!(pct, 0.0);
            assert!(!pct.is_nan());
        }
    }

    #[test]
    fn unobserved_record_is_empty() {
        let record = DayRecord::unobserved("s", day(2023, 1, 2));
        assert!(!record.observed);
        assert!(record.keyword_counts.is_empty());
        assert_eq!(record.total_postings_on_page, 0);
    }

    #[test]
    fn aggregate_result_serializes_dates_as_keys() {
        let mut result = AggregateResult::default();
        result
            .total_postings_all
            .entry("https://djinni.co/jobs/".into())
            .or_default()
            .insert(day(2023, 8, 17), 12);
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"2023-08-17\":12"));
        let back: AggregateResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, result);
    }
}
