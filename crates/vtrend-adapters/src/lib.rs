//! Per-board extraction of posting titles from archived listing markup.

use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;
use vtrend_core::SiteKind;

pub const CRATE_NAME: &str = "vtrend-adapters";

/// Class signature of a LinkedIn public job-search card.
pub const LINKEDIN_CARD_CLASSES: [&str; 9] = [
    "base-card",
    "relative",
    "w-full",
    "hover:no-underline",
    "focus:no-underline",
    "base-card--link",
    "base-search-card",
    "base-search-card--link",
    "job-search-card",
];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
    #[error("{0}")]
    Message(String),
}

pub trait SiteAdapter: Send + Sync {
    fn site_kind(&self) -> SiteKind;

    /// Ordered posting titles found in `markup`. Postings missing their title are skipped.
    fn extract(&self, markup: &str, day: NaiveDate) -> Result<Vec<String>, AdapterError>;
}

fn parse_selector(selector: &'static str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector,
        message: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn log_extraction(kind: SiteKind, day: NaiveDate, items: usize, titles: usize) {
    if items != titles {
        debug!(site_kind = %kind, %day, items, titles, "skipped postings without a title");
    }
}

/// work.ua: every posting is an unclassed `h2` whose anchor carries the title.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkUaAdapter;

impl SiteAdapter for WorkUaAdapter {
    fn site_kind(&self) -> SiteKind {
        SiteKind::WorkUa
    }

    fn extract(&self, markup: &str, day: NaiveDate) -> Result<Vec<String>, AdapterError> {
        let heading = parse_selector("h2")?;
        let anchor = parse_selector("a")?;
        let document = Html::parse_document(markup);

        let items = document
            .select(&heading)
            .filter(|h2| {
                h2.value()
                    .attr("class")
                    .map_or(true, |class| class.trim().is_empty())
            })
            .collect::<Vec<_>>();
        let titles = items
            .iter()
            .filter_map(|h2| h2.select(&anchor).next())
            .filter_map(element_text)
            .collect::<Vec<_>>();

        log_extraction(self.site_kind(), day, items.len(), titles.len());
        Ok(titles)
    }
}

/// djinni.co switched from `li.list-jobs__item` to `div.job-list-item` on `layout_change`.
#[derive(Debug, Clone, Copy)]
pub struct DjinniAdapter {
    layout_change: NaiveDate,
}

impl DjinniAdapter {
    pub fn new(layout_change: NaiveDate) -> Self {
        Self { layout_change }
    }

    pub fn layout_change(&self) -> NaiveDate {
        self.layout_change
    }

    pub fn item_selector(&self, day: NaiveDate) -> &'static str {
        if day >= self.layout_change {
            "div.job-list-item"
        } else {
            "li.list-jobs__item"
        }
    }
}

impl Default for DjinniAdapter {
    fn default() -> Self {
        Self::new(NaiveDate::from_ymd_opt(2023, 8, 17).expect("valid calendar date"))
    }
}

impl SiteAdapter for DjinniAdapter {
    fn site_kind(&self) -> SiteKind {
        SiteKind::Djinni
    }

    fn extract(&self, markup: &str, day: NaiveDate) -> Result<Vec<String>, AdapterError> {
        let item = parse_selector(self.item_selector(day))?;
        let document = Html::parse_document(markup);

        let mut items = 0usize;
        let titles = document
            .select(&item)
            .inspect(|_| items += 1)
            .filter_map(element_text)
            .collect::<Vec<_>>();

        log_extraction(self.site_kind(), day, items, titles.len());
        Ok(titles)
    }
}

/// linkedin.com: job cards carry [`LINKEDIN_CARD_CLASSES`]; the title sits in an `h3`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkedInAdapter;

impl LinkedInAdapter {
    fn is_job_card(element: &ElementRef<'_>) -> bool {
        let classes = element.value().classes().collect::<Vec<_>>();
        LINKEDIN_CARD_CLASSES
            .iter()
            .all(|required| classes.contains(required))
    }
}

impl SiteAdapter for LinkedInAdapter {
    fn site_kind(&self) -> SiteKind {
        SiteKind::LinkedIn
    }

    fn extract(&self, markup: &str, day: NaiveDate) -> Result<Vec<String>, AdapterError> {
        let card = parse_selector("div.job-search-card")?;
        let title = parse_selector("h3.base-search-card__title")?;
        let document = Html::parse_document(markup);

        let cards = document
            .select(&card)
            .filter(Self::is_job_card)
            .collect::<Vec<_>>();
        let titles = cards
            .iter()
            .filter_map(|c| c.select(&title).next())
            .filter_map(element_text)
            .collect::<Vec<_>>();

        log_extraction(self.site_kind(), day, cards.len(), titles.len());
        Ok(titles)
    }
}

pub fn adapter_for_site(kind: SiteKind) -> Box<dyn SiteAdapter> {
    match kind {
        SiteKind::WorkUa => Box::new(WorkUaAdapter),
        SiteKind::Djinni => Box::new(DjinniAdapter::default()),
        SiteKind::LinkedIn => Box::new(LinkedInAdapter),
    }
}
